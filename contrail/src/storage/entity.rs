//! Entity storage.
//!
//! An [`Entity`] is a storable object that knows its own identifier, so it
//! can be stored, created and deleted without passing the identifier
//! separately. The metadata that describes revisions (root folder, revision
//! folders, locks, commit markers, journals) is made of entities kept in an
//! [`EntitySession`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::io::{RawStorage, StorageError};
use crate::storage::object::{EntityStorage, Lifecycle, ObjectSession, ObjectStore, Storable};
use crate::types::Identifier;

/// A storable object addressed by an identifier it carries.
pub trait Entity: Storable {
    /// The identifier this entity is stored under.
    fn id(&self) -> &Identifier;
}

/// Structural placeholder that makes an identifier exist so its children
/// can be listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub id: Identifier,
}

impl Folder {
    #[must_use]
    pub const fn new(id: Identifier) -> Self {
        Self { id }
    }
}

impl Lifecycle for Folder {}

impl Storable for Folder {
    const TYPE_TAG: &'static str = "contrail.folder";
}

impl Entity for Folder {
    fn id(&self) -> &Identifier {
        &self.id
    }
}

/// Entity storage over one raw backend.
#[derive(Debug, Clone)]
pub struct EntityStore {
    objects: ObjectStore,
}

impl EntityStore {
    /// Create an entity store caching at most `cache_capacity` objects.
    #[must_use]
    pub fn new(raw: Arc<dyn RawStorage>, cache_capacity: usize) -> Self {
        Self {
            objects: ObjectStore::new(raw, cache_capacity),
        }
    }

    /// Open a session.
    #[must_use]
    pub fn connect(&self) -> EntitySession {
        EntitySession {
            objects: self.objects.connect(),
        }
    }

    /// The underlying object store.
    #[must_use]
    pub const fn objects(&self) -> &ObjectStore {
        &self.objects
    }
}

/// A connection to an [`EntityStore`].
#[derive(Debug, Clone)]
pub struct EntitySession {
    objects: ObjectSession,
}

impl EntitySession {
    /// Create `entity` only if nothing is stored under its identifier,
    /// waiting up to `wait` for the current occupant to be deleted.
    ///
    /// Runs the insert hook when the create succeeds.
    pub fn create_entity<E: Entity>(&self, entity: &E, wait: Duration) -> Result<bool, StorageError> {
        if !self.objects.create_if_absent(entity.id(), entity, wait)? {
            return Ok(false);
        }
        entity.on_insert(self, entity.id())?;
        Ok(true)
    }

    /// Load an entity bypassing the identity cache.
    ///
    /// Used for objects other processes may replace behind this process's
    /// back, such as locks.
    pub fn fetch_fresh<T: Storable>(&self, id: &Identifier) -> Result<Option<T>, StorageError> {
        let Some(mut item) = self.objects.read_fresh::<T>(id)? else {
            return Ok(None);
        };
        item.on_load(self, id)?;
        Ok(Some(item))
    }

    /// Make sure a [`Folder`] exists at `id`.
    pub fn ensure_folder(&self, id: &Identifier) -> Result<(), StorageError> {
        self.objects
            .create_if_absent(id, &Folder::new(id.clone()), Duration::ZERO)
            .map(|_| ())
    }

    /// The underlying object session.
    #[must_use]
    pub const fn objects(&self) -> &ObjectSession {
        &self.objects
    }

    /// Flush and end the session.
    pub fn close(&self) -> Result<(), StorageError> {
        self.objects.close()
    }
}

impl EntityStorage for EntitySession {
    fn fetch<T: Storable>(&self, id: &Identifier) -> Result<Option<T>, StorageError> {
        let Some(mut item) = self.objects.read::<T>(id)? else {
            return Ok(None);
        };
        item.on_load(self, id)?;
        Ok(Some(item))
    }

    fn store<T: Storable>(&self, id: &Identifier, item: &T) -> Result<(), StorageError> {
        self.objects.write(id, item)?;
        item.on_insert(self, id)
    }

    fn delete(&self, id: &Identifier) -> Result<(), StorageError> {
        self.objects.remove(id)
    }

    fn list_children(&self, id: &Identifier) -> Result<Vec<Identifier>, StorageError> {
        self.objects.list_children(id)
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.objects.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn session() -> EntitySession {
        EntityStore::new(Arc::new(MemoryStorage::new()), 16).connect()
    }

    fn id(path: &str) -> Identifier {
        Identifier::new(path).expect("valid identifier")
    }

    #[test]
    fn test_store_and_delete_entity() {
        let session = session();
        let folder = Folder::new(id("a/b"));
        session.store_entity(&folder).expect("store");
        assert_eq!(
            session.fetch::<Folder>(&id("a/b")).expect("fetch"),
            Some(folder.clone())
        );
        assert_eq!(session.list_children(&id("a")).expect("list"), vec![id("a/b")]);

        session.delete_entity(&folder).expect("delete");
        assert_eq!(session.fetch::<Folder>(&id("a/b")).expect("fetch"), None);
    }

    #[test]
    fn test_create_entity_is_exclusive() {
        let session = session();
        let folder = Folder::new(id("locks/one"));
        assert!(session.create_entity(&folder, Duration::ZERO).expect("create"));
        assert!(!session.create_entity(&folder, Duration::ZERO).expect("create"));
        session.delete_entity(&folder).expect("delete");
        assert!(session.create_entity(&folder, Duration::ZERO).expect("create"));
    }

    #[test]
    fn test_ensure_folder_is_idempotent() {
        let session = session();
        session.ensure_folder(&id("x/y")).expect("ensure");
        session.ensure_folder(&id("x/y")).expect("ensure");
        assert_eq!(session.list_children(&id("x")).expect("list"), vec![id("x/y")]);
    }
}
