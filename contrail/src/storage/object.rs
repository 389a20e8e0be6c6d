//! Object storage.
//!
//! Turns typed Rust values into tagged bytes in a [`RawStorage`] and back,
//! keeping recently used objects in a shared [`IdentityCache`].
//!
//! # Design
//!
//! - [`Storable`] marks a type that can be persisted. Its [`Lifecycle`]
//!   hooks run when an object is inserted, loaded or deleted through an
//!   [`EntityStorage`]; the storage doing the work is passed to the hook so
//!   objects can create, resolve or remove the objects they own.
//! - [`EntityStorage`] is the object-level interface shared by the plain
//!   object session, the entity session and the versioned
//!   [`StorageSession`](crate::storage::StorageSession). B-trees and
//!   metadata entities are written against it.
//! - [`ObjectSession`] also exposes hook-free primitives (`read`, `write`,
//!   `remove`) for layers, like the versioned session, that store an object
//!   somewhere other than its logical identifier and run the hooks
//!   themselves.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::storage::cache::IdentityCache;
use crate::storage::codec;
use crate::storage::entity::Entity;
use crate::storage::io::{RawStorage, StorageError};
use crate::types::Identifier;

/// Hooks invoked by an [`EntityStorage`] at an object's persistence
/// transitions. Every hook defaults to doing nothing.
pub trait Lifecycle {
    /// Called after the object has been stored under `id`.
    fn on_insert<S: EntityStorage>(&self, _storage: &S, _id: &Identifier) -> Result<(), StorageError> {
        Ok(())
    }

    /// Called after the object has been read from `id`, before it is
    /// returned to the caller.
    fn on_load<S: EntityStorage>(&mut self, _storage: &S, _id: &Identifier) -> Result<(), StorageError> {
        Ok(())
    }

    /// Called before the object stored under `id` is deleted.
    fn on_delete<S: EntityStorage>(&self, _storage: &S, _id: &Identifier) -> Result<(), StorageError> {
        Ok(())
    }
}

/// A type that can be persisted by the object layer.
pub trait Storable: Lifecycle + Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Tag written in front of every encoded value of this type.
    const TYPE_TAG: &'static str;
}

/// Typed, identifier-addressed object storage.
pub trait EntityStorage {
    /// Load the object stored under `id`.
    fn fetch<T: Storable>(&self, id: &Identifier) -> Result<Option<T>, StorageError>;

    /// Store `item` under `id`, replacing whatever was there.
    fn store<T: Storable>(&self, id: &Identifier, item: &T) -> Result<(), StorageError>;

    /// Delete whatever is stored under `id`. No lifecycle hook runs.
    fn delete(&self, id: &Identifier) -> Result<(), StorageError>;

    /// Identifiers of the objects stored immediately below `id`.
    fn list_children(&self, id: &Identifier) -> Result<Vec<Identifier>, StorageError>;

    /// Make previous writes durable.
    fn flush(&self) -> Result<(), StorageError>;

    /// Run `item`'s delete hook, then delete it.
    fn delete_object<T: Storable>(&self, id: &Identifier, item: &T) -> Result<(), StorageError>
    where
        Self: Sized,
    {
        item.on_delete(self, id)?;
        self.delete(id)
    }

    /// Delete every object below `id`, deepest first, leaving `id` itself.
    /// No lifecycle hook runs.
    fn delete_all_children(&self, id: &Identifier) -> Result<(), StorageError> {
        for child in self.list_children(id)? {
            self.delete_all_children(&child)?;
            self.delete(&child)?;
        }
        Ok(())
    }

    /// Load every object stored immediately below `id`.
    fn fetch_children<T: Storable>(&self, id: &Identifier) -> Result<Vec<(Identifier, T)>, StorageError>
    where
        Self: Sized,
    {
        let mut children = Vec::new();
        for child in self.list_children(id)? {
            if let Some(item) = self.fetch(&child)? {
                children.push((child, item));
            }
        }
        Ok(children)
    }

    /// Load several objects at once, preserving the order of `ids`.
    fn fetch_all<T: Storable>(&self, ids: &[Identifier]) -> Result<Vec<Option<T>>, StorageError>
    where
        Self: Sized,
    {
        ids.iter().map(|id| self.fetch(id)).collect()
    }

    /// Store an entity under its own identifier.
    fn store_entity<E: Entity>(&self, entity: &E) -> Result<(), StorageError>
    where
        Self: Sized,
    {
        self.store(entity.id(), entity)
    }

    /// Delete an entity, running its delete hook first.
    fn delete_entity<E: Entity>(&self, entity: &E) -> Result<(), StorageError>
    where
        Self: Sized,
    {
        self.delete_object(entity.id(), entity)
    }
}

/// Shared object storage over one raw backend.
#[derive(Clone)]
pub struct ObjectStore {
    raw: Arc<dyn RawStorage>,
    cache: Arc<IdentityCache>,
}

impl ObjectStore {
    /// Create an object store caching at most `cache_capacity` objects.
    #[must_use]
    pub fn new(raw: Arc<dyn RawStorage>, cache_capacity: usize) -> Self {
        Self {
            raw,
            cache: Arc::new(IdentityCache::new(cache_capacity)),
        }
    }

    /// Open a session. Sessions are cheap and share the cache.
    #[must_use]
    #[allow(clippy::disallowed_methods)] // Arc::clone is safe and expected
    pub fn connect(&self) -> ObjectSession {
        ObjectSession {
            raw: Arc::clone(&self.raw),
            cache: Arc::clone(&self.cache),
        }
    }

    /// The raw backend.
    #[must_use]
    pub fn raw(&self) -> &Arc<dyn RawStorage> {
        &self.raw
    }

    /// The shared identity cache.
    #[must_use]
    pub fn cache(&self) -> &IdentityCache {
        &self.cache
    }
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

/// A connection to an [`ObjectStore`].
///
/// Writes go straight to the raw backend; `flush` makes them durable.
#[derive(Clone)]
pub struct ObjectSession {
    raw: Arc<dyn RawStorage>,
    cache: Arc<IdentityCache>,
}

impl ObjectSession {
    /// Read and decode the object under `id` without running hooks.
    pub fn read<T: Storable>(&self, id: &Identifier) -> Result<Option<T>, StorageError> {
        if let Some(item) = self.cache.get_as::<T>(id) {
            return Ok(Some(item));
        }
        self.read_fresh(id)
    }

    /// Like [`read`](Self::read) but always goes to the raw backend.
    pub fn read_fresh<T: Storable>(&self, id: &Identifier) -> Result<Option<T>, StorageError> {
        let Some(bytes) = self.raw.get(id)? else {
            self.cache.remove(id);
            return Ok(None);
        };
        let item: T = codec::decode(id, &bytes)?;
        self.cache.insert(id.clone(), Arc::new(item.clone()));
        Ok(Some(item))
    }

    /// Encode and store `item` under `id` without running hooks.
    pub fn write<T: Storable>(&self, id: &Identifier, item: &T) -> Result<(), StorageError> {
        let bytes = codec::encode(item)?;
        self.raw.put(id, &bytes)?;
        self.cache.insert(id.clone(), Arc::new(item.clone()));
        Ok(())
    }

    /// Remove whatever is stored under `id`.
    pub fn remove(&self, id: &Identifier) -> Result<(), StorageError> {
        self.raw.delete(id)?;
        self.cache.remove(id);
        Ok(())
    }

    /// Store `item` under `id` only if nothing is stored there, waiting up
    /// to `wait` for the current value to go away. No hooks run.
    pub fn create_if_absent<T: Storable>(
        &self,
        id: &Identifier,
        item: &T,
        wait: Duration,
    ) -> Result<bool, StorageError> {
        let bytes = codec::encode(item)?;
        if !self.raw.create_if_absent(id, &bytes, wait)? {
            return Ok(false);
        }
        self.cache.insert(id.clone(), Arc::new(item.clone()));
        Ok(true)
    }

    /// Conditionally create `item` under `id`, running its insert hook on
    /// success.
    pub fn create<T: Storable>(
        &self,
        id: &Identifier,
        item: &T,
        wait: Duration,
    ) -> Result<bool, StorageError> {
        if !self.create_if_absent(id, item, wait)? {
            return Ok(false);
        }
        item.on_insert(self, id)?;
        Ok(true)
    }

    /// Whether anything at all is stored under `id`.
    pub fn exists(&self, id: &Identifier) -> Result<bool, StorageError> {
        Ok(self.raw.get(id)?.is_some())
    }

    /// Flush and end the session.
    pub fn close(&self) -> Result<(), StorageError> {
        self.raw.flush()
    }
}

impl EntityStorage for ObjectSession {
    fn fetch<T: Storable>(&self, id: &Identifier) -> Result<Option<T>, StorageError> {
        let Some(mut item) = self.read::<T>(id)? else {
            return Ok(None);
        };
        item.on_load(self, id)?;
        Ok(Some(item))
    }

    fn store<T: Storable>(&self, id: &Identifier, item: &T) -> Result<(), StorageError> {
        self.write(id, item)?;
        item.on_insert(self, id)
    }

    fn delete(&self, id: &Identifier) -> Result<(), StorageError> {
        self.remove(id)
    }

    fn list_children(&self, id: &Identifier) -> Result<Vec<Identifier>, StorageError> {
        self.raw.list_children(id)
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.raw.flush()
    }
}

impl std::fmt::Debug for ObjectSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectSession").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::storage::memory::MemoryStorage;

    static LOADS: AtomicUsize = AtomicUsize::new(0);

    /// Owns a child note that is created and deleted with it.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Document {
        title: String,
        #[serde(skip)]
        loaded: bool,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note(String);

    impl Lifecycle for Note {}

    impl Storable for Note {
        const TYPE_TAG: &'static str = "test.note";
    }

    impl Lifecycle for Document {
        fn on_insert<S: EntityStorage>(&self, storage: &S, id: &Identifier) -> Result<(), StorageError> {
            storage.store(&id.child("note"), &Note(format!("about {}", self.title)))
        }

        fn on_load<S: EntityStorage>(&mut self, _storage: &S, _id: &Identifier) -> Result<(), StorageError> {
            LOADS.fetch_add(1, Ordering::SeqCst);
            self.loaded = true;
            Ok(())
        }

        fn on_delete<S: EntityStorage>(&self, storage: &S, id: &Identifier) -> Result<(), StorageError> {
            storage.delete(&id.child("note"))
        }
    }

    impl Storable for Document {
        const TYPE_TAG: &'static str = "test.document";
    }

    fn session() -> (Arc<MemoryStorage>, ObjectSession) {
        let raw = Arc::new(MemoryStorage::new());
        let store = ObjectStore::new(raw.clone(), 16);
        (raw, store.connect())
    }

    fn id(path: &str) -> Identifier {
        Identifier::new(path).expect("valid identifier")
    }

    #[test]
    fn test_store_fetch_runs_hooks() {
        let (_, session) = session();
        let doc_id = id("docs/1");
        let doc = Document {
            title: "intro".to_string(),
            loaded: false,
        };
        session.store(&doc_id, &doc).expect("store");

        let note: Note = session.fetch(&doc_id.child("note")).expect("fetch").expect("note");
        assert_eq!(note, Note("about intro".to_string()));

        let before = LOADS.load(Ordering::SeqCst);
        let loaded: Document = session.fetch(&doc_id).expect("fetch").expect("doc");
        assert!(loaded.loaded);
        assert!(LOADS.load(Ordering::SeqCst) > before);

        session.delete_object(&doc_id, &loaded).expect("delete");
        assert!(session.fetch::<Document>(&doc_id).expect("fetch").is_none());
        assert!(session.fetch::<Note>(&doc_id.child("note")).expect("fetch").is_none());
    }

    #[test]
    fn test_cached_read_skips_raw_storage() {
        let (raw, session) = session();
        let note_id = id("notes/a");
        session.write(&note_id, &Note("x".to_string())).expect("write");

        let reads = raw.stats().reads;
        let note: Option<Note> = session.read(&note_id).expect("read");
        assert_eq!(note, Some(Note("x".to_string())));
        assert_eq!(raw.stats().reads, reads);

        let fresh: Option<Note> = session.read_fresh(&note_id).expect("read");
        assert_eq!(fresh, Some(Note("x".to_string())));
        assert_eq!(raw.stats().reads, reads + 1);
    }

    #[test]
    fn test_correct_without_cache() {
        let raw = Arc::new(MemoryStorage::new());
        let session = ObjectStore::new(raw, 0).connect();
        let note_id = id("notes/a");
        session.write(&note_id, &Note("x".to_string())).expect("write");
        session.write(&note_id, &Note("y".to_string())).expect("write");
        assert_eq!(
            session.read::<Note>(&note_id).expect("read"),
            Some(Note("y".to_string()))
        );
    }

    #[test]
    fn test_create_only_once() {
        let (_, session) = session();
        let lock_id = id("locks/l");
        assert!(session.create(&lock_id, &Note("a".to_string()), Duration::ZERO).expect("create"));
        assert!(!session.create(&lock_id, &Note("b".to_string()), Duration::ZERO).expect("create"));
        assert_eq!(
            session.read::<Note>(&lock_id).expect("read"),
            Some(Note("a".to_string()))
        );
    }

    #[test]
    fn test_fetch_children_and_fetch_all() {
        let (_, session) = session();
        let folder = id("notes");
        for name in ["a", "b", "c"] {
            session.store(&folder.child(name), &Note(name.to_string())).expect("store");
        }
        let children: Vec<(Identifier, Note)> = session.fetch_children(&folder).expect("children");
        assert_eq!(children.len(), 3);
        assert_eq!(children[0].1, Note("a".to_string()));

        let fetched: Vec<Option<Note>> = session
            .fetch_all(&[folder.child("c"), folder.child("missing")])
            .expect("fetch all");
        assert_eq!(fetched, vec![Some(Note("c".to_string())), None]);
    }

    #[test]
    fn test_delete_all_children() {
        let (_, session) = session();
        let folder = id("notes");
        session.store(&folder, &Note("root".to_string())).expect("store");
        session.store(&folder.child("a"), &Note("a".to_string())).expect("store");
        session.store(&folder.child("a").child("x"), &Note("x".to_string())).expect("store");
        session.store(&folder.child("b"), &Note("b".to_string())).expect("store");

        session.delete_all_children(&folder).expect("delete children");
        assert!(session.list_children(&folder).expect("list").is_empty());
        assert!(session.fetch::<Note>(&folder.child("a").child("x")).expect("fetch").is_none());
        assert_eq!(
            session.fetch::<Note>(&folder).expect("fetch"),
            Some(Note("root".to_string()))
        );
    }
}
