//! Folder locks built on conditional create.
//!
//! A [`LockFolder`] is locked exactly when its single `lock` child exists.
//! Acquiring the lock is an atomic create-if-absent of that child carrying
//! the owner's process id; releasing it is a delete. This is the one mutex
//! primitive of the system and it is used for the root folder (commit and
//! session-begin serialisation) and for every revision folder (session
//! registration against cleanup).
//!
//! # Leases
//!
//! Locks are never renewed. A waiter gives the current holder the full
//! lease plus a grace second to release; after that the lock is considered
//! abandoned and is broken. If the create still fails after breaking, the
//! database is reported as locked.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::entity::{Entity, EntitySession};
use crate::storage::io::StorageError;
use crate::storage::object::{EntityStorage, Lifecycle, Storable};
use crate::types::Identifier;

/// Name of the lock folder below the folder it protects.
pub const LOCK_FOLDER_NAME: &str = "lockfolder";
/// Name of the lock entity inside a lock folder.
pub const LOCK_NAME: &str = "lock";
/// Extra wait on top of the lease before a lock is broken.
pub const LEASE_GRACE: Duration = Duration::from_millis(1000);
/// Default lease after which a held lock may be broken.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// The entity whose existence means "locked".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub id: Identifier,
    pub process_id: String,
}

impl Lifecycle for Lock {}

impl Storable for Lock {
    const TYPE_TAG: &'static str = "contrail.lock";
}

impl Entity for Lock {
    fn id(&self) -> &Identifier {
        &self.id
    }
}

/// A mutex stored as a folder with at most one [`Lock`] child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockFolder {
    pub id: Identifier,
}

impl LockFolder {
    /// The lock folder that protects `parent`.
    #[must_use]
    pub fn within(parent: &Identifier) -> Self {
        Self {
            id: parent.child(LOCK_FOLDER_NAME),
        }
    }

    /// Identifier of the lock entity.
    #[must_use]
    pub fn lock_id(&self) -> Identifier {
        self.id.child(LOCK_NAME)
    }

    /// Try to take the lock for `process_id`.
    ///
    /// Without `wait_for_next` this fails fast and returns `false` if the
    /// lock is held. With it, waits `lease + LEASE_GRACE` for the holder,
    /// then breaks the lock and retries once.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if the lock could not be taken even
    /// after breaking the previous holder's lease.
    pub fn lock(
        &self,
        storage: &EntitySession,
        process_id: &str,
        wait_for_next: bool,
        lease: Duration,
    ) -> Result<bool, StorageError> {
        let lock = Lock {
            id: self.lock_id(),
            process_id: process_id.to_string(),
        };
        let wait = if wait_for_next {
            lease.saturating_add(LEASE_GRACE)
        } else {
            Duration::ZERO
        };

        if storage.create_entity(&lock, wait)? {
            tracing::debug!(folder = %self.id, process_id, "lock acquired");
            return Ok(true);
        }
        if !wait_for_next {
            return Ok(false);
        }

        let holder = self.holder(storage)?;
        tracing::warn!(
            folder = %self.id,
            process_id,
            holder = holder.as_deref().unwrap_or("<none>"),
            "lease expired, breaking lock"
        );
        storage.delete(&lock.id)?;
        if storage.create_entity(&lock, wait)? {
            tracing::debug!(folder = %self.id, process_id, "lock acquired after break");
            return Ok(true);
        }
        Err(StorageError::Locked { id: self.id.clone() })
    }

    /// Release a lock held by `process_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotLockOwner`] if the lock is not held, or is
    /// held by another process. Either is a bug in the caller.
    pub fn unlock(&self, storage: &EntitySession, process_id: &str) -> Result<(), StorageError> {
        let lock_id = self.lock_id();
        match storage.fetch_fresh::<Lock>(&lock_id)? {
            Some(lock) if lock.process_id == process_id => {
                storage.delete(&lock_id)?;
                storage.flush()?;
                tracing::debug!(folder = %self.id, process_id, "lock released");
                Ok(())
            }
            _ => Err(StorageError::NotLockOwner {
                id: self.id.clone(),
                process_id: process_id.to_string(),
            }),
        }
    }

    /// Process id of the current holder, if locked.
    pub fn holder(&self, storage: &EntitySession) -> Result<Option<String>, StorageError> {
        Ok(storage
            .fetch_fresh::<Lock>(&self.lock_id())?
            .map(|lock| lock.process_id))
    }

    /// Whether the lock is currently held by anyone.
    pub fn is_locked(&self, storage: &EntitySession) -> Result<bool, StorageError> {
        Ok(self.holder(storage)?.is_some())
    }
}

impl Lifecycle for LockFolder {
    fn on_delete<S: EntityStorage>(&self, storage: &S, _id: &Identifier) -> Result<(), StorageError> {
        storage.delete(&self.lock_id())
    }
}

impl Storable for LockFolder {
    const TYPE_TAG: &'static str = "contrail.lockfolder";
}

impl Entity for LockFolder {
    fn id(&self) -> &Identifier {
        &self.id
    }
}
