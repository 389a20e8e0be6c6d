//! Versioned object storage.
//!
//! The layers, bottom up:
//!
//! - [`RawStorage`]: bytes under hierarchical identifiers, with
//!   [`MemoryStorage`] and [`FileStorage`] backends.
//! - [`ObjectStore`] and [`EntityStore`]: typed objects with lifecycle hooks
//!   and a shared identity cache.
//! - Metadata entities: the [`RootFolder`], one [`RevisionFolder`] per
//!   revision with its [`CommitMarker`] and [`RevisionJournal`], and
//!   [`LockFolder`] mutexes.
//! - [`StorageSystem`] and [`StorageSession`]: snapshot-isolated sessions
//!   with conflict detection at commit, and [`StorageCleanupAction`]
//!   reclaiming revisions nobody can see any more.
//! - [`btree`]: persistent B+trees written against [`EntityStorage`].
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//!
//! use contrail::storage::{EntityStorage, MemoryStorage, SessionMode, StorageSystem};
//!
//! let system = StorageSystem::open_with_defaults(Arc::new(MemoryStorage::new())).unwrap();
//! let session = system.begin_session(SessionMode::ReadWrite).unwrap();
//! let children = session.list_children(&"docs".parse().unwrap()).unwrap();
//! assert!(children.is_empty());
//! session.commit().unwrap();
//! ```

pub mod btree;
mod cache;
mod cleanup;
pub mod codec;
mod entity;
mod file;
mod io;
mod lock;
mod memory;
mod object;
mod revision;
mod session;
mod system;

pub use cache::{CacheStats, CachedObject, DEFAULT_CACHE_CAPACITY, IdentityCache};
pub use cleanup::StorageCleanupAction;
pub use entity::{Entity, EntitySession, EntityStore, Folder};
pub use file::FileStorage;
pub use io::{RawStorage, StorageError};
pub use lock::{DEFAULT_LEASE_TIMEOUT, LEASE_GRACE, LOCK_FOLDER_NAME, LOCK_NAME, Lock, LockFolder};
pub use memory::{MemoryStats, MemoryStorage};
pub use object::{EntityStorage, Lifecycle, ObjectSession, ObjectStore, Storable};
pub use revision::{CommitMarker, DeletionMark, RevisionFolder, RevisionJournal, RootFolder, SessionPin};
pub use session::{SessionMode, SessionState, StorageSession, VERSIONS_FOLDER};
pub use system::{RevisionInfo, StorageSystem};
