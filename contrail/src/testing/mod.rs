use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::storage::{Entity, FileStorage, Lifecycle, MemoryStorage, Storable, StorageSystem};
use crate::types::Identifier;

/// A small entity stored by tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fixture {
    pub id: Identifier,
    pub value: u64,
}

impl Fixture {
    /// A fixture stored at [`fixture_id`]`(name)`.
    pub fn new(name: &str, value: u64) -> Self {
        Self {
            id: fixture_id(name),
            value,
        }
    }
}

impl Lifecycle for Fixture {}

impl Storable for Fixture {
    const TYPE_TAG: &'static str = "contrail.test.fixture";
}

impl Entity for Fixture {
    fn id(&self) -> &Identifier {
        &self.id
    }
}

/// Identifier of the fixture named `name`; the empty name is the folder
/// holding every fixture.
pub fn fixture_id(name: &str) -> Identifier {
    Identifier::new(&format!("fixtures/{name}")).expect("fixture identifier")
}

/// A storage system over fresh in-memory storage.
pub fn new_memory_system() -> Arc<StorageSystem> {
    StorageSystem::open_with_defaults(Arc::new(MemoryStorage::new())).expect("open memory system")
}

/// A storage system over a fresh temporary directory.
///
/// The directory is removed when the returned guard is dropped.
pub fn new_file_system() -> (tempfile::TempDir, Arc<StorageSystem>) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let raw = FileStorage::open(dir.path()).expect("open file storage");
    let system = StorageSystem::open_with_defaults(Arc::new(raw)).expect("open file system");
    (dir, system)
}
