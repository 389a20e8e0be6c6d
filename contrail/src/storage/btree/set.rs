//! Ordered set backed by a [`BPlusTree`] whose leaves carry no values.

use crate::storage::btree::cursor::{Cursor, Direction};
use crate::storage::btree::node::{DEFAULT_PAGE_SIZE, TreeKey};
use crate::storage::btree::tree::{BPlusTree, BTreeError, TreeStats};
use crate::storage::object::EntityStorage;
use crate::types::Identifier;

/// A persistent ordered set of `K`.
#[derive(Debug)]
pub struct BTree<'s, S: EntityStorage, K> {
    tree: BPlusTree<'s, S, K, ()>,
}

impl<'s, S: EntityStorage, K: TreeKey> BTree<'s, S, K> {
    /// Create and store an empty set under `id`.
    pub fn create(storage: &'s S, id: Identifier, page_size: usize) -> Result<Self, BTreeError> {
        let tree = BPlusTree::create_with(storage, id, page_size, false)?;
        Ok(Self { tree })
    }

    pub fn create_default(storage: &'s S) -> Result<Self, BTreeError> {
        Self::create(storage, Identifier::unique(), DEFAULT_PAGE_SIZE)
    }

    /// Attach to the set stored under `id`.
    pub fn open(storage: &'s S, id: &Identifier) -> Result<Self, BTreeError> {
        let tree = BPlusTree::open_with(storage, id, false)?;
        Ok(Self { tree })
    }

    #[must_use]
    pub const fn id(&self) -> &Identifier {
        self.tree.id()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Add `key`. Returns `true` if it was not present.
    pub fn insert(&mut self, key: K) -> Result<bool, BTreeError> {
        Ok(self.tree.insert(key, ())?.is_none())
    }

    /// Remove `key`. Returns `true` if it was present.
    pub fn remove(&mut self, key: &K) -> Result<bool, BTreeError> {
        Ok(self.tree.remove(key)?.is_some())
    }

    pub fn contains(&self, key: &K) -> Result<bool, BTreeError> {
        self.tree.contains(key)
    }

    pub fn count(&self) -> Result<usize, BTreeError> {
        self.tree.count()
    }

    #[must_use]
    pub fn cursor(&self, direction: Direction) -> Cursor<'s, S, K, ()> {
        self.tree.cursor(direction)
    }

    pub fn verify(&self) -> Result<TreeStats, BTreeError> {
        self.tree.verify()
    }

    pub fn dump(&self) -> Result<String, BTreeError> {
        self.tree.dump()
    }

    /// Delete every page and the set itself.
    pub fn delete(self) -> Result<(), BTreeError> {
        self.tree.delete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use crate::storage::object::ObjectStore;
    use std::sync::Arc;

    #[test]
    fn test_set_insert_remove() {
        let objects = ObjectStore::new(Arc::new(MemoryStorage::new()), 100).connect();
        let mut set = BTree::create(&objects, Identifier::unique(), 4).expect("create");

        for key in ["delta", "alpha", "charlie", "bravo", "echo", "foxtrot"] {
            assert!(set.insert(key.to_string()).expect("insert"));
        }
        assert!(!set.insert("alpha".to_string()).expect("insert again"));
        assert_eq!(set.count().expect("count"), 6);
        assert!(set.contains(&"charlie".to_string()).expect("contains"));

        assert!(set.remove(&"charlie".to_string()).expect("remove"));
        assert!(!set.remove(&"charlie".to_string()).expect("remove again"));
        set.verify().expect("verify");

        let mut cursor = set.cursor(Direction::Forward);
        let mut keys = Vec::new();
        while let Some((key, ())) = cursor.next_entry().expect("next") {
            keys.push(key);
        }
        assert_eq!(keys, vec!["alpha", "bravo", "delta", "echo", "foxtrot"]);
    }

    #[test]
    fn test_set_and_map_are_not_interchangeable() {
        let objects = ObjectStore::new(Arc::new(MemoryStorage::new()), 100).connect();
        let id = Identifier::unique();
        BTree::<_, u32>::create(&objects, id.clone(), 4).expect("create");

        let reopened = BTree::<_, u32>::open(&objects, &id).expect("open set");
        assert!(reopened.is_empty());
        assert!(matches!(
            BPlusTree::<_, u32, u32>::open(&objects, &id),
            Err(BTreeError::Corrupted(_))
        ));
    }
}
