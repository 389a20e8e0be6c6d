//! B-tree pages and the persisted tree header.
//!
//! Every page is one object stored at `<tree id>/<unique>`:
//! - Leaf pages hold sorted keys and their values and are doubly linked to
//!   their neighbours for cursor traversal.
//! - Inner pages hold sorted routing keys and child page identifiers.
//!
//! # Routing
//!
//! For an inner page with entries `(key[0], child[0]) .. (key[n-1], child[n-1])`
//! every key stored below `child[i]` is `>= key[i]` and `< key[i+1]`. The
//! first key is the page's own lower bound; a key smaller than every bound
//! routes to `child[0]`, which lowers `key[0]` when it is inserted.

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::storage::entity::Entity;
use crate::storage::io::StorageError;
use crate::storage::object::{EntityStorage, Lifecycle, Storable};
use crate::types::Identifier;

/// Default number of entries per page.
pub const DEFAULT_PAGE_SIZE: usize = 200;

/// Requirements on a key type.
pub trait TreeKey: Ord + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> TreeKey for T where T: Ord + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Requirements on a value type.
pub trait TreeValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> TreeValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Whether `page_size` is usable: even and positive.
#[must_use]
pub const fn is_valid_page_size(page_size: usize) -> bool {
    page_size > 0 && page_size % 2 == 0
}

/// One page of a tree: parallel arrays of keys and payloads.
///
/// Leaves carry values, inner pages carry child page identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node<K, P> {
    pub id: Identifier,
    pub tree_id: Identifier,
    pub keys: Vec<K>,
    pub values: Vec<P>,
    pub previous: Option<Identifier>,
    pub next: Option<Identifier>,
}

impl<K: Ord, P> Node<K, P> {
    /// An empty page with a fresh identifier below `tree_id`.
    #[must_use]
    pub fn new(tree_id: &Identifier) -> Self {
        Self {
            id: Identifier::unique_child(tree_id),
            tree_id: tree_id.clone(),
            keys: Vec::new(),
            values: Vec::new(),
            previous: None,
            next: None,
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    #[must_use]
    pub fn first_key(&self) -> Option<&K> {
        self.keys.first()
    }

    #[must_use]
    pub fn last_key(&self) -> Option<&K> {
        self.keys.last()
    }

    /// Leaf search: `Ok(i)` if `key` is at `i`, otherwise `Err(i)` with the
    /// first slot whose key is greater.
    pub fn search(&self, key: &K) -> Result<usize, usize> {
        self.keys.binary_search(key)
    }

    /// Leaf search for the first slot with a key `>= key`.
    #[must_use]
    pub fn lower_bound(&self, key: &K) -> usize {
        self.keys.partition_point(|k| k < key)
    }

    /// Leaf search for the first slot with a key `> key`.
    #[must_use]
    pub fn upper_bound(&self, key: &K) -> usize {
        self.keys.partition_point(|k| k <= key)
    }

    /// Inner search: the last child whose bound is `<= key`.
    ///
    /// An exact match on a routing key selects that key's own child, the
    /// right side of the boundary.
    #[must_use]
    pub fn child_index(&self, key: &K) -> usize {
        self.upper_bound(key).saturating_sub(1)
    }

    pub fn insert_at(&mut self, index: usize, key: K, value: P) {
        self.keys.insert(index, key);
        self.values.insert(index, value);
    }

    pub fn remove_at(&mut self, index: usize) -> (K, P) {
        (self.keys.remove(index), self.values.remove(index))
    }

    /// Move the upper half of the entries into a new sibling page.
    ///
    /// The sibling is not linked; callers fix `previous`/`next`.
    #[must_use]
    pub fn split_off(&mut self) -> Self {
        let at = self.size() / 2;
        let mut right = Self::new(&self.tree_id);
        right.keys = self.keys.split_off(at);
        right.values = self.values.split_off(at);
        right
    }

    /// Append every entry of `other`.
    pub fn append(&mut self, other: &mut Self) {
        self.keys.append(&mut other.keys);
        self.values.append(&mut other.values);
    }
}

/// The stored form of a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Page<K, V> {
    Leaf(Node<K, V>),
    Inner(Node<K, Identifier>),
}

impl<K, V> Page<K, V> {
    #[must_use]
    pub const fn id(&self) -> &Identifier {
        match self {
            Self::Leaf(node) => &node.id,
            Self::Inner(node) => &node.id,
        }
    }

    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }
}

impl<K: TreeKey, V: TreeValue> Lifecycle for Page<K, V> {}

impl<K: TreeKey, V: TreeValue> Storable for Page<K, V> {
    const TYPE_TAG: &'static str = "contrail.btree.page";
}

/// Persisted description of a tree.
///
/// The pages live below the header's identifier, so deleting the header
/// deletes the whole tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeHeader {
    pub id: Identifier,
    /// Root page, `None` while the tree is empty.
    pub root_id: Option<Identifier>,
    pub page_size: usize,
    /// `false` for set trees whose leaves carry no meaningful values.
    pub has_leaf_values: bool,
}

impl Lifecycle for TreeHeader {
    fn on_load<S: EntityStorage>(&mut self, _storage: &S, id: &Identifier) -> Result<(), StorageError> {
        if !is_valid_page_size(self.page_size) {
            return Err(StorageError::corruption(format!(
                "tree {id} has invalid page size {}",
                self.page_size
            )));
        }
        Ok(())
    }

    fn on_delete<S: EntityStorage>(&self, storage: &S, id: &Identifier) -> Result<(), StorageError> {
        for page in storage.list_children(id)? {
            storage.delete(&page)?;
        }
        Ok(())
    }
}

impl Storable for TreeHeader {
    const TYPE_TAG: &'static str = "contrail.btree.tree";
}

impl Entity for TreeHeader {
    fn id(&self) -> &Identifier {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(keys: &[u32]) -> Node<u32, u32> {
        let mut node = Node::new(&Identifier::unique());
        for &key in keys {
            let index = node.keys.len();
            node.insert_at(index, key, key * 10);
        }
        node
    }

    #[test]
    fn test_leaf_and_inner_search_differ_on_ties() {
        let node = node(&[10, 20, 30]);
        assert_eq!(node.search(&20), Ok(1));
        assert_eq!(node.search(&25), Err(2));
        assert_eq!(node.lower_bound(&20), 1);
        assert_eq!(node.child_index(&19), 0);
        assert_eq!(node.child_index(&20), 1);
        assert_eq!(node.child_index(&25), 1);
        assert_eq!(node.child_index(&5), 0);
        assert_eq!(node.child_index(&99), 2);
    }

    #[test]
    fn test_split_and_append() {
        let mut left = node(&[1, 2, 3, 4, 5]);
        let mut right = left.split_off();
        assert_eq!(left.keys, vec![1, 2]);
        assert_eq!(right.keys, vec![3, 4, 5]);
        assert_eq!(right.values, vec![30, 40, 50]);
        assert_eq!(right.tree_id, left.tree_id);
        assert_ne!(right.id, left.id);

        left.append(&mut right);
        assert_eq!(left.keys, vec![1, 2, 3, 4, 5]);
        assert!(right.is_empty());
    }

    #[test]
    fn test_page_size_validation() {
        assert!(is_valid_page_size(2));
        assert!(is_valid_page_size(200));
        assert!(!is_valid_page_size(0));
        assert!(!is_valid_page_size(7));
    }
}
