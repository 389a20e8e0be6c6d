//! B+tree over an [`EntityStorage`].
//!
//! Keys and values live in the leaves, inner pages only route. Pages are
//! loaded and stored one at a time through the storage, so a tree kept in a
//! [`StorageSession`](crate::storage::StorageSession) is versioned like any
//! other entity.
//!
//! # Invariants
//!
//! After every `insert` or `remove`:
//! - every page holds at most `page_size` entries;
//! - every page except the root holds at least `page_size / 2` entries;
//! - all leaves are at the same depth and their links follow key order;
//! - the keys of every inner page are ascending and `key[i]` is a lower
//!   bound of every key below `child[i]`;
//! - an empty tree has no root page.

use std::marker::PhantomData;

use crate::storage::btree::cursor::{Cursor, Direction};
use crate::storage::btree::node::{
    DEFAULT_PAGE_SIZE, Node, Page, TreeHeader, TreeKey, TreeValue, is_valid_page_size,
};
use crate::storage::io::StorageError;
use crate::storage::object::EntityStorage;
use crate::types::Identifier;

/// A new right sibling that the parent has to route to.
struct Split<K> {
    /// Lower bound of the page that split, used when the root splits.
    left_first: K,
    /// Lower bound of every key reachable through `right`.
    separator: K,
    right: Identifier,
}

/// Shape of a tree as reported by [`BPlusTree::verify`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Number of page levels, 0 for an empty tree.
    pub depth: usize,
    pub pages: usize,
    pub keys: usize,
}

/// A persistent ordered map from `K` to `V`.
pub struct BPlusTree<'s, S: EntityStorage, K, V> {
    storage: &'s S,
    header: TreeHeader,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<'s, S: EntityStorage, K: TreeKey, V: TreeValue> BPlusTree<'s, S, K, V> {
    /// Create and store an empty tree under `id`.
    pub fn create(storage: &'s S, id: Identifier, page_size: usize) -> Result<Self, BTreeError> {
        Self::create_with(storage, id, page_size, true)
    }

    /// Create an empty tree with a fresh identifier and the default page size.
    pub fn create_default(storage: &'s S) -> Result<Self, BTreeError> {
        Self::create(storage, Identifier::unique(), DEFAULT_PAGE_SIZE)
    }

    pub(crate) fn create_with(
        storage: &'s S,
        id: Identifier,
        page_size: usize,
        has_leaf_values: bool,
    ) -> Result<Self, BTreeError> {
        if !is_valid_page_size(page_size) {
            return Err(BTreeError::InvalidPageSize(page_size));
        }
        let header = TreeHeader {
            id,
            root_id: None,
            page_size,
            has_leaf_values,
        };
        storage.store_entity(&header)?;
        tracing::debug!(tree = %header.id, page_size, "created tree");
        Ok(Self {
            storage,
            header,
            _marker: PhantomData,
        })
    }

    /// Attach to the tree stored under `id`.
    pub fn open(storage: &'s S, id: &Identifier) -> Result<Self, BTreeError> {
        Self::open_with(storage, id, true)
    }

    pub(crate) fn open_with(
        storage: &'s S,
        id: &Identifier,
        has_leaf_values: bool,
    ) -> Result<Self, BTreeError> {
        let header: TreeHeader = storage
            .fetch(id)?
            .ok_or_else(|| BTreeError::MissingTree(id.clone()))?;
        if header.has_leaf_values != has_leaf_values {
            return Err(BTreeError::Corrupted(format!(
                "tree {id} has_leaf_values is {}, expected {has_leaf_values}",
                header.has_leaf_values
            )));
        }
        let tree = Self {
            storage,
            header,
            _marker: PhantomData,
        };
        if let Some(root) = &tree.header.root_id {
            tree.load(root)?;
        }
        Ok(tree)
    }

    #[must_use]
    pub const fn id(&self) -> &Identifier {
        &self.header.id
    }

    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.header.page_size
    }

    #[must_use]
    pub const fn root_id(&self) -> Option<&Identifier> {
        self.header.root_id.as_ref()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.header.root_id.is_none()
    }

    /// A cursor positioned before the first element in `direction`.
    #[must_use]
    pub fn cursor(&self, direction: Direction) -> Cursor<'s, S, K, V> {
        Cursor::new(self.storage, self.header.root_id.clone(), direction)
    }

    /// Look up the value bound to `key`.
    pub fn get(&self, key: &K) -> Result<Option<V>, BTreeError> {
        let Some(leaf) = self.find_leaf(key)? else {
            return Ok(None);
        };
        Ok(leaf.search(key).ok().map(|i| leaf.values[i].clone()))
    }

    pub fn contains(&self, key: &K) -> Result<bool, BTreeError> {
        Ok(self.get(key)?.is_some())
    }

    /// Number of keys, counted along the leaf chain.
    pub fn count(&self) -> Result<usize, BTreeError> {
        let mut cursor = self.cursor(Direction::Forward);
        let mut count = 0;
        while cursor.next()? {
            count += 1;
        }
        Ok(count)
    }

    /// Insert or overwrite the value bound to `key`.
    ///
    /// Returns the previous value if the key was present.
    pub fn insert(&mut self, key: K, value: V) -> Result<Option<V>, BTreeError> {
        let Some(root_id) = self.header.root_id.clone() else {
            let mut leaf = Node::new(&self.header.id);
            leaf.insert_at(0, key, value);
            self.storage.store(&leaf.id, &Page::Leaf(leaf.clone()))?;
            self.set_root(Some(leaf.id))?;
            return Ok(None);
        };

        let (old, split) = self.insert_into(&root_id, key, value)?;
        if let Some(split) = split {
            // Need a new root above the two halves
            let mut root = Node::new(&self.header.id);
            root.insert_at(0, split.left_first, root_id);
            root.insert_at(1, split.separator, split.right);
            self.storage.store(&root.id, &Page::<K, V>::Inner(root.clone()))?;
            tracing::debug!(tree = %self.header.id, root = %root.id, "tree grew a level");
            self.set_root(Some(root.id))?;
        }
        Ok(old)
    }

    fn insert_into(
        &self,
        page_id: &Identifier,
        key: K,
        value: V,
    ) -> Result<(Option<V>, Option<Split<K>>), BTreeError> {
        match self.load(page_id)? {
            Page::Leaf(mut leaf) => {
                let index = match leaf.search(&key) {
                    Ok(index) => {
                        let old = std::mem::replace(&mut leaf.values[index], value);
                        self.store_leaf(&leaf)?;
                        return Ok((Some(old), None));
                    }
                    Err(index) => index,
                };
                leaf.insert_at(index, key, value);
                if leaf.size() <= self.page_size() {
                    self.store_leaf(&leaf)?;
                    return Ok((None, None));
                }
                Ok((None, Some(self.split_leaf(leaf)?)))
            }
            Page::Inner(mut inner) => {
                // A new smallest key lowers the first bound on the way down.
                let lowered = inner.keys.first().is_some_and(|first| key < *first);
                if lowered {
                    inner.keys[0] = key.clone();
                }
                let index = inner.child_index(&key);
                let (old, split) = self.insert_into(&inner.values[index], key, value)?;
                let Some(split) = split else {
                    if lowered {
                        self.store_inner(&inner)?;
                    }
                    return Ok((old, None));
                };
                inner.insert_at(index + 1, split.separator, split.right);
                if inner.size() <= self.page_size() {
                    self.store_inner(&inner)?;
                    return Ok((old, None));
                }
                Ok((old, Some(self.split_inner(inner)?)))
            }
        }
    }

    fn split_leaf(&self, mut left: Node<K, V>) -> Result<Split<K>, BTreeError> {
        let mut right = left.split_off();
        right.previous = Some(left.id.clone());
        right.next = left.next.take();
        left.next = Some(right.id.clone());
        if let Some(next_id) = &right.next {
            let mut next = self.load_leaf(next_id)?;
            next.previous = Some(right.id.clone());
            self.store_leaf(&next)?;
        }
        self.store_leaf(&right)?;
        self.store_leaf(&left)?;
        tracing::debug!(tree = %self.header.id, left = %left.id, right = %right.id, "split leaf");

        let (Some(left_first), Some(separator)) = (left.first_key(), right.first_key()) else {
            return Err(BTreeError::Corrupted(format!("split of leaf {} left it empty", left.id)));
        };
        Ok(Split {
            left_first: left_first.clone(),
            separator: separator.clone(),
            right: right.id,
        })
    }

    fn split_inner(&self, mut left: Node<K, Identifier>) -> Result<Split<K>, BTreeError> {
        let right = left.split_off();
        self.store_inner(&right)?;
        self.store_inner(&left)?;
        tracing::debug!(tree = %self.header.id, left = %left.id, right = %right.id, "split inner page");

        let (Some(left_first), Some(separator)) = (left.first_key(), right.first_key()) else {
            return Err(BTreeError::Corrupted(format!("split of page {} left it empty", left.id)));
        };
        Ok(Split {
            left_first: left_first.clone(),
            separator: separator.clone(),
            right: right.id,
        })
    }

    /// Remove the binding for `key`. Removing an absent key does nothing.
    ///
    /// Returns the removed value.
    pub fn remove(&mut self, key: &K) -> Result<Option<V>, BTreeError> {
        let Some(root_id) = self.header.root_id.clone() else {
            return Ok(None);
        };
        let (old, size) = self.remove_from(&root_id, key)?;
        if old.is_some() && size <= 1 {
            self.shrink_root()?;
        }
        Ok(old)
    }

    /// Returns the removed value and the page's size afterwards.
    fn remove_from(&self, page_id: &Identifier, key: &K) -> Result<(Option<V>, usize), BTreeError> {
        match self.load(page_id)? {
            Page::Leaf(mut leaf) => {
                let Ok(index) = leaf.search(key) else {
                    return Ok((None, leaf.size()));
                };
                let (_, old) = leaf.remove_at(index);
                self.store_leaf(&leaf)?;
                Ok((Some(old), leaf.size()))
            }
            Page::Inner(mut inner) => {
                let index = inner.child_index(key);
                let (old, child_size) = self.remove_from(&inner.values[index], key)?;
                if old.is_some() && child_size < self.min_size() {
                    self.rebalance(&mut inner, index)?;
                    self.store_inner(&inner)?;
                }
                Ok((old, inner.size()))
            }
        }
    }

    const fn min_size(&self) -> usize {
        self.header.page_size / 2
    }

    /// Fix the underflowing child at `index`: merge it with its right
    /// sibling if they fit in one page, else with its left sibling, else
    /// share entries with a sibling.
    fn rebalance(&self, parent: &mut Node<K, Identifier>, index: usize) -> Result<(), BTreeError> {
        if parent.size() == 1 {
            // Only child: it can only be dropped once empty.
            if self.load(&parent.values[0])?.is_empty_page() {
                let (_, child) = parent.remove_at(0);
                self.drop_page(&child)?;
            }
            return Ok(());
        }

        let child_size = self.load(&parent.values[index])?.size();
        if index + 1 < parent.size() {
            let right_size = self.load(&parent.values[index + 1])?.size();
            if child_size + right_size <= self.page_size() {
                return self.merge(parent, index);
            }
        }
        if index > 0 {
            let left_size = self.load(&parent.values[index - 1])?.size();
            if left_size + child_size <= self.page_size() {
                return self.merge(parent, index - 1);
            }
        }
        if index + 1 < parent.size() {
            self.redistribute(parent, index)
        } else {
            self.redistribute(parent, index - 1)
        }
    }

    /// Merge the child at `left + 1` into the child at `left`.
    fn merge(&self, parent: &mut Node<K, Identifier>, left: usize) -> Result<(), BTreeError> {
        let left_id = parent.values[left].clone();
        let right_id = parent.values[left + 1].clone();
        match (self.load(&left_id)?, self.load(&right_id)?) {
            (Page::Leaf(mut into), Page::Leaf(mut from)) => {
                into.append(&mut from);
                into.next = from.next.take();
                if let Some(next_id) = &into.next {
                    let mut next = self.load_leaf(next_id)?;
                    next.previous = Some(into.id.clone());
                    self.store_leaf(&next)?;
                }
                self.store_leaf(&into)?;
            }
            (Page::Inner(mut into), Page::Inner(mut from)) => {
                into.append(&mut from);
                self.store_inner(&into)?;
            }
            _ => {
                return Err(BTreeError::Corrupted(format!(
                    "siblings {left_id} and {right_id} are on different levels"
                )));
            }
        }
        self.storage.delete(&right_id)?;
        // The merged page keeps the left page's lower bound.
        parent.remove_at(left + 1);
        tracing::debug!(tree = %self.header.id, into = %left_id, from = %right_id, "merged pages");
        Ok(())
    }

    /// Even out the entries of the children at `left` and `left + 1`.
    fn redistribute(&self, parent: &mut Node<K, Identifier>, left: usize) -> Result<(), BTreeError> {
        let left_id = parent.values[left].clone();
        let right_id = parent.values[left + 1].clone();
        match (self.load(&left_id)?, self.load(&right_id)?) {
            (Page::Leaf(mut a), Page::Leaf(mut b)) => {
                Self::rebalance_pair(&mut a, &mut b);
                let Some(separator) = b.first_key() else {
                    return Err(BTreeError::Corrupted(format!("page {right_id} emptied")));
                };
                parent.keys[left + 1] = separator.clone();
                self.store_leaf(&a)?;
                self.store_leaf(&b)?;
            }
            (Page::Inner(mut a), Page::Inner(mut b)) => {
                Self::rebalance_pair(&mut a, &mut b);
                let Some(separator) = b.first_key() else {
                    return Err(BTreeError::Corrupted(format!("page {right_id} emptied")));
                };
                parent.keys[left + 1] = separator.clone();
                self.store_inner(&a)?;
                self.store_inner(&b)?;
            }
            _ => {
                return Err(BTreeError::Corrupted(format!(
                    "siblings {left_id} and {right_id} are on different levels"
                )));
            }
        }
        tracing::debug!(tree = %self.header.id, left = %left_id, right = %right_id, "redistributed pages");
        Ok(())
    }

    fn rebalance_pair<P>(left: &mut Node<K, P>, right: &mut Node<K, P>) {
        let total = left.size() + right.size();
        left.append(right);
        let at = total / 2;
        right.keys = left.keys.split_off(at);
        right.values = left.values.split_off(at);
    }

    /// Drop an empty leaf root and collapse inner roots with one child.
    fn shrink_root(&mut self) -> Result<(), BTreeError> {
        while let Some(root_id) = self.header.root_id.clone() {
            match self.load(&root_id)? {
                Page::Leaf(leaf) if leaf.is_empty() => {
                    self.storage.delete(&root_id)?;
                    self.set_root(None)?;
                }
                Page::Inner(inner) if inner.size() <= 1 => {
                    let child = inner.values.first().cloned();
                    self.storage.delete(&root_id)?;
                    self.set_root(child)?;
                    tracing::debug!(tree = %self.header.id, "tree lost a level");
                }
                _ => break,
            }
        }
        Ok(())
    }

    /// Delete an emptied page, unlinking it first if it is a leaf.
    fn drop_page(&self, page_id: &Identifier) -> Result<(), BTreeError> {
        if let Page::Leaf(leaf) = self.load(page_id)? {
            if let Some(previous_id) = &leaf.previous {
                let mut previous = self.load_leaf(previous_id)?;
                previous.next.clone_from(&leaf.next);
                self.store_leaf(&previous)?;
            }
            if let Some(next_id) = &leaf.next {
                let mut next = self.load_leaf(next_id)?;
                next.previous.clone_from(&leaf.previous);
                self.store_leaf(&next)?;
            }
        }
        self.storage.delete(page_id)?;
        Ok(())
    }

    /// Render every page, one per line, indented by depth.
    pub fn dump(&self) -> Result<String, BTreeError> {
        let mut lines = vec![format!(
            "tree {} (page size {})",
            self.header.id, self.header.page_size
        )];
        if let Some(root) = &self.header.root_id {
            self.dump_page(root, 1, &mut lines)?;
        }
        Ok(lines.join("\n"))
    }

    fn dump_page(&self, page_id: &Identifier, depth: usize, lines: &mut Vec<String>) -> Result<(), BTreeError> {
        let indent = "  ".repeat(depth);
        match self.load(page_id)? {
            Page::Leaf(leaf) => {
                lines.push(format!("{indent}leaf {} {:?}", leaf.id, leaf.keys));
            }
            Page::Inner(inner) => {
                lines.push(format!("{indent}inner {} {:?}", inner.id, inner.keys));
                for child in &inner.values {
                    self.dump_page(child, depth + 1, lines)?;
                }
            }
        }
        Ok(())
    }

    /// Walk every page and check ordering, fill, routing bounds and leaf
    /// links.
    pub fn verify(&self) -> Result<TreeStats, BTreeError> {
        let Some(root) = &self.header.root_id else {
            return Ok(TreeStats::default());
        };
        let mut walk = Walk {
            stats: TreeStats::default(),
            leaf_depth: None,
            leaves: Vec::new(),
        };
        self.verify_page(root, 1, None, None, &mut walk)?;

        for (i, leaf) in walk.leaves.iter().enumerate() {
            let expected_previous = i.checked_sub(1).map(|p| &walk.leaves[p].0);
            let expected_next = walk.leaves.get(i + 1).map(|n| &n.0);
            if leaf.1.as_ref() != expected_previous || leaf.2.as_ref() != expected_next {
                return Err(BTreeError::Corrupted(format!("leaf {} is mislinked", leaf.0)));
            }
        }
        Ok(walk.stats)
    }

    fn verify_page(
        &self,
        page_id: &Identifier,
        depth: usize,
        lower: Option<&K>,
        upper: Option<&K>,
        walk: &mut Walk,
    ) -> Result<(), BTreeError> {
        let page = self.load(page_id)?;
        let is_root = depth == 1;
        let size = page.size();
        if size > self.page_size() || (!is_root && size < self.min_size()) {
            return Err(BTreeError::Corrupted(format!("page {page_id} holds {size} entries")));
        }
        walk.stats.pages += 1;
        walk.stats.depth = walk.stats.depth.max(depth);

        match page {
            Page::Leaf(leaf) => {
                if is_root && leaf.is_empty() {
                    return Err(BTreeError::Corrupted(format!("empty root leaf {page_id}")));
                }
                check_keys(page_id, &leaf.keys, lower, upper)?;
                if *walk.leaf_depth.get_or_insert(depth) != depth {
                    return Err(BTreeError::Corrupted(format!("leaf {page_id} at uneven depth")));
                }
                walk.stats.keys += leaf.size();
                walk.leaves.push((leaf.id, leaf.previous, leaf.next));
            }
            Page::Inner(inner) => {
                if is_root && inner.size() < 2 {
                    return Err(BTreeError::Corrupted(format!("root {page_id} has one child")));
                }
                check_keys(page_id, &inner.keys, lower, upper)?;
                for (i, child) in inner.values.iter().enumerate() {
                    let child_upper = inner.keys.get(i + 1).or(upper);
                    self.verify_page(child, depth + 1, Some(&inner.keys[i]), child_upper, walk)?;
                }
            }
        }
        Ok(())
    }

    /// Delete every page and the tree itself.
    pub fn delete(self) -> Result<(), BTreeError> {
        self.storage.delete_entity(&self.header)?;
        tracing::debug!(tree = %self.header.id, "deleted tree");
        Ok(())
    }

    fn find_leaf(&self, key: &K) -> Result<Option<Node<K, V>>, BTreeError> {
        let Some(mut page_id) = self.header.root_id.clone() else {
            return Ok(None);
        };
        loop {
            match self.load(&page_id)? {
                Page::Leaf(leaf) => return Ok(Some(leaf)),
                Page::Inner(inner) => page_id = inner.values[inner.child_index(key)].clone(),
            }
        }
    }

    fn set_root(&mut self, root_id: Option<Identifier>) -> Result<(), BTreeError> {
        self.header.root_id = root_id;
        self.storage.store_entity(&self.header)?;
        Ok(())
    }

    fn load(&self, page_id: &Identifier) -> Result<Page<K, V>, BTreeError> {
        load_page(self.storage, page_id)
    }

    fn load_leaf(&self, page_id: &Identifier) -> Result<Node<K, V>, BTreeError> {
        match self.load(page_id)? {
            Page::Leaf(leaf) => Ok(leaf),
            Page::Inner(_) => Err(BTreeError::Corrupted(format!("page {page_id} is not a leaf"))),
        }
    }

    fn store_leaf(&self, leaf: &Node<K, V>) -> Result<(), BTreeError> {
        self.storage.store(&leaf.id, &Page::Leaf(leaf.clone()))?;
        Ok(())
    }

    fn store_inner(&self, inner: &Node<K, Identifier>) -> Result<(), BTreeError> {
        self.storage.store(&inner.id, &Page::<K, V>::Inner(inner.clone()))?;
        Ok(())
    }
}

impl<S: EntityStorage, K, V> std::fmt::Debug for BPlusTree<'_, S, K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BPlusTree")
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

impl<K, V> Page<K, V> {
    fn size(&self) -> usize {
        match self {
            Self::Leaf(node) => node.keys.len(),
            Self::Inner(node) => node.keys.len(),
        }
    }

    fn is_empty_page(&self) -> bool {
        self.size() == 0
    }
}

struct Walk {
    stats: TreeStats,
    leaf_depth: Option<usize>,
    /// Leaves in key order with their `previous` and `next` links.
    leaves: Vec<(Identifier, Option<Identifier>, Option<Identifier>)>,
}

fn check_keys<K: TreeKey>(
    page_id: &Identifier,
    keys: &[K],
    lower: Option<&K>,
    upper: Option<&K>,
) -> Result<(), BTreeError> {
    if keys.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(BTreeError::Corrupted(format!("keys of page {page_id} are out of order")));
    }
    let below = |key: &K| lower.is_some_and(|lower| key < lower);
    let above = |key: &K| upper.is_some_and(|upper| key >= upper);
    if keys.iter().any(|key| below(key) || above(key)) {
        return Err(BTreeError::Corrupted(format!("page {page_id} has keys outside its bounds")));
    }
    Ok(())
}

/// Load a page, failing if it is missing.
pub(crate) fn load_page<S: EntityStorage, K: TreeKey, V: TreeValue>(
    storage: &S,
    page_id: &Identifier,
) -> Result<Page<K, V>, BTreeError> {
    storage
        .fetch(page_id)?
        .ok_or_else(|| BTreeError::MissingPage(page_id.clone()))
}

/// Errors that can occur during B-tree operations.
#[derive(Debug)]
pub enum BTreeError {
    /// The underlying storage failed.
    Storage(StorageError),
    /// Page sizes must be even and positive.
    InvalidPageSize(usize),
    /// A page referenced by the tree does not exist.
    MissingPage(Identifier),
    /// The tree's structure violates an invariant.
    Corrupted(String),
    /// No tree is stored under the identifier.
    MissingTree(Identifier),
}

impl BTreeError {
    /// Whether the error indicates damaged persisted state.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_corruption(),
            Self::MissingPage(_) | Self::Corrupted(_) => true,
            Self::InvalidPageSize(_) | Self::MissingTree(_) => false,
        }
    }
}

impl std::fmt::Display for BTreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::InvalidPageSize(size) => {
                write!(f, "invalid page size {size}: must be even and positive")
            }
            Self::MissingPage(id) => write!(f, "missing page: {id}"),
            Self::Corrupted(message) => write!(f, "corrupted tree: {message}"),
            Self::MissingTree(id) => write!(f, "no tree stored at {id}"),
        }
    }
}

impl std::error::Error for BTreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for BTreeError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::storage::memory::MemoryStorage;
    use crate::storage::object::{ObjectSession, ObjectStore};
    use crate::storage::session::SessionMode;
    use crate::testing::new_memory_system;

    fn objects() -> (Arc<MemoryStorage>, ObjectSession) {
        let raw = Arc::new(MemoryStorage::new());
        let session = ObjectStore::new(raw.clone(), 1000).connect();
        (raw, session)
    }

    fn forward_keys<S: EntityStorage>(tree: &BPlusTree<'_, S, u32, u32>) -> Vec<u32> {
        let mut cursor = tree.cursor(Direction::Forward);
        let mut keys = Vec::new();
        while let Some((key, _)) = cursor.next_entry().expect("next") {
            keys.push(key);
        }
        keys
    }

    fn reverse_keys<S: EntityStorage>(tree: &BPlusTree<'_, S, u32, u32>) -> Vec<u32> {
        let mut cursor = tree.cursor(Direction::Reverse);
        let mut keys = Vec::new();
        while let Some((key, _)) = cursor.next_entry().expect("next") {
            keys.push(key);
        }
        keys
    }

    fn find<S: EntityStorage>(tree: &BPlusTree<'_, S, u32, u32>, key: u32) -> Option<u32> {
        tree.cursor(Direction::Forward).find(&key).expect("find")
    }

    #[test]
    fn test_insert_get_overwrite() {
        let (_raw, session) = objects();
        let mut tree = BPlusTree::create(&session, Identifier::unique(), 4).expect("create");
        assert!(tree.is_empty());
        assert_eq!(tree.get(&1).expect("get"), None);

        assert_eq!(tree.insert(1, 10).expect("insert"), None);
        assert_eq!(tree.insert(2, 20).expect("insert"), None);
        assert_eq!(tree.get(&1).expect("get"), Some(10));

        assert_eq!(tree.insert(1, 11).expect("overwrite"), Some(10));
        assert_eq!(tree.get(&1).expect("get"), Some(11));
        assert_eq!(tree.count().expect("count"), 2);
        assert!(!tree.is_empty());
    }

    #[test]
    fn test_odd_page_size_rejected() {
        let (_raw, session) = objects();
        let result = BPlusTree::<_, u32, u32>::create(&session, Identifier::unique(), 7);
        assert!(matches!(result, Err(BTreeError::InvalidPageSize(7))));
        let result = BPlusTree::<_, u32, u32>::create(&session, Identifier::unique(), 0);
        assert!(matches!(result, Err(BTreeError::InvalidPageSize(0))));
    }

    #[test]
    fn test_increasing_inserts_with_small_pages() {
        let (_raw, session) = objects();
        let mut tree = BPlusTree::create(&session, Identifier::unique(), 4).expect("create");

        for i in 0..100u32 {
            tree.insert(i, i * 2).expect("insert");
            for j in 0..=i {
                assert_eq!(find(&tree, j), Some(j * 2), "missing {j} after inserting {i}");
            }
            let expected: Vec<u32> = (0..=i).collect();
            assert_eq!(forward_keys(&tree), expected);
            let reversed: Vec<u32> = (0..=i).rev().collect();
            assert_eq!(reverse_keys(&tree), reversed);
            tree.verify().expect("verify");
        }

        let stats = tree.verify().expect("verify");
        assert_eq!(stats.keys, 100);
        assert!(stats.depth >= 3);
    }

    #[test]
    fn test_increasing_removes_with_small_pages() {
        let (raw, session) = objects();
        let mut tree = BPlusTree::create(&session, Identifier::unique(), 4).expect("create");
        for i in 0..100u32 {
            tree.insert(i, i).expect("insert");
        }

        for i in 0..100u32 {
            assert_eq!(tree.remove(&i).expect("remove"), Some(i));
            for j in 0..=i {
                assert_eq!(find(&tree, j), None, "{j} still present after removing {i}");
            }
            for j in i + 1..100 {
                assert_eq!(find(&tree, j), Some(j), "{j} lost after removing {i}");
            }
            tree.verify().expect("verify");
        }

        assert!(tree.is_empty());
        assert_eq!(tree.count().expect("count"), 0);
        // Only the header is left.
        assert_eq!(raw.keys_under(tree.id()).expect("keys"), vec![tree.id().clone()]);
    }

    #[test]
    fn test_sequential_keys_stay_reachable() {
        let (_raw, session) = objects();
        let mut tree = BPlusTree::create(&session, Identifier::unique(), 4).expect("create");
        for i in 0..24u32 {
            tree.insert(i, i).expect("insert");
        }
        for i in 0..24u32 {
            assert_eq!(tree.get(&i).expect("get"), Some(i), "get {i}");
            assert_eq!(find(&tree, i), Some(i), "find {i}");
        }

        let root = tree.root_id().cloned().expect("root");
        let Page::<u32, u32>::Inner(root) = load_page(&session, &root).expect("load root") else {
            panic!("root should be an inner page");
        };
        assert!(root.keys.windows(2).all(|pair| pair[0] < pair[1]), "{:?}", root.keys);
        assert_eq!(root.keys[0], 0);
        tree.verify().expect("verify");
    }

    #[test]
    fn test_dump_lists_every_page() {
        let (_raw, session) = objects();
        let mut tree = BPlusTree::create(&session, Identifier::unique(), 4).expect("create");
        for i in 0..6u32 {
            tree.insert(i, i).expect("insert");
        }
        let dump = tree.dump().expect("dump");
        let lines: Vec<&str> = dump.lines().collect();
        assert!(lines[0].starts_with("tree "), "{dump}");
        assert!(lines[1].starts_with("  inner "), "{dump}");
        assert!(lines.len() > 3, "{dump}");
        assert!(lines[2..].iter().all(|line| line.starts_with("    leaf ")), "{dump}");
    }

    #[test]
    fn test_decreasing_inserts_lower_first_bounds() {
        let (_raw, session) = objects();
        let mut tree = BPlusTree::create(&session, Identifier::unique(), 4).expect("create");
        for i in (0..60u32).rev() {
            tree.insert(i, i).expect("insert");
            tree.verify().expect("verify");
        }
        for i in 0..60u32 {
            assert_eq!(tree.get(&i).expect("get"), Some(i));
        }
        assert_eq!(forward_keys(&tree), (0..60).collect::<Vec<_>>());
    }

    #[test]
    fn test_verify_rejects_unordered_inner_keys() {
        let (_raw, session) = objects();
        let mut tree = BPlusTree::create(&session, Identifier::unique(), 4).expect("create");
        for i in 0..30u32 {
            tree.insert(i, i).expect("insert");
        }
        let root_id = tree.root_id().cloned().expect("root");
        let Page::<u32, u32>::Inner(mut root) = load_page(&session, &root_id).expect("load root") else {
            panic!("root should be an inner page");
        };
        let last = root.keys.len() - 1;
        root.keys[last] = 1;
        session
            .store(&root_id, &Page::<u32, u32>::Inner(root))
            .expect("store corrupted root");

        let error = tree.verify().expect_err("unordered keys");
        assert!(matches!(error, BTreeError::Corrupted(_)));
    }

    #[test]
    fn test_remove_absent_key_is_noop() {
        let (_raw, session) = objects();
        let mut tree = BPlusTree::create(&session, Identifier::unique(), 4).expect("create");
        assert_eq!(tree.remove(&5).expect("remove"), None);
        for i in 0..10u32 {
            tree.insert(i * 2, i).expect("insert");
        }
        assert_eq!(tree.remove(&5).expect("remove"), None);
        assert_eq!(tree.count().expect("count"), 10);
    }

    #[test]
    fn test_random_operations_match_btreemap() {
        let (_raw, session) = objects();
        let mut tree = BPlusTree::create(&session, Identifier::unique(), 6).expect("create");
        let mut expected = BTreeMap::new();
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for step in 0..3000 {
            let key = rng.random_range(0..400u32);
            if rng.random_range(0..3) == 0 {
                assert_eq!(tree.remove(&key).expect("remove"), expected.remove(&key));
            } else {
                let value = rng.random_range(0..1_000_000u32);
                assert_eq!(tree.insert(key, value).expect("insert"), expected.insert(key, value));
            }
            if step % 100 == 0 {
                let stats = tree.verify().expect("verify");
                assert_eq!(stats.keys, expected.len());
            }
        }

        let stats = tree.verify().expect("verify");
        assert_eq!(stats.keys, expected.len());
        assert_eq!(forward_keys(&tree), expected.keys().copied().collect::<Vec<_>>());
        assert_eq!(reverse_keys(&tree), expected.keys().rev().copied().collect::<Vec<_>>());
        for (key, value) in &expected {
            assert_eq!(tree.get(key).expect("get"), Some(*value));
        }
    }

    #[test]
    fn test_page_size_two() {
        let (_raw, session) = objects();
        let mut tree = BPlusTree::create(&session, Identifier::unique(), 2).expect("create");
        for i in 0..40u32 {
            tree.insert(i, i).expect("insert");
            tree.verify().expect("verify");
        }
        for i in (0..40u32).rev() {
            tree.remove(&i).expect("remove");
            tree.verify().expect("verify");
        }
        assert!(tree.is_empty());
    }

    #[test]
    fn test_cursor_to() {
        let (_raw, session) = objects();
        let mut tree = BPlusTree::create(&session, Identifier::unique(), 4).expect("create");
        for i in 1..=10u32 {
            tree.insert(i * 10, i).expect("insert");
        }

        let mut forward = tree.cursor(Direction::Forward);
        assert!(forward.to(&25).expect("to"));
        assert_eq!(forward.key(), Some(&30));
        assert!(forward.next().expect("next"));
        assert_eq!(forward.key(), Some(&40));
        assert!(forward.to(&30).expect("to"));
        assert_eq!(forward.value(), Some(&3));
        assert!(!forward.to(&101).expect("to"));
        assert_eq!(forward.key(), None);

        let mut reverse = tree.cursor(Direction::Reverse);
        assert!(reverse.to(&25).expect("to"));
        assert_eq!(reverse.key(), Some(&20));
        assert!(reverse.next().expect("next"));
        assert_eq!(reverse.key(), Some(&10));
        assert!(!reverse.next().expect("next"));
        assert!(reverse.to(&1000).expect("to"));
        assert_eq!(reverse.key(), Some(&100));
        assert!(!reverse.to(&5).expect("to"));
    }

    #[test]
    fn test_optional_keys_sort_none_first() {
        let (_raw, session) = objects();
        let mut tree = BPlusTree::create(&session, Identifier::unique(), 4).expect("create");
        tree.insert(Some(2u32), "two".to_string()).expect("insert");
        tree.insert(None, "none".to_string()).expect("insert");
        tree.insert(Some(1u32), "one".to_string()).expect("insert");

        let mut cursor = tree.cursor(Direction::Forward);
        assert_eq!(
            cursor.next_entry().expect("next"),
            Some((None, "none".to_string()))
        );
        assert_eq!(tree.get(&None).expect("get"), Some("none".to_string()));
    }

    #[test]
    fn test_open_and_delete() {
        let (raw, session) = objects();
        let id = Identifier::new("indexes/by-name").expect("id");
        {
            let mut tree = BPlusTree::create(&session, id.clone(), 4).expect("create");
            for i in 0..50u32 {
                tree.insert(i, i + 1).expect("insert");
            }
        }

        let tree = BPlusTree::<_, u32, u32>::open(&session, &id).expect("open");
        assert_eq!(tree.page_size(), 4);
        assert_eq!(tree.get(&49).expect("get"), Some(50));
        assert!(tree.dump().expect("dump").contains("leaf"));

        tree.delete().expect("delete");
        assert!(raw.keys_under(&id).expect("keys").is_empty());
        assert!(matches!(
            BPlusTree::<_, u32, u32>::open(&session, &id),
            Err(BTreeError::MissingTree(_))
        ));
    }

    #[test]
    fn test_missing_page_is_corruption() {
        let (_raw, session) = objects();
        let mut tree = BPlusTree::create(&session, Identifier::unique(), 4).expect("create");
        tree.insert(1u32, 1u32).expect("insert");
        let root = tree.root_id().cloned().expect("root");
        session.delete(&root).expect("delete page");

        let error = tree.get(&1).expect_err("missing root");
        assert!(matches!(error, BTreeError::MissingPage(_)));
        assert!(error.is_corruption());
    }

    #[test]
    fn test_tree_in_versioned_sessions() {
        let system = new_memory_system();
        let id = Identifier::new("indexes/numbers").expect("id");

        let writer = system.begin_session(SessionMode::ReadWrite).expect("begin");
        {
            let mut tree = BPlusTree::create(&*writer, id.clone(), 4).expect("create");
            for i in 0..50u32 {
                tree.insert(i, i).expect("insert");
            }
        }
        writer.commit().expect("commit");

        let before = system.begin_session(SessionMode::ReadOnly).expect("begin");
        let remover = system.begin_session(SessionMode::ReadWrite).expect("begin");
        {
            let mut tree = BPlusTree::<_, u32, u32>::open(&*remover, &id).expect("open");
            for i in (0..50u32).step_by(2) {
                tree.remove(&i).expect("remove");
            }
            tree.verify().expect("verify");
        }
        remover.commit().expect("commit");

        let old = BPlusTree::<_, u32, u32>::open(&*before, &id).expect("open");
        assert_eq!(old.verify().expect("verify").keys, 50);
        assert_eq!(old.get(&10).expect("get"), Some(10));

        let after = system.begin_session(SessionMode::ReadOnly).expect("begin");
        let new = BPlusTree::<_, u32, u32>::open(&*after, &id).expect("open");
        assert_eq!(new.verify().expect("verify").keys, 25);
        assert_eq!(new.get(&10).expect("get"), None);
        assert_eq!(new.get(&11).expect("get"), Some(11));

        before.close().expect("close");
        after.close().expect("close");
    }
}
