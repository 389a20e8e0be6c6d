//! Cursors over the leaf chain.
//!
//! A cursor starts before the first element of its direction. Moving within
//! a leaf is free; crossing to a neighbouring leaf loads that one page.
//! Pages are read as they are when the cursor reaches them, so a cursor
//! kept across modifications of its tree may skip or repeat entries.

use crate::storage::btree::node::{Node, Page, TreeKey, TreeValue};
use crate::storage::btree::tree::{BTreeError, load_page};
use crate::storage::object::EntityStorage;
use crate::types::Identifier;

/// Order in which a cursor visits keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Ascending keys.
    Forward,
    /// Descending keys.
    Reverse,
}

enum Position<K, V> {
    Unpositioned,
    At { leaf: Node<K, V>, index: usize },
    Exhausted,
}

/// A position in a tree's key order.
pub struct Cursor<'s, S, K, V> {
    storage: &'s S,
    root_id: Option<Identifier>,
    direction: Direction,
    position: Position<K, V>,
}

impl<'s, S: EntityStorage, K: TreeKey, V: TreeValue> Cursor<'s, S, K, V> {
    pub(crate) const fn new(storage: &'s S, root_id: Option<Identifier>, direction: Direction) -> Self {
        Self {
            storage,
            root_id,
            direction,
            position: Position::Unpositioned,
        }
    }

    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Move to the first element in the cursor's direction.
    ///
    /// Returns `false` if the tree is empty.
    pub fn first(&mut self) -> Result<bool, BTreeError> {
        let Some(mut page_id) = self.root_id.clone() else {
            self.position = Position::Exhausted;
            return Ok(false);
        };
        loop {
            match self.load(&page_id)? {
                Page::Inner(inner) => {
                    let child = match self.direction {
                        Direction::Forward => inner.values.first(),
                        Direction::Reverse => inner.values.last(),
                    };
                    page_id = child
                        .ok_or_else(|| BTreeError::Corrupted(format!("inner page {page_id} is empty")))?
                        .clone();
                }
                Page::Leaf(leaf) => {
                    return match self.direction {
                        Direction::Forward => self.forward_from(leaf, 0),
                        Direction::Reverse => {
                            let index = leaf.size().checked_sub(1);
                            self.backward_from(leaf, index)
                        }
                    };
                }
            }
        }
    }

    /// Advance one element. An unpositioned cursor moves to the first one.
    ///
    /// Returns `false` once the cursor has passed the last element.
    pub fn next(&mut self) -> Result<bool, BTreeError> {
        match std::mem::replace(&mut self.position, Position::Exhausted) {
            Position::Unpositioned => self.first(),
            Position::Exhausted => Ok(false),
            Position::At { leaf, index } => match self.direction {
                Direction::Forward => self.forward_from(leaf, index + 1),
                Direction::Reverse => self.backward_from(leaf, index.checked_sub(1)),
            },
        }
    }

    /// Move to the first key `>= key` going forward, or the last key
    /// `<= key` going in reverse.
    ///
    /// Returns `false` if there is no such key.
    pub fn to(&mut self, key: &K) -> Result<bool, BTreeError> {
        let Some(mut page_id) = self.root_id.clone() else {
            self.position = Position::Exhausted;
            return Ok(false);
        };
        let leaf = loop {
            match self.load(&page_id)? {
                Page::Inner(inner) => page_id = inner.values[inner.child_index(key)].clone(),
                Page::Leaf(leaf) => break leaf,
            }
        };
        match self.direction {
            Direction::Forward => {
                let index = leaf.lower_bound(key);
                self.forward_from(leaf, index)
            }
            Direction::Reverse => {
                let index = leaf.upper_bound(key).checked_sub(1);
                self.backward_from(leaf, index)
            }
        }
    }

    /// Exact-match lookup. Leaves the cursor at the nearest key.
    pub fn find(&mut self, key: &K) -> Result<Option<V>, BTreeError> {
        if !self.to(key)? || self.key() != Some(key) {
            return Ok(None);
        }
        Ok(self.value().cloned())
    }

    /// The key at the cursor, if it is on an element.
    #[must_use]
    pub fn key(&self) -> Option<&K> {
        match &self.position {
            Position::At { leaf, index } => leaf.keys.get(*index),
            _ => None,
        }
    }

    /// The value at the cursor, if it is on an element.
    #[must_use]
    pub fn value(&self) -> Option<&V> {
        match &self.position {
            Position::At { leaf, index } => leaf.values.get(*index),
            _ => None,
        }
    }

    /// Advance and return the element reached.
    pub fn next_entry(&mut self) -> Result<Option<(K, V)>, BTreeError> {
        if !self.next()? {
            return Ok(None);
        }
        Ok(self.key().cloned().zip(self.value().cloned()))
    }

    fn forward_from(&mut self, mut leaf: Node<K, V>, index: usize) -> Result<bool, BTreeError> {
        let mut index = index;
        while index >= leaf.size() {
            let Some(next) = leaf.next.clone() else {
                self.position = Position::Exhausted;
                return Ok(false);
            };
            leaf = self.load_leaf(&next)?;
            index = 0;
        }
        self.position = Position::At { leaf, index };
        Ok(true)
    }

    fn backward_from(&mut self, mut leaf: Node<K, V>, index: Option<usize>) -> Result<bool, BTreeError> {
        let mut index = index;
        loop {
            if let Some(i) = index.filter(|&i| i < leaf.size()) {
                self.position = Position::At { leaf, index: i };
                return Ok(true);
            }
            let Some(previous) = leaf.previous.clone() else {
                self.position = Position::Exhausted;
                return Ok(false);
            };
            leaf = self.load_leaf(&previous)?;
            index = leaf.size().checked_sub(1);
        }
    }

    fn load(&self, page_id: &Identifier) -> Result<Page<K, V>, BTreeError> {
        load_page(self.storage, page_id)
    }

    fn load_leaf(&self, page_id: &Identifier) -> Result<Node<K, V>, BTreeError> {
        match self.load(page_id)? {
            Page::Leaf(leaf) => Ok(leaf),
            Page::Inner(_) => Err(BTreeError::Corrupted(format!(
                "sibling link points at inner page {page_id}"
            ))),
        }
    }
}

impl<S, K, V> std::fmt::Debug for Cursor<'_, S, K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let position = match &self.position {
            Position::Unpositioned => "unpositioned".to_string(),
            Position::At { leaf, index } => format!("{}[{index}]", leaf.id),
            Position::Exhausted => "exhausted".to_string(),
        };
        f.debug_struct("Cursor")
            .field("direction", &self.direction)
            .field("position", &position)
            .finish_non_exhaustive()
    }
}
