//! Persistent B+trees.
//!
//! Trees are stored page by page through any [`EntityStorage`]: a plain
//! object session for unversioned data, or a
//! [`StorageSession`](crate::storage::StorageSession) so that every page
//! write becomes part of a revision.
//!
//! # Structure
//!
//! - A [`TreeHeader`] under the tree's identifier records the root page,
//!   the page size and whether leaves carry values.
//! - Leaf pages store sorted keys and values, doubly linked for cursors.
//! - Inner pages store routing keys and child page identifiers.
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//!
//! use contrail::storage::btree::{BPlusTree, Direction};
//! use contrail::storage::{MemoryStorage, ObjectStore};
//! use contrail::types::Identifier;
//!
//! let objects = ObjectStore::new(Arc::new(MemoryStorage::new()), 100).connect();
//! let mut tree = BPlusTree::create(&objects, Identifier::unique(), 4).unwrap();
//! tree.insert(2u32, "two".to_string()).unwrap();
//! tree.insert(1u32, "one".to_string()).unwrap();
//!
//! let mut cursor = tree.cursor(Direction::Forward);
//! assert_eq!(cursor.next_entry().unwrap(), Some((1, "one".to_string())));
//! ```
//!
//! [`EntityStorage`]: crate::storage::EntityStorage

mod cursor;
mod node;
mod set;
mod tree;

pub use cursor::{Cursor, Direction};
pub use node::{DEFAULT_PAGE_SIZE, Node, Page, TreeHeader, TreeKey, TreeValue, is_valid_page_size};
pub use set::BTree;
pub use tree::{BPlusTree, BTreeError, TreeStats};
