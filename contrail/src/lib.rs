//! Embedded, versioned, transactional object storage.
//!
//! Objects are stored under hierarchical [`Identifier`](types::Identifier)s
//! in a raw key/value backend. Every write happens in a
//! [`StorageSession`](storage::StorageSession) that sees a frozen snapshot
//! and becomes visible to later sessions atomically at commit, unless a
//! concurrent commit touched the same objects. Ordered indexes are
//! [`BPlusTree`](storage::btree::BPlusTree)s stored through the same
//! sessions.

pub mod config;
pub mod storage;
pub mod types;

#[cfg(test)]
mod testing;
