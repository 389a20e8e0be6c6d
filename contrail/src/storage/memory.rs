//! In-memory raw storage.
//!
//! `MemoryStorage` keeps every value in an ordered map behind a mutex. It is
//! the backend used by tests and by embedders that do not need durability.
//! Children are found by a prefix range scan over the ordered keys.
//!
//! Conditional creates that find the identifier occupied block on a
//! condition variable which every `delete` signals, so lock hand-off between
//! threads is immediate rather than polled.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::storage::io::{RawStorage, StorageError};
use crate::types::Identifier;

/// Operation counters, useful for asserting on cache behaviour in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
}

/// Thread-safe in-memory implementation of [`RawStorage`].
///
/// Closing the storage does not discard its contents; a new system can be
/// opened over the same instance to simulate a restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<BTreeMap<String, Vec<u8>>>,
    released: Condvar,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl MemoryStorage {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of identifiers currently holding a value.
    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self.values.lock()?.len())
    }

    /// Whether the store holds no values at all.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.values.lock()?.is_empty())
    }

    /// Every identifier below `prefix` (inclusive), in order.
    pub fn keys_under(&self, prefix: &Identifier) -> Result<Vec<Identifier>, StorageError> {
        let values = self.values.lock()?;
        let descendants = format!("{prefix}/");
        let mut keys = Vec::new();
        if values.contains_key(prefix.as_str()) {
            keys.push(prefix.clone());
        }
        for key in values
            .range(descendants.clone()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(&descendants))
        {
            keys.push(Identifier::new(key)?);
        }
        Ok(keys)
    }

    /// Snapshot of the operation counters.
    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

impl RawStorage for MemoryStorage {
    fn get(&self, id: &Identifier) -> Result<Option<Vec<u8>>, StorageError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.values.lock()?.get(id.as_str()).cloned())
    }

    fn put(&self, id: &Identifier, bytes: &[u8]) -> Result<(), StorageError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.values
            .lock()?
            .insert(id.as_str().to_string(), bytes.to_vec());
        Ok(())
    }

    fn delete(&self, id: &Identifier) -> Result<(), StorageError> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        let removed = self.values.lock()?.remove(id.as_str());
        if removed.is_some() {
            self.released.notify_all();
        }
        Ok(())
    }

    fn list_children(&self, id: &Identifier) -> Result<Vec<Identifier>, StorageError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let values = self.values.lock()?;
        let prefix = format!("{id}/");
        let mut children = Vec::new();
        for key in values
            .range(prefix.clone()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(&prefix))
        {
            if !key[prefix.len()..].contains('/') {
                children.push(Identifier::new(key)?);
            }
        }
        Ok(children)
    }

    fn create_if_absent(
        &self,
        id: &Identifier,
        bytes: &[u8],
        wait: Duration,
    ) -> Result<bool, StorageError> {
        let deadline = Instant::now().checked_add(wait);
        let mut values = self.values.lock()?;
        loop {
            if !values.contains_key(id.as_str()) {
                self.writes.fetch_add(1, Ordering::Relaxed);
                values.insert(id.as_str().to_string(), bytes.to_vec());
                return Ok(true);
            }
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => wait,
            };
            if remaining.is_zero() {
                return Ok(false);
            }
            let (guard, _) = self.released.wait_timeout(values, remaining)?;
            values = guard;
        }
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        self.released.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn id(path: &str) -> Identifier {
        Identifier::new(path).expect("valid identifier")
    }

    #[test]
    fn test_put_get_delete() {
        let storage = MemoryStorage::new();
        let key = id("a/b");
        storage.put(&key, b"hello").expect("put");
        assert_eq!(storage.get(&key).expect("get"), Some(b"hello".to_vec()));
        storage.delete(&key).expect("delete");
        assert_eq!(storage.get(&key).expect("get"), None);
        // Deleting again is fine.
        storage.delete(&key).expect("delete missing");
    }

    #[test]
    fn test_list_children_only_immediate() {
        let storage = MemoryStorage::new();
        for path in ["a/b", "a/c", "a/c/d", "a/b!", "ab/x", "a"] {
            storage.put(&id(path), b"v").expect("put");
        }
        let mut children = storage.list_children(&id("a")).expect("list");
        children.sort();
        assert_eq!(children, vec![id("a/b"), id("a/b!"), id("a/c")]);
    }

    #[test]
    fn test_create_if_absent_fails_fast_when_present() {
        let storage = MemoryStorage::new();
        let key = id("lock");
        assert!(storage.create_if_absent(&key, b"1", Duration::ZERO).expect("create"));
        assert!(!storage.create_if_absent(&key, b"2", Duration::ZERO).expect("create"));
        assert_eq!(storage.get(&key).expect("get"), Some(b"1".to_vec()));
    }

    #[test]
    fn test_create_if_absent_waits_for_delete() {
        let storage = Arc::new(MemoryStorage::new());
        let key = id("lock");
        assert!(storage.create_if_absent(&key, b"1", Duration::ZERO).expect("create"));

        let releaser = {
            let storage = Arc::clone(&storage);
            let key = key.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                storage.delete(&key).expect("delete");
            })
        };

        let created = storage
            .create_if_absent(&key, b"2", Duration::from_secs(5))
            .expect("create");
        releaser.join().expect("join");
        assert!(created);
        assert_eq!(storage.get(&key).expect("get"), Some(b"2".to_vec()));
    }

    #[test]
    fn test_keys_under_and_stats() {
        let storage = MemoryStorage::new();
        storage.put(&id("t"), b"h").expect("put");
        storage.put(&id("t/p1"), b"1").expect("put");
        storage.put(&id("t/p1/x"), b"1").expect("put");
        storage.put(&id("u"), b"1").expect("put");
        let keys = storage.keys_under(&id("t")).expect("keys");
        assert_eq!(keys, vec![id("t"), id("t/p1"), id("t/p1/x")]);
        assert_eq!(storage.stats().writes, 4);
        assert_eq!(storage.len().expect("len"), 4);
    }
}
