//! Directory-tree raw storage.
//!
//! Each identifier segment maps to a directory below the storage root and a
//! value lives in a `~value` file inside its identifier's directory:
//!
//! ```text
//! <root>/contrail/storage/root/revisions/3/~value
//! <root>/contrail/storage/root/revisions/3/commitMarker/~value
//! ```
//!
//! # File Format
//!
//! A value file is a little-endian CRC32 of the payload followed by the
//! payload itself. The checksum is verified on every read.
//!
//! # Invariants
//!
//! - Writes go to a temporary file first and are renamed into place, so a
//!   reader never observes a partially written value.
//! - `create_if_absent` hard-links a fully written temporary file into
//!   place. The link fails if the target exists, which makes the create
//!   atomic across threads and processes.
//! - Segment names are percent-encoded so no identifier can escape the root
//!   or collide with the `~value` and `~tmp-*` files.
//! - Directories are left in place when their value is deleted; a directory
//!   without a `~value` file is not reported as a child.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crate::storage::io::{RawStorage, StorageError};
use crate::types::Identifier;

/// Name of the file holding an identifier's value.
const VALUE_FILE: &str = "~value";
/// Prefix of temporary files written before a rename or link.
const TEMP_PREFIX: &str = "~tmp-";
/// Size of the checksum header in bytes.
const CHECKSUM_SIZE: usize = 4;
/// How often a blocked `create_if_absent` re-checks the target.
const CREATE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Durable [`RawStorage`] backed by a directory tree.
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// The directory this store lives in.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn directory_of(&self, id: &Identifier) -> PathBuf {
        let mut path = self.root.clone();
        for segment in id.segments() {
            path.push(encode_segment(segment));
        }
        path
    }

    fn value_path(&self, id: &Identifier) -> PathBuf {
        self.directory_of(id).join(VALUE_FILE)
    }

    /// Write a framed value into a fresh temporary file inside `directory`.
    fn write_temp(directory: &Path, bytes: &[u8]) -> Result<PathBuf, StorageError> {
        fs::create_dir_all(directory)?;
        let temp = directory.join(format!("{TEMP_PREFIX}{:016x}", rand::random::<u64>()));
        let mut file = File::create(&temp)?;
        file.write_all(&crc32fast::hash(bytes).to_le_bytes())?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(temp)
    }
}

impl RawStorage for FileStorage {
    fn get(&self, id: &Identifier) -> Result<Option<Vec<u8>>, StorageError> {
        let contents = match fs::read(self.value_path(id)) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if contents.len() < CHECKSUM_SIZE {
            return Err(StorageError::corruption(format!(
                "value for {id} is truncated ({} bytes)",
                contents.len()
            )));
        }
        let (header, payload) = contents.split_at(CHECKSUM_SIZE);
        let mut checksum = [0u8; CHECKSUM_SIZE];
        checksum.copy_from_slice(header);
        if u32::from_le_bytes(checksum) != crc32fast::hash(payload) {
            return Err(StorageError::corruption(format!(
                "checksum mismatch for {id}"
            )));
        }
        Ok(Some(payload.to_vec()))
    }

    fn put(&self, id: &Identifier, bytes: &[u8]) -> Result<(), StorageError> {
        let directory = self.directory_of(id);
        let temp = Self::write_temp(&directory, bytes)?;
        if let Err(e) = fs::rename(&temp, directory.join(VALUE_FILE)) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }
        Ok(())
    }

    fn delete(&self, id: &Identifier) -> Result<(), StorageError> {
        match fs::remove_file(self.value_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_children(&self, id: &Identifier) -> Result<Vec<Identifier>, StorageError> {
        let entries = match fs::read_dir(self.directory_of(id)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut children = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() || !entry.path().join(VALUE_FILE).is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            children.push(id.child(&decode_segment(name)?));
        }
        children.sort();
        Ok(children)
    }

    fn create_if_absent(
        &self,
        id: &Identifier,
        bytes: &[u8],
        wait: Duration,
    ) -> Result<bool, StorageError> {
        let directory = self.directory_of(id);
        let target = directory.join(VALUE_FILE);
        let temp = Self::write_temp(&directory, bytes)?;
        let started = Instant::now();
        let outcome = loop {
            match fs::hard_link(&temp, &target) {
                Ok(()) => break Ok(true),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let elapsed = started.elapsed();
                    if elapsed >= wait {
                        break Ok(false);
                    }
                    thread::sleep(CREATE_POLL_INTERVAL.min(wait - elapsed));
                }
                Err(e) => break Err(e.into()),
            }
        };
        let _ = fs::remove_file(&temp);
        outcome
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

fn encode_segment(segment: &str) -> String {
    let mut encoded = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'-' | b'_') {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    if encoded == "." || encoded == ".." {
        encoded = encoded.replace('.', "%2E");
    }
    encoded
}

fn decode_segment(name: &str) -> Result<String, StorageError> {
    let bytes = name.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%' {
            let hex = name
                .get(index + 1..index + 3)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                .ok_or_else(|| {
                    StorageError::corruption(format!("bad directory name '{name}'"))
                })?;
            decoded.push(hex);
            index += 3;
        } else {
            decoded.push(bytes[index]);
            index += 1;
        }
    }
    String::from_utf8(decoded)
        .map_err(|_| StorageError::corruption(format!("bad directory name '{name}'")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::*;

    fn id(path: &str) -> Identifier {
        Identifier::new(path).expect("valid identifier")
    }

    #[test]
    fn test_put_get_roundtrip() {
        let dir = tempdir().expect("create temp dir");
        let storage = FileStorage::open(dir.path()).expect("open");
        let key = id("a/b/.contrail/store-1");
        storage.put(&key, b"payload").expect("put");
        assert_eq!(storage.get(&key).expect("get"), Some(b"payload".to_vec()));
        assert_eq!(storage.get(&id("a/b")).expect("get"), None);
    }

    #[test]
    fn test_checksum_mismatch_is_corruption() {
        let dir = tempdir().expect("create temp dir");
        let storage = FileStorage::open(dir.path()).expect("open");
        let key = id("x");
        storage.put(&key, b"payload").expect("put");

        let path = dir.path().join("x").join(VALUE_FILE);
        let mut raw = fs::read(&path).expect("read");
        raw[CHECKSUM_SIZE] ^= 0xff;
        fs::write(&path, raw).expect("write");

        let err = storage.get(&key).expect_err("corrupted value");
        assert!(err.is_corruption());
    }

    #[test]
    fn test_list_children_skips_valueless_directories() {
        let dir = tempdir().expect("create temp dir");
        let storage = FileStorage::open(dir.path()).expect("open");
        storage.put(&id("p/one"), b"1").expect("put");
        storage.put(&id("p/two/deep"), b"2").expect("put");
        storage.put(&id("p/odd name"), b"3").expect("put");
        let children = storage.list_children(&id("p")).expect("list");
        assert_eq!(children, vec![id("p/odd name"), id("p/one")]);

        storage.delete(&id("p/one")).expect("delete");
        let children = storage.list_children(&id("p")).expect("list");
        assert_eq!(children, vec![id("p/odd name")]);
    }

    #[test]
    fn test_segments_cannot_escape_root() {
        assert_eq!(encode_segment(".."), "%2E%2E");
        assert_eq!(encode_segment("~value"), "%7Evalue");
        assert_eq!(
            decode_segment(&encode_segment("a b~c")).expect("decode"),
            "a b~c"
        );
    }

    #[test]
    fn test_concurrent_create_has_one_winner() {
        let dir = tempdir().expect("create temp dir");
        let storage = Arc::new(FileStorage::open(dir.path()).expect("open"));
        let key = id("race/lock");

        let handles: Vec<_> = (0..8u8)
            .map(|n| {
                let storage = Arc::clone(&storage);
                let key = key.clone();
                std::thread::spawn(move || {
                    storage
                        .create_if_absent(&key, &[n], Duration::ZERO)
                        .expect("create")
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .filter(|created| *created)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_create_if_absent_times_out() {
        let dir = tempdir().expect("create temp dir");
        let storage = FileStorage::open(dir.path()).expect("open");
        let key = id("lock");
        assert!(storage.create_if_absent(&key, b"a", Duration::ZERO).expect("create"));
        let started = Instant::now();
        assert!(
            !storage
                .create_if_absent(&key, b"b", Duration::from_millis(50))
                .expect("create")
        );
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(storage.get(&key).expect("get"), Some(b"a".to_vec()));
    }
}
