//! Object encoding.
//!
//! Every stored object is wrapped in a small envelope so a reader can tell
//! what type of object it found before decoding the payload:
//!
//! ```text
//! +----------------+------------------+-------------------+
//! | tag_len: u16   | tag: [u8; len]   | payload (bincode) |
//! +----------------+------------------+-------------------+
//! ```
//!
//! The tag is [`Storable::TYPE_TAG`]. Decoding into the wrong type is
//! reported as [`StorageError::TypeMismatch`] rather than as garbage.

use crate::storage::io::StorageError;
use crate::storage::object::Storable;
use crate::types::Identifier;

/// Size of the tag length prefix.
const TAG_LEN_SIZE: usize = 2;

/// Encode an object into its tagged byte form.
pub fn encode<T: Storable>(item: &T) -> Result<Vec<u8>, StorageError> {
    let tag = T::TYPE_TAG.as_bytes();
    let tag_len = u16::try_from(tag.len()).map_err(|_| {
        StorageError::Serialization(format!("type tag '{}' is too long", T::TYPE_TAG))
    })?;
    let payload = bincode::serialize(item)?;
    let mut bytes = Vec::with_capacity(TAG_LEN_SIZE + tag.len() + payload.len());
    bytes.extend_from_slice(&tag_len.to_le_bytes());
    bytes.extend_from_slice(tag);
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Decode the object stored under `id`.
pub fn decode<T: Storable>(id: &Identifier, bytes: &[u8]) -> Result<T, StorageError> {
    let (tag, payload) = split_envelope(id, bytes)?;
    if tag != T::TYPE_TAG {
        return Err(StorageError::TypeMismatch {
            id: id.clone(),
            expected: T::TYPE_TAG.to_string(),
            found: tag.to_string(),
        });
    }
    bincode::deserialize(payload)
        .map_err(|e| StorageError::corruption(format!("cannot decode {id}: {e}")))
}

/// Read the type tag of an encoded object without decoding it.
pub fn type_tag<'a>(id: &Identifier, bytes: &'a [u8]) -> Result<&'a str, StorageError> {
    split_envelope(id, bytes).map(|(tag, _)| tag)
}

fn split_envelope<'a>(id: &Identifier, bytes: &'a [u8]) -> Result<(&'a str, &'a [u8]), StorageError> {
    let truncated = || StorageError::corruption(format!("envelope of {id} is truncated"));
    let len_bytes: [u8; TAG_LEN_SIZE] = bytes
        .get(..TAG_LEN_SIZE)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(truncated)?;
    let tag_end = TAG_LEN_SIZE + usize::from(u16::from_le_bytes(len_bytes));
    let tag = bytes.get(TAG_LEN_SIZE..tag_end).ok_or_else(truncated)?;
    let tag = std::str::from_utf8(tag)
        .map_err(|_| StorageError::corruption(format!("type tag of {id} is not UTF-8")))?;
    Ok((tag, &bytes[tag_end..]))
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::storage::object::Lifecycle;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        parent: Option<Identifier>,
    }

    impl Lifecycle for Sample {}

    impl Storable for Sample {
        const TYPE_TAG: &'static str = "test.sample";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Other(u32);

    impl Lifecycle for Other {}

    impl Storable for Other {
        const TYPE_TAG: &'static str = "test.other";
    }

    fn id() -> Identifier {
        Identifier::new("objects/sample").expect("valid identifier")
    }

    #[test]
    fn test_optional_fields_survive() {
        let present = Sample {
            name: "a".to_string(),
            parent: Some(id()),
        };
        let absent = Sample {
            name: "b".to_string(),
            parent: None,
        };
        for sample in [present, absent] {
            let bytes = encode(&sample).expect("encode");
            assert_eq!(type_tag(&id(), &bytes).expect("tag"), "test.sample");
            assert_eq!(decode::<Sample>(&id(), &bytes).expect("decode"), sample);
        }
    }

    #[test]
    fn test_wrong_type_is_reported() {
        let bytes = encode(&Other(7)).expect("encode");
        let err = decode::<Sample>(&id(), &bytes).expect_err("type mismatch");
        assert!(matches!(
            err,
            StorageError::TypeMismatch { ref found, .. } if found == "test.other"
        ));
    }

    #[test]
    fn test_truncated_envelope_is_corruption() {
        let bytes = encode(&Other(7)).expect("encode");
        assert!(decode::<Other>(&id(), &bytes[..1]).expect_err("short").is_corruption());
        assert!(decode::<Other>(&id(), &bytes[..4]).expect_err("short").is_corruption());
    }
}
