//! The canonical binary codec for ledger records.
//!
//! All on-disk record payloads and all content hashes go through this
//! module, so the encoding must be deterministic: fixed-width little-endian
//! integers and `u32` enum tags, with no self-describing framing. Framing
//! is layered on top by [`crate::frame`].

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Errors from the canonical codec.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Value could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),

    /// Bytes could not be decoded into the requested type.
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Serialize a value to its canonical bytes.
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    bincode::serialize(value).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Deserialize a value from canonical bytes.
pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{AccountEntry, AccountId, LedgerEntry, LedgerEntryData};

    fn sample_entry() -> LedgerEntry {
        LedgerEntry {
            last_modified_ledger_seq: 5,
            data: LedgerEntryData::Account(AccountEntry {
                account_id: AccountId([1u8; 32]),
                balance: 1000,
                seq_num: 42,
                num_sub_entries: 2,
            }),
        }
    }

    #[test]
    fn test_roundtrip() {
        let entry = sample_entry();
        let bytes = serialize(&entry).unwrap();
        let decoded: LedgerEntry = deserialize(&bytes).unwrap();
        assert_eq!(entry, decoded);
    }

    #[test]
    fn test_deterministic_bytes() {
        let entry = sample_entry();
        assert_eq!(serialize(&entry).unwrap(), serialize(&entry).unwrap());
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result: Result<LedgerEntry, _> = deserialize(&[0xff; 3]);
        assert!(result.is_err());
    }
}
