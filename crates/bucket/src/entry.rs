//! Bucket entries and their ordering.
//!
//! Bucket entries wrap ledger entries with lifecycle information that
//! controls merge semantics. Entries in a bucket file are strictly sorted
//! by key; the entry tag is not part of the key.
//!
//! # Entry Types
//!
//! | Type       | Description                                         |
//! |------------|-----------------------------------------------------|
//! | `Live`     | A live ledger entry (the current state)             |
//! | `Init`     | Live, and the chronological predecessor state is dead or absent |
//! | `Dead`     | A tombstone marking deletion                        |
//! | `Metadata` | Header sentinel; only ever the first record         |
//!
//! # Merge Semantics
//!
//! When equal-key pairs meet in a merge:
//!
//! - `INIT + DEAD` = both annihilated (nothing output)
//! - `DEAD + INIT` = `LIVE` (recreation cancels the tombstone)
//! - `INIT + LIVE` = `INIT` with the new value
//! - `LIVE + DEAD` = `DEAD` (if tombstones are kept)
//!
//! The `Init` tag is what makes the annihilation sound: it marks entries
//! whose prior state is guaranteed dead or nonexistent, so eliding the pair
//! cannot revive an older value.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tessera_ledger::{compare_keys, ledger_entry_key, LedgerEntry, LedgerKey};

/// Bucket header metadata, carried by the leading `Metadata` record of
/// buckets written at or after the first metadata-supporting protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BucketMetadata {
    /// Protocol version the bucket was written under.
    pub ledger_version: u32,
}

/// An entry stored in a bucket.
///
/// The variant order fixes the canonical codec tags (0 = Live, 1 = Init,
/// 2 = Dead, 3 = Metadata) and must not be reordered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BucketEntry {
    /// A live ledger entry (the current state of this key).
    Live(LedgerEntry),
    /// A live entry whose chronological predecessor state is guaranteed
    /// dead or nonexistent.
    Init(LedgerEntry),
    /// A tombstone marking that this key has been deleted.
    Dead(LedgerKey),
    /// Bucket header metadata.
    Metadata(BucketMetadata),
}

impl BucketEntry {
    /// Get the key identity for this entry.
    ///
    /// Returns `None` for metadata entries, which have no key.
    pub fn key(&self) -> Option<LedgerKey> {
        match self {
            BucketEntry::Live(entry) | BucketEntry::Init(entry) => Some(ledger_entry_key(entry)),
            BucketEntry::Dead(key) => Some(key.clone()),
            BucketEntry::Metadata(_) => None,
        }
    }

    /// Check if this is a metadata entry.
    pub fn is_metadata(&self) -> bool {
        matches!(self, BucketEntry::Metadata(_))
    }

    /// Check if this is a dead entry (tombstone).
    pub fn is_dead(&self) -> bool {
        matches!(self, BucketEntry::Dead(_))
    }

    /// Check if this is a live entry.
    pub fn is_live(&self) -> bool {
        matches!(self, BucketEntry::Live(_))
    }

    /// Check if this is an init entry.
    pub fn is_init(&self) -> bool {
        matches!(self, BucketEntry::Init(_))
    }

    /// Get the ledger entry if this is a live or init entry.
    pub fn as_ledger_entry(&self) -> Option<&LedgerEntry> {
        match self {
            BucketEntry::Live(entry) | BucketEntry::Init(entry) => Some(entry),
            _ => None,
        }
    }

    /// Short tag name for diagnostics.
    pub fn tag_name(&self) -> &'static str {
        match self {
            BucketEntry::Live(_) => "LIVE",
            BucketEntry::Init(_) => "INIT",
            BucketEntry::Dead(_) => "DEAD",
            BucketEntry::Metadata(_) => "META",
        }
    }
}

/// Compare two bucket entries by key identity.
///
/// Metadata entries sort before everything else. Two entries are equal-key
/// iff neither compares less than the other; the entry tag never
/// participates.
pub fn compare_entries(a: &BucketEntry, b: &BucketEntry) -> Ordering {
    match (a.key(), b.key()) {
        (Some(key_a), Some(key_b)) => compare_keys(&key_a, &key_b),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_ledger::{AccountEntry, AccountId, LedgerEntryData};

    fn make_account_entry(bytes: [u8; 32], balance: i64) -> LedgerEntry {
        LedgerEntry {
            last_modified_ledger_seq: 1,
            data: LedgerEntryData::Account(AccountEntry {
                account_id: AccountId(bytes),
                balance,
                seq_num: 1,
                num_sub_entries: 0,
            }),
        }
    }

    fn make_account_key(bytes: [u8; 32]) -> LedgerKey {
        LedgerKey::Account {
            account_id: AccountId(bytes),
        }
    }

    #[test]
    fn test_entry_predicates() {
        let live = BucketEntry::Live(make_account_entry([1u8; 32], 100));
        let dead = BucketEntry::Dead(make_account_key([1u8; 32]));
        let init = BucketEntry::Init(make_account_entry([1u8; 32], 100));
        let meta = BucketEntry::Metadata(BucketMetadata { ledger_version: 12 });

        assert!(live.is_live() && !live.is_dead() && !live.is_init() && !live.is_metadata());
        assert!(dead.is_dead() && !dead.is_live());
        assert!(init.is_init() && !init.is_live());
        assert!(meta.is_metadata());
    }

    #[test]
    fn test_key_identity_ignores_tag() {
        let live = BucketEntry::Live(make_account_entry([2u8; 32], 100));
        let dead = BucketEntry::Dead(make_account_key([2u8; 32]));

        assert_eq!(compare_entries(&live, &dead), Ordering::Equal);
        assert_eq!(live.key(), dead.key());
    }

    #[test]
    fn test_metadata_sorts_first() {
        let meta = BucketEntry::Metadata(BucketMetadata { ledger_version: 12 });
        let live = BucketEntry::Live(make_account_entry([0u8; 32], 1));

        assert_eq!(compare_entries(&meta, &live), Ordering::Less);
        assert_eq!(compare_entries(&live, &meta), Ordering::Greater);
        assert_eq!(compare_entries(&meta, &meta), Ordering::Equal);
    }

    #[test]
    fn test_entries_order_by_key() {
        let a = BucketEntry::Live(make_account_entry([1u8; 32], 100));
        let b = BucketEntry::Dead(make_account_key([2u8; 32]));

        assert_eq!(compare_entries(&a, &b), Ordering::Less);
    }
}
