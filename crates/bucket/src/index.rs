//! Bucket indexes for point and range reads.
//!
//! An index maps keys to byte offsets in the bucket file. Two modes exist,
//! selected by page size:
//!
//! - **Record-at-offset mode** (`page_size == 0`): one offset per key;
//!   a lookup hit points at the exact record.
//! - **Page mode** (`page_size > 0`): one entry per page of `page_size`
//!   bytes, keyed by the page's first key. A lookup returns the offset of a
//!   page that *may* contain the key; the reader page-searches and counts a
//!   bloom miss when the page turns out not to contain it.
//!
//! The index is built once from a bucket file and never mutated. Ordered
//! multi-key lookups walk a cursor forward with [`BucketIndex::scan`]
//! instead of restarting a binary search per key.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use tessera_ledger::{compare_keys, AccountId, Asset, LedgerKey};

use crate::stream::BucketStream;
use crate::Result;

/// Default page size in bytes for page-mode indexes.
pub const DEFAULT_PAGE_SIZE: u64 = 16384;

/// A cursor into the index, advanced monotonically by [`BucketIndex::scan`].
pub type IndexCursor = usize;

/// An immutable index over one bucket file.
pub struct BucketIndex {
    /// Page size in bytes; 0 means record-at-offset mode.
    page_size: u64,
    /// Sorted `(key, offset)` pairs: one per record in record-at-offset
    /// mode, one per page (keyed by the page's first key) in page mode.
    entries: Vec<(LedgerKey, u64)>,
    /// Byte range `[begin, end)` of each account's pool-share trust lines.
    pool_share_ranges: HashMap<AccountId, (u64, u64)>,
    /// Lookups whose offset did not actually contain the key.
    bloom_misses: AtomicU64,
}

impl BucketIndex {
    /// Build an index by scanning a bucket file.
    pub fn build(path: &Path, page_size: u64) -> Result<Self> {
        let mut stream = BucketStream::open(path)?;
        let mut entries: Vec<(LedgerKey, u64)> = Vec::new();
        let mut pool_share_ranges: HashMap<AccountId, (u64, u64)> = HashMap::new();
        let mut page_start: Option<u64> = None;

        loop {
            let offset = stream.pos();
            let Some(entry) = stream.read_one()? else {
                break;
            };
            let Some(key) = entry.key() else {
                // The header is not part of the indexed range.
                continue;
            };

            if let LedgerKey::TrustLine {
                account_id,
                asset: Asset::PoolShare(_),
            } = &key
            {
                let end = stream.pos();
                pool_share_ranges
                    .entry(*account_id)
                    .and_modify(|range| range.1 = end)
                    .or_insert((offset, end));
            }

            if page_size == 0 {
                entries.push((key, offset));
            } else {
                let start_new_page = match page_start {
                    None => true,
                    Some(start) => offset >= start + page_size,
                };
                if start_new_page {
                    entries.push((key, offset));
                    page_start = Some(offset);
                }
            }
        }

        Ok(Self {
            page_size,
            entries,
            pool_share_ranges,
            bloom_misses: AtomicU64::new(0),
        })
    }

    /// The page size this index was built with (0 = record-at-offset mode).
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Point lookup.
    ///
    /// In record-at-offset mode the returned offset is exact. In page mode
    /// it is the offset of the page that would hold the key, which may not
    /// actually contain it; the caller counts such misses via
    /// [`mark_bloom_miss`](Self::mark_bloom_miss).
    pub fn lookup(&self, key: &LedgerKey) -> Option<u64> {
        if self.page_size == 0 {
            self.entries
                .binary_search_by(|(k, _)| compare_keys(k, key))
                .ok()
                .map(|idx| self.entries[idx].1)
        } else {
            // Last page whose first key is <= key.
            let idx = self
                .entries
                .partition_point(|(k, _)| compare_keys(k, key) != Ordering::Greater);
            if idx == 0 {
                None
            } else {
                Some(self.entries[idx - 1].1)
            }
        }
    }

    /// Cursor at the start of the index.
    pub fn begin(&self) -> IndexCursor {
        0
    }

    /// Cursor one past the end of the index.
    pub fn end(&self) -> IndexCursor {
        self.entries.len()
    }

    /// Advance `cursor` to `key` and report a candidate offset.
    ///
    /// Keys must be presented in ascending order across calls; the cursor
    /// never moves backwards. Returns the candidate offset (exact in
    /// record-at-offset mode, page offset in page mode) and the new cursor.
    pub fn scan(&self, cursor: IndexCursor, key: &LedgerKey) -> (Option<u64>, IndexCursor) {
        let mut cursor = cursor;
        if self.page_size == 0 {
            while cursor < self.entries.len()
                && compare_keys(&self.entries[cursor].0, key) == Ordering::Less
            {
                cursor += 1;
            }
            if cursor < self.entries.len()
                && compare_keys(&self.entries[cursor].0, key) == Ordering::Equal
            {
                (Some(self.entries[cursor].1), cursor)
            } else {
                (None, cursor)
            }
        } else {
            if cursor >= self.entries.len() {
                return (None, cursor);
            }
            while cursor + 1 < self.entries.len()
                && compare_keys(&self.entries[cursor + 1].0, key) != Ordering::Greater
            {
                cursor += 1;
            }
            if compare_keys(&self.entries[cursor].0, key) != Ordering::Greater {
                (Some(self.entries[cursor].1), cursor)
            } else {
                (None, cursor)
            }
        }
    }

    /// The byte range `[begin, end)` holding the account's pool-share trust
    /// lines, if it has any.
    pub fn pool_share_trust_line_range(&self, account_id: &AccountId) -> Option<(u64, u64)> {
        self.pool_share_ranges.get(account_id).copied()
    }

    /// Count a lookup whose page did not actually contain the key.
    pub fn mark_bloom_miss(&self) {
        self.bloom_misses.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Number of bloom misses recorded so far.
    pub fn bloom_misses(&self) -> u64 {
        self.bloom_misses.load(AtomicOrdering::Relaxed)
    }

    /// Number of index entries (records or pages).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index covers no records.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for BucketIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketIndex")
            .field("page_size", &self.page_size)
            .field("entries", &self.entries.len())
            .field("pool_share_accounts", &self.pool_share_ranges.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{BucketEntry, BucketMetadata};
    use crate::iterator::BucketOutputIterator;
    use crate::manager::BucketManager;
    use tessera_ledger::{AccountEntry, LedgerEntry, LedgerEntryData};

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

    fn write_bucket(manager: &BucketManager, count: u8) -> std::sync::Arc<crate::Bucket> {
        let meta = BucketMetadata { ledger_version: 12 };
        let mut out = BucketOutputIterator::new(manager.tmp_dir(), true, meta, false).unwrap();
        for i in 1..=count {
            out.put(BucketEntry::Live(make_account_entry([i; 32], i as i64 * 100)))
                .unwrap();
        }
        out.get_bucket(manager, None).unwrap()
    }

    #[test]
    fn test_individual_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BucketManager::new(dir.path().to_path_buf()).unwrap();
        let bucket = write_bucket(&manager, 5);

        let index = BucketIndex::build(bucket.filename(), 0).unwrap();
        assert_eq!(index.len(), 5);
        assert_eq!(index.page_size(), 0);

        for i in 1..=5u8 {
            assert!(index.lookup(&make_account_key([i; 32])).is_some());
        }
        assert!(index.lookup(&make_account_key([9; 32])).is_none());
    }

    #[test]
    fn test_page_mode_groups_records() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BucketManager::new(dir.path().to_path_buf()).unwrap();
        let bucket = write_bucket(&manager, 20);

        // A large page groups everything into one index entry.
        let index = BucketIndex::build(bucket.filename(), 1 << 20).unwrap();
        assert_eq!(index.len(), 1);

        // Every present key resolves to some page.
        for i in 1..=20u8 {
            assert!(index.lookup(&make_account_key([i; 32])).is_some());
        }
        // Keys before the first page's first key are definite misses.
        assert!(index.lookup(&make_account_key([0; 32])).is_none());
        // Keys inside the covered range resolve to a page even when absent;
        // the page search is what discovers the miss.
        assert!(index.lookup(&make_account_key([10; 32])).is_some());
    }

    #[test]
    fn test_scan_walks_forward() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BucketManager::new(dir.path().to_path_buf()).unwrap();
        let bucket = write_bucket(&manager, 6);

        let index = BucketIndex::build(bucket.filename(), 0).unwrap();
        let mut cursor = index.begin();

        for i in [2u8, 3, 5] {
            let (off, next) = index.scan(cursor, &make_account_key([i; 32]));
            assert!(off.is_some(), "key {} should be found", i);
            cursor = next;
        }
        assert!(cursor < index.end());

        // A key past the last record exhausts the cursor.
        let (off, cursor) = index.scan(cursor, &make_account_key([200; 32]));
        assert!(off.is_none());
        assert_eq!(cursor, index.end());
    }

    #[test]
    fn test_bloom_miss_counter() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BucketManager::new(dir.path().to_path_buf()).unwrap();
        let bucket = write_bucket(&manager, 3);

        let index = BucketIndex::build(bucket.filename(), 0).unwrap();
        assert_eq!(index.bloom_misses(), 0);
        index.mark_bloom_miss();
        index.mark_bloom_miss();
        assert_eq!(index.bloom_misses(), 2);
    }
}
