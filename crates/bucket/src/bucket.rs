//! The bucket handle: an immutable, content-addressed, sorted run on disk.
//!
//! A bucket is identified by the hash of its file bytes and never changes
//! after publication. The handle itself is cheap to share behind an `Arc`;
//! it owns an optional index (single-assignment) and two lazily-opened
//! cached read cursors, one for index-driven reads and one for eviction
//! scans, so repeated operations avoid reopening the file.
//!
//! The cached cursors are plain single-threaded streams guarded by mutexes:
//! concurrent readers either serialize on the handle or open independent
//! streams via [`Bucket::open_stream`].

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::RngCore;
use tessera_ledger::{
    protocol_version_starts_from, AccountId, Asset, Hash256, LedgerEntry, LedgerEntryData,
    LedgerKey,
};

use crate::counters::MergeCounters;
use crate::entry::{compare_entries, BucketEntry, BucketMetadata};
use crate::index::BucketIndex;
use crate::iterator::{BucketInputIterator, BucketOutputIterator};
use crate::manager::BucketManager;
use crate::stream::BucketStream;
use crate::{BucketError, Result, FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY};

/// Pick an unused random file name in `tmp_dir` with the given extension.
fn random_file_name(tmp_dir: &Path, ext: &str) -> PathBuf {
    loop {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        let name = format!("tmp-bucket-{}{}", hex::encode(bytes), ext);
        let path = tmp_dir.join(name);
        if !path.exists() {
            return path;
        }
    }
}

/// Random name for a not-yet-published bucket file.
pub fn random_bucket_name(tmp_dir: &Path) -> PathBuf {
    random_file_name(tmp_dir, ".xdr")
}

/// Random name for a not-yet-published bucket index file.
pub fn random_bucket_index_name(tmp_dir: &Path) -> PathBuf {
    random_file_name(tmp_dir, ".index")
}

/// An immutable bucket file containing sorted lifecycle records.
pub struct Bucket {
    filename: PathBuf,
    hash: Hash256,
    size: u64,
    index: Mutex<Option<Arc<BucketIndex>>>,
    index_stream: Mutex<Option<BucketStream>>,
    eviction_stream: Mutex<Option<BucketStream>>,
}

impl Bucket {
    /// Create a handle for a published bucket file.
    ///
    /// The file must exist; its length is captured as the bucket size.
    pub fn new(filename: PathBuf, hash: Hash256, index: Option<BucketIndex>) -> Result<Self> {
        let size = std::fs::metadata(&filename)
            .map_err(|_| BucketError::NotFound(filename.display().to_string()))?
            .len();
        tracing::trace!(file = %filename.display(), %hash, size, "bucket handle created");
        Ok(Self {
            filename,
            hash,
            size,
            index: Mutex::new(index.map(Arc::new)),
            index_stream: Mutex::new(None),
            eviction_stream: Mutex::new(None),
        })
    }

    /// The canonical empty bucket: no file, zero hash.
    pub fn empty() -> Self {
        Self {
            filename: PathBuf::new(),
            hash: Hash256::ZERO,
            size: 0,
            index: Mutex::new(None),
            index_stream: Mutex::new(None),
            eviction_stream: Mutex::new(None),
        }
    }

    /// The content hash of the bucket file.
    pub fn hash(&self) -> Hash256 {
        self.hash
    }

    /// Path of the bucket file (empty for the empty bucket).
    pub fn filename(&self) -> &Path {
        &self.filename
    }

    /// File length in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether this is the empty bucket.
    ///
    /// An empty bucket has an empty filename and a zero hash; one without
    /// the other is a broken handle.
    pub fn is_empty(&self) -> bool {
        if self.filename.as_os_str().is_empty() || self.hash.is_zero() {
            assert!(
                self.filename.as_os_str().is_empty() && self.hash.is_zero(),
                "bucket has empty filename xor zero hash"
            );
            return true;
        }
        false
    }

    /// Open an independent read cursor over the bucket file.
    pub fn open_stream(&self) -> Result<BucketStream> {
        if self.is_empty() {
            return Err(BucketError::NotFound("empty bucket has no file".to_string()));
        }
        BucketStream::open(&self.filename)
    }

    // ========================================================================
    // Index ownership
    // ========================================================================

    /// Whether an index has been attached.
    pub fn is_indexed(&self) -> bool {
        self.index.lock().is_some()
    }

    /// Attach an index. Single-assignment: fails if one is already set.
    pub fn set_index(&self, index: BucketIndex) -> Result<()> {
        let mut guard = self.index.lock();
        if guard.is_some() {
            return Err(BucketError::IndexAlreadySet);
        }
        *guard = Some(Arc::new(index));
        Ok(())
    }

    /// Drop the index and the cached reader stream that serves it.
    ///
    /// In-flight index-driven operations on other threads keep their `Arc`
    /// to the old index; new operations fail until an index is set again.
    pub fn free_index(&self) {
        *self.index.lock() = None;
        *self.index_stream.lock() = None;
    }

    /// The attached index, or [`BucketError::NotIndexed`].
    pub fn index(&self) -> Result<Arc<BucketIndex>> {
        self.index.lock().clone().ok_or(BucketError::NotIndexed)
    }

    // ========================================================================
    // Point and range reads
    // ========================================================================

    /// Read the entry for `key` at a file offset claimed by the index.
    ///
    /// With `page_size == 0` the offset is exact and one record is read.
    /// Otherwise the page starting at `pos` is searched; if the page turns
    /// out not to contain the key, the index's bloom-miss counter is
    /// incremented and `None` is returned.
    pub fn get_entry_at_offset(
        &self,
        key: &LedgerKey,
        pos: u64,
        page_size: u64,
    ) -> Result<Option<BucketEntry>> {
        let mut guard = self.index_stream.lock();
        let stream = ensure_stream(&mut *guard, &self.filename)?;
        stream.seek(pos)?;

        let found = if page_size == 0 {
            stream.read_one()?
        } else {
            stream.read_page(key, page_size)?
        };

        if found.is_none() {
            self.index()?.mark_bloom_miss();
        }
        Ok(found)
    }

    /// Point lookup through the index.
    pub fn get_bucket_entry(&self, key: &LedgerKey) -> Result<Option<BucketEntry>> {
        let index = self.index()?;
        match index.lookup(key) {
            Some(pos) => self.get_entry_at_offset(key, pos, index.page_size()),
            None => Ok(None),
        }
    }

    /// Load a sorted set of keys from this bucket.
    ///
    /// Walks the index cursor forward in lockstep with the keys. Every hit
    /// — including tombstones — removes the key from the working set so
    /// older buckets never re-surface a shadowed value; live hits append
    /// their entry to `result`. Keys not found here stay in the set for the
    /// caller to look up in older buckets.
    pub fn load_keys(
        &self,
        keys: &mut BTreeSet<LedgerKey>,
        result: &mut Vec<LedgerEntry>,
    ) -> Result<()> {
        let index = self.index()?;
        let mut cursor = index.begin();
        let snapshot: Vec<LedgerKey> = keys.iter().cloned().collect();

        for key in snapshot {
            if cursor >= index.end() {
                break;
            }
            let (offset, next_cursor) = index.scan(cursor, &key);
            cursor = next_cursor;

            if let Some(offset) = offset {
                if let Some(entry) = self.get_entry_at_offset(&key, offset, index.page_size())? {
                    if let Some(live) = entry.as_ledger_entry() {
                        result.push(live.clone());
                    }
                    keys.remove(&key);
                }
            }
        }
        Ok(())
    }

    /// Collect the account's pool-share trust lines from this bucket.
    ///
    /// Reads the index-provided byte range sequentially. Tombstoned trust
    /// lines are recorded in `seen_trust_lines` so older buckets cannot
    /// re-surface them; the newest live version of each trust line is
    /// emitted into the output maps keyed by its liquidity pool.
    pub fn load_pool_share_trust_lines_by_account(
        &self,
        account_id: &AccountId,
        seen_trust_lines: &mut HashSet<LedgerKey>,
        liquidity_pool_key_to_trust_line: &mut HashMap<LedgerKey, LedgerEntry>,
        liquidity_pool_keys: &mut BTreeSet<LedgerKey>,
    ) -> Result<()> {
        let index = self.index()?;
        let Some((begin, end)) = index.pool_share_trust_line_range(account_id) else {
            return Ok(());
        };

        let key_matches = |key: &LedgerKey| {
            matches!(
                key,
                LedgerKey::TrustLine {
                    account_id: a,
                    asset: Asset::PoolShare(_),
                } if a == account_id
            )
        };

        let mut guard = self.index_stream.lock();
        let stream = ensure_stream(&mut *guard, &self.filename)?;
        stream.seek(begin)?;

        while stream.pos() < end {
            let Some(record) = stream.read_one()? else {
                break;
            };
            let entry = match record {
                BucketEntry::Live(entry) | BucketEntry::Init(entry) => entry,
                BucketEntry::Dead(key) => {
                    if key_matches(&key) {
                        seen_trust_lines.insert(key);
                    }
                    continue;
                }
                BucketEntry::Metadata(_) => {
                    return Err(BucketError::Malformed(
                        "metadata record inside indexed range".to_string(),
                    ));
                }
            };

            if let LedgerEntryData::TrustLine(trust_line) = &entry.data {
                if trust_line.account_id != *account_id {
                    continue;
                }
                let Asset::PoolShare(pool_id) = trust_line.asset else {
                    continue;
                };
                let key = tessera_ledger::ledger_entry_key(&entry);
                if seen_trust_lines.contains(&key) {
                    continue;
                }
                seen_trust_lines.insert(key);

                let pool_key = LedgerKey::LiquidityPool {
                    liquidity_pool_id: pool_id,
                };
                liquidity_pool_key_to_trust_line.insert(pool_key.clone(), entry);
                liquidity_pool_keys.insert(pool_key);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Whole-bucket queries
    // ========================================================================

    /// Linear scan for any record equal-keyed with `entry` (test support).
    pub fn contains_bucket_identity(&self, entry: &BucketEntry) -> Result<bool> {
        let mut iter = BucketInputIterator::open(self)?;
        while let Some(candidate) = iter.next()? {
            if compare_entries(&candidate, entry) == Ordering::Equal {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The protocol version this bucket was written under, from its header
    /// (0 for pre-header files and the empty bucket).
    pub fn get_bucket_version(&self) -> Result<u32> {
        let iter = BucketInputIterator::open(self)?;
        Ok(iter.metadata().ledger_version)
    }

    // ========================================================================
    // Fresh builder
    // ========================================================================

    /// Build a bucket from unsorted batches of created, updated and deleted
    /// entries.
    ///
    /// Before the first init-entry-supporting protocol, created entries are
    /// downgraded to `Live` for compatibility. The caller must not supply
    /// conflicting entries for the same key.
    pub fn fresh(
        manager: &BucketManager,
        protocol_version: u32,
        init_entries: &[LedgerEntry],
        live_entries: &[LedgerEntry],
        dead_entries: &[LedgerKey],
        count_merge_events: bool,
        do_fsync: bool,
    ) -> Result<Arc<Bucket>> {
        let use_init = protocol_version_starts_from(
            protocol_version,
            FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY,
        );
        let meta = BucketMetadata {
            ledger_version: protocol_version,
        };
        let entries =
            convert_to_bucket_entries(use_init, init_entries, live_entries, dead_entries);

        let mut mc = MergeCounters::default();
        let mut out = BucketOutputIterator::new(manager.tmp_dir(), true, meta, do_fsync)?;
        for entry in entries {
            out.put(entry)?;
        }
        out.fold_counters(&mut mc);

        if count_merge_events {
            manager.incr_merge_counters(&mc);
        }
        out.get_bucket(manager, None)
    }
}

/// Tag and sort input batches into bucket records.
fn convert_to_bucket_entries(
    use_init: bool,
    init_entries: &[LedgerEntry],
    live_entries: &[LedgerEntry],
    dead_entries: &[LedgerKey],
) -> Vec<BucketEntry> {
    let mut bucket: Vec<BucketEntry> =
        Vec::with_capacity(init_entries.len() + live_entries.len() + dead_entries.len());
    for entry in init_entries {
        bucket.push(if use_init {
            BucketEntry::Init(entry.clone())
        } else {
            BucketEntry::Live(entry.clone())
        });
    }
    for entry in live_entries {
        bucket.push(BucketEntry::Live(entry.clone()));
    }
    for key in dead_entries {
        bucket.push(BucketEntry::Dead(key.clone()));
    }

    bucket.sort_by(compare_entries);
    assert!(
        bucket
            .windows(2)
            .all(|pair| compare_entries(&pair[0], &pair[1]) == Ordering::Less),
        "fresh bucket inputs must not contain duplicate keys"
    );
    bucket
}

fn ensure_stream<'a>(
    guard: &'a mut Option<BucketStream>,
    path: &Path,
) -> Result<&'a mut BucketStream> {
    if guard.is_none() {
        *guard = Some(BucketStream::open(path)?);
    }
    // Populated just above.
    Ok(guard.as_mut().unwrap())
}

pub(crate) fn ensure_eviction_stream<'a>(
    bucket: &Bucket,
    guard: &'a mut Option<BucketStream>,
) -> Result<&'a mut BucketStream> {
    ensure_stream(guard, &bucket.filename)
}

impl Bucket {
    pub(crate) fn eviction_stream(&self) -> &Mutex<Option<BucketStream>> {
        &self.eviction_stream
    }
}

impl Default for Bucket {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("filename", &self.filename)
            .field("hash", &self.hash)
            .field("size", &self.size)
            .field("indexed", &self.is_indexed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::BucketIndex;
    use tessera_ledger::{AccountEntry, PoolId, TrustLineEntry};

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

    fn make_pool_share_trust_line(account: [u8; 32], pool: [u8; 32], balance: i64) -> LedgerEntry {
        LedgerEntry {
            last_modified_ledger_seq: 1,
            data: LedgerEntryData::TrustLine(TrustLineEntry {
                account_id: AccountId(account),
                asset: Asset::PoolShare(PoolId(Hash256::from_bytes(pool))),
                balance,
                limit: i64::MAX,
                flags: 1,
            }),
        }
    }

    fn make_manager() -> (tempfile::TempDir, BucketManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = BucketManager::new(dir.path().to_path_buf()).unwrap();
        (dir, manager)
    }

    fn indexed(bucket: &Arc<Bucket>, page_size: u64) {
        let index = BucketIndex::build(bucket.filename(), page_size).unwrap();
        bucket.set_index(index).unwrap();
    }

    #[test]
    fn test_empty_bucket_invariant() {
        let bucket = Bucket::empty();
        assert!(bucket.is_empty());
        assert!(bucket.hash().is_zero());
        assert_eq!(bucket.size(), 0);
        assert!(bucket.open_stream().is_err());
    }

    #[test]
    fn test_fresh_sorts_and_tags() {
        let (_dir, manager) = make_manager();
        let bucket = Bucket::fresh(
            &manager,
            12,
            &[make_account_entry([3u8; 32], 300)],
            &[make_account_entry([1u8; 32], 100)],
            &[make_account_key([2u8; 32])],
            false,
            false,
        )
        .unwrap();

        let mut iter = BucketInputIterator::open(&bucket).unwrap();
        assert_eq!(iter.metadata().ledger_version, 12);

        let first = iter.next().unwrap().unwrap();
        assert!(first.is_live());
        assert_eq!(first.key(), Some(make_account_key([1u8; 32])));

        let second = iter.next().unwrap().unwrap();
        assert!(second.is_dead());

        let third = iter.next().unwrap().unwrap();
        assert!(third.is_init(), "created entries are INIT from protocol 11");
        assert!(iter.next().unwrap().is_none());
    }

    #[test]
    fn test_fresh_downgrades_init_before_protocol_11() {
        let (_dir, manager) = make_manager();
        let bucket = Bucket::fresh(
            &manager,
            10,
            &[make_account_entry([1u8; 32], 100)],
            &[],
            &[],
            false,
            false,
        )
        .unwrap();

        let mut iter = BucketInputIterator::open(&bucket).unwrap();
        assert!(!iter.seen_metadata());
        let entry = iter.next().unwrap().unwrap();
        assert!(entry.is_live(), "INIT downgrades to LIVE before protocol 11");
    }

    #[test]
    fn test_get_bucket_version() {
        let (_dir, manager) = make_manager();
        let bucket = Bucket::fresh(
            &manager,
            12,
            &[],
            &[make_account_entry([1u8; 32], 1)],
            &[],
            false,
            false,
        )
        .unwrap();
        assert_eq!(bucket.get_bucket_version().unwrap(), 12);
        assert_eq!(Bucket::empty().get_bucket_version().unwrap(), 0);
    }

    #[test]
    fn test_set_index_is_single_assignment() {
        let (_dir, manager) = make_manager();
        let bucket = Bucket::fresh(
            &manager,
            12,
            &[],
            &[make_account_entry([1u8; 32], 1)],
            &[],
            false,
            false,
        )
        .unwrap();

        assert!(!bucket.is_indexed());
        indexed(&bucket, 0);
        assert!(bucket.is_indexed());

        let another = BucketIndex::build(bucket.filename(), 0).unwrap();
        assert!(matches!(
            bucket.set_index(another),
            Err(BucketError::IndexAlreadySet)
        ));

        bucket.free_index();
        assert!(!bucket.is_indexed());
        assert!(matches!(
            bucket.get_bucket_entry(&make_account_key([1u8; 32])),
            Err(BucketError::NotIndexed)
        ));
    }

    #[test]
    fn test_get_bucket_entry_individual_mode() {
        let (_dir, manager) = make_manager();
        let live: Vec<LedgerEntry> = (1..=5u8).map(|i| make_account_entry([i; 32], i as i64)).collect();
        let bucket = Bucket::fresh(&manager, 12, &[], &live, &[], false, false).unwrap();
        indexed(&bucket, 0);

        for i in 1..=5u8 {
            let entry = bucket
                .get_bucket_entry(&make_account_key([i; 32]))
                .unwrap()
                .unwrap();
            assert!(entry.is_live());
        }
        assert!(bucket
            .get_bucket_entry(&make_account_key([9; 32]))
            .unwrap()
            .is_none());
        assert_eq!(bucket.index().unwrap().bloom_misses(), 0);
    }

    #[test]
    fn test_get_bucket_entry_page_mode_counts_bloom_miss() {
        let (_dir, manager) = make_manager();
        // Only odd keys present; even keys inside the range are plausible
        // page hits that page-search must reject.
        let live: Vec<LedgerEntry> = [1u8, 3, 5, 7]
            .iter()
            .map(|&i| make_account_entry([i; 32], i as i64))
            .collect();
        let bucket = Bucket::fresh(&manager, 12, &[], &live, &[], false, false).unwrap();
        indexed(&bucket, 1 << 20);

        let entry = bucket
            .get_bucket_entry(&make_account_key([3; 32]))
            .unwrap()
            .unwrap();
        assert!(entry.is_live());
        assert_eq!(bucket.index().unwrap().bloom_misses(), 0);

        assert!(bucket
            .get_bucket_entry(&make_account_key([4; 32]))
            .unwrap()
            .is_none());
        assert_eq!(bucket.index().unwrap().bloom_misses(), 1);
    }

    #[test]
    fn test_load_keys_suppresses_shadowed_keys() {
        let (_dir, manager) = make_manager();
        let bucket = Bucket::fresh(
            &manager,
            12,
            &[],
            &[make_account_entry([1u8; 32], 100)],
            &[make_account_key([2u8; 32])],
            false,
            false,
        )
        .unwrap();
        indexed(&bucket, 0);

        let mut keys: BTreeSet<LedgerKey> = [
            make_account_key([1u8; 32]),
            make_account_key([2u8; 32]),
            make_account_key([3u8; 32]),
        ]
        .into_iter()
        .collect();
        let mut result = Vec::new();
        bucket.load_keys(&mut keys, &mut result).unwrap();

        // Key 1: live hit, loaded and removed. Key 2: dead hit, removed but
        // not loaded, so older buckets cannot revive it. Key 3: no hit,
        // stays for older buckets.
        assert_eq!(result.len(), 1);
        assert!(!keys.contains(&make_account_key([1u8; 32])));
        assert!(!keys.contains(&make_account_key([2u8; 32])));
        assert!(keys.contains(&make_account_key([3u8; 32])));
    }

    #[test]
    fn test_pool_share_trust_lines_by_account() {
        let (_dir, manager) = make_manager();
        let account = [7u8; 32];
        let other = [8u8; 32];
        let live = vec![
            make_account_entry([1u8; 32], 10),
            make_pool_share_trust_line(account, [1u8; 32], 500),
            make_pool_share_trust_line(account, [2u8; 32], 600),
            make_pool_share_trust_line(other, [3u8; 32], 700),
        ];
        let dead_line = make_pool_share_trust_line(account, [4u8; 32], 0);
        let dead = vec![tessera_ledger::ledger_entry_key(&dead_line)];

        let bucket = Bucket::fresh(&manager, 12, &[], &live, &dead, false, false).unwrap();
        indexed(&bucket, 0);

        let mut seen = HashSet::new();
        let mut by_pool = HashMap::new();
        let mut pool_keys = BTreeSet::new();
        bucket
            .load_pool_share_trust_lines_by_account(
                &AccountId(account),
                &mut seen,
                &mut by_pool,
                &mut pool_keys,
            )
            .unwrap();

        assert_eq!(by_pool.len(), 2);
        assert_eq!(pool_keys.len(), 2);
        // The dead trust line is remembered so older buckets stay shadowed.
        assert!(seen.contains(&dead[0]));
        // The other account's line is not picked up.
        assert_eq!(seen.len(), 3);

        // A second (older) bucket holding a stale version of a seen line
        // must not re-surface it.
        let stale = vec![make_pool_share_trust_line(account, [4u8; 32], 999)];
        let older = Bucket::fresh(&manager, 12, &[], &stale, &[], false, false).unwrap();
        indexed(&older, 0);
        older
            .load_pool_share_trust_lines_by_account(
                &AccountId(account),
                &mut seen,
                &mut by_pool,
                &mut pool_keys,
            )
            .unwrap();
        assert_eq!(by_pool.len(), 2, "tombstoned line must stay dead");
    }

    #[test]
    fn test_contains_bucket_identity() {
        let (_dir, manager) = make_manager();
        let bucket = Bucket::fresh(
            &manager,
            12,
            &[],
            &[make_account_entry([1u8; 32], 100)],
            &[],
            false,
            false,
        )
        .unwrap();

        // Identity is by key, not by value or tag.
        let same_key = BucketEntry::Dead(make_account_key([1u8; 32]));
        let other_key = BucketEntry::Dead(make_account_key([2u8; 32]));
        assert!(bucket.contains_bucket_identity(&same_key).unwrap());
        assert!(!bucket.contains_bucket_identity(&other_key).unwrap());
    }

    #[test]
    fn test_random_file_names_are_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let a = random_bucket_name(dir.path());
        let b = random_bucket_name(dir.path());
        assert_ne!(a, b);
        assert!(a.file_name().unwrap().to_str().unwrap().starts_with("tmp-bucket-"));
        assert!(a.extension().unwrap() == "xdr");
        let idx = random_bucket_index_name(dir.path());
        assert!(idx.extension().unwrap() == "index");
    }
}
