//! Streaming bucket iterators.
//!
//! - [`BucketInputIterator`]: a value-semantics cursor over a bucket file
//!   with one record of lookahead (`peek`/`next`) and access to the file's
//!   header metadata.
//! - [`BucketOutputIterator`]: writes records to a fresh temp file in sorted
//!   order, computing the content hash as it goes, and publishes the result
//!   as a bucket on `get_bucket`.
//!
//! These iterators only ever hold one record in memory, so merges of very
//! large buckets run in constant space.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tessera_ledger::{
    protocol_version_starts_from, FrameOutputStream, Hash256,
};

use crate::bucket::{random_bucket_name, Bucket};
use crate::entry::{compare_entries, BucketEntry, BucketMetadata};
use crate::manager::BucketManager;
use crate::merge::MergeKey;
use crate::stream::BucketStream;
use crate::{
    BucketError, Result, FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY,
};

// ============================================================================
// Bucket Input Iterator
// ============================================================================

/// A streaming cursor over the records of one bucket file.
///
/// If the file begins with a metadata record it is consumed during `open`
/// and exposed through [`metadata`](Self::metadata); iteration starts at the
/// first data record. Files written before the metadata-supporting protocol
/// have no header, and `metadata` reports `ledger_version == 0` for them.
///
/// A metadata record anywhere but the first position, or a second metadata
/// record, is a malformed bucket.
pub struct BucketInputIterator {
    stream: Option<BucketStream>,
    current: Option<BucketEntry>,
    metadata: BucketMetadata,
    seen_metadata: bool,
    seen_other_entries: bool,
}

impl BucketInputIterator {
    /// Open an iterator over a bucket.
    ///
    /// An empty bucket yields an immediately exhausted iterator with
    /// default metadata.
    pub fn open(bucket: &Bucket) -> Result<Self> {
        if bucket.is_empty() {
            return Ok(Self {
                stream: None,
                current: None,
                metadata: BucketMetadata::default(),
                seen_metadata: false,
                seen_other_entries: false,
            });
        }
        Self::from_path(bucket.filename())
    }

    /// Open an iterator over a bucket file by path.
    pub fn from_path(path: &Path) -> Result<Self> {
        let stream = BucketStream::open(path)?;
        let mut iter = Self {
            stream: Some(stream),
            current: None,
            metadata: BucketMetadata::default(),
            seen_metadata: false,
            seen_other_entries: false,
        };
        iter.load_entry()?;
        Ok(iter)
    }

    fn load_entry(&mut self) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            self.current = None;
            return Ok(());
        };

        loop {
            match stream.read_one()? {
                None => {
                    self.current = None;
                    return Ok(());
                }
                Some(BucketEntry::Metadata(meta)) => {
                    if self.seen_metadata {
                        return Err(BucketError::Malformed(
                            "multiple metadata records in bucket".to_string(),
                        ));
                    }
                    if self.seen_other_entries {
                        return Err(BucketError::Malformed(
                            "metadata record must be the first record".to_string(),
                        ));
                    }
                    self.seen_metadata = true;
                    self.metadata = meta;
                }
                Some(entry) => {
                    self.seen_other_entries = true;
                    self.current = Some(entry);
                    return Ok(());
                }
            }
        }
    }

    /// A reference to the current record, without advancing.
    pub fn peek(&self) -> Option<&BucketEntry> {
        self.current.as_ref()
    }

    /// Take the current record and advance.
    pub fn next(&mut self) -> Result<Option<BucketEntry>> {
        let current = self.current.take();
        if current.is_some() {
            self.load_entry()?;
        }
        Ok(current)
    }

    /// Whether a record is available.
    pub fn has_next(&self) -> bool {
        self.current.is_some()
    }

    /// The bucket's header metadata (`ledger_version == 0` if the file
    /// predates headers).
    pub fn metadata(&self) -> &BucketMetadata {
        &self.metadata
    }

    /// Whether a metadata record was present.
    pub fn seen_metadata(&self) -> bool {
        self.seen_metadata
    }
}

impl std::fmt::Debug for BucketInputIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketInputIterator")
            .field("metadata", &self.metadata)
            .field("has_current", &self.current.is_some())
            .finish()
    }
}

// ============================================================================
// Bucket Output Iterator
// ============================================================================

/// A streaming writer that builds a new bucket in a temp file.
///
/// Records must be put in key order. A record equal-keyed with the buffered
/// predecessor replaces it (the newer record wins); an out-of-order record
/// is an error. When `keep_dead_entries` is false, tombstones are filtered
/// here at the output stage regardless of any shadowing that happened
/// upstream.
///
/// The content hash is computed over the framed byte sequence as records
/// are written, so sealing the file requires no second pass.
pub struct BucketOutputIterator {
    path: PathBuf,
    out: FrameOutputStream,
    buffer: Option<BucketEntry>,
    keep_dead_entries: bool,
    metadata: BucketMetadata,
    wrote_metadata: bool,
    put_meta_record: bool,
    hasher: Sha256,
    tombstone_elisions: u64,
    buffer_updates: u64,
    actual_writes: u64,
}

impl BucketOutputIterator {
    /// Start a new output bucket in `tmp_dir`.
    ///
    /// The metadata record is written (lazily, before the first data
    /// record) iff `metadata.ledger_version` is at or after the first
    /// metadata-supporting protocol.
    pub fn new(
        tmp_dir: &Path,
        keep_dead_entries: bool,
        metadata: BucketMetadata,
        do_fsync: bool,
    ) -> Result<Self> {
        let path = random_bucket_name(tmp_dir);
        let out = FrameOutputStream::open(&path, do_fsync)?;
        Ok(Self {
            path,
            out,
            buffer: None,
            keep_dead_entries,
            metadata,
            wrote_metadata: false,
            put_meta_record: false,
            hasher: Sha256::new(),
            tombstone_elisions: 0,
            buffer_updates: 0,
            actual_writes: 0,
        })
    }

    fn maybe_write_metadata(&mut self) -> Result<()> {
        if self.wrote_metadata {
            return Ok(());
        }
        self.wrote_metadata = true;

        if protocol_version_starts_from(
            self.metadata.ledger_version,
            FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY,
        ) {
            let entry = BucketEntry::Metadata(self.metadata);
            self.write_entry_raw(&entry)?;
            self.put_meta_record = true;
        }
        Ok(())
    }

    fn write_entry_raw(&mut self, entry: &BucketEntry) -> Result<()> {
        let payload = tessera_ledger::codec::serialize(entry)?;
        self.hasher
            .update(tessera_ledger::frame::frame_header(payload.len() as u32));
        self.hasher.update(&payload);
        self.out.write_frame(&payload)?;
        Ok(())
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if let Some(entry) = self.buffer.take() {
            self.write_entry_raw(&entry)?;
            self.actual_writes += 1;
        }
        Ok(())
    }

    /// Add a record to the output.
    pub fn put(&mut self, entry: BucketEntry) -> Result<()> {
        self.maybe_write_metadata()?;

        if entry.is_metadata() {
            return Err(BucketError::Malformed(
                "metadata may only be written as the bucket header".to_string(),
            ));
        }

        // Oldest-level tombstone elision, independent of shadowing.
        if entry.is_dead() && !self.keep_dead_entries {
            self.tombstone_elisions += 1;
            return Ok(());
        }

        if let Some(buffered) = &self.buffer {
            match compare_entries(buffered, &entry) {
                std::cmp::Ordering::Less => {
                    self.flush_buffer()?;
                    self.buffer = Some(entry);
                }
                std::cmp::Ordering::Equal => {
                    self.buffer_updates += 1;
                    self.buffer = Some(entry);
                }
                std::cmp::Ordering::Greater => {
                    return Err(BucketError::Malformed(
                        "bucket records must be put in sorted order".to_string(),
                    ));
                }
            }
        } else {
            self.buffer = Some(entry);
        }
        Ok(())
    }

    /// Fold this writer's counters into a merge-counters record.
    pub fn fold_counters(&self, mc: &mut crate::MergeCounters) {
        mc.output_iterator_tombstone_elisions += self.tombstone_elisions;
        mc.output_iterator_buffer_updates += self.buffer_updates;
        mc.output_iterator_actual_writes += self.actual_writes;
    }

    /// Path of the temp file being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Seal the output and publish it through the bucket manager.
    ///
    /// Flushes the buffered record, finishes the hash, closes (and fsyncs,
    /// if configured) the file, and hands it to the manager for
    /// content-addressed adoption. An output with no records at all yields
    /// the canonical empty bucket and removes the temp file.
    pub fn get_bucket(
        mut self,
        manager: &BucketManager,
        merge_key: Option<&MergeKey>,
    ) -> Result<Arc<Bucket>> {
        self.maybe_write_metadata()?;
        self.flush_buffer()?;

        if self.actual_writes == 0 && !self.put_meta_record {
            self.out.flush()?;
            drop(self.out);
            std::fs::remove_file(&self.path)?;
            return Ok(Arc::new(Bucket::empty()));
        }

        self.out.close()?;

        let mut hash_bytes = [0u8; 32];
        hash_bytes.copy_from_slice(&self.hasher.finalize());
        let hash = Hash256::from_bytes(hash_bytes);

        manager.adopt_file_as_bucket(&self.path, hash, merge_key)
    }
}

impl std::fmt::Debug for BucketOutputIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketOutputIterator")
            .field("path", &self.path)
            .field("actual_writes", &self.actual_writes)
            .field("has_buffer", &self.buffer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_ledger::{AccountEntry, AccountId, LedgerEntry, LedgerEntryData, LedgerKey};

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

    fn make_manager() -> (tempfile::TempDir, BucketManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = BucketManager::new(dir.path().to_path_buf()).unwrap();
        (dir, manager)
    }

    #[test]
    fn test_output_then_input_roundtrip() {
        let (_dir, manager) = make_manager();
        let meta = BucketMetadata { ledger_version: 12 };
        let mut out = BucketOutputIterator::new(manager.tmp_dir(), true, meta, false).unwrap();

        out.put(BucketEntry::Live(make_account_entry([1u8; 32], 100)))
            .unwrap();
        out.put(BucketEntry::Live(make_account_entry([2u8; 32], 200)))
            .unwrap();
        let bucket = out.get_bucket(&manager, None).unwrap();
        assert!(!bucket.is_empty());

        let mut iter = BucketInputIterator::open(&bucket).unwrap();
        assert!(iter.seen_metadata());
        assert_eq!(iter.metadata().ledger_version, 12);

        let first = iter.next().unwrap().unwrap();
        assert_eq!(first.key(), Some(make_account_key([1u8; 32])));
        let second = iter.next().unwrap().unwrap();
        assert_eq!(second.key(), Some(make_account_key([2u8; 32])));
        assert!(iter.next().unwrap().is_none());
    }

    #[test]
    fn test_no_metadata_before_protocol_11() {
        let (_dir, manager) = make_manager();
        let meta = BucketMetadata { ledger_version: 9 };
        let mut out = BucketOutputIterator::new(manager.tmp_dir(), true, meta, false).unwrap();
        out.put(BucketEntry::Live(make_account_entry([1u8; 32], 100)))
            .unwrap();
        let bucket = out.get_bucket(&manager, None).unwrap();

        let iter = BucketInputIterator::open(&bucket).unwrap();
        assert!(!iter.seen_metadata());
        assert_eq!(iter.metadata().ledger_version, 0);
    }

    #[test]
    fn test_equal_key_replaces_buffered() {
        let (_dir, manager) = make_manager();
        let meta = BucketMetadata { ledger_version: 12 };
        let mut out = BucketOutputIterator::new(manager.tmp_dir(), true, meta, false).unwrap();
        out.put(BucketEntry::Live(make_account_entry([1u8; 32], 100)))
            .unwrap();
        out.put(BucketEntry::Live(make_account_entry([1u8; 32], 200)))
            .unwrap();

        let mut mc = crate::MergeCounters::default();
        out.fold_counters(&mut mc);
        assert_eq!(mc.output_iterator_buffer_updates, 1);

        let bucket = out.get_bucket(&manager, None).unwrap();
        let mut iter = BucketInputIterator::open(&bucket).unwrap();
        let entry = iter.next().unwrap().unwrap();
        if let BucketEntry::Live(le) = entry {
            if let LedgerEntryData::Account(acc) = le.data {
                assert_eq!(acc.balance, 200);
            } else {
                panic!("expected account entry");
            }
        } else {
            panic!("expected live entry");
        }
        assert!(iter.next().unwrap().is_none());
    }

    #[test]
    fn test_out_of_order_put_rejected() {
        let (_dir, manager) = make_manager();
        let meta = BucketMetadata { ledger_version: 12 };
        let mut out = BucketOutputIterator::new(manager.tmp_dir(), true, meta, false).unwrap();
        out.put(BucketEntry::Live(make_account_entry([2u8; 32], 200)))
            .unwrap();
        let result = out.put(BucketEntry::Live(make_account_entry([1u8; 32], 100)));
        assert!(matches!(result, Err(BucketError::Malformed(_))));
    }

    #[test]
    fn test_tombstone_filter_at_output() {
        let (_dir, manager) = make_manager();
        let meta = BucketMetadata { ledger_version: 12 };
        let mut out = BucketOutputIterator::new(manager.tmp_dir(), false, meta, false).unwrap();
        out.put(BucketEntry::Live(make_account_entry([1u8; 32], 100)))
            .unwrap();
        out.put(BucketEntry::Dead(make_account_key([2u8; 32]))).unwrap();
        out.put(BucketEntry::Live(make_account_entry([3u8; 32], 300)))
            .unwrap();

        let mut mc = crate::MergeCounters::default();
        out.fold_counters(&mut mc);
        assert_eq!(mc.output_iterator_tombstone_elisions, 1);

        let bucket = out.get_bucket(&manager, None).unwrap();
        let mut iter = BucketInputIterator::open(&bucket).unwrap();
        let mut count = 0;
        while let Some(entry) = iter.next().unwrap() {
            assert!(!entry.is_dead());
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn test_empty_output_is_empty_bucket() {
        let (_dir, manager) = make_manager();
        let meta = BucketMetadata { ledger_version: 9 };
        let out = BucketOutputIterator::new(manager.tmp_dir(), true, meta, false).unwrap();
        let bucket = out.get_bucket(&manager, None).unwrap();
        assert!(bucket.is_empty());
        assert!(bucket.hash().is_zero());
    }

    #[test]
    fn test_empty_output_with_metadata_is_header_only_bucket() {
        let (_dir, manager) = make_manager();
        let meta = BucketMetadata { ledger_version: 12 };
        let out = BucketOutputIterator::new(manager.tmp_dir(), true, meta, false).unwrap();
        let bucket = out.get_bucket(&manager, None).unwrap();

        assert!(!bucket.is_empty());
        let mut iter = BucketInputIterator::open(&bucket).unwrap();
        assert!(iter.seen_metadata());
        assert!(iter.next().unwrap().is_none());
    }

    #[test]
    fn test_identical_content_same_hash() {
        let (_dir, manager) = make_manager();
        let meta = BucketMetadata { ledger_version: 12 };

        let mut hashes = Vec::new();
        for _ in 0..2 {
            let mut out =
                BucketOutputIterator::new(manager.tmp_dir(), true, meta, false).unwrap();
            out.put(BucketEntry::Live(make_account_entry([1u8; 32], 100)))
                .unwrap();
            out.put(BucketEntry::Dead(make_account_key([2u8; 32]))).unwrap();
            let bucket = out.get_bucket(&manager, None).unwrap();
            hashes.push(bucket.hash());
        }
        assert_eq!(hashes[0], hashes[1]);
    }

    #[test]
    fn test_hash_matches_file_bytes() {
        let (_dir, manager) = make_manager();
        let meta = BucketMetadata { ledger_version: 12 };
        let mut out = BucketOutputIterator::new(manager.tmp_dir(), true, meta, false).unwrap();
        out.put(BucketEntry::Live(make_account_entry([1u8; 32], 100)))
            .unwrap();
        let bucket = out.get_bucket(&manager, None).unwrap();

        let bytes = std::fs::read(bucket.filename()).unwrap();
        assert_eq!(Hash256::hash(&bytes), bucket.hash());
    }
}
