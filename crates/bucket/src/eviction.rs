//! TTL-driven eviction scanning.
//!
//! Temporary contract entries expire when the current ledger passes their
//! TTL's `live_until_ledger_seq`. Rather than scanning whole buckets at
//! once, eviction runs incrementally: each call scans up to a byte budget
//! or an eviction-count budget, whichever is exhausted first, and the
//! cursor is fully externalized so callers persist it across calls and
//! across bucket boundaries.
//!
//! The scanner only ever *reads* the bucket; the actual deletions go
//! through the [`LedgerTxn`] so they land in the live ledger state as
//! ordinary erases (which the bucket list then turns into tombstones).

use tessera_ledger::{
    is_temporary_entry, ledger_entry_key, protocol_version_is_before, ttl_key, LedgerEntryData,
};

use crate::bucket::{ensure_eviction_stream, Bucket};
use crate::entry::BucketEntry;
use crate::ledger_txn::LedgerTxn;
use crate::{BucketError, Result, FIRST_PROTOCOL_SUPPORTING_TTL_ENTRIES};

/// Externalized eviction scan position.
///
/// `bucket_list_level` and `is_curr_bucket` locate the bucket within the
/// caller's bucket list; `bucket_file_offset` is the resume offset inside
/// that bucket's file. The scanner only advances the offset; bucket
/// selection is the caller's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EvictionIterator {
    /// Byte offset to resume from within the current bucket file.
    pub bucket_file_offset: u64,
    /// Bucket list level currently being scanned.
    pub bucket_list_level: u32,
    /// Whether the curr (true) or snap (false) bucket is being scanned.
    pub is_curr_bucket: bool,
}

/// Eviction statistics reported back to the caller when requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionMetrics {
    /// Entries evicted by this scan.
    pub num_entries_evicted: u64,
    /// Sum over evicted entries of `ledger_seq - live_until_ledger_seq`.
    pub evicted_entries_age_sum: u64,
}

/// Running totals for eviction, aggregated across scans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionCounters {
    /// Total entries evicted.
    pub entries_evicted: u64,
    /// Total bytes scanned.
    pub bytes_scanned: u64,
}

impl Bucket {
    /// Scan this bucket for expired temporary entries, resuming at
    /// `iter.bucket_file_offset`.
    ///
    /// Returns `false` when the caller should move on to the next bucket
    /// (this bucket is empty, predates TTL support, or the scan hit EOF)
    /// and `true` when a budget ran out and the scan should stop here,
    /// resuming later from the updated cursor.
    ///
    /// For each live or init record holding a *temporary* entry, the
    /// entry's TTL is consulted through `ltx`; if the TTL has lapsed, both
    /// the TTL record and the entry itself are erased and the eviction
    /// budget is decremented. Entries already absent from the ledger are
    /// skipped. Persistent entries are never touched.
    #[allow(clippy::too_many_arguments)]
    pub fn scan_for_eviction(
        &self,
        ltx: &mut dyn LedgerTxn,
        iter: &mut EvictionIterator,
        bytes_to_scan: &mut u64,
        remaining_entries_to_evict: &mut u32,
        ledger_seq: u32,
        counters: &mut EvictionCounters,
        mut metrics: Option<&mut EvictionMetrics>,
    ) -> Result<bool> {
        if self.is_empty()
            || protocol_version_is_before(
                self.get_bucket_version()?,
                FIRST_PROTOCOL_SUPPORTING_TTL_ENTRIES,
            )
        {
            // EOF, skip to next bucket.
            return Ok(false);
        }

        if *remaining_entries_to_evict == 0 || *bytes_to_scan == 0 {
            // Reached end of scan region.
            return Ok(true);
        }

        let mut guard = self.eviction_stream().lock();
        let stream = ensure_eviction_stream(self, &mut *guard)?;
        stream.seek(iter.bucket_file_offset)?;

        while let Some(record) = stream.read_one()? {
            if let BucketEntry::Init(entry) | BucketEntry::Live(entry) = &record {
                if is_temporary_entry(entry) {
                    let entry_key = ledger_entry_key(entry);
                    let ttl_key = ttl_key(&entry_key).ok_or_else(|| {
                        BucketError::Malformed(
                            "temporary entry without a TTL key".to_string(),
                        )
                    })?;

                    let mut live_until_ledger = 0u32;
                    let should_evict = match ltx.load_without_record(&entry_key) {
                        None => {
                            // Already deleted, manually or by an earlier
                            // eviction scan.
                            assert!(
                                ltx.load_without_record(&ttl_key).is_none(),
                                "entry absent but its TTL survives"
                            );
                            false
                        }
                        Some(_) => {
                            let ttl_entry = ltx.load_without_record(&ttl_key).ok_or_else(|| {
                                BucketError::Malformed(
                                    "live temporary entry without a TTL record".to_string(),
                                )
                            })?;
                            let LedgerEntryData::Ttl(ttl) = &ttl_entry.data else {
                                return Err(BucketError::Malformed(
                                    "TTL key resolved to a non-TTL record".to_string(),
                                ));
                            };
                            live_until_ledger = ttl.live_until_ledger_seq;
                            !ttl.is_live(ledger_seq)
                        }
                    };

                    if should_evict {
                        if let Some(metrics) = metrics.as_deref_mut() {
                            metrics.num_entries_evicted += 1;
                            metrics.evicted_entries_age_sum +=
                                u64::from(ledger_seq - live_until_ledger);
                        }
                        ltx.erase(&ttl_key);
                        ltx.erase(&entry_key);
                        counters.entries_evicted += 1;
                        *remaining_entries_to_evict -= 1;
                    }
                }
            }

            let new_pos = stream.pos();
            let bytes_read = new_pos - iter.bucket_file_offset;
            iter.bucket_file_offset = new_pos;
            counters.bytes_scanned += bytes_read;

            if bytes_read >= *bytes_to_scan {
                // Reached end of scan region.
                *bytes_to_scan = 0;
                return Ok(true);
            } else if *remaining_entries_to_evict == 0 {
                return Ok(true);
            }
            *bytes_to_scan -= bytes_read;
        }

        // Hit EOF.
        Ok(false)
    }
}
