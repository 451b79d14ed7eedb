//! Streaming bucket merges.
//!
//! Merging combines two read-only buckets into a new third bucket in a
//! single pass, computing the output's content hash as it streams. Inputs
//! stay on disk; only one record per cursor is ever held in memory.
//!
//! # Effective merge protocol
//!
//! The protocol used by a merge is the maximum of the protocols of its
//! input buckets, including any shadow written before
//! [`FIRST_PROTOCOL_SHADOWS_REMOVED`](crate::FIRST_PROTOCOL_SHADOWS_REMOVED).
//! The strictness matters: once any newer level has cut over to the
//! init-entry merge algorithm, INIT+DEAD pairs may annihilate, which can
//! expose the state of a key on older levels. From that instant, older
//! levels must stop eliding lifecycle entries by shadowing, or an elided
//! tombstone could let an annihilation revive a stale value. Cutting every
//! level over at once — and preserving INIT/DEAD entries from shadow
//! elision from then on — keeps the chronological lifecycle pairing intact.
//!
//! # Equal-key resolution
//!
//! | old     | new     | result   |
//! |---------|---------|----------|
//! | INIT    | INIT    | error    |
//! | LIVE    | INIT    | error    |
//! | DEAD    | INIT=x  | LIVE=x   |
//! | INIT=x  | LIVE=y  | INIT=y   |
//! | INIT    | DEAD    | empty    |
//! | other   | any     | new wins |
//!
//! Two invariants drive the table: a reader must not be able to tell the
//! pre-merge pair from the post-merge record (liveness and value), and an
//! INIT record's chronological predecessor state must remain dead or
//! absent, so that a later INIT+DEAD annihilation cannot reveal an older
//! live value.

use std::cmp::Ordering;
use std::sync::Arc;

use tessera_ledger::{protocol_version_is_before, Hash256};

use crate::bucket::Bucket;
use crate::counters::MergeCounters;
use crate::entry::{compare_entries, BucketEntry, BucketMetadata};
use crate::iterator::{BucketInputIterator, BucketOutputIterator};
use crate::manager::BucketManager;
use crate::{
    BucketError, Result, FIRST_PROTOCOL_SHADOWS_REMOVED,
    FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY,
};

/// Structural identity of a merge, used by the bucket manager to dedup
/// concurrent identical merges. Not part of the bucket file content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MergeKey {
    pub keep_dead_entries: bool,
    pub old_bucket: Hash256,
    pub new_bucket: Hash256,
    pub shadows: Vec<Hash256>,
}

/// Reject record types that predate the effective merge protocol.
pub(crate) fn check_protocol_legality(entry: &BucketEntry, protocol_version: u32) -> Result<()> {
    if protocol_version_is_before(
        protocol_version,
        FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY,
    ) && (entry.is_init() || entry.is_metadata())
    {
        return Err(BucketError::Malformed(format!(
            "unsupported entry type {} in protocol {} bucket",
            entry.tag_name(),
            protocol_version
        )));
    }
    Ok(())
}

fn count_shadowed_entry_type(mc: &mut MergeCounters, entry: &BucketEntry) {
    match entry {
        BucketEntry::Metadata(_) => mc.meta_entry_shadow_elisions += 1,
        BucketEntry::Init(_) => mc.init_entry_shadow_elisions += 1,
        BucketEntry::Live(_) => mc.live_entry_shadow_elisions += 1,
        BucketEntry::Dead(_) => mc.dead_entry_shadow_elisions += 1,
    }
}

fn count_old_entry_type(mc: &mut MergeCounters, entry: &BucketEntry) {
    match entry {
        BucketEntry::Metadata(_) => mc.old_meta_entries += 1,
        BucketEntry::Init(_) => mc.old_init_entries += 1,
        BucketEntry::Live(_) => mc.old_live_entries += 1,
        BucketEntry::Dead(_) => mc.old_dead_entries += 1,
    }
}

fn count_new_entry_type(mc: &mut MergeCounters, entry: &BucketEntry) {
    match entry {
        BucketEntry::Metadata(_) => mc.new_meta_entries += 1,
        BucketEntry::Init(_) => mc.new_init_entries += 1,
        BucketEntry::Live(_) => mc.new_live_entries += 1,
        BucketEntry::Dead(_) => mc.new_dead_entries += 1,
    }
}

/// Emit an entry unless a shadow covers it.
///
/// Before protocol 11 every shadowed entry is dropped here. From protocol
/// 11 on, only LIVE entries may be elided:
///
/// - DEAD is preserved so that a newer shadow cannot elide the tombstone of
///   an old live-or-init entry; shadows may themselves be an INIT/DEAD pair
///   that later annihilates, which would otherwise revive the key.
/// - INIT is preserved so that a DEAD kept by the previous rule eventually
///   meets (and annihilates with) its own INIT in an older level instead of
///   leaving a redundant tombstone behind.
///
/// This only covers elision due to shadows; the oldest-level tombstone
/// filter happens independently in the output iterator.
fn maybe_put(
    out: &mut BucketOutputIterator,
    entry: BucketEntry,
    shadow_iterators: &mut [BucketInputIterator],
    keep_shadowed_lifecycle_entries: bool,
    mc: &mut MergeCounters,
) -> Result<()> {
    if keep_shadowed_lifecycle_entries && (entry.is_init() || entry.is_dead()) {
        // Never shadow-out entries in this case; no point scanning shadows.
        return out.put(entry);
    }

    for si in shadow_iterators.iter_mut() {
        // Advance the shadow cursor while it's below the candidate.
        while si
            .peek()
            .is_some_and(|s| compare_entries(s, &entry) == Ordering::Less)
        {
            mc.shadow_scan_steps += 1;
            si.next()?;
        }
        // The cursor now sits at the first record >= entry (or is
        // exhausted); equality means the entry is shadowed somewhere newer.
        if let Some(s) = si.peek() {
            if compare_entries(&entry, s) != Ordering::Less {
                count_shadowed_entry_type(mc, &entry);
                return Ok(());
            }
        }
    }
    out.put(entry)
}

/// Derive the effective protocol and shadow behavior for a merge.
fn calculate_merge_protocol_version(
    mc: &mut MergeCounters,
    max_protocol_version: u32,
    oi: &BucketInputIterator,
    ni: &BucketInputIterator,
    shadow_iterators: &[BucketInputIterator],
) -> Result<(u32, bool)> {
    let mut protocol_version = oi
        .metadata()
        .ledger_version
        .max(ni.metadata().ledger_version);

    // From FIRST_PROTOCOL_SHADOWS_REMOVED on, shadows no longer participate
    // in the protocol calculation: a bucket may still perform an old-style
    // merge despite the presence of new-protocol shadows.
    for si in shadow_iterators {
        let version = si.metadata().ledger_version;
        if protocol_version_is_before(version, FIRST_PROTOCOL_SHADOWS_REMOVED) {
            protocol_version = protocol_version.max(version);
        }
    }

    tracing::trace!(
        protocol_version,
        max_protocol_version,
        "bucket merge protocol"
    );

    if protocol_version > max_protocol_version {
        return Err(BucketError::Merge(format!(
            "bucket protocol version {} exceeds max protocol version {}",
            protocol_version, max_protocol_version
        )));
    }

    let mut keep_shadowed_lifecycle_entries = true;
    if protocol_version_is_before(
        protocol_version,
        FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY,
    ) {
        mc.pre_init_entry_protocol_merges += 1;
        keep_shadowed_lifecycle_entries = false;
    } else {
        mc.post_init_entry_protocol_merges += 1;
    }

    if protocol_version_is_before(protocol_version, FIRST_PROTOCOL_SHADOWS_REMOVED) {
        mc.pre_shadow_removal_protocol_merges += 1;
    } else {
        if !shadow_iterators.is_empty() {
            return Err(BucketError::Merge("shadows are not supported".to_string()));
        }
        mc.post_shadow_removal_protocol_merges += 1;
    }

    Ok((protocol_version, keep_shadowed_lifecycle_entries))
}

/// The four easy merge cases: an exhausted cursor on either side, or
/// strictly unequal keys. Take the lesser (or only) entry, advance one
/// cursor, and don't scrutinize the entry type further.
///
/// Returns false when both cursors hold equal keys and the lifecycle table
/// has to be consulted.
#[allow(clippy::too_many_arguments)]
fn merge_cases_with_default_acceptance(
    mc: &mut MergeCounters,
    oi: &mut BucketInputIterator,
    ni: &mut BucketInputIterator,
    out: &mut BucketOutputIterator,
    shadow_iterators: &mut [BucketInputIterator],
    protocol_version: u32,
    keep_shadowed_lifecycle_entries: bool,
) -> Result<bool> {
    let take_old = match (oi.peek(), ni.peek()) {
        (Some(_), None) => true,
        (Some(old), Some(new)) => compare_entries(old, new) == Ordering::Less,
        _ => false,
    };
    if take_old {
        // Out of new entries, or the old entry has the smaller key.
        mc.old_entries_default_accepted += 1;
        let Some(entry) = oi.next()? else {
            return Ok(false);
        };
        check_protocol_legality(&entry, protocol_version)?;
        count_old_entry_type(mc, &entry);
        maybe_put(
            out,
            entry,
            shadow_iterators,
            keep_shadowed_lifecycle_entries,
            mc,
        )?;
        return Ok(true);
    }

    let take_new = match (oi.peek(), ni.peek()) {
        (None, Some(_)) => true,
        (Some(old), Some(new)) => compare_entries(new, old) == Ordering::Less,
        _ => false,
    };
    if take_new {
        // Out of old entries, or the new entry has the smaller key.
        mc.new_entries_default_accepted += 1;
        let Some(entry) = ni.next()? else {
            return Ok(false);
        };
        check_protocol_legality(&entry, protocol_version)?;
        count_new_entry_type(mc, &entry);
        maybe_put(
            out,
            entry,
            shadow_iterators,
            keep_shadowed_lifecycle_entries,
            mc,
        )?;
        return Ok(true);
    }

    Ok(false)
}

/// Resolve an equal-key pair through the lifecycle table (see module docs).
#[allow(clippy::too_many_arguments)]
fn merge_cases_with_equal_keys(
    mc: &mut MergeCounters,
    oi: &mut BucketInputIterator,
    ni: &mut BucketInputIterator,
    out: &mut BucketOutputIterator,
    shadow_iterators: &mut [BucketInputIterator],
    protocol_version: u32,
    keep_shadowed_lifecycle_entries: bool,
) -> Result<()> {
    let (old_entry, new_entry) = match (oi.next()?, ni.next()?) {
        (Some(old), Some(new)) => (old, new),
        _ => {
            return Err(BucketError::Merge(
                "equal-key merge case with an exhausted cursor".to_string(),
            ))
        }
    };

    check_protocol_legality(&old_entry, protocol_version)?;
    check_protocol_legality(&new_entry, protocol_version)?;
    count_old_entry_type(mc, &old_entry);
    count_new_entry_type(mc, &new_entry);

    match (old_entry, new_entry) {
        (BucketEntry::Metadata(_), _) | (_, BucketEntry::Metadata(_)) => {
            Err(BucketError::Merge(
                "metadata record reached the merge loop".to_string(),
            ))
        }
        (old_entry, BucketEntry::Init(new_live)) => {
            // The only legal new-is-INIT case is merging a delete+create to
            // an update.
            if !old_entry.is_dead() {
                return Err(BucketError::Malformed(
                    "old non-DEAD + new INIT".to_string(),
                ));
            }
            mc.new_init_entries_merged_with_old_dead += 1;
            maybe_put(
                out,
                BucketEntry::Live(new_live),
                shadow_iterators,
                keep_shadowed_lifecycle_entries,
                mc,
            )
        }
        (BucketEntry::Init(_), BucketEntry::Live(new_live)) => {
            // Merge a create+update to a fresher create.
            mc.old_init_entries_merged_with_new_live += 1;
            maybe_put(
                out,
                BucketEntry::Init(new_live),
                shadow_iterators,
                keep_shadowed_lifecycle_entries,
                mc,
            )
        }
        (BucketEntry::Init(_), BucketEntry::Dead(_)) => {
            // Merge a create+delete to nothingness.
            mc.old_init_entries_merged_with_new_dead += 1;
            Ok(())
        }
        (_, new_entry) => {
            // Neither is in INIT state; take the newer one.
            mc.new_entries_merged_with_old_neither_init += 1;
            maybe_put(
                out,
                new_entry,
                shadow_iterators,
                keep_shadowed_lifecycle_entries,
                mc,
            )
        }
    }
}

/// Merge two buckets into a new published bucket.
///
/// `new_bucket` holds the newer entries; `shadows` are still-newer buckets
/// whose presence may elide entries (pre-protocol-12 only). The merge is a
/// single streaming pass; it polls the manager for shutdown every thousand
/// iterations and aborts with [`BucketError::Shutdown`] if asked, leaving
/// the unadopted temp file to be cleaned up with the temp dir.
///
/// With deterministic inputs (including the shadow order) the output is
/// byte-identical across runs, so its content hash is stable.
#[allow(clippy::too_many_arguments)]
pub fn merge_buckets(
    manager: &BucketManager,
    max_protocol_version: u32,
    old_bucket: &Arc<Bucket>,
    new_bucket: &Arc<Bucket>,
    shadows: &[Arc<Bucket>],
    keep_dead_entries: bool,
    count_merge_events: bool,
    do_fsync: bool,
) -> Result<Arc<Bucket>> {
    let mut mc = MergeCounters::default();
    let mut oi = BucketInputIterator::open(old_bucket)?;
    let mut ni = BucketInputIterator::open(new_bucket)?;
    let mut shadow_iterators = shadows
        .iter()
        .map(|shadow| BucketInputIterator::open(shadow))
        .collect::<Result<Vec<_>>>()?;

    let (protocol_version, keep_shadowed_lifecycle_entries) = calculate_merge_protocol_version(
        &mut mc,
        max_protocol_version,
        &oi,
        &ni,
        &shadow_iterators,
    )?;

    let _timer = manager.merge_timer().scope();
    let meta = BucketMetadata {
        ledger_version: protocol_version,
    };
    let mut out = BucketOutputIterator::new(manager.tmp_dir(), keep_dead_entries, meta, do_fsync)?;

    tracing::debug!(
        old = %old_bucket.hash(),
        new = %new_bucket.hash(),
        shadows = shadows.len(),
        protocol_version,
        keep_dead_entries,
        "bucket merge starting"
    );

    let mut iter = 0usize;
    while oi.has_next() || ni.has_next() {
        // Check if the merge should be stopped every few entries.
        iter += 1;
        if iter >= 1000 {
            iter = 0;
            if manager.is_shutdown() {
                // Safe to abort: the temp file has not been adopted yet and
                // is removed with the tmp dir.
                return Err(BucketError::Shutdown);
            }
        }

        if !merge_cases_with_default_acceptance(
            &mut mc,
            &mut oi,
            &mut ni,
            &mut out,
            &mut shadow_iterators,
            protocol_version,
            keep_shadowed_lifecycle_entries,
        )? {
            merge_cases_with_equal_keys(
                &mut mc,
                &mut oi,
                &mut ni,
                &mut out,
                &mut shadow_iterators,
                protocol_version,
                keep_shadowed_lifecycle_entries,
            )?;
        }
    }

    out.fold_counters(&mut mc);
    if count_merge_events {
        manager.incr_merge_counters(&mc);
    }

    let merge_key = MergeKey {
        keep_dead_entries,
        old_bucket: old_bucket.hash(),
        new_bucket: new_bucket.hash(),
        shadows: shadows.iter().map(|shadow| shadow.hash()).collect(),
    };
    let result = out.get_bucket(manager, Some(&merge_key))?;
    tracing::debug!(output = %result.hash(), "bucket merge complete");
    Ok(result)
}
