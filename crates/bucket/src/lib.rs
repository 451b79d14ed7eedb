//! Bucket storage core for tessera.
//!
//! Tessera stores ledger state in the shape of a log-structured merge tree.
//! This crate implements its building block: the *bucket*, an immutable,
//! on-disk, sorted run of lifecycle records (create / update / delete).
//! The bucket list above this crate decides which buckets to merge and
//! when; everything about how a single bucket is written, merged, read and
//! scanned lives here.
//!
//! # Structure
//!
//! - [`BucketEntry`]: one lifecycle record — `Live`, `Init`, `Dead`, or the
//!   leading `Metadata` header
//! - [`Bucket`]: an immutable handle to a published bucket file, with
//!   indexed point and range reads
//! - [`BucketInputIterator`] / [`BucketOutputIterator`]: streaming cursors
//!   for reading and writing bucket files
//! - [`merge_buckets`]: the two-way streaming merge with lifecycle
//!   resolution and optional shadow elision
//! - [`Bucket::fresh`]: build a bucket from unsorted change batches
//! - [`Bucket::scan_for_eviction`]: the resumable TTL eviction scan
//! - [`BucketManager`]: temp space, content-addressed adoption, counters
//!
//! # Merge Semantics
//!
//! When buckets are merged, equal-key pairs collapse by lifecycle state:
//!
//! - `INIT + DEAD` = both annihilated (nothing output)
//! - `DEAD + INIT` = `LIVE` (recreation cancels the tombstone)
//! - `INIT + LIVE` = `INIT` with the new value
//! - `LIVE + DEAD` = `DEAD` (when tombstones are kept)
//!
//! Merges are deterministic: identical inputs (including shadow order)
//! produce byte-identical outputs and therefore identical content hashes.
//!
//! # Example
//!
//! ```ignore
//! use tessera_bucket::{merge_buckets, Bucket, BucketManager};
//!
//! let manager = BucketManager::new("/var/lib/tessera/buckets".into())?;
//!
//! // Build a bucket from one ledger's changes.
//! let fresh = Bucket::fresh(&manager, protocol, &created, &updated, &deleted,
//!                           true, false)?;
//!
//! // Merge it into an older level.
//! let merged = merge_buckets(&manager, max_protocol, &older, &fresh, &[],
//!                            true, true, false)?;
//! println!("new bucket {}", merged.hash());
//! ```

mod bucket;
mod counters;
mod entry;
mod error;
mod eviction;
mod index;
mod iterator;
mod ledger_txn;
mod manager;
mod merge;
mod stream;

// ============================================================================
// Core bucket types
// ============================================================================

pub use bucket::{random_bucket_index_name, random_bucket_name, Bucket};

// ============================================================================
// Entries and ordering
// ============================================================================

pub use entry::{compare_entries, BucketEntry, BucketMetadata};

// ============================================================================
// Error handling
// ============================================================================

pub use error::BucketError;

// ============================================================================
// Streaming iterators
// ============================================================================

pub use iterator::{BucketInputIterator, BucketOutputIterator};
pub use stream::BucketStream;

// ============================================================================
// Indexing
// ============================================================================

pub use index::{BucketIndex, IndexCursor, DEFAULT_PAGE_SIZE};

// ============================================================================
// Merge operations
// ============================================================================

pub use counters::MergeCounters;
pub use merge::{merge_buckets, MergeKey};

// ============================================================================
// Eviction (TTL-driven state expiry)
// ============================================================================

pub use eviction::{EvictionCounters, EvictionIterator, EvictionMetrics};
pub use ledger_txn::{LedgerTxn, MemLedgerTxn};

// ============================================================================
// Bucket management
// ============================================================================

pub use manager::{BucketManager, MergeTimer, MergeTimerScope};

// ============================================================================
// Protocol version constants
// ============================================================================

/// First protocol version supporting INIT and METADATA records.
pub const FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY: u32 = 11;
/// First protocol version where merge shadows are removed.
pub const FIRST_PROTOCOL_SHADOWS_REMOVED: u32 = 12;
/// First protocol version with TTL-bearing contract entries (and thus
/// eviction scans).
pub const FIRST_PROTOCOL_SUPPORTING_TTL_ENTRIES: u32 = 20;

/// Result type for bucket operations.
pub type Result<T> = std::result::Result<T, BucketError>;
