//! Bucket manager: adoption, temp space and merge bookkeeping.
//!
//! The manager owns the bucket directory and the temp dir that unpublished
//! output files are written into. Sealed outputs are *adopted*: renamed to
//! a content-addressed path derived from their hash. Adoption is idempotent
//! — a second merge producing an already-known hash just drops its temp
//! file — which is what makes identical concurrent merges cheap to dedup
//! via their [`MergeKey`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tempfile::TempDir;
use tessera_ledger::Hash256;

use crate::bucket::Bucket;
use crate::counters::MergeCounters;
use crate::index::{BucketIndex, DEFAULT_PAGE_SIZE};
use crate::merge::MergeKey;
use crate::{BucketError, Result};

/// Aggregate wall-clock accounting for merges.
#[derive(Debug, Default)]
pub struct MergeTimer {
    total_us: AtomicU64,
    count: AtomicU64,
}

impl MergeTimer {
    /// Start timing one merge; the elapsed time is recorded when the
    /// returned scope drops.
    pub fn scope(&self) -> MergeTimerScope<'_> {
        MergeTimerScope {
            timer: self,
            start: Instant::now(),
        }
    }

    /// Merges timed so far.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Total merge time in microseconds.
    pub fn total_us(&self) -> u64 {
        self.total_us.load(Ordering::Relaxed)
    }
}

/// Guard returned by [`MergeTimer::scope`].
pub struct MergeTimerScope<'a> {
    timer: &'a MergeTimer,
    start: Instant,
}

impl Drop for MergeTimerScope<'_> {
    fn drop(&mut self) {
        self.timer
            .total_us
            .fetch_add(self.start.elapsed().as_micros() as u64, Ordering::Relaxed);
        self.timer.count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Owner of the bucket directory and merge bookkeeping.
pub struct BucketManager {
    bucket_dir: PathBuf,
    tmp_dir: TempDir,
    index_buckets: bool,
    index_page_size: u64,
    shutdown: AtomicBool,
    merge_counters: Mutex<MergeCounters>,
    merge_timer: MergeTimer,
    finished_merges: Mutex<HashMap<MergeKey, Hash256>>,
}

impl BucketManager {
    /// Create a manager rooted at `bucket_dir` (created if missing), with
    /// bucket indexing disabled.
    pub fn new(bucket_dir: PathBuf) -> Result<Self> {
        Self::with_config(bucket_dir, false, DEFAULT_PAGE_SIZE)
    }

    /// Create a manager that builds an index for every adopted bucket.
    ///
    /// `index_page_size` of 0 selects record-at-offset indexes.
    pub fn with_indexing(bucket_dir: PathBuf, index_page_size: u64) -> Result<Self> {
        Self::with_config(bucket_dir, true, index_page_size)
    }

    fn with_config(bucket_dir: PathBuf, index_buckets: bool, index_page_size: u64) -> Result<Self> {
        std::fs::create_dir_all(&bucket_dir)?;
        let tmp_dir = tempfile::Builder::new()
            .prefix("merge-")
            .tempdir_in(&bucket_dir)?;
        Ok(Self {
            bucket_dir,
            tmp_dir,
            index_buckets,
            index_page_size,
            shutdown: AtomicBool::new(false),
            merge_counters: Mutex::new(MergeCounters::default()),
            merge_timer: MergeTimer::default(),
            finished_merges: Mutex::new(HashMap::new()),
        })
    }

    /// The bucket directory.
    pub fn bucket_dir(&self) -> &Path {
        &self.bucket_dir
    }

    /// The temp dir unpublished outputs are written into. Removed, with
    /// any unadopted files, when the manager drops.
    pub fn tmp_dir(&self) -> &Path {
        self.tmp_dir.path()
    }

    /// Whether adopted buckets get an index built.
    pub fn index_buckets(&self) -> bool {
        self.index_buckets
    }

    /// Content-addressed path for a bucket hash.
    pub fn bucket_path(&self, hash: &Hash256) -> PathBuf {
        self.bucket_dir.join(format!("bucket-{}.xdr", hash.to_hex()))
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Request cooperative shutdown; running merges abort at their next
    /// poll.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Merge bookkeeping
    // ========================================================================

    /// Fold one merge's counters into the aggregate.
    pub fn incr_merge_counters(&self, mc: &MergeCounters) {
        self.merge_counters.lock().add(mc);
    }

    /// Snapshot of the aggregated merge counters.
    pub fn merge_counters(&self) -> MergeCounters {
        self.merge_counters.lock().clone()
    }

    /// The merge wall-clock timer.
    pub fn merge_timer(&self) -> &MergeTimer {
        &self.merge_timer
    }

    /// The output hash of a previously finished merge with this identity.
    pub fn get_merge_result(&self, key: &MergeKey) -> Option<Hash256> {
        self.finished_merges.lock().get(key).copied()
    }

    // ========================================================================
    // Adoption and loading
    // ========================================================================

    /// Adopt a sealed temp file as a published bucket.
    ///
    /// The file moves to its content-addressed path; if a bucket with the
    /// same hash already exists the temp file is discarded and the
    /// existing file backs the returned handle. When indexing is enabled
    /// the index is built here, so readers get it for free.
    pub fn adopt_file_as_bucket(
        &self,
        path: &Path,
        hash: Hash256,
        merge_key: Option<&MergeKey>,
    ) -> Result<Arc<Bucket>> {
        let target = self.bucket_path(&hash);
        if target.exists() {
            std::fs::remove_file(path)?;
            tracing::trace!(%hash, "adoption deduplicated, bucket already on disk");
        } else {
            std::fs::rename(path, &target)?;
            tracing::debug!(%hash, file = %target.display(), "bucket adopted");
        }

        let index = if self.index_buckets {
            Some(BucketIndex::build(&target, self.index_page_size)?)
        } else {
            None
        };
        let bucket = Arc::new(Bucket::new(target, hash, index)?);

        if let Some(key) = merge_key {
            self.finished_merges.lock().insert(key.clone(), hash);
        }
        Ok(bucket)
    }

    /// Whether a bucket with this hash is on disk.
    pub fn bucket_exists(&self, hash: &Hash256) -> bool {
        self.bucket_path(hash).exists()
    }

    /// Open a handle to a published bucket, verifying its content hash.
    pub fn load_bucket(&self, hash: &Hash256) -> Result<Arc<Bucket>> {
        let path = self.bucket_path(hash);
        if !path.exists() {
            return Err(BucketError::NotFound(hash.to_hex()));
        }

        let bytes = std::fs::read(&path)?;
        let actual = Hash256::hash(&bytes);
        if actual != *hash {
            return Err(BucketError::HashMismatch {
                expected: hash.to_hex(),
                actual: actual.to_hex(),
            });
        }

        let index = if self.index_buckets {
            Some(BucketIndex::build(&path, self.index_page_size)?)
        } else {
            None
        };
        Ok(Arc::new(Bucket::new(path, hash.to_owned(), index)?))
    }
}

impl std::fmt::Debug for BucketManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketManager")
            .field("bucket_dir", &self.bucket_dir)
            .field("index_buckets", &self.index_buckets)
            .field("is_shutdown", &self.is_shutdown())
            .finish()
    }
}
