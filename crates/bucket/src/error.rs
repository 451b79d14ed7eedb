//! Error types for bucket operations.

use thiserror::Error;

/// Errors that can occur during bucket operations.
#[derive(Debug, Error)]
pub enum BucketError {
    /// Bucket file not found.
    #[error("bucket not found: {0}")]
    NotFound(String),

    /// Bucket hash mismatch.
    #[error("bucket hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    /// Malformed bucket contents.
    #[error("malformed bucket: {0}")]
    Malformed(String),

    /// Bucket merge error.
    #[error("bucket merge error: {0}")]
    Merge(String),

    /// Merge cancelled by bucket manager shutdown. The temp file has not
    /// been adopted and is cleaned up with the temp dir.
    #[error("incomplete bucket merge due to bucket manager shutdown")]
    Shutdown,

    /// An indexed operation was attempted on an unindexed bucket.
    #[error("bucket is not indexed")]
    NotIndexed,

    /// `set_index` was called on a bucket that already owns an index.
    #[error("bucket index already set")]
    IndexAlreadySet,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Canonical codec error.
    #[error("codec error: {0}")]
    Codec(#[from] tessera_ledger::CodecError),
}
