//! Typed record streams over bucket files.
//!
//! A bucket file is a concatenation of frames, each holding one canonical
//! [`BucketEntry`]. [`BucketStream`] layers typed sequential and
//! random-access reads over the raw frame stream; it is a single-threaded
//! cursor, so concurrent readers need separate streams.

use std::path::{Path, PathBuf};

use tessera_ledger::{compare_keys, FrameInputStream, LedgerKey};

use crate::entry::BucketEntry;
use crate::Result;

/// A read cursor over one bucket file.
pub struct BucketStream {
    input: FrameInputStream,
    path: PathBuf,
}

impl BucketStream {
    /// Open a bucket file for reading.
    pub fn open(path: &Path) -> Result<Self> {
        let input = FrameInputStream::open(path)?;
        Ok(Self {
            input,
            path: path.to_path_buf(),
        })
    }

    /// Read the next record, advancing the cursor. Returns `None` at EOF.
    pub fn read_one(&mut self) -> Result<Option<BucketEntry>> {
        Ok(self.input.read_one()?)
    }

    /// Search a page for a record with the given key.
    ///
    /// Scans records within `page_size` bytes starting at the current
    /// position and returns the first whose key equals `key`. Because
    /// records are sorted, the scan stops early once a greater key is
    /// seen. Returns `None` if the key is not found before the page end.
    pub fn read_page(&mut self, key: &LedgerKey, page_size: u64) -> Result<Option<BucketEntry>> {
        let page_end = self.input.pos() + page_size;
        while self.input.pos() < page_end {
            let Some(entry) = self.read_one()? else {
                return Ok(None);
            };
            let Some(entry_key) = entry.key() else {
                continue;
            };
            match compare_keys(&entry_key, key) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => return Ok(Some(entry)),
                std::cmp::Ordering::Greater => return Ok(None),
            }
        }
        Ok(None)
    }

    /// Seek to an absolute byte offset (a frame boundary).
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        self.input.seek(offset)?;
        Ok(())
    }

    /// Current byte offset.
    pub fn pos(&self) -> u64 {
        self.input.pos()
    }

    /// File length in bytes.
    pub fn len(&self) -> u64 {
        self.input.len()
    }

    /// Whether the cursor is at end of file.
    pub fn is_eof(&self) -> bool {
        self.input.is_eof()
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for BucketStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketStream")
            .field("path", &self.path)
            .field("pos", &self.pos())
            .field("len", &self.len())
            .finish()
    }
}
