//! Frame streams for size-prefixed binary record files.
//!
//! Record files are simple concatenations of frames; each frame is a 4-byte
//! big-endian size header with the continuation bit (bit 31) set, followed
//! by the record's canonical payload bytes. There is no padding and no
//! trailer, so a file's content hash is just the hash of its bytes.
//!
//! # Wire Format
//!
//! ```text
//! byte[0] = ((sz >> 24) & 0xFF) | 0x80   // continuation bit set
//! byte[1] = (sz >> 16) & 0xFF
//! byte[2] = (sz >> 8) & 0xFF
//! byte[3] = sz & 0xFF
//! byte[4..4+sz] = payload
//! ```
//!
//! The input stream tracks its byte position exactly, so offsets observed
//! through [`FrameInputStream::pos`] can be persisted in an index and later
//! passed back to [`FrameInputStream::seek`].

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec;

/// Encode a frame header for a payload of `sz` bytes.
pub fn frame_header(sz: u32) -> [u8; 4] {
    assert!(sz < 0x8000_0000, "frame payload size {} exceeds maximum", sz);
    [
        ((sz >> 24) & 0xFF) as u8 | 0x80,
        ((sz >> 16) & 0xFF) as u8,
        ((sz >> 8) & 0xFF) as u8,
        (sz & 0xFF) as u8,
    ]
}

/// An output stream that writes records as size-prefixed frames.
pub struct FrameOutputStream {
    writer: BufWriter<File>,
    bytes_written: u64,
    fsync_on_close: bool,
}

impl FrameOutputStream {
    /// Open a frame output stream, truncating any existing file.
    pub fn open(path: &Path, fsync_on_close: bool) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            bytes_written: 0,
            fsync_on_close,
        })
    }

    /// Write raw payload bytes as one frame.
    ///
    /// Returns the total number of bytes written (header plus payload).
    pub fn write_frame(&mut self, payload: &[u8]) -> io::Result<usize> {
        let header = frame_header(payload.len() as u32);
        self.writer.write_all(&header)?;
        self.writer.write_all(payload)?;
        self.bytes_written += 4 + payload.len() as u64;
        Ok(4 + payload.len())
    }

    /// Serialize a value with the canonical codec and write it as one frame.
    pub fn write_one<T: Serialize>(&mut self, value: &T) -> io::Result<usize> {
        let payload = codec::serialize(value)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.write_frame(&payload)
    }

    /// Total bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Flush the underlying writer.
    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    /// Close the stream: flush, and fsync if configured at open.
    pub fn close(mut self) -> io::Result<()> {
        self.writer.flush()?;
        if self.fsync_on_close {
            self.writer.get_ref().sync_all()?;
        }
        Ok(())
    }
}

/// An input stream that reads size-prefixed frames.
pub struct FrameInputStream {
    reader: BufReader<File>,
    pos: u64,
    len: u64,
}

impl FrameInputStream {
    /// Open a frame input stream.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            reader: BufReader::new(file),
            pos: 0,
            len,
        })
    }

    /// Read one frame's payload bytes.
    ///
    /// Returns `None` at end of stream. A truncated header is treated as
    /// end of stream; a truncated payload is an error.
    pub fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut header = [0u8; 4];
        match self.reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        // Strip the continuation bit from the high byte.
        let sz = (((header[0] & 0x7F) as u32) << 24)
            | ((header[1] as u32) << 16)
            | ((header[2] as u32) << 8)
            | (header[3] as u32);

        let mut payload = vec![0u8; sz as usize];
        self.reader.read_exact(&mut payload)?;
        self.pos += 4 + sz as u64;

        Ok(Some(payload))
    }

    /// Read one record, decoding with the canonical codec.
    pub fn read_one<T: DeserializeOwned>(&mut self) -> io::Result<Option<T>> {
        match self.read_frame()? {
            None => Ok(None),
            Some(payload) => {
                let value = codec::deserialize(&payload)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(value))
            }
        }
    }

    /// Seek to an absolute byte offset.
    ///
    /// The offset must be a frame boundary previously observed via [`pos`],
    /// or the next read will fail to decode.
    ///
    /// [`pos`]: FrameInputStream::pos
    pub fn seek(&mut self, offset: u64) -> io::Result<()> {
        self.reader.seek(SeekFrom::Start(offset))?;
        self.pos = offset;
        Ok(())
    }

    /// Current byte offset.
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Total file length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the stream has reached end of file.
    pub fn is_eof(&self) -> bool {
        self.pos >= self.len
    }
}
