//! Payload collaborators: where the sender's bytes come from and where the
//!  receiver's bytes go. Both are deliberately dumb - segmentation, ordering
//!  and delivery guarantees live in the protocol, not here.

use std::io;
use std::path::Path;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// The bytes to transfer: a file on disk, or a generated pattern for runs
///  without fixture files.
pub enum PayloadSource {
    File { file: File, size: u64 },
    Synthetic { offset: u64, total: u64 },
}

impl PayloadSource {
    pub async fn file(path: impl AsRef<Path>) -> io::Result<PayloadSource> {
        let file = File::open(path).await?;
        let size = file.metadata().await?.len();
        Ok(PayloadSource::File { file, size })
    }

    /// `total` bytes of the repeating pattern `byte[i] = i mod 256`. The
    ///  pattern continues across chunk boundaries, so any delivered prefix can
    ///  be checked against its own offsets.
    pub fn synthetic(total: u64) -> PayloadSource {
        PayloadSource::Synthetic { offset: 0, total }
    }

    /// Total bytes this source will produce.
    pub fn total_bytes(&self) -> u64 {
        match self {
            PayloadSource::File { size, .. } => *size,
            PayloadSource::Synthetic { total, .. } => *total,
        }
    }

    /// The next chunk of at most `max_len` bytes, `None` at end of stream.
    ///  File reads are filled up to `max_len` until the file ends, so segment
    ///  sizing stays regular regardless of how the OS slices reads.
    pub async fn next_chunk(&mut self, max_len: usize) -> io::Result<Option<Bytes>> {
        match self {
            PayloadSource::File { file, .. } => {
                let mut buf = BytesMut::zeroed(max_len);
                let mut filled = 0;
                while filled < max_len {
                    let n = file.read(&mut buf[filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                if filled == 0 {
                    return Ok(None);
                }
                buf.truncate(filled);
                Ok(Some(buf.freeze()))
            }
            PayloadSource::Synthetic { offset, total } => {
                let remaining = *total - *offset;
                if remaining == 0 {
                    return Ok(None);
                }
                let len = remaining.min(max_len as u64) as usize;
                let mut buf = BytesMut::with_capacity(len);
                for i in 0..len {
                    buf.put_u8(((*offset + i as u64) % 256) as u8);
                }
                *offset += len as u64;
                Ok(Some(buf.freeze()))
            }
        }
    }
}

/// Where delivered bytes go: a file on disk, or memory for tests and
///  verification.
pub enum PayloadSink {
    File(File),
    Memory(Vec<u8>),
}

impl PayloadSink {
    pub async fn file(path: impl AsRef<Path>) -> io::Result<PayloadSink> {
        Ok(PayloadSink::File(File::create(path).await?))
    }

    pub fn memory() -> PayloadSink {
        PayloadSink::Memory(Vec::new())
    }

    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self {
            PayloadSink::File(file) => file.write_all(chunk).await,
            PayloadSink::Memory(buf) => {
                buf.extend_from_slice(chunk);
                Ok(())
            }
        }
    }

    /// Flushes everything out to stable storage. The receiver calls this
    ///  exactly once, after delivering the stream-ending segment.
    pub async fn finalize(&mut self) -> io::Result<()> {
        match self {
            PayloadSink::File(file) => {
                file.flush().await?;
                file.sync_all().await
            }
            PayloadSink::Memory(_) => Ok(()),
        }
    }

    /// The accumulated bytes of a memory sink, for test verification.
    pub fn as_memory(&self) -> Option<&[u8]> {
        match self {
            PayloadSink::File(_) => None,
            PayloadSink::Memory(buf) => Some(buf),
        }
    }
}
