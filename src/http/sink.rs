//! Response body destinations
//!
//! The destination is chosen when the first non-empty chunk arrives, not
//! when the request is made; a response with no body never opens a file or
//! touches a writer.

use crate::error::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Where to put a response body
pub enum OutputSink {
    /// Buffer in memory; fail with `ResponseTooLarge` past `maximum_size`
    Memory {
        /// Initial capacity when no `Content-Length` is declared
        default_size: usize,
        /// Largest body accepted
        maximum_size: usize,
    },
    /// Create (or truncate) a file at this path
    File(PathBuf),
    /// Caller-supplied writer
    Writer(Box<dyn AsyncWrite + Send + Sync + Unpin>),
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputSink::Memory {
                default_size,
                maximum_size,
            } => f
                .debug_struct("Memory")
                .field("default_size", default_size)
                .field("maximum_size", maximum_size)
                .finish(),
            OutputSink::File(path) => f.debug_tuple("File").field(path).finish(),
            OutputSink::Writer(_) => f.write_str("Writer(..)"),
        }
    }
}

/// Where a finished response body ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// No body bytes were received
    Empty,
    /// Buffered bytes
    Memory(Vec<u8>),
    /// Written to a file
    File {
        /// File the body was written to
        path: PathBuf,
        /// Bytes written
        bytes: u64,
    },
    /// Written to the caller's writer
    Writer {
        /// Bytes written
        bytes: u64,
    },
}

impl ResponseBody {
    /// Buffered bytes, for in-memory bodies
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            ResponseBody::Memory(bytes) => Some(bytes),
            ResponseBody::Empty => Some(&[]),
            _ => None,
        }
    }

    /// Number of body bytes received
    pub fn len(&self) -> u64 {
        match self {
            ResponseBody::Empty => 0,
            ResponseBody::Memory(bytes) => bytes.len() as u64,
            ResponseBody::File { bytes, .. } | ResponseBody::Writer { bytes } => *bytes,
        }
    }

    /// True if no body bytes were received
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An opened destination accumulating body chunks
pub(crate) enum BodyAccumulator {
    Memory {
        buffer: Vec<u8>,
        limit: usize,
    },
    File {
        file: tokio::fs::File,
        path: PathBuf,
        written: u64,
    },
    Writer {
        writer: Box<dyn AsyncWrite + Send + Sync + Unpin>,
        written: u64,
    },
}

fn output_error(e: std::io::Error) -> Error {
    Error::OutputStream(Arc::new(e))
}

impl BodyAccumulator {
    /// Open `sink`; `expected_length` is the declared `Content-Length`, if any
    pub(crate) async fn open(sink: OutputSink, expected_length: Option<u64>) -> Result<Self> {
        match sink {
            OutputSink::Memory {
                default_size,
                maximum_size,
            } => {
                let capacity = expected_length
                    .and_then(|n| usize::try_from(n).ok())
                    .unwrap_or(default_size)
                    .min(maximum_size);
                Ok(BodyAccumulator::Memory {
                    buffer: Vec::with_capacity(capacity),
                    limit: maximum_size,
                })
            }
            OutputSink::File(path) => {
                let file = tokio::fs::File::create(&path).await.map_err(output_error)?;
                tracing::debug!(path = %path.display(), "opened response file");
                Ok(BodyAccumulator::File {
                    file,
                    path,
                    written: 0,
                })
            }
            OutputSink::Writer(writer) => Ok(BodyAccumulator::Writer { writer, written: 0 }),
        }
    }

    /// Append one chunk
    pub(crate) async fn append(&mut self, chunk: &[u8]) -> Result<()> {
        match self {
            BodyAccumulator::Memory { buffer, limit } => {
                if buffer.len() + chunk.len() > *limit {
                    return Err(Error::ResponseTooLarge { limit: *limit });
                }
                buffer.extend_from_slice(chunk);
            }
            BodyAccumulator::File { file, written, .. } => {
                file.write_all(chunk).await.map_err(output_error)?;
                *written += chunk.len() as u64;
            }
            BodyAccumulator::Writer { writer, written } => {
                writer.write_all(chunk).await.map_err(output_error)?;
                *written += chunk.len() as u64;
            }
        }
        Ok(())
    }

    /// Flush and close the destination
    pub(crate) async fn finish(self) -> Result<ResponseBody> {
        match self {
            BodyAccumulator::Memory { buffer, .. } => Ok(ResponseBody::Memory(buffer)),
            BodyAccumulator::File {
                mut file,
                path,
                written,
            } => {
                file.flush().await.map_err(output_error)?;
                file.sync_all().await.map_err(output_error)?;
                Ok(ResponseBody::File {
                    path,
                    bytes: written,
                })
            }
            BodyAccumulator::Writer {
                mut writer,
                written,
            } => {
                writer.flush().await.map_err(output_error)?;
                writer.shutdown().await.map_err(output_error)?;
                Ok(ResponseBody::Writer { bytes: written })
            }
        }
    }
}
