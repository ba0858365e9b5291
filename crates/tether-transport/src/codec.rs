//! Line-delimited JSON framing.
//!
//! One frame per line. Readers distinguish a cleanly closed stream from an
//! I/O failure and from a frame that does not parse, so callers can keep
//! reading past garbage but tear down on a dead stream.

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Largest accepted frame, newline excluded.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Framing error.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed frame: {0}")]
    Malformed(String),
    /// The frame carried a readable `id` but its body did not decode.
    #[error("Invalid body in frame {id}: {reason}")]
    InvalidBody { id: u64, reason: String },
    #[error("Stream closed")]
    Closed,
}

/// Reads frames from the read half of a stream.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    buffer: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    #[must_use]
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buffer: Vec::with_capacity(1024),
        }
    }

    /// Read the next frame.
    ///
    /// # Errors
    /// `Closed` on EOF, `Io` on read failure, `Malformed` if the line is
    /// oversized or is not a frame at all, `InvalidBody` if the line has an
    /// `id` but does not decode as `T`. The stream stays usable after
    /// `Malformed` and `InvalidBody`.
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<T, WireError> {
        loop {
            self.buffer.clear();
            let limit = (MAX_FRAME_BYTES + 1) as u64;
            let read = (&mut self.reader)
                .take(limit)
                .read_until(b'\n', &mut self.buffer)
                .await?;
            if read == 0 {
                return Err(WireError::Closed);
            }

            let terminated = self.buffer.last() == Some(&b'\n');
            if !terminated && self.buffer.len() > MAX_FRAME_BYTES {
                self.discard_line().await?;
                return Err(WireError::Malformed(format!(
                    "frame exceeds {MAX_FRAME_BYTES} bytes"
                )));
            }

            let line = trim_line(&self.buffer);
            if line.is_empty() {
                if terminated {
                    continue;
                }
                return Err(WireError::Closed);
            }

            return match serde_json::from_slice(line) {
                Ok(frame) => Ok(frame),
                // A partial trailing frame means the peer went away mid-write.
                Err(_) if !terminated => Err(WireError::Closed),
                Err(e) => Err(match frame_id(line) {
                    Some(id) => WireError::InvalidBody {
                        id,
                        reason: e.to_string(),
                    },
                    None => WireError::Malformed(e.to_string()),
                }),
            };
        }
    }

    /// Skip the rest of the current line.
    async fn discard_line(&mut self) -> Result<(), WireError> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(());
            }
            let (consumed, done) = match available.iter().position(|&b| b == b'\n') {
                Some(newline) => (newline + 1, true),
                None => (available.len(), false),
            };
            self.reader.consume(consumed);
            if done {
                return Ok(());
            }
        }
    }
}

fn frame_id(line: &[u8]) -> Option<u64> {
    serde_json::from_slice::<serde_json::Value>(line)
        .ok()?
        .get("id")?
        .as_u64()
}

fn trim_line(buf: &[u8]) -> &[u8] {
    let mut end = buf.len();
    while end > 0 && matches!(buf[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &buf[..end]
}

/// Writes frames to the write half of a stream.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    #[must_use]
    pub const fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one frame and flush it.
    ///
    /// # Errors
    /// Returns error if serialization or the write fails.
    pub async fn send<T: Serialize>(&mut self, frame: &T) -> Result<(), WireError> {
        let mut json =
            serde_json::to_vec(frame).map_err(|e| WireError::Malformed(e.to_string()))?;
        json.push(b'\n');
        self.writer.write_all(&json).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shut down the write half.
    ///
    /// # Errors
    /// Returns error if the shutdown fails.
    pub async fn shutdown(&mut self) -> Result<(), WireError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
