//! Newline-delimited framing for MCP stdio streams.
//!
//! The backend speaks the MCP stdio transport:
//!
//! - Messages are UTF-8 encoded JSON-RPC
//! - Messages are delimited by newlines
//! - Messages must not contain embedded newlines
//!
//! [`FrameReader`] reassembles messages that arrive split across reads and
//! splits reads that carry several messages. [`FrameWriter`] writes one
//! message per line. [`Frame`] is the unit moved between the two; building a
//! `Frame` from a client payload guarantees it fits on one line.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FramingError;

/// One JSON-RPC message on a single line, without its terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(String);

impl Frame {
    /// Normalises a client payload into a frame.
    ///
    /// Surrounding whitespace is trimmed. A payload that still spans several
    /// lines is re-serialised compactly, which only succeeds if it is valid
    /// JSON.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::Empty`] for blank payloads,
    /// [`FramingError::Malformed`] for multi-line payloads that are not JSON,
    /// and [`FramingError::TooLarge`] if the frame exceeds `max_bytes`.
    pub fn from_payload(payload: &str, max_bytes: usize) -> Result<Self, FramingError> {
        let trimmed = payload.trim();
        if trimmed.is_empty() {
            return Err(FramingError::Empty);
        }

        let line = if trimmed.contains(['\n', '\r']) {
            let value: serde_json::Value = serde_json::from_str(trimmed)
                .map_err(|source| FramingError::Malformed { source })?;
            serde_json::to_string(&value).map_err(|source| FramingError::Malformed { source })?
        } else {
            trimmed.to_string()
        };

        Self::checked(line, max_bytes)
    }

    /// Builds a frame from a request body that must be a JSON document.
    ///
    /// A single-line body is forwarded byte for byte; a multi-line body is
    /// compacted.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::InvalidUtf8`], [`FramingError::Malformed`]
    /// (also for empty bodies) or [`FramingError::TooLarge`].
    pub fn from_json_body(body: &[u8], max_bytes: usize) -> Result<Self, FramingError> {
        let text = std::str::from_utf8(body).map_err(|_| FramingError::InvalidUtf8)?;
        let trimmed = text.trim();
        if trimmed.contains(['\n', '\r']) {
            return Self::from_payload(trimmed, max_bytes);
        }
        serde_json::from_str::<serde::de::IgnoredAny>(trimmed)
            .map_err(|source| FramingError::Malformed { source })?;
        Self::checked(trimmed.to_string(), max_bytes)
    }

    fn checked(line: String, max_bytes: usize) -> Result<Self, FramingError> {
        if line.len() > max_bytes {
            return Err(FramingError::TooLarge { limit: max_bytes });
        }
        Ok(Self(line))
    }

    /// The frame contents.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the frame, returning its contents.
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }

    /// Length in bytes, excluding the terminator.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the frame is empty. Frames built by this module never are.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reads newline-delimited frames with a bounded line length.
pub struct FrameReader<R> {
    reader: R,
    max_bytes: usize,
    line: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    /// Wraps a buffered reader.
    pub const fn new(reader: R, max_bytes: usize) -> Self {
        Self {
            reader,
            max_bytes,
            line: Vec::new(),
        }
    }

    /// Reads the next non-blank frame.
    ///
    /// Returns `None` at EOF. A final line without a trailing newline is still
    /// returned as a frame.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::TooLarge`] if a line exceeds the limit (the
    /// stream is unusable afterwards), [`FramingError::InvalidUtf8`] for
    /// non-UTF-8 lines, or [`FramingError::Io`] if reading fails.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, FramingError> {
        loop {
            self.line.clear();
            if !self.fill_line().await? {
                return Ok(None);
            }

            if self.line.last() == Some(&b'\r') {
                self.line.pop();
            }

            let text =
                std::str::from_utf8(&self.line).map_err(|_| FramingError::InvalidUtf8)?;
            if text.trim().is_empty() {
                continue;
            }
            return Ok(Some(Frame(text.to_string())));
        }
    }

    /// Fills `self.line` up to (not including) the next newline.
    ///
    /// Returns `false` if EOF was reached before any byte was read.
    async fn fill_line(&mut self) -> Result<bool, FramingError> {
        let mut read_any = false;
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(read_any);
            }
            read_any = true;

            let (chunk, consumed, done) = match available.iter().position(|&b| b == b'\n') {
                Some(pos) => (&available[..pos], pos + 1, true),
                None => (available, available.len(), false),
            };

            if self.line.len() + chunk.len() > self.max_bytes {
                return Err(FramingError::TooLarge {
                    limit: self.max_bytes,
                });
            }
            self.line.extend_from_slice(chunk);
            self.reader.consume(consumed);

            if done {
                return Ok(true);
            }
        }
    }
}

/// Writes frames as newline-terminated lines.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wraps a writer.
    pub const fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes one frame followed by a newline and flushes.
    ///
    /// # Errors
    ///
    /// Returns an error if writing or flushing fails.
    pub async fn write_frame(&mut self, frame: &Frame) -> std::io::Result<()> {
        debug_assert!(
            !frame.as_str().contains('\n'),
            "frame must not contain embedded newlines"
        );

        self.writer.write_all(frame.as_str().as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }
}
