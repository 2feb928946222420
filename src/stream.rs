// SPDX-License-Identifier: MPL-2.0

//! Bounded byte capture with encoding and back-pressure (§4.2).
//!
//! A [`StreamHandler`] wraps one child stream: it counts raw bytes against
//! `max_bytes` (failing with [`Error::BufferOverflow`] on overflow, not
//! truncating), decodes the accumulated bytes, and optionally invokes a
//! per-chunk callback with the *masked* chunk. It is write-once — consuming
//! it returns the final captured (masked) string and cannot be repeated.

use crate::error::{Error, Result, StreamKind};
use crate::mask::Masker;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

const CHUNK_SIZE: usize = 8 * 1024;

pub type ChunkCallback = Arc<dyn Fn(&str) + Send + Sync>;

pub struct StreamHandler {
    kind: StreamKind,
    max_bytes: usize,
    on_chunk: Option<ChunkCallback>,
    masker: Arc<Masker>,
    command_for_errors: String,
}

impl StreamHandler {
    pub fn new(
        kind: StreamKind,
        max_bytes: usize,
        masker: Arc<Masker>,
        command_for_errors: impl Into<String>,
        on_chunk: Option<ChunkCallback>,
    ) -> Self {
        StreamHandler {
            kind,
            max_bytes,
            on_chunk,
            masker,
            command_for_errors: command_for_errors.into(),
        }
    }

    /// Drain `reader` to completion, returning the masked, decoded content.
    pub async fn consume<R: AsyncRead + Unpin>(self, mut reader: R) -> Result<String> {
        let mut raw = Vec::new();
        let mut chunk = [0u8; CHUNK_SIZE];
        loop {
            let n = reader
                .read(&mut chunk)
                .await
                .map_err(|source| Error::Spawn {
                    command: self.command_for_errors.clone(),
                    cwd: None,
                    source,
                })?;
            if n == 0 {
                break;
            }
            if raw.len() + n > self.max_bytes {
                return Err(Error::BufferOverflow {
                    stream: self.kind,
                    max_bytes: self.max_bytes,
                    command: self.command_for_errors.clone(),
                });
            }
            raw.extend_from_slice(&chunk[..n]);
            if let Some(cb) = &self.on_chunk {
                let text = self.masker.mask(&String::from_utf8_lossy(&chunk[..n]));
                cb(&text);
            }
        }
        let decoded = String::from_utf8_lossy(&raw).into_owned();
        Ok(self.masker.mask(&decoded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn captures_full_content_under_the_limit() {
        let masker = Arc::new(Masker::disabled());
        let handler = StreamHandler::new(StreamKind::Stdout, 1024, masker, "echo hi", None);
        let out = handler.consume(Cursor::new(b"hello\n".to_vec())).await.unwrap();
        assert_eq!(out, "hello\n");
    }

    #[tokio::test]
    async fn overflows_past_max_buffer() {
        let masker = Arc::new(Masker::disabled());
        let handler = StreamHandler::new(StreamKind::Stdout, 1, masker, "cmd", None);
        let err = handler
            .consume(Cursor::new(b"ab".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BufferOverflow { max_bytes: 1, .. }));
    }

    #[tokio::test]
    async fn masks_captured_text() {
        let masker = Arc::new(Masker::default_enabled());
        let handler = StreamHandler::new(StreamKind::Stdout, 1024, masker, "cmd", None);
        let out = handler
            .consume(Cursor::new(b"Authorization: Bearer sk-123".to_vec()))
            .await
            .unwrap();
        assert_eq!(out, "Authorization: Bearer [REDACTED]");
    }
}
