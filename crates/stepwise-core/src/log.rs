//! Job log sink contract.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};

use crate::Result;

/// Append-only destination for a job's log text.
///
/// An append returns once the chunk has been durably written, and each append
/// lands as one contiguous write even when several producers share the sink.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Append raw bytes exactly as received.
    async fn append(&self, chunk: Bytes) -> Result<()>;

    /// Append a piece of text.
    async fn append_text(&self, text: &str) -> Result<()> {
        self.append(Bytes::copy_from_slice(text.as_bytes())).await
    }
}

/// Sink that keeps everything in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogSink {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything appended so far, decoded lossily.
    pub fn contents(&self) -> String {
        let buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn append(&self, chunk: Bytes) -> Result<()> {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.extend_from_slice(&chunk);
        Ok(())
    }
}
