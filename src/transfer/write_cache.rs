//! Receive-side write queue.
//!
//! Chunks read off the socket are queued here and written to disk by a
//! dedicated task on the same runtime. Every completed write is acknowledged
//! back, in order, so the receive loop can advance its durable position. The
//! loop stops reading while `is_saturated()` holds.

use crate::{DccError, Result};
use bytes::Bytes;
use std::io;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

pub struct WriteCache {
    queue: Option<mpsc::UnboundedSender<Bytes>>,
    acks: mpsc::UnboundedReceiver<io::Result<usize>>,
    writer: Option<JoinHandle<io::Result<()>>>,
    queued_bytes: usize,
    queued_chunks: usize,
    ceiling: usize,
}

impl WriteCache {
    pub fn new(file: File, ceiling: usize) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(Self::write_loop(file, queue_rx, ack_tx));

        Self {
            queue: Some(queue_tx),
            acks: ack_rx,
            writer: Some(writer),
            queued_bytes: 0,
            queued_chunks: 0,
            ceiling,
        }
    }

    async fn write_loop(
        mut file: File,
        mut queue: mpsc::UnboundedReceiver<Bytes>,
        acks: mpsc::UnboundedSender<io::Result<usize>>,
    ) -> io::Result<()> {
        while let Some(chunk) = queue.recv().await {
            // flush() waits for the blocking write to land before we ack it.
            let written = match file.write_all(&chunk).await {
                Ok(()) => file.flush().await,
                Err(e) => Err(e),
            };
            match written {
                Ok(()) => {
                    if acks.send(Ok(chunk.len())).is_err() {
                        // Cache dropped; nothing left to report to.
                        return Ok(());
                    }
                }
                Err(e) => {
                    error!("Disk write failed: {}", e);
                    let kind = e.kind();
                    let message = e.to_string();
                    let _ = acks.send(Err(e));
                    return Err(io::Error::new(kind, message));
                }
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    pub fn push(&mut self, chunk: Bytes) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let len = chunk.len();
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| DccError::FileOperation("write cache is closed".to_string()))?;
        queue
            .send(chunk)
            .map_err(|_| DccError::FileOperation("disk writer stopped".to_string()))?;

        self.queued_bytes += len;
        self.queued_chunks += 1;
        Ok(())
    }

    /// Waits for the next chunk to reach disk and returns its length.
    ///
    /// Cancel safe.
    pub async fn next_ack(&mut self) -> Result<usize> {
        match self.acks.recv().await {
            Some(Ok(len)) => {
                self.queued_bytes -= len;
                self.queued_chunks -= 1;
                Ok(len)
            }
            Some(Err(e)) => Err(DccError::FileOperation(format!("write failed: {}", e))),
            None => Err(DccError::FileOperation("disk writer stopped".to_string())),
        }
    }

    pub fn is_saturated(&self) -> bool {
        self.queued_bytes >= self.ceiling
    }

    pub fn has_pending(&self) -> bool {
        self.queued_chunks > 0
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Writes out everything still queued, then flushes and syncs the file.
    pub async fn close(mut self) -> Result<u64> {
        let mut flushed = 0u64;
        while self.has_pending() {
            flushed += self.next_ack().await? as u64;
        }
        self.queue.take();

        if let Some(writer) = self.writer.take() {
            writer
                .await
                .map_err(|e| DccError::FileOperation(format!("disk writer panicked: {}", e)))?
                .map_err(|e| DccError::FileOperation(format!("flush failed: {}", e)))?;
        }
        debug!("Write cache closed after {} trailing bytes", flushed);
        Ok(flushed)
    }
}

impl Drop for WriteCache {
    /// Unflushed chunks are discarded.
    fn drop(&mut self) {
        if let Some(writer) = &self.writer {
            writer.abort();
        }
    }
}
