//! Push-based byte consumers.

use std::future::Future;
use std::io;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Accepts a finite sequence of chunks followed by exactly one of `close`
/// (success) or `abort` (failure or cancellation).
pub trait ByteSink: Send {
    fn push(&mut self, chunk: Bytes) -> impl Future<Output = io::Result<()>> + Send;
    fn close(&mut self) -> impl Future<Output = io::Result<()>> + Send;
    fn abort(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

/// Sink over any async writer. Aborting stops writing but leaves what was
/// already written in place.
pub struct WriterSink<W> {
    writer: W,
    written: u64,
}

impl<W: AsyncWrite + Unpin + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    /// Bytes pushed so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: AsyncWrite + Unpin + Send> ByteSink for WriterSink<W> {
    async fn push(&mut self, chunk: Bytes) -> io::Result<()> {
        self.writer.write_all(&chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        self.writer.flush().await?;
        self.writer.shutdown().await
    }

    async fn abort(&mut self) -> io::Result<()> {
        tracing::debug!(written = self.written, "output abandoned");
        self.writer.shutdown().await
    }
}

/// Collects output in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    data: Vec<u8>,
    pushes: usize,
    closed: bool,
    aborted: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    /// Number of non-empty pushes received.
    pub fn pushes(&self) -> usize {
        self.pushes
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }
}

impl ByteSink for MemorySink {
    async fn push(&mut self, chunk: Bytes) -> io::Result<()> {
        if self.closed || self.aborted {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink is finished"));
        }
        self.data.extend_from_slice(&chunk);
        self.pushes += 1;
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }

    async fn abort(&mut self) -> io::Result<()> {
        self.aborted = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writer_sink_counts_bytes() {
        let mut sink = WriterSink::new(Vec::new());
        sink.push(Bytes::from_static(b"abc")).await.unwrap();
        sink.push(Bytes::from_static(b"de")).await.unwrap();
        sink.close().await.unwrap();
        assert_eq!(sink.written(), 5);
        assert_eq!(sink.into_inner(), b"abcde");
    }

    #[tokio::test]
    async fn test_memory_sink_rejects_after_abort() {
        let mut sink = MemorySink::new();
        sink.push(Bytes::from_static(b"x")).await.unwrap();
        sink.abort().await.unwrap();
        assert!(sink.is_aborted());
        assert!(sink.push(Bytes::from_static(b"y")).await.is_err());
        assert_eq!(sink.data(), b"x");
    }
}
