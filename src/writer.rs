//! Buffered, mutex-guarded writing over the socket write half.
//!
//! All outbound bytes funnel through one [`BufferedWriter`]: user packets,
//! ping-loop probes, and the read loop's pong replies. Writes coalesce in a
//! fixed-capacity buffer and reach the socket when the buffer spills or when
//! the flush loop (or a caller) forces a flush.
//!
//! A frame's header and payload are written under a single lock acquisition,
//! so concurrent writers can never interleave one packet's header with
//! another's payload. `buffered()` reads an atomic snapshot maintained under
//! the lock and never blocks.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::error::{Error, Result};

struct WriterInner<W> {
    io: W,
    buf: BytesMut,
}

/// Write-coalescing wrapper around the socket write half.
pub(crate) struct BufferedWriter<W> {
    inner: Mutex<Option<WriterInner<W>>>,
    buffered: AtomicUsize,
    capacity: usize,
    deadline: Duration,
}

impl<W: AsyncWrite + Unpin> BufferedWriter<W> {
    /// Wrap `io` with a buffer of `capacity` bytes and a per-write deadline.
    pub fn new(io: W, capacity: usize, deadline: Duration) -> Self {
        Self {
            inner: Mutex::new(Some(WriterInner {
                io,
                buf: BytesMut::with_capacity(capacity),
            })),
            buffered: AtomicUsize::new(0),
            capacity,
            deadline,
        }
    }

    /// Bytes currently coalesced and not yet flushed. Non-blocking snapshot.
    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    /// Write one frame (header, then payload) atomically with respect to
    /// other writers.
    pub async fn write_frame(&self, header: &[u8], content: &[u8]) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let inner = guard.as_mut().ok_or(Error::ConnectionClosed)?;

        let res = async {
            write_bytes(inner, self.capacity, self.deadline, header).await?;
            if !content.is_empty() {
                write_bytes(inner, self.capacity, self.deadline, content).await?;
            }
            Ok(())
        }
        .await;
        self.buffered.store(inner.buf.len(), Ordering::Release);
        res
    }

    /// Push every coalesced byte to the socket.
    pub async fn flush(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let inner = guard.as_mut().ok_or(Error::ConnectionClosed)?;

        let res = async {
            flush_buf(inner, self.deadline).await?;
            with_deadline(self.deadline, inner.io.flush()).await
        }
        .await;
        self.buffered.store(inner.buf.len(), Ordering::Release);
        res
    }

    /// Shut the socket write side down (sends FIN on TCP). Errors ignored.
    pub async fn shutdown(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(inner) = guard.as_mut() {
            let _ = timeout(self.deadline, inner.io.shutdown()).await;
        }
    }

    /// Remove and return the underlying write half.
    ///
    /// Subsequent writes fail with [`Error::ConnectionClosed`].
    pub async fn take_io(&self) -> Option<W> {
        let mut guard = self.inner.lock().await;
        guard.take().map(|inner| inner.io)
    }
}

async fn write_bytes<W: AsyncWrite + Unpin>(
    inner: &mut WriterInner<W>,
    capacity: usize,
    deadline: Duration,
    bytes: &[u8],
) -> Result<()> {
    if inner.buf.len() + bytes.len() > capacity {
        flush_buf(inner, deadline).await?;
    }
    if bytes.len() >= capacity {
        // Oversized writes bypass the buffer entirely.
        with_deadline(deadline, inner.io.write_all(bytes)).await
    } else {
        inner.buf.extend_from_slice(bytes);
        Ok(())
    }
}

async fn flush_buf<W: AsyncWrite + Unpin>(
    inner: &mut WriterInner<W>,
    deadline: Duration,
) -> Result<()> {
    if inner.buf.is_empty() {
        return Ok(());
    }
    with_deadline(deadline, inner.io.write_all(&inner.buf)).await?;
    inner.buf.clear();
    Ok(())
}

async fn with_deadline<F, T>(deadline: Duration, fut: F) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match timeout(deadline, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write deadline exceeded").into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Header, HEADER_SIZE};
    use std::sync::Arc;
    use tokio::io::{duplex, AsyncReadExt};

    const DEADLINE: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_small_writes_coalesce() {
        let (client, _server) = duplex(4096);
        let writer = BufferedWriter::new(client, 1024, DEADLINE);

        let header = Header::new(1, 32, 5).encode();
        writer.write_frame(&header, b"hello").await.unwrap();

        assert_eq!(writer.buffered(), HEADER_SIZE + 5);
    }

    #[tokio::test]
    async fn test_flush_drains_buffer() {
        let (client, mut server) = duplex(4096);
        let writer = BufferedWriter::new(client, 1024, DEADLINE);

        let header = Header::new(1, 32, 5).encode();
        writer.write_frame(&header, b"hello").await.unwrap();
        writer.flush().await.unwrap();
        assert_eq!(writer.buffered(), 0);

        let mut buf = vec![0u8; HEADER_SIZE + 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(Header::decode(&buf).unwrap(), Header::new(1, 32, 5));
        assert_eq!(&buf[HEADER_SIZE..], b"hello");
    }

    #[tokio::test]
    async fn test_oversized_write_bypasses_buffer() {
        let (client, mut server) = duplex(4096);
        let writer = BufferedWriter::new(client, 16, DEADLINE);

        let content = vec![0xAB; 64];
        let header = Header::new(1, 32, 64).encode();
        writer.write_frame(&header, &content).await.unwrap();

        // Header spilled with the buffer, payload went straight through.
        assert_eq!(writer.buffered(), 0);
        let mut buf = vec![0u8; HEADER_SIZE + 64];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[HEADER_SIZE..], &content[..]);
    }

    #[tokio::test]
    async fn test_spill_when_buffer_fills() {
        let (client, mut server) = duplex(4096);
        let writer = BufferedWriter::new(client, 32, DEADLINE);

        // Three 12-byte frames against a 32-byte buffer force a spill.
        let header = Header::new(1, 32, 4).encode();
        for _ in 0..3 {
            writer.write_frame(&header, b"abcd").await.unwrap();
        }
        writer.flush().await.unwrap();

        let mut buf = vec![0u8; 3 * (HEADER_SIZE + 4)];
        server.read_exact(&mut buf).await.unwrap();
        for chunk in buf.chunks(HEADER_SIZE + 4) {
            assert_eq!(Header::decode(chunk).unwrap(), Header::new(1, 32, 4));
            assert_eq!(&chunk[HEADER_SIZE..], b"abcd");
        }
    }

    #[tokio::test]
    async fn test_concurrent_frames_never_interleave() {
        let (client, mut server) = duplex(64 * 1024);
        let writer = Arc::new(BufferedWriter::new(client, 256, DEADLINE));

        let mut tasks = Vec::new();
        for id in 0u16..4 {
            let writer = writer.clone();
            tasks.push(tokio::spawn(async move {
                let content = vec![id as u8; 100];
                let header = Header::new(id, 32, 100).encode();
                for _ in 0..25 {
                    writer.write_frame(&header, &content).await.unwrap();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        writer.flush().await.unwrap();

        let total = 4 * 25 * (HEADER_SIZE + 100);
        let mut buf = vec![0u8; total];
        server.read_exact(&mut buf).await.unwrap();

        // Every frame must be self-consistent: payload byte == header id.
        let mut offset = 0;
        while offset < total {
            let header = Header::decode(&buf[offset..offset + HEADER_SIZE]).unwrap();
            assert_eq!(header.content_length, 100);
            offset += HEADER_SIZE;
            let payload = &buf[offset..offset + 100];
            assert!(payload.iter().all(|&b| b == header.id as u8));
            offset += 100;
        }
    }

    #[tokio::test]
    async fn test_write_after_take_io_fails() {
        let (client, _server) = duplex(4096);
        let writer = BufferedWriter::new(client, 1024, DEADLINE);

        let _io = writer.take_io().await.unwrap();
        let header = Header::new(1, 32, 0).encode();
        let res = writer.write_frame(&header, b"").await;
        assert!(matches!(res, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_write_deadline_expires_when_peer_stalls() {
        // Tiny duplex capacity and no reader: the spill cannot complete.
        let (client, _server) = duplex(8);
        let writer = BufferedWriter::new(client, 16, Duration::from_millis(50));

        let content = vec![0u8; 64];
        let header = Header::new(1, 32, 64).encode();
        let res = writer.write_frame(&header, &content).await;
        match res {
            Err(Error::Io(err)) => assert_eq!(err.kind(), io::ErrorKind::TimedOut),
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
