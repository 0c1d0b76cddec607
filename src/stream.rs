//! Multiplexed packet streams and the per-connection stream registry.
//!
//! A stream is a sequence of STREAM-operation frames sharing one 16-bit id,
//! terminated by a zero-length frame (the close sentinel). Inbound stream
//! packets land in the stream's own bounded queue and never touch the
//! endpoint's incoming queue; outbound writes go through the endpoint's
//! shared write path.
//!
//! [`Stream`] is a cheaply cloneable handle. Closing a stream closes only
//! the stream, never the endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::endpoint::Shared;
use crate::error::{Error, Result};
use crate::protocol::{ops, Header, Packet};
use crate::queue::PacketQueue;
use crate::transport::Transport;

/// One live multiplexed stream.
pub struct Stream<T: Transport> {
    inner: Arc<StreamInner<T>>,
}

struct StreamInner<T: Transport> {
    id: u16,
    queue: PacketQueue,
    closed: AtomicBool,
    shared: Weak<Shared<T>>,
}

impl<T: Transport> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> Stream<T> {
    pub(crate) fn new(id: u16, shared: Weak<Shared<T>>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id,
                queue: PacketQueue::new(capacity),
                closed: AtomicBool::new(false),
                shared,
            }),
        }
    }

    /// The stream id shared by every packet on this stream.
    pub fn id(&self) -> u16 {
        self.inner.id
    }

    /// Whether the stream has been closed (locally or by the peer).
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Wait for the next packet on this stream.
    ///
    /// Returns [`Error::ConnectionClosed`] once the stream is closed and its
    /// queue is exhausted.
    pub async fn read_packet(&self) -> Result<Packet> {
        self.inner.queue.pop().await
    }

    /// Send a packet on this stream.
    ///
    /// The packet must already carry this stream's id and the STREAM
    /// operation; a mismatch fails with [`Error::InvalidOperation`] without
    /// touching the socket.
    pub async fn write_packet(&self, p: &Packet) -> Result<()> {
        if p.header.operation != ops::STREAM || p.header.id != self.inner.id {
            return Err(Error::InvalidOperation);
        }
        let shared = self
            .inner
            .shared
            .upgrade()
            .ok_or(Error::ConnectionClosed)?;
        shared.write_user_packet(p).await
    }

    /// Close the stream: send the zero-length close sentinel to the peer,
    /// drain readers with [`Error::ConnectionClosed`], and drop the id from
    /// the registry. Idempotent; a sentinel that cannot be delivered because
    /// the endpoint is closing is tolerated.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let res = match self.inner.shared.upgrade() {
            Some(shared) => {
                let sentinel = Packet::new(Header::new(self.inner.id, ops::STREAM, 0));
                let res = shared.write_user_packet(&sentinel).await;
                shared.remove_stream(self.inner.id);
                res
            }
            None => Ok(()),
        };
        self.inner.queue.close();

        match res {
            Err(Error::ConnectionClosed) => Ok(()),
            other => other,
        }
    }

    /// Drain readers without writing a sentinel. Used for peer-initiated
    /// closes and endpoint teardown.
    pub(crate) fn close_queue(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.queue.close();
    }

    pub(crate) fn push(&self, p: Packet) -> Result<()> {
        self.inner.queue.push(p)
    }
}

/// Map of live streams keyed by id.
///
/// `get` takes the shared lock; mutators take it exclusively.
pub(crate) struct StreamRegistry<T: Transport> {
    map: RwLock<HashMap<u16, Stream<T>>>,
}

impl<T: Transport> StreamRegistry<T> {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: u16) -> Option<Stream<T>> {
        self.map
            .read()
            .expect("stream registry lock poisoned")
            .get(&id)
            .cloned()
    }

    /// Return the stream with this id, constructing it if absent.
    pub fn create_if_absent(&self, id: u16, f: impl FnOnce() -> Stream<T>) -> Stream<T> {
        self.map
            .write()
            .expect("stream registry lock poisoned")
            .entry(id)
            .or_insert_with(f)
            .clone()
    }

    /// Construct a stream and register it, replacing any previous entry.
    pub fn create(&self, id: u16, f: impl FnOnce() -> Stream<T>) -> Stream<T> {
        let stream = f();
        self.map
            .write()
            .expect("stream registry lock poisoned")
            .insert(id, stream.clone());
        stream
    }

    pub fn remove(&self, id: u16) {
        self.map
            .write()
            .expect("stream registry lock poisoned")
            .remove(&id);
    }

    /// Drain every stream's readers. Entries are left in place; the endpoint
    /// is tearing down.
    pub fn close_all(&self) {
        let map = self.map.write().expect("stream registry lock poisoned");
        for stream in map.values() {
            stream.close_queue();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn orphan_stream(id: u16) -> Stream<DuplexStream> {
        Stream::new(id, Weak::new(), 16)
    }

    #[tokio::test]
    async fn test_stream_queue_fifo() {
        let stream = orphan_stream(7);
        for id in 0..3u32 {
            let mut p = Packet::new(Header::new(7, ops::STREAM, 0));
            p.set_content(&id.to_be_bytes());
            stream.push(p).unwrap();
        }
        for id in 0..3u32 {
            let p = stream.read_packet().await.unwrap();
            assert_eq!(&p.content[..], id.to_be_bytes());
        }
    }

    #[tokio::test]
    async fn test_close_queue_drains_readers() {
        let stream = orphan_stream(7);
        let reader = stream.clone();
        let task = tokio::spawn(async move { reader.read_packet().await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        stream.close_queue();

        assert!(matches!(task.await.unwrap(), Err(Error::ConnectionClosed)));
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn test_write_packet_rejects_wrong_header() {
        let stream = orphan_stream(7);

        let wrong_op = Packet::new(Header::new(7, 32, 0));
        assert!(matches!(
            stream.write_packet(&wrong_op).await,
            Err(Error::InvalidOperation)
        ));

        let wrong_id = Packet::new(Header::new(8, ops::STREAM, 0));
        assert!(matches!(
            stream.write_packet(&wrong_id).await,
            Err(Error::InvalidOperation)
        ));
    }

    #[tokio::test]
    async fn test_write_packet_without_endpoint_is_closed() {
        let stream = orphan_stream(7);
        let p = Packet::new(Header::new(7, ops::STREAM, 0));
        assert!(matches!(
            stream.write_packet(&p).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let stream = orphan_stream(7);
        stream.close().await.unwrap();
        stream.close().await.unwrap();
        assert!(stream.is_closed());
        assert!(matches!(
            stream.read_packet().await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[test]
    fn test_registry_create_if_absent_returns_existing() {
        let registry: StreamRegistry<DuplexStream> = StreamRegistry::new();
        let first = registry.create_if_absent(1, || orphan_stream(1));
        let second = registry.create_if_absent(1, || panic!("must not construct"));
        assert!(Arc::ptr_eq(&first.inner, &second.inner));
    }

    #[test]
    fn test_registry_create_overwrites() {
        let registry: StreamRegistry<DuplexStream> = StreamRegistry::new();
        let first = registry.create(1, || orphan_stream(1));
        let second = registry.create(1, || orphan_stream(1));
        assert!(!Arc::ptr_eq(&first.inner, &second.inner));
        let got = registry.get(1).unwrap();
        assert!(Arc::ptr_eq(&got.inner, &second.inner));
    }

    #[test]
    fn test_registry_remove() {
        let registry: StreamRegistry<DuplexStream> = StreamRegistry::new();
        registry.create(1, || orphan_stream(1));
        registry.remove(1);
        assert!(registry.get(1).is_none());
    }

    #[test]
    fn test_registry_close_all() {
        let registry: StreamRegistry<DuplexStream> = StreamRegistry::new();
        let a = registry.create(1, || orphan_stream(1));
        let b = registry.create(2, || orphan_stream(2));
        registry.close_all();
        assert!(a.is_closed());
        assert!(b.is_closed());
    }
}
