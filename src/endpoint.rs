//! The per-connection engine.
//!
//! An [`Endpoint`] owns one byte stream and runs three background tasks over
//! it:
//!
//! - the **read loop** reassembles frames across arbitrary read boundaries
//!   and routes each packet to the incoming queue, a stream queue, or the
//!   ping/pong fast path;
//! - the **flush loop** drains the write buffer whenever the coalesced
//!   wake-up signal fires;
//! - the **ping loop** sends a PING every interval so both sides notice a
//!   dead peer.
//!
//! User tasks call [`Endpoint::write_packet`] / [`Endpoint::read_packet`]
//! concurrently with the loops. Shutdown is idempotent, joins all three
//! tasks, and preserves packets that were parsed before close in a stale
//! buffer so late readers can still collect them.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{split, AsyncReadExt, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::{header_pool, ops, packet, Header, Packet, HEADER_SIZE};
use crate::queue::{PacketQueue, StalePackets};
use crate::stream::{Stream, StreamRegistry};
use crate::transport::{dialer, TlsConnectionState, Transport};
use crate::writer::BufferedWriter;

/// Default size of the write buffer, the read buffer, and the incoming
/// queue capacity.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Default deadline applied to each socket read and write.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(5);

/// Default interval between keep-alive pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(500);

/// Slots in the flush wake-up channel; sends beyond this are dropped.
const FLUSH_SIGNAL_CAPACITY: usize = 3;

/// Boxed future returned by a new-stream handler.
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Callback invoked (in its own task) for the first packet of a
/// previously-unseen inbound stream.
pub type NewStreamHandler<T> = Arc<dyn Fn(Stream<T>) -> BoxFuture + Send + Sync>;

/// Tunables for an endpoint.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Write buffer capacity, read buffer initial capacity, and packet
    /// queue capacity.
    pub buffer_size: usize,
    /// Deadline for each socket read and write.
    pub deadline: Duration,
    /// Keep-alive ping interval.
    pub ping_interval: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            deadline: DEFAULT_DEADLINE,
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }
}

/// State shared between the endpoint handle, its background tasks, and its
/// streams.
pub(crate) struct Shared<T: Transport> {
    config: EndpointConfig,
    closed: AtomicBool,
    error: OnceLock<Error>,
    writer: BufferedWriter<WriteHalf<T>>,
    incoming: PacketQueue,
    stale: StalePackets,
    streams: StreamRegistry<T>,
    flush_tx: mpsc::Sender<()>,
    close_tx: watch::Sender<bool>,
    new_stream_handler: StdMutex<Option<NewStreamHandler<T>>>,
    /// Waitgroup receiver: each loop holds a sender clone, dropped on exit.
    done_rx: TokioMutex<Option<mpsc::Receiver<()>>>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    tls_state: Option<TlsConnectionState>,
}

/// One framed, multiplexed, keep-alive connection.
pub struct Endpoint<T: Transport> {
    shared: Arc<Shared<T>>,
    read_task: StdMutex<Option<JoinHandle<ReadHalf<T>>>>,
}

impl Endpoint<TcpStream> {
    /// Dial `addr` over TCP (with retry) and wrap the connection.
    pub async fn connect<A: ToSocketAddrs + Clone>(addr: A) -> Result<Self> {
        Ok(Self::new(dialer::dial(addr).await?))
    }
}

impl Endpoint<tokio_rustls::client::TlsStream<TcpStream>> {
    /// Dial `addr` (with retry), complete a TLS handshake, and wrap the
    /// connection.
    pub async fn connect_tls<A: ToSocketAddrs + Clone>(
        addr: A,
        server_name: ServerName<'static>,
        config: Arc<ClientConfig>,
    ) -> Result<Self> {
        Ok(Self::new(
            dialer::dial_tls(addr, server_name, config).await?,
        ))
    }
}

impl<T: Transport> Endpoint<T> {
    /// Wrap an established connection with default configuration.
    pub fn new(conn: T) -> Self {
        Self::with_config(conn, EndpointConfig::default())
    }

    /// Wrap an established connection.
    pub fn with_config(conn: T, config: EndpointConfig) -> Self {
        Self::start(conn, config, None)
    }

    /// Wrap an established connection and install a new-stream handler
    /// before the read loop starts, so no early stream packet can be
    /// dropped.
    pub fn with_stream_handler<F, Fut>(conn: T, config: EndpointConfig, handler: F) -> Self
    where
        F: Fn(Stream<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::start(conn, config, Some(box_handler(handler)))
    }

    fn start(conn: T, config: EndpointConfig, handler: Option<NewStreamHandler<T>>) -> Self {
        let local_addr = conn.local_addr();
        let peer_addr = conn.peer_addr();
        let tls_state = conn.connection_state().ok();
        let (read_half, write_half) = split(conn);

        let (flush_tx, flush_rx) = mpsc::channel(FLUSH_SIGNAL_CAPACITY);
        let (close_tx, _) = watch::channel(false);
        let (done_tx, done_rx) = mpsc::channel::<()>(1);

        let shared = Arc::new(Shared {
            writer: BufferedWriter::new(write_half, config.buffer_size, config.deadline),
            incoming: PacketQueue::new(config.buffer_size),
            stale: StalePackets::new(),
            streams: StreamRegistry::new(),
            closed: AtomicBool::new(false),
            error: OnceLock::new(),
            new_stream_handler: StdMutex::new(handler),
            done_rx: TokioMutex::new(Some(done_rx)),
            flush_tx,
            close_tx,
            local_addr,
            peer_addr,
            tls_state,
            config,
        });

        let flush_shared = shared.clone();
        let flush_closed = shared.close_tx.subscribe();
        let flush_done = done_tx.clone();
        tokio::spawn(async move {
            let res = flush_loop(&flush_shared, flush_rx, flush_closed).await;
            drop(flush_done);
            if let Err(err) = res {
                let _ = flush_shared.close_with_error(err).await;
            }
        });

        let ping_shared = shared.clone();
        let ping_closed = shared.close_tx.subscribe();
        let ping_done = done_tx.clone();
        tokio::spawn(async move {
            let res = ping_loop(&ping_shared, ping_closed).await;
            drop(ping_done);
            if let Err(err) = res {
                let _ = ping_shared.close_with_error(err).await;
            }
        });

        let read_shared = shared.clone();
        let read_closed = shared.close_tx.subscribe();
        let read_task = tokio::spawn(async move {
            let mut io = read_half;
            let res = read_loop(&read_shared, &mut io, read_closed).await;
            drop(done_tx);
            if let Err(err) = res {
                let _ = read_shared.close_with_error(err).await;
            }
            io
        });

        Self {
            shared,
            read_task: StdMutex::new(Some(read_task)),
        }
    }

    /// Queue a packet for sending.
    ///
    /// Fails with [`Error::InvalidOperation`] for reserved operations
    /// (`0..=9`) and [`Error::InvalidContentLength`] when the declared
    /// content length disagrees with the buffer; neither touches the socket
    /// or the connection state. An underlying write failure error-closes the
    /// endpoint and returns the original cause ([`Error::ConnectionClosed`]
    /// if another failure won that race).
    pub async fn write_packet(&self, p: &Packet) -> Result<()> {
        if p.header.operation <= ops::RESERVED_MAX {
            return Err(Error::InvalidOperation);
        }
        self.shared.write_user_packet(p).await
    }

    /// Wait for the next non-stream packet.
    ///
    /// After close, packets parsed before shutdown are returned first; once
    /// they are exhausted every call fails with [`Error::ConnectionClosed`].
    pub async fn read_packet(&self) -> Result<Packet> {
        if self.shared.closed() {
            if let Some(p) = self.shared.stale.poll() {
                return Ok(p);
            }
            debug!("read on closed connection with no stale packets left");
            return Err(Error::ConnectionClosed);
        }

        match self.shared.incoming.pop().await {
            Ok(p) => Ok(p),
            Err(err) => {
                if self.shared.closed() {
                    if let Some(p) = self.shared.stale.poll() {
                        return Ok(p);
                    }
                    return Err(Error::ConnectionClosed);
                }
                debug!(error = %err, "error while popping from packet queue");
                Err(err)
            }
        }
    }

    /// Force a write-buffer flush. A flush failure error-closes the
    /// endpoint.
    pub async fn flush(&self) -> Result<()> {
        match self.shared.flush_raw().await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.shared.close_with_error(err).await),
        }
    }

    /// Return the stream with this id, creating it if absent.
    pub fn new_stream(&self, id: u16) -> Stream<T> {
        let weak = Arc::downgrade(&self.shared);
        let capacity = self.shared.config.buffer_size;
        self.shared
            .streams
            .create_if_absent(id, || Stream::new(id, weak, capacity))
    }

    /// Install or replace the new-stream handler.
    ///
    /// The handler runs in its own task for the first packet of each
    /// previously-unseen inbound stream. Without a handler, inbound stream
    /// packets are dropped (close sentinels are still honoured).
    pub fn set_new_stream_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Stream<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *self
            .shared
            .new_stream_handler
            .lock()
            .expect("stream handler lock poisoned") = Some(box_handler(handler));
    }

    /// Gracefully shut the endpoint down.
    ///
    /// Idempotent: concurrent and repeated calls all return `Ok`. Returns
    /// only after every background task has terminated.
    pub async fn close(&self) -> Result<()> {
        match self.shared.close_inner().await {
            Ok(()) => {
                self.shared.writer.shutdown().await;
                Ok(())
            }
            Err(Error::ConnectionClosed) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Disable the engine and return the underlying connection.
    ///
    /// The endpoint is torn down gracefully (loops joined, state drained)
    /// but the socket itself is left open for use outside this protocol.
    pub async fn raw(self) -> Result<T> {
        let _ = self.shared.close_inner().await;
        let handle = self
            .read_task
            .lock()
            .expect("read task lock poisoned")
            .take()
            .ok_or(Error::ConnectionClosed)?;
        let read_half = handle
            .await
            .map_err(|err| Error::from(io::Error::new(io::ErrorKind::Other, err)))?;
        let write_half = self
            .shared
            .writer
            .take_io()
            .await
            .ok_or(Error::ConnectionClosed)?;
        Ok(read_half.unsplit(write_half))
    }

    /// Local socket address, when the transport has one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    /// Remote socket address, when the transport has one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    /// TLS session snapshot captured when the endpoint was built.
    ///
    /// Fails with [`Error::NotTlsConnection`] on plain connections.
    pub fn connection_state(&self) -> Result<TlsConnectionState> {
        self.shared
            .tls_state
            .clone()
            .ok_or(Error::NotTlsConnection)
    }

    /// Whether the endpoint is closed. Terminal once true.
    pub fn closed(&self) -> bool {
        self.shared.closed()
    }

    /// The error that closed the endpoint, if it closed because of one.
    pub fn error(&self) -> Option<Error> {
        self.shared.error.get().cloned()
    }

    /// A receiver that observes the close signal exactly once.
    pub fn close_channel(&self) -> watch::Receiver<bool> {
        self.shared.close_tx.subscribe()
    }

    /// Bytes currently coalesced in the write buffer; zero once closed.
    pub fn write_buffer_size(&self) -> usize {
        if self.shared.closed() {
            return 0;
        }
        self.shared.writer.buffered()
    }
}

fn box_handler<T, F, Fut>(handler: F) -> NewStreamHandler<T>
where
    T: Transport,
    F: Fn(Stream<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |stream: Stream<T>| -> BoxFuture { Box::pin(handler(stream)) })
}

impl<T: Transport> Shared<T> {
    pub(crate) fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn snapshot_stream_handler(&self) -> Option<NewStreamHandler<T>> {
        self.new_stream_handler
            .lock()
            .expect("stream handler lock poisoned")
            .clone()
    }

    pub(crate) fn remove_stream(&self, id: u16) {
        self.streams.remove(id);
    }

    /// Validate and write a packet without the reserved-operation check and
    /// without initiating error-close; callers own the close decision.
    pub(crate) async fn write_packet_inner(&self, p: &Packet) -> Result<()> {
        if p.header.content_length as usize != p.content.len() {
            return Err(Error::InvalidContentLength);
        }
        if self.closed() {
            return Err(Error::ConnectionClosed);
        }

        let encoded = header_pool::encode_pooled(&p.header);
        if let Err(err) = self.writer.write_frame(&encoded, &p.content).await {
            if self.closed() {
                debug!(id = p.header.id, "write raced with connection close");
                return Err(Error::ConnectionClosed);
            }
            debug!(id = p.header.id, error = %err, "error while writing packet");
            return Err(err);
        }

        // Coalesced wake-up; a full channel means a flush is already due.
        let _ = self.flush_tx.try_send(());
        Ok(())
    }

    /// Write on behalf of a user task: validation errors pass through
    /// untouched, I/O failures error-close the endpoint.
    pub(crate) async fn write_user_packet(self: &Arc<Self>, p: &Packet) -> Result<()> {
        match self.write_packet_inner(p).await {
            Ok(()) => Ok(()),
            Err(err @ (Error::InvalidContentLength | Error::ConnectionClosed)) => Err(err),
            Err(err) => Err(self.close_with_error(err).await),
        }
    }

    /// Flush without initiating error-close; callers own the close decision.
    async fn flush_raw(&self) -> Result<()> {
        if self.closed() {
            return Err(Error::ConnectionClosed);
        }
        if self.writer.buffered() > 0 {
            if let Err(err) = self.writer.flush().await {
                debug!(error = %err, "error while flushing write buffer");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Graceful teardown. Exactly one caller wins the race; everyone else
    /// gets [`Error::ConnectionClosed`].
    pub(crate) async fn close_inner(self: &Arc<Self>) -> Result<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::ConnectionClosed);
        }

        debug!("connection close started, stopping background tasks");
        self.incoming.close();
        let _ = self.close_tx.send(true);

        // Wait until every loop has dropped its waitgroup guard.
        if let Some(mut done) = self.done_rx.lock().await.take() {
            while done.recv().await.is_some() {}
        }

        self.stale.set(self.incoming.drain());
        self.streams.close_all();

        if self.writer.buffered() > 0 {
            let _ = self.writer.flush().await;
        }
        Ok(())
    }

    /// Error teardown: the first cause wins and is retrievable afterwards;
    /// later callers get [`Error::ConnectionClosed`] back.
    pub(crate) async fn close_with_error(self: &Arc<Self>, err: Error) -> Error {
        match self.close_inner().await {
            Err(close_err) => {
                debug!(cause = %err, "close raced with an earlier close");
                close_err
            }
            Ok(()) => {
                debug!(cause = %err, "closing connection with error");
                let _ = self.error.set(err.clone());
                self.writer.shutdown().await;
                err
            }
        }
    }
}

/// Drain the flush signal, flushing once per token, until close.
async fn flush_loop<T: Transport>(
    shared: &Arc<Shared<T>>,
    mut flush_rx: mpsc::Receiver<()>,
    mut closed_rx: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = closed_rx.changed() => return Ok(()),
            sig = flush_rx.recv() => match sig {
                Some(()) => shared.flush_raw().await?,
                None => return Ok(()),
            },
        }
    }
}

/// Send a PING every interval until close.
async fn ping_loop<T: Transport>(
    shared: &Arc<Shared<T>>,
    mut closed_rx: watch::Receiver<bool>,
) -> Result<()> {
    let mut ticker = interval(shared.config.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the peer does not need it.
    ticker.tick().await;

    let ping = Packet::new(Header::new(0, ops::PING, 0));
    loop {
        tokio::select! {
            _ = closed_rx.changed() => return Ok(()),
            _ = ticker.tick() => {
                trace!("sending keep-alive ping");
                shared.write_packet_inner(&ping).await?;
            }
        }
    }
}

/// Reassemble frames from the socket and route them until close or error.
async fn read_loop<T: Transport>(
    shared: &Arc<Shared<T>>,
    io: &mut ReadHalf<T>,
    mut closed_rx: watch::Receiver<bool>,
) -> Result<()> {
    let mut buf = BytesMut::with_capacity(shared.config.buffer_size);
    let pong = Packet::new(Header::new(0, ops::PONG, 0));

    loop {
        while buf.len() < HEADER_SIZE {
            read_more(io, &mut buf, shared.config.deadline, &mut closed_rx).await?;
        }
        let header = Header::decode(&buf)?;
        buf.advance(HEADER_SIZE);

        // Dispatch by operation before touching the payload; stream lookups
        // snapshot the handler under its lock and never hold it further.
        let mut handler = None;
        let mut stream = None;
        match header.operation {
            ops::PING => {
                trace!("ping received, replying with pong");
                shared.write_packet_inner(&pong).await?;
            }
            ops::PONG => {
                trace!("pong received");
            }
            ops::STREAM => {
                handler = shared.snapshot_stream_handler();
                if handler.is_some() || header.content_length == 0 {
                    stream = shared.streams.get(header.id);
                }
            }
            _ => {}
        }

        let mut p = packet::acquire();
        p.header = header;
        let needed = header.content_length as usize;
        if needed > 0 {
            let take = needed.min(buf.len());
            p.content.extend_from_slice(&buf[..take]);
            buf.advance(take);
            while p.content.len() < needed {
                read_more(io, &mut buf, shared.config.deadline, &mut closed_rx).await?;
                let take = (needed - p.content.len()).min(buf.len());
                p.content.extend_from_slice(&buf[..take]);
                buf.advance(take);
            }
        }

        match header.operation {
            ops::PING | ops::PONG => packet::release(p),
            ops::STREAM => {
                if header.content_length == 0 {
                    // Close sentinel; honoured whether or not a handler is
                    // installed.
                    if let Some(stream) = stream {
                        stream.close_queue();
                        shared.streams.remove(header.id);
                    }
                    packet::release(p);
                } else if let Some(handler) = handler {
                    let stream = match stream {
                        Some(stream) => stream,
                        None => {
                            let weak = Arc::downgrade(shared);
                            let capacity = shared.config.buffer_size;
                            let stream = shared
                                .streams
                                .create(header.id, || Stream::new(header.id, weak, capacity));
                            tokio::spawn(handler(stream.clone()));
                            stream
                        }
                    };
                    if let Err(err) = stream.push(p) {
                        debug!(id = header.id, error = %err, "error while pushing to stream queue");
                        return Err(err);
                    }
                } else {
                    debug!(id = header.id, "stream packet discarded, no handler installed");
                    packet::release(p);
                }
            }
            _ => {
                if let Err(err) = shared.incoming.push(p) {
                    debug!(error = %err, "error while pushing to incoming packet queue");
                    return Err(err);
                }
            }
        }
    }
}

/// One socket read: appends at least one byte to `buf`, bounded by the
/// deadline and raced against the close signal.
async fn read_more<T: Transport>(
    io: &mut ReadHalf<T>,
    buf: &mut BytesMut,
    deadline: Duration,
    closed_rx: &mut watch::Receiver<bool>,
) -> Result<()> {
    tokio::select! {
        _ = closed_rx.changed() => Err(Error::ConnectionClosed),
        res = timeout(deadline, io.read_buf(buf)) => match res {
            Ok(Ok(0)) => {
                Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer").into())
            }
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "read deadline exceeded").into())
            }
        },
    }
}
