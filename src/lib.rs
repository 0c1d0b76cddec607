//! # framelink
//!
//! Asynchronous, framed, bidirectional packet transport for reliable byte
//! streams (TCP, optionally TLS).
//!
//! One [`Endpoint`] wraps one connection and multiplexes three concerns over
//! it: id-correlated packets with user-defined operation codes, keep-alive
//! ping/pong, and packet [`Stream`]s sharing an id. Frames are 8-byte
//! big-endian headers followed by their payload; the read loop reassembles
//! them across arbitrary read boundaries.
//!
//! ## Example
//!
//! ```ignore
//! use framelink::{ops, packet, Endpoint};
//!
//! #[tokio::main]
//! async fn main() -> framelink::Result<()> {
//!     let endpoint = Endpoint::connect("127.0.0.1:9000").await?;
//!
//!     let mut p = packet::acquire();
//!     p.header.id = 1;
//!     p.header.operation = 32;
//!     p.set_content(b"hello");
//!     endpoint.write_packet(&p).await?;
//!     packet::release(p);
//!
//!     let reply = endpoint.read_packet().await?;
//!     println!("reply: {:?}", reply.content);
//!     packet::release(reply);
//!
//!     endpoint.close().await
//! }
//! ```

pub mod endpoint;
pub mod error;
pub mod protocol;
pub mod transport;

mod queue;
mod stream;
mod writer;

pub use endpoint::{
    BoxFuture, Endpoint, EndpointConfig, NewStreamHandler, DEFAULT_BUFFER_SIZE, DEFAULT_DEADLINE,
    DEFAULT_PING_INTERVAL,
};
pub use error::{Error, Result};
pub use protocol::{ops, packet, Header, Packet, HEADER_SIZE};
pub use stream::Stream;
pub use transport::{dialer, TlsConnectionState, Transport};
