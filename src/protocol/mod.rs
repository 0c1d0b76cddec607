//! Protocol layer: wire format, packets, and the packet pool.
//!
//! No I/O lives here. The endpoint owns the read/write machinery; this
//! module defines what travels over it.

pub mod header_pool;
pub mod packet;
pub mod wire_format;

pub use packet::{acquire, release, Packet, DEFAULT_CONTENT_CAPACITY};
pub use wire_format::{ops, Header, HEADER_SIZE};
