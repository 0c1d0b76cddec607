//! Packet type and the process-wide packet pool.
//!
//! A [`Packet`] is the in-memory form of one frame: a decoded [`Header`] plus
//! a growable content buffer. Content buffers are expensive to allocate per
//! frame on hot paths, so packets are recycled through a process-wide pool:
//! [`acquire`] hands out a reset packet (fresh or recycled), [`release`]
//! resets it and returns it for reuse.
//!
//! Ownership makes the pool discipline safe by construction: a packet is a
//! value, so it cannot be released twice or used after release.

use std::sync::Mutex;

use bytes::BytesMut;

use super::wire_format::Header;

/// Default content buffer capacity for a fresh packet.
pub const DEFAULT_CONTENT_CAPACITY: usize = 512;

/// Upper bound on recycled packets retained by the pool.
const MAX_POOLED: usize = 1024;

static POOL: Mutex<Vec<Packet>> = Mutex::new(Vec::new());

/// One frame in memory: header plus payload buffer.
///
/// The content buffer's capacity may exceed `header.content_length`; only the
/// first `content_length` bytes are meaningful.
#[derive(Debug, Default)]
pub struct Packet {
    /// Frame header.
    pub header: Header,
    /// Payload bytes; length equals `header.content_length` once assembled.
    pub content: BytesMut,
}

impl Packet {
    /// Create a packet bypassing the pool.
    pub fn new(header: Header) -> Self {
        Self {
            header,
            content: BytesMut::with_capacity(DEFAULT_CONTENT_CAPACITY),
        }
    }

    /// Copy `bytes` into the content buffer and set `content_length` to
    /// match.
    pub fn set_content(&mut self, bytes: &[u8]) {
        self.content.clear();
        self.content.extend_from_slice(bytes);
        self.header.content_length = bytes.len() as u32;
    }

    /// Zero the header and clear the content, keeping capacity.
    pub(crate) fn reset(&mut self) {
        self.header = Header::default();
        self.content.clear();
    }
}

/// Take a packet from the pool, or allocate one if the pool is empty.
///
/// The returned packet has a zeroed header and an empty content buffer;
/// fresh allocations start with [`DEFAULT_CONTENT_CAPACITY`] bytes of
/// capacity, recycled ones keep whatever they grew to.
pub fn acquire() -> Packet {
    let recycled = POOL.lock().expect("packet pool lock poisoned").pop();
    recycled.unwrap_or_else(|| Packet::new(Header::default()))
}

/// Reset a packet and return it to the pool.
///
/// Packets beyond the pool's retention bound are dropped.
pub fn release(mut p: Packet) {
    p.reset();
    let mut pool = POOL.lock().expect("packet pool lock poisoned");
    if pool.len() < MAX_POOLED {
        pool.push(p);
    }
}
