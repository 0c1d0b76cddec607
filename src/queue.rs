//! Bounded packet queues.
//!
//! [`PacketQueue`] is the FIFO behind the endpoint's incoming channel and
//! every stream: producers push fully-parsed packets, a single consumer pops
//! them. Closing the queue wakes all waiters with [`Error::ConnectionClosed`]
//! and freezes pushes; whatever was queued at close time can be recovered
//! once with [`PacketQueue::drain`].
//!
//! [`StalePackets`] holds that drained residue across shutdown so late
//! readers can still collect packets that were parsed before close.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::protocol::Packet;

/// Bounded FIFO of parsed packets with close semantics.
pub(crate) struct PacketQueue {
    items: Mutex<VecDeque<Packet>>,
    capacity: usize,
    closed: AtomicBool,
    notify: Notify,
}

impl PacketQueue {
    /// Create a queue holding at most `capacity` packets.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Append a packet.
    ///
    /// Fails with [`Error::ConnectionClosed`] once the queue is closed and
    /// with [`Error::QueueFull`] at capacity; a full queue means the consumer
    /// cannot keep up and the connection is deemed failed by the caller.
    pub fn push(&self, p: Packet) -> Result<()> {
        {
            let mut items = self.items.lock().expect("packet queue lock poisoned");
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::ConnectionClosed);
            }
            if items.len() >= self.capacity {
                return Err(Error::QueueFull);
            }
            items.push_back(p);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Remove and return the oldest packet, waiting until one is available.
    ///
    /// Returns [`Error::ConnectionClosed`] once the queue is closed and
    /// empty.
    pub async fn pop(&self) -> Result<Packet> {
        loop {
            // Register interest before re-checking so a push between the
            // check and the await leaves a stored permit.
            let notified = self.notify.notified();
            {
                let mut items = self.items.lock().expect("packet queue lock poisoned");
                if let Some(p) = items.pop_front() {
                    return Ok(p);
                }
                if self.closed.load(Ordering::Acquire) {
                    return Err(Error::ConnectionClosed);
                }
            }
            notified.await;
        }
    }

    /// Close the queue and wake every waiter. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        // Also store a permit for a consumer that checked the queue but has
        // not parked yet.
        self.notify.notify_one();
    }

    /// Take every remaining packet. Meaningful only after close.
    pub fn drain(&self) -> Vec<Packet> {
        let mut items = self.items.lock().expect("packet queue lock poisoned");
        items.drain(..).collect()
    }
}

/// Parsed-but-undelivered packets preserved across close.
///
/// Populated exactly once during shutdown; polled by late `read_packet`
/// callers until exhausted.
pub(crate) struct StalePackets {
    items: Mutex<VecDeque<Packet>>,
}

impl StalePackets {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    /// Replace the residue with the drained queue contents.
    pub fn set(&self, packets: Vec<Packet>) {
        let mut items = self.items.lock().expect("stale packets lock poisoned");
        *items = packets.into();
    }

    /// Pop the oldest preserved packet, if any remain.
    pub fn poll(&self) -> Option<Packet> {
        let mut items = self.items.lock().expect("stale packets lock poisoned");
        items.pop_front()
    }
}
