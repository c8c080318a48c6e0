//! In-process TUN device backed by bounded ring buffers.
//!
//! The gateway side ([`TunDevice`]) awaits inbound datagrams and pushes
//! synthesized replies; the platform side ([`TunHandle`]) feeds guest
//! packets in and drains outbound frames for delivery to the kernel
//! interface. Both are lightweight clones over the same shared ring.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

pub const DEFAULT_MTU: usize = 1500;
pub const RING_CAPACITY: usize = 512;
pub const MAX_DRAIN_BATCH: usize = 64;

struct SharedRing {
    inbound: VecDeque<Vec<u8>>,
    outbound: VecDeque<Vec<u8>>,
    capacity: usize,
    closed: bool,
}

impl SharedRing {
    fn new(capacity: usize) -> Self {
        Self {
            inbound: VecDeque::with_capacity(capacity),
            outbound: VecDeque::with_capacity(capacity),
            capacity,
            closed: false,
        }
    }
}

/// Gateway-side endpoint of the tunnel.
#[derive(Clone)]
pub struct TunDevice {
    inner: Arc<Mutex<SharedRing>>,
    inbound_wake: Arc<Notify>,
    outbound_wake: Arc<Notify>,
    mtu: usize,
}

/// Platform-side endpoint of the tunnel.
#[derive(Clone)]
pub struct TunHandle {
    inner: Arc<Mutex<SharedRing>>,
    inbound_wake: Arc<Notify>,
    outbound_wake: Arc<Notify>,
    mtu: usize,
}

impl TunDevice {
    pub fn new(mtu: usize, ring_capacity: usize) -> Self {
        let capacity = ring_capacity.max(16);
        Self {
            inner: Arc::new(Mutex::new(SharedRing::new(capacity))),
            inbound_wake: Arc::new(Notify::new()),
            outbound_wake: Arc::new(Notify::new()),
            mtu: mtu.max(576),
        }
    }

    pub fn handle(&self) -> TunHandle {
        TunHandle {
            inner: Arc::clone(&self.inner),
            inbound_wake: Arc::clone(&self.inbound_wake),
            outbound_wake: Arc::clone(&self.outbound_wake),
            mtu: self.mtu,
        }
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Await the next inbound datagram. Returns `None` once the device is
    /// closed and the inbound ring is drained.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        loop {
            {
                let mut guard = self.inner.lock();
                if let Some(packet) = guard.inbound.pop_front() {
                    return Some(packet);
                }
                if guard.closed {
                    return None;
                }
            }
            self.inbound_wake.notified().await;
        }
    }

    /// Push one synthesized datagram toward the guest. The ring is bounded;
    /// under overload the oldest outbound frame is dropped.
    pub fn send(&self, packet: &[u8]) {
        if packet.is_empty() {
            return;
        }
        let mut guard = self.inner.lock();
        if guard.closed {
            return;
        }
        if guard.outbound.len() >= guard.capacity {
            guard.outbound.pop_front();
        }
        guard.outbound.push_back(packet.to_vec());
        drop(guard);
        self.outbound_wake.notify_one();
    }

    /// Close both directions. Idempotent; wakes every waiter.
    pub fn close(&self) {
        {
            let mut guard = self.inner.lock();
            guard.closed = true;
        }
        self.inbound_wake.notify_waiters();
        self.outbound_wake.notify_waiters();
        // A waiter registering after notify_waiters still observes `closed`
        // on its next queue check; stored permits cover the rest.
        self.inbound_wake.notify_one();
        self.outbound_wake.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl TunHandle {
    /// Push a copy of `packet` into the inbound ring. Returns `false` if
    /// the device is closed or the packet is empty; under overload the
    /// oldest queued packet is dropped.
    pub fn push_inbound(&self, packet: &[u8]) -> bool {
        if packet.is_empty() || packet.len() > self.mtu {
            return false;
        }
        let mut guard = self.inner.lock();
        if guard.closed {
            return false;
        }
        if guard.inbound.len() >= guard.capacity {
            guard.inbound.pop_front();
        }
        guard.inbound.push_back(packet.to_vec());
        drop(guard);
        self.inbound_wake.notify_one();
        true
    }

    /// Drain up to [`MAX_DRAIN_BATCH`] outbound frames without blocking.
    pub fn drain_outbound(&self) -> Vec<Vec<u8>> {
        let mut guard = self.inner.lock();
        let drain_count = MAX_DRAIN_BATCH.min(guard.outbound.len());
        guard.outbound.drain(..drain_count).collect()
    }

    /// Await the next outbound frame. Returns `None` once the device is
    /// closed and the outbound ring is drained.
    pub async fn next_outbound(&self) -> Option<Vec<u8>> {
        loop {
            {
                let mut guard = self.inner.lock();
                if let Some(frame) = guard.outbound.pop_front() {
                    return Some(frame);
                }
                if guard.closed {
                    return None;
                }
            }
            self.outbound_wake.notified().await;
        }
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }
}
