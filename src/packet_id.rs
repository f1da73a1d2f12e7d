//! Packet identifier allocation for broker-originated publishes

use std::sync::atomic::{AtomicU16, Ordering};

/// Issues packet identifiers for QoS 1/2 deliveries
pub trait PacketIdAllocator: Send + Sync {
    /// Next identifier; never 0
    fn next_id(&self) -> u16;
}

/// Node-wide counter shared by every delivery.
///
/// Identifiers advance monotonically and wrap from 65535 back to 1, so an
/// identifier is only reissued after 65535 further allocations.
#[derive(Debug)]
pub struct AtomicPacketIds {
    next: AtomicU16,
}

impl AtomicPacketIds {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Counter whose first allocation is `start` (or 1 if `start` is 0)
    pub fn starting_at(start: u16) -> Self {
        Self {
            next: AtomicU16::new(start),
        }
    }
}

impl Default for AtomicPacketIds {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdAllocator for AtomicPacketIds {
    fn next_id(&self) -> u16 {
        loop {
            // fetch_add wraps on overflow
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}
