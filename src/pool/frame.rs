//! Completed output frame

use bytes::Bytes;
use std::time::Duration;

use super::slot::SlotId;

/// One unit of processed media bound to an output slot
///
/// The frame holds the slot until it is passed back to
/// [`BufferPool::release`](super::BufferPool::release). The payload is a copy,
/// so it stays valid after release. Frames returned by a drain come back
/// detached: their slots were recycled during the drain.
#[derive(Debug, Clone)]
pub struct Frame {
    data: Bytes,
    /// Presentation timestamp carried over from the matching input
    pub timestamp: Duration,
    /// Position in the pool's output order, starting at 0
    pub sequence: u64,
    /// The device flagged the payload as damaged
    pub corrupted: bool,
    slot: SlotId,
    /// The slot was already recycled; releasing is a no-op
    detached: bool,
}

impl Frame {
    pub(crate) fn new(
        data: Bytes,
        timestamp: Duration,
        sequence: u64,
        corrupted: bool,
        slot: SlotId,
    ) -> Self {
        Self {
            data,
            timestamp,
            sequence,
            corrupted,
            slot,
            detached: false,
        }
    }

    pub(crate) fn detach(mut self) -> Self {
        self.detached = true;
        self
    }

    /// Whether the frame no longer holds its slot
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Get frame data as bytes slice
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get frame data as Bytes (cheap clone)
    pub fn data_bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }
}
