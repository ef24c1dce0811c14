//! Device-facing seam of the engine
//!
//! [`M2mDevice`] is everything the buffer pool needs from a memory-to-memory
//! codec: format setup, buffer allocation, queue/dequeue on both queues, a
//! bounded readiness wait and the drain command. All methods take `&self` so
//! a producer and a consumer can drive the same device concurrently; slot
//! bookkeeping is serialized by the pool, not here.

pub mod discovery;
pub mod sim;
pub mod v4l2;

use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::{DeviceControl, DrainKind, Negotiated, SlotSizes};
use crate::error::Result;

pub use discovery::{find_m2m_device, M2mDeviceInfo};
pub use sim::{FaultPlan, SimulatedDevice, SimulatedOpener, Transform};
pub use v4l2::{V4l2M2mDevice, V4l2Opener};

/// Formats applied to both queues before allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFormat {
    pub input_fourcc: [u8; 4],
    pub output_fourcc: [u8; 4],
    /// Picture size for video codecs, zero for audio
    pub width: u32,
    pub height: u32,
    /// Input row length in bytes, zero when not applicable
    pub bytes_per_line: u32,
    pub sizes: SlotSizes,
    pub controls: Vec<DeviceControl>,
}

impl DeviceFormat {
    pub fn from_negotiated(negotiated: &Negotiated) -> Self {
        let config = negotiated.config();
        let (width, height, bytes_per_line) = match config.media {
            crate::codec::MediaParams::Video {
                format, geometry, ..
            } => (
                geometry.width,
                geometry.height,
                geometry.stride * format.luma_bytes_per_pixel() as u32,
            ),
            crate::codec::MediaParams::Audio(_) => (0, 0, 0),
        };
        Self {
            input_fourcc: negotiated.input_fourcc(),
            output_fourcc: negotiated.output_fourcc(),
            width,
            height,
            bytes_per_line,
            sizes: negotiated.slot_sizes(),
            controls: negotiated.controls().to_vec(),
        }
    }
}

/// Buffers actually granted by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub input_slots: usize,
    pub output_slots: usize,
    pub sizes: SlotSizes,
}

/// Which queues have completed buffers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// An input buffer was consumed and can be dequeued
    pub input: bool,
    /// An output buffer was filled and can be dequeued
    pub output: bool,
}

impl Readiness {
    pub fn any(&self) -> bool {
        self.input || self.output
    }
}

/// A filled output buffer taken back from the device
#[derive(Debug, Clone)]
pub struct Completion {
    pub index: usize,
    /// Copy of the bytes the device wrote
    pub data: Bytes,
    pub timestamp: Duration,
    /// Final buffer of a drain
    pub last: bool,
    /// The device flagged the payload as damaged
    pub corrupted: bool,
}

/// A memory-to-memory codec device
pub trait M2mDevice: Send + Sync {
    /// Device node or label used in logs and errors
    fn name(&self) -> &str;

    /// Set formats on both queues and write codec controls
    fn configure(&self, format: &DeviceFormat) -> Result<()>;

    /// Request `count` buffers on each queue
    fn allocate(&self, count: usize, sizes: SlotSizes) -> Result<Allocation>;

    /// Copy `data` into input buffer `index` and hand it to the device
    fn queue_input(&self, index: usize, data: &[u8], timestamp: Duration) -> Result<()>;

    /// Hand an empty output buffer to the device
    fn queue_output(&self, index: usize) -> Result<()>;

    /// Wait up to `timeout` for either queue to have a completed buffer
    fn wait(&self, timeout: Duration) -> Result<Readiness>;

    /// Take back a consumed input buffer, if one is ready
    fn dequeue_input(&self) -> Result<Option<usize>>;

    /// Take back a filled output buffer, if one is ready
    fn dequeue_output(&self) -> Result<Option<Completion>>;

    /// Ask the device to emit everything it holds and mark the end with a last buffer
    fn start_drain(&self, kind: DrainKind) -> Result<()>;

    fn stream_on(&self) -> Result<()>;

    /// Stop both queues; every queued buffer returns to the caller
    fn stream_off(&self) -> Result<()>;

    /// Free all buffers
    fn release_buffers(&self) -> Result<()>;

    /// The device reported a fault; it must not see another ioctl
    fn mark_faulted(&self);
}

/// Opens a device for exclusive use by one engine
pub trait DeviceOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Arc<dyn M2mDevice>>;
}
