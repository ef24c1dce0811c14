//! Buffer Pool Manager
//!
//! Owns the input and output slot arenas of one device and mediates every
//! queue and dequeue. All slot state transitions happen under one lock;
//! the bounded device wait in [`BufferPool::poll_output`] runs outside it so
//! a producer can keep submitting while a consumer waits.
//!
//! ```text
//!            submit_input                 dequeue_input
//!   Free ─────────────────> QueuedInput ─────────────────> Free
//!
//!            allocate/release             dequeue_output              release
//!   Free ─────────────────> QueuedOutput ──────────────> ReadyForDelivery ───> QueuedOutput
//! ```
//!
//! After a device fault the pool issues no further device calls; every
//! operation reports the fault until the pool is reset by a new allocation
//! on a freshly opened device.

mod frame;
mod slot;

pub use frame::Frame;
pub use slot::{SlotArena, SlotId, SlotState};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::codec::{DrainKind, SlotSizes};
use crate::device::M2mDevice;
use crate::error::{CodecError, Result};
use crate::utils::LogThrottler;

/// Seeds slot generations per allocation, across all pools
static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

/// Tuning of device waits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    /// Upper bound of one device wait in `poll_output`
    pub poll_timeout: Duration,
    /// Device waits allowed during `flush` before the device counts as stuck
    pub drain_attempts: u32,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            drain_attempts: 50,
        }
    }
}

/// Slot counts per state, for diagnostics and teardown checks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotCounts {
    pub free: usize,
    pub queued_input: usize,
    pub queued_output: usize,
    pub ready: usize,
}

impl SlotCounts {
    /// Slots currently owned by the device
    pub fn device_owned(&self) -> usize {
        self.queued_input + self.queued_output
    }
}

struct PoolInner {
    input: SlotArena,
    output: SlotArena,
    streaming: bool,
    /// The device emitted the last buffer of a drain
    drained: bool,
    /// First device fault seen; no ioctls are issued afterwards
    fault: Option<CodecError>,
    submitted: u64,
    delivered: u64,
}

impl PoolInner {
    fn counts(&self) -> SlotCounts {
        let count = |state| self.input.count(state) + self.output.count(state);
        SlotCounts {
            free: count(SlotState::Free),
            queued_input: count(SlotState::QueuedInput),
            queued_output: count(SlotState::QueuedOutput),
            ready: count(SlotState::ReadyForDelivery),
        }
    }

    fn check_fault(&self) -> Result<()> {
        match &self.fault {
            Some(CodecError::DeviceFault { device, reason }) => Err(CodecError::DeviceFault {
                device: device.clone(),
                reason: reason.clone(),
            }),
            Some(CodecError::StuckDevice { pending }) => {
                Err(CodecError::StuckDevice { pending: *pending })
            }
            Some(other) => Err(CodecError::device_fault("pool", other)),
            None => Ok(()),
        }
    }

    /// Remember a fatal error so the device is not touched again
    fn record(&mut self, err: CodecError) -> CodecError {
        if err.is_fatal() && self.fault.is_none() {
            self.fault = Some(match &err {
                CodecError::DeviceFault { device, reason } => CodecError::DeviceFault {
                    device: device.clone(),
                    reason: reason.clone(),
                },
                CodecError::StuckDevice { pending } => CodecError::StuckDevice { pending: *pending },
                other => CodecError::device_fault("pool", other),
            });
        }
        err
    }
}

/// Bounded pool of hardware buffer slots for one device
pub struct BufferPool {
    device: Arc<dyn M2mDevice>,
    options: PoolOptions,
    inner: Mutex<PoolInner>,
    throttle: LogThrottler,
}

impl BufferPool {
    pub fn new(device: Arc<dyn M2mDevice>, options: PoolOptions) -> Self {
        Self {
            device,
            options,
            inner: Mutex::new(PoolInner {
                input: SlotArena::empty(),
                output: SlotArena::empty(),
                streaming: false,
                drained: false,
                fault: None,
                submitted: 0,
                delivered: 0,
            }),
            throttle: LogThrottler::with_secs(5),
        }
    }

    pub fn device(&self) -> &Arc<dyn M2mDevice> {
        &self.device
    }

    pub fn options(&self) -> PoolOptions {
        self.options
    }

    /// Reserve `slot_count` slots per queue and start streaming
    ///
    /// Any previously held slots are released first. The device may grant
    /// fewer slots than asked for; the granted count is returned.
    pub fn allocate(&self, slot_count: usize, sizes: SlotSizes) -> Result<usize> {
        let mut inner = self.inner.lock();
        inner.check_fault()?;
        if !inner.input.is_empty() || !inner.output.is_empty() {
            self.release_locked(&mut inner)?;
        }

        let allocation = self
            .device
            .allocate(slot_count, sizes)
            .map_err(|e| inner.record(e))?;
        if allocation.sizes.input < sizes.input || allocation.sizes.output < sizes.output {
            let err = CodecError::Allocation(format!(
                "{}: buffers of {:?} are smaller than the required {:?}",
                self.device.name(),
                allocation.sizes,
                sizes
            ));
            if let Err(e) = self.device.release_buffers() {
                return Err(inner.record(e));
            }
            return Err(err);
        }

        let base = NEXT_EPOCH.fetch_add(1, Ordering::Relaxed) << 32;
        inner.input = SlotArena::new(allocation.input_slots, allocation.sizes.input)
            .with_base_generation(base);
        inner.output = SlotArena::new(allocation.output_slots, allocation.sizes.output)
            .with_base_generation(base);
        inner.drained = false;

        for index in 0..allocation.output_slots {
            if let Err(e) = self.device.queue_output(index) {
                return Err(inner.record(e));
            }
            inner
                .output
                .transition(index, SlotState::Free, SlotState::QueuedOutput);
        }
        if let Err(e) = self.device.stream_on() {
            return Err(inner.record(e));
        }
        inner.streaming = true;

        debug!(
            "{}: allocated {} input / {} output slots ({} / {} bytes)",
            self.device.name(),
            allocation.input_slots,
            allocation.output_slots,
            allocation.sizes.input,
            allocation.sizes.output
        );
        Ok(allocation.input_slots.min(allocation.output_slots))
    }

    /// Copy `data` into a free input slot and hand it to the device
    ///
    /// Returns [`CodecError::NoFreeSlot`] immediately when every input slot
    /// is owned by the device.
    pub fn submit_input(&self, data: &[u8], timestamp: Duration) -> Result<SlotId> {
        let mut inner = self.inner.lock();
        inner.check_fault()?;
        if !inner.streaming {
            return Err(CodecError::InvalidState {
                from: "stopped pool".to_string(),
                to: "submit".to_string(),
            });
        }
        if data.len() > inner.input.capacity() {
            return Err(CodecError::FrameTooLarge {
                len: data.len(),
                capacity: inner.input.capacity(),
            });
        }

        let index = match inner.input.find_free() {
            Some(index) => index,
            None => {
                self.reclaim_inputs(&mut inner)?;
                match inner.input.find_free() {
                    Some(index) => index,
                    None => {
                        crate::debug_throttled!(
                            self.throttle,
                            "no_free_slot",
                            "{}: all {} input slots queued",
                            self.device.name(),
                            inner.input.len()
                        );
                        return Err(CodecError::NoFreeSlot);
                    }
                }
            }
        };

        if let Err(e) = self.device.queue_input(index, data, timestamp) {
            return Err(inner.record(e));
        }
        inner
            .input
            .transition(index, SlotState::Free, SlotState::QueuedInput);
        inner.submitted += 1;
        trace!(
            "{}: input slot {} queued ({} bytes, ts {:?})",
            self.device.name(),
            index,
            data.len(),
            timestamp
        );
        inner
            .input
            .id(index)
            .ok_or_else(|| CodecError::device_fault(self.device.name(), "slot vanished"))
    }

    /// Collect completed frames, waiting at most the configured poll timeout
    ///
    /// An empty result means nothing completed within the wait.
    pub fn poll_output(&self) -> Result<Vec<Frame>> {
        self.poll_output_timeout(self.options.poll_timeout)
    }

    pub fn poll_output_timeout(&self, timeout: Duration) -> Result<Vec<Frame>> {
        {
            let inner = self.inner.lock();
            inner.check_fault()?;
            if !inner.streaming {
                return Ok(Vec::new());
            }
        }

        // Bounded wait without the lock held
        if let Err(e) = self.device.wait(timeout) {
            return Err(self.inner.lock().record(e));
        }

        let mut inner = self.inner.lock();
        inner.check_fault()?;
        if !inner.streaming {
            return Ok(Vec::new());
        }
        self.reclaim_inputs(&mut inner)?;
        self.collect_outputs(&mut inner)
    }

    /// Give a frame's slot back to the pool
    ///
    /// Releasing the same frame twice, or a frame from before a reallocation,
    /// fails with [`CodecError::StaleFrame`] and leaves every slot untouched.
    pub fn release(&self, frame: &Frame) -> Result<()> {
        if frame.is_detached() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        let id = frame.slot();
        let requeue = inner.streaming && !inner.drained && inner.fault.is_none();

        if !requeue {
            if !inner.output.retire(id, SlotState::Free) {
                return Err(CodecError::StaleFrame { index: id.index });
            }
            return Ok(());
        }

        if !inner.output.retire(id, SlotState::QueuedOutput) {
            return Err(CodecError::StaleFrame { index: id.index });
        }
        if let Err(e) = self.device.queue_output(id.index) {
            inner
                .output
                .transition(id.index, SlotState::QueuedOutput, SlotState::Free);
            return Err(inner.record(e));
        }
        trace!("{}: output slot {} requeued", self.device.name(), id.index);
        Ok(())
    }

    /// Drain the device at end-of-stream
    ///
    /// Sends the stop command and collects output until the device marks
    /// the last buffer. Slots are recycled as frames arrive, so the drain
    /// never waits on the caller; the returned frames are detached. If the
    /// last buffer does not arrive within the configured number of waits the
    /// device is declared stuck.
    pub fn flush(&self, kind: DrainKind) -> Result<Vec<Frame>> {
        {
            let mut inner = self.inner.lock();
            inner.check_fault()?;
            if !inner.streaming {
                return Ok(Vec::new());
            }
            if let Err(e) = self.device.start_drain(kind) {
                return Err(inner.record(e));
            }
        }

        let mut frames = Vec::new();
        for attempt in 0..self.options.drain_attempts {
            for frame in self.poll_output()? {
                match self.release(&frame) {
                    Ok(()) => {}
                    // Slot already reclaimed by a concurrent teardown
                    Err(CodecError::StaleFrame { .. }) if !self.is_streaming() => {}
                    Err(e) => return Err(e),
                }
                frames.push(frame.detach());
            }
            let inner = self.inner.lock();
            if !inner.streaming && !inner.drained {
                // Torn down by another caller while draining
                debug!("{}: released during drain", self.device.name());
                return Ok(frames);
            }
            if inner.drained {
                debug!(
                    "{}: drained after {} waits, {} frames",
                    self.device.name(),
                    attempt + 1,
                    frames.len()
                );
                break;
            }
        }

        let mut inner = self.inner.lock();
        if !inner.drained {
            let pending = inner.counts().device_owned();
            warn!(
                "{}: no last buffer after {} waits, {} slots still queued",
                self.device.name(),
                self.options.drain_attempts,
                pending
            );
            return Err(inner.record(CodecError::StuckDevice { pending }));
        }

        // Stop both queues; queued slots come back to the pool
        if let Err(e) = self.device.stream_off() {
            return Err(inner.record(e));
        }
        inner.streaming = false;
        inner.input.reclaim_queued();
        inner.output.reclaim_queued();
        Ok(frames)
    }

    /// Release all slots and free device buffers
    ///
    /// Queued slots are abandoned, not waited on. Frames still held by
    /// consumers keep their data but can no longer be released. After a fault
    /// the device is left alone and only the bookkeeping is reset.
    pub fn release_all(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.release_locked(&mut inner)
    }

    fn release_locked(&self, inner: &mut PoolInner) -> Result<()> {
        let abandoned = inner.counts().device_owned();
        inner.input.reset();
        inner.output.reset();
        inner.input = SlotArena::empty();
        inner.output = SlotArena::empty();
        let was_streaming = std::mem::replace(&mut inner.streaming, false);
        inner.drained = false;

        if inner.fault.is_some() {
            debug!(
                "{}: skipping buffer release on faulted device",
                self.device.name()
            );
            self.device.mark_faulted();
            return Ok(());
        }
        if abandoned > 0 {
            debug!("{}: abandoning {} queued slots", self.device.name(), abandoned);
        }
        if was_streaming {
            self.device.stream_off().map_err(|e| inner.record(e))?;
        }
        self.device.release_buffers().map_err(|e| inner.record(e))
    }

    pub fn counts(&self) -> SlotCounts {
        self.inner.lock().counts()
    }

    pub fn slot_count(&self) -> usize {
        self.inner.lock().input.len()
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.lock().streaming
    }

    pub fn is_faulted(&self) -> bool {
        self.inner.lock().fault.is_some()
    }

    /// (submitted inputs, delivered frames)
    pub fn stats(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.submitted, inner.delivered)
    }

    fn reclaim_inputs(&self, inner: &mut PoolInner) -> Result<()> {
        loop {
            match self.device.dequeue_input() {
                Ok(Some(index)) => {
                    if !inner
                        .input
                        .transition(index, SlotState::QueuedInput, SlotState::Free)
                    {
                        warn!(
                            "{}: device returned input slot {} it did not own",
                            self.device.name(),
                            index
                        );
                    }
                }
                Ok(None) => return Ok(()),
                Err(e) => return Err(inner.record(e)),
            }
        }
    }

    fn collect_outputs(&self, inner: &mut PoolInner) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        loop {
            let completion = match self.device.dequeue_output() {
                Ok(Some(c)) => c,
                Ok(None) => break,
                Err(e) => return Err(inner.record(e)),
            };
            let index = completion.index;
            if !inner
                .output
                .transition(index, SlotState::QueuedOutput, SlotState::ReadyForDelivery)
            {
                let err = CodecError::device_fault(
                    self.device.name(),
                    format!("completed output slot {} was not queued", index),
                );
                return Err(inner.record(err));
            }

            if completion.last {
                inner.drained = true;
                if completion.data.is_empty() {
                    // Empty marker buffer: nothing to deliver
                    inner
                        .output
                        .transition(index, SlotState::ReadyForDelivery, SlotState::Free);
                    continue;
                }
            }

            if completion.corrupted {
                warn!(
                    "{}: output slot {} flagged as corrupted",
                    self.device.name(),
                    index
                );
            }

            let slot = inner
                .output
                .id(index)
                .ok_or_else(|| CodecError::device_fault(self.device.name(), "slot vanished"))?;
            let sequence = inner.delivered;
            inner.delivered += 1;
            trace!(
                "{}: output slot {} ready ({} bytes, ts {:?})",
                self.device.name(),
                index,
                completion.data.len(),
                completion.timestamp
            );
            frames.push(Frame::new(
                completion.data,
                completion.timestamp,
                sequence,
                completion.corrupted,
                slot,
            ));
        }
        Ok(frames)
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if let Err(e) = self.release_all() {
            debug!("{}: release on drop failed: {}", self.device.name(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceFormat, FaultPlan, SimulatedDevice, Transform};

    const SIZES: SlotSizes = SlotSizes {
        input: 64,
        output: 64,
    };

    fn format() -> DeviceFormat {
        DeviceFormat {
            input_fourcc: *b"LPCM",
            output_fourcc: *b"AAC ",
            width: 0,
            height: 0,
            bytes_per_line: 0,
            sizes: SIZES,
            controls: Vec::new(),
        }
    }

    fn options() -> PoolOptions {
        PoolOptions {
            poll_timeout: Duration::from_millis(5),
            drain_attempts: 3,
        }
    }

    fn pool_with(transform: Transform, faults: FaultPlan, slots: usize) -> BufferPool {
        let device = Arc::new(SimulatedDevice::with_faults("sim0", transform, faults));
        device.configure(&format()).unwrap();
        let pool = BufferPool::new(device, options());
        pool.allocate(slots, SIZES).unwrap();
        pool
    }

    fn doubling() -> Transform {
        Box::new(|data: &[u8]| vec![data.iter().map(|b| b.wrapping_mul(2)).collect()])
    }

    #[test]
    fn test_submit_poll_release_cycle() {
        let pool = pool_with(doubling(), FaultPlan::default(), 4);
        assert_eq!(pool.counts().queued_output, 4);

        pool.submit_input(&[1, 2, 3], Duration::from_millis(1))
            .unwrap();
        let frames = pool.poll_output().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data(), &[2, 4, 6]);
        assert_eq!(frames[0].timestamp, Duration::from_millis(1));
        assert_eq!(pool.counts().ready, 1);

        pool.release(&frames[0]).unwrap();
        assert_eq!(pool.counts().ready, 0);
        assert_eq!(pool.counts().queued_output, 4);
    }

    #[test]
    fn test_order_preserved() {
        let pool = pool_with(doubling(), FaultPlan::default(), 8);
        for i in 0..6u8 {
            pool.submit_input(&[i], Duration::from_millis(i as u64))
                .unwrap();
        }
        let frames = pool.poll_output().unwrap();
        let payloads: Vec<u8> = frames.iter().map(|f| f.data()[0]).collect();
        assert_eq!(payloads, vec![0, 2, 4, 6, 8, 10]);
        let sequences: Vec<u64> = frames.iter().map(|f| f.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_backpressure_when_outputs_held() {
        let pool = pool_with(doubling(), FaultPlan::default(), 2);
        pool.submit_input(&[1], Duration::ZERO).unwrap();
        pool.submit_input(&[2], Duration::ZERO).unwrap();
        let held = pool.poll_output().unwrap();
        assert_eq!(held.len(), 2);

        // Both outputs held by the consumer: inputs are consumed but nothing completes
        pool.submit_input(&[3], Duration::ZERO).unwrap();
        pool.submit_input(&[4], Duration::ZERO).unwrap();
        assert!(pool.poll_output().unwrap().is_empty());

        assert_eq!(pool.counts().ready, 2);
        for frame in &held {
            pool.release(frame).unwrap();
        }
        assert_eq!(pool.poll_output().unwrap().len(), 2);
    }

    #[test]
    fn test_no_free_slot() {
        let device = Arc::new(SimulatedDevice::new("sim0", doubling()));
        device.configure(&format()).unwrap();
        let pool = BufferPool::new(device.clone(), options());
        pool.allocate(2, SIZES).unwrap();
        // A stopped device never consumes what is queued
        device.stream_off().unwrap();

        pool.submit_input(&[1], Duration::ZERO).unwrap();
        pool.submit_input(&[2], Duration::ZERO).unwrap();
        assert!(matches!(
            pool.submit_input(&[3], Duration::ZERO),
            Err(CodecError::NoFreeSlot)
        ));
        assert_eq!(pool.counts().queued_input, 2);
    }

    #[test]
    fn test_frame_too_large() {
        let pool = pool_with(doubling(), FaultPlan::default(), 2);
        assert!(matches!(
            pool.submit_input(&[0u8; 65], Duration::ZERO),
            Err(CodecError::FrameTooLarge { len: 65, .. })
        ));
    }

    #[test]
    fn test_double_release_is_stale() {
        let pool = pool_with(doubling(), FaultPlan::default(), 2);
        pool.submit_input(&[1], Duration::ZERO).unwrap();
        pool.submit_input(&[2], Duration::ZERO).unwrap();
        let frames = pool.poll_output().unwrap();
        assert_eq!(frames.len(), 2);

        pool.release(&frames[0]).unwrap();
        let before = pool.counts();
        assert!(matches!(
            pool.release(&frames[0]),
            Err(CodecError::StaleFrame { .. })
        ));
        assert_eq!(pool.counts(), before);

        // Slot 0 is reused by a new frame; the old handle still cannot touch it
        pool.submit_input(&[3], Duration::ZERO).unwrap();
        let reused = pool.poll_output().unwrap();
        assert_eq!(reused.len(), 1);
        assert_eq!(reused[0].slot().index, frames[0].slot().index);
        assert!(pool.release(&frames[0]).is_err());
        assert_eq!(pool.counts().ready, 2);
        pool.release(&reused[0]).unwrap();
        pool.release(&frames[1]).unwrap();
    }

    #[test]
    fn test_flush_drains_and_stops() {
        let pool = pool_with(doubling(), FaultPlan::default(), 4);
        for i in 0..3u8 {
            pool.submit_input(&[i], Duration::ZERO).unwrap();
        }
        let frames = pool.flush(DrainKind::Encoder).unwrap();
        assert_eq!(frames.len(), 3);
        assert!(!pool.is_streaming());

        let payloads: Vec<u8> = frames.iter().map(|f| f.data()[0]).collect();
        assert_eq!(payloads, vec![0, 2, 4]);

        let counts = pool.counts();
        assert_eq!(counts.device_owned(), 0);
        assert_eq!(counts.ready, 0);
        assert_eq!(counts.free, 8);
        for frame in &frames {
            assert!(frame.is_detached());
            pool.release(frame).unwrap();
        }
        assert_eq!(pool.counts().free, 8);
    }

    #[test]
    fn test_flush_recycles_slots_while_draining() {
        // More pending output than output slots: the drain must recycle
        let pool = pool_with(
            Box::new(|data: &[u8]| vec![data.to_vec(), data.to_vec(), data.to_vec()]),
            FaultPlan::default(),
            2,
        );
        pool.submit_input(&[7], Duration::ZERO).unwrap();
        let frames = pool.flush(DrainKind::Encoder).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(pool.counts().device_owned(), 0);
    }

    #[test]
    fn test_stuck_drain() {
        let pool = pool_with(
            doubling(),
            FaultPlan {
                stuck_drain: true,
                ..Default::default()
            },
            2,
        );
        pool.submit_input(&[1], Duration::ZERO).unwrap();
        assert!(matches!(
            pool.flush(DrainKind::Encoder),
            Err(CodecError::StuckDevice { .. })
        ));
        assert!(pool.is_faulted());
        assert!(pool.submit_input(&[1], Duration::ZERO).is_err());
        pool.release_all().unwrap();
        assert_eq!(pool.counts(), SlotCounts::default());
    }

    #[test]
    fn test_fault_stops_device_calls() {
        let pool = pool_with(
            doubling(),
            FaultPlan {
                fail_queue_after: Some(1),
                ..Default::default()
            },
            4,
        );
        pool.submit_input(&[1], Duration::ZERO).unwrap();
        let err = pool.submit_input(&[2], Duration::ZERO).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            pool.poll_output(),
            Err(CodecError::DeviceFault { .. })
        ));
        assert!(pool.flush(DrainKind::Encoder).is_err());
    }

    #[test]
    fn test_reallocate_releases_previous_slots() {
        let pool = pool_with(doubling(), FaultPlan::default(), 4);
        pool.submit_input(&[1], Duration::ZERO).unwrap();
        let frames = pool.poll_output().unwrap();

        assert_eq!(pool.allocate(2, SIZES).unwrap(), 2);
        assert_eq!(pool.slot_count(), 2);
        assert_eq!(pool.counts().queued_output, 2);
        assert!(matches!(
            pool.release(&frames[0]),
            Err(CodecError::StaleFrame { .. })
        ));

        // Same index completes again in the new arena; the old frame is still stale
        pool.submit_input(&[2], Duration::ZERO).unwrap();
        let fresh = pool.poll_output().unwrap();
        assert_eq!(fresh[0].slot().index, frames[0].slot().index);
        assert!(pool.release(&frames[0]).is_err());
        pool.release(&fresh[0]).unwrap();
    }

    #[test]
    fn test_allocation_failure() {
        let device = Arc::new(SimulatedDevice::with_faults(
            "sim0",
            doubling(),
            FaultPlan {
                max_slots: Some(0),
                ..Default::default()
            },
        ));
        device.configure(&format()).unwrap();
        let pool = BufferPool::new(device, options());
        assert!(matches!(
            pool.allocate(4, SIZES),
            Err(CodecError::Allocation(_))
        ));
        assert!(!pool.is_faulted());
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        let pool = Arc::new(pool_with(doubling(), FaultPlan::default(), 4));
        let producer = {
            let pool = pool.clone();
            std::thread::spawn(move || {
                let mut sent = 0u8;
                while sent < 50 {
                    match pool.submit_input(&[sent], Duration::from_millis(sent as u64)) {
                        Ok(_) => sent += 1,
                        Err(CodecError::NoFreeSlot) => std::thread::yield_now(),
                        Err(e) => panic!("unexpected error: {}", e),
                    }
                }
            })
        };

        let mut received = Vec::new();
        while received.len() < 50 {
            for frame in pool.poll_output().unwrap() {
                received.push(frame.data()[0]);
                pool.release(&frame).unwrap();
            }
        }
        producer.join().unwrap();

        let expected: Vec<u8> = (0..50u8).map(|b| b.wrapping_mul(2)).collect();
        assert_eq!(received, expected);
    }
}
