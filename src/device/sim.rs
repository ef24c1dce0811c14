//! In-process stand-in for an M2M codec
//!
//! Runs a caller-supplied transform over each queued input buffer and writes
//! the results into queued output buffers, honouring the same queue rules as
//! a V4L2 driver: buffers only complete while streaming, output needs an
//! empty buffer to land in, and a drain ends with an empty last buffer.
//! Faults can be injected to exercise the engine's error paths.

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::{
    Allocation, Completion, DeviceFormat, DeviceOpener, M2mDevice, Readiness,
};
use crate::codec::{DrainKind, SlotSizes};
use crate::error::{CodecError, Result};

/// Turns one input buffer into zero or more output payloads
pub type Transform = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

/// Faults the simulated device injects
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Fail the queue call after this many successful input submissions
    pub fail_queue_after: Option<usize>,
    /// Most buffers the device grants per queue
    pub max_slots: Option<usize>,
    /// Never emit the last buffer of a drain
    pub stuck_drain: bool,
}

struct SimState {
    transform: Transform,
    faults: FaultPlan,
    format: Option<DeviceFormat>,
    sizes: SlotSizes,
    input_slots: Vec<Vec<u8>>,
    output_capacity: usize,
    output_count: usize,
    /// Input buffers waiting to be consumed: (index, length, timestamp)
    pending_input: VecDeque<(usize, usize, Duration)>,
    consumed_input: VecDeque<usize>,
    empty_output: VecDeque<usize>,
    produced: VecDeque<(Vec<u8>, Duration)>,
    filled_output: VecDeque<Completion>,
    streaming: bool,
    draining: bool,
    queued_total: usize,
    faulted: bool,
    /// Device calls made after the device faulted
    calls_after_fault: usize,
}

impl SimState {
    /// Move work forward as far as the queued buffers allow
    fn process(&mut self) {
        if !self.streaming {
            return;
        }
        loop {
            while !self.produced.is_empty() {
                let Some(index) = self.empty_output.pop_front() else {
                    break;
                };
                let Some((mut data, timestamp)) = self.produced.pop_front() else {
                    break;
                };
                let corrupted = data.len() > self.output_capacity;
                data.truncate(self.output_capacity);
                self.filled_output.push_back(Completion {
                    index,
                    data: Bytes::from(data),
                    timestamp,
                    last: false,
                    corrupted,
                });
            }
            // Input is only consumed once earlier output has somewhere to go
            if !self.produced.is_empty() {
                break;
            }
            let Some((index, len, timestamp)) = self.pending_input.pop_front() else {
                break;
            };
            let outputs = (self.transform)(&self.input_slots[index][..len]);
            for data in outputs {
                self.produced.push_back((data, timestamp));
            }
            self.consumed_input.push_back(index);
        }
        if self.draining
            && !self.faults.stuck_drain
            && self.pending_input.is_empty()
            && self.produced.is_empty()
        {
            if let Some(index) = self.empty_output.pop_front() {
                self.filled_output.push_back(Completion {
                    index,
                    data: Bytes::new(),
                    timestamp: Duration::ZERO,
                    last: true,
                    corrupted: false,
                });
                self.draining = false;
            }
        }
    }

    fn readiness(&self) -> Readiness {
        Readiness {
            input: !self.consumed_input.is_empty(),
            output: !self.filled_output.is_empty(),
        }
    }
}

/// Simulated M2M device
pub struct SimulatedDevice {
    name: String,
    state: Mutex<SimState>,
    ready: Condvar,
}

impl SimulatedDevice {
    pub fn new(name: impl Into<String>, transform: Transform) -> Self {
        Self::with_faults(name, transform, FaultPlan::default())
    }

    pub fn with_faults(name: impl Into<String>, transform: Transform, faults: FaultPlan) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(SimState {
                transform,
                faults,
                format: None,
                sizes: SlotSizes {
                    input: 0,
                    output: 0,
                },
                input_slots: Vec::new(),
                output_capacity: 0,
                output_count: 0,
                pending_input: VecDeque::new(),
                consumed_input: VecDeque::new(),
                empty_output: VecDeque::new(),
                produced: VecDeque::new(),
                filled_output: VecDeque::new(),
                streaming: false,
                draining: false,
                queued_total: 0,
                faulted: false,
                calls_after_fault: 0,
            }),
            ready: Condvar::new(),
        }
    }

    /// Device that copies every input buffer to one output buffer
    pub fn passthrough(name: impl Into<String>) -> Self {
        Self::new(name, Box::new(|data: &[u8]| vec![data.to_vec()]))
    }

    /// Format most recently applied by `configure`
    pub fn format(&self) -> Option<DeviceFormat> {
        self.state.lock().format.clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.state.lock().streaming
    }

    /// A drain was requested and has not ended yet
    pub fn is_draining(&self) -> bool {
        self.state.lock().draining
    }

    pub fn is_faulted(&self) -> bool {
        self.state.lock().faulted
    }

    /// Number of device calls received after the device faulted
    pub fn calls_after_fault(&self) -> usize {
        self.state.lock().calls_after_fault
    }

    /// Change the injected faults on a live device
    pub fn set_faults(&self, faults: FaultPlan) {
        self.state.lock().faults = faults;
    }

    fn fault(&self, reason: impl std::fmt::Display) -> CodecError {
        CodecError::device_fault(&self.name, reason)
    }

    /// Lock the state for a device call
    fn enter(&self) -> MutexGuard<'_, SimState> {
        let mut state = self.state.lock();
        if state.faulted {
            state.calls_after_fault += 1;
            debug!("{}: call after fault", self.name);
        }
        state
    }
}

impl M2mDevice for SimulatedDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&self, format: &DeviceFormat) -> Result<()> {
        let mut state = self.enter();
        if state.streaming {
            return Err(self.fault("format change while streaming"));
        }
        debug!(
            "{}: format {} -> {}",
            self.name,
            String::from_utf8_lossy(&format.input_fourcc),
            String::from_utf8_lossy(&format.output_fourcc)
        );
        state.format = Some(format.clone());
        Ok(())
    }

    fn allocate(&self, count: usize, sizes: SlotSizes) -> Result<Allocation> {
        let mut state = self.enter();
        if state.format.is_none() {
            return Err(self.fault("buffers requested before format was set"));
        }
        let granted = match state.faults.max_slots {
            Some(max) => count.min(max),
            None => count,
        };
        if granted == 0 {
            return Err(CodecError::Allocation(format!(
                "{}: no buffer memory for {} slots",
                self.name, count
            )));
        }
        state.sizes = sizes;
        state.input_slots = vec![vec![0u8; sizes.input]; granted];
        state.output_capacity = sizes.output;
        state.output_count = granted;
        state.pending_input.clear();
        state.consumed_input.clear();
        state.empty_output.clear();
        state.produced.clear();
        state.filled_output.clear();
        Ok(Allocation {
            input_slots: granted,
            output_slots: granted,
            sizes,
        })
    }

    fn queue_input(&self, index: usize, data: &[u8], timestamp: Duration) -> Result<()> {
        let mut state = self.enter();
        if let Some(limit) = state.faults.fail_queue_after {
            if state.queued_total >= limit {
                state.faulted = true;
                return Err(self.fault("injected queue failure"));
            }
        }
        let capacity = state.sizes.input;
        let slot = state
            .input_slots
            .get_mut(index)
            .ok_or_else(|| CodecError::device_fault(&self.name, "input index out of range"))?;
        if data.len() > capacity {
            return Err(CodecError::FrameTooLarge {
                len: data.len(),
                capacity,
            });
        }
        slot[..data.len()].copy_from_slice(data);
        state.pending_input.push_back((index, data.len(), timestamp));
        state.queued_total += 1;
        trace!("{}: queued input {} ({} bytes)", self.name, index, data.len());
        state.process();
        self.ready.notify_all();
        Ok(())
    }

    fn queue_output(&self, index: usize) -> Result<()> {
        let mut state = self.enter();
        if index >= state.output_count {
            return Err(self.fault("output index out of range"));
        }
        state.empty_output.push_back(index);
        state.process();
        self.ready.notify_all();
        Ok(())
    }

    fn wait(&self, timeout: Duration) -> Result<Readiness> {
        let mut state = self.enter();
        state.process();
        if !state.readiness().any() && !timeout.is_zero() {
            let _ = self.ready.wait_for(&mut state, timeout);
            state.process();
        }
        Ok(state.readiness())
    }

    fn dequeue_input(&self) -> Result<Option<usize>> {
        Ok(self.enter().consumed_input.pop_front())
    }

    fn dequeue_output(&self) -> Result<Option<Completion>> {
        Ok(self.enter().filled_output.pop_front())
    }

    fn start_drain(&self, kind: DrainKind) -> Result<()> {
        let mut state = self.enter();
        if !state.streaming {
            return Err(self.fault("drain requested while not streaming"));
        }
        debug!("{}: {:?} stop command", self.name, kind);
        state.draining = true;
        state.process();
        self.ready.notify_all();
        Ok(())
    }

    fn stream_on(&self) -> Result<()> {
        let mut state = self.enter();
        state.streaming = true;
        state.process();
        Ok(())
    }

    fn stream_off(&self) -> Result<()> {
        let mut state = self.enter();
        state.streaming = false;
        state.draining = false;
        state.pending_input.clear();
        state.consumed_input.clear();
        state.empty_output.clear();
        state.produced.clear();
        state.filled_output.clear();
        self.ready.notify_all();
        Ok(())
    }

    fn release_buffers(&self) -> Result<()> {
        let mut state = self.enter();
        if state.streaming {
            return Err(self.fault("buffers released while streaming"));
        }
        state.input_slots.clear();
        state.output_count = 0;
        state.output_capacity = 0;
        Ok(())
    }

    fn mark_faulted(&self) {
        self.state.lock().faulted = true;
    }
}

/// Opener handing out one prepared simulated device
///
/// Each `open` builds a fresh device from the factory, so reopening after a
/// Null transition behaves like reopening a device node.
pub struct SimulatedOpener {
    factory: Box<dyn Fn(&Path) -> SimulatedDevice + Send + Sync>,
    last: Mutex<Option<Arc<SimulatedDevice>>>,
}

impl SimulatedOpener {
    pub fn new(factory: impl Fn(&Path) -> SimulatedDevice + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            last: Mutex::new(None),
        }
    }

    /// Most recently opened device, for inspection in tests
    pub fn last_opened(&self) -> Option<Arc<SimulatedDevice>> {
        self.last.lock().clone()
    }
}

impl DeviceOpener for SimulatedOpener {
    fn open(&self, path: &Path) -> Result<Arc<dyn M2mDevice>> {
        let device = Arc::new((self.factory)(path));
        *self.last.lock() = Some(device.clone());
        Ok(device)
    }
}
