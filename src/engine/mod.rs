//! Streaming State Machine
//!
//! [`StreamEngine`] owns one codec instance: the device handle, the
//! negotiated configuration and the buffer pool. It moves through
//! `Null → Ready → Paused → Playing` one step at a time and back down the
//! same way:
//!
//! | Step | Action |
//! |------|--------|
//! | Null → Ready | open the device |
//! | Ready → Paused | negotiate upstream caps |
//! | Paused → Playing | program the device, allocate the pool |
//! | Playing → Paused | release the pool |
//! | Paused → Ready | forget the configuration |
//! | Ready → Null | close the device |
//!
//! Downward steps never fail, so teardown is reachable from every state.
//! A fatal device error forces the engine down to `Null` and publishes
//! [`EngineEvent::Fatal`].
//!
//! Producer and consumer may call [`StreamEngine::push`] and
//! [`StreamEngine::pull`] from different threads; both go straight to the
//! pool and never wait on a state transition in progress.

mod state;

pub use state::StreamState;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::codec::{negotiate, CodecEngine, CodecKind, MediaCaps, Negotiated, MIN_SLOTS};
use crate::config::{ElementSettings, Property};
use crate::device::{find_m2m_device, DeviceFormat, DeviceOpener, M2mDevice};
use crate::error::{CodecError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::pool::{BufferPool, Frame, PoolOptions, SlotCounts, SlotId};

/// Outcome of [`StreamEngine::push`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    /// The buffer was copied into this input slot
    Accepted(SlotId),
    /// Every input slot is busy; pull and release output, then push again
    Backpressure,
}

struct EngineInner {
    state: StreamState,
    device: Option<Arc<dyn M2mDevice>>,
    caps: Option<MediaCaps>,
    negotiated: Option<Negotiated>,
}

/// One hardware codec instance
pub struct StreamEngine {
    name: String,
    codec: Arc<dyn CodecEngine>,
    opener: Arc<dyn DeviceOpener>,
    settings: ArcSwap<ElementSettings>,
    events: EventBus,
    /// Serializes state transitions
    inner: Mutex<EngineInner>,
    /// Present only while Playing; cloned out so push/pull run unlocked
    pool: RwLock<Option<Arc<BufferPool>>>,
}

impl StreamEngine {
    pub fn new(kind: CodecKind, opener: Arc<dyn DeviceOpener>) -> Self {
        Self {
            name: format!("{}0", kind.element_name()),
            codec: kind.engine(),
            opener,
            settings: ArcSwap::from_pointee(ElementSettings::default()),
            events: EventBus::new(),
            inner: Mutex::new(EngineInner {
                state: StreamState::Null,
                device: None,
                caps: None,
                negotiated: None,
            }),
            pool: RwLock::new(None),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_settings(self, settings: ElementSettings) -> Self {
        self.settings.store(Arc::new(settings));
        self
    }

    /// Publish events on a shared bus instead of a private one
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> CodecKind {
        self.codec.kind()
    }

    pub fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    pub fn settings(&self) -> Arc<ElementSettings> {
        self.settings.load_full()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Caps last offered by upstream
    pub fn caps(&self) -> Option<MediaCaps> {
        self.inner.lock().caps
    }

    pub fn negotiated(&self) -> Option<Negotiated> {
        self.inner.lock().negotiated.clone()
    }

    pub fn output_caps(&self) -> Option<MediaCaps> {
        self.inner
            .lock()
            .negotiated
            .as_ref()
            .map(|n| *n.output_caps())
    }

    /// Slot states of the pool, `None` unless Playing
    pub fn slot_counts(&self) -> Option<SlotCounts> {
        let pool = self.pool.read().clone();
        pool.map(|p| p.counts())
    }

    /// Change a property
    ///
    /// Numeric values are clamped to the codec's declared range. Changes
    /// take effect at the next negotiation. The device path may only change
    /// while the device is closed.
    pub fn set_property(&self, property: Property) -> Result<()> {
        let inner = self.inner.lock();
        if property.requires_closed_device() && inner.state != StreamState::Null {
            return Err(CodecError::InvalidState {
                from: inner.state.to_string(),
                to: format!("set {}", property.name()),
            });
        }
        let mut settings = (*self.settings.load_full()).clone();
        debug!("{}: {:?}", self.name, property);
        settings.apply(property, &self.codec.property_ranges());
        self.settings.store(Arc::new(settings));
        Ok(())
    }

    /// Offer upstream caps
    ///
    /// Negotiation runs immediately so a mismatch is reported here. While
    /// Playing, a configuration change reallocates the pool by stepping
    /// through Paused; frames already delivered are unaffected.
    pub fn set_caps(&self, caps: MediaCaps) -> Result<Negotiated> {
        let mut inner = self.inner.lock();
        let settings = self.settings.load_full();
        let negotiated = match negotiate(self.codec.as_ref(), &settings, &caps) {
            Ok(n) => n,
            Err(violation) => {
                warn!("{}: caps {} rejected: {}", self.name, caps, violation);
                self.publish_not_negotiated(violation.to_string());
                return Err(violation.into());
            }
        };
        inner.caps = Some(caps);

        match inner.state {
            StreamState::Playing => {
                if inner.negotiated.as_ref() == Some(&negotiated) {
                    return Ok(negotiated);
                }
                info!("{}: renegotiating to {}", self.name, caps);
                self.step_locked(&mut inner, StreamState::Paused)?;
                self.store_negotiated(&mut inner, negotiated.clone());
                if let Err(e) = self.step_locked(&mut inner, StreamState::Playing) {
                    if e.is_fatal() {
                        self.fail_locked(&mut inner, &e);
                    }
                    return Err(e);
                }
            }
            StreamState::Paused => self.store_negotiated(&mut inner, negotiated.clone()),
            // Negotiated again on the way up to Paused
            StreamState::Null | StreamState::Ready => {}
        }
        Ok(negotiated)
    }

    /// Move to `target`, passing through every intermediate state
    ///
    /// Upward steps can fail; the engine then stays in the last state it
    /// reached. A fatal failure tears the engine down to Null instead.
    pub fn set_state(&self, target: StreamState) -> Result<()> {
        let mut inner = self.inner.lock();
        for next in inner.state.path_to(target) {
            if let Err(e) = self.step_locked(&mut inner, next) {
                if e.is_fatal() {
                    self.fail_locked(&mut inner, &e);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Submit one input buffer
    ///
    /// Backpressure is a normal outcome, not an error: the caller keeps the
    /// buffer and retries after releasing output.
    pub fn push(&self, data: &[u8], timestamp: Duration) -> Result<Submit> {
        let pool = self.active_pool("push")?;
        if !pool.is_streaming() {
            self.restart(&pool)?;
        }
        match pool.submit_input(data, timestamp) {
            Ok(slot) => Ok(Submit::Accepted(slot)),
            Err(CodecError::NoFreeSlot) => Ok(Submit::Backpressure),
            Err(e) => Err(self.check(e)),
        }
    }

    /// Collect completed frames, waiting at most the configured poll timeout
    pub fn pull(&self) -> Result<Vec<Frame>> {
        let timeout = self.settings.load().poll_timeout();
        self.pull_timeout(timeout)
    }

    pub fn pull_timeout(&self, timeout: Duration) -> Result<Vec<Frame>> {
        let pool = self.pool.read().clone();
        match pool {
            Some(pool) => pool.poll_output_timeout(timeout).map_err(|e| self.check(e)),
            None => Ok(Vec::new()),
        }
    }

    /// Hand a frame's slot back to the pool
    pub fn release(&self, frame: &Frame) -> Result<()> {
        let pool = self.pool.read().clone();
        match pool {
            Some(pool) => pool.release(frame).map_err(|e| self.check(e)),
            None if frame.is_detached() => Ok(()),
            None => Err(CodecError::StaleFrame {
                index: frame.slot().index,
            }),
        }
    }

    /// Drain the device at end-of-stream
    ///
    /// Returns the remaining frames in order; the caller delivers them
    /// before passing end-of-stream on. The engine stays Playing and the
    /// next push restarts the device.
    pub fn end_of_stream(&self) -> Result<Vec<Frame>> {
        let pool = self.active_pool("end-of-stream")?;
        let drain = self
            .inner
            .lock()
            .negotiated
            .as_ref()
            .map(|n| n.drain())
            .ok_or(CodecError::NotNegotiated)?;

        let frames = pool.flush(drain).map_err(|e| self.check(e))?;
        let (submitted, delivered) = pool.stats();
        info!(
            "{}: end of stream, {} buffers in, {} frames out",
            self.name, submitted, delivered
        );
        self.events.publish(EngineEvent::EndOfStream {
            element: self.name.clone(),
            frames: delivered,
        });
        Ok(frames)
    }

    fn active_pool(&self, operation: &str) -> Result<Arc<BufferPool>> {
        let pool = self.pool.read().clone();
        match pool {
            Some(pool) => Ok(pool),
            None => Err(CodecError::InvalidState {
                from: self.state().to_string(),
                to: operation.to_string(),
            }),
        }
    }

    /// Reallocate a pool stopped by an earlier drain
    fn restart(&self, pool: &BufferPool) -> Result<()> {
        let inner = self.inner.lock();
        let negotiated = inner.negotiated.as_ref().ok_or(CodecError::NotNegotiated)?;
        if pool.is_streaming() {
            return Ok(());
        }
        debug!("{}: restarting after end of stream", self.name);
        let result = pool.allocate(negotiated.slot_count(), negotiated.slot_sizes());
        drop(inner);
        result.map(|_| ()).map_err(|e| self.check(e))
    }

    /// Escalate fatal errors; every error is passed through
    fn check(&self, err: CodecError) -> CodecError {
        if err.is_fatal() {
            let mut inner = self.inner.lock();
            self.fail_locked(&mut inner, &err);
        }
        err
    }

    fn fail_locked(&self, inner: &mut EngineInner, err: &CodecError) {
        error!("{}: {}, shutting down", self.name, err);
        self.events.publish(EngineEvent::Fatal {
            element: self.name.clone(),
            reason: err.to_string(),
        });
        for next in inner.state.path_to(StreamState::Null) {
            if let Err(e) = self.step_locked(inner, next) {
                warn!("{}: teardown to {} failed: {}", self.name, next, e);
            }
        }
    }

    fn step_locked(&self, inner: &mut EngineInner, next: StreamState) -> Result<()> {
        let from = inner.state;
        match (from, next) {
            (StreamState::Null, StreamState::Ready) => self.open(inner)?,
            (StreamState::Ready, StreamState::Paused) => self.prepare(inner)?,
            (StreamState::Paused, StreamState::Playing) => self.start(inner)?,
            (StreamState::Playing, StreamState::Paused) => self.stop(),
            (StreamState::Paused, StreamState::Ready) => inner.negotiated = None,
            (StreamState::Ready, StreamState::Null) => self.close(inner),
            _ => {
                return Err(CodecError::InvalidState {
                    from: from.to_string(),
                    to: next.to_string(),
                })
            }
        }

        inner.state = next;
        info!("{}: {} -> {}", self.name, from, next);
        self.events.publish(EngineEvent::StateChanged {
            element: self.name.clone(),
            from,
            to: next,
        });
        Ok(())
    }

    fn open(&self, inner: &mut EngineInner) -> Result<()> {
        let path = match self.settings.load().device.clone() {
            Some(path) => path,
            None => find_m2m_device(self.codec.kind())?.path,
        };
        let device = self.opener.open(&path)?;
        info!("{}: opened {}", self.name, device.name());
        inner.device = Some(device);
        Ok(())
    }

    fn prepare(&self, inner: &mut EngineInner) -> Result<()> {
        let Some(caps) = inner.caps else {
            self.publish_not_negotiated("no caps received".to_string());
            return Err(CodecError::NotNegotiated);
        };
        let settings = self.settings.load_full();
        match negotiate(self.codec.as_ref(), &settings, &caps) {
            Ok(negotiated) => {
                self.store_negotiated(inner, negotiated);
                Ok(())
            }
            Err(violation) => {
                self.publish_not_negotiated(violation.to_string());
                Err(violation.into())
            }
        }
    }

    fn start(&self, inner: &mut EngineInner) -> Result<()> {
        let negotiated = inner.negotiated.clone().ok_or(CodecError::NotNegotiated)?;
        let device = inner.device.clone().ok_or_else(|| CodecError::InvalidState {
            from: "closed device".to_string(),
            to: StreamState::Playing.to_string(),
        })?;
        device.configure(&DeviceFormat::from_negotiated(&negotiated))?;

        let settings = self.settings.load_full();
        let pool = Arc::new(BufferPool::new(
            device,
            PoolOptions {
                poll_timeout: settings.poll_timeout(),
                drain_attempts: settings.drain_attempts,
            },
        ));

        let mut count = negotiated.slot_count();
        let granted = loop {
            match pool.allocate(count, negotiated.slot_sizes()) {
                Ok(granted) => break granted,
                Err(CodecError::Allocation(reason)) if count > MIN_SLOTS => {
                    let fewer = (count / 2).max(MIN_SLOTS);
                    warn!(
                        "{}: {} slots unavailable ({}), retrying with {}",
                        self.name, count, reason, fewer
                    );
                    count = fewer;
                }
                Err(e) => return Err(e),
            }
        };
        if granted != negotiated.slot_count() {
            debug!(
                "{}: running with {} of {} requested slots",
                self.name,
                granted,
                negotiated.slot_count()
            );
            inner.negotiated = Some(negotiated.with_slot_count(granted.max(MIN_SLOTS))?);
        }

        *self.pool.write() = Some(pool);
        Ok(())
    }

    fn stop(&self) {
        let pool = self.pool.write().take();
        if let Some(pool) = pool {
            let counts = pool.counts();
            if counts.device_owned() > 0 {
                debug!(
                    "{}: abandoning {} in-flight slots",
                    self.name,
                    counts.device_owned()
                );
            }
            if let Err(e) = pool.release_all() {
                warn!("{}: releasing buffers failed: {}", self.name, e);
            }
        }
    }

    fn close(&self, inner: &mut EngineInner) {
        if let Some(device) = inner.device.take() {
            debug!("{}: closing {}", self.name, device.name());
        }
    }

    fn store_negotiated(&self, inner: &mut EngineInner, negotiated: Negotiated) {
        self.events.publish(EngineEvent::Negotiated {
            element: self.name.clone(),
            codec: Some(self.codec.kind()),
            input: *negotiated.input_caps(),
            output: Some(*negotiated.output_caps()),
        });
        inner.negotiated = Some(negotiated);
    }

    fn publish_not_negotiated(&self, reason: String) {
        self.events.publish(EngineEvent::NotNegotiated {
            element: self.name.clone(),
            reason,
        });
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        for next in inner.state.path_to(StreamState::Null) {
            if let Err(e) = self.step_locked(&mut inner, next) {
                debug!("{}: teardown on drop failed: {}", self.name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::AacStreamFormat;
    use crate::device::{FaultPlan, SimulatedDevice, SimulatedOpener, Transform};
    use crate::format::{Fraction, PixelFormat};
    use std::path::PathBuf;
    use std::time::Instant;

    fn opener(
        make: impl Fn() -> (Transform, FaultPlan) + Send + Sync + 'static,
    ) -> Arc<SimulatedOpener> {
        Arc::new(SimulatedOpener::new(move |path| {
            let (transform, faults) = make();
            SimulatedDevice::with_faults(path.display().to_string(), transform, faults)
        }))
    }

    fn engine(kind: CodecKind, opener: Arc<SimulatedOpener>) -> StreamEngine {
        let engine = StreamEngine::new(kind, opener);
        engine
            .set_property(Property::Device(PathBuf::from("/dev/sim0")))
            .unwrap();
        engine
    }

    /// Stand-in for the encoder's output: deterministic per input buffer
    fn reference_au(input: &[u8]) -> Vec<u8> {
        let hash = input
            .iter()
            .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(*b as u32));
        let mut au = vec![0x21, 0x1b];
        au.extend_from_slice(&hash.to_be_bytes());
        au.extend(std::iter::repeat(input[0]).take(24));
        au
    }

    fn aac_opener() -> Arc<SimulatedOpener> {
        opener(|| {
            (
                Box::new(|data: &[u8]| vec![reference_au(data)]) as Transform,
                FaultPlan::default(),
            )
        })
    }

    fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_lifecycle_events() {
        let engine = engine(CodecKind::AacEncode, aac_opener());
        let mut rx = engine.events().subscribe();

        engine.set_caps(MediaCaps::raw_audio(48000, 1)).unwrap();
        engine.set_state(StreamState::Playing).unwrap();
        assert_eq!(engine.state(), StreamState::Playing);
        assert!(engine.slot_counts().unwrap().queued_output > 0);

        engine.set_state(StreamState::Null).unwrap();
        assert!(engine.slot_counts().is_none());

        let names: Vec<&str> = drain_events(&mut rx)
            .iter()
            .map(|e| e.event_name())
            .collect();
        assert_eq!(
            names,
            vec![
                "engine.state_changed",
                "engine.negotiated",
                "engine.state_changed",
                "engine.state_changed",
                "engine.state_changed",
                "engine.state_changed",
                "engine.state_changed",
            ]
        );
    }

    #[test]
    fn test_paused_requires_caps() {
        let engine = engine(CodecKind::AacEncode, aac_opener());
        let mut rx = engine.events().subscribe();

        assert!(matches!(
            engine.set_state(StreamState::Playing),
            Err(CodecError::NotNegotiated)
        ));
        assert_eq!(engine.state(), StreamState::Ready);
        assert!(drain_events(&mut rx)
            .iter()
            .any(|e| matches!(e, EngineEvent::NotNegotiated { .. })));
    }

    #[test]
    fn test_rejected_caps_are_reported() {
        let engine = engine(CodecKind::AacEncode, aac_opener());
        let mut rx = engine.events().subscribe();

        assert!(matches!(
            engine.set_caps(MediaCaps::raw_audio(96000, 2)),
            Err(CodecError::Negotiation(_))
        ));
        assert!(engine.caps().is_none());
        assert!(drain_events(&mut rx).iter().any(|e| e.is_error()));
    }

    #[test]
    fn test_device_path_only_changes_when_closed() {
        let engine = engine(CodecKind::AacEncode, aac_opener());
        engine.set_state(StreamState::Ready).unwrap();
        assert!(matches!(
            engine.set_property(Property::Device(PathBuf::from("/dev/video5"))),
            Err(CodecError::InvalidState { .. })
        ));
        engine.set_property(Property::Bitrate(96000)).unwrap();
        assert_eq!(engine.settings().bitrate, 96000);
    }

    #[test]
    fn test_allocation_failure_stays_paused() {
        let opener = opener(|| {
            (
                Box::new(|data: &[u8]| vec![data.to_vec()]) as Transform,
                FaultPlan {
                    max_slots: Some(0),
                    ..Default::default()
                },
            )
        });
        let engine = engine(CodecKind::AacEncode, opener);
        engine.set_caps(MediaCaps::raw_audio(48000, 2)).unwrap();

        assert!(matches!(
            engine.set_state(StreamState::Playing),
            Err(CodecError::Allocation(_))
        ));
        assert_eq!(engine.state(), StreamState::Paused);
        assert!(engine.slot_counts().is_none());
    }

    #[test]
    fn test_aac_stream_end_to_end() {
        let engine = engine(CodecKind::AacEncode, aac_opener());
        engine.set_property(Property::Bitrate(288000)).unwrap();
        engine
            .set_property(Property::AacOutput(AacStreamFormat::Raw))
            .unwrap();
        let negotiated = engine.set_caps(MediaCaps::raw_audio(44100, 2)).unwrap();
        assert_eq!(
            *negotiated.output_caps(),
            MediaCaps::Aac {
                rate: 44100,
                channels: 2,
                stream_format: AacStreamFormat::Raw,
            }
        );
        engine.set_state(StreamState::Playing).unwrap();
        let mut rx = engine.events().subscribe();

        let frame_bytes = crate::codec::AacEncode::frame_bytes(2);
        let inputs: Vec<Vec<u8>> = (0..100u32)
            .map(|i| (0..frame_bytes).map(|j| (i as usize * 7 + j) as u8).collect())
            .collect();

        let mut outputs: Vec<Frame> = Vec::new();
        let collect = |engine: &StreamEngine, outputs: &mut Vec<Frame>| {
            for frame in engine.pull_timeout(Duration::from_millis(10)).unwrap() {
                engine.release(&frame).unwrap();
                outputs.push(frame);
            }
        };

        for (i, input) in inputs.iter().enumerate() {
            let timestamp = Duration::from_micros(i as u64 * 23_220);
            while engine.push(input, timestamp).unwrap() == Submit::Backpressure {
                collect(&engine, &mut outputs);
            }
        }
        collect(&engine, &mut outputs);

        outputs.extend(engine.end_of_stream().unwrap());
        assert_eq!(engine.slot_counts().unwrap().device_owned(), 0);

        assert_eq!(outputs.len(), 100);
        for (i, frame) in outputs.iter().enumerate() {
            assert_eq!(frame.data(), reference_au(&inputs[i]).as_slice());
            assert_eq!(frame.sequence, i as u64);
            assert_eq!(frame.timestamp, Duration::from_micros(i as u64 * 23_220));
        }
        assert!(drain_events(&mut rx)
            .iter()
            .any(|e| matches!(e, EngineEvent::EndOfStream { frames: 100, .. })));
    }

    #[test]
    fn test_jpeg_single_picture() {
        let opener = opener(|| {
            (
                Box::new(|_: &[u8]| vec![vec![0xff, 0xd8, 0xff, 0xe0, 0xff, 0xd9]]) as Transform,
                FaultPlan::default(),
            )
        });
        let engine = engine(CodecKind::JpegEncode, opener);
        engine.set_property(Property::Quality(90)).unwrap();

        let input = MediaCaps::raw_video(PixelFormat::Yuv420, 320, 240, Fraction::new(30, 1));
        engine.set_caps(input).unwrap();
        engine.set_state(StreamState::Playing).unwrap();

        let output = engine.output_caps().unwrap();
        assert_eq!(output.resolution(), input.resolution());
        assert_eq!(output.framerate(), input.framerate());

        let picture = vec![0x80u8; PixelFormat::Yuv420.frame_size(320, 240)];
        assert!(matches!(
            engine.push(&picture, Duration::ZERO).unwrap(),
            Submit::Accepted(_)
        ));
        let mut frames = engine.pull().unwrap();
        frames.extend(engine.end_of_stream().unwrap());
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].data()[..2], &[0xff, 0xd8]);
    }

    #[test]
    fn test_renegotiation_while_playing() {
        let opener = opener(|| {
            (
                Box::new(|data: &[u8]| vec![data[..4].to_vec()]) as Transform,
                FaultPlan::default(),
            )
        });
        let engine = engine(CodecKind::H264Encode, opener.clone());
        engine
            .set_caps(MediaCaps::raw_video(
                PixelFormat::Nv12,
                320,
                240,
                Fraction::new(30, 1),
            ))
            .unwrap();
        engine.set_state(StreamState::Playing).unwrap();

        engine
            .push(&vec![1u8; 320 * 240 * 3 / 2], Duration::ZERO)
            .unwrap();
        let old = engine.pull().unwrap();
        assert_eq!(old.len(), 1);

        engine
            .set_caps(MediaCaps::raw_video(
                PixelFormat::Nv12,
                640,
                480,
                Fraction::new(30, 1),
            ))
            .unwrap();
        assert_eq!(engine.state(), StreamState::Playing);
        let device = opener.last_opened().unwrap();
        assert_eq!(device.format().unwrap().width, 640);

        // Delivered data survives; its slot belongs to the old pool
        assert_eq!(old[0].data(), &[1, 1, 1, 1]);
        assert!(matches!(
            engine.release(&old[0]),
            Err(CodecError::StaleFrame { .. })
        ));
        assert!(matches!(
            engine.push(&vec![2u8; 640 * 480 * 3 / 2], Duration::ZERO).unwrap(),
            Submit::Accepted(_)
        ));
    }

    #[test]
    fn test_backpressure_is_reported() {
        let engine = engine(CodecKind::AacEncode, aac_opener());
        engine.set_property(Property::FrameMemory(2)).unwrap();
        engine.set_caps(MediaCaps::raw_audio(48000, 1)).unwrap();
        engine.set_state(StreamState::Playing).unwrap();

        let buffer = vec![0u8; crate::codec::AacEncode::frame_bytes(1)];
        let mut results = Vec::new();
        for _ in 0..6 {
            results.push(engine.push(&buffer, Duration::ZERO).unwrap());
        }
        assert!(results.contains(&Submit::Backpressure));

        for frame in engine.pull().unwrap() {
            engine.release(&frame).unwrap();
        }
        assert!(matches!(
            engine.push(&buffer, Duration::ZERO).unwrap(),
            Submit::Accepted(_)
        ));
    }

    #[test]
    fn test_device_fault_forces_null() {
        let opener = opener(|| {
            (
                Box::new(|data: &[u8]| vec![data.to_vec()]) as Transform,
                FaultPlan {
                    fail_queue_after: Some(2),
                    ..Default::default()
                },
            )
        });
        let engine = engine(CodecKind::AacEncode, opener.clone());
        engine.set_caps(MediaCaps::raw_audio(48000, 1)).unwrap();
        engine.set_state(StreamState::Playing).unwrap();
        let mut rx = engine.events().subscribe();

        let buffer = vec![0u8; 64];
        engine.push(&buffer, Duration::ZERO).unwrap();
        engine.push(&buffer, Duration::ZERO).unwrap();
        let err = engine.push(&buffer, Duration::ZERO).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(engine.state(), StreamState::Null);

        let events = drain_events(&mut rx);
        assert!(matches!(events.first(), Some(EngineEvent::Fatal { .. })));
        assert!(matches!(
            engine.push(&buffer, Duration::ZERO),
            Err(CodecError::InvalidState { .. })
        ));

        // Teardown left the faulted device alone
        let device = opener.last_opened().unwrap();
        assert!(device.is_faulted());
        assert_eq!(device.calls_after_fault(), 0);
    }

    #[test]
    fn test_teardown_with_input_in_flight() {
        let opener = opener(|| {
            (
                Box::new(|data: &[u8]| vec![data.to_vec()]) as Transform,
                FaultPlan {
                    stuck_drain: true,
                    ..Default::default()
                },
            )
        });
        let engine = engine(CodecKind::AacEncode, opener.clone());
        engine.set_caps(MediaCaps::raw_audio(48000, 1)).unwrap();
        engine.set_state(StreamState::Playing).unwrap();
        for _ in 0..3 {
            engine.push(&[0u8; 64], Duration::ZERO).unwrap();
        }

        engine.set_state(StreamState::Null).unwrap();
        assert_eq!(engine.state(), StreamState::Null);
        assert!(!opener.last_opened().unwrap().is_streaming());
    }

    #[test]
    fn test_teardown_during_drain() {
        let opener = opener(|| {
            (
                Box::new(|data: &[u8]| vec![data.to_vec()]) as Transform,
                FaultPlan {
                    stuck_drain: true,
                    ..Default::default()
                },
            )
        });
        let engine = engine(CodecKind::AacEncode, opener.clone());
        engine.set_property(Property::DrainAttempts(100_000)).unwrap();
        engine.set_property(Property::PollTimeoutMs(10)).unwrap();
        engine.set_caps(MediaCaps::raw_audio(48000, 1)).unwrap();
        engine.set_state(StreamState::Playing).unwrap();
        engine.push(&[0u8; 64], Duration::ZERO).unwrap();
        let engine = Arc::new(engine);
        let device = opener.last_opened().unwrap();

        let drain = {
            let engine = engine.clone();
            std::thread::spawn(move || engine.end_of_stream())
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while !device.is_draining() {
            assert!(Instant::now() < deadline, "drain never started");
            std::thread::sleep(Duration::from_millis(1));
        }

        let started = Instant::now();
        engine.set_state(StreamState::Null).unwrap();
        let frames = drain.join().unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(frames.iter().all(|f| f.is_detached()));
        assert_eq!(engine.state(), StreamState::Null);
        assert!(!device.is_streaming());
    }

    #[test]
    fn test_push_after_end_of_stream_restarts() {
        let engine = engine(CodecKind::AacEncode, aac_opener());
        engine.set_caps(MediaCaps::raw_audio(48000, 1)).unwrap();
        engine.set_state(StreamState::Playing).unwrap();

        engine.push(&[1u8; 64], Duration::ZERO).unwrap();
        assert_eq!(engine.end_of_stream().unwrap().len(), 1);

        assert!(matches!(
            engine.push(&[2u8; 64], Duration::ZERO).unwrap(),
            Submit::Accepted(_)
        ));
        assert_eq!(engine.pull().unwrap().len(), 1);
    }
}
