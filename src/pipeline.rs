//! Async adapter around a [`StreamEngine`]
//!
//! The engine's calls block on the device, so the engine runs on a blocking
//! worker thread. Producers send [`PipelineInput`] over a bounded channel and
//! consumers receive [`PipelineOutput`] in submission order.
//!
//! # Architecture
//!
//! ```text
//! producer (async)
//!        |
//!        v (mpsc::Sender<PipelineInput>)
//! worker (spawn_blocking)
//!   push ──Backpressure──> pull + release, push again
//!        |
//!        v (mpsc::Sender<PipelineOutput>)
//! consumer (async)
//! ```
//!
//! Backpressure never drops data: a buffer the device cannot take yet is
//! held by the worker while it drains output, and the bounded input channel
//! in turn holds back the producer.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{StreamEngine, StreamState, Submit};
use crate::error::{CodecError, Result};
use crate::pool::Frame;

/// Default depth of the input and output channels
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// Wait used while input is still in flight on the device
const IN_FLIGHT_POLL: Duration = Duration::from_millis(5);

/// Message from the producer
#[derive(Debug, Clone)]
pub enum PipelineInput {
    Buffer { data: Bytes, timestamp: Duration },
    EndOfStream,
}

/// Message to the consumer
#[derive(Debug, Clone)]
pub enum PipelineOutput {
    Buffer {
        data: Bytes,
        timestamp: Duration,
        sequence: u64,
        corrupted: bool,
    },
    /// Every frame of the stream has been delivered
    EndOfStream,
    Error(String),
}

/// Counters reported when the worker exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub buffers_in: u64,
    pub frames_out: u64,
    /// Times a push had to wait for output to be released
    pub backpressure_waits: u64,
}

/// Running pipeline
pub struct CodecPipeline {
    input_tx: mpsc::Sender<PipelineInput>,
    output_rx: mpsc::Receiver<PipelineOutput>,
    stop_flag: Arc<AtomicBool>,
    handle: JoinHandle<PipelineStats>,
}

impl CodecPipeline {
    /// Start driving `engine`, which must already be Playing
    pub fn spawn(engine: Arc<StreamEngine>) -> Self {
        Self::with_capacity(engine, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(engine: Arc<StreamEngine>, capacity: usize) -> Self {
        let (input_tx, input_rx) = mpsc::channel(capacity.max(1));
        let (output_tx, output_rx) = mpsc::channel(capacity.max(1));
        let stop_flag = Arc::new(AtomicBool::new(false));

        info!("Starting pipeline for {}", engine.name());
        let flag = stop_flag.clone();
        let handle = tokio::task::spawn_blocking(move || {
            Worker {
                engine,
                output_tx,
                stop_flag: flag,
                stats: PipelineStats::default(),
            }
            .run(input_rx)
        });

        Self {
            input_tx,
            output_rx,
            stop_flag,
            handle,
        }
    }

    /// Handle for producers; clones feed the same worker
    pub fn input(&self) -> mpsc::Sender<PipelineInput> {
        self.input_tx.clone()
    }

    /// Send one message, waiting while the input channel is full
    pub async fn send(&self, input: PipelineInput) -> Result<()> {
        self.input_tx
            .send(input)
            .await
            .map_err(|_| CodecError::InvalidState {
                from: "stopped pipeline".to_string(),
                to: "send".to_string(),
            })
    }

    /// Next output; `None` once the worker has exited
    pub async fn recv(&mut self) -> Option<PipelineOutput> {
        self.output_rx.recv().await
    }

    /// Ask the worker to exit after its current step
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    /// Close the input side and wait for the worker
    pub async fn join(self) -> Result<PipelineStats> {
        let CodecPipeline {
            input_tx,
            output_rx,
            handle,
            ..
        } = self;
        drop(input_tx);
        drop(output_rx);
        handle
            .await
            .map_err(|e| CodecError::Config(format!("Pipeline worker failed: {}", e)))
    }
}

struct Worker {
    engine: Arc<StreamEngine>,
    output_tx: mpsc::Sender<PipelineOutput>,
    stop_flag: Arc<AtomicBool>,
    stats: PipelineStats,
}

impl Worker {
    fn run(mut self, mut input_rx: mpsc::Receiver<PipelineInput>) -> PipelineStats {
        while !self.stop_flag.load(Ordering::Relaxed) {
            let input = match input_rx.try_recv() {
                Ok(input) => input,
                Err(TryRecvError::Empty) => {
                    if self.input_in_flight() {
                        if !self.collect(IN_FLIGHT_POLL) {
                            break;
                        }
                        continue;
                    }
                    match input_rx.blocking_recv() {
                        Some(input) => input,
                        None => break,
                    }
                }
                Err(TryRecvError::Disconnected) => break,
            };

            let keep_going = match input {
                PipelineInput::Buffer { data, timestamp } => self.submit(&data, timestamp),
                PipelineInput::EndOfStream => self.finish(),
            };
            if !keep_going {
                break;
            }
        }

        info!(
            "Pipeline for {} ended: {} buffers in, {} frames out, {} backpressure waits",
            self.engine.name(),
            self.stats.buffers_in,
            self.stats.frames_out,
            self.stats.backpressure_waits
        );
        self.stats
    }

    fn input_in_flight(&self) -> bool {
        self.engine
            .slot_counts()
            .map(|c| c.queued_input > 0)
            .unwrap_or(false)
    }

    /// Push one buffer, draining output until the device accepts it
    fn submit(&mut self, data: &[u8], timestamp: Duration) -> bool {
        loop {
            match self.engine.push(data, timestamp) {
                Ok(Submit::Accepted(_)) => {
                    self.stats.buffers_in += 1;
                    return self.collect(Duration::ZERO);
                }
                Ok(Submit::Backpressure) => {
                    self.stats.backpressure_waits += 1;
                    if !self.collect(self.engine.settings().poll_timeout()) {
                        return false;
                    }
                    if self.stop_flag.load(Ordering::Relaxed) {
                        return false;
                    }
                }
                Err(e) => return self.report(e),
            }
        }
    }

    fn finish(&mut self) -> bool {
        if !self.collect(Duration::ZERO) {
            return false;
        }
        match self.engine.end_of_stream() {
            Ok(frames) => {
                if !self.deliver(frames) {
                    return false;
                }
                debug!("{}: end of stream delivered", self.engine.name());
                self.output_tx
                    .blocking_send(PipelineOutput::EndOfStream)
                    .is_ok()
            }
            Err(e) => self.report(e),
        }
    }

    /// Pull and deliver whatever completed within `timeout`
    fn collect(&mut self, timeout: Duration) -> bool {
        match self.engine.pull_timeout(timeout) {
            Ok(frames) => self.deliver(frames),
            Err(e) => self.report(e),
        }
    }

    /// Copy frames out, release their slots, then hand them on
    fn deliver(&mut self, frames: Vec<Frame>) -> bool {
        for frame in frames {
            let output = PipelineOutput::Buffer {
                data: frame.data_bytes(),
                timestamp: frame.timestamp,
                sequence: frame.sequence,
                corrupted: frame.corrupted,
            };
            if let Err(e) = self.engine.release(&frame) {
                if !self.report(e) {
                    return false;
                }
            }
            if self.output_tx.blocking_send(output).is_err() {
                debug!("{}: consumer gone", self.engine.name());
                return false;
            }
            self.stats.frames_out += 1;
        }
        true
    }

    /// Forward an error; returns whether the worker can continue
    fn report(&mut self, err: CodecError) -> bool {
        warn!("{}: {}", self.engine.name(), err);
        let _ = self.output_tx.blocking_send(PipelineOutput::Error(err.to_string()));
        !err.is_fatal() && self.engine.state() == StreamState::Playing
    }
}
