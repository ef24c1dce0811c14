//! m2m-codec - Transaction engine for V4L2 memory-to-memory codecs
//!
//! This crate drives hardware H.264, JPEG and AAC codec accelerators
//! exposed as M2M character devices, and presents decoded pictures on a
//! Linux framebuffer.

pub mod codec;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod events;
pub mod format;
pub mod pipeline;
pub mod pool;
pub mod sink;
pub mod utils;

pub use error::{CodecError, Result};
