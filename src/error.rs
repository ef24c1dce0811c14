use thiserror::Error;

use crate::codec::ConstraintViolation;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum CodecError {
    /// Proposed configuration violates a hardware constraint
    #[error("Negotiation failed: {0}")]
    Negotiation(#[from] ConstraintViolation),

    #[error("Stream is not negotiated")]
    NotNegotiated,

    /// Every input slot is owned by the device (transient backpressure)
    #[error("No free buffer slot")]
    NoFreeSlot,

    #[error("Buffer allocation failed: {0}")]
    Allocation(String),

    #[error("Device fault [{device}]: {reason}")]
    DeviceFault { device: String, reason: String },

    #[error("Device stuck: {pending} slots still owned by hardware after drain")]
    StuckDevice { pending: usize },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidState { from: String, to: String },

    #[error("Frame in slot {index} was already released")]
    StaleFrame { index: usize },

    #[error("Buffer of {len} bytes exceeds slot capacity {capacity}")]
    FrameTooLarge { len: usize, capacity: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CodecError {
    pub fn device_fault(device: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        CodecError::DeviceFault {
            device: device.into(),
            reason: reason.to_string(),
        }
    }

    /// Errors after which the stream instance must be torn down
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CodecError::DeviceFault { .. } | CodecError::StuckDevice { .. }
        )
    }

    /// Errors the caller may resolve by retrying or reconfiguring
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CodecError::Negotiation(_) | CodecError::NoFreeSlot | CodecError::Allocation(_)
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, CodecError>;
