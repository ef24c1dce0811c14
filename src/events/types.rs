//! Engine event types
//!
//! Defines the notifications a codec or sink instance broadcasts to its
//! surrounding pipeline.

use serde::{Deserialize, Serialize};

use crate::codec::{CodecKind, MediaCaps};
use crate::engine::StreamState;

/// Engine event (broadcast to all subscribers)
///
/// Serialized as `{"event": "engine.state_changed", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum EngineEvent {
    /// A lifecycle transition completed
    #[serde(rename = "engine.state_changed")]
    StateChanged {
        element: String,
        from: StreamState,
        to: StreamState,
    },

    /// Negotiation produced a usable configuration
    #[serde(rename = "engine.negotiated")]
    Negotiated {
        element: String,
        codec: Option<CodecKind>,
        input: MediaCaps,
        output: Option<MediaCaps>,
    },

    /// Caps were rejected or the element started without any
    #[serde(rename = "engine.not_negotiated")]
    NotNegotiated { element: String, reason: String },

    /// All pending output was delivered after end-of-stream
    #[serde(rename = "engine.eos")]
    EndOfStream { element: String, frames: u64 },

    /// Unrecoverable device failure, the element was forced back to Null
    #[serde(rename = "engine.fatal")]
    Fatal { element: String, reason: String },
}

impl EngineEvent {
    /// Get the event name (for filtering)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "engine.state_changed",
            Self::Negotiated { .. } => "engine.negotiated",
            Self::NotNegotiated { .. } => "engine.not_negotiated",
            Self::EndOfStream { .. } => "engine.eos",
            Self::Fatal { .. } => "engine.fatal",
        }
    }

    /// Name of the element that raised the event
    pub fn element(&self) -> &str {
        match self {
            Self::StateChanged { element, .. }
            | Self::Negotiated { element, .. }
            | Self::NotNegotiated { element, .. }
            | Self::EndOfStream { element, .. }
            | Self::Fatal { element, .. } => element,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::NotNegotiated { .. } | Self::Fatal { .. })
    }
}
