use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use crate::codec::{AacStreamFormat, ChannelMode, CodecKind, RateControl, MAX_SLOTS, MIN_SLOTS};
use crate::error::{CodecError, Result};

/// Externally settable properties of one codec or sink instance
///
/// Values are only validated against the hardware constraint tables at
/// negotiation time; setters merely clamp to the declared property range.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ElementSettings {
    /// Device node (None = auto-detect)
    pub device: Option<PathBuf>,
    /// Target bitrate in bits per second (0 = codec default)
    pub bitrate: u32,
    /// JPEG quality
    pub quality: u32,
    /// AAC channel mode (None = derive from caps)
    pub channel_mode: Option<ChannelMode>,
    /// AAC output framing
    pub aac_output: AacStreamFormat,
    /// AAC constant bitrate
    pub enable_cbr: bool,
    /// H.264 rate control mode
    pub rate_control: RateControl,
    /// H.264 maximum GOP length (0 = intra only)
    pub max_gop_length: u32,
    /// H.264 number of consecutive B-pictures
    pub b_pic_mode: u32,
    /// Row stride in pixels (0 = derive from width)
    pub stride: u32,
    pub x_offset: u32,
    pub y_offset: u32,
    /// Number of hardware buffer slots (0 = codec default)
    pub frame_memory: u32,
    /// Framebuffer sink: wait for vertical sync before presenting
    pub vsync: bool,
    /// Framebuffer sink: flip between two pages instead of drawing in place
    pub dma_mode: bool,
    /// Upper bound of one device wait
    pub poll_timeout_ms: u64,
    /// Device waits allowed while draining before the device counts as stuck
    pub drain_attempts: u32,
}

impl Default for ElementSettings {
    fn default() -> Self {
        Self {
            device: None,
            bitrate: 0,
            quality: 75,
            channel_mode: None,
            aac_output: AacStreamFormat::Raw,
            enable_cbr: false,
            rate_control: RateControl::Cbr,
            max_gop_length: 30,
            b_pic_mode: 0,
            stride: 0,
            x_offset: 0,
            y_offset: 0,
            frame_memory: 0,
            vsync: true,
            dma_mode: false,
            poll_timeout_ms: 100,
            drain_attempts: 50,
        }
    }
}

impl ElementSettings {
    /// Load settings from a JSON file; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            CodecError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn poll_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Declared ranges of the numeric properties of one codec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyRanges {
    pub bitrate: RangeInclusive<u32>,
    /// Used when `bitrate` is left at 0
    pub default_bitrate: u32,
    pub quality: RangeInclusive<u32>,
    pub max_gop_length: RangeInclusive<u32>,
    pub b_pic_mode: RangeInclusive<u32>,
    /// Slot count range; 0 (codec default) is accepted outside it
    pub frame_memory: RangeInclusive<u32>,
}

impl PropertyRanges {
    pub fn for_codec(kind: CodecKind) -> Self {
        let (bitrate, default_bitrate) = match kind {
            CodecKind::AacEncode => (
                crate::codec::constraints::AAC_BITRATE_MIN
                    ..=crate::codec::constraints::AAC_BITRATE_MAX,
                128_000,
            ),
            CodecKind::H264Encode => (64_000..=40_000_000, 2_000_000),
            CodecKind::H264Decode | CodecKind::JpegEncode => (0..=0, 0),
        };
        Self {
            bitrate,
            default_bitrate,
            quality: 1..=100,
            max_gop_length: 0..=120,
            b_pic_mode: 0..=3,
            frame_memory: MIN_SLOTS as u32..=MAX_SLOTS as u32,
        }
    }

    /// Ranges for an element without a codec (framebuffer sink)
    pub fn unconstrained() -> Self {
        Self {
            bitrate: 0..=u32::MAX,
            default_bitrate: 0,
            quality: 1..=100,
            max_gop_length: 0..=120,
            b_pic_mode: 0..=3,
            frame_memory: MIN_SLOTS as u32..=MAX_SLOTS as u32,
        }
    }
}
