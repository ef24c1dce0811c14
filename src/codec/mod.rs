//! Capability negotiation for the hardware codecs
//!
//! Each codec variant implements [`CodecEngine`], supplying its constraint
//! table and slot sizing policy. [`negotiate`] combines properties and
//! upstream caps into a [`Negotiated`] stream. Only a `Negotiated` value can
//! reach the buffer pool, so an invalid configuration never touches hardware.
//!
//! # Architecture
//!
//! ```text
//! ElementSettings + MediaCaps
//!          |
//!          v
//!   CodecEngine::configure ──> StreamConfiguration
//!          |
//!          v
//!   CodecEngine::validate  (constraint table)
//!          |
//!          v
//!     Negotiated { config, output caps, slot plan }
//! ```

pub mod aac;
pub mod caps;
pub mod constraints;
pub mod controls;
pub mod h264_decode;
pub mod h264_encode;
pub mod jpeg;
pub mod stream;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

pub use aac::AacEncode;
pub use caps::{AacStreamFormat, MediaCaps};
pub use constraints::ConstraintViolation;
pub use controls::{DeviceControl, DrainKind};
pub use h264_decode::{split_nal_units, H264Decode};
pub use h264_encode::H264Encode;
pub use jpeg::JpegEncode;
pub use stream::{
    AudioParams, ChannelMode, CodecMode, Geometry, MediaParams, RateControl, RateTarget,
    SlotSizes, StreamConfiguration,
};

use crate::config::{ElementSettings, PropertyRanges};

/// Codec variants driven by this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    H264Encode,
    H264Decode,
    JpegEncode,
    AacEncode,
}

impl CodecKind {
    pub fn all() -> &'static [CodecKind] {
        &[
            CodecKind::H264Encode,
            CodecKind::H264Decode,
            CodecKind::JpegEncode,
            CodecKind::AacEncode,
        ]
    }

    /// Constraint table and sizing policy for this variant
    pub fn engine(&self) -> Arc<dyn CodecEngine> {
        match self {
            CodecKind::H264Encode => Arc::new(H264Encode),
            CodecKind::H264Decode => Arc::new(H264Decode),
            CodecKind::JpegEncode => Arc::new(JpegEncode),
            CodecKind::AacEncode => Arc::new(AacEncode),
        }
    }

    pub fn element_name(&self) -> &'static str {
        match self {
            CodecKind::H264Encode => "h264enc",
            CodecKind::H264Decode => "h264dec",
            CodecKind::JpegEncode => "jpegenc",
            CodecKind::AacEncode => "aacenc",
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecKind::H264Encode => write!(f, "H.264 encoder"),
            CodecKind::H264Decode => write!(f, "H.264 decoder"),
            CodecKind::JpegEncode => write!(f, "JPEG encoder"),
            CodecKind::AacEncode => write!(f, "AAC encoder"),
        }
    }
}

impl std::str::FromStr for CodecKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "h264enc" | "h264-encode" => Ok(CodecKind::H264Encode),
            "h264dec" | "h264-decode" => Ok(CodecKind::H264Decode),
            "jpegenc" | "jpeg-encode" => Ok(CodecKind::JpegEncode),
            "aacenc" | "aac-encode" => Ok(CodecKind::AacEncode),
            _ => Err(format!("Unknown codec: {}", s)),
        }
    }
}

/// Picture size limits of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
}

impl DeviceLimits {
    pub fn check(&self, width: u32, height: u32) -> Result<(), ConstraintViolation> {
        if width < self.min_width
            || height < self.min_height
            || width > self.max_width
            || height > self.max_height
        {
            return Err(ConstraintViolation::ResolutionOutOfRange {
                width,
                height,
                min_width: self.min_width,
                min_height: self.min_height,
                max_width: self.max_width,
                max_height: self.max_height,
            });
        }
        Ok(())
    }
}

/// Per-codec capability interface
///
/// Implementations are stateless and may be shared between threads freely.
pub trait CodecEngine: Send + Sync + fmt::Debug {
    fn kind(&self) -> CodecKind;

    /// Build the proposed configuration from properties and upstream caps
    fn configure(
        &self,
        settings: &ElementSettings,
        caps: &MediaCaps,
    ) -> Result<StreamConfiguration, ConstraintViolation>;

    /// Check a proposed configuration against the constraint table
    fn validate(&self, config: &StreamConfiguration) -> Result<(), ConstraintViolation>;

    /// Caps produced on the output side for a valid configuration
    fn output_caps(&self, config: &StreamConfiguration) -> MediaCaps;

    /// Slot sizes needed for a valid configuration
    fn slot_sizes(&self, config: &StreamConfiguration) -> SlotSizes;

    fn default_slot_count(&self) -> usize;

    /// FourCC of the buffers the device consumes
    fn input_fourcc(&self, config: &StreamConfiguration) -> [u8; 4];

    /// FourCC of the buffers the device produces
    fn output_fourcc(&self, config: &StreamConfiguration) -> [u8; 4];

    /// Control writes programming the codec
    fn controls(&self, config: &StreamConfiguration) -> Vec<DeviceControl>;

    fn drain_kind(&self) -> DrainKind {
        DrainKind::Encoder
    }

    fn property_ranges(&self) -> PropertyRanges {
        PropertyRanges::for_codec(self.kind())
    }
}

/// Bounds on the hardware slot count
pub const MIN_SLOTS: usize = 2;
pub const MAX_SLOTS: usize = 32;

/// Outcome of a successful negotiation
///
/// Only produced by [`negotiate`] and [`negotiate_config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    config: StreamConfiguration,
    input_caps: MediaCaps,
    output_caps: MediaCaps,
    slot_count: usize,
    slot_sizes: SlotSizes,
    input_fourcc: [u8; 4],
    output_fourcc: [u8; 4],
    controls: Vec<DeviceControl>,
    drain: DrainKind,
}

impl Negotiated {
    pub fn config(&self) -> &StreamConfiguration {
        &self.config
    }

    pub fn input_caps(&self) -> &MediaCaps {
        &self.input_caps
    }

    pub fn output_caps(&self) -> &MediaCaps {
        &self.output_caps
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn slot_sizes(&self) -> SlotSizes {
        self.slot_sizes
    }

    pub fn input_fourcc(&self) -> [u8; 4] {
        self.input_fourcc
    }

    pub fn output_fourcc(&self) -> [u8; 4] {
        self.output_fourcc
    }

    pub fn controls(&self) -> &[DeviceControl] {
        &self.controls
    }

    pub fn drain(&self) -> DrainKind {
        self.drain
    }

    /// Same negotiation with a smaller slot count, for allocation retries
    pub fn with_slot_count(&self, slot_count: usize) -> Result<Self, ConstraintViolation> {
        check_slot_count(slot_count)?;
        Ok(Self {
            slot_count,
            ..self.clone()
        })
    }
}

fn check_slot_count(count: usize) -> Result<(), ConstraintViolation> {
    if !(MIN_SLOTS..=MAX_SLOTS).contains(&count) {
        return Err(ConstraintViolation::SlotCount {
            count,
            min: MIN_SLOTS,
            max: MAX_SLOTS,
        });
    }
    Ok(())
}

/// Negotiate from element properties and upstream caps
pub fn negotiate(
    engine: &dyn CodecEngine,
    settings: &ElementSettings,
    caps: &MediaCaps,
) -> Result<Negotiated, ConstraintViolation> {
    let config = engine.configure(settings, caps)?;
    let slot_count = match settings.frame_memory {
        0 => engine.default_slot_count(),
        n => n as usize,
    };
    let negotiated = build(engine, config, *caps, slot_count)?;
    debug!(
        "Negotiated {} -> {} ({} slots, {:?})",
        negotiated.input_caps, negotiated.output_caps, slot_count, negotiated.slot_sizes
    );
    Ok(negotiated)
}

/// Validate an explicitly proposed configuration
pub fn negotiate_config(
    engine: &dyn CodecEngine,
    config: StreamConfiguration,
    input_caps: MediaCaps,
    slot_count: usize,
) -> Result<Negotiated, ConstraintViolation> {
    build(engine, config, input_caps, slot_count)
}

fn build(
    engine: &dyn CodecEngine,
    config: StreamConfiguration,
    input_caps: MediaCaps,
    slot_count: usize,
) -> Result<Negotiated, ConstraintViolation> {
    if config.kind != engine.kind() {
        return Err(ConstraintViolation::UnsupportedCaps {
            codec: engine.kind().to_string(),
            caps: config.kind.to_string(),
        });
    }
    engine.validate(&config)?;
    check_slot_count(slot_count)?;

    Ok(Negotiated {
        output_caps: engine.output_caps(&config),
        slot_sizes: engine.slot_sizes(&config).page_aligned(),
        input_fourcc: engine.input_fourcc(&config),
        output_fourcc: engine.output_fourcc(&config),
        controls: engine.controls(&config),
        drain: engine.drain_kind(),
        config,
        input_caps,
        slot_count,
    })
}

/// Shorthand for the caps-mismatch violation
pub(crate) fn unsupported_caps(kind: CodecKind, caps: &MediaCaps) -> ConstraintViolation {
    ConstraintViolation::UnsupportedCaps {
        codec: kind.to_string(),
        caps: caps.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Fraction, PixelFormat};

    #[test]
    fn test_codec_kind_parse() {
        for kind in CodecKind::all() {
            assert_eq!(kind.element_name().parse::<CodecKind>(), Ok(*kind));
            assert_eq!(kind.engine().kind(), *kind);
        }
        assert!("mp3enc".parse::<CodecKind>().is_err());
    }

    #[test]
    fn test_negotiate_uses_default_slot_count() {
        let engine = CodecKind::H264Decode.engine();
        let caps = MediaCaps::H264 {
            resolution: (320, 240).into(),
            framerate: Fraction::new(30, 1),
        };
        let negotiated = negotiate(engine.as_ref(), &ElementSettings::default(), &caps).unwrap();
        assert_eq!(negotiated.slot_count(), 17);
        assert_eq!(negotiated.drain(), DrainKind::Decoder);
    }

    #[test]
    fn test_negotiate_frame_memory_override() {
        let engine = CodecKind::H264Decode.engine();
        let caps = MediaCaps::H264 {
            resolution: (320, 240).into(),
            framerate: Fraction::new(30, 1),
        };
        let settings = ElementSettings {
            frame_memory: 1,
            ..Default::default()
        };
        assert!(matches!(
            negotiate(engine.as_ref(), &settings, &caps),
            Err(ConstraintViolation::SlotCount { count: 1, .. })
        ));
    }

    #[test]
    fn test_negotiate_config_rejects_other_kind() {
        let jpeg = CodecKind::JpegEncode.engine();
        let caps = MediaCaps::raw_video(PixelFormat::Nv12, 320, 240, Fraction::new(30, 1));
        let config = jpeg
            .configure(&ElementSettings::default(), &caps)
            .unwrap();

        let h264 = CodecKind::H264Encode.engine();
        assert!(negotiate_config(h264.as_ref(), config, caps, 4).is_err());
        assert!(negotiate_config(jpeg.as_ref(), config, caps, 4).is_ok());
    }

    #[test]
    fn test_with_slot_count() {
        let engine = CodecKind::JpegEncode.engine();
        let caps = MediaCaps::raw_video(PixelFormat::Nv12, 320, 240, Fraction::new(30, 1));
        let negotiated = negotiate(engine.as_ref(), &ElementSettings::default(), &caps).unwrap();
        let smaller = negotiated.with_slot_count(2).unwrap();
        assert_eq!(smaller.slot_count(), 2);
        assert_eq!(smaller.config(), negotiated.config());
        assert!(negotiated.with_slot_count(64).is_err());
    }
}
