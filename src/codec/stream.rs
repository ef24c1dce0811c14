//! Negotiated stream description

use serde::{Deserialize, Serialize};
use std::fmt;

use super::caps::AacStreamFormat;
use super::CodecKind;
use crate::format::{Fraction, PixelFormat};

/// AAC channel mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelMode {
    Mono,
    Stereo,
    /// Two independent mono channels
    DualMono,
}

impl ChannelMode {
    pub fn channels(&self) -> u32 {
        match self {
            ChannelMode::Mono => 1,
            ChannelMode::Stereo | ChannelMode::DualMono => 2,
        }
    }

    /// Value of the V4L2 audio mode control
    pub fn v4l2_value(&self) -> i32 {
        match self {
            ChannelMode::Stereo => 0,
            ChannelMode::DualMono => 2,
            ChannelMode::Mono => 3,
        }
    }
}

impl std::str::FromStr for ChannelMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mono" | "1" => Ok(ChannelMode::Mono),
            "stereo" | "2" => Ok(ChannelMode::Stereo),
            "dual-mono" | "dual" | "dual-monaural" => Ok(ChannelMode::DualMono),
            _ => Err(format!("Unknown channel mode: {}", s)),
        }
    }
}

/// H.264 rate control mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateControl {
    #[default]
    Cbr,
    Vbr,
    /// Rate control disabled, fixed quantizer
    FixedQp,
}

impl RateControl {
    pub fn v4l2_value(&self) -> i32 {
        match self {
            RateControl::Vbr => 0,
            RateControl::Cbr => 1,
            RateControl::FixedQp => 2,
        }
    }
}

impl std::str::FromStr for RateControl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cbr" | "0" => Ok(RateControl::Cbr),
            "vbr" | "1" => Ok(RateControl::Vbr),
            "fixed-qp" | "cqp" | "2" => Ok(RateControl::FixedQp),
            _ => Err(format!("Unknown rate control mode: {}", s)),
        }
    }
}

/// Placement of the picture inside a strided buffer, in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub x_offset: u32,
    pub y_offset: u32,
}

impl Geometry {
    pub fn packed(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            stride: width,
            x_offset: 0,
            y_offset: 0,
        }
    }

    /// Bytes a buffer must hold so the offset picture fits inside it
    pub fn buffer_size(&self, format: PixelFormat) -> usize {
        let rows = self.y_offset + self.height;
        let bpp = format.luma_bytes_per_pixel();
        format.frame_size(self.stride, rows) + (self.x_offset as usize) * bpp
    }
}

/// Audio stream parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioParams {
    pub sample_rate: u32,
    /// MPEG-4 sampling frequency index
    pub sample_rate_index: u8,
    pub channel_mode: ChannelMode,
}

/// Media side of a configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaParams {
    Video {
        /// Raw side pixel format (input for encoders, output for decoders)
        format: PixelFormat,
        geometry: Geometry,
        framerate: Fraction,
    },
    Audio(AudioParams),
}

/// Bitrate (bits per second) or quality target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateTarget {
    Bitrate(u32),
    Quality(u32),
    /// Decoders take no rate target
    Unspecified,
}

/// Codec-specific mode flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecMode {
    H264 {
        rate_control: RateControl,
        max_gop_length: u32,
        b_pic_mode: u32,
    },
    Aac {
        enable_cbr: bool,
        output: AacStreamFormat,
    },
    None,
}

/// A complete operating configuration for one codec instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamConfiguration {
    pub kind: CodecKind,
    pub media: MediaParams,
    pub rate: RateTarget,
    pub mode: CodecMode,
}

impl StreamConfiguration {
    pub fn geometry(&self) -> Option<Geometry> {
        match self.media {
            MediaParams::Video { geometry, .. } => Some(geometry),
            MediaParams::Audio(_) => None,
        }
    }

    pub fn audio(&self) -> Option<AudioParams> {
        match self.media {
            MediaParams::Audio(params) => Some(params),
            MediaParams::Video { .. } => None,
        }
    }

    pub fn bitrate(&self) -> Option<u32> {
        match self.rate {
            RateTarget::Bitrate(bps) => Some(bps),
            _ => None,
        }
    }
}

impl fmt::Display for StreamConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        match self.media {
            MediaParams::Video {
                format,
                geometry,
                framerate,
            } => write!(
                f,
                " {} {}x{} stride={} offset=({},{}) @{}",
                format,
                geometry.width,
                geometry.height,
                geometry.stride,
                geometry.x_offset,
                geometry.y_offset,
                framerate
            )?,
            MediaParams::Audio(audio) => {
                write!(f, " {}Hz {:?}", audio.sample_rate, audio.channel_mode)?
            }
        }
        match self.rate {
            RateTarget::Bitrate(bps) => write!(f, " bitrate={}", bps),
            RateTarget::Quality(q) => write!(f, " quality={}", q),
            RateTarget::Unspecified => Ok(()),
        }
    }
}

/// Byte sizes of the two slot kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSizes {
    /// Slots carrying data into the device
    pub input: usize,
    /// Slots the device writes results into
    pub output: usize,
}

impl SlotSizes {
    /// Round both sizes up to a page, as the device maps whole pages
    pub fn page_aligned(self) -> Self {
        const PAGE: usize = 4096;
        let align = |n: usize| n.max(1).div_ceil(PAGE) * PAGE;
        Self {
            input: align(self.input),
            output: align(self.output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_buffer_size() {
        let geometry = Geometry::packed(320, 240);
        assert_eq!(geometry.buffer_size(PixelFormat::Nv12), 320 * 240 * 3 / 2);

        let offset = Geometry {
            width: 160,
            height: 120,
            stride: 320,
            x_offset: 160,
            y_offset: 120,
        };
        assert!(offset.buffer_size(PixelFormat::Nv12) >= 320 * 240 * 3 / 2);
    }

    #[test]
    fn test_page_aligned() {
        let sizes = SlotSizes {
            input: 4097,
            output: 0,
        }
        .page_aligned();
        assert_eq!(sizes.input, 8192);
        assert_eq!(sizes.output, 4096);
    }

    #[test]
    fn test_channel_mode_parse() {
        assert_eq!("dual-mono".parse::<ChannelMode>(), Ok(ChannelMode::DualMono));
        assert_eq!("Stereo".parse::<ChannelMode>(), Ok(ChannelMode::Stereo));
        assert!("quad".parse::<ChannelMode>().is_err());
        assert_eq!(ChannelMode::DualMono.channels(), 2);
    }
}
