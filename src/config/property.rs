//! Named property writes, as issued by a pipeline description or the CLI

use std::path::PathBuf;
use tracing::debug;

use super::schema::{ElementSettings, PropertyRanges};
use crate::codec::{AacStreamFormat, ChannelMode, RateControl};
use crate::error::{CodecError, Result};

/// A single property assignment
#[derive(Debug, Clone, PartialEq)]
pub enum Property {
    Device(PathBuf),
    Bitrate(u32),
    Quality(u32),
    ChannelMode(ChannelMode),
    AacOutput(AacStreamFormat),
    EnableCbr(bool),
    RateControl(RateControl),
    MaxGopLength(u32),
    BPicMode(u32),
    Stride(u32),
    XOffset(u32),
    YOffset(u32),
    FrameMemory(u32),
    Vsync(bool),
    DmaMode(bool),
    PollTimeoutMs(u64),
    DrainAttempts(u32),
}

impl Property {
    pub fn name(&self) -> &'static str {
        match self {
            Property::Device(_) => "device",
            Property::Bitrate(_) => "bitrate",
            Property::Quality(_) => "quality",
            Property::ChannelMode(_) => "channel-mode",
            Property::AacOutput(_) => "output-format",
            Property::EnableCbr(_) => "enable-cbr",
            Property::RateControl(_) => "rate-control-mode",
            Property::MaxGopLength(_) => "max-gop-length",
            Property::BPicMode(_) => "b-pic-mode",
            Property::Stride(_) => "stride",
            Property::XOffset(_) => "x-offset",
            Property::YOffset(_) => "y-offset",
            Property::FrameMemory(_) => "frame-memory",
            Property::Vsync(_) => "vsync",
            Property::DmaMode(_) => "dma-mode",
            Property::PollTimeoutMs(_) => "poll-timeout",
            Property::DrainAttempts(_) => "drain-attempts",
        }
    }

    /// Properties that can only change while the device is closed
    pub fn requires_closed_device(&self) -> bool {
        matches!(self, Property::Device(_))
    }

    /// Parse a `name=value` assignment
    pub fn parse(assignment: &str) -> Result<Self> {
        let (name, value) = assignment
            .split_once('=')
            .map(|(n, v)| (n.trim(), v.trim()))
            .ok_or_else(|| {
                CodecError::Config(format!("Expected name=value, got '{}'", assignment))
            })?;

        let invalid = |e: String| CodecError::Config(format!("Invalid value for {}: {}", name, e));

        let key = name.replace('_', "-").to_lowercase();
        let property = match key.as_str() {
            "device" => Property::Device(PathBuf::from(value)),
            "bitrate" => Property::Bitrate(parse_num(value).map_err(invalid)?),
            "quality" => Property::Quality(parse_num(value).map_err(invalid)?),
            "channel-mode" | "dual-monaural" => {
                if key == "dual-monaural" {
                    let dual = parse_bool(value).map_err(invalid)?;
                    Property::ChannelMode(if dual {
                        ChannelMode::DualMono
                    } else {
                        ChannelMode::Stereo
                    })
                } else {
                    Property::ChannelMode(value.parse().map_err(invalid)?)
                }
            }
            "output-format" => Property::AacOutput(value.parse().map_err(invalid)?),
            "enable-cbr" => Property::EnableCbr(parse_bool(value).map_err(invalid)?),
            "rate-control-mode" => Property::RateControl(value.parse().map_err(invalid)?),
            "max-gop-length" => Property::MaxGopLength(parse_num(value).map_err(invalid)?),
            "b-pic-mode" => Property::BPicMode(parse_num(value).map_err(invalid)?),
            "stride" => Property::Stride(parse_num(value).map_err(invalid)?),
            "x-offset" => Property::XOffset(parse_num(value).map_err(invalid)?),
            "y-offset" => Property::YOffset(parse_num(value).map_err(invalid)?),
            "frame-memory" => Property::FrameMemory(parse_num(value).map_err(invalid)?),
            "vsync" => Property::Vsync(parse_bool(value).map_err(invalid)?),
            "dma-mode" => Property::DmaMode(parse_bool(value).map_err(invalid)?),
            "poll-timeout" => Property::PollTimeoutMs(parse_num(value).map_err(invalid)?),
            "drain-attempts" => Property::DrainAttempts(parse_num(value).map_err(invalid)?),
            _ => return Err(CodecError::Config(format!("Unknown property: {}", name))),
        };
        Ok(property)
    }
}

fn parse_num<T: std::str::FromStr>(value: &str) -> std::result::Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("'{}' is not a number", value))
}

fn parse_bool(value: &str) -> std::result::Result<bool, String> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(format!("'{}' is not a boolean", value)),
    }
}

fn clamp_logged(name: &str, value: u32, range: &std::ops::RangeInclusive<u32>) -> u32 {
    let clamped = value.clamp(*range.start(), *range.end());
    if clamped != value {
        debug!("Property {} clamped from {} to {}", name, value, clamped);
    }
    clamped
}

impl ElementSettings {
    /// Apply a property, clamping numeric values to their declared range
    pub fn apply(&mut self, property: Property, ranges: &PropertyRanges) {
        let name = property.name();
        match property {
            Property::Device(path) => self.device = Some(path),
            // 0 keeps meaning "codec default" and is not clamped
            Property::Bitrate(0) => self.bitrate = 0,
            Property::Bitrate(v) => self.bitrate = clamp_logged(name, v, &ranges.bitrate),
            Property::Quality(v) => self.quality = clamp_logged(name, v, &ranges.quality),
            Property::ChannelMode(mode) => self.channel_mode = Some(mode),
            Property::AacOutput(format) => self.aac_output = format,
            Property::EnableCbr(v) => self.enable_cbr = v,
            Property::RateControl(mode) => self.rate_control = mode,
            Property::MaxGopLength(v) => {
                self.max_gop_length = clamp_logged(name, v, &ranges.max_gop_length)
            }
            Property::BPicMode(v) => self.b_pic_mode = clamp_logged(name, v, &ranges.b_pic_mode),
            Property::Stride(v) => self.stride = v,
            Property::XOffset(v) => self.x_offset = v,
            Property::YOffset(v) => self.y_offset = v,
            Property::FrameMemory(0) => self.frame_memory = 0,
            Property::FrameMemory(v) => {
                self.frame_memory = clamp_logged(name, v, &ranges.frame_memory)
            }
            Property::Vsync(v) => self.vsync = v,
            Property::DmaMode(v) => self.dma_mode = v,
            Property::PollTimeoutMs(v) => self.poll_timeout_ms = v.max(1),
            Property::DrainAttempts(v) => self.drain_attempts = v.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecKind;

    #[test]
    fn test_parse() {
        assert_eq!(
            Property::parse("bitrate=64000").unwrap(),
            Property::Bitrate(64000)
        );
        assert_eq!(
            Property::parse("max_GOP_length = 15").unwrap(),
            Property::MaxGopLength(15)
        );
        assert_eq!(
            Property::parse("dual-monaural=true").unwrap(),
            Property::ChannelMode(ChannelMode::DualMono)
        );
        assert_eq!(
            Property::parse("rate-control-mode=vbr").unwrap(),
            Property::RateControl(RateControl::Vbr)
        );
        assert_eq!(
            Property::parse("device=/dev/video3").unwrap(),
            Property::Device(PathBuf::from("/dev/video3"))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(Property::parse("bitrate").is_err());
        assert!(Property::parse("bitrate=fast").is_err());
        assert!(Property::parse("vsync=maybe").is_err());
        assert!(Property::parse("colour=red").is_err());
    }

    #[test]
    fn test_apply_clamps_to_declared_range() {
        let ranges = PropertyRanges::for_codec(CodecKind::AacEncode);
        let mut settings = ElementSettings::default();

        settings.apply(Property::Bitrate(15999), &ranges);
        assert_eq!(settings.bitrate, 16000);
        settings.apply(Property::Bitrate(288001), &ranges);
        assert_eq!(settings.bitrate, 288000);
        settings.apply(Property::Bitrate(0), &ranges);
        assert_eq!(settings.bitrate, 0);

        settings.apply(Property::BPicMode(9), &ranges);
        assert_eq!(settings.b_pic_mode, 3);
        settings.apply(Property::Quality(0), &ranges);
        assert_eq!(settings.quality, 1);
        settings.apply(Property::FrameMemory(100), &ranges);
        assert_eq!(settings.frame_memory, 32);
        settings.apply(Property::FrameMemory(1), &ranges);
        assert_eq!(settings.frame_memory, 2);
        settings.apply(Property::FrameMemory(0), &ranges);
        assert_eq!(settings.frame_memory, 0);
    }

    #[test]
    fn test_requires_closed_device() {
        assert!(Property::Device(PathBuf::from("/dev/video0")).requires_closed_device());
        assert!(!Property::Bitrate(1).requires_closed_device());
    }
}
