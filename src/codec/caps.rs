//! Media type descriptors exchanged with the surrounding pipeline

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::format::{Fraction, PixelFormat, Resolution};

/// AAC framing on the compressed side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AacStreamFormat {
    /// Bare access units
    #[default]
    Raw,
    /// Each access unit prefixed with an ADTS header
    Adts,
}

impl std::str::FromStr for AacStreamFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "raw" => Ok(AacStreamFormat::Raw),
            "adts" => Ok(AacStreamFormat::Adts),
            _ => Err(format!("Unknown AAC stream format: {}", s)),
        }
    }
}

/// Caps of one side of a codec instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MediaCaps {
    RawVideo {
        format: PixelFormat,
        resolution: Resolution,
        framerate: Fraction,
    },
    H264 {
        resolution: Resolution,
        framerate: Fraction,
    },
    Jpeg {
        resolution: Resolution,
        framerate: Fraction,
    },
    /// Interleaved signed 16-bit little-endian PCM
    RawAudio { rate: u32, channels: u32 },
    Aac {
        rate: u32,
        channels: u32,
        stream_format: AacStreamFormat,
    },
}

impl MediaCaps {
    pub fn raw_video(format: PixelFormat, width: u32, height: u32, framerate: Fraction) -> Self {
        MediaCaps::RawVideo {
            format,
            resolution: Resolution::new(width, height),
            framerate,
        }
    }

    pub fn raw_audio(rate: u32, channels: u32) -> Self {
        MediaCaps::RawAudio { rate, channels }
    }

    pub fn media_type(&self) -> &'static str {
        match self {
            MediaCaps::RawVideo { .. } => "video/x-raw",
            MediaCaps::H264 { .. } => "video/x-h264",
            MediaCaps::Jpeg { .. } => "image/jpeg",
            MediaCaps::RawAudio { .. } => "audio/x-raw",
            MediaCaps::Aac { .. } => "audio/mpeg",
        }
    }

    pub fn resolution(&self) -> Option<Resolution> {
        match self {
            MediaCaps::RawVideo { resolution, .. }
            | MediaCaps::H264 { resolution, .. }
            | MediaCaps::Jpeg { resolution, .. } => Some(*resolution),
            _ => None,
        }
    }

    pub fn framerate(&self) -> Option<Fraction> {
        match self {
            MediaCaps::RawVideo { framerate, .. }
            | MediaCaps::H264 { framerate, .. }
            | MediaCaps::Jpeg { framerate, .. } => Some(*framerate),
            _ => None,
        }
    }

    pub fn is_video(&self) -> bool {
        self.resolution().is_some()
    }
}

impl fmt::Display for MediaCaps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.media_type())?;
        match self {
            MediaCaps::RawVideo {
                format,
                resolution,
                framerate,
            } => write!(
                f,
                ", format={}, width={}, height={}, framerate={}",
                format, resolution.width, resolution.height, framerate
            ),
            MediaCaps::H264 {
                resolution,
                framerate,
            } => write!(
                f,
                ", stream-format=byte-stream, alignment=au, width={}, height={}, framerate={}",
                resolution.width, resolution.height, framerate
            ),
            MediaCaps::Jpeg {
                resolution,
                framerate,
            } => write!(
                f,
                ", width={}, height={}, framerate={}",
                resolution.width, resolution.height, framerate
            ),
            MediaCaps::RawAudio { rate, channels } => {
                write!(f, ", format=S16LE, rate={}, channels={}", rate, channels)
            }
            MediaCaps::Aac {
                rate,
                channels,
                stream_format,
            } => write!(
                f,
                ", mpegversion=4, stream-format={}, rate={}, channels={}",
                match stream_format {
                    AacStreamFormat::Raw => "raw",
                    AacStreamFormat::Adts => "adts",
                },
                rate,
                channels
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caps_display() {
        let caps = MediaCaps::raw_video(PixelFormat::Nv12, 320, 240, Fraction::new(30, 1));
        assert_eq!(
            caps.to_string(),
            "video/x-raw, format=NV12, width=320, height=240, framerate=30/1"
        );
        assert_eq!(
            MediaCaps::raw_audio(44100, 2).to_string(),
            "audio/x-raw, format=S16LE, rate=44100, channels=2"
        );
    }

    #[test]
    fn test_caps_serde() {
        let caps = MediaCaps::Aac {
            rate: 48000,
            channels: 1,
            stream_format: AacStreamFormat::Adts,
        };
        let json = serde_json::to_string(&caps).unwrap();
        assert!(json.contains("\"type\":\"aac\""));
        let back: MediaCaps = serde_json::from_str(&json).unwrap();
        assert_eq!(back, caps);
    }
}
