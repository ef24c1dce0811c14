//! H.264 decoder constraint table and sizing

use super::constraints::{self, ConstraintViolation};
use super::{
    unsupported_caps, CodecEngine, CodecKind, CodecMode, DeviceControl, DeviceLimits, DrainKind,
    Geometry, MediaCaps, MediaParams, RateTarget, SlotSizes, StreamConfiguration,
};
use crate::config::ElementSettings;
use crate::format::{PixelFormat, Resolution};

pub const H264_DECODE_LIMITS: DeviceLimits = DeviceLimits {
    min_width: 32,
    min_height: 32,
    max_width: 1920,
    max_height: 1088,
};

/// Decoded pictures are always produced as NV12
const DECODED_FORMAT: PixelFormat = PixelFormat::Nv12;

/// Reference frames plus in-flight pictures of a level 4.1 stream
const DECODE_SLOTS: usize = 17;

const MIN_BITSTREAM_SLOT: usize = 512 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct H264Decode;

impl CodecEngine for H264Decode {
    fn kind(&self) -> CodecKind {
        CodecKind::H264Decode
    }

    fn configure(
        &self,
        settings: &ElementSettings,
        caps: &MediaCaps,
    ) -> Result<StreamConfiguration, ConstraintViolation> {
        let MediaCaps::H264 {
            resolution,
            framerate,
        } = *caps
        else {
            return Err(unsupported_caps(self.kind(), caps));
        };

        let stride = match settings.stride {
            0 => resolution.width,
            s => s,
        };

        Ok(StreamConfiguration {
            kind: self.kind(),
            media: MediaParams::Video {
                format: DECODED_FORMAT,
                geometry: Geometry {
                    stride,
                    ..Geometry::packed(resolution.width, resolution.height)
                },
                framerate,
            },
            rate: RateTarget::Unspecified,
            mode: CodecMode::None,
        })
    }

    fn validate(&self, config: &StreamConfiguration) -> Result<(), ConstraintViolation> {
        let geometry = config
            .geometry()
            .ok_or_else(|| ConstraintViolation::UnsupportedCaps {
                codec: self.kind().to_string(),
                caps: "audio".to_string(),
            })?;

        H264_DECODE_LIMITS.check(geometry.width, geometry.height)?;
        constraints::check_h264_geometry(geometry.width, geometry.height)?;
        constraints::check_stride(geometry.stride, geometry.width)?;
        constraints::check_offsets(geometry.stride, geometry.x_offset, geometry.y_offset)
    }

    fn output_caps(&self, config: &StreamConfiguration) -> MediaCaps {
        match config.media {
            MediaParams::Video {
                format,
                geometry,
                framerate,
            } => MediaCaps::RawVideo {
                format,
                resolution: Resolution::new(geometry.width, geometry.height),
                framerate,
            },
            MediaParams::Audio(_) => MediaCaps::RawVideo {
                format: DECODED_FORMAT,
                resolution: Resolution::default(),
                framerate: Default::default(),
            },
        }
    }

    fn slot_sizes(&self, config: &StreamConfiguration) -> SlotSizes {
        let geometry = config.geometry().unwrap_or(Geometry::packed(0, 0));
        let picture = geometry.buffer_size(DECODED_FORMAT);
        SlotSizes {
            input: (picture / 2).max(MIN_BITSTREAM_SLOT),
            output: picture,
        }
    }

    fn default_slot_count(&self) -> usize {
        DECODE_SLOTS
    }

    fn input_fourcc(&self, _config: &StreamConfiguration) -> [u8; 4] {
        *b"H264"
    }

    fn output_fourcc(&self, _config: &StreamConfiguration) -> [u8; 4] {
        DECODED_FORMAT.to_fourcc()
    }

    fn controls(&self, _config: &StreamConfiguration) -> Vec<DeviceControl> {
        Vec::new()
    }

    fn drain_kind(&self) -> DrainKind {
        DrainKind::Decoder
    }
}

/// Split an Annex B byte stream into NAL units, each kept with its start code
///
/// Bytes ahead of the first start code are dropped.
pub fn split_nal_units(stream: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= stream.len() {
        if stream[i] == 0 && stream[i + 1] == 0 && stream[i + 2] == 1 {
            // A four byte start code carries one more leading zero
            let start = if i > 0 && stream[i - 1] == 0 { i - 1 } else { i };
            starts.push(start);
            i += 3;
        } else {
            i += 1;
        }
    }

    starts
        .iter()
        .enumerate()
        .map(|(n, &start)| {
            let end = starts.get(n + 1).copied().unwrap_or(stream.len());
            &stream[start..end]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::negotiate;
    use crate::format::Fraction;

    fn caps(width: u32, height: u32) -> MediaCaps {
        MediaCaps::H264 {
            resolution: Resolution::new(width, height),
            framerate: Fraction::new(25, 1),
        }
    }

    #[test]
    fn test_decoder_output_caps() {
        let n = negotiate(&H264Decode, &ElementSettings::default(), &caps(1920, 1088)).unwrap();
        assert_eq!(
            *n.output_caps(),
            MediaCaps::raw_video(PixelFormat::Nv12, 1920, 1088, Fraction::new(25, 1))
        );
        assert_eq!(n.slot_count(), 17);
        assert_eq!(n.input_fourcc(), *b"H264");
        assert!(n.slot_sizes().output >= 1920 * 1088 * 3 / 2);
        assert!(n.controls().is_empty());
    }

    #[test]
    fn test_decoder_rejects_raw_input() {
        let raw = MediaCaps::raw_video(PixelFormat::Nv12, 320, 240, Fraction::new(30, 1));
        assert!(negotiate(&H264Decode, &ElementSettings::default(), &raw).is_err());
    }

    #[test]
    fn test_decoder_geometry() {
        let s = ElementSettings::default();
        assert!(negotiate(&H264Decode, &s, &caps(321, 240)).is_err());
        assert!(negotiate(&H264Decode, &s, &caps(4096, 2160)).is_err());
        let narrow = ElementSettings {
            stride: 100,
            ..Default::default()
        };
        assert!(matches!(
            negotiate(&H264Decode, &narrow, &caps(320, 240)),
            Err(ConstraintViolation::StrideTooSmall { .. })
        ));
    }

    #[test]
    fn test_split_nal_units() {
        let stream = [
            0xff, 0, 0, 0, 1, 0x67, 1, 2, 0, 0, 1, 0x68, 3, 0, 0, 0, 1, 0x65, 4, 5,
        ];
        let units = split_nal_units(&stream);
        assert_eq!(units.len(), 3);
        assert_eq!(units[0], &[0, 0, 0, 1, 0x67, 1, 2]);
        assert_eq!(units[1], &[0, 0, 1, 0x68, 3]);
        assert_eq!(units[2], &[0, 0, 0, 1, 0x65, 4, 5]);

        assert!(split_nal_units(&[1, 2, 3]).is_empty());
        assert!(split_nal_units(&[]).is_empty());
    }
}
