//! JPEG encoder constraint table and sizing
//!
//! The encoder crops `(x_offset, y_offset)` from the top-left of the input
//! picture, so the coded size is the remaining area and that area must be a
//! whole number of MCUs.

use super::constraints::{self, ConstraintViolation};
use super::controls::CID_JPEG_COMPRESSION_QUALITY;
use super::{
    unsupported_caps, CodecEngine, CodecKind, CodecMode, DeviceControl, DeviceLimits, Geometry,
    MediaCaps, MediaParams, RateTarget, SlotSizes, StreamConfiguration,
};
use crate::config::ElementSettings;
use crate::format::Resolution;

pub const JPEG_LIMITS: DeviceLimits = DeviceLimits {
    min_width: 16,
    min_height: 16,
    max_width: 4096,
    max_height: 4096,
};

pub const QUALITY_MIN: u32 = 1;
pub const QUALITY_MAX: u32 = 100;

/// Headers and tables written ahead of the entropy coded data
const JPEG_HEADER_RESERVE: usize = 4096;

#[derive(Debug, Clone, Copy, Default)]
pub struct JpegEncode;

impl CodecEngine for JpegEncode {
    fn kind(&self) -> CodecKind {
        CodecKind::JpegEncode
    }

    fn configure(
        &self,
        settings: &ElementSettings,
        caps: &MediaCaps,
    ) -> Result<StreamConfiguration, ConstraintViolation> {
        let MediaCaps::RawVideo {
            format,
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
                format,
                geometry: Geometry {
                    width: resolution.width,
                    height: resolution.height,
                    stride,
                    x_offset: settings.x_offset,
                    y_offset: settings.y_offset,
                },
                framerate,
            },
            rate: RateTarget::Quality(settings.quality),
            mode: CodecMode::None,
        })
    }

    fn validate(&self, config: &StreamConfiguration) -> Result<(), ConstraintViolation> {
        let MediaParams::Video {
            format, geometry, ..
        } = config.media
        else {
            return Err(ConstraintViolation::UnsupportedCaps {
                codec: self.kind().to_string(),
                caps: "audio".to_string(),
            });
        };

        JPEG_LIMITS.check(geometry.width, geometry.height)?;
        constraints::check_stride(geometry.stride, geometry.width)?;
        constraints::check_jpeg_geometry(
            format,
            geometry.width,
            geometry.height,
            geometry.x_offset,
            geometry.y_offset,
        )?;
        constraints::check_offsets(geometry.stride, geometry.x_offset, geometry.y_offset)?;

        match config.rate {
            RateTarget::Quality(q) if (QUALITY_MIN..=QUALITY_MAX).contains(&q) => Ok(()),
            RateTarget::Quality(q) => Err(ConstraintViolation::QualityOutOfRange {
                quality: q,
                min: QUALITY_MIN,
                max: QUALITY_MAX,
            }),
            _ => Err(ConstraintViolation::QualityOutOfRange {
                quality: 0,
                min: QUALITY_MIN,
                max: QUALITY_MAX,
            }),
        }
    }

    fn output_caps(&self, config: &StreamConfiguration) -> MediaCaps {
        match config.media {
            MediaParams::Video {
                geometry,
                framerate,
                ..
            } => MediaCaps::Jpeg {
                resolution: Resolution::new(
                    geometry.width.saturating_sub(geometry.x_offset),
                    geometry.height.saturating_sub(geometry.y_offset),
                ),
                framerate,
            },
            MediaParams::Audio(_) => MediaCaps::Jpeg {
                resolution: Resolution::default(),
                framerate: Default::default(),
            },
        }
    }

    fn slot_sizes(&self, config: &StreamConfiguration) -> SlotSizes {
        match config.media {
            MediaParams::Video {
                format, geometry, ..
            } => {
                let coded = format.frame_size(
                    geometry.width.saturating_sub(geometry.x_offset),
                    geometry.height.saturating_sub(geometry.y_offset),
                );
                SlotSizes {
                    input: geometry.buffer_size(format),
                    output: coded + JPEG_HEADER_RESERVE,
                }
            }
            MediaParams::Audio(_) => SlotSizes {
                input: 0,
                output: JPEG_HEADER_RESERVE,
            },
        }
    }

    fn default_slot_count(&self) -> usize {
        4
    }

    fn input_fourcc(&self, config: &StreamConfiguration) -> [u8; 4] {
        match config.media {
            MediaParams::Video { format, .. } => format.to_fourcc(),
            MediaParams::Audio(_) => *b"NV12",
        }
    }

    fn output_fourcc(&self, _config: &StreamConfiguration) -> [u8; 4] {
        *b"JPEG"
    }

    fn controls(&self, config: &StreamConfiguration) -> Vec<DeviceControl> {
        match config.rate {
            RateTarget::Quality(q) => vec![DeviceControl::new(
                CID_JPEG_COMPRESSION_QUALITY,
                q as i32,
                "compression_quality",
            )],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::negotiate;
    use crate::format::{Fraction, PixelFormat};

    fn caps(format: PixelFormat, width: u32, height: u32) -> MediaCaps {
        MediaCaps::raw_video(format, width, height, Fraction::new(30, 1))
    }

    #[test]
    fn test_output_caps_match_input() {
        let settings = ElementSettings {
            quality: 90,
            ..Default::default()
        };
        let n = negotiate(&JpegEncode, &settings, &caps(PixelFormat::Nv12, 320, 240)).unwrap();
        assert_eq!(
            n.output_caps().resolution(),
            Some(Resolution::new(320, 240))
        );
        assert_eq!(n.output_caps().framerate(), Some(Fraction::new(30, 1)));
        assert_eq!(n.controls()[0].value, 90);
    }

    #[test]
    fn test_mcu_alignment_420() {
        let s = ElementSettings::default();
        assert!(negotiate(&JpegEncode, &s, &caps(PixelFormat::Nv12, 324, 240)).is_err());
        assert!(negotiate(&JpegEncode, &s, &caps(PixelFormat::Yuv420, 320, 248)).is_err());
        assert!(negotiate(&JpegEncode, &s, &caps(PixelFormat::Yuyv, 320, 248)).is_ok());
    }

    #[test]
    fn test_crop_changes_coded_size() {
        let s = ElementSettings {
            x_offset: 32,
            y_offset: 16,
            ..Default::default()
        };
        let n = negotiate(&JpegEncode, &s, &caps(PixelFormat::Nv12, 352, 256)).unwrap();
        assert_eq!(
            n.output_caps().resolution(),
            Some(Resolution::new(320, 240))
        );
    }

    #[test]
    fn test_offsets_rejected() {
        for (x, y) in [(10, 10), (15, 35)] {
            let s = ElementSettings {
                x_offset: x,
                y_offset: y,
                ..Default::default()
            };
            assert!(negotiate(&JpegEncode, &s, &caps(PixelFormat::Nv12, 320, 240)).is_err());
        }
    }

    #[test]
    fn test_rgb_rejected() {
        let s = ElementSettings::default();
        assert!(matches!(
            negotiate(&JpegEncode, &s, &caps(PixelFormat::Bgrx, 320, 240)),
            Err(ConstraintViolation::UnsupportedFormat { .. })
        ));
    }
}
