//! H.264 encoder constraint table and sizing

use super::constraints::{self, ConstraintViolation};
use super::controls::*;
use super::{
    unsupported_caps, CodecEngine, CodecKind, CodecMode, DeviceLimits, Geometry, MediaCaps,
    MediaParams, RateTarget, SlotSizes, StreamConfiguration,
};
use crate::config::ElementSettings;
use crate::format::{PixelFormat, Resolution};

/// Largest coded picture the encoder handles
pub const H264_ENCODE_LIMITS: DeviceLimits = DeviceLimits {
    min_width: 32,
    min_height: 32,
    max_width: 1920,
    max_height: 1088,
};

/// Smallest bitstream slot, enough for an IDR picture at low resolutions
const MIN_BITSTREAM_SLOT: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct H264Encode;

impl H264Encode {
    fn accepts(format: PixelFormat) -> bool {
        matches!(format, PixelFormat::Nv12 | PixelFormat::Yuv420)
    }
}

impl CodecEngine for H264Encode {
    fn kind(&self) -> CodecKind {
        CodecKind::H264Encode
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
            0 => resolution.width + settings.x_offset,
            s => s,
        };
        let bitrate = match settings.bitrate {
            0 => self.property_ranges().default_bitrate,
            b => b,
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
            rate: RateTarget::Bitrate(bitrate),
            mode: CodecMode::H264 {
                rate_control: settings.rate_control,
                max_gop_length: settings.max_gop_length,
                b_pic_mode: settings.b_pic_mode,
            },
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
        if !Self::accepts(format) {
            return Err(ConstraintViolation::UnsupportedFormat {
                codec: self.kind().to_string(),
                format,
            });
        }

        H264_ENCODE_LIMITS.check(geometry.width, geometry.height)?;
        constraints::check_h264_geometry(geometry.width, geometry.height)?;
        // Rows start at x_offset, so each one spans x_offset + width pixels
        constraints::check_stride(
            geometry.stride,
            geometry.x_offset.saturating_add(geometry.width),
        )?;
        constraints::check_offsets(geometry.stride, geometry.x_offset, geometry.y_offset)?;

        if let CodecMode::H264 {
            max_gop_length,
            b_pic_mode,
            ..
        } = config.mode
        {
            constraints::check_gop(max_gop_length, b_pic_mode)?;
        }

        match config.rate {
            RateTarget::Bitrate(0) | RateTarget::Unspecified => {
                Err(ConstraintViolation::MissingBitrate)
            }
            RateTarget::Bitrate(bitrate) => {
                let range = self.property_ranges().bitrate;
                if !range.contains(&bitrate) {
                    return Err(ConstraintViolation::BitrateOutOfRange {
                        bitrate,
                        rate: 0,
                        min: *range.start(),
                        max: *range.end(),
                    });
                }
                Ok(())
            }
            RateTarget::Quality(q) => Err(ConstraintViolation::QualityOutOfRange {
                quality: q,
                min: 0,
                max: 0,
            }),
        }
    }

    fn output_caps(&self, config: &StreamConfiguration) -> MediaCaps {
        let (resolution, framerate) = match config.media {
            MediaParams::Video {
                geometry,
                framerate,
                ..
            } => (Resolution::new(geometry.width, geometry.height), framerate),
            MediaParams::Audio(_) => (Resolution::default(), Default::default()),
        };
        MediaCaps::H264 {
            resolution,
            framerate,
        }
    }

    fn slot_sizes(&self, config: &StreamConfiguration) -> SlotSizes {
        match config.media {
            MediaParams::Video {
                format, geometry, ..
            } => SlotSizes {
                input: geometry.buffer_size(format),
                output: (geometry.width as usize * geometry.height as usize * 3 / 4)
                    .max(MIN_BITSTREAM_SLOT),
            },
            MediaParams::Audio(_) => SlotSizes {
                input: 0,
                output: MIN_BITSTREAM_SLOT,
            },
        }
    }

    fn default_slot_count(&self) -> usize {
        6
    }

    fn input_fourcc(&self, config: &StreamConfiguration) -> [u8; 4] {
        match config.media {
            MediaParams::Video { format, .. } => format.to_fourcc(),
            MediaParams::Audio(_) => PixelFormat::Nv12.to_fourcc(),
        }
    }

    fn output_fourcc(&self, _config: &StreamConfiguration) -> [u8; 4] {
        *b"H264"
    }

    fn controls(&self, config: &StreamConfiguration) -> Vec<DeviceControl> {
        let mut controls = Vec::new();
        if let CodecMode::H264 {
            rate_control,
            max_gop_length,
            b_pic_mode,
        } = config.mode
        {
            let frame_rc = !matches!(rate_control, super::RateControl::FixedQp);
            controls.push(DeviceControl::new(
                CID_VIDEO_FRAME_RC_ENABLE,
                frame_rc as i32,
                "frame_rc_enable",
            ));
            if frame_rc {
                controls.push(DeviceControl::new(
                    CID_VIDEO_BITRATE_MODE,
                    rate_control.v4l2_value(),
                    "bitrate_mode",
                ));
            }
            controls.push(DeviceControl::new(
                CID_VIDEO_GOP_SIZE,
                max_gop_length as i32,
                "gop_size",
            ));
            controls.push(DeviceControl::new(
                CID_VIDEO_B_FRAMES,
                b_pic_mode as i32,
                "b_frames",
            ));
        }
        if let Some(bitrate) = config.bitrate() {
            controls.push(DeviceControl::new(
                CID_VIDEO_BITRATE,
                bitrate.min(i32::MAX as u32) as i32,
                "bitrate",
            ));
        }
        controls
    }
}
