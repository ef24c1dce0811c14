//! Hardware constraint tables enforced at negotiation time
//!
//! Every check here is a pure function of the proposed values. Failures are
//! reported as [`ConstraintViolation`] so callers can tell a rejected
//! configuration apart from a device error.

use std::ops::RangeInclusive;
use thiserror::Error;

use super::stream::ChannelMode;
use crate::format::PixelFormat;

/// Alignment (in bytes) required for every plane start handed to the encoder
pub const PLANE_ALIGNMENT: u64 = 32;

/// Per-channel AAC bitrate limits, indexed by sample rate
///
/// Each entry is `(sample_rate, min_bps, max_bps)`; both bounds are inclusive.
/// The upper bound is the AAC ceiling of 6144 bits per channel per 1024-sample frame.
pub const AAC_BITRATE_TABLE: [(u32, u32, u32); 9] = [
    (8000, 16000, 48000),
    (11025, 22000, 66150),
    (12000, 24000, 72000),
    (16000, 23250, 96000),
    (22050, 32000, 132300),
    (24000, 35000, 144000),
    (32000, 46500, 192000),
    (44100, 64000, 264600),
    (48000, 70000, 288000),
];

/// Bitrate bounds of the encoder as a whole, regardless of sample rate
pub const AAC_BITRATE_MIN: u32 = 16000;
pub const AAC_BITRATE_MAX: u32 = 288000;

/// A rejected configuration, naming the rule that was violated
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConstraintViolation {
    #[error("caps {caps} are not accepted by {codec}")]
    UnsupportedCaps { codec: String, caps: String },

    #[error("pixel format {format} is not supported by {codec}")]
    UnsupportedFormat { codec: String, format: PixelFormat },

    #[error("sample rate {rate} Hz is not supported")]
    UnsupportedSampleRate { rate: u32 },

    #[error("{channels} channels are not supported")]
    UnsupportedChannels { channels: u32 },

    #[error("channel mode {mode:?} cannot carry {channels} channels")]
    ChannelModeMismatch { mode: ChannelMode, channels: u32 },

    #[error("bitrate {bitrate} outside [{min}, {max}] at {rate} Hz")]
    BitrateOutOfRange {
        bitrate: u32,
        rate: u32,
        min: u32,
        max: u32,
    },

    #[error("bitrate must be non-zero")]
    MissingBitrate,

    #[error("quality {quality} outside [{min}, {max}]")]
    QualityOutOfRange { quality: u32, min: u32, max: u32 },

    #[error("max GOP length {gop} requires B-picture mode below it (got {b_pic})")]
    GopBPictureConflict { gop: u32, b_pic: u32 },

    #[error("dimensions {width}x{height} must both be even")]
    OddDimensions { width: u32, height: u32 },

    #[error("picture area {width}x{height} is not a multiple of 32")]
    AreaNotAligned { width: u32, height: u32 },

    #[error("resolution {width}x{height} outside device limits {min_width}x{min_height}..{max_width}x{max_height}")]
    ResolutionOutOfRange {
        width: u32,
        height: u32,
        min_width: u32,
        min_height: u32,
        max_width: u32,
        max_height: u32,
    },

    #[error("stride {stride} is smaller than the {width}-pixel row")]
    StrideTooSmall { stride: u32, width: u32 },

    #[error("{plane} offset {offset} for ({x_offset},{y_offset}) is not 32-byte aligned")]
    OffsetNotAligned {
        plane: &'static str,
        offset: u64,
        x_offset: u32,
        y_offset: u32,
    },

    #[error("offset ({x_offset},{y_offset}) leaves no picture inside {width}x{height}")]
    OffsetOutOfRange {
        x_offset: u32,
        y_offset: u32,
        width: u32,
        height: u32,
    },

    #[error("JPEG {layout} picture {width}x{height} must be a multiple of {mcu_width}x{mcu_height}")]
    JpegGeometry {
        layout: &'static str,
        width: u32,
        height: u32,
        mcu_width: u32,
        mcu_height: u32,
    },

    #[error("slot count {count} outside [{min}, {max}]")]
    SlotCount { count: usize, min: usize, max: usize },
}

/// MPEG-4 sampling frequency index for a sample rate
pub fn aac_sample_rate_index(rate: u32) -> Option<u8> {
    let index = match rate {
        96000 => 0,
        88200 => 1,
        64000 => 2,
        48000 => 3,
        44100 => 4,
        32000 => 5,
        24000 => 6,
        22050 => 7,
        16000 => 8,
        12000 => 9,
        11025 => 10,
        8000 => 11,
        _ => return None,
    };
    Some(index)
}

/// Accepted bitrate interval for one AAC channel at `rate`
pub fn aac_bitrate_range(rate: u32) -> Option<RangeInclusive<u32>> {
    AAC_BITRATE_TABLE
        .iter()
        .find(|(r, _, _)| *r == rate)
        .map(|(_, min, max)| *min..=*max)
}

/// Accepted bitrate interval for a full stream
///
/// Two-channel modes scale the per-channel table, bounded by the encoder limits.
pub fn aac_stream_bitrate_range(rate: u32, mode: ChannelMode) -> Option<RangeInclusive<u32>> {
    let range = aac_bitrate_range(rate)?;
    let channels = mode.channels();
    let min = (range.start() * channels).clamp(AAC_BITRATE_MIN, AAC_BITRATE_MAX);
    let max = (range.end() * channels).clamp(AAC_BITRATE_MIN, AAC_BITRATE_MAX);
    Some(min..=max)
}

pub fn check_aac_bitrate(
    rate: u32,
    mode: ChannelMode,
    bitrate: u32,
) -> Result<(), ConstraintViolation> {
    let range = aac_stream_bitrate_range(rate, mode)
        .ok_or(ConstraintViolation::UnsupportedSampleRate { rate })?;
    if !range.contains(&bitrate) {
        return Err(ConstraintViolation::BitrateOutOfRange {
            bitrate,
            rate,
            min: *range.start(),
            max: *range.end(),
        });
    }
    Ok(())
}

/// `max_gop_length == 0` means intra-only, so no B-pictures are allowed
pub fn check_gop(max_gop_length: u32, b_pic_mode: u32) -> Result<(), ConstraintViolation> {
    let ok = if max_gop_length == 0 {
        b_pic_mode == 0
    } else {
        max_gop_length > b_pic_mode
    };
    if !ok {
        return Err(ConstraintViolation::GopBPictureConflict {
            gop: max_gop_length,
            b_pic: b_pic_mode,
        });
    }
    Ok(())
}

pub fn check_h264_geometry(width: u32, height: u32) -> Result<(), ConstraintViolation> {
    if width % 2 != 0 || height % 2 != 0 {
        return Err(ConstraintViolation::OddDimensions { width, height });
    }
    if (width as u64 * height as u64) % 32 != 0 {
        return Err(ConstraintViolation::AreaNotAligned { width, height });
    }
    Ok(())
}

/// Both the luma start and the half-height chroma start must be 32-byte aligned
pub fn check_offsets(stride: u32, x_offset: u32, y_offset: u32) -> Result<(), ConstraintViolation> {
    let stride = stride as u64;
    let luma = stride * y_offset as u64 + x_offset as u64;
    if luma % PLANE_ALIGNMENT != 0 {
        return Err(ConstraintViolation::OffsetNotAligned {
            plane: "luma",
            offset: luma,
            x_offset,
            y_offset,
        });
    }
    let chroma = stride * y_offset as u64 / 2 + x_offset as u64;
    if chroma % PLANE_ALIGNMENT != 0 {
        return Err(ConstraintViolation::OffsetNotAligned {
            plane: "chroma",
            offset: chroma,
            x_offset,
            y_offset,
        });
    }
    Ok(())
}

pub fn check_stride(stride: u32, width: u32) -> Result<(), ConstraintViolation> {
    if stride < width {
        return Err(ConstraintViolation::StrideTooSmall { stride, width });
    }
    Ok(())
}

/// Picture left after cropping `(x_offset, y_offset)` from a `width`x`height` frame
pub fn cropped_size(
    width: u32,
    height: u32,
    x_offset: u32,
    y_offset: u32,
) -> Result<(u32, u32), ConstraintViolation> {
    match (width.checked_sub(x_offset), height.checked_sub(y_offset)) {
        (Some(w), Some(h)) if w > 0 && h > 0 => Ok((w, h)),
        _ => Err(ConstraintViolation::OffsetOutOfRange {
            x_offset,
            y_offset,
            width,
            height,
        }),
    }
}

/// MCU alignment of the cropped JPEG picture, which depends on chroma layout
pub fn check_jpeg_geometry(
    format: PixelFormat,
    width: u32,
    height: u32,
    x_offset: u32,
    y_offset: u32,
) -> Result<(), ConstraintViolation> {
    use crate::format::ChromaLayout;

    let (layout, mcu_width, mcu_height) = match format.chroma_layout() {
        ChromaLayout::Yuv420 => ("4:2:0", 8, 16),
        ChromaLayout::Yuv422 => ("4:2:2", 16, 8),
        ChromaLayout::Rgb => {
            return Err(ConstraintViolation::UnsupportedFormat {
                codec: "JPEG encoder".to_string(),
                format,
            })
        }
    };
    let (w, h) = cropped_size(width, height, x_offset, y_offset)?;
    if w % mcu_width != 0 || h % mcu_height != 0 {
        return Err(ConstraintViolation::JpegGeometry {
            layout,
            width: w,
            height: h,
            mcu_width,
            mcu_height,
        });
    }
    Ok(())
}
