//! Pixel format definitions and conversions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw pixel formats accepted by the codec engines and the framebuffer sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// NV12 semi-planar 4:2:0 (Y plane + interleaved UV)
    Nv12,
    /// I420 planar 4:2:0
    Yuv420,
    /// YUYV 4:2:2 packed
    Yuyv,
    /// UYVY 4:2:2 packed
    Uyvy,
    /// RGB565 (16 bpp)
    Rgb565,
    /// BGR24 (3 bytes per pixel)
    Bgr24,
    /// BGRx 32 bpp, as exposed by most 32-bit framebuffers
    Bgrx,
}

/// Chroma subsampling layout of a raw format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChromaLayout {
    Yuv420,
    Yuv422,
    Rgb,
}

impl PixelFormat {
    /// V4L2 FourCC
    pub fn to_fourcc(&self) -> [u8; 4] {
        match self {
            PixelFormat::Nv12 => *b"NV12",
            PixelFormat::Yuv420 => *b"YU12",
            PixelFormat::Yuyv => *b"YUYV",
            PixelFormat::Uyvy => *b"UYVY",
            PixelFormat::Rgb565 => *b"RGBP",
            PixelFormat::Bgr24 => *b"BGR3",
            PixelFormat::Bgrx => *b"XR24",
        }
    }

    pub fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"NV12" => Some(PixelFormat::Nv12),
            b"YU12" | b"I420" => Some(PixelFormat::Yuv420),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"UYVY" => Some(PixelFormat::Uyvy),
            b"RGBP" => Some(PixelFormat::Rgb565),
            b"BGR3" => Some(PixelFormat::Bgr24),
            b"XR24" | b"BX24" => Some(PixelFormat::Bgrx),
            _ => None,
        }
    }

    pub fn chroma_layout(&self) -> ChromaLayout {
        match self {
            PixelFormat::Nv12 | PixelFormat::Yuv420 => ChromaLayout::Yuv420,
            PixelFormat::Yuyv | PixelFormat::Uyvy => ChromaLayout::Yuv422,
            PixelFormat::Rgb565 | PixelFormat::Bgr24 | PixelFormat::Bgrx => ChromaLayout::Rgb,
        }
    }

    /// Bytes per pixel of the first plane
    pub fn luma_bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Nv12 | PixelFormat::Yuv420 => 1,
            PixelFormat::Yuyv | PixelFormat::Uyvy | PixelFormat::Rgb565 => 2,
            PixelFormat::Bgr24 => 3,
            PixelFormat::Bgrx => 4,
        }
    }

    /// Bits per pixel, averaged over all planes
    pub fn bits_per_pixel(&self) -> u32 {
        match self {
            PixelFormat::Nv12 | PixelFormat::Yuv420 => 12,
            PixelFormat::Yuyv | PixelFormat::Uyvy | PixelFormat::Rgb565 => 16,
            PixelFormat::Bgr24 => 24,
            PixelFormat::Bgrx => 32,
        }
    }

    /// Size of a tightly packed frame with a row stride of `stride` pixels
    pub fn frame_size(&self, stride: u32, height: u32) -> usize {
        (stride as usize * height as usize * self.bits_per_pixel() as usize) / 8
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Yuv420 => "I420",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Uyvy => "UYVY",
            PixelFormat::Rgb565 => "RGB565",
            PixelFormat::Bgr24 => "BGR24",
            PixelFormat::Bgrx => "BGRx",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "NV12" => Ok(PixelFormat::Nv12),
            "I420" | "YUV420" | "YU12" => Ok(PixelFormat::Yuv420),
            "YUYV" | "YUY2" => Ok(PixelFormat::Yuyv),
            "UYVY" => Ok(PixelFormat::Uyvy),
            "RGB565" | "RGB16" => Ok(PixelFormat::Rgb565),
            "BGR24" | "BGR" => Ok(PixelFormat::Bgr24),
            "BGRX" | "BGRA" => Ok(PixelFormat::Bgrx),
            _ => Err(format!("Unknown pixel format: {}", s)),
        }
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub const QVGA: Resolution = Resolution {
        width: 320,
        height: 240,
    };
    pub const HD1080: Resolution = Resolution {
        width: 1920,
        height: 1080,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

/// Frame rate as a fraction (numerator / denominator)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fraction {
    pub num: u32,
    pub den: u32,
}

impl Fraction {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// Duration of one frame, or None for variable rate (0/1)
    pub fn frame_duration(&self) -> Option<std::time::Duration> {
        if self.num == 0 || self.den == 0 {
            return None;
        }
        Some(std::time::Duration::from_nanos(
            1_000_000_000u64 * self.den as u64 / self.num as u64,
        ))
    }
}

impl Default for Fraction {
    fn default() -> Self {
        Self::new(30, 1)
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl std::str::FromStr for Fraction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (num, den) = match s.split_once('/') {
            Some((n, d)) => (n.trim(), d.trim()),
            None => (s.trim(), "1"),
        };
        let num = num
            .parse()
            .map_err(|_| format!("Invalid frame rate: {}", s))?;
        let den = den
            .parse()
            .map_err(|_| format!("Invalid frame rate: {}", s))?;
        Ok(Self::new(num, den))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_round_trip() {
        for format in [PixelFormat::Nv12, PixelFormat::Yuyv, PixelFormat::Bgrx] {
            assert_eq!(PixelFormat::from_fourcc(&format.to_fourcc()), Some(format));
        }
        assert_eq!(PixelFormat::from_fourcc(b"I420"), Some(PixelFormat::Yuv420));
        assert_eq!(PixelFormat::from_fourcc(b"H264"), None);
    }

    #[test]
    fn test_frame_size() {
        assert_eq!(PixelFormat::Nv12.frame_size(320, 240), 320 * 240 * 3 / 2);
        assert_eq!(PixelFormat::Yuyv.frame_size(320, 240), 320 * 240 * 2);
        assert_eq!(PixelFormat::Bgrx.frame_size(4, 1), 16);
    }

    #[test]
    fn test_fraction_parse() {
        assert_eq!("30000/1001".parse::<Fraction>().unwrap(), Fraction::new(30000, 1001));
        assert_eq!("25".parse::<Fraction>().unwrap(), Fraction::new(25, 1));
        assert!("x/1".parse::<Fraction>().is_err());
        assert_eq!(
            Fraction::new(25, 1).frame_duration(),
            Some(std::time::Duration::from_millis(40))
        );
        assert_eq!(Fraction::new(0, 1).frame_duration(), None);
    }
}
