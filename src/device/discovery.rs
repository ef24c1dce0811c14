//! M2M codec device discovery

use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use v4l::capability::Flags;
use v4l::prelude::*;
use v4l2r::ioctl::FormatIterator;
use v4l2r::QueueType;

use crate::codec::CodecKind;
use crate::error::{CodecError, Result};

/// A memory-to-memory device and the formats each queue accepts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct M2mDeviceInfo {
    pub path: PathBuf,
    pub card: String,
    pub driver: String,
    pub multiplanar: bool,
    /// FourCCs accepted on the input (V4L2 OUTPUT) queue
    pub input_formats: Vec<[u8; 4]>,
    /// FourCCs produced on the output (V4L2 CAPTURE) queue
    pub output_formats: Vec<[u8; 4]>,
}

impl M2mDeviceInfo {
    /// Whether the device can run the given codec
    pub fn supports(&self, kind: CodecKind) -> bool {
        let has_in = |f: &[u8; 4]| self.input_formats.contains(f);
        let has_out = |f: &[u8; 4]| self.output_formats.contains(f);
        match kind {
            CodecKind::H264Encode => has_out(b"H264") && (has_in(b"NV12") || has_in(b"YU12")),
            CodecKind::H264Decode => has_in(b"H264") && (has_out(b"NV12") || has_out(b"YU12")),
            CodecKind::JpegEncode => has_out(b"JPEG") || has_out(b"MJPG"),
            CodecKind::AacEncode => has_out(b"AAC "),
        }
    }
}

fn formats(fd: &File, queue: QueueType) -> Vec<[u8; 4]> {
    FormatIterator::new(fd, queue)
        .map(|desc| desc.pixelformat.to_le_bytes())
        .collect()
}

/// Query one device node; `None` if it is not an M2M device
pub fn inspect(path: &Path) -> Result<Option<M2mDeviceInfo>> {
    let device = Device::with_path(path)
        .map_err(|e| CodecError::device_fault(path.display().to_string(), e))?;
    let caps = device
        .query_caps()
        .map_err(|e| CodecError::device_fault(path.display().to_string(), e))?;

    let multiplanar = caps.capabilities.contains(Flags::VIDEO_M2M_MPLANE);
    if !multiplanar && !caps.capabilities.contains(Flags::VIDEO_M2M) {
        return Ok(None);
    }

    let (input_queue, output_queue) = if multiplanar {
        (QueueType::VideoOutputMplane, QueueType::VideoCaptureMplane)
    } else {
        (QueueType::VideoOutput, QueueType::VideoCapture)
    };
    let fd = File::open(path)?;

    Ok(Some(M2mDeviceInfo {
        path: path.to_path_buf(),
        card: caps.card,
        driver: caps.driver,
        multiplanar,
        input_formats: formats(&fd, input_queue),
        output_formats: formats(&fd, output_queue),
    }))
}

/// Enumerate all M2M devices under /dev
pub fn enumerate_m2m_devices() -> Result<Vec<M2mDeviceInfo>> {
    let mut devices = Vec::new();

    for entry in std::fs::read_dir("/dev")
        .map_err(|e| CodecError::Config(format!("Failed to read /dev: {}", e)))?
    {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };

        let path = entry.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if !name.starts_with("video") {
            continue;
        }

        match inspect(&path) {
            Ok(Some(info)) => {
                debug!(
                    "Found M2M device {:?}: {} ({}) in={} out={}",
                    path,
                    info.card,
                    info.driver,
                    info.input_formats.len(),
                    info.output_formats.len()
                );
                devices.push(info);
            }
            Ok(None) => debug!("Skipping non-M2M device: {:?}", path),
            Err(e) => debug!("Failed to inspect {:?}: {}", path, e),
        }
    }

    devices.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(devices)
}

/// Find the first device able to run `kind`
pub fn find_m2m_device(kind: CodecKind) -> Result<M2mDeviceInfo> {
    let device = enumerate_m2m_devices()?
        .into_iter()
        .find(|d| d.supports(kind))
        .ok_or_else(|| CodecError::Config(format!("No M2M device found for {}", kind)))?;
    info!("Using {:?} ({}) for {}", device.path, device.card, kind);
    Ok(device)
}
