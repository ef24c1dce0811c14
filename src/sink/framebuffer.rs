//! Linux framebuffer device access

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use parking_lot::Mutex;
use std::ffi::c_void;
use std::fs::File;
use std::num::NonZeroUsize;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{CodecError, Result};
use crate::format::PixelFormat;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct FbBitfield {
    offset: u32,
    length: u32,
    msb_right: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct FbVarScreeninfo {
    xres: u32,
    yres: u32,
    xres_virtual: u32,
    yres_virtual: u32,
    xoffset: u32,
    yoffset: u32,
    bits_per_pixel: u32,
    grayscale: u32,
    red: FbBitfield,
    green: FbBitfield,
    blue: FbBitfield,
    transp: FbBitfield,
    nonstd: u32,
    activate: u32,
    height: u32,
    width: u32,
    accel_flags: u32,
    pixclock: u32,
    left_margin: u32,
    right_margin: u32,
    upper_margin: u32,
    lower_margin: u32,
    hsync_len: u32,
    vsync_len: u32,
    sync: u32,
    vmode: u32,
    rotate: u32,
    colorspace: u32,
    reserved: [u32; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct FbFixScreeninfo {
    id: [u8; 16],
    smem_start: libc::c_ulong,
    smem_len: u32,
    type_: u32,
    type_aux: u32,
    visual: u32,
    xpanstep: u16,
    ypanstep: u16,
    ywrapstep: u16,
    line_length: u32,
    mmio_start: libc::c_ulong,
    mmio_len: u32,
    accel: u32,
    capabilities: u16,
    reserved: [u16; 2],
}

nix::ioctl_read_bad!(fbioget_vscreeninfo, 0x4600, FbVarScreeninfo);
nix::ioctl_read_bad!(fbioget_fscreeninfo, 0x4602, FbFixScreeninfo);
nix::ioctl_write_ptr_bad!(fbiopan_display, 0x4606, FbVarScreeninfo);
nix::ioctl_write_ptr!(fbio_waitforvsync, b'F', 0x20, u32);

/// Geometry of a framebuffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenInfo {
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u32,
    /// Bytes per row
    pub line_length: u32,
    /// Whole screens that fit in the virtual area
    pub pages: u32,
}

impl ScreenInfo {
    /// Pixel format matching the screen depth
    pub fn pixel_format(&self) -> Option<PixelFormat> {
        match self.bits_per_pixel {
            16 => Some(PixelFormat::Rgb565),
            24 => Some(PixelFormat::Bgr24),
            32 => Some(PixelFormat::Bgrx),
            _ => None,
        }
    }

    pub fn page_size(&self) -> usize {
        self.line_length as usize * self.height as usize
    }
}

/// A display surface the sink draws into
pub trait Framebuffer: Send {
    fn info(&self) -> ScreenInfo;

    /// Pixel memory of one page, `None` if the page does not exist
    fn page_mut(&mut self, page: u32) -> Option<&mut [u8]>;

    fn wait_vsync(&mut self) -> Result<()>;

    /// Make `page` the visible one
    fn pan_to(&mut self, page: u32) -> Result<()>;
}

/// `/dev/fbN` mapped into memory
pub struct LinuxFramebuffer {
    name: String,
    file: File,
    map: NonNull<c_void>,
    map_len: usize,
    var: FbVarScreeninfo,
    info: ScreenInfo,
}

// The mapping is owned exclusively and only reached through &mut self
unsafe impl Send for LinuxFramebuffer {}

impl LinuxFramebuffer {
    pub fn open(path: &Path) -> Result<Self> {
        let name = path.display().to_string();
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| CodecError::device_fault(&name, e))?;
        let fd = file.as_raw_fd();

        let mut var = FbVarScreeninfo::default();
        let mut fix = FbFixScreeninfo::default();
        // SAFETY: both structs match the kernel layout and outlive the calls
        unsafe {
            fbioget_vscreeninfo(fd, &mut var)
                .map_err(|e| CodecError::device_fault(&name, format!("FBIOGET_VSCREENINFO: {}", e)))?;
            fbioget_fscreeninfo(fd, &mut fix)
                .map_err(|e| CodecError::device_fault(&name, format!("FBIOGET_FSCREENINFO: {}", e)))?;
        }

        let map_len = fix.smem_len as usize;
        let length = NonZeroUsize::new(map_len)
            .ok_or_else(|| CodecError::device_fault(&name, "framebuffer has no memory"))?;
        // SAFETY: fresh shared mapping of the device memory, unmapped in Drop
        let map = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                0,
            )
        }
        .map_err(|e| CodecError::device_fault(&name, format!("mmap: {}", e)))?;

        let page_size = fix.line_length as usize * var.yres as usize;
        let pages = if page_size == 0 {
            0
        } else {
            (var.yres_virtual / var.yres.max(1)).min((map_len / page_size) as u32)
        };
        let info = ScreenInfo {
            width: var.xres,
            height: var.yres,
            bits_per_pixel: var.bits_per_pixel,
            line_length: fix.line_length,
            pages,
        };
        info!(
            "Opened framebuffer {}: {}x{} {}bpp, {} pages",
            name, info.width, info.height, info.bits_per_pixel, info.pages
        );

        Ok(Self {
            name,
            file,
            map,
            map_len,
            var,
            info,
        })
    }
}

impl Framebuffer for LinuxFramebuffer {
    fn info(&self) -> ScreenInfo {
        self.info
    }

    fn page_mut(&mut self, page: u32) -> Option<&mut [u8]> {
        if page >= self.info.pages {
            return None;
        }
        let size = self.info.page_size();
        let offset = page as usize * size;
        if offset + size > self.map_len {
            return None;
        }
        // SAFETY: the range lies inside the mapping, borrowed mutably via self
        unsafe {
            Some(std::slice::from_raw_parts_mut(
                (self.map.as_ptr() as *mut u8).add(offset),
                size,
            ))
        }
    }

    fn wait_vsync(&mut self) -> Result<()> {
        let screen: u32 = 0;
        // SAFETY: the argument is a plain u32 that outlives the call
        match unsafe { fbio_waitforvsync(self.file.as_raw_fd(), &screen) } {
            Ok(_) => Ok(()),
            // Driver without vsync support
            Err(nix::errno::Errno::ENOTTY) => Ok(()),
            Err(e) => Err(CodecError::device_fault(
                &self.name,
                format!("FBIO_WAITFORVSYNC: {}", e),
            )),
        }
    }

    fn pan_to(&mut self, page: u32) -> Result<()> {
        let mut var = self.var;
        var.xoffset = 0;
        var.yoffset = page * self.info.height;
        // SAFETY: var matches the kernel layout and outlives the call
        unsafe { fbiopan_display(self.file.as_raw_fd(), &var) }
            .map_err(|e| CodecError::device_fault(&self.name, format!("FBIOPAN_DISPLAY: {}", e)))?;
        self.var = var;
        Ok(())
    }
}

impl Drop for LinuxFramebuffer {
    fn drop(&mut self) {
        // SAFETY: map/map_len come from the mmap in open
        if let Err(e) = unsafe { munmap(self.map, self.map_len) } {
            debug!("{}: munmap failed: {}", self.name, e);
        }
    }
}

/// What an in-memory framebuffer has been asked to do
#[derive(Debug, Default)]
pub struct MemoryLog {
    pub vsyncs: usize,
    pub pans: Vec<u32>,
    pub pages: Vec<Vec<u8>>,
}

/// Framebuffer backed by plain memory, inspectable through a shared log
///
/// Page contents are copied to the log on every vsync, pan and on drop.
pub struct MemoryFramebuffer {
    info: ScreenInfo,
    log: Arc<Mutex<MemoryLog>>,
    pages: Vec<Vec<u8>>,
}

impl MemoryFramebuffer {
    pub fn new(width: u32, height: u32, bits_per_pixel: u32, pages: u32) -> Self {
        let line_length = width * bits_per_pixel / 8;
        let info = ScreenInfo {
            width,
            height,
            bits_per_pixel,
            line_length,
            pages,
        };
        Self {
            info,
            log: Arc::new(Mutex::new(MemoryLog::default())),
            pages: vec![vec![0u8; info.page_size()]; pages as usize],
        }
    }

    pub fn log(&self) -> Arc<Mutex<MemoryLog>> {
        self.log.clone()
    }

    fn snapshot(&self) {
        self.log.lock().pages = self.pages.clone();
    }
}

impl Drop for MemoryFramebuffer {
    fn drop(&mut self) {
        self.snapshot();
    }
}

impl Framebuffer for MemoryFramebuffer {
    fn info(&self) -> ScreenInfo {
        self.info
    }

    fn page_mut(&mut self, page: u32) -> Option<&mut [u8]> {
        self.pages.get_mut(page as usize).map(|p| p.as_mut_slice())
    }

    fn wait_vsync(&mut self) -> Result<()> {
        self.log.lock().vsyncs += 1;
        self.snapshot();
        Ok(())
    }

    fn pan_to(&mut self, page: u32) -> Result<()> {
        if page >= self.info.pages {
            return Err(CodecError::device_fault("memfb", "pan beyond virtual area"));
        }
        self.log.lock().pans.push(page);
        self.snapshot();
        Ok(())
    }
}
