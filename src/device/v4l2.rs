//! V4L2 memory-to-memory device backed by v4l2r (ioctl layer).
//!
//! The OUTPUT queue carries data into the codec and the CAPTURE queue carries
//! results out; in this crate they are called the input and output queues.
//! The node is opened non-blocking and every dequeue is preceded by a
//! zero-timeout poll, so a dequeue is only attempted when the driver has
//! signalled a completed buffer.

use std::collections::VecDeque;
use std::fs::File;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};
use v4l2r::bindings::{v4l2_control, v4l2_decoder_cmd, v4l2_encoder_cmd, v4l2_requestbuffers};
use v4l2r::ioctl::{
    self, Capabilities, Capability as V4l2rCapability, MemoryConsistency, PlaneMapping,
    QBufPlane, QBuffer, QueryBuffer, V4l2Buffer,
};
use v4l2r::memory::{MemoryType, MmapHandle};
use v4l2r::{Format as V4l2rFormat, PixelFormat as V4l2rPixelFormat, QueueType};

use super::{Allocation, Completion, DeviceFormat, DeviceOpener, M2mDevice, Readiness};
use crate::codec::{DrainKind, SlotSizes};
use crate::error::{CodecError, Result};

const V4L2_BUF_FLAG_ERROR: u32 = 0x0000_0040;
const V4L2_BUF_FLAG_LAST: u32 = 0x0010_0000;
const V4L2_ENC_CMD_STOP: u32 = 1;
const V4L2_DEC_CMD_STOP: u32 = 1;

nix::ioctl_readwrite!(vidioc_s_ctrl, b'V', 28, v4l2_control);
nix::ioctl_readwrite!(vidioc_encoder_cmd, b'V', 77, v4l2_encoder_cmd);
nix::ioctl_readwrite!(vidioc_decoder_cmd, b'V', 96, v4l2_decoder_cmd);

/// One mmap'd plane of a device buffer
struct MmapRegion(PlaneMapping);

// The mapping is only touched while `Inner` is locked.
unsafe impl Send for MmapRegion {}

struct Inner {
    fd: File,
    input_maps: Vec<Vec<MmapRegion>>,
    output_maps: Vec<Vec<MmapRegion>>,
    /// Timestamps of queued inputs; output completes in submission order
    timestamps: VecDeque<Duration>,
    last_timestamp: Duration,
    streaming: bool,
}

/// V4L2 M2M codec device
pub struct V4l2M2mDevice {
    name: String,
    /// Duplicate of the device fd for polling without holding the lock
    poll_fd: File,
    input_queue: QueueType,
    output_queue: QueueType,
    inner: Mutex<Inner>,
    /// Set on the first fault; teardown then only drops mappings and fd
    faulted: AtomicBool,
}

impl V4l2M2mDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let name = path.display().to_string();
        let fd = File::options()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| CodecError::device_fault(&name, format!("Failed to open: {}", e)))?;

        let caps: V4l2rCapability = ioctl::querycap(&fd).map_err(|e| {
            CodecError::device_fault(&name, format!("Failed to query capabilities: {}", e))
        })?;
        let caps_flags = caps.device_caps();

        let (input_queue, output_queue) = if caps_flags.contains(Capabilities::VIDEO_M2M_MPLANE) {
            (QueueType::VideoOutputMplane, QueueType::VideoCaptureMplane)
        } else if caps_flags.contains(Capabilities::VIDEO_M2M) {
            (QueueType::VideoOutput, QueueType::VideoCapture)
        } else {
            return Err(CodecError::device_fault(
                &name,
                "Device is not a memory-to-memory device",
            ));
        };

        let poll_fd = fd
            .try_clone()
            .map_err(|e| CodecError::device_fault(&name, format!("Failed to dup fd: {}", e)))?;

        info!(
            "Opened M2M device {} ({}, {:?}/{:?})",
            name, caps.card, input_queue, output_queue
        );

        Ok(Self {
            name,
            poll_fd,
            input_queue,
            output_queue,
            inner: Mutex::new(Inner {
                fd,
                input_maps: Vec::new(),
                output_maps: Vec::new(),
                timestamps: VecDeque::new(),
                last_timestamp: Duration::ZERO,
                streaming: false,
            }),
            faulted: AtomicBool::new(false),
        })
    }

    fn fault(&self, what: &str, e: impl std::fmt::Display) -> CodecError {
        self.faulted.store(true, Ordering::SeqCst);
        CodecError::device_fault(&self.name, format!("{}: {}", what, e))
    }

    fn poll_flags(&self, flags: PollFlags, timeout: Duration) -> Result<PollFlags> {
        let mut fds = [PollFd::new(self.poll_fd.as_fd(), flags)];
        let timeout_ms = timeout.as_millis().min(u16::MAX as u128) as u16;
        let ready = poll(&mut fds, PollTimeout::from(timeout_ms))
            .map_err(|e| self.fault("poll failed", e))?;
        if ready == 0 {
            return Ok(PollFlags::empty());
        }
        Ok(fds[0].revents().unwrap_or(PollFlags::empty()))
    }

    fn set_format(
        &self,
        fd: &mut File,
        queue: QueueType,
        fourcc: [u8; 4],
        width: u32,
        height: u32,
        bytes_per_line: u32,
        size: usize,
    ) -> Result<V4l2rFormat> {
        let mut fmt: V4l2rFormat = ioctl::g_fmt(&*fd, queue)
            .map_err(|e| self.fault("Failed to get format", e))?;
        fmt.width = width;
        fmt.height = height;
        fmt.pixelformat = V4l2rPixelFormat::from(&fourcc);
        if let Some(plane) = fmt.plane_fmt.get_mut(0) {
            plane.sizeimage = size as u32;
            plane.bytesperline = bytes_per_line;
        }
        let actual: V4l2rFormat = ioctl::s_fmt(fd, (queue, &fmt))
            .map_err(|e| self.fault("Failed to set format", e))?;
        if actual.pixelformat != fmt.pixelformat {
            return Err(self.fault(
                "Format rejected",
                format!(
                    "driver chose {:?} instead of {}",
                    actual.pixelformat,
                    String::from_utf8_lossy(&fourcc)
                ),
            ));
        }
        Ok(actual)
    }

    fn map_buffers(
        &self,
        fd: &File,
        queue: QueueType,
        count: usize,
    ) -> Result<Vec<Vec<MmapRegion>>> {
        let mut maps = Vec::with_capacity(count);
        for index in 0..count {
            let query: QueryBuffer = ioctl::querybuf(fd, queue, index)
                .map_err(|e| self.fault("Failed to query buffer", e))?;
            if query.planes.is_empty() {
                return Err(self.fault("Driver returned zero planes", index));
            }
            let mut planes = Vec::with_capacity(query.planes.len());
            for plane in &query.planes {
                let mapping = ioctl::mmap(fd, plane.mem_offset, plane.length).map_err(|e| {
                    CodecError::Allocation(format!(
                        "{}: mmap of buffer {} failed: {}",
                        self.name, index, e
                    ))
                })?;
                planes.push(MmapRegion(mapping));
            }
            maps.push(planes);
        }
        Ok(maps)
    }

    fn request(&self, fd: &File, queue: QueueType, count: usize) -> Result<usize> {
        let req: v4l2_requestbuffers = ioctl::reqbufs(
            fd,
            queue,
            MemoryType::Mmap,
            count as u32,
            MemoryConsistency::empty(),
        )
        .map_err(|e| CodecError::Allocation(format!("{}: reqbufs failed: {}", self.name, e)))?;
        Ok(req.count as usize)
    }

    fn qbuf(
        &self,
        fd: &File,
        queue: QueueType,
        index: usize,
        maps: &[MmapRegion],
        bytes_used: &[usize],
    ) -> Result<()> {
        let handle = MmapHandle::default();
        let planes = maps
            .iter()
            .zip(bytes_used.iter().chain(std::iter::repeat(&0)))
            .map(|(mapping, used)| {
                let mut plane = QBufPlane::new_from_handle(&handle, *used);
                plane.0.length = mapping.0.len() as u32;
                plane
            })
            .collect();
        let mut qbuf: QBuffer<MmapHandle> = QBuffer::new(queue, index as u32);
        qbuf.planes = planes;
        ioctl::qbuf::<_, ()>(fd, qbuf).map_err(|e| self.fault("Failed to queue buffer", e))?;
        Ok(())
    }

    fn stop_streaming(&self, inner: &mut Inner) -> Result<()> {
        if !inner.streaming {
            return Ok(());
        }
        inner.streaming = false;
        inner.timestamps.clear();
        ioctl::streamoff(&inner.fd, self.input_queue)
            .map_err(|e| self.fault("Failed to stop input queue", e))?;
        ioctl::streamoff(&inner.fd, self.output_queue)
            .map_err(|e| self.fault("Failed to stop output queue", e))?;
        Ok(())
    }
}

impl M2mDevice for V4l2M2mDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&self, format: &DeviceFormat) -> Result<()> {
        let mut inner = self.inner.lock();
        let fd = &mut inner.fd;

        self.set_format(
            fd,
            self.input_queue,
            format.input_fourcc,
            format.width,
            format.height,
            format.bytes_per_line,
            format.sizes.input,
        )?;
        self.set_format(
            fd,
            self.output_queue,
            format.output_fourcc,
            format.width,
            format.height,
            0,
            format.sizes.output,
        )?;

        for control in &format.controls {
            let mut ctrl = v4l2_control {
                id: control.id,
                value: control.value,
            };
            // SAFETY: `ctrl` is a valid v4l2_control for the duration of the call
            unsafe { vidioc_s_ctrl(fd.as_raw_fd(), &mut ctrl) }
                .map_err(|e| self.fault(&format!("Failed to set control {}", control.name), e))?;
            trace!("{}: {} = {}", self.name, control.name, control.value);
        }

        debug!(
            "{}: configured {} -> {} ({} controls)",
            self.name,
            String::from_utf8_lossy(&format.input_fourcc),
            String::from_utf8_lossy(&format.output_fourcc),
            format.controls.len()
        );
        Ok(())
    }

    fn allocate(&self, count: usize, sizes: SlotSizes) -> Result<Allocation> {
        let mut inner = self.inner.lock();

        let inputs = self.request(&inner.fd, self.input_queue, count)?;
        let outputs = self.request(&inner.fd, self.output_queue, count)?;
        if inputs == 0 || outputs == 0 {
            return Err(CodecError::Allocation(format!(
                "{}: driver granted {} input and {} output buffers",
                self.name, inputs, outputs
            )));
        }

        let input_maps = self.map_buffers(&inner.fd, self.input_queue, inputs)?;
        let output_maps = self.map_buffers(&inner.fd, self.output_queue, outputs)?;
        let granted = SlotSizes {
            input: input_maps
                .iter()
                .map(|p| p.iter().map(|m| m.0.len()).sum::<usize>())
                .min()
                .unwrap_or(0),
            output: output_maps
                .iter()
                .map(|p| p.iter().map(|m| m.0.len()).sum::<usize>())
                .min()
                .unwrap_or(0),
        };
        if granted.input < sizes.input || granted.output < sizes.output {
            warn!(
                "{}: driver buffers smaller than requested ({:?} < {:?})",
                self.name, granted, sizes
            );
        }

        inner.input_maps = input_maps;
        inner.output_maps = output_maps;
        debug!(
            "{}: {} input / {} output buffers ({} / {} bytes)",
            self.name, inputs, outputs, granted.input, granted.output
        );

        Ok(Allocation {
            input_slots: inputs,
            output_slots: outputs,
            sizes: granted,
        })
    }

    fn queue_input(&self, index: usize, data: &[u8], timestamp: Duration) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let planes = inner
            .input_maps
            .get_mut(index)
            .ok_or_else(|| self.fault("Input buffer out of range", index))?;

        // Spread the payload over the planes in order
        let mut used = Vec::with_capacity(planes.len());
        let mut rest = data;
        for plane in planes.iter_mut() {
            let n = rest.len().min(plane.0.len());
            plane.0[..n].copy_from_slice(&rest[..n]);
            used.push(n);
            rest = &rest[n..];
        }
        if !rest.is_empty() {
            let capacity = data.len() - rest.len();
            return Err(CodecError::FrameTooLarge {
                len: data.len(),
                capacity,
            });
        }

        self.qbuf(&inner.fd, self.input_queue, index, &inner.input_maps[index], &used)?;
        inner.timestamps.push_back(timestamp);
        trace!("{}: queued input {} ({} bytes)", self.name, index, data.len());
        Ok(())
    }

    fn queue_output(&self, index: usize) -> Result<()> {
        let inner = self.inner.lock();
        let planes = inner
            .output_maps
            .get(index)
            .ok_or_else(|| self.fault("Output buffer out of range", index))?;
        self.qbuf(&inner.fd, self.output_queue, index, planes, &[])
    }

    fn wait(&self, timeout: Duration) -> Result<Readiness> {
        let revents = self.poll_flags(PollFlags::POLLIN | PollFlags::POLLOUT, timeout)?;
        Ok(Readiness {
            input: revents.contains(PollFlags::POLLOUT),
            output: revents.contains(PollFlags::POLLIN),
        })
    }

    fn dequeue_input(&self) -> Result<Option<usize>> {
        if !self
            .poll_flags(PollFlags::POLLOUT, Duration::ZERO)?
            .contains(PollFlags::POLLOUT)
        {
            return Ok(None);
        }
        let inner = self.inner.lock();
        let dqbuf: V4l2Buffer = ioctl::dqbuf(&inner.fd, self.input_queue)
            .map_err(|e| self.fault("Failed to dequeue input", e))?;
        Ok(Some(dqbuf.as_v4l2_buffer().index as usize))
    }

    fn dequeue_output(&self) -> Result<Option<Completion>> {
        if !self
            .poll_flags(PollFlags::POLLIN, Duration::ZERO)?
            .contains(PollFlags::POLLIN)
        {
            return Ok(None);
        }
        let mut inner = self.inner.lock();
        let dqbuf: V4l2Buffer = ioctl::dqbuf(&inner.fd, self.output_queue)
            .map_err(|e| self.fault("Failed to dequeue output", e))?;
        let index = dqbuf.as_v4l2_buffer().index as usize;
        let flags = dqbuf.as_v4l2_buffer().flags;
        let planes = inner
            .output_maps
            .get(index)
            .ok_or_else(|| self.fault("Dequeued unknown buffer", index))?;

        let mut data = Vec::new();
        for (plane_idx, plane) in dqbuf.planes_iter().enumerate() {
            let bytes_used = *plane.bytesused as usize;
            let data_offset = plane.data_offset.copied().unwrap_or(0) as usize;
            if bytes_used == 0 {
                continue;
            }
            let Some(mapping) = planes.get(plane_idx) else {
                continue;
            };
            let start = data_offset.min(mapping.0.len());
            let end = bytes_used.min(mapping.0.len());
            if end > start {
                data.extend_from_slice(&mapping.0[start..end]);
            }
        }

        let last = flags & V4L2_BUF_FLAG_LAST != 0;
        let timestamp = if data.is_empty() {
            inner.last_timestamp
        } else {
            let ts = inner.timestamps.pop_front().unwrap_or(inner.last_timestamp);
            inner.last_timestamp = ts;
            ts
        };

        Ok(Some(Completion {
            index,
            data: Bytes::from(data),
            timestamp,
            last,
            corrupted: flags & V4L2_BUF_FLAG_ERROR != 0,
        }))
    }

    fn start_drain(&self, kind: DrainKind) -> Result<()> {
        let inner = self.inner.lock();
        let fd = inner.fd.as_raw_fd();
        // SAFETY: the command structs are zero-initialised plain data
        let result = unsafe {
            match kind {
                DrainKind::Encoder => {
                    let mut cmd: v4l2_encoder_cmd = std::mem::zeroed();
                    cmd.cmd = V4L2_ENC_CMD_STOP;
                    vidioc_encoder_cmd(fd, &mut cmd)
                }
                DrainKind::Decoder => {
                    let mut cmd: v4l2_decoder_cmd = std::mem::zeroed();
                    cmd.cmd = V4L2_DEC_CMD_STOP;
                    vidioc_decoder_cmd(fd, &mut cmd)
                }
            }
        };
        result.map_err(|e| self.fault("Failed to send stop command", e))?;
        debug!("{}: drain started", self.name);
        Ok(())
    }

    fn stream_on(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        ioctl::streamon(&inner.fd, self.input_queue)
            .map_err(|e| self.fault("Failed to start input queue", e))?;
        ioctl::streamon(&inner.fd, self.output_queue)
            .map_err(|e| self.fault("Failed to start output queue", e))?;
        inner.streaming = true;
        Ok(())
    }

    fn stream_off(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.stop_streaming(&mut inner)
    }

    fn release_buffers(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.stop_streaming(&mut inner)?;
        inner.input_maps.clear();
        inner.output_maps.clear();
        self.request(&inner.fd, self.input_queue, 0)?;
        self.request(&inner.fd, self.output_queue, 0)?;
        Ok(())
    }

    fn mark_faulted(&self) {
        self.faulted.store(true, Ordering::SeqCst);
    }
}

impl Drop for V4l2M2mDevice {
    fn drop(&mut self) {
        if *self.faulted.get_mut() {
            debug!("{}: faulted, closing without stopping queues", self.name);
            return;
        }
        let inner = self.inner.get_mut();
        if inner.streaming {
            for queue in [self.input_queue, self.output_queue] {
                if let Err(e) = ioctl::streamoff(&inner.fd, queue) {
                    debug!("Failed to stop {:?} on {}: {}", queue, self.name, e);
                }
            }
        }
    }
}

/// Opens V4L2 device nodes
#[derive(Debug, Clone, Copy, Default)]
pub struct V4l2Opener;

impl DeviceOpener for V4l2Opener {
    fn open(&self, path: &Path) -> Result<Arc<dyn M2mDevice>> {
        Ok(Arc::new(V4l2M2mDevice::open(path)?))
    }
}
