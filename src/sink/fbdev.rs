//! Framebuffer display sink

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use super::framebuffer::{Framebuffer, LinuxFramebuffer, ScreenInfo};
use crate::codec::{ConstraintViolation, MediaCaps};
use crate::config::{ElementSettings, Property, PropertyRanges};
use crate::engine::StreamState;
use crate::error::{CodecError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::format::PixelFormat;

/// Framebuffer used when no device is configured
pub const DEFAULT_FRAMEBUFFER: &str = "/dev/fb0";

/// Opens a framebuffer for a path
pub type FramebufferFactory = Box<dyn Fn(&Path) -> Result<Box<dyn Framebuffer>> + Send + Sync>;

/// Picture layout accepted by a negotiated sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkFormat {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Top-left corner of the picture on screen
    pub x: u32,
    pub y: u32,
}

impl SinkFormat {
    fn bytes_per_pixel(&self) -> usize {
        self.format.bits_per_pixel() as usize / 8
    }

    pub fn frame_size(&self) -> usize {
        self.format.frame_size(self.width, self.height)
    }
}

struct SinkInner {
    state: StreamState,
    fb: Option<Box<dyn Framebuffer>>,
    caps: Option<MediaCaps>,
    format: Option<SinkFormat>,
    /// Page currently on screen
    visible: u32,
    flipping: bool,
    rendered: u64,
}

/// Raw video sink drawing into a framebuffer
pub struct FbdevSink {
    name: String,
    factory: FramebufferFactory,
    settings: ArcSwap<ElementSettings>,
    events: EventBus,
    inner: Mutex<SinkInner>,
}

impl FbdevSink {
    pub fn new(factory: FramebufferFactory) -> Self {
        Self {
            name: "fbdevsink0".to_string(),
            factory,
            settings: ArcSwap::from_pointee(ElementSettings::default()),
            events: EventBus::new(),
            inner: Mutex::new(SinkInner {
                state: StreamState::Null,
                fb: None,
                caps: None,
                format: None,
                visible: 0,
                flipping: false,
                rendered: 0,
            }),
        }
    }

    /// Sink on `/dev/fbN`
    pub fn linux() -> Self {
        Self::new(Box::new(|path: &Path| {
            Ok(Box::new(LinuxFramebuffer::open(path)?) as Box<dyn Framebuffer>)
        }))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn format(&self) -> Option<SinkFormat> {
        self.inner.lock().format
    }

    pub fn screen(&self) -> Option<ScreenInfo> {
        self.inner.lock().fb.as_ref().map(|fb| fb.info())
    }

    pub fn set_property(&self, property: Property) -> Result<()> {
        let inner = self.inner.lock();
        if property.requires_closed_device() && inner.state != StreamState::Null {
            return Err(CodecError::InvalidState {
                from: inner.state.to_string(),
                to: format!("set {}", property.name()),
            });
        }
        let mut settings = (*self.settings.load_full()).clone();
        settings.apply(property, &PropertyRanges::unconstrained());
        self.settings.store(Arc::new(settings));
        Ok(())
    }

    /// Offer upstream caps; checked against the screen once it is open
    pub fn set_caps(&self, caps: MediaCaps) -> Result<()> {
        let mut inner = self.inner.lock();
        let screen = inner.fb.as_ref().map(|fb| fb.info());
        if let Some(screen) = screen {
            let format = self.negotiate(&screen, &caps)?;
            if inner.state >= StreamState::Paused {
                self.store_format(&mut inner, caps, format);
            }
        }
        inner.caps = Some(caps);
        Ok(())
    }

    pub fn set_state(&self, target: StreamState) -> Result<()> {
        let mut inner = self.inner.lock();
        for next in inner.state.path_to(target) {
            self.step_locked(&mut inner, next)?;
        }
        Ok(())
    }

    /// Draw one picture, centred on screen
    ///
    /// With `dma-mode` the picture goes to the hidden page, which is then
    /// made visible; otherwise it is drawn in place. With `vsync` the
    /// presentation waits for the vertical blank.
    pub fn render(&self, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != StreamState::Playing {
            return Err(CodecError::InvalidState {
                from: inner.state.to_string(),
                to: "render".to_string(),
            });
        }
        let format = inner.format.ok_or(CodecError::NotNegotiated)?;
        if data.len() < format.frame_size() {
            return Err(CodecError::Config(format!(
                "Frame of {} bytes is shorter than a {}x{} {} picture",
                data.len(),
                format.width,
                format.height,
                format.format
            )));
        }
        let vsync = self.settings.load().vsync;
        let flip = inner.flipping;
        let target = if flip { 1 - inner.visible } else { inner.visible };

        let result = match inner.fb.as_mut() {
            Some(fb) => present(fb.as_mut(), &format, data, target, vsync, flip),
            None => Err(CodecError::NotNegotiated),
        };
        match result {
            Ok(()) => {
                inner.visible = target;
                inner.rendered += 1;
                trace!("{}: frame {} on page {}", self.name, inner.rendered, target);
                Ok(())
            }
            Err(e) => {
                if e.is_fatal() {
                    warn!("{}: {}, closing framebuffer", self.name, e);
                    self.events.publish(EngineEvent::Fatal {
                        element: self.name.clone(),
                        reason: e.to_string(),
                    });
                    for next in inner.state.path_to(StreamState::Null) {
                        let _ = self.step_locked(&mut inner, next);
                    }
                }
                Err(e)
            }
        }
    }

    pub fn end_of_stream(&self) {
        let rendered = self.inner.lock().rendered;
        info!("{}: end of stream after {} frames", self.name, rendered);
        self.events.publish(EngineEvent::EndOfStream {
            element: self.name.clone(),
            frames: rendered,
        });
    }

    fn negotiate(&self, screen: &ScreenInfo, caps: &MediaCaps) -> Result<SinkFormat> {
        let reject = |violation: ConstraintViolation| {
            warn!("{}: caps {} rejected: {}", self.name, caps, violation);
            self.events.publish(EngineEvent::NotNegotiated {
                element: self.name.clone(),
                reason: violation.to_string(),
            });
            CodecError::Negotiation(violation)
        };
        let MediaCaps::RawVideo {
            format, resolution, ..
        } = *caps
        else {
            return Err(reject(ConstraintViolation::UnsupportedCaps {
                codec: self.name.clone(),
                caps: caps.to_string(),
            }));
        };
        if screen.pixel_format() != Some(format) {
            return Err(reject(ConstraintViolation::UnsupportedFormat {
                codec: format!("{} ({}bpp screen)", self.name, screen.bits_per_pixel),
                format,
            }));
        }
        if resolution.width == 0
            || resolution.height == 0
            || resolution.width > screen.width
            || resolution.height > screen.height
        {
            return Err(reject(ConstraintViolation::ResolutionOutOfRange {
                width: resolution.width,
                height: resolution.height,
                min_width: 1,
                min_height: 1,
                max_width: screen.width,
                max_height: screen.height,
            }));
        }
        Ok(SinkFormat {
            format,
            width: resolution.width,
            height: resolution.height,
            x: (screen.width - resolution.width) / 2,
            y: (screen.height - resolution.height) / 2,
        })
    }

    fn store_format(&self, inner: &mut SinkInner, caps: MediaCaps, format: SinkFormat) {
        debug!(
            "{}: {}x{} {} at ({}, {})",
            self.name, format.width, format.height, format.format, format.x, format.y
        );
        self.events.publish(EngineEvent::Negotiated {
            element: self.name.clone(),
            codec: None,
            input: caps,
            output: None,
        });
        inner.format = Some(format);
    }

    fn step_locked(&self, inner: &mut SinkInner, next: StreamState) -> Result<()> {
        let from = inner.state;
        match (from, next) {
            (StreamState::Null, StreamState::Ready) => {
                let path = self
                    .settings
                    .load()
                    .device
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_FRAMEBUFFER));
                inner.fb = Some((self.factory)(&path)?);
            }
            (StreamState::Ready, StreamState::Paused) => {
                let caps = inner.caps.ok_or(CodecError::NotNegotiated)?;
                let screen = inner
                    .fb
                    .as_ref()
                    .map(|fb| fb.info())
                    .ok_or(CodecError::NotNegotiated)?;
                let format = self.negotiate(&screen, &caps)?;
                self.store_format(inner, caps, format);
            }
            (StreamState::Paused, StreamState::Playing) => {
                let pages = inner.fb.as_ref().map(|fb| fb.info().pages).unwrap_or(0);
                inner.flipping = self.settings.load().dma_mode && pages >= 2;
                if self.settings.load().dma_mode && !inner.flipping {
                    warn!(
                        "{}: page flipping needs 2 pages, screen has {}; drawing in place",
                        self.name, pages
                    );
                }
                inner.visible = 0;
                inner.rendered = 0;
            }
            (StreamState::Playing, StreamState::Paused) => {}
            (StreamState::Paused, StreamState::Ready) => inner.format = None,
            (StreamState::Ready, StreamState::Null) => inner.fb = None,
            _ => {
                return Err(CodecError::InvalidState {
                    from: from.to_string(),
                    to: next.to_string(),
                })
            }
        }

        inner.state = next;
        info!("{}: {} -> {}", self.name, from, next);
        self.events.publish(EngineEvent::StateChanged {
            element: self.name.clone(),
            from,
            to: next,
        });
        Ok(())
    }
}

/// Copy rows into `page`, then show it
fn present(
    fb: &mut dyn Framebuffer,
    format: &SinkFormat,
    data: &[u8],
    page: u32,
    vsync: bool,
    flip: bool,
) -> Result<()> {
    let line_length = fb.info().line_length as usize;
    let bpp = format.bytes_per_pixel();
    let row_bytes = format.width as usize * bpp;

    if !flip && vsync {
        fb.wait_vsync()?;
    }
    let pixels = fb
        .page_mut(page)
        .ok_or_else(|| CodecError::device_fault("framebuffer", format!("no page {}", page)))?;
    for (row, src) in data.chunks_exact(row_bytes).take(format.height as usize).enumerate() {
        let start = (format.y as usize + row) * line_length + format.x as usize * bpp;
        pixels[start..start + row_bytes].copy_from_slice(src);
    }
    if flip {
        if vsync {
            fb.wait_vsync()?;
        }
        fb.pan_to(page)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Fraction;
    use crate::sink::{MemoryFramebuffer, MemoryLog};

    fn sink(width: u32, height: u32, pages: u32) -> (FbdevSink, Arc<Mutex<MemoryLog>>) {
        let fb = MemoryFramebuffer::new(width, height, 16, pages);
        let log = fb.log();
        let slot = Mutex::new(Some(fb));
        let sink = FbdevSink::new(Box::new(move |_: &Path| {
            slot.lock()
                .take()
                .map(|fb| Box::new(fb) as Box<dyn Framebuffer>)
                .ok_or_else(|| CodecError::device_fault("memfb", "already open"))
        }));
        (sink, log)
    }

    fn rgb565(width: u32, height: u32) -> MediaCaps {
        MediaCaps::raw_video(PixelFormat::Rgb565, width, height, Fraction::new(30, 1))
    }

    #[test]
    fn test_render_centred() {
        let (sink, log) = sink(8, 4, 1);
        sink.set_caps(rgb565(2, 2)).unwrap();
        sink.set_state(StreamState::Playing).unwrap();
        assert_eq!(
            sink.format(),
            Some(SinkFormat {
                format: PixelFormat::Rgb565,
                width: 2,
                height: 2,
                x: 3,
                y: 1,
            })
        );

        sink.render(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        sink.set_state(StreamState::Null).unwrap();
        let log = log.lock();
        assert_eq!(log.vsyncs, 1);
        assert!(log.pans.is_empty());

        let page = &log.pages[0];
        let line = 16;
        assert_eq!(&page[line + 6..line + 10], &[1, 2, 3, 4]);
        assert_eq!(&page[2 * line + 6..2 * line + 10], &[5, 6, 7, 8]);
        assert!(page[..line].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_page_flipping() {
        let (sink, log) = sink(4, 2, 2);
        sink.set_property(Property::DmaMode(true)).unwrap();
        sink.set_property(Property::Vsync(false)).unwrap();
        sink.set_caps(rgb565(4, 2)).unwrap();
        sink.set_state(StreamState::Playing).unwrap();

        let frame = vec![0xaa; 16];
        sink.render(&frame).unwrap();
        sink.render(&frame).unwrap();
        sink.render(&frame).unwrap();

        let log = log.lock();
        assert_eq!(log.pans, vec![1, 0, 1]);
        assert_eq!(log.vsyncs, 0);
    }

    #[test]
    fn test_negotiation_rules() {
        let (sink, _log) = sink(8, 4, 1);
        sink.set_state(StreamState::Ready).unwrap();
        let mut rx = sink.events().subscribe();

        assert!(matches!(
            sink.set_caps(MediaCaps::raw_video(
                PixelFormat::Nv12,
                4,
                4,
                Fraction::new(30, 1)
            )),
            Err(CodecError::Negotiation(ConstraintViolation::UnsupportedFormat { .. }))
        ));
        assert!(matches!(
            sink.set_caps(rgb565(16, 4)),
            Err(CodecError::Negotiation(ConstraintViolation::ResolutionOutOfRange { .. }))
        ));
        assert!(matches!(
            sink.set_caps(rgb565(0, 4)),
            Err(CodecError::Negotiation(ConstraintViolation::ResolutionOutOfRange { .. }))
        ));
        let err = sink.set_caps(MediaCaps::raw_audio(48000, 2)).unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(
            err,
            CodecError::Negotiation(ConstraintViolation::UnsupportedCaps { .. })
        ));
        assert!(matches!(
            rx.try_recv(),
            Ok(EngineEvent::NotNegotiated { .. })
        ));

        assert!(matches!(
            sink.set_state(StreamState::Paused),
            Err(CodecError::NotNegotiated)
        ));
        sink.set_caps(rgb565(8, 4)).unwrap();
        sink.set_state(StreamState::Paused).unwrap();
    }

    #[test]
    fn test_render_requires_playing() {
        let (sink, _log) = sink(4, 4, 1);
        sink.set_caps(rgb565(4, 4)).unwrap();
        sink.set_state(StreamState::Paused).unwrap();
        assert!(matches!(
            sink.render(&[0; 32]),
            Err(CodecError::InvalidState { .. })
        ));
        sink.set_state(StreamState::Playing).unwrap();
        assert!(sink.render(&[0; 31]).is_err());
        sink.render(&[0; 32]).unwrap();

        assert!(sink
            .set_property(Property::Device(PathBuf::from("/dev/fb1")))
            .is_err());
        sink.set_state(StreamState::Null).unwrap();
        assert!(sink.screen().is_none());
    }
}
