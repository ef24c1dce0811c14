//! Framebuffer display sink
//!
//! [`FbdevSink`] shows raw video on a Linux framebuffer. It follows the same
//! `Null → Ready → Paused → Playing` lifecycle as the codec engines: the
//! framebuffer is opened on Ready and negotiation checks the offered caps
//! against the screen depth and size on Paused.

pub mod fbdev;
pub mod framebuffer;

pub use fbdev::{FbdevSink, FramebufferFactory, SinkFormat, DEFAULT_FRAMEBUFFER};
pub use framebuffer::{Framebuffer, LinuxFramebuffer, MemoryFramebuffer, MemoryLog, ScreenInfo};
