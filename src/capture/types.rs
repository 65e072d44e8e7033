use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use image::RgbaImage;
use serde::{Deserialize, Serialize};

/// OS identifier of a capturable display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DisplayHandle(pub u32);

impl fmt::Display for DisplayHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "display-{}", self.0)
    }
}

/// OS identifier of an on-screen window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowHandle(pub u64);

impl fmt::Display for WindowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "window-{}", self.0)
    }
}

/// Pixel dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// A capturable display as reported by the capture service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayInfo {
    pub handle: DisplayHandle,
    pub size: Size,
}

/// An on-screen window as reported by the window registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowInfo {
    pub handle: WindowHandle,
    /// Display name of the application owning the window.
    pub owner_app_name: String,
}

impl WindowInfo {
    pub fn new(handle: WindowHandle, owner_app_name: impl Into<String>) -> Self {
        Self {
            handle,
            owner_app_name: owner_app_name.into(),
        }
    }
}

/// One captured image plus its capture timestamp.
///
/// Pixels live behind an `Arc` so the bus and every sink share a single
/// allocation; nothing downstream mutates them.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: Arc<RgbaImage>,
    /// Capture timestamp in microseconds on the capture service's clock.
    pub timestamp_us: u64,
}

impl Frame {
    pub fn new(image: RgbaImage, timestamp_us: u64) -> Self {
        Self {
            image: Arc::new(image),
            timestamp_us,
        }
    }

    pub fn size(&self) -> Size {
        Size::new(self.image.width(), self.image.height())
    }
}

/// Convert a BGRA pixel buffer with `stride` bytes per row into RGBA.
///
/// Returns `None` when the buffer is too short for the given geometry.
pub fn rgba_from_bgra(bgra: &[u8], width: u32, height: u32, stride: usize) -> Option<RgbaImage> {
    let row_bytes = width as usize * 4;
    if stride < row_bytes {
        return None;
    }
    let mut rgba = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let pixels = bgra.get(start..start + row_bytes)?;
        for px in pixels.chunks_exact(4) {
            rgba.extend_from_slice(&[px[2], px[1], px[0], px[3]]);
        }
    }
    RgbaImage::from_raw(width, height, rgba)
}

/// Concrete capture filter: the display plus the resolved exclusion set.
///
/// The exclusion set is ordered so two builds over the same inputs compare
/// equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFilter {
    pub display: DisplayHandle,
    pub excluded: BTreeSet<WindowHandle>,
}

impl CaptureFilter {
    /// A filter that captures the whole display.
    pub fn display_only(display: DisplayHandle) -> Self {
        Self {
            display,
            excluded: BTreeSet::new(),
        }
    }

    pub fn excludes(&self, window: WindowHandle) -> bool {
        self.excluded.contains(&window)
    }
}

/// Opaque handle to an open capture stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

/// Stream parameters handed to the capture service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub size: Size,
    pub minimum_frame_interval: Duration,
    pub queue_depth: u32,
}

impl StreamConfig {
    /// Native display size at 30 fps with a queue depth of 5.
    pub fn for_display(display: &DisplayInfo) -> Self {
        Self {
            size: display.size,
            minimum_frame_interval: Duration::from_micros(1_000_000 / 30),
            queue_depth: 5,
        }
    }
}

/// Events delivered by an open capture stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Frame(Frame),
    /// The stream stopped on its own; no further events follow.
    Failed(String),
}
