//! macOS capture service on ScreenCaptureKit, and window enumeration via
//! `xcap`.
//!
//! Window ids from both are CoreGraphics window numbers, so handles listed
//! by [`XcapWindowSource`] can be excluded from a ScreenCaptureKit filter
//! directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use screencapturekit::cm::CMTime;
use screencapturekit::cv::CVPixelBufferLockFlags;
use screencapturekit::prelude::*;

use crate::capture::backend::{CaptureBackend, StreamCallback};
use crate::capture::error::{CaptureError, Result};
use crate::capture::polling::{SourceWindow, WindowSource};
use crate::capture::types::{
    rgba_from_bgra, CaptureFilter, DisplayHandle, DisplayInfo, Frame, Size, StreamConfig,
    StreamEvent, StreamHandle, WindowHandle,
};

#[link(name = "CoreGraphics", kind = "framework")]
extern "C" {
    fn CGPreflightScreenCaptureAccess() -> bool;
    fn CGRequestScreenCaptureAccess() -> bool;
}

type SharedCallback = Arc<dyn Fn(StreamEvent) + Send + Sync>;

struct ActiveCapture {
    stream: SCStream,
    display: SCDisplay,
}

/// Capture service backed by ScreenCaptureKit (macOS 12.3+).
pub struct ScreenCaptureKitBackend {
    streams: Mutex<HashMap<StreamHandle, ActiveCapture>>,
    next_stream: AtomicU64,
    epoch: Instant,
}

impl ScreenCaptureKitBackend {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            next_stream: AtomicU64::new(1),
            epoch: Instant::now(),
        }
    }
}

impl Default for ScreenCaptureKitBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn shareable_content() -> Result<SCShareableContent> {
    SCShareableContent::get()
        .map_err(|e| CaptureError::Enumeration(format!("shareable content unavailable: {e}")))
}

/// ScreenCaptureKit filter for `display` without the windows in `filter`.
fn content_filter(content: &SCShareableContent, display: &SCDisplay, filter: &CaptureFilter) -> SCContentFilter {
    let windows = content.windows();
    let excluded: Vec<&SCWindow> = windows
        .iter()
        .filter(|w| filter.excludes(WindowHandle(u64::from(w.window_id()))))
        .collect();
    if excluded.len() < filter.excluded.len() {
        tracing::debug!(
            "{} of {} excluded window(s) are not shareable yet",
            filter.excluded.len() - excluded.len(),
            filter.excluded.len()
        );
    }
    SCContentFilter::create()
        .with_display(display)
        .with_excluding_windows(&excluded)
        .build()
}

/// Copy the pixels of a BGRA sample into an RGBA image.
fn sample_image(sample: &CMSampleBuffer) -> Option<image::RgbaImage> {
    let pixel_buffer = sample.image_buffer()?;
    let width = pixel_buffer.width() as u32;
    let height = pixel_buffer.height() as u32;
    if width == 0 || height == 0 {
        return None;
    }
    let guard = match pixel_buffer.lock(CVPixelBufferLockFlags::READ_ONLY) {
        Ok(guard) => guard,
        Err(e) => {
            tracing::warn!("Failed to lock pixel buffer: {e}");
            return None;
        }
    };
    rgba_from_bgra(guard.as_slice(), width, height, pixel_buffer.bytes_per_row())
}

impl CaptureBackend for ScreenCaptureKitBackend {
    fn request_permission(&self) -> Result<bool> {
        // SAFETY: argument-free TCC queries; the request shows the system
        // prompt at most once per process.
        let granted = unsafe { CGPreflightScreenCaptureAccess() || CGRequestScreenCaptureAccess() };
        tracing::debug!("Screen Recording permission granted: {granted}");
        Ok(granted)
    }

    fn displays(&self) -> Result<Vec<DisplayInfo>> {
        Ok(shareable_content()?
            .displays()
            .iter()
            .map(|d| DisplayInfo {
                handle: DisplayHandle(d.display_id()),
                size: Size::new(d.width(), d.height()),
            })
            .collect())
    }

    fn open_stream(
        &self,
        display: &DisplayInfo,
        config: StreamConfig,
        filter: &CaptureFilter,
        callback: StreamCallback,
    ) -> Result<StreamHandle> {
        let content = shareable_content()?;
        let sc_display = content
            .displays()
            .into_iter()
            .find(|d| d.display_id() == display.handle.0)
            .ok_or(CaptureError::NoDisplayAvailable)?;

        let sc_filter = content_filter(&content, &sc_display, filter);
        let interval = config.minimum_frame_interval.as_micros() as i64;
        let sc_config = SCStreamConfiguration::new()
            .with_width(config.size.width)
            .with_height(config.size.height)
            .with_pixel_format(PixelFormat::BGRA)
            .with_shows_cursor(true)
            .with_queue_depth(config.queue_depth)
            .with_minimum_frame_interval(&CMTime::new(interval, 1_000_000));

        let callback: SharedCallback = Arc::from(callback);
        let on_error = Arc::clone(&callback);
        let mut stream = SCStream::new_with_delegate(
            &sc_filter,
            &sc_config,
            ErrorHandler::new(move |error| on_error(StreamEvent::Failed(error.to_string()))),
        );

        let epoch = self.epoch;
        stream.add_output_handler(
            move |sample: CMSampleBuffer, kind: SCStreamOutputType| {
                if !matches!(kind, SCStreamOutputType::Screen) {
                    return;
                }
                if let Some(image) = sample_image(&sample) {
                    let timestamp = epoch.elapsed().as_micros() as u64;
                    callback(StreamEvent::Frame(Frame::new(image, timestamp)));
                }
            },
            SCStreamOutputType::Screen,
        );

        stream
            .start_capture()
            .map_err(|e| CaptureError::StreamFailure(format!("failed to start capture: {e}")))?;

        let handle = StreamHandle(self.next_stream.fetch_add(1, Ordering::Relaxed));
        let shown = display.handle;
        tracing::info!(
            "ScreenCaptureKit stream {} on {shown} at {}x{}",
            handle.0,
            config.size.width,
            config.size.height
        );
        self.streams.lock().insert(
            handle,
            ActiveCapture {
                stream,
                display: sc_display,
            },
        );
        Ok(handle)
    }

    fn update_filter(&self, stream: StreamHandle, filter: &CaptureFilter) -> Result<()> {
        let content = shareable_content()?;
        let streams = self.streams.lock();
        let active = streams
            .get(&stream)
            .ok_or_else(|| CaptureError::StreamFailure(format!("unknown stream {}", stream.0)))?;
        let sc_filter = content_filter(&content, &active.display, filter);
        active
            .stream
            .update_content_filter(&sc_filter)
            .map_err(|e| CaptureError::FilterRebuild(e.to_string()))
    }

    fn close_stream(&self, stream: StreamHandle) -> Result<()> {
        let removed = self.streams.lock().remove(&stream);
        let active =
            removed.ok_or_else(|| CaptureError::StreamFailure(format!("unknown stream {}", stream.0)))?;
        active
            .stream
            .stop_capture()
            .map_err(|e| CaptureError::StreamFailure(format!("failed to stop capture: {e}")))
    }
}

/// On-screen windows as reported by `xcap`.
pub struct XcapWindowSource;

impl WindowSource for XcapWindowSource {
    fn enumerate(&self) -> Result<Vec<SourceWindow>> {
        let windows = xcap::Window::all().map_err(|e| CaptureError::Enumeration(e.to_string()))?;
        Ok(windows
            .iter()
            .filter_map(|w| {
                let id = w.id().ok()?;
                Some(SourceWindow {
                    handle: WindowHandle(u64::from(id)),
                    owner_app_name: w.app_name().unwrap_or_default(),
                    minimized: w.is_minimized().unwrap_or(false),
                    focused: w.is_focused().unwrap_or(false),
                })
            })
            .collect())
    }
}
