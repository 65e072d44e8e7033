use std::sync::Arc;

use image::{imageops, Rgba, RgbaImage};
use parking_lot::Mutex;

use crate::capture::types::{Frame, Size};
use crate::privacy::blur::downscaled_blur;
use crate::privacy::config::{PrivacyConfig, PrivacyMode};
use crate::privacy::scale::{fit_rect, resize_rgba};

const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);
/// Fill for blur mode before the first frame arrives.
const NEUTRAL: Rgba<u8> = Rgba([128, 128, 128, 255]);
/// Fill for image mode without a configured image.
const NEUTRAL_DARK: Rgba<u8> = Rgba([38, 38, 38, 255]);

/// Text the presenting surface draws over a placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    WaitingForCapture,
    PrivacyActive,
    ScreenHidden,
    NoCustomImage,
}

impl Notice {
    pub fn text(self) -> &'static str {
        match self {
            Self::WaitingForCapture => "Initializing Screen Capture...",
            Self::PrivacyActive => "Privacy Mode Active",
            Self::ScreenHidden => "Screen Hidden",
            Self::NoCustomImage => "No Custom Image\nChoose one in Settings",
        }
    }
}

/// Output of one render call.
#[derive(Debug, Clone)]
pub struct RenderedFrame {
    pub image: Arc<RgbaImage>,
    pub notice: Option<Notice>,
    /// True when the privacy substitute was drawn instead of live content.
    pub privacy_applied: bool,
}

impl RenderedFrame {
    fn new(image: RgbaImage, notice: Option<Notice>, privacy_applied: bool) -> Self {
        Self {
            image: Arc::new(image),
            notice,
            privacy_applied,
        }
    }

    pub fn size(&self) -> Size {
        Size::new(self.image.width(), self.image.height())
    }
}

/// Last blur result, keyed on the source pixels and radius.
struct BlurCache {
    source: Arc<RgbaImage>,
    radius_bits: u32,
    output: Arc<RgbaImage>,
}

/// Turns the current frame and privacy configuration into a displayable
/// image.
///
/// Output depends only on the inputs. The renderer memoises the most recent
/// blur so sinks painting the same frame share one blur pass.
#[derive(Default)]
pub struct OverlayRenderer {
    blur_cache: Mutex<Option<BlurCache>>,
}

impl OverlayRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render `frame` under `config` for a surface of `bounds`.
    ///
    /// Pass-through and blur output keep the frame's extent; fills and image
    /// composites use `bounds`. The input frame is never modified.
    pub fn render(&self, frame: Option<&Frame>, config: &PrivacyConfig, bounds: Size) -> RenderedFrame {
        if !config.enabled {
            return match frame {
                Some(frame) => RenderedFrame {
                    image: Arc::clone(&frame.image),
                    notice: None,
                    privacy_applied: false,
                },
                None => RenderedFrame::new(
                    solid(target_size(None, bounds), BLACK),
                    Some(Notice::WaitingForCapture),
                    false,
                ),
            };
        }

        match config.mode {
            PrivacyMode::Black => RenderedFrame::new(
                solid(target_size(frame, bounds), BLACK),
                Some(Notice::PrivacyActive),
                true,
            ),
            PrivacyMode::Blur => match frame {
                Some(frame) => RenderedFrame {
                    image: self.blurred(&frame.image, config.blur_radius()),
                    notice: None,
                    privacy_applied: true,
                },
                None => RenderedFrame::new(
                    solid(target_size(None, bounds), NEUTRAL),
                    Some(Notice::ScreenHidden),
                    true,
                ),
            },
            PrivacyMode::Image => {
                let target = target_size(frame, bounds);
                match config.custom_image.as_deref() {
                    Some(image) => RenderedFrame::new(letterbox(image, target), None, true),
                    None => RenderedFrame::new(
                        solid(target, NEUTRAL_DARK),
                        Some(Notice::NoCustomImage),
                        true,
                    ),
                }
            }
        }
    }

    fn blurred(&self, source: &Arc<RgbaImage>, radius: f32) -> Arc<RgbaImage> {
        let radius_bits = radius.to_bits();
        if let Some(hit) = self.cached_blur(source, radius_bits) {
            return hit;
        }
        // Blur without the lock; another sink may render concurrently.
        let output = Arc::new(downscaled_blur(source, radius));
        *self.blur_cache.lock() = Some(BlurCache {
            source: Arc::clone(source),
            radius_bits,
            output: Arc::clone(&output),
        });
        output
    }

    fn cached_blur(&self, source: &Arc<RgbaImage>, radius_bits: u32) -> Option<Arc<RgbaImage>> {
        self.blur_cache
            .lock()
            .as_ref()
            .filter(|hit| Arc::ptr_eq(&hit.source, source) && hit.radius_bits == radius_bits)
            .map(|hit| Arc::clone(&hit.output))
    }
}

/// Surface size for fills: the requested bounds, else the frame extent.
fn target_size(frame: Option<&Frame>, bounds: Size) -> Size {
    if !bounds.is_empty() {
        return bounds;
    }
    match frame {
        Some(frame) if !frame.size().is_empty() => frame.size(),
        _ => Size::new(1, 1),
    }
}

fn solid(size: Size, colour: Rgba<u8>) -> RgbaImage {
    RgbaImage::from_pixel(size.width, size.height, colour)
}

/// `image` scaled to fit `target`, centred on black.
fn letterbox(image: &RgbaImage, target: Size) -> RgbaImage {
    let mut canvas = solid(target, BLACK);
    let source = Size::new(image.width(), image.height());
    let (x, y, fitted) = fit_rect(source, target);
    if let Some(scaled) = resize_rgba(image, fitted) {
        imageops::overlay(&mut canvas, &scaled, i64::from(x), i64::from(y));
    }
    canvas
}
