use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capture::types::{Size, WindowHandle};
use crate::preview::bus::FrameBus;
use crate::privacy::render::{OverlayRenderer, RenderedFrame};
use crate::privacy::scale::{fit_rect, resize_rgba};

/// How often an idle sink wakes to check timers (HUD auto-hide).
const IDLE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkKind {
    Preview,
    Pip,
    Hud,
}

impl SinkKind {
    pub const ALL: [SinkKind; 3] = [Self::Preview, Self::Pip, Self::Hud];

    fn default_surface(self) -> Size {
        match self {
            Self::Preview => Size::new(1280, 720),
            Self::Pip => Size::new(320, 180),
            Self::Hud => Size::new(240, 135),
        }
    }
}

/// Presentation state of one render consumer.
///
/// A sink never holds a frame beyond a paint call; it keeps only its last
/// rendered output.
pub struct Sink {
    kind: SinkKind,
    window: WindowHandle,
    surface: Size,
    visible: bool,
    fullscreen: bool,
    hide_at: Option<Instant>,
    caption: Option<String>,
    needs_paint: bool,
    last_rendered: Option<RenderedFrame>,
    renders: u64,
}

impl Sink {
    pub fn new(kind: SinkKind, window: WindowHandle) -> Self {
        Self {
            kind,
            window,
            surface: kind.default_surface(),
            visible: kind == SinkKind::Preview,
            fullscreen: false,
            hide_at: None,
            caption: None,
            needs_paint: true,
            last_rendered: None,
            renders: 0,
        }
    }

    pub fn kind(&self) -> SinkKind {
        self.kind
    }

    pub fn window(&self) -> WindowHandle {
        self.window
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn is_fullscreen(&self) -> bool {
        self.fullscreen
    }

    pub fn caption(&self) -> Option<&str> {
        self.caption.as_deref()
    }

    pub fn last_rendered(&self) -> Option<&RenderedFrame> {
        self.last_rendered.as_ref()
    }

    /// Completed paint calls.
    pub fn render_count(&self) -> u64 {
        self.renders
    }

    pub fn needs_paint(&self) -> bool {
        self.visible && self.needs_paint
    }

    pub fn set_visible(&mut self, visible: bool) {
        if visible && !self.visible {
            self.needs_paint = true;
        }
        self.visible = visible;
        self.hide_at = None;
    }

    pub fn toggle_visible(&mut self) -> bool {
        self.set_visible(!self.visible);
        self.visible
    }

    pub fn toggle_fullscreen(&mut self) -> bool {
        self.fullscreen = !self.fullscreen;
        self.needs_paint = true;
        self.fullscreen
    }

    pub fn set_surface(&mut self, surface: Size) {
        self.surface = surface;
        self.needs_paint = true;
    }

    /// Show with `caption` until `duration` after `now`. Showing again
    /// restarts the timer.
    pub fn show_for(&mut self, caption: impl Into<String>, duration: Duration, now: Instant) {
        self.visible = true;
        self.caption = Some(caption.into());
        self.hide_at = Some(now + duration);
        self.needs_paint = true;
    }

    /// Apply an elapsed auto-hide timer. Returns true if the sink hid.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.hide_at {
            Some(at) if now >= at => {
                self.visible = false;
                self.hide_at = None;
                true
            }
            _ => false,
        }
    }

    /// Whether a driver woken at `now` should schedule a paint. Applies any
    /// elapsed auto-hide first; a hidden sink never wants one.
    pub fn wants_paint(&mut self, bus_changed: bool, now: Instant) -> bool {
        if self.expire(now) {
            tracing::debug!("{:?} sink auto-hidden", self.kind);
        }
        self.visible && (bus_changed || self.needs_paint)
    }

    /// Render the bus's current frame and config. Returns `None` while hidden.
    pub fn paint(&mut self, bus: &FrameBus, renderer: &OverlayRenderer, now: Instant) -> Option<&RenderedFrame> {
        self.expire(now);
        if !self.visible {
            return None;
        }

        let frame = bus.current_frame();
        let config = bus.current_config();
        let mut rendered = renderer.render(frame.as_ref(), &config, self.surface);

        if self.kind != SinkKind::Preview {
            rendered = self.fit_to_surface(rendered);
        }

        self.needs_paint = false;
        self.renders += 1;
        self.last_rendered = Some(rendered);
        self.last_rendered.as_ref()
    }

    /// Downscale oversized output to fit the small floating surfaces.
    fn fit_to_surface(&self, rendered: RenderedFrame) -> RenderedFrame {
        let size = rendered.size();
        if size.width <= self.surface.width && size.height <= self.surface.height {
            return rendered;
        }
        let (_, _, fitted) = fit_rect(size, self.surface);
        match resize_rgba(&rendered.image, fitted) {
            Some(image) => RenderedFrame {
                image: Arc::new(image),
                ..rendered
            },
            None => rendered,
        }
    }
}

pub type SharedSink = Arc<Mutex<Sink>>;

/// Window handles of the three sink surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkWindows {
    pub preview: WindowHandle,
    pub pip: WindowHandle,
    pub hud: WindowHandle,
}

impl Default for SinkWindows {
    fn default() -> Self {
        Self {
            preview: WindowHandle(0xC10A_0001),
            pip: WindowHandle(0xC10A_0002),
            hud: WindowHandle(0xC10A_0003),
        }
    }
}

/// The application's render consumers.
pub struct Sinks {
    pub preview: SharedSink,
    pub pip: SharedSink,
    pub hud: SharedSink,
}

impl Sinks {
    pub fn new(windows: SinkWindows) -> Self {
        let shared = |kind, window| Arc::new(Mutex::new(Sink::new(kind, window)));
        Self {
            preview: shared(SinkKind::Preview, windows.preview),
            pip: shared(SinkKind::Pip, windows.pip),
            hud: shared(SinkKind::Hud, windows.hud),
        }
    }

    pub fn get(&self, kind: SinkKind) -> &SharedSink {
        match kind {
            SinkKind::Preview => &self.preview,
            SinkKind::Pip => &self.pip,
            SinkKind::Hud => &self.hud,
        }
    }

    /// Handles to hide from capture, visible or not.
    pub fn own_windows(&self) -> BTreeSet<WindowHandle> {
        SinkKind::ALL
            .iter()
            .map(|&kind| self.get(kind).lock().window())
            .collect()
    }
}

impl Default for Sinks {
    fn default() -> Self {
        Self::new(SinkWindows::default())
    }
}

/// Called with every completed paint; stands in for the presenting surface.
pub type PaintCallback = Arc<dyn Fn(SinkKind, &RenderedFrame) + Send + Sync>;

/// Drive a sink on its own cadence: repaint on every bus change while
/// visible, and poll for pending timers and state changes otherwise.
pub fn spawn_sink_driver(
    sink: SharedSink,
    bus: Arc<FrameBus>,
    renderer: Arc<OverlayRenderer>,
    cancel: CancellationToken,
    on_paint: Option<PaintCallback>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let kind = sink.lock().kind();
        let mut ticks = bus.subscribe();
        let mut idle = tokio::time::interval(IDLE_POLL);
        idle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let bus_changed = tokio::select! {
                _ = cancel.cancelled() => break,
                changed = ticks.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    true
                }
                _ = idle.tick() => false,
            };

            if !sink.lock().wants_paint(bus_changed, Instant::now()) {
                continue;
            }

            // Rendering can be expensive (blur); keep it off the async workers.
            let (sink_ref, bus_ref, renderer_ref) =
                (Arc::clone(&sink), Arc::clone(&bus), Arc::clone(&renderer));
            let painted = tokio::task::spawn_blocking(move || {
                let mut guard = sink_ref.lock();
                guard.paint(&bus_ref, &renderer_ref, Instant::now()).cloned()
            })
            .await;

            match painted {
                Ok(Some(rendered)) => {
                    if let Some(cb) = &on_paint {
                        cb(kind, &rendered);
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("{kind:?} sink paint task failed: {e}"),
            }
        }
        tracing::debug!("{kind:?} sink driver stopped");
    })
}
