//! Simulated capture service and window registry for running without OS
//! capture APIs.
//!
//! Both use a builder pattern to configure displays, windows and failure
//! injection. Frames are either pushed by hand (deterministic tests) or
//! produced by a timer thread (headless runs).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use image::{Rgba, RgbaImage};
use parking_lot::{Condvar, Mutex};

use crate::capture::backend::{
    AppEvent, AppEventCallback, CaptureBackend, StreamCallback, WatchToken, WindowRegistry,
};
use crate::capture::error::{CaptureError, Result};
use crate::capture::types::{
    CaptureFilter, DisplayHandle, DisplayInfo, Frame, Size, StreamConfig, StreamEvent,
    StreamHandle, WindowHandle, WindowInfo,
};

const DUMMY_DISPLAY: DisplayHandle = DisplayHandle(1);
const DUMMY_DISPLAY_SIZE: Size = Size::new(640, 360);

type SharedCallback = Arc<dyn Fn(StreamEvent) + Send + Sync>;

struct DummyStream {
    callback: SharedCallback,
    filter: CaptureFilter,
    size: Size,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    frames_sent: u64,
}

struct CaptureState {
    permission: bool,
    displays: Vec<DisplayInfo>,
    frame_interval: Option<Duration>,
    fail_open: bool,
    fail_update: bool,
    fail_close: bool,
    close_attempts: u32,
    streams: HashMap<StreamHandle, DummyStream>,
    streams_opened: u32,
    filter_updates: Vec<CaptureFilter>,
}

/// A fake capture service.
///
/// Enable for headless runs via the `DUMMY_CAPTURE=1` environment variable.
pub struct DummyCaptureBackend {
    state: Mutex<CaptureState>,
    next_stream: AtomicU64,
    epoch: Instant,
}

impl DummyCaptureBackend {
    /// One 640x360 display, permission granted, frames pushed by hand.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CaptureState {
                permission: true,
                displays: vec![DisplayInfo {
                    handle: DUMMY_DISPLAY,
                    size: DUMMY_DISPLAY_SIZE,
                }],
                frame_interval: None,
                fail_open: false,
                fail_update: false,
                fail_close: false,
                close_attempts: 0,
                streams: HashMap::new(),
                streams_opened: 0,
                filter_updates: Vec::new(),
            }),
            next_stream: AtomicU64::new(1),
            epoch: Instant::now(),
        }
    }

    /// Whether the simulated capture service is enabled via environment variable.
    pub fn is_enabled() -> bool {
        std::env::var("DUMMY_CAPTURE").is_ok_and(|v| v == "1" || v == "true")
    }

    /// Grant or deny screen recording permission.
    pub fn with_permission(self, granted: bool) -> Self {
        self.state.lock().permission = granted;
        self
    }

    /// Replace the display list.
    pub fn with_displays(self, displays: Vec<DisplayInfo>) -> Self {
        self.state.lock().displays = displays;
        self
    }

    /// Produce synthetic frames from a timer thread at the given interval.
    pub fn with_frame_interval(self, interval: Duration) -> Self {
        self.state.lock().frame_interval = Some(interval);
        self
    }

    /// Make `open_stream` fail.
    pub fn with_open_failure(self) -> Self {
        self.state.lock().fail_open = true;
        self
    }

    /// Make `update_filter` fail.
    pub fn set_update_failure(&self, fail: bool) {
        self.state.lock().fail_update = fail;
    }

    /// Make `close_stream` report an error. The stream is still stopped.
    pub fn set_close_failure(&self, fail: bool) {
        self.state.lock().fail_close = fail;
    }

    pub fn close_attempts(&self) -> u32 {
        self.state.lock().close_attempts
    }

    /// Deliver a frame to an open stream on the caller's thread.
    ///
    /// Returns `false` if the stream is not open.
    pub fn push_frame(&self, stream: StreamHandle, frame: Frame) -> bool {
        let callback = {
            let mut state = self.state.lock();
            match state.streams.get_mut(&stream) {
                Some(s) => {
                    s.frames_sent += 1;
                    Arc::clone(&s.callback)
                }
                None => return false,
            }
        };
        callback(StreamEvent::Frame(frame));
        true
    }

    /// Deliver a synthetic test-pattern frame to an open stream.
    pub fn push_test_frame(&self, stream: StreamHandle) -> bool {
        let (size, index) = {
            let state = self.state.lock();
            match state.streams.get(&stream) {
                Some(s) => (s.size, s.frames_sent),
                None => return false,
            }
        };
        let timestamp = self.epoch.elapsed().as_micros() as u64;
        self.push_frame(stream, Frame::new(test_pattern(size, index), timestamp))
    }

    /// Simulate the OS stopping a stream with an error.
    pub fn fail_stream(&self, stream: StreamHandle, reason: &str) -> bool {
        let removed = self.state.lock().streams.remove(&stream);
        match removed {
            Some(mut s) => {
                stop_producer(&mut s);
                (s.callback)(StreamEvent::Failed(reason.to_string()));
                true
            }
            None => false,
        }
    }

    /// Handles of all open streams.
    pub fn open_streams(&self) -> Vec<StreamHandle> {
        let mut handles: Vec<_> = self.state.lock().streams.keys().copied().collect();
        handles.sort_by_key(|h| h.0);
        handles
    }

    /// Total number of streams ever opened.
    pub fn streams_opened(&self) -> u32 {
        self.state.lock().streams_opened
    }

    /// Filter currently applied to a stream.
    pub fn current_filter(&self, stream: StreamHandle) -> Option<CaptureFilter> {
        self.state
            .lock()
            .streams
            .get(&stream)
            .map(|s| s.filter.clone())
    }

    /// Every filter passed to `update_filter`, in order.
    pub fn filter_updates(&self) -> Vec<CaptureFilter> {
        self.state.lock().filter_updates.clone()
    }
}

impl Default for DummyCaptureBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for DummyCaptureBackend {
    fn request_permission(&self) -> Result<bool> {
        let state = self.state.lock();
        Ok(state.permission && !state.displays.is_empty())
    }

    fn displays(&self) -> Result<Vec<DisplayInfo>> {
        let state = self.state.lock();
        if !state.permission {
            return Ok(vec![]);
        }
        Ok(state.displays.clone())
    }

    fn open_stream(
        &self,
        display: &DisplayInfo,
        config: StreamConfig,
        filter: &CaptureFilter,
        callback: StreamCallback,
    ) -> Result<StreamHandle> {
        let mut state = self.state.lock();
        if state.fail_open {
            return Err(CaptureError::StreamFailure(
                "simulated stream open failure".into(),
            ));
        }
        if !state.displays.iter().any(|d| d.handle == display.handle) {
            return Err(CaptureError::NoDisplayAvailable);
        }

        let handle = StreamHandle(self.next_stream.fetch_add(1, Ordering::Relaxed));
        let callback: SharedCallback = Arc::from(callback);
        let running = Arc::new(AtomicBool::new(true));

        let thread = state.frame_interval.map(|interval| {
            let callback = Arc::clone(&callback);
            let running = Arc::clone(&running);
            let size = config.size;
            let epoch = self.epoch;
            std::thread::Builder::new()
                .name(format!("dummy-capture-{}", handle.0))
                .spawn(move || produce_frames(&callback, &running, size, interval, epoch))
                .expect("failed to spawn dummy capture thread")
        });

        state.streams.insert(
            handle,
            DummyStream {
                callback,
                filter: filter.clone(),
                size: config.size,
                running,
                thread,
                frames_sent: 0,
            },
        );
        state.streams_opened += 1;
        let shown = display.handle;
        tracing::debug!("dummy stream {} opened on {shown}", handle.0);
        Ok(handle)
    }

    fn update_filter(&self, stream: StreamHandle, filter: &CaptureFilter) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_update {
            return Err(CaptureError::FilterRebuild(
                "simulated filter update failure".into(),
            ));
        }
        let s = state
            .streams
            .get_mut(&stream)
            .ok_or_else(|| CaptureError::StreamFailure(format!("unknown stream {}", stream.0)))?;
        s.filter = filter.clone();
        state.filter_updates.push(filter.clone());
        Ok(())
    }

    fn close_stream(&self, stream: StreamHandle) -> Result<()> {
        let (removed, fail) = {
            let mut state = self.state.lock();
            state.close_attempts += 1;
            (state.streams.remove(&stream), state.fail_close)
        };
        match removed {
            Some(mut s) => {
                stop_producer(&mut s);
                if fail {
                    return Err(CaptureError::StreamFailure("close refused".to_string()));
                }
                Ok(())
            }
            None => Err(CaptureError::StreamFailure(format!(
                "unknown stream {}",
                stream.0
            ))),
        }
    }
}

fn stop_producer(stream: &mut DummyStream) {
    stream.running.store(false, Ordering::Relaxed);
    if let Some(handle) = stream.thread.take() {
        // The producer may be the caller when a callback closes its own stream.
        if handle.thread().id() != std::thread::current().id() {
            let _ = handle.join();
        }
    }
}

fn produce_frames(
    callback: &SharedCallback,
    running: &AtomicBool,
    size: Size,
    interval: Duration,
    epoch: Instant,
) {
    let mut index = 0u64;
    while running.load(Ordering::Relaxed) {
        let timestamp = epoch.elapsed().as_micros() as u64;
        callback(StreamEvent::Frame(Frame::new(
            test_pattern(size, index),
            timestamp,
        )));
        index += 1;
        std::thread::sleep(interval);
    }
}

/// Gradient background with a bright vertical bar that moves each frame.
pub fn test_pattern(size: Size, index: u64) -> RgbaImage {
    let width = size.width.max(1);
    let height = size.height.max(1);
    let bar_width = (width / 16).max(1);
    let bar_x = ((index * u64::from(bar_width)) % u64::from(width)) as u32;
    RgbaImage::from_fn(width, height, |x, y| {
        if x >= bar_x && x < bar_x + bar_width {
            Rgba([255, 255, 255, 255])
        } else {
            Rgba([
                (x * 255 / width) as u8,
                (y * 255 / height) as u8,
                128,
                255,
            ])
        }
    })
}

struct RegistryState {
    windows: Vec<WindowInfo>,
    watchers: HashMap<WatchToken, Arc<dyn Fn(AppEvent) + Send + Sync>>,
    next_token: u64,
    fail_enumeration: bool,
    list_calls: u32,
    hold_next: bool,
    holding: bool,
    held: usize,
}

/// A fake window registry with a mutable window list.
pub struct DummyWindowRegistry {
    state: Mutex<RegistryState>,
    released: Condvar,
}

impl DummyWindowRegistry {
    /// Create an empty registry (no windows, no watchers).
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                windows: Vec::new(),
                watchers: HashMap::new(),
                next_token: 1,
                fail_enumeration: false,
                list_calls: 0,
                hold_next: false,
                holding: false,
                held: 0,
            }),
            released: Condvar::new(),
        }
    }

    /// Add an on-screen window owned by `app_name`.
    pub fn with_window(self, handle: u64, app_name: &str) -> Self {
        self.add_window(WindowHandle(handle), app_name);
        self
    }

    pub fn add_window(&self, handle: WindowHandle, app_name: &str) {
        self.state
            .lock()
            .windows
            .push(WindowInfo::new(handle, app_name));
    }

    pub fn remove_window(&self, handle: WindowHandle) {
        self.state.lock().windows.retain(|w| w.handle != handle);
    }

    /// Make `list_windows` fail until cleared.
    pub fn set_enumeration_failure(&self, fail: bool) {
        self.state.lock().fail_enumeration = fail;
    }

    /// Deliver an app event to every watcher on the caller's thread.
    pub fn emit(&self, event: AppEvent) {
        let watchers: Vec<_> = self.state.lock().watchers.values().cloned().collect();
        for watcher in watchers {
            watcher(event.clone());
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.state.lock().watchers.len()
    }

    /// Number of `list_windows` calls so far.
    pub fn list_calls(&self) -> u32 {
        self.state.lock().list_calls
    }

    /// Block the next `list_windows` call until [`Self::release_enumeration`].
    pub fn hold_next_enumeration(&self) {
        let mut state = self.state.lock();
        state.hold_next = true;
        state.holding = true;
    }

    pub fn release_enumeration(&self) {
        self.state.lock().holding = false;
        self.released.notify_all();
    }

    /// Number of `list_windows` calls currently blocked by a hold.
    pub fn held_enumerations(&self) -> usize {
        self.state.lock().held
    }
}

impl Default for DummyWindowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowRegistry for DummyWindowRegistry {
    fn list_windows(&self) -> Result<Vec<WindowInfo>> {
        let mut state = self.state.lock();
        if state.hold_next {
            state.hold_next = false;
            state.held += 1;
            while state.holding {
                self.released.wait(&mut state);
            }
            state.held -= 1;
        }
        state.list_calls += 1;
        if state.fail_enumeration {
            return Err(CaptureError::Enumeration(
                "simulated enumeration failure".into(),
            ));
        }
        Ok(state.windows.clone())
    }

    fn watch_app_events(&self, callback: AppEventCallback) -> Result<WatchToken> {
        let mut state = self.state.lock();
        let token = WatchToken(state.next_token);
        state.next_token += 1;
        state.watchers.insert(token, Arc::from(callback));
        Ok(token)
    }

    fn unwatch(&self, token: WatchToken) {
        self.state.lock().watchers.remove(&token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn open(backend: &DummyCaptureBackend, callback: StreamCallback) -> StreamHandle {
        let display = backend.displays().unwrap()[0].clone();
        backend
            .open_stream(
                &display,
                StreamConfig::for_display(&display),
                &CaptureFilter::display_only(display.handle),
                callback,
            )
            .unwrap()
    }

    #[test]
    fn denied_permission_hides_displays() {
        let backend = DummyCaptureBackend::new().with_permission(false);
        assert!(!backend.request_permission().unwrap());
        assert!(backend.displays().unwrap().is_empty());
    }

    #[test]
    fn no_displays_means_no_permission() {
        let backend = DummyCaptureBackend::new().with_displays(vec![]);
        assert!(!backend.request_permission().unwrap());
    }

    #[test]
    fn pushed_frames_reach_callback() {
        let backend = DummyCaptureBackend::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let stream = open(
            &backend,
            Box::new(move |event| {
                if let StreamEvent::Frame(_) = event {
                    count_clone.fetch_add(1, Ordering::Relaxed);
                }
            }),
        );

        assert!(backend.push_test_frame(stream));
        assert!(backend.push_test_frame(stream));
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn closed_stream_rejects_frames() {
        let backend = DummyCaptureBackend::new();
        let stream = open(&backend, Box::new(|_| {}));
        backend.close_stream(stream).unwrap();
        assert!(!backend.push_test_frame(stream));
        assert!(backend.open_streams().is_empty());
    }

    #[test]
    fn timed_producer_stops_on_close() {
        let backend = DummyCaptureBackend::new().with_frame_interval(Duration::from_millis(5));
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let stream = open(
            &backend,
            Box::new(move |_| {
                count_clone.fetch_add(1, Ordering::Relaxed);
            }),
        );
        std::thread::sleep(Duration::from_millis(40));
        backend.close_stream(stream).unwrap();
        let after_close = count.load(Ordering::Relaxed);
        assert!(after_close > 0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::Relaxed), after_close);
    }

    #[test]
    fn fail_stream_delivers_failure_and_closes() {
        let backend = DummyCaptureBackend::new();
        let failed = Arc::new(AtomicBool::new(false));
        let failed_clone = Arc::clone(&failed);
        let stream = open(
            &backend,
            Box::new(move |event| {
                if let StreamEvent::Failed(_) = event {
                    failed_clone.store(true, Ordering::Relaxed);
                }
            }),
        );
        assert!(backend.fail_stream(stream, "display disconnected"));
        assert!(failed.load(Ordering::Relaxed));
        assert!(backend.open_streams().is_empty());
    }

    #[test]
    fn update_filter_is_recorded() {
        let backend = DummyCaptureBackend::new();
        let stream = open(&backend, Box::new(|_| {}));
        let mut filter = CaptureFilter::display_only(DUMMY_DISPLAY);
        filter.excluded.insert(WindowHandle(3));
        backend.update_filter(stream, &filter).unwrap();
        assert_eq!(backend.current_filter(stream), Some(filter.clone()));
        assert_eq!(backend.filter_updates(), vec![filter]);
    }

    #[test]
    fn test_pattern_moves_between_frames() {
        let size = Size::new(64, 8);
        let a = test_pattern(size, 0);
        let b = test_pattern(size, 1);
        assert_eq!(a.dimensions(), (64, 8));
        assert_ne!(a.as_raw(), b.as_raw());
    }

    #[test]
    fn registry_emits_to_watchers_until_unwatched() {
        let registry = DummyWindowRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let token = registry
            .watch_app_events(Box::new(move |_| {
                count_clone.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();

        registry.emit(AppEvent::Launched {
            app_name: "Slack".into(),
        });
        registry.unwatch(token);
        registry.emit(AppEvent::Launched {
            app_name: "Slack".into(),
        });

        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(registry.watcher_count(), 0);
    }

    #[test]
    fn held_enumeration_waits_for_release() {
        let registry = Arc::new(DummyWindowRegistry::new().with_window(1, "Notes"));
        registry.hold_next_enumeration();
        let worker = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.list_windows().map(|w| w.len()))
        };
        while registry.held_enumerations() == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        // Only the next call is held.
        assert_eq!(registry.list_windows().unwrap().len(), 1);
        assert_eq!(registry.held_enumerations(), 1);

        registry.release_enumeration();
        assert_eq!(worker.join().unwrap().unwrap(), 1);
        assert_eq!(registry.held_enumerations(), 0);
        assert_eq!(registry.list_calls(), 2);
    }

    #[test]
    fn registry_enumeration_failure_is_injectable() {
        let registry = DummyWindowRegistry::new().with_window(1, "Notes");
        registry.set_enumeration_failure(true);
        assert!(registry.list_windows().is_err());
        registry.set_enumeration_failure(false);
        assert_eq!(registry.list_windows().unwrap().len(), 1);
        assert_eq!(registry.list_calls(), 2);
    }
}
