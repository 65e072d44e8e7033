use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::capture::backend::{CaptureBackend, StreamCallback};
use crate::capture::error::{CaptureError, Result};
use crate::capture::exclusion::{ExclusionConfig, ExclusionResolver, Resolved};
use crate::capture::types::{
    CaptureFilter, DisplayHandle, DisplayInfo, StreamConfig, StreamEvent, StreamHandle,
};
use crate::preview::bus::FrameBus;
use crate::settings::store::PreferenceStore;
use crate::settings::types::{self, KEY_DISPLAY_ID, KEY_EXCLUDED_APPS, KEY_SELF_HIDING};

/// Lifecycle of a capture session.
///
/// `Idle → RequestingPermission → BuildingFilter → Streaming → Stopping → Idle`,
/// with `Failed` reachable from any non-idle state until [`CaptureSession::reset`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    RequestingPermission,
    BuildingFilter,
    Streaming,
    Stopping,
    Failed(String),
}

impl SessionState {
    pub fn is_capturing(&self) -> bool {
        matches!(self, Self::Streaming)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::RequestingPermission => write!(f, "requesting permission"),
            Self::BuildingFilter => write!(f, "building filter"),
            Self::Streaming => write!(f, "streaming"),
            Self::Stopping => write!(f, "stopping"),
            Self::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// Receives every session state transition, including asynchronous stream
/// failures.
pub trait SessionObserver: Send + Sync {
    fn session_changed(&self, state: &SessionState);
}

struct ActiveStream {
    handle: StreamHandle,
    /// Cleared before the stream closes; late frames are ignored.
    live: Arc<AtomicBool>,
    filter: CaptureFilter,
}

struct Inner {
    state: SessionState,
    display: Option<DisplayHandle>,
    exclusion: Arc<ExclusionConfig>,
    stream: Option<ActiveStream>,
}

/// Owns the capture stream and is the only control surface for sharing.
///
/// Every start attempt and every stop bumps an epoch. Asynchronous work
/// (start-up steps, filter refreshes, stream failures) carries the epoch it
/// was started under and is discarded if the epoch has moved on.
pub struct CaptureSession {
    backend: Arc<dyn CaptureBackend>,
    resolver: Arc<ExclusionResolver>,
    bus: Arc<FrameBus>,
    store: Arc<dyn PreferenceStore>,
    inner: Mutex<Inner>,
    epoch: AtomicU64,
    observers: RwLock<Vec<Arc<dyn SessionObserver>>>,
}

impl CaptureSession {
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        resolver: Arc<ExclusionResolver>,
        bus: Arc<FrameBus>,
        store: Arc<dyn PreferenceStore>,
        exclusion: ExclusionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            resolver,
            bus,
            store,
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                display: None,
                exclusion: Arc::new(exclusion),
                stream: None,
            }),
            epoch: AtomicU64::new(0),
            observers: RwLock::new(Vec::new()),
        })
    }

    pub fn subscribe(&self, observer: Arc<dyn SessionObserver>) {
        self.observers.write().push(observer);
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state.clone()
    }

    pub fn display(&self) -> Option<DisplayHandle> {
        self.inner.lock().display
    }

    pub fn stream_handle(&self) -> Option<StreamHandle> {
        self.inner.lock().stream.as_ref().map(|s| s.handle)
    }

    /// Filter currently applied to the live stream.
    pub fn active_filter(&self) -> Option<CaptureFilter> {
        self.inner.lock().stream.as_ref().map(|s| s.filter.clone())
    }

    pub fn exclusion_config(&self) -> Arc<ExclusionConfig> {
        Arc::clone(&self.inner.lock().exclusion)
    }

    /// Request permission, resolve the filter and open the stream.
    ///
    /// Valid only from `Idle`. Permission and display errors return the
    /// session to `Idle` so a fresh `start()` can follow once the user has
    /// fixed the cause; a stream that fails to open leaves it `Failed`.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let epoch = {
            let mut inner = self.inner.lock();
            match &inner.state {
                SessionState::Idle => {}
                state @ SessionState::Failed(_) => {
                    return Err(CaptureError::InvalidState {
                        operation: "start",
                        state: state.to_string(),
                    })
                }
                _ => return Err(CaptureError::AlreadyActive),
            }
            inner.state = SessionState::RequestingPermission;
            self.epoch.fetch_add(1, Ordering::AcqRel) + 1
        };
        self.notify(&SessionState::RequestingPermission);

        match self.run_start(epoch).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.abort_start(epoch, &e);
                Err(e)
            }
        }
    }

    async fn run_start(self: &Arc<Self>, epoch: u64) -> Result<()> {
        let backend = Arc::clone(&self.backend);
        let granted = run_blocking(move || backend.request_permission()).await?;
        self.ensure_current(epoch)?;
        if !granted {
            return Err(CaptureError::PermissionDenied);
        }

        let backend = Arc::clone(&self.backend);
        let displays = run_blocking(move || backend.displays()).await?;
        self.ensure_current(epoch)?;
        let display = self.choose_display(displays)?;

        {
            let mut inner = self.inner.lock();
            if !self.is_current(epoch) {
                return Err(CaptureError::Cancelled);
            }
            inner.state = SessionState::BuildingFilter;
            inner.display = Some(display.handle);
            self.resolver.retarget(display.handle, Arc::clone(&inner.exclusion));
        }
        self.notify(&SessionState::BuildingFilter);

        let target = display.handle;
        let resolver = Arc::clone(&self.resolver);
        let resolved = run_blocking(move || resolver.rebuild()).await?;
        self.ensure_current(epoch)?;
        let Some(Resolved { filter, .. }) = resolved else {
            return Err(CaptureError::Cancelled);
        };

        self.bus.reset_diagnostics();
        let live = Arc::new(AtomicBool::new(false));
        let callback = self.stream_callback(epoch, Arc::clone(&live));
        let backend = Arc::clone(&self.backend);
        let config = StreamConfig::for_display(&display);
        let open_filter = filter.clone();
        let handle = run_blocking(move || {
            backend.open_stream(&display, config, &open_filter, callback)
        })
        .await?;

        let committed = {
            let mut inner = self.inner.lock();
            if self.is_current(epoch) && inner.state == SessionState::BuildingFilter {
                live.store(true, Ordering::Release);
                inner.state = SessionState::Streaming;
                inner.stream = Some(ActiveStream {
                    handle,
                    live: Arc::clone(&live),
                    filter: filter.clone(),
                });
                true
            } else {
                false
            }
        };
        if !committed {
            tracing::info!("Start superseded; closing stream {}", handle.0);
            if let Err(e) = self.backend.close_stream(handle) {
                tracing::warn!("Failed to close superseded stream: {e}");
            }
            return Err(CaptureError::Cancelled);
        }

        tracing::info!(
            "Capture streaming on {target} with {} window(s) excluded",
            filter.excluded.len()
        );
        self.notify(&SessionState::Streaming);

        let weak = Arc::downgrade(self);
        let refresh = self.resolver.start_live_refresh(move |resolved| {
            if let Some(session) = weak.upgrade() {
                session.apply_filter(epoch, resolved);
            }
        });
        if let Err(e) = refresh {
            tracing::warn!("Exclusion refresh unavailable: {e}");
        }
        // A stop that landed while subscribing already ran its teardown.
        if !self.is_current(epoch) {
            self.resolver.teardown();
        }
        Ok(())
    }

    /// Stop streaming. Valid from `Streaming` or `BuildingFilter`.
    ///
    /// Cancels any in-flight start or refresh, unsubscribes from window
    /// events, closes the stream and clears the bus.
    pub fn stop(&self) -> Result<()> {
        let stream = {
            let mut inner = self.inner.lock();
            match inner.state {
                SessionState::Streaming | SessionState::BuildingFilter => {}
                ref state => {
                    return Err(CaptureError::InvalidState {
                        operation: "stop",
                        state: state.to_string(),
                    })
                }
            }
            inner.state = SessionState::Stopping;
            self.epoch.fetch_add(1, Ordering::AcqRel);
            inner.stream.take()
        };
        self.notify(&SessionState::Stopping);

        self.resolver.teardown();
        if let Some(stream) = stream {
            stream.live.store(false, Ordering::Release);
            if let Err(e) = self.backend.close_stream(stream.handle) {
                tracing::warn!("Failed to close stream {}: {e}", stream.handle.0);
            }
        }
        self.bus.clear_frame();

        {
            let mut inner = self.inner.lock();
            inner.state = SessionState::Idle;
            inner.display = None;
        }
        tracing::info!("Capture stopped");
        self.notify(&SessionState::Idle);
        Ok(())
    }

    /// Leave `Failed` so a new `start()` is possible. No-op when idle.
    pub fn reset(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            match &inner.state {
                SessionState::Failed(_) => {}
                SessionState::Idle => return Ok(()),
                state => {
                    return Err(CaptureError::InvalidState {
                        operation: "reset",
                        state: state.to_string(),
                    })
                }
            }
            inner.state = SessionState::Idle;
        }
        self.notify(&SessionState::Idle);
        Ok(())
    }

    /// Replace the exclusion configuration while idle. Persisted.
    pub fn set_exclusion_config(&self, config: ExclusionConfig) {
        self.persist_exclusion(&config);
        self.inner.lock().exclusion = Arc::new(config);
    }

    /// Replace the exclusion configuration of a streaming session and apply
    /// the rebuilt filter without interrupting delivery.
    ///
    /// A failed rebuild is logged and the previous filter stays active. Any
    /// refresh still resolving the previous configuration is discarded.
    pub async fn update_exclusion(&self, config: ExclusionConfig) -> Result<()> {
        let config = Arc::new(config);
        let epoch = {
            let mut inner = self.inner.lock();
            let display = match (&inner.state, inner.display) {
                (SessionState::Streaming, Some(display)) => display,
                (state, _) => {
                    return Err(CaptureError::InvalidState {
                        operation: "update exclusion",
                        state: state.to_string(),
                    })
                }
            };
            inner.exclusion = Arc::clone(&config);
            // Stop tears the resolver down only after leaving Streaming.
            self.resolver.retarget(display, Arc::clone(&config));
            self.epoch.load(Ordering::Acquire)
        };
        self.persist_exclusion(&config);

        let resolver = Arc::clone(&self.resolver);
        match run_blocking(move || resolver.rebuild()).await {
            Ok(Some(resolved)) => self.apply_filter(epoch, resolved),
            Ok(None) => {}
            Err(e) => tracing::warn!("Exclusion rebuild failed, keeping previous filter: {e}"),
        }
        Ok(())
    }

    /// Swap a rebuilt filter into the live stream if the session that
    /// requested it is still streaming and nothing has retargeted since.
    fn apply_filter(&self, epoch: u64, resolved: Resolved) {
        let mut inner = self.inner.lock();
        if !self.is_current(epoch) || inner.state != SessionState::Streaming {
            tracing::debug!("Discarding filter rebuilt for a stopped session");
            return;
        }
        if !self.resolver.is_current(resolved.generation) {
            tracing::debug!("Discarding filter rebuilt from superseded exclusion settings");
            return;
        }
        let filter = resolved.filter;
        let Some(stream) = inner.stream.as_mut() else {
            return;
        };
        if stream.filter == filter {
            return;
        }
        match self.backend.update_filter(stream.handle, &filter) {
            Ok(()) => {
                tracing::info!("Capture filter updated: {} window(s) excluded", filter.excluded.len());
                stream.filter = filter;
            }
            Err(e) => tracing::warn!("Failed to apply capture filter, keeping previous: {e}"),
        }
    }

    fn stream_callback(
        self: &Arc<Self>,
        epoch: u64,
        live: Arc<AtomicBool>,
    ) -> StreamCallback {
        let bus = Arc::clone(&self.bus);
        let session: Weak<Self> = Arc::downgrade(self);
        Box::new(move |event| match event {
            StreamEvent::Frame(frame) => {
                if live.load(Ordering::Acquire) {
                    bus.publish(frame);
                }
            }
            StreamEvent::Failed(reason) => {
                live.store(false, Ordering::Release);
                if let Some(session) = session.upgrade() {
                    session.handle_stream_failure(epoch, reason);
                }
            }
        })
    }

    fn handle_stream_failure(&self, epoch: u64, reason: String) {
        let state = {
            let mut inner = self.inner.lock();
            let active = matches!(
                inner.state,
                SessionState::Streaming | SessionState::BuildingFilter
            );
            if !self.is_current(epoch) || !active {
                return;
            }
            inner.stream = None;
            inner.state = SessionState::Failed(reason.clone());
            inner.state.clone()
        };
        tracing::error!("Capture stream failed: {reason}");
        self.resolver.teardown();
        self.bus.clear_frame();
        self.notify(&state);
    }

    fn abort_start(&self, epoch: u64, error: &CaptureError) {
        let state = {
            let mut inner = self.inner.lock();
            let starting = matches!(
                inner.state,
                SessionState::RequestingPermission | SessionState::BuildingFilter
            );
            if !self.is_current(epoch) || !starting {
                return;
            }
            inner.display = None;
            inner.state = match error {
                CaptureError::StreamFailure(reason) => SessionState::Failed(reason.clone()),
                _ => SessionState::Idle,
            };
            inner.state.clone()
        };
        if error.is_fatal_for_attempt() {
            tracing::warn!("Capture start refused: {error}");
        } else {
            tracing::error!("Capture start failed: {error}");
        }
        self.resolver.teardown();
        self.notify(&state);
    }

    fn choose_display(&self, displays: Vec<DisplayInfo>) -> Result<DisplayInfo> {
        let preferred: Option<DisplayHandle> = types::read(self.store.as_ref(), KEY_DISPLAY_ID);
        if let Some(wanted) = preferred {
            if let Some(display) = displays.iter().find(|d| d.handle == wanted) {
                return Ok(display.clone());
            }
            tracing::warn!("Preferred {wanted} not available, using first display");
        }
        displays
            .into_iter()
            .next()
            .ok_or(CaptureError::NoDisplayAvailable)
    }

    fn persist_exclusion(&self, config: &ExclusionConfig) {
        let store = self.store.as_ref();
        types::write(store, KEY_EXCLUDED_APPS, &config.excluded_app_name_patterns);
        types::write(store, KEY_SELF_HIDING, &config.self_hiding_enabled);
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::Acquire) == epoch
    }

    fn ensure_current(&self, epoch: u64) -> Result<()> {
        if self.is_current(epoch) {
            Ok(())
        } else {
            Err(CaptureError::Cancelled)
        }
    }

    fn notify(&self, state: &SessionState) {
        let observers: Vec<_> = self.observers.read().iter().cloned().collect();
        for observer in observers {
            observer.session_changed(state);
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Some(stream) = self.inner.get_mut().stream.take() {
            stream.live.store(false, Ordering::Release);
            if let Err(e) = self.backend.close_stream(stream.handle) {
                tracing::warn!("Failed to close stream {} on drop: {e}", stream.handle.0);
            }
        }
    }
}

/// Run a blocking capture-service call off the async workers.
async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CaptureError::Task(e.to_string()))?
}
