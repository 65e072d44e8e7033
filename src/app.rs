use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capture::backend::{CaptureBackend, WindowRegistry};
use crate::capture::dummy::{DummyCaptureBackend, DummyWindowRegistry};
use crate::capture::error::{CaptureError, Result as CaptureResult};
use crate::capture::exclusion::{ExclusionConfig, ExclusionResolver};
use crate::capture::session::{CaptureSession, SessionObserver, SessionState};
use crate::hotkey::backend::HotkeyService;
use crate::hotkey::dispatcher::{HotkeyDispatcher, HotkeyObserver};
use crate::hotkey::dummy::MemoryHotkeyService;
use crate::hotkey::error::Result as HotkeyResult;
use crate::hotkey::types::{KeyChord, LogicalAction};
use crate::preview::bus::FrameBus;
use crate::preview::sink::{spawn_sink_driver, PaintCallback, Sinks};
use crate::privacy::config::{load_custom_image, PrivacyConfig, PrivacyMode};
use crate::privacy::error::Result as PrivacyResult;
use crate::privacy::render::OverlayRenderer;
use crate::settings::store::PreferenceStore;
use crate::settings::types::{
    self, write_hotkey, Preferences, KEY_BLUR_RADIUS, KEY_CUSTOM_IMAGE_PATH, KEY_PRIVACY_MODE,
};
use crate::status::StatusIndicator;

/// How long the HUD stays up after a privacy toggle.
pub const HUD_DURATION: Duration = Duration::from_millis(1500);

/// Frame interval of the simulated capture service in headless runs.
const DUMMY_FRAME_INTERVAL: Duration = Duration::from_millis(33);

/// OS collaborators the core is built on.
pub struct Backends {
    pub capture: Arc<dyn CaptureBackend>,
    pub windows: Arc<dyn WindowRegistry>,
    pub hotkeys: Arc<dyn HotkeyService>,
}

/// Create the backends for the current platform.
///
/// On macOS this is ScreenCaptureKit, a polling window registry over `xcap`
/// and the system hotkey API. Other platforms get a capture service with no
/// displays. When `DUMMY_CAPTURE=1` is set, a simulated capture service and
/// window registry are used instead.
pub fn create_backends() -> Backends {
    if DummyCaptureBackend::is_enabled() {
        return Backends {
            capture: Arc::new(DummyCaptureBackend::new().with_frame_interval(DUMMY_FRAME_INTERVAL)),
            windows: Arc::new(
                DummyWindowRegistry::new()
                    .with_window(101, "Slack")
                    .with_window(102, "Mail")
                    .with_window(103, "Notes"),
            ),
            hotkeys: Arc::new(MemoryHotkeyService::new()),
        };
    }
    platform_backends()
}

#[cfg(target_os = "macos")]
fn platform_backends() -> Backends {
    use crate::capture::macos::{ScreenCaptureKitBackend, XcapWindowSource};
    use crate::capture::polling::PollingWindowRegistry;
    use crate::hotkey::global::GlobalHotkeyService;

    let hotkeys: Arc<dyn HotkeyService> = match GlobalHotkeyService::start() {
        Ok(service) => Arc::new(service),
        Err(e) => {
            tracing::warn!("{e}; hotkeys stay unbound");
            Arc::new(MemoryHotkeyService::new())
        }
    };
    Backends {
        capture: Arc::new(ScreenCaptureKitBackend::new()),
        windows: Arc::new(PollingWindowRegistry::new(XcapWindowSource)),
        hotkeys,
    }
}

#[cfg(not(target_os = "macos"))]
fn platform_backends() -> Backends {
    Backends {
        capture: Arc::new(null::NullCaptureBackend),
        windows: Arc::new(null::NullWindowRegistry),
        hotkeys: Arc::new(MemoryHotkeyService::new()),
    }
}

#[cfg(not(target_os = "macos"))]
mod null {
    use crate::capture::backend::{
        AppEventCallback, CaptureBackend, StreamCallback, WatchToken, WindowRegistry,
    };
    use crate::capture::error::{CaptureError, Result as CaptureResult};
    use crate::capture::types::{
        CaptureFilter, DisplayInfo, StreamConfig, StreamHandle, WindowInfo,
    };

    /// Capture service used on platforms without a native backend. Reports no
    /// capturable displays, so every start is refused with remediation.
    pub(super) struct NullCaptureBackend;

    impl CaptureBackend for NullCaptureBackend {
        fn request_permission(&self) -> CaptureResult<bool> {
            Ok(false)
        }

        fn displays(&self) -> CaptureResult<Vec<DisplayInfo>> {
            Ok(vec![])
        }

        fn open_stream(
            &self,
            _display: &DisplayInfo,
            _config: StreamConfig,
            _filter: &CaptureFilter,
            _callback: StreamCallback,
        ) -> CaptureResult<StreamHandle> {
            Err(CaptureError::StreamFailure("no capture backend".to_string()))
        }

        fn update_filter(&self, _stream: StreamHandle, _filter: &CaptureFilter) -> CaptureResult<()> {
            Err(CaptureError::FilterRebuild("no capture backend".to_string()))
        }

        fn close_stream(&self, _stream: StreamHandle) -> CaptureResult<()> {
            Ok(())
        }
    }

    pub(super) struct NullWindowRegistry;

    impl WindowRegistry for NullWindowRegistry {
        fn list_windows(&self) -> CaptureResult<Vec<WindowInfo>> {
            Ok(vec![])
        }

        fn watch_app_events(&self, _callback: AppEventCallback) -> CaptureResult<WatchToken> {
            Ok(WatchToken(0))
        }

        fn unwatch(&self, _token: WatchToken) {}
    }
}

/// Log a capture error together with its remediation, if any.
pub fn report_capture_error(error: &CaptureError) {
    match (error, error.remediation()) {
        (CaptureError::Cancelled, _) => tracing::debug!("{error}"),
        (_, Some(remediation)) => tracing::warn!("{error}\n\n{remediation}"),
        (_, None) => tracing::warn!("{error}"),
    }
}

/// Start, stop or recover the session depending on its state.
pub async fn toggle_capture(session: &Arc<CaptureSession>) -> CaptureResult<()> {
    match session.state() {
        SessionState::Idle => session.start().await,
        SessionState::Streaming | SessionState::BuildingFilter => session.stop(),
        SessionState::Failed(_) => {
            session.reset()?;
            session.start().await
        }
        state => {
            tracing::debug!("Ignoring capture toggle while {state}");
            Ok(())
        }
    }
}

/// The single production hotkey subscriber, and the entry point for
/// settings changes.
pub struct Controller {
    session: Arc<CaptureSession>,
    bus: Arc<FrameBus>,
    sinks: Arc<Sinks>,
    status: Arc<StatusIndicator>,
    store: Arc<dyn PreferenceStore>,
    runtime: Handle,
}

impl Controller {
    /// Flip privacy on or off and flash the HUD. Returns the new state.
    pub fn toggle_privacy(&self) -> bool {
        let enabled = self.bus.update_config(|c| c.enabled = !c.enabled).enabled;
        self.status.set_privacy_enabled(enabled);
        let caption = if enabled { "Privacy ON" } else { "Privacy OFF" };
        self.sinks
            .hud
            .lock()
            .show_for(caption, HUD_DURATION, Instant::now());
        tracing::info!("{caption}");
        enabled
    }

    pub fn toggle_pip(&self) -> bool {
        let visible = self.sinks.pip.lock().toggle_visible();
        tracing::debug!("PiP {}", if visible { "shown" } else { "hidden" });
        visible
    }

    pub fn toggle_fullscreen(&self) -> bool {
        self.sinks.preview.lock().toggle_fullscreen()
    }

    pub async fn toggle_capture(&self) -> CaptureResult<()> {
        toggle_capture(&self.session).await
    }

    pub fn set_privacy_mode(&self, mode: PrivacyMode) {
        self.bus.update_config(|c| c.mode = mode);
        types::write(self.store.as_ref(), KEY_PRIVACY_MODE, &mode);
    }

    /// Set the blur radius; out-of-range values are clamped before storing.
    pub fn set_blur_radius(&self, radius: f32) -> f32 {
        let radius = self.bus.update_config(|c| c.set_blur_radius(radius)).blur_radius();
        types::write(self.store.as_ref(), KEY_BLUR_RADIUS, &radius);
        radius
    }

    /// Decode `path` and use it as the privacy image. The previous image is
    /// kept if decoding fails.
    pub fn set_custom_image(&self, path: &Path) -> PrivacyResult<()> {
        let image = Arc::new(load_custom_image(path)?);
        self.bus.update_config(|c| c.custom_image = Some(image));
        types::write(self.store.as_ref(), KEY_CUSTOM_IMAGE_PATH, &path);
        tracing::info!("Custom privacy image set to {}", path.display());
        Ok(())
    }

    pub async fn set_excluded_apps(&self, patterns: Vec<String>) -> CaptureResult<()> {
        let mut config = (*self.session.exclusion_config()).clone();
        config.excluded_app_name_patterns = patterns;
        self.apply_exclusion(config).await
    }

    pub async fn set_self_hiding(&self, enabled: bool) -> CaptureResult<()> {
        let mut config = (*self.session.exclusion_config()).clone();
        config.self_hiding_enabled = enabled;
        self.apply_exclusion(config).await
    }

    /// Apply to the live stream when streaming; otherwise store for the
    /// next start.
    async fn apply_exclusion(&self, config: ExclusionConfig) -> CaptureResult<()> {
        match self.session.update_exclusion(config.clone()).await {
            Err(CaptureError::InvalidState { .. }) => {
                self.session.set_exclusion_config(config);
                Ok(())
            }
            other => other,
        }
    }
}

impl HotkeyObserver for Controller {
    fn on_action(&self, action: LogicalAction) {
        match action {
            LogicalAction::TogglePrivacy => {
                self.toggle_privacy();
            }
            LogicalAction::ToggleCapture => {
                let session = Arc::clone(&self.session);
                self.runtime.spawn(async move {
                    if let Err(e) = toggle_capture(&session).await {
                        report_capture_error(&e);
                    }
                });
            }
            LogicalAction::TogglePip => {
                self.toggle_pip();
            }
            LogicalAction::ToggleFullscreen => {
                self.toggle_fullscreen();
            }
        }
    }
}

/// The assembled application core.
pub struct Cloak {
    pub store: Arc<dyn PreferenceStore>,
    pub bus: Arc<FrameBus>,
    pub renderer: Arc<OverlayRenderer>,
    pub sinks: Arc<Sinks>,
    pub resolver: Arc<ExclusionResolver>,
    pub session: Arc<CaptureSession>,
    pub hotkeys: Arc<HotkeyDispatcher>,
    pub status: Arc<StatusIndicator>,
    pub controller: Arc<Controller>,
    cancel: CancellationToken,
    drivers: Vec<JoinHandle<()>>,
}

impl Cloak {
    /// Wire every component from the stored preferences and start the sink
    /// drivers on `runtime`.
    pub fn new(
        backends: Backends,
        store: Arc<dyn PreferenceStore>,
        runtime: Handle,
        on_paint: Option<PaintCallback>,
    ) -> Self {
        let prefs = Preferences::load(store.as_ref());

        let bus = Arc::new(FrameBus::new(PrivacyConfig::from_preferences(&prefs)));
        let renderer = Arc::new(OverlayRenderer::new());
        let sinks = Arc::new(Sinks::default());

        let exclusion = ExclusionConfig {
            own_window_handles: sinks.own_windows(),
            excluded_app_name_patterns: prefs.excluded_apps.clone(),
            self_hiding_enabled: prefs.self_hiding,
        };
        let resolver = Arc::new(ExclusionResolver::new(
            Arc::clone(&backends.windows),
            prefs.exclusion_debounce,
        ));
        let session = CaptureSession::new(
            Arc::clone(&backends.capture),
            Arc::clone(&resolver),
            Arc::clone(&bus),
            Arc::clone(&store),
            exclusion,
        );

        let hotkeys = HotkeyDispatcher::new(Arc::clone(&backends.hotkeys));
        for (action, e) in hotkeys.load_bindings(store.as_ref()) {
            tracing::warn!("Hotkey for {} unavailable: {e}", action.label());
        }

        let status = Arc::new(StatusIndicator::new(
            false,
            hotkeys.binding(LogicalAction::TogglePrivacy),
        ));
        session.subscribe(Arc::clone(&status) as Arc<dyn SessionObserver>);

        let controller = Arc::new(Controller {
            session: Arc::clone(&session),
            bus: Arc::clone(&bus),
            sinks: Arc::clone(&sinks),
            status: Arc::clone(&status),
            store: Arc::clone(&store),
            runtime: runtime.clone(),
        });
        hotkeys.subscribe(Arc::clone(&controller) as Arc<dyn HotkeyObserver>);

        let cancel = CancellationToken::new();
        let drivers = {
            let _guard = runtime.enter();
            [&sinks.preview, &sinks.pip, &sinks.hud]
                .into_iter()
                .map(|sink| {
                    spawn_sink_driver(
                        Arc::clone(sink),
                        Arc::clone(&bus),
                        Arc::clone(&renderer),
                        cancel.child_token(),
                        on_paint.clone(),
                    )
                })
                .collect()
        };

        tracing::info!(
            "Cloak ready: privacy mode {}, {} excluded app pattern(s)",
            prefs.privacy_mode.label(),
            prefs.excluded_apps.len()
        );

        Self {
            store,
            bus,
            renderer,
            sinks,
            resolver,
            session,
            hotkeys,
            status,
            controller,
            cancel,
            drivers,
        }
    }

    /// Rebind `action`, or unbind it with `None`. The result is persisted
    /// either way; a chord the OS refuses leaves the action unbound.
    pub fn set_hotkey(&self, action: LogicalAction, chord: Option<KeyChord>) -> HotkeyResult<()> {
        let result = match chord {
            Some(chord) => self.hotkeys.bind(action, chord),
            None => {
                self.hotkeys.clear(action);
                Ok(())
            }
        };
        if result.is_ok() {
            write_hotkey(self.store.as_ref(), action, chord);
        }
        if action == LogicalAction::TogglePrivacy {
            self.status.set_privacy_chord(self.hotkeys.binding(action));
        }
        result
    }

    /// Stop capturing and wait for the sink drivers to exit.
    pub async fn shutdown(self) {
        if self.session.state().is_capturing() {
            if let Err(e) = self.session.stop() {
                report_capture_error(&e);
            }
        }
        self.cancel.cancel();
        for driver in self.drivers {
            if let Err(e) = driver.await {
                tracing::warn!("Sink driver ended abnormally: {e}");
            }
        }
        tracing::info!("Cloak shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::types::WindowHandle;
    use crate::hotkey::error::HotkeyError;
    use crate::preview::sink::SinkKind;
    use crate::settings::store::MemoryStore;
    use crate::settings::types::{read, read_hotkey, StoredBinding, KEY_EXCLUDED_APPS};
    use image::{Rgba, RgbaImage};
    use serde_json::json;

    struct Harness {
        capture: Arc<DummyCaptureBackend>,
        hotkeys: Arc<MemoryHotkeyService>,
        store: Arc<MemoryStore>,
        app: Cloak,
    }

    fn harness_with(store: MemoryStore) -> Harness {
        let capture = Arc::new(DummyCaptureBackend::new());
        let windows = Arc::new(DummyWindowRegistry::new().with_window(7, "Slack"));
        let hotkeys = Arc::new(MemoryHotkeyService::new());
        let store = Arc::new(store);
        let app = Cloak::new(
            Backends {
                capture: Arc::clone(&capture) as Arc<dyn CaptureBackend>,
                windows: windows as Arc<dyn WindowRegistry>,
                hotkeys: Arc::clone(&hotkeys) as Arc<dyn HotkeyService>,
            },
            Arc::clone(&store) as Arc<dyn PreferenceStore>,
            Handle::current(),
            None,
        );
        Harness {
            capture,
            hotkeys,
            store,
            app,
        }
    }

    fn harness() -> Harness {
        harness_with(MemoryStore::new())
    }

    #[tokio::test]
    async fn default_hotkeys_are_registered() {
        let h = harness();
        assert_eq!(h.hotkeys.registrations().len(), LogicalAction::ALL.len());
        assert_eq!(
            h.app.status.snapshot().privacy_chord.as_deref(),
            Some("Cmd+Alt+H")
        );
        h.app.shutdown().await;
    }

    #[tokio::test]
    async fn privacy_hotkey_toggles_config_status_and_hud() {
        let h = harness();
        let chord = LogicalAction::TogglePrivacy.default_chord();

        assert!(h.hotkeys.press(chord));
        assert!(h.app.bus.current_config().enabled);
        assert!(h.app.status.snapshot().privacy_enabled);
        {
            let hud = h.app.sinks.hud.lock();
            assert!(hud.is_visible());
            assert_eq!(hud.caption(), Some("Privacy ON"));
        }

        assert!(h.hotkeys.press(chord));
        assert!(!h.app.bus.current_config().enabled);
        assert_eq!(h.app.sinks.hud.lock().caption(), Some("Privacy OFF"));
        h.app.shutdown().await;
    }

    #[tokio::test]
    async fn pip_and_fullscreen_hotkeys() {
        let h = harness();
        assert!(!h.app.sinks.get(SinkKind::Pip).lock().is_visible());
        h.hotkeys.press(LogicalAction::TogglePip.default_chord());
        assert!(h.app.sinks.get(SinkKind::Pip).lock().is_visible());

        h.hotkeys.press(LogicalAction::ToggleFullscreen.default_chord());
        assert!(h.app.sinks.preview.lock().is_fullscreen());
        h.app.shutdown().await;
    }

    #[tokio::test]
    async fn toggle_capture_starts_and_stops() {
        let h = harness();
        h.app.controller.toggle_capture().await.unwrap();
        assert_eq!(h.app.session.state(), SessionState::Streaming);
        assert!(h.app.status.snapshot().capturing);

        h.app.controller.toggle_capture().await.unwrap();
        assert_eq!(h.app.session.state(), SessionState::Idle);
        assert!(!h.app.status.snapshot().capturing);
        h.app.shutdown().await;
    }

    #[tokio::test]
    async fn toggle_capture_recovers_from_failure() {
        let h = harness();
        h.app.controller.toggle_capture().await.unwrap();
        let stream = h.app.session.stream_handle().unwrap();
        h.capture.fail_stream(stream, "display disconnected");
        assert!(matches!(h.app.session.state(), SessionState::Failed(_)));

        h.app.controller.toggle_capture().await.unwrap();
        assert_eq!(h.app.session.state(), SessionState::Streaming);
        assert_eq!(h.capture.streams_opened(), 2);
        h.app.shutdown().await;
    }

    #[tokio::test]
    async fn privacy_settings_are_persisted() {
        let h = harness();
        h.app.controller.set_privacy_mode(PrivacyMode::Black);
        assert_eq!(h.app.bus.current_config().mode, PrivacyMode::Black);
        assert_eq!(h.store.get(KEY_PRIVACY_MODE), Some(json!("Black Screen")));

        assert_eq!(h.app.controller.set_blur_radius(500.0), 100.0);
        assert_eq!(h.app.bus.current_config().blur_radius(), 100.0);
        assert_eq!(h.store.get(KEY_BLUR_RADIUS), Some(json!(100.0)));
        h.app.shutdown().await;
    }

    #[tokio::test]
    async fn custom_image_is_loaded_and_path_persisted() {
        let h = harness();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("away.png");
        RgbaImage::from_pixel(8, 4, Rgba([0, 200, 0, 255]))
            .save(&path)
            .unwrap();

        h.app.controller.set_custom_image(&path).unwrap();
        let config = h.app.bus.current_config();
        assert_eq!(config.custom_image.as_ref().map(|i| i.dimensions()), Some((8, 4)));
        let stored: Option<std::path::PathBuf> = read(h.store.as_ref(), KEY_CUSTOM_IMAGE_PATH);
        assert_eq!(stored, Some(path));

        assert!(h.app.controller.set_custom_image(&dir.path().join("missing.png")).is_err());
        assert!(h.app.bus.current_config().custom_image.is_some());
        h.app.shutdown().await;
    }

    #[tokio::test]
    async fn excluded_apps_apply_live_and_persist() {
        let h = harness();
        h.app.session.start().await.unwrap();
        let stream = h.app.session.stream_handle().unwrap();
        let slack = WindowHandle(7);
        assert!(!h.capture.current_filter(stream).unwrap().excluded.contains(&slack));

        h.app
            .controller
            .set_excluded_apps(vec!["slack".to_string()])
            .await
            .unwrap();
        assert!(h.capture.current_filter(stream).unwrap().excluded.contains(&slack));
        assert_eq!(h.store.get(KEY_EXCLUDED_APPS), Some(json!(["slack"])));
        h.app.shutdown().await;
    }

    #[tokio::test]
    async fn exclusion_changes_while_idle_apply_on_next_start() {
        let h = harness();
        h.app.controller.set_self_hiding(false).await.unwrap();
        assert!(!h.app.session.exclusion_config().self_hiding_enabled);
        h.app.session.start().await.unwrap();
        let stream = h.app.session.stream_handle().unwrap();
        assert!(h.capture.current_filter(stream).unwrap().excluded.is_empty());
        h.app.shutdown().await;
    }

    #[tokio::test]
    async fn persisted_bindings_override_defaults() {
        let h = harness_with(
            MemoryStore::new().with("hotkeys.toggle-privacy", json!("Cmd+Shift+P")),
        );
        assert_eq!(
            h.app.hotkeys.binding(LogicalAction::TogglePrivacy),
            Some("Cmd+Shift+P".parse().unwrap())
        );
        assert_eq!(
            h.app.status.snapshot().privacy_chord.as_deref(),
            Some("Cmd+Shift+P")
        );
        h.app.shutdown().await;
    }

    #[tokio::test]
    async fn set_hotkey_persists_and_updates_status() {
        let h = harness();
        let chord: KeyChord = "Cmd+Shift+H".parse().unwrap();
        h.app.set_hotkey(LogicalAction::TogglePrivacy, Some(chord)).unwrap();
        assert_eq!(
            read_hotkey(h.store.as_ref(), LogicalAction::TogglePrivacy),
            StoredBinding::Chord(chord)
        );
        assert_eq!(
            h.app.status.snapshot().privacy_chord.as_deref(),
            Some("Cmd+Shift+H")
        );

        h.app.set_hotkey(LogicalAction::TogglePrivacy, None).unwrap();
        assert_eq!(
            read_hotkey(h.store.as_ref(), LogicalAction::TogglePrivacy),
            StoredBinding::Unbound
        );
        assert_eq!(h.app.status.snapshot().privacy_chord, None);
        h.app.shutdown().await;
    }

    #[tokio::test]
    async fn refused_hotkey_is_not_persisted() {
        let h = harness();
        let chord: KeyChord = "Cmd+Space".parse().unwrap();
        h.hotkeys.reserve(chord);
        let err = h
            .app
            .set_hotkey(LogicalAction::TogglePrivacy, Some(chord))
            .unwrap_err();
        assert!(matches!(err, HotkeyError::Registration { .. }));
        assert_eq!(
            read_hotkey(h.store.as_ref(), LogicalAction::TogglePrivacy),
            StoredBinding::Default
        );
        assert_eq!(h.app.status.snapshot().privacy_chord, None);
        h.app.shutdown().await;
    }
}
