//! End-to-end runs of the headless pipeline: simulated capture service and
//! window registry, in-memory preferences and hotkeys, real sink drivers.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::runtime::Handle;

use cloak_lib::app::{Backends, Cloak};
use cloak_lib::capture::backend::{AppEvent, CaptureBackend, WindowRegistry};
use cloak_lib::capture::dummy::{DummyCaptureBackend, DummyWindowRegistry};
use cloak_lib::capture::error::CaptureError;
use cloak_lib::capture::session::SessionState;
use cloak_lib::capture::types::{DisplayHandle, DisplayInfo, Size, WindowHandle};
use cloak_lib::hotkey::backend::HotkeyService;
use cloak_lib::hotkey::dummy::MemoryHotkeyService;
use cloak_lib::hotkey::types::{KeyChord, LogicalAction};
use cloak_lib::preview::sink::SinkKind;
use cloak_lib::privacy::render::Notice;
use cloak_lib::settings::store::{MemoryStore, PreferenceStore};

struct Pipeline {
    capture: Arc<DummyCaptureBackend>,
    windows: Arc<DummyWindowRegistry>,
    hotkeys: Arc<MemoryHotkeyService>,
    app: Cloak,
}

fn pipeline(store: MemoryStore) -> Pipeline {
    let capture = Arc::new(DummyCaptureBackend::new().with_displays(vec![DisplayInfo {
        handle: DisplayHandle(1),
        size: Size::new(160, 90),
    }]));
    let windows = Arc::new(
        DummyWindowRegistry::new()
            .with_window(11, "Slack")
            .with_window(12, "Notes"),
    );
    let hotkeys = Arc::new(MemoryHotkeyService::new());
    let app = Cloak::new(
        Backends {
            capture: Arc::clone(&capture) as Arc<dyn CaptureBackend>,
            windows: Arc::clone(&windows) as Arc<dyn WindowRegistry>,
            hotkeys: Arc::clone(&hotkeys) as Arc<dyn HotkeyService>,
        },
        Arc::new(store) as Arc<dyn PreferenceStore>,
        Handle::current(),
        None,
    );
    Pipeline {
        capture,
        windows,
        hotkeys,
        app,
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

fn privacy_applied(p: &Pipeline, kind: SinkKind) -> Option<bool> {
    p.app
        .sinks
        .get(kind)
        .lock()
        .last_rendered()
        .map(|r| r.privacy_applied)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn privacy_toggle_reaches_every_visible_sink() {
    let p = pipeline(MemoryStore::new());
    p.app.sinks.pip.lock().set_visible(true);
    p.app.session.start().await.unwrap();
    let stream = p.app.session.stream_handle().unwrap();
    assert!(p.capture.push_test_frame(stream));

    assert!(wait_until(|| privacy_applied(&p, SinkKind::Preview) == Some(false)).await);
    assert!(wait_until(|| privacy_applied(&p, SinkKind::Pip) == Some(false)).await);

    assert!(p.hotkeys.press(LogicalAction::TogglePrivacy.default_chord()));
    for kind in SinkKind::ALL {
        assert!(
            wait_until(|| privacy_applied(&p, kind) == Some(true)).await,
            "{kind:?} never rendered with privacy"
        );
    }
    assert_eq!(p.app.sinks.hud.lock().caption(), Some("Privacy ON"));

    // The captured pixels themselves are untouched.
    let frame = p.app.bus.current_frame().unwrap();
    let preview = p.app.sinks.preview.lock().last_rendered().cloned().unwrap();
    assert_ne!(*frame.image, *preview.image);

    p.app.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hud_hides_itself_after_privacy_toggle() {
    let p = pipeline(MemoryStore::new());
    p.hotkeys.press(LogicalAction::TogglePrivacy.default_chord());
    assert!(p.app.sinks.hud.lock().is_visible());

    tokio::time::sleep(Duration::from_millis(1700)).await;
    assert!(wait_until(|| !p.app.sinks.hud.lock().is_visible()).await);
    p.app.shutdown().await;
}

#[tokio::test]
async fn second_start_is_already_active() {
    let p = pipeline(MemoryStore::new());
    p.app.session.start().await.unwrap();
    assert_eq!(
        p.app.session.start().await,
        Err(CaptureError::AlreadyActive)
    );
    assert_eq!(p.capture.streams_opened(), 1);
    assert_eq!(p.app.session.state(), SessionState::Streaming);
    p.app.shutdown().await;
}

#[tokio::test]
async fn unregistered_chord_changes_nothing() {
    let p = pipeline(MemoryStore::new());
    let stray: KeyChord = "Cmd+Shift+Z".parse().unwrap();
    assert!(!p.hotkeys.press(stray));
    assert_eq!(p.app.hotkeys.trigger(stray), None);
    assert!(!p.app.bus.current_config().enabled);
    assert!(!p.app.sinks.hud.lock().is_visible());
    p.app.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_failure_falls_back_to_placeholder() {
    let p = pipeline(MemoryStore::new());
    p.app.session.start().await.unwrap();
    let stream = p.app.session.stream_handle().unwrap();
    p.capture.push_test_frame(stream);
    let live_frame_shown = || {
        p.app
            .sinks
            .preview
            .lock()
            .last_rendered()
            .is_some_and(|r| r.notice.is_none())
    };
    assert!(wait_until(live_frame_shown).await);

    p.capture.fail_stream(stream, "display asleep");
    assert_eq!(
        p.app.session.state(),
        SessionState::Failed("display asleep".into())
    );
    assert!(p.app.bus.current_frame().is_none());
    assert!(!p.app.status.snapshot().capturing);

    let notice_shown = || {
        p.app
            .sinks
            .preview
            .lock()
            .last_rendered()
            .is_some_and(|r| r.notice == Some(Notice::WaitingForCapture))
    };
    assert!(wait_until(notice_shown).await);
    assert!(!p.app.resolver.is_watching());
    p.app.shutdown().await;
}

#[tokio::test]
async fn stop_during_pending_refresh_discards_rebuild() {
    let p = pipeline(
        MemoryStore::new()
            .with("excludedApps", json!(["slack"]))
            .with("exclusionDebounceMs", json!(50)),
    );
    p.app.session.start().await.unwrap();
    let stream = p.app.session.stream_handle().unwrap();
    assert!(p
        .capture
        .current_filter(stream)
        .unwrap()
        .excluded
        .contains(&WindowHandle(11)));

    p.windows.add_window(WindowHandle(13), "Slack Helper");
    p.windows.emit(AppEvent::Launched {
        app_name: "Slack Helper".to_string(),
    });
    p.app.session.stop().unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(p.capture.filter_updates().is_empty());
    assert_eq!(p.windows.watcher_count(), 0);
    assert_eq!(p.app.session.state(), SessionState::Idle);
    p.app.shutdown().await;
}

#[tokio::test]
async fn launched_app_is_excluded_while_streaming() {
    let p = pipeline(
        MemoryStore::new()
            .with("excludedApps", json!(["slack"]))
            .with("exclusionDebounceMs", json!(20)),
    );
    p.app.session.start().await.unwrap();
    let stream = p.app.session.stream_handle().unwrap();

    p.windows.add_window(WindowHandle(13), "Slack Helper");
    p.windows.emit(AppEvent::Launched {
        app_name: "Slack Helper".to_string(),
    });

    let excluded = || {
        p.capture
            .current_filter(stream)
            .is_some_and(|f| f.excluded.contains(&WindowHandle(13)))
    };
    assert!(wait_until(excluded).await);
    assert_eq!(p.capture.streams_opened(), 1);
    p.app.shutdown().await;
}
