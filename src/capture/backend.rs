use crate::capture::error::Result;
use crate::capture::types::{
    CaptureFilter, DisplayInfo, StreamConfig, StreamEvent, StreamHandle, WindowInfo,
};

/// Callback receiving stream events on the capture service's delivery thread.
///
/// Must return quickly: it runs on the delivery context and must never block
/// on rendering.
pub type StreamCallback = Box<dyn Fn(StreamEvent) + Send + Sync>;

/// Callback receiving application lifecycle notifications.
pub type AppEventCallback = Box<dyn Fn(AppEvent) + Send + Sync>;

/// Platform-agnostic screen capture service.
///
/// Implemented per-platform (ScreenCaptureKit on macOS). Provides permission
/// checks, display enumeration and a filtered frame stream.
pub trait CaptureBackend: Send + Sync {
    /// Ask the OS for capture permission. `Ok(false)` means denied.
    fn request_permission(&self) -> Result<bool>;

    /// List the displays that can currently be captured.
    fn displays(&self) -> Result<Vec<DisplayInfo>>;

    /// Open a stream on `display` that excludes the windows in `filter`.
    ///
    /// Events arrive on the backend's delivery thread in non-decreasing
    /// timestamp order.
    fn open_stream(
        &self,
        display: &DisplayInfo,
        config: StreamConfig,
        filter: &CaptureFilter,
        callback: StreamCallback,
    ) -> Result<StreamHandle>;

    /// Replace the filter of a running stream without interrupting delivery.
    fn update_filter(&self, stream: StreamHandle, filter: &CaptureFilter) -> Result<()>;

    /// Close a stream. No events are delivered after this returns.
    fn close_stream(&self, stream: StreamHandle) -> Result<()>;
}

/// Application lifecycle notification from the window registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    Launched { app_name: String },
    Activated { app_name: String },
    Unhidden { app_name: String },
}

impl AppEvent {
    pub fn app_name(&self) -> &str {
        match self {
            Self::Launched { app_name }
            | Self::Activated { app_name }
            | Self::Unhidden { app_name } => app_name,
        }
    }
}

/// Subscription token returned by [`WindowRegistry::watch_app_events`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchToken(pub u64);

/// OS window registry: on-screen windows plus app lifecycle notifications.
pub trait WindowRegistry: Send + Sync {
    /// Enumerate the windows currently on screen.
    fn list_windows(&self) -> Result<Vec<WindowInfo>>;

    /// Subscribe to app launch / activate / unhide notifications.
    fn watch_app_events(&self, callback: AppEventCallback) -> Result<WatchToken>;

    /// Drop a subscription. Unknown tokens are ignored.
    fn unwatch(&self, token: WatchToken);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::error::CaptureError;
    use crate::capture::types::{DisplayHandle, Size, WindowHandle};

    /// Mock backend for testing the trait contract.
    struct MockBackend {
        displays: Vec<DisplayInfo>,
    }

    impl CaptureBackend for MockBackend {
        fn request_permission(&self) -> Result<bool> {
            Ok(!self.displays.is_empty())
        }

        fn displays(&self) -> Result<Vec<DisplayInfo>> {
            Ok(self.displays.clone())
        }

        fn open_stream(
            &self,
            _display: &DisplayInfo,
            _config: StreamConfig,
            _filter: &CaptureFilter,
            _callback: StreamCallback,
        ) -> Result<StreamHandle> {
            Ok(StreamHandle(1))
        }

        fn update_filter(&self, _stream: StreamHandle, _filter: &CaptureFilter) -> Result<()> {
            Ok(())
        }

        fn close_stream(&self, stream: StreamHandle) -> Result<()> {
            if stream == StreamHandle(1) {
                Ok(())
            } else {
                Err(CaptureError::StreamFailure("unknown stream".into()))
            }
        }
    }

    struct MockRegistry;

    impl WindowRegistry for MockRegistry {
        fn list_windows(&self) -> Result<Vec<WindowInfo>> {
            Ok(vec![WindowInfo::new(WindowHandle(1), "Notes")])
        }

        fn watch_app_events(&self, _callback: AppEventCallback) -> Result<WatchToken> {
            Ok(WatchToken(1))
        }

        fn unwatch(&self, _token: WatchToken) {}
    }

    #[test]
    fn mock_backend_permission_follows_displays() {
        let backend = MockBackend {
            displays: vec![DisplayInfo {
                handle: DisplayHandle(1),
                size: Size::new(1920, 1080),
            }],
        };
        assert!(backend.request_permission().unwrap());

        let empty = MockBackend { displays: vec![] };
        assert!(!empty.request_permission().unwrap());
    }

    #[test]
    fn mock_backend_close_unknown_stream_errors() {
        let backend = MockBackend { displays: vec![] };
        assert!(backend.close_stream(StreamHandle(9)).is_err());
    }

    #[test]
    fn app_event_exposes_app_name() {
        let event = AppEvent::Unhidden {
            app_name: "Slack".to_string(),
        };
        assert_eq!(event.app_name(), "Slack");
    }

    #[test]
    fn registry_lists_windows() {
        let windows = MockRegistry.list_windows().unwrap();
        assert_eq!(windows[0].owner_app_name, "Notes");
    }

    #[test]
    fn trait_objects_are_send_sync() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<dyn CaptureBackend>();
        assert_send_sync::<dyn WindowRegistry>();
        assert_send_sync::<StreamCallback>();
    }
}
