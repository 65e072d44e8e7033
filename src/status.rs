use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use crate::capture::session::{SessionObserver, SessionState};
use crate::hotkey::types::KeyChord;

/// Identifiers for status menu items.
pub const MENU_ID_STATUS: &str = "status";
pub const MENU_ID_TOGGLE_PRIVACY: &str = "toggle-privacy";
pub const MENU_ID_TOGGLE_CAPTURE: &str = "toggle-capture";
pub const MENU_ID_SETTINGS: &str = "settings";
pub const MENU_ID_SHOW_WINDOW: &str = "show-window";
pub const MENU_ID_ABOUT: &str = "about";
pub const MENU_ID_QUIT: &str = "quit";

const ICON_PRIVACY_ON: &str = "eye.slash.fill";
const ICON_PRIVACY_OFF: &str = "eye.fill";

/// Everything the status indicator shows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub privacy_enabled: bool,
    pub capturing: bool,
    pub session: String,
    pub privacy_chord: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MenuItem {
    pub id: &'static str,
    pub label: String,
    pub enabled: bool,
}

impl MenuItem {
    fn new(id: &'static str, label: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
            enabled: true,
        }
    }
}

impl StatusSnapshot {
    pub fn icon_name(&self) -> &'static str {
        if self.privacy_enabled {
            ICON_PRIVACY_ON
        } else {
            ICON_PRIVACY_OFF
        }
    }

    /// Status menu, top to bottom.
    pub fn menu_items(&self) -> Vec<MenuItem> {
        let status = MenuItem {
            id: MENU_ID_STATUS,
            label: format!("Privacy: {}", if self.privacy_enabled { "ON" } else { "OFF" }),
            enabled: false,
        };
        let toggle = match &self.privacy_chord {
            Some(chord) => format!("Toggle Privacy ({chord})"),
            None => "Toggle Privacy".to_string(),
        };
        let capture = if self.capturing {
            "Stop Sharing"
        } else {
            "Start Sharing"
        };
        vec![
            status,
            MenuItem::new(MENU_ID_TOGGLE_PRIVACY, toggle),
            MenuItem::new(MENU_ID_TOGGLE_CAPTURE, capture),
            MenuItem::new(MENU_ID_SETTINGS, "Settings..."),
            MenuItem::new(MENU_ID_SHOW_WINDOW, "Show Window"),
            MenuItem::new(MENU_ID_ABOUT, "About Cloak"),
            MenuItem::new(MENU_ID_QUIT, "Quit"),
        ]
    }
}

/// Status indicator model, rebuilt on every observed transition.
///
/// The presenting surface watches [`StatusIndicator::watch`] and redraws
/// the icon and menu from each new snapshot.
pub struct StatusIndicator {
    current: Mutex<StatusSnapshot>,
    tx: watch::Sender<StatusSnapshot>,
}

impl StatusIndicator {
    pub fn new(privacy_enabled: bool, privacy_chord: Option<KeyChord>) -> Self {
        let snapshot = StatusSnapshot {
            privacy_enabled,
            capturing: false,
            session: SessionState::Idle.to_string(),
            privacy_chord: privacy_chord.map(|c| c.to_string()),
        };
        let (tx, _) = watch::channel(snapshot.clone());
        Self {
            current: Mutex::new(snapshot),
            tx,
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.current.lock().clone()
    }

    pub fn watch(&self) -> watch::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }

    pub fn set_privacy_enabled(&self, enabled: bool) {
        self.update(|s| s.privacy_enabled = enabled);
    }

    pub fn set_privacy_chord(&self, chord: Option<KeyChord>) {
        self.update(|s| s.privacy_chord = chord.map(|c| c.to_string()));
    }

    fn update(&self, f: impl FnOnce(&mut StatusSnapshot)) {
        let mut current = self.current.lock();
        f(&mut current);
        self.tx.send_replace(current.clone());
    }
}

impl SessionObserver for StatusIndicator {
    fn session_changed(&self, state: &SessionState) {
        self.update(|s| {
            s.capturing = state.is_capturing();
            s.session = state.to_string();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(items: &[MenuItem]) -> Vec<&'static str> {
        items.iter().map(|i| i.id).collect()
    }

    #[test]
    fn menu_lists_items_in_order() {
        let indicator = StatusIndicator::new(false, None);
        let items = indicator.snapshot().menu_items();
        assert_eq!(
            ids(&items),
            [
                MENU_ID_STATUS,
                MENU_ID_TOGGLE_PRIVACY,
                MENU_ID_TOGGLE_CAPTURE,
                MENU_ID_SETTINGS,
                MENU_ID_SHOW_WINDOW,
                MENU_ID_ABOUT,
                MENU_ID_QUIT,
            ]
        );
        assert_eq!(items[0].label, "Privacy: OFF");
        assert!(!items[0].enabled);
        assert!(items[1..].iter().all(|i| i.enabled));
    }

    #[test]
    fn privacy_toggle_updates_label_and_icon() {
        let indicator = StatusIndicator::new(false, None);
        assert_eq!(indicator.snapshot().icon_name(), "eye.fill");

        indicator.set_privacy_enabled(true);
        let snapshot = indicator.snapshot();
        assert_eq!(snapshot.icon_name(), "eye.slash.fill");
        assert_eq!(snapshot.menu_items()[0].label, "Privacy: ON");
    }

    #[test]
    fn toggle_item_shows_bound_chord() {
        let chord: KeyChord = "Cmd+Alt+H".parse().unwrap();
        let indicator = StatusIndicator::new(false, Some(chord));
        assert_eq!(
            indicator.snapshot().menu_items()[1].label,
            "Toggle Privacy (Cmd+Alt+H)"
        );

        indicator.set_privacy_chord(None);
        assert_eq!(indicator.snapshot().menu_items()[1].label, "Toggle Privacy");
    }

    #[test]
    fn session_transitions_flip_capture_item() {
        let indicator = StatusIndicator::new(false, None);
        let mut rx = indicator.watch();

        indicator.session_changed(&SessionState::Streaming);
        assert!(rx.has_changed().unwrap());
        let snapshot = rx.borrow_and_update().clone();
        assert!(snapshot.capturing);
        assert_eq!(snapshot.menu_items()[2].label, "Stop Sharing");

        indicator.session_changed(&SessionState::Failed("stream lost".into()));
        let snapshot = indicator.snapshot();
        assert!(!snapshot.capturing);
        assert_eq!(snapshot.session, "failed (stream lost)");
        assert_eq!(snapshot.menu_items()[2].label, "Start Sharing");
    }

    #[test]
    fn snapshot_serialises_camel_case() {
        let indicator = StatusIndicator::new(true, None);
        let json = serde_json::to_value(indicator.snapshot()).unwrap();
        assert_eq!(json["privacyEnabled"], true);
        assert_eq!(json["session"], "idle");
        assert!(json["privacyChord"].is_null());
    }
}
