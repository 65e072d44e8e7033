use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::capture::types::DisplayHandle;
use crate::hotkey::types::{KeyChord, LogicalAction};
use crate::privacy::config::{PrivacyMode, DEFAULT_BLUR_RADIUS};
use crate::settings::store::PreferenceStore;

/// On-disk layout: a flat JSON object of preference keys.
pub type PreferencesFile = BTreeMap<String, Value>;

pub const KEY_PRIVACY_MODE: &str = "privacyMode";
pub const KEY_BLUR_RADIUS: &str = "blurRadius";
pub const KEY_CUSTOM_IMAGE_PATH: &str = "customImagePath";
pub const KEY_EXCLUDED_APPS: &str = "excludedApps";
pub const KEY_SELF_HIDING: &str = "selfHiding";
pub const KEY_DISPLAY_ID: &str = "displayId";
pub const KEY_EXCLUSION_DEBOUNCE_MS: &str = "exclusionDebounceMs";

const DEFAULT_EXCLUSION_DEBOUNCE: Duration = Duration::from_millis(500);

/// Preference key holding the chord bound to `action`.
pub fn hotkey_key(action: LogicalAction) -> String {
    format!("hotkeys.{}", action.id())
}

/// Read and deserialise a key, logging (and ignoring) malformed values.
pub fn read<T: DeserializeOwned>(store: &dyn PreferenceStore, key: &str) -> Option<T> {
    let value = store.get(key)?;
    match serde_json::from_value(value) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("Ignoring malformed preference '{key}': {e}");
            None
        }
    }
}

/// Serialise and store a value.
pub fn write<T: Serialize>(store: &dyn PreferenceStore, key: &str, value: &T) {
    match serde_json::to_value(value) {
        Ok(v) => store.set(key, v),
        Err(e) => tracing::warn!("Failed to serialise preference '{key}': {e}"),
    }
}

/// Persisted binding for an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredBinding {
    /// Nothing stored; use the action's default chord.
    Default,
    /// Explicitly cleared by the user.
    Unbound,
    Chord(KeyChord),
}

pub fn read_hotkey(store: &dyn PreferenceStore, action: LogicalAction) -> StoredBinding {
    let key = hotkey_key(action);
    match store.get(&key) {
        None => StoredBinding::Default,
        Some(Value::Null) => StoredBinding::Unbound,
        Some(value) => match serde_json::from_value::<KeyChord>(value) {
            Ok(chord) => StoredBinding::Chord(chord),
            Err(e) => {
                tracing::warn!("Ignoring malformed binding '{key}': {e}");
                StoredBinding::Default
            }
        },
    }
}

pub fn write_hotkey(store: &dyn PreferenceStore, action: LogicalAction, chord: Option<KeyChord>) {
    let key = hotkey_key(action);
    match chord {
        Some(chord) => write(store, &key, &chord),
        None => store.set(&key, Value::Null),
    }
}

/// Typed view of everything loaded at start-up.
#[derive(Debug, Clone, PartialEq)]
pub struct Preferences {
    pub privacy_mode: PrivacyMode,
    pub blur_radius: f32,
    pub custom_image_path: Option<PathBuf>,
    pub excluded_apps: Vec<String>,
    pub self_hiding: bool,
    pub display_id: Option<DisplayHandle>,
    pub exclusion_debounce: Duration,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            privacy_mode: PrivacyMode::default(),
            blur_radius: DEFAULT_BLUR_RADIUS,
            custom_image_path: None,
            excluded_apps: Vec::new(),
            self_hiding: true,
            display_id: None,
            exclusion_debounce: DEFAULT_EXCLUSION_DEBOUNCE,
        }
    }
}

impl Preferences {
    /// Load every preference, falling back to defaults for missing or
    /// malformed values.
    pub fn load(store: &dyn PreferenceStore) -> Self {
        let defaults = Self::default();
        Self {
            privacy_mode: read(store, KEY_PRIVACY_MODE).unwrap_or(defaults.privacy_mode),
            blur_radius: read(store, KEY_BLUR_RADIUS).unwrap_or(defaults.blur_radius),
            custom_image_path: read(store, KEY_CUSTOM_IMAGE_PATH),
            excluded_apps: read(store, KEY_EXCLUDED_APPS).unwrap_or_default(),
            self_hiding: read(store, KEY_SELF_HIDING).unwrap_or(defaults.self_hiding),
            display_id: read(store, KEY_DISPLAY_ID),
            exclusion_debounce: read::<u64>(store, KEY_EXCLUSION_DEBOUNCE_MS)
                .map(Duration::from_millis)
                .unwrap_or(defaults.exclusion_debounce),
        }
    }
}
