use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

use crate::settings::types::PreferencesFile;

/// Quiet period between the last change and the write to disk.
const SAVE_DEBOUNCE: Duration = Duration::from_millis(500);

/// Opaque key-value preference store.
///
/// Components receive one explicitly at construction; values are loaded at
/// start-up and written back on change.
pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    fn set(&self, key: &str, value: Value);

    /// Remove a key. Removing a missing key is a no-op.
    fn remove(&self, key: &str);
}

/// In-memory store used by tests and headless runs.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a value (builder style).
    pub fn with(self, key: &str, value: Value) -> Self {
        self.data.lock().insert(key.to_string(), value);
        self
    }
}

impl PreferenceStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.data.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        self.data.lock().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.data.lock().remove(key);
    }
}

/// Persistent JSON-file store with debounced saving.
pub struct JsonFileStore {
    path: PathBuf,
    data: Mutex<PreferencesFile>,
    save_notify: Notify,
    is_dirty: AtomicBool,
}

impl JsonFileStore {
    /// Create a new store, loading from disk if the file exists.
    pub fn new(path: PathBuf) -> Self {
        let data = Self::load(&path).unwrap_or_else(|e| {
            tracing::warn!("Ignoring unreadable preferences at {}: {e}", path.display());
            PreferencesFile::default()
        });
        Self {
            path,
            data: Mutex::new(data),
            save_notify: Notify::new(),
            is_dirty: AtomicBool::new(false),
        }
    }

    /// Load preferences from a JSON file, returning default on missing file.
    pub fn load(path: &std::path::Path) -> Result<PreferencesFile, String> {
        if !path.exists() {
            return Ok(PreferencesFile::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        serde_json::from_str(&contents).map_err(|e| e.to_string())
    }

    /// Save current preferences to disk atomically (write .tmp then rename).
    pub fn save(&self) -> Result<(), String> {
        let data = self.data.lock().clone();
        let json = serde_json::to_string_pretty(&data).map_err(|e| e.to_string())?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &json).map_err(|e| e.to_string())?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| e.to_string())?;

        Ok(())
    }

    /// Write pending changes now. Used on shutdown.
    pub fn flush(&self) -> Result<(), String> {
        if self.is_dirty.swap(false, Ordering::AcqRel) {
            self.save()?;
        }
        Ok(())
    }

    fn mark_dirty(&self) {
        self.is_dirty.store(true, Ordering::Release);
        self.save_notify.notify_one();
    }

    /// Spawn the save loop: wait for a change, let the quiet period pass, then write.
    ///
    /// Uses an `AtomicBool` dirty flag to avoid losing notifications that arrive
    /// between `save()` completing and `notified().await` re-registering.
    pub fn start_debounce_task(self: &Arc<Self>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                store.save_notify.notified().await;
                tokio::time::sleep(SAVE_DEBOUNCE).await;
                if store.is_dirty.swap(false, Ordering::AcqRel) {
                    if let Err(e) = store.save() {
                        tracing::warn!("Failed to save preferences: {e}");
                    }
                }
            }
        });
    }
}

impl PreferenceStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.data.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        {
            let mut data = self.data.lock();
            if data.get(key) == Some(&value) {
                return;
            }
            data.insert(key.to_string(), value);
        }
        self.mark_dirty();
    }

    fn remove(&self, key: &str) {
        if self.data.lock().remove(key).is_some() {
            self.mark_dirty();
        }
    }
}
