use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::hotkey::backend::{HotkeyService, RegistrationHandle};
use crate::hotkey::error::{HotkeyError, Result};
use crate::hotkey::types::{KeyChord, LogicalAction};
use crate::settings::store::PreferenceStore;
use crate::settings::types::{read_hotkey, StoredBinding};

/// Receives every dispatched action.
pub trait HotkeyObserver: Send + Sync {
    fn on_action(&self, action: LogicalAction);
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    chord: KeyChord,
    handle: RegistrationHandle,
}

/// Maps global key chords to logical actions and fans them out to
/// observers, independent of window focus.
///
/// Each action has at most one chord and each chord at most one action.
pub struct HotkeyDispatcher {
    service: Arc<dyn HotkeyService>,
    bindings: Mutex<BTreeMap<LogicalAction, Binding>>,
    observers: RwLock<Vec<Arc<dyn HotkeyObserver>>>,
}

impl HotkeyDispatcher {
    /// Create a dispatcher and route the service's presses through it.
    pub fn new(service: Arc<dyn HotkeyService>) -> Arc<Self> {
        let dispatcher = Arc::new(Self {
            service: Arc::clone(&service),
            bindings: Mutex::new(BTreeMap::new()),
            observers: RwLock::new(Vec::new()),
        });
        let weak = Arc::downgrade(&dispatcher);
        service.set_dispatch(Box::new(move |action| {
            if let Some(dispatcher) = weak.upgrade() {
                dispatcher.dispatch(action);
            }
        }));
        dispatcher
    }

    pub fn subscribe(&self, observer: Arc<dyn HotkeyObserver>) {
        self.observers.write().push(observer);
    }

    pub fn binding(&self, action: LogicalAction) -> Option<KeyChord> {
        self.bindings.lock().get(&action).map(|b| b.chord)
    }

    pub fn bindings(&self) -> Vec<(LogicalAction, KeyChord)> {
        self.bindings
            .lock()
            .iter()
            .map(|(action, b)| (*action, b.chord))
            .collect()
    }

    /// Bind `chord` to `action`, replacing the action's previous chord.
    ///
    /// The previous OS registration is removed before the new one is
    /// installed. If registration fails the action is left unbound.
    pub fn bind(&self, action: LogicalAction, chord: KeyChord) -> Result<()> {
        let mut bindings = self.bindings.lock();

        if let Some((other, _)) = bindings
            .iter()
            .find(|(a, b)| **a != action && b.chord == chord)
        {
            return Err(HotkeyError::ChordInUse {
                chord: chord.to_string(),
                action: other.label().to_string(),
            });
        }
        if bindings.get(&action).is_some_and(|b| b.chord == chord) {
            return Ok(());
        }

        if let Some(previous) = bindings.remove(&action) {
            if let Err(e) = self.service.unregister(previous.handle) {
                tracing::warn!("Failed to unregister {}: {e}", previous.chord);
            }
        }

        match self.service.register(chord, action) {
            Ok(handle) => {
                bindings.insert(action, Binding { chord, handle });
                tracing::info!("Bound {chord} to {}", action.label());
                Ok(())
            }
            Err(e) => {
                tracing::warn!("{} left unbound: {e}", action.label());
                Err(e)
            }
        }
    }

    /// Remove the action's binding. Succeeds whether or not one exists.
    pub fn clear(&self, action: LogicalAction) {
        let previous = self.bindings.lock().remove(&action);
        if let Some(previous) = previous {
            if let Err(e) = self.service.unregister(previous.handle) {
                tracing::warn!("Failed to unregister {}: {e}", previous.chord);
            }
            tracing::info!("Cleared binding for {}", action.label());
        }
    }

    /// Resolve `chord` and dispatch its action. Unbound chords are ignored.
    pub fn trigger(&self, chord: KeyChord) -> Option<LogicalAction> {
        let action = self
            .bindings
            .lock()
            .iter()
            .find(|(_, b)| b.chord == chord)
            .map(|(action, _)| *action)?;
        self.dispatch(action);
        Some(action)
    }

    /// Deliver `action` to every observer in subscription order.
    pub fn dispatch(&self, action: LogicalAction) {
        tracing::debug!("Hotkey action: {}", action.id());
        let observers: Vec<_> = self.observers.read().iter().cloned().collect();
        for observer in observers {
            observer.on_action(action);
        }
    }

    /// Apply persisted bindings, falling back to each action's default.
    ///
    /// Returns the actions that could not be bound; they stay unbound.
    pub fn load_bindings(&self, store: &dyn PreferenceStore) -> Vec<(LogicalAction, HotkeyError)> {
        let mut failures = Vec::new();
        for action in LogicalAction::ALL {
            let chord = match read_hotkey(store, action) {
                StoredBinding::Default => action.default_chord(),
                StoredBinding::Chord(chord) => chord,
                StoredBinding::Unbound => {
                    self.clear(action);
                    continue;
                }
            };
            if let Err(e) = self.bind(action, chord) {
                failures.push((action, e));
            }
        }
        failures
    }
}
