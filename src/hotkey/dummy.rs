use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::hotkey::backend::{ActionCallback, HotkeyService, RegistrationHandle};
use crate::hotkey::error::{HotkeyError, Result};
use crate::hotkey::types::{KeyChord, LogicalAction};

struct ServiceState {
    registrations: BTreeMap<RegistrationHandle, (KeyChord, LogicalAction)>,
    next_handle: u64,
    reserved: HashSet<KeyChord>,
    dispatch: Option<Arc<dyn Fn(LogicalAction) + Send + Sync>>,
    unregister_calls: u32,
}

/// In-process hotkey service.
///
/// Stands in for the OS service in headless runs and tests: chords are
/// "pressed" with [`MemoryHotkeyService::press`], and chords can be marked
/// as reserved by another application to exercise registration failures.
pub struct MemoryHotkeyService {
    state: Mutex<ServiceState>,
}

impl MemoryHotkeyService {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServiceState {
                registrations: BTreeMap::new(),
                next_handle: 1,
                reserved: HashSet::new(),
                dispatch: None,
                unregister_calls: 0,
            }),
        }
    }

    /// Make registering `chord` fail.
    pub fn with_reserved(self, chord: KeyChord) -> Self {
        self.reserve(chord);
        self
    }

    pub fn reserve(&self, chord: KeyChord) {
        self.state.lock().reserved.insert(chord);
    }

    /// Simulate the user pressing `chord`. Returns true if it was registered.
    pub fn press(&self, chord: KeyChord) -> bool {
        let (action, dispatch) = {
            let state = self.state.lock();
            let action = state
                .registrations
                .values()
                .find(|(c, _)| *c == chord)
                .map(|(_, a)| *a);
            (action, state.dispatch.clone())
        };
        match (action, dispatch) {
            (Some(action), Some(dispatch)) => {
                dispatch(action);
                true
            }
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Active registrations in registration order.
    pub fn registrations(&self) -> Vec<(KeyChord, LogicalAction)> {
        self.state.lock().registrations.values().copied().collect()
    }

    pub fn unregister_calls(&self) -> u32 {
        self.state.lock().unregister_calls
    }
}

impl Default for MemoryHotkeyService {
    fn default() -> Self {
        Self::new()
    }
}

impl HotkeyService for MemoryHotkeyService {
    fn register(&self, chord: KeyChord, action: LogicalAction) -> Result<RegistrationHandle> {
        let mut state = self.state.lock();
        if state.reserved.contains(&chord) {
            return Err(HotkeyError::Registration {
                chord: chord.to_string(),
                reason: "reserved by another application".into(),
            });
        }
        if state.registrations.values().any(|(c, _)| *c == chord) {
            return Err(HotkeyError::Registration {
                chord: chord.to_string(),
                reason: "already registered".into(),
            });
        }
        let handle = RegistrationHandle(state.next_handle);
        state.next_handle += 1;
        state.registrations.insert(handle, (chord, action));
        Ok(handle)
    }

    fn unregister(&self, handle: RegistrationHandle) -> Result<()> {
        let mut state = self.state.lock();
        state.unregister_calls += 1;
        state.registrations.remove(&handle);
        Ok(())
    }

    fn set_dispatch(&self, callback: ActionCallback) {
        self.state.lock().dispatch = Some(Arc::from(callback));
    }
}
