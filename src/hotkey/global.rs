//! OS global hotkeys through the `global-hotkey` crate.

use crate::hotkey::types::{KeyChord, KeyCode, Modifiers};

#[cfg(target_os = "macos")]
pub use os::GlobalHotkeyService;

/// `global-hotkey` accelerator string for `chord`, e.g. `super+alt+KeyH`.
pub fn accelerator(chord: KeyChord) -> String {
    const NAMES: [(Modifiers, &str); 4] = [
        (Modifiers::CMD, "super"),
        (Modifiers::CTRL, "control"),
        (Modifiers::ALT, "alt"),
        (Modifiers::SHIFT, "shift"),
    ];
    let mut parts: Vec<String> = NAMES
        .iter()
        .filter(|(flag, _)| chord.modifiers.contains(*flag))
        .map(|(_, name)| name.to_string())
        .collect();
    parts.push(key_name(chord.code));
    parts.join("+")
}

fn key_name(code: KeyCode) -> String {
    match code {
        KeyCode::ESCAPE => "Escape".to_string(),
        KeyCode::SPACE | KeyCode::TAB | KeyCode::ENTER => code.to_string(),
        _ => {
            let name = code.to_string();
            let mut chars = name.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii_digit() => format!("Digit{c}"),
                (Some(c), None) => format!("Key{c}"),
                _ => name,
            }
        }
    }
}

#[cfg(target_os = "macos")]
mod os {
    use std::collections::HashMap;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::mpsc::{self, Sender};
    use std::sync::Arc;
    use std::thread::JoinHandle;

    use global_hotkey::hotkey::HotKey;
    use global_hotkey::{GlobalHotKeyEvent, GlobalHotKeyManager, HotKeyState};
    use parking_lot::Mutex;

    use super::accelerator;
    use crate::hotkey::backend::{ActionCallback, HotkeyService, RegistrationHandle};
    use crate::hotkey::error::{HotkeyError, Result};
    use crate::hotkey::types::{KeyChord, LogicalAction};

    type Reply = Sender<std::result::Result<(), String>>;
    type Dispatch = Arc<dyn Fn(LogicalAction) + Send + Sync>;

    enum Command {
        Register { hotkey: HotKey, reply: Reply },
        Unregister { hotkey: HotKey, reply: Reply },
        Shutdown,
    }

    /// [`HotkeyService`] on the system hotkey API.
    ///
    /// The manager lives on its own thread and is driven by commands.
    /// Presses are delivered through the application's main-thread event
    /// loop, which the presenting shell runs.
    pub struct GlobalHotkeyService {
        commands: Sender<Command>,
        worker: Option<JoinHandle<()>>,
        registrations: Mutex<HashMap<RegistrationHandle, (KeyChord, HotKey)>>,
        actions: Arc<Mutex<HashMap<u32, LogicalAction>>>,
        dispatch: Arc<Mutex<Option<Dispatch>>>,
        next_handle: AtomicU64,
    }

    impl GlobalHotkeyService {
        pub fn start() -> Result<Self> {
            let (commands, inbox) = mpsc::channel::<Command>();
            let (ready, started) = mpsc::channel();
            let worker = std::thread::Builder::new()
                .name("global-hotkeys".into())
                .spawn(move || {
                    let manager = match GlobalHotKeyManager::new() {
                        Ok(manager) => manager,
                        Err(e) => {
                            let _ = ready.send(Err(e.to_string()));
                            return;
                        }
                    };
                    let _ = ready.send(Ok(()));
                    for command in inbox {
                        match command {
                            Command::Register { hotkey, reply } => {
                                let _ = reply.send(manager.register(hotkey).map_err(|e| e.to_string()));
                            }
                            Command::Unregister { hotkey, reply } => {
                                let _ =
                                    reply.send(manager.unregister(hotkey).map_err(|e| e.to_string()));
                            }
                            Command::Shutdown => break,
                        }
                    }
                })
                .expect("failed to spawn global hotkey thread");

            started
                .recv()
                .map_err(|_| HotkeyError::Unavailable("hotkey thread exited".into()))?
                .map_err(HotkeyError::Unavailable)?;

            let actions = Arc::new(Mutex::new(HashMap::<u32, LogicalAction>::new()));
            let dispatch = Arc::new(Mutex::new(None::<Dispatch>));
            {
                let actions = Arc::clone(&actions);
                let dispatch = Arc::clone(&dispatch);
                GlobalHotKeyEvent::set_event_handler(Some(move |event: GlobalHotKeyEvent| {
                    if !matches!(event.state(), HotKeyState::Pressed) {
                        return;
                    }
                    let action = actions.lock().get(&event.id()).copied();
                    let callback = dispatch.lock().clone();
                    if let (Some(action), Some(callback)) = (action, callback) {
                        callback(action);
                    }
                }));
            }

            tracing::info!("Global hotkey service started");
            Ok(Self {
                commands,
                worker: Some(worker),
                registrations: Mutex::new(HashMap::new()),
                actions,
                dispatch,
                next_handle: AtomicU64::new(1),
            })
        }

        fn request(&self, command: impl FnOnce(Reply) -> Command) -> std::result::Result<(), String> {
            let (reply, response) = mpsc::channel();
            self.commands
                .send(command(reply))
                .map_err(|_| "hotkey thread stopped".to_string())?;
            response
                .recv()
                .map_err(|_| "hotkey thread stopped".to_string())?
        }
    }

    impl HotkeyService for GlobalHotkeyService {
        fn register(&self, chord: KeyChord, action: LogicalAction) -> Result<RegistrationHandle> {
            let failed = |reason: String| HotkeyError::Registration {
                chord: chord.to_string(),
                reason,
            };
            let hotkey = HotKey::from_str(&accelerator(chord)).map_err(|e| failed(e.to_string()))?;
            self.request(|reply| Command::Register { hotkey, reply })
                .map_err(failed)?;

            self.actions.lock().insert(hotkey.id(), action);
            let handle = RegistrationHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
            self.registrations.lock().insert(handle, (chord, hotkey));
            tracing::debug!("Registered {chord} for {}", action.id());
            Ok(handle)
        }

        fn unregister(&self, handle: RegistrationHandle) -> Result<()> {
            let Some((chord, hotkey)) = self.registrations.lock().remove(&handle) else {
                return Ok(());
            };
            self.actions.lock().remove(&hotkey.id());
            self.request(|reply| Command::Unregister { hotkey, reply })
                .map_err(|reason| HotkeyError::Registration {
                    chord: chord.to_string(),
                    reason: format!("unregister failed: {reason}"),
                })
        }

        fn set_dispatch(&self, callback: ActionCallback) {
            *self.dispatch.lock() = Some(Arc::from(callback));
        }
    }

    impl Drop for GlobalHotkeyService {
        fn drop(&mut self) {
            GlobalHotKeyEvent::set_event_handler(None::<fn(GlobalHotKeyEvent)>);
            let _ = self.commands.send(Command::Shutdown);
            if let Some(worker) = self.worker.take() {
                let _ = worker.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hotkey::types::LogicalAction;

    fn chord(s: &str) -> KeyChord {
        s.parse().unwrap()
    }

    #[test]
    fn default_chords_map_to_key_codes() {
        assert_eq!(
            accelerator(LogicalAction::TogglePrivacy.default_chord()),
            "super+alt+KeyH"
        );
        assert_eq!(
            accelerator(LogicalAction::ToggleFullscreen.default_chord()),
            "super+control+KeyF"
        );
    }

    #[test]
    fn modifiers_follow_a_fixed_order() {
        assert_eq!(accelerator(chord("shift+ctrl+alt+cmd+k")), "super+control+alt+shift+KeyK");
    }

    #[test]
    fn digits_function_and_named_keys() {
        assert_eq!(accelerator(chord("Ctrl+Shift+7")), "control+shift+Digit7");
        assert_eq!(accelerator(chord("Cmd+F12")), "super+F12");
        assert_eq!(accelerator(chord("Alt+Esc")), "alt+Escape");
        assert_eq!(accelerator(chord("Ctrl+Space")), "control+Space");
        assert_eq!(accelerator(chord("Cmd+Enter")), "super+Enter");
        assert_eq!(accelerator(chord("Alt+Tab")), "alt+Tab");
    }
}
