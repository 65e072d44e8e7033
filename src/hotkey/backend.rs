use crate::hotkey::error::Result;
use crate::hotkey::types::{KeyChord, LogicalAction};

/// Opaque handle for one OS-level hotkey registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationHandle(pub u64);

/// Invoked with the action of a registered chord when it is pressed,
/// regardless of which window has focus.
pub type ActionCallback = Box<dyn Fn(LogicalAction) + Send + Sync>;

/// OS global-hotkey service.
pub trait HotkeyService: Send + Sync {
    /// Register `chord` system-wide for `action`.
    fn register(&self, chord: KeyChord, action: LogicalAction) -> Result<RegistrationHandle>;

    /// Remove a registration. Unknown handles are ignored.
    fn unregister(&self, handle: RegistrationHandle) -> Result<()>;

    /// Install the callback that receives pressed actions.
    fn set_dispatch(&self, callback: ActionCallback);
}
