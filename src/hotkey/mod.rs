// Global hotkeys: key chords, the OS hotkey service and the dispatcher.

pub mod backend;
pub mod dispatcher;
pub mod dummy;
pub mod error;
pub mod global;
pub mod types;
