use thiserror::Error;

/// Global hotkey errors. None of these are fatal; the affected action is
/// left unbound.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HotkeyError {
    #[error("failed to register {chord}: {reason}")]
    Registration { chord: String, reason: String },

    #[error("{chord} is already bound to {action}")]
    ChordInUse { chord: String, action: String },

    #[error("invalid key chord {0}")]
    InvalidChord(String),

    #[error("global hotkeys unavailable: {0}")]
    Unavailable(String),
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, HotkeyError>;
