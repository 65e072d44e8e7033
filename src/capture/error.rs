use thiserror::Error;

/// System Settings pane for Screen Recording permission.
pub const SCREEN_RECORDING_SETTINGS_URL: &str =
    "x-apple.systempreferences:com.apple.preference.security?Privacy_ScreenCapture";

/// Capture subsystem errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CaptureError {
    #[error("screen recording permission denied")]
    PermissionDenied,

    #[error("no display available for capture")]
    NoDisplayAvailable,

    #[error("a capture session is already active")]
    AlreadyActive,

    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("capture stream failed: {0}")]
    StreamFailure(String),

    #[error("capture filter rebuild failed: {0}")]
    FilterRebuild(String),

    #[error("window enumeration failed: {0}")]
    Enumeration(String),

    #[error("session start was cancelled")]
    Cancelled,

    #[error("capture task failed: {0}")]
    Task(String),
}

impl CaptureError {
    /// Whether this error ends the current `start()` attempt and needs user
    /// action outside the process before retrying.
    pub fn is_fatal_for_attempt(&self) -> bool {
        matches!(self, Self::PermissionDenied | Self::NoDisplayAvailable)
    }

    /// User-facing remediation instructions, if the error has any.
    pub fn remediation(&self) -> Option<String> {
        match self {
            Self::PermissionDenied | Self::NoDisplayAvailable => Some(format!(
                "Cloak needs Screen Recording permission to capture your screen.\n\n\
                 1. Open System Settings\n\
                 2. Go to Privacy & Security → Screen Recording\n\
                 3. Enable Cloak\n\
                 4. Start sharing again\n\n\
                 {SCREEN_RECORDING_SETTINGS_URL}"
            )),
            Self::StreamFailure(_) => {
                Some("Screen capture stopped unexpectedly. Start sharing again.".to_string())
            }
            _ => None,
        }
    }
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, CaptureError>;
