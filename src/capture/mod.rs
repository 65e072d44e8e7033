// Capture domain: capture service, window registry, exclusion and session.

pub mod backend;
pub mod dummy;
pub mod error;
pub mod exclusion;
#[cfg(target_os = "macos")]
pub mod macos;
pub mod polling;
pub mod session;
pub mod types;
