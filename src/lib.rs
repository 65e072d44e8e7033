pub mod app;
pub mod capture;
pub mod diagnostics;
pub mod hotkey;
pub mod preview;
pub mod privacy;
pub mod settings;
pub mod status;

pub use app::{create_backends, Backends, Cloak};
