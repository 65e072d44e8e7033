// Preferences: injected key-value store and typed preference keys.

pub mod store;
pub mod types;
