use thiserror::Error;

/// Privacy overlay errors.
#[derive(Debug, Error)]
pub enum PrivacyError {
    #[error("failed to load custom image {path}: {reason}")]
    ImageLoad { path: String, reason: String },
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, PrivacyError>;
