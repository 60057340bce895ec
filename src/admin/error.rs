use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::fs::ConfigError;
use crate::types::ArborError;

/// Error type for administrative operations.
#[derive(Debug, Error)]
pub enum AdminError {
    /// Image file not found at the specified path.
    #[error("image not found: {0}")]
    MissingImage(PathBuf),
    /// Image file already present where a new one was requested.
    #[error("image already exists: {0}")]
    ImageExists(PathBuf),
    /// Custom error message.
    #[error("{0}")]
    Message(String),
    /// Core filesystem error.
    #[error(transparent)]
    Core(#[from] ArborError),
    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for administrative operations.
pub type Result<T> = std::result::Result<T, AdminError>;

impl AdminError {
    pub(crate) fn missing_image(path: impl AsRef<Path>) -> Self {
        AdminError::MissingImage(path.as_ref().to_path_buf())
    }
}
