//! Error types for the capture server.

use thiserror::Error;

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors that can occur while configuring or running the server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid or inconsistent configuration values.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// The configuration file could not be parsed.
    #[error("configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// A camera operation failed.
    #[error("camera error: {0}")]
    Camera(#[from] teleview_camera::CameraError),

    /// Socket or file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}
