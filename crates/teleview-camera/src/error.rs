//! Error types for camera operations.

use thiserror::Error;

/// Result type alias for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// Errors that can occur when driving a sensor.
#[derive(Error, Debug)]
pub enum CameraError {
    /// No device with the requested serial number on the bus.
    #[error("no camera with serial '{serial}' found on the USB bus")]
    NotFound { serial: String },

    /// USB transport failure from the underlying library.
    #[error("USB transport error: {0}")]
    Usb(#[from] rusb::Error),

    /// The device went away; surfaced by the next control operation.
    #[error("camera disconnected")]
    DeviceLost,

    /// Malformed control reply or unexpected sequence number.
    #[error("control protocol error: {message}")]
    Protocol { message: String },

    /// The device acknowledged a command with a non-success status.
    #[error("command 0x{command:04x} <- 0x{value:04x} rejected with status 0x{status:04x}")]
    CommandRejected { command: u16, value: u16, status: u16 },

    /// A frame could not be decoded (short buffer, invalid token).
    #[error("frame decoding error: {message}")]
    Decoding { message: String },

    /// API misuse, e.g. changing the frame size while streaming.
    #[error("invalid state: {message}")]
    InvalidState { message: String },

    /// The requested (size, rate) combination is not supported by the
    /// sensor.
    #[error("unsupported mode: {message}")]
    UnsupportedMode { message: String },

    /// Isochronous transfer ring failure.
    #[error("transfer ring error: {message}")]
    Transport { message: String },

    /// I/O error while reading or writing a background file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A background file did not have the expected layout.
    #[error("background file '{path}' is malformed: {message}")]
    BackgroundFormat { path: String, message: String },
}

impl CameraError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn decoding(message: impl Into<String>) -> Self {
        Self::Decoding {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Map transport errors that mean "the device is gone" onto
    /// [`CameraError::DeviceLost`].
    pub(crate) fn from_usb(err: rusb::Error) -> Self {
        match err {
            rusb::Error::NoDevice | rusb::Error::NotFound => Self::DeviceLost,
            other => Self::Usb(other),
        }
    }

    /// Whether the error indicates the device is no longer reachable.
    pub fn is_device_lost(&self) -> bool {
        matches!(self, Self::DeviceLost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let err = CameraError::CommandRejected {
            command: 0x0e,
            value: 30,
            status: 5,
        };
        let text = err.to_string();
        assert!(text.contains("000e"));
        assert!(text.contains("0005"));
    }

    #[test]
    fn no_device_maps_to_lost() {
        assert!(CameraError::from_usb(rusb::Error::NoDevice).is_device_lost());
        assert!(!CameraError::from_usb(rusb::Error::Timeout).is_device_lost());
    }
}
