//! Error taxonomy for the live stream.
//!
//! Device and channel failures are fatal for a session. Encode and send skips
//! are routine under load and are modelled as [`SkipReason`], not errors.

use std::time::Duration;

use thiserror::Error;

/// Camera acquisition failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("camera access denied: {0}")]
    PermissionDenied(String),
    #[error("no camera found at {0}")]
    NotFound(String),
    #[error("camera {0} is busy")]
    Busy(String),
    #[error("camera metadata not ready after {0:?}")]
    MetadataTimeout(Duration),
    #[error("camera backend error: {0}")]
    Backend(String),
}

impl DeviceError {
    /// Classify an OS-level error raised while opening `device`.
    pub fn from_io(device: &str, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(device.to_string()),
            std::io::ErrorKind::NotFound => Self::NotFound(device.to_string()),
            _ if err.raw_os_error() == Some(16) => Self::Busy(device.to_string()),
            _ => Self::Backend(format!("{}: {}", device, err)),
        }
    }
}

/// Transport channel failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("invalid detector address: {0}")]
    InvalidAddress(String),
    #[error("connection to detector refused: {0}")]
    Refused(String),
    #[error("connection to detector lost: {0}")]
    Abrupt(String),
    #[error("detector protocol error: {0}")]
    Protocol(String),
}

/// Fatal session failures. These end the session and are shown to the operator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("a stream session is already running")]
    AlreadyActive,
}

/// Why a poll tick produced no outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Previous encode+send still outstanding
    InFlight,
    /// Encoder produced no payload (surface not painted yet)
    EncodeSkip,
    /// Channel was not open at send time
    SendSkip,
}
