//! Error types for the capture core

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::capture::pool::Owner;
use crate::capture::stream::StreamState;

/// Result type alias using [`CaptureError`]
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Everything that can go wrong between opening a device and handing a frame
/// to a sink.
///
/// Most variants end the capture session. [`CaptureError::is_retryable`]
/// reports the few that do not.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("device not found: {}", .0.display())]
    DeviceNotFound(PathBuf),

    #[error("{} is not a character device", .0.display())]
    NotACharacterDevice(PathBuf),

    #[error("permission denied for {}, try adding the user to the 'video' group", .0.display())]
    PermissionDenied(PathBuf),

    #[error("{} does not support video capture", .0.display())]
    NotACaptureDevice(PathBuf),

    #[error("{} does not support streaming I/O", .0.display())]
    StreamingUnsupported(PathBuf),

    #[error("device is closed")]
    DeviceClosed,

    #[error("format rejected: {0}")]
    FormatRejected(String),

    #[error("frame interval for {fps} fps not supported: {source}")]
    FrameIntervalUnsupported {
        fps: u32,
        #[source]
        source: io::Error,
    },

    #[error("invalid frame rate {fps}, expected {min}..={max}")]
    InvalidFrameRate { fps: u32, min: u32, max: u32 },

    #[error("driver granted {granted} buffers, at least {minimum} are required")]
    InsufficientBufferMemory { granted: u32, minimum: u32 },

    #[error("failed to map buffer {index}: {source}")]
    MappingFailed {
        index: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to start streaming: {0}")]
    StreamStartFailed(#[source] io::Error),

    #[error("capture failed: {0}")]
    CaptureFailed(#[source] io::Error),

    #[error("{operation} requires a {expected} stream, stream is {actual}")]
    InvalidState {
        operation: &'static str,
        expected: StreamState,
        actual: StreamState,
    },

    #[error("buffer {index} is owned by the {found}, expected the {expected}")]
    OwnershipViolation {
        index: u32,
        expected: Owner,
        found: Owner,
    },

    #[error("conversion error: {0}")]
    Conversion(String),

    #[error("sink error: {0}")]
    Sink(String),

    #[error("sink closed")]
    SinkClosed,

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CaptureError {
    /// Conditions the caller may recover from without tearing down the
    /// session.
    pub fn is_retryable(&self) -> bool {
        match self {
            CaptureError::FrameIntervalUnsupported { .. } => true,
            CaptureError::CaptureFailed(e) => is_retry_errno(e),
            _ => false,
        }
    }
}

/// Errors a non-blocking device call reports when it simply has nothing to
/// hand out yet.
pub(crate) fn is_retry_errno(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        let empty = CaptureError::CaptureFailed(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(empty.is_retryable());

        let fatal = CaptureError::CaptureFailed(io::Error::from_raw_os_error(libc::EIO));
        assert!(!fatal.is_retryable());

        let interval = CaptureError::FrameIntervalUnsupported {
            fps: 60,
            source: io::Error::from_raw_os_error(libc::EINVAL),
        };
        assert!(interval.is_retryable());
        assert!(!CaptureError::DeviceClosed.is_retryable());
    }

    #[test]
    fn test_eagain_is_would_block() {
        let err = io::Error::from_raw_os_error(libc::EAGAIN);
        assert!(is_retry_errno(&err));
    }
}
