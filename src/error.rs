//! Error types for the acquisition and control plane.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias used throughout the core modules.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the acquisition and control plane.
#[derive(Debug, Error)]
pub enum Error {
    /// A device path could not be opened.
    #[error("failed to open device {path}: {source}")]
    DeviceOpen {
        /// Path that was being opened.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A device read or write failed after retrying `EINTR`.
    #[error("device I/O error ({context}): {source}")]
    DeviceIo {
        /// What was being attempted (path, offset, handshake step).
        context: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// An expected status-bit transition did not happen in time.
    ///
    /// The host-side parameter shadow has still been updated; the
    /// caller is warned that the device may be inconsistent.
    #[error("handshake timeout after {}ms waiting for {step}", .timeout.as_millis())]
    HandshakeTimeout {
        /// Handshake step that timed out.
        step: &'static str,
        /// The bounded window that elapsed.
        timeout: Duration,
    },

    /// The named ring buffer already exists.
    ///
    /// Callers wanting fresh semantics must remove the object first.
    #[error("ring buffer {name} already exists")]
    AlreadyExists {
        /// Name of the shared-memory object.
        name: String,
    },

    /// Ring buffer magic mismatch on open.
    #[error("invalid ring buffer format: bad magic {found:#018x}")]
    InvalidFormat {
        /// The magic value actually found in the header.
        found: u64,
    },

    /// A caller-supplied value is out of its documented range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A recording start was requested while one is already active.
    #[error("a recording is already in progress")]
    AlreadyBusy,

    /// A stop was requested while a recording was in progress.
    #[error("recording stopped by operator")]
    OperatorCancel,
}

impl Error {
    pub(crate) fn device_open(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::DeviceOpen {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn device_io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::DeviceIo {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}
