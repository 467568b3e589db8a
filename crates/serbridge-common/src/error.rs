//! Error types for bridge operations.
//!
//! Every failure the port engine can produce is a [`BridgeError`]. Errors are
//! grouped into an [`ErrorKind`] so callers can tell operator mistakes
//! (configuration) from resource trouble and transfer faults. Telnet framing
//! anomalies are absorbed by the codec and never become errors.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Coarse classification of a [`BridgeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed operator-supplied string. Prior state is left intact.
    Configuration,
    /// Device open failure, lock contention, listen failure. Retryable.
    Resource,
    /// I/O failure while moving data. Closes the session.
    Transfer,
    /// Unexpected internal state.
    Internal,
}

impl ErrorKind {
    /// Returns a short lowercase name for the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Resource => "resource",
            ErrorKind::Transfer => "transfer",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Errors that can occur during bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Configuration validation error.
    #[error("Invalid {field} '{value}': {message}")]
    InvalidConfig {
        /// The setting that failed validation (e.g. "timeout").
        field: String,
        /// The offending input.
        value: String,
        /// Error message.
        message: String,
    },

    /// No port matched the given port specification.
    #[error("Invalid port number: {spec}")]
    PortNotFound {
        /// The port specification as typed.
        spec: String,
    },

    /// The port exists but is not in a state that allows the operation.
    #[error("Port {port} {message}")]
    PortState {
        /// The port name.
        port: String,
        /// What is wrong, e.g. "is not currently connected".
        message: String,
    },

    /// The serial device could not be opened or configured.
    #[error("Unable to open device {device}: {source}")]
    DeviceOpen {
        /// Device path.
        device: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Another port or process holds the device lock.
    #[error("Device {device} is locked by {holder}")]
    LockContention {
        /// Device path.
        device: String,
        /// Who holds it (a port name or "pid N").
        holder: String,
    },

    /// A lock file could not be created or removed.
    #[error("Lock file {path} failed: {source}")]
    LockFile {
        /// Lock file path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Failed to bind the network listener.
    #[error("Failed to listen on {addr}: {source}")]
    ListenFailed {
        /// The listen address as configured.
        addr: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// I/O error while relaying data or driving control lines.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl BridgeError {
    /// Creates an invalid configuration error.
    pub fn invalid_config(
        field: impl Into<String>,
        value: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            value: value.into(),
            message: message.into(),
        }
    }

    /// Creates a port not found error.
    pub fn port_not_found(spec: impl Into<String>) -> Self {
        Self::PortNotFound { spec: spec.into() }
    }

    /// Creates a port state error.
    pub fn port_state(port: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PortState {
            port: port.into(),
            message: message.into(),
        }
    }

    /// Creates a device open error.
    pub fn device_open(device: impl Into<String>, source: io::Error) -> Self {
        Self::DeviceOpen {
            device: device.into(),
            source,
        }
    }

    /// Creates a lock contention error.
    pub fn lock_contention(device: impl Into<String>, holder: impl Into<String>) -> Self {
        Self::LockContention {
            device: device.into(),
            holder: holder.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns the taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::InvalidConfig { .. }
            | BridgeError::PortNotFound { .. }
            | BridgeError::PortState { .. } => ErrorKind::Configuration,
            BridgeError::DeviceOpen { .. }
            | BridgeError::LockContention { .. }
            | BridgeError::LockFile { .. }
            | BridgeError::ListenFailed { .. } => ErrorKind::Resource,
            BridgeError::Io(_) => ErrorKind::Transfer,
            BridgeError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Returns true if this error indicates a transient condition
    /// that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Resource | ErrorKind::Transfer)
    }
}
