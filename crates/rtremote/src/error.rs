//! Transport error taxonomy

use crate::document::CorrelationKey;
use std::io;
use std::sync::Arc;

/// Errors surfaced by streams, the selector, the registry and async handles.
///
/// Cloneable so a completed [`AsyncHandle`](crate::AsyncHandle) can hand the
/// same outcome back from every call to `wait`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    /// Connect or accept failed
    #[error("connection failed: {0}")]
    Connection(String),

    /// Send or receive failed on an established connection
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// Deadline passed with no matching reply
    #[error("timed out after {0} ms waiting for a reply")]
    Timeout(u64),

    /// A correlation key was registered twice
    #[error("correlation key {0} is already registered")]
    DuplicateKey(CorrelationKey),

    /// The environment or selector is being torn down
    #[error("shutdown in progress")]
    ShutdownInProgress,

    /// Inbound bytes did not form a valid document
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The selector thread was already started
    #[error("selector already started")]
    AlreadyStarted,

    /// Configuration could not be loaded or is invalid
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RemoteError {
    /// Build an `Io` error from a kind and message.
    pub fn io(kind: io::ErrorKind, msg: impl Into<String>) -> Self {
        RemoteError::Io(Arc::new(io::Error::new(kind, msg.into())))
    }

    /// Error returned when an operation needs an opened stream.
    pub fn not_connected() -> Self {
        Self::io(io::ErrorKind::NotConnected, "stream is not open")
    }

    /// Whether this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RemoteError::Timeout(_))
    }
}

impl From<io::Error> for RemoteError {
    fn from(e: io::Error) -> Self {
        RemoteError::Io(Arc::new(e))
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, RemoteError>;
