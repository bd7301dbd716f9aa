//! Error taxonomy shared by every cardlink crate.
//!
//! Every failure surfaced to an application carries exactly one [`ErrorKind`]
//! plus a human-readable message. Transport-specific failures never leak past
//! the runtime boundary; they are translated into one of these kinds first.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    NotInitialized,
    AlreadyInitialized,
    NoReaders,
    ReaderError,
    NotConnected,
    AlreadyConnected,
    CardNotPresent,
    TransmissionError,
    ProtocolError,
    Timeout,
    ResourceLimit,
    InvalidParameter,
    UnsupportedOperation,
    PlatformError,
}

impl ErrorKind {
    /// Every kind, in declaration order.
    pub const ALL: [ErrorKind; 14] = [
        Self::NotInitialized,
        Self::AlreadyInitialized,
        Self::NoReaders,
        Self::ReaderError,
        Self::NotConnected,
        Self::AlreadyConnected,
        Self::CardNotPresent,
        Self::TransmissionError,
        Self::ProtocolError,
        Self::Timeout,
        Self::ResourceLimit,
        Self::InvalidParameter,
        Self::UnsupportedOperation,
        Self::PlatformError,
    ];

    /// Stable upper-case code, e.g. `CARD_NOT_PRESENT`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotInitialized => "NOT_INITIALIZED",
            Self::AlreadyInitialized => "ALREADY_INITIALIZED",
            Self::NoReaders => "NO_READERS",
            Self::ReaderError => "READER_ERROR",
            Self::NotConnected => "NOT_CONNECTED",
            Self::AlreadyConnected => "ALREADY_CONNECTED",
            Self::CardNotPresent => "CARD_NOT_PRESENT",
            Self::TransmissionError => "TRANSMISSION_ERROR",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::ResourceLimit => "RESOURCE_LIMIT",
            Self::InvalidParameter => "INVALID_PARAMETER",
            Self::UnsupportedOperation => "UNSUPPORTED_OPERATION",
            Self::PlatformError => "PLATFORM_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Errors returned by cardlink operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The platform has not been initialized (or was already released).
    #[error("Platform not initialized: {message}")]
    NotInitialized { message: String },

    /// `init()` was called twice without an intervening `release()`.
    #[error("Platform already initialized: {message}")]
    AlreadyInitialized { message: String },

    /// No reader or antenna is available.
    #[error("No readers available: {message}")]
    NoReaders { message: String },

    /// The reader rejected an operation or could not be activated.
    #[error("Reader error: {message}")]
    ReaderError { message: String },

    /// The device or card link is not connected.
    #[error("Not connected: {message}")]
    NotConnected { message: String },

    /// The device or card link is already in use.
    #[error("Already connected: {message}")]
    AlreadyConnected { message: String },

    /// No card is present on the reader.
    #[error("Card not present: {message}")]
    CardNotPresent { message: String },

    /// Bytes could not be exchanged with the card.
    #[error("Transmission error: {message}")]
    TransmissionError { message: String },

    /// The card or reader answered with a malformed or unexpected structure.
    #[error("Protocol error: {message}")]
    ProtocolError { message: String },

    /// The operation did not complete in time or was cancelled.
    #[error("Timeout: {message}")]
    Timeout { message: String },

    /// A buffer, channel or handle limit was exceeded.
    #[error("Resource limit: {message}")]
    ResourceLimit { message: String },

    /// An argument was out of range or referred to an unknown entity.
    #[error("Invalid parameter: {message}")]
    InvalidParameter { message: String },

    /// The transport or card does not support the requested operation.
    #[error("Unsupported operation: {message}")]
    UnsupportedOperation { message: String },

    /// Catch-all for platform failures, including use after release.
    #[error("Platform error: {message}")]
    PlatformError { message: String },
}

/// Result type alias for cardlink operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::NotInitialized => Self::NotInitialized { message },
            ErrorKind::AlreadyInitialized => Self::AlreadyInitialized { message },
            ErrorKind::NoReaders => Self::NoReaders { message },
            ErrorKind::ReaderError => Self::ReaderError { message },
            ErrorKind::NotConnected => Self::NotConnected { message },
            ErrorKind::AlreadyConnected => Self::AlreadyConnected { message },
            ErrorKind::CardNotPresent => Self::CardNotPresent { message },
            ErrorKind::TransmissionError => Self::TransmissionError { message },
            ErrorKind::ProtocolError => Self::ProtocolError { message },
            ErrorKind::Timeout => Self::Timeout { message },
            ErrorKind::ResourceLimit => Self::ResourceLimit { message },
            ErrorKind::InvalidParameter => Self::InvalidParameter { message },
            ErrorKind::UnsupportedOperation => Self::UnsupportedOperation { message },
            ErrorKind::PlatformError => Self::PlatformError { message },
        }
    }

    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotInitialized { .. } => ErrorKind::NotInitialized,
            Self::AlreadyInitialized { .. } => ErrorKind::AlreadyInitialized,
            Self::NoReaders { .. } => ErrorKind::NoReaders,
            Self::ReaderError { .. } => ErrorKind::ReaderError,
            Self::NotConnected { .. } => ErrorKind::NotConnected,
            Self::AlreadyConnected { .. } => ErrorKind::AlreadyConnected,
            Self::CardNotPresent { .. } => ErrorKind::CardNotPresent,
            Self::TransmissionError { .. } => ErrorKind::TransmissionError,
            Self::ProtocolError { .. } => ErrorKind::ProtocolError,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ResourceLimit { .. } => ErrorKind::ResourceLimit,
            Self::InvalidParameter { .. } => ErrorKind::InvalidParameter,
            Self::UnsupportedOperation { .. } => ErrorKind::UnsupportedOperation,
            Self::PlatformError { .. } => ErrorKind::PlatformError,
        }
    }

    /// The human-readable message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::NotInitialized { message }
            | Self::AlreadyInitialized { message }
            | Self::NoReaders { message }
            | Self::ReaderError { message }
            | Self::NotConnected { message }
            | Self::AlreadyConnected { message }
            | Self::CardNotPresent { message }
            | Self::TransmissionError { message }
            | Self::ProtocolError { message }
            | Self::Timeout { message }
            | Self::ResourceLimit { message }
            | Self::InvalidParameter { message }
            | Self::UnsupportedOperation { message }
            | Self::PlatformError { message } => message,
        }
    }

    /// Check whether this error has the given kind.
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind() == kind
    }

    pub fn not_initialized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotInitialized, message)
    }

    pub fn already_initialized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyInitialized, message)
    }

    pub fn no_readers(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoReaders, message)
    }

    pub fn reader_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ReaderError, message)
    }

    pub fn not_connected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotConnected, message)
    }

    pub fn already_connected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyConnected, message)
    }

    pub fn card_not_present(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CardNotPresent, message)
    }

    pub fn transmission(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransmissionError, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn resource_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceLimit, message)
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParameter, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedOperation, message)
    }

    pub fn platform(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PlatformError, message)
    }
}
