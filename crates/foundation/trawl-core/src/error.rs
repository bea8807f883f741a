//! Error taxonomy
//!
//! Every failure that crosses the bridge is reduced to one of six codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// Stable error codes reported in failed responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    PermissionDenied,
    ResourceBusy,
    InvalidInput,
    NotFound,
    ProtocolError,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::PermissionDenied => "PermissionDenied",
            ErrorCode::ResourceBusy => "ResourceBusy",
            ErrorCode::InvalidInput => "InvalidInput",
            ErrorCode::NotFound => "NotFound",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum TrawlError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TrawlError {
    pub fn code(&self) -> ErrorCode {
        match self {
            TrawlError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            TrawlError::ResourceBusy(_) => ErrorCode::ResourceBusy,
            TrawlError::InvalidInput(_) => ErrorCode::InvalidInput,
            TrawlError::NotFound(_) => ErrorCode::NotFound,
            TrawlError::ProtocolError(_) => ErrorCode::ProtocolError,
            TrawlError::Internal(_) => ErrorCode::Internal,
            TrawlError::Io(e) => io_code(e),
        }
    }

    /// Classify an I/O error, keeping `context` in the message.
    pub fn from_io(err: io::Error, context: impl fmt::Display) -> Self {
        let message = format!("{context}: {err}");
        match io_code(&err) {
            ErrorCode::PermissionDenied => TrawlError::PermissionDenied(message),
            ErrorCode::ResourceBusy => TrawlError::ResourceBusy(message),
            ErrorCode::NotFound => TrawlError::NotFound(message),
            ErrorCode::InvalidInput => TrawlError::InvalidInput(message),
            ErrorCode::ProtocolError => TrawlError::ProtocolError(message),
            ErrorCode::Internal => TrawlError::Internal(message),
        }
    }
}

/// Map an I/O error kind onto the bridge taxonomy.
pub fn io_code(err: &io::Error) -> ErrorCode {
    match err.kind() {
        io::ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
        io::ErrorKind::AddrInUse => ErrorCode::ResourceBusy,
        io::ErrorKind::NotFound => ErrorCode::NotFound,
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => ErrorCode::InvalidInput,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::UnexpectedEof => ErrorCode::ProtocolError,
        // EBUSY has no stable ErrorKind
        _ if err.raw_os_error() == Some(16) => ErrorCode::ResourceBusy,
        _ => ErrorCode::Internal,
    }
}
