//! trawl proxy
//!
//! HTTP/1.1 intercepting proxy. Plain requests are parsed, optionally held
//! for the user, forwarded upstream and recorded as transactions. `CONNECT`
//! tunnels are either decrypted with leaf certificates minted by a local CA
//! or relayed blind.
//!
//! # Modules
//!
//! - `codec` - HTTP/1.1 message reading and writing over async streams
//! - `upstream` - Origin connections (plain or rustls) with timeouts
//! - `ca` - Interception CA, leaf certificates and trust-store install
//! - `intercept` - Held requests awaiting forward/drop
//! - `rules` - Scope and match-and-replace rules
//! - `history` - History recording and filters
//! - `conn` - Per-connection state machine
//! - `server` - Listener, accept loop and shutdown
//! - `repeater` - Re-send a request and record it

pub mod ca;
pub mod codec;
pub mod conn;
pub mod history;
pub mod intercept;
pub mod repeater;
pub mod rules;
pub mod server;
pub mod upstream;

pub use ca::CertificateAuthority;
pub use history::{HistoryFilter, Recorder, TransactionIngest};
pub use intercept::{InterceptQueue, Verdict};
pub use repeater::Repeater;
pub use rules::{MatchReplaceRule, MatchType, ScopeRule};
pub use server::{ProxyServer, ProxySettings};
pub use upstream::Upstream;

use thiserror::Error;
use trawl_core::{ErrorCode, TrawlError};

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Cannot listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Proxy is already running")]
    AlreadyRunning,

    #[error("Malformed HTTP: {0}")]
    Malformed(String),

    #[error("Message too large: {0}")]
    TooLarge(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Upstream {host}:{port} unreachable: {reason}")]
    Upstream { host: String, port: u16, reason: String },

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("No CA certificate, generate one first")]
    NoCertificateAuthority,

    #[error("Intercepted request {0} not found")]
    UnknownIntercept(String),

    #[error("Intercepted request {0} already resolved")]
    AlreadyResolved(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Trust store install failed: {0}")]
    Install(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProxyError::Bind { source, .. } => match source.kind() {
                std::io::ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
                _ => ErrorCode::ResourceBusy,
            },
            ProxyError::AlreadyRunning => ErrorCode::ResourceBusy,
            ProxyError::Malformed(_)
            | ProxyError::TooLarge(_)
            | ProxyError::Timeout(_)
            | ProxyError::Tls(_)
            | ProxyError::Upstream { .. } => ErrorCode::ProtocolError,
            ProxyError::NoCertificateAuthority | ProxyError::UnknownIntercept(_) => ErrorCode::NotFound,
            ProxyError::AlreadyResolved(_) | ProxyError::InvalidInput(_) => ErrorCode::InvalidInput,
            ProxyError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            ProxyError::Certificate(_) | ProxyError::Install(_) => ErrorCode::Internal,
            ProxyError::Io(e) => trawl_core::error::io_code(e),
        }
    }
}

impl From<ProxyError> for TrawlError {
    fn from(err: ProxyError) -> Self {
        let message = err.to_string();
        match err.code() {
            ErrorCode::PermissionDenied => TrawlError::PermissionDenied(message),
            ErrorCode::ResourceBusy => TrawlError::ResourceBusy(message),
            ErrorCode::InvalidInput => TrawlError::InvalidInput(message),
            ErrorCode::NotFound => TrawlError::NotFound(message),
            ErrorCode::ProtocolError => TrawlError::ProtocolError(message),
            ErrorCode::Internal => TrawlError::Internal(message),
        }
    }
}

impl From<TrawlError> for ProxyError {
    fn from(err: TrawlError) -> Self {
        match err {
            TrawlError::Io(e) => ProxyError::Io(e),
            TrawlError::PermissionDenied(m) => ProxyError::PermissionDenied(m),
            TrawlError::ProtocolError(m) => ProxyError::Malformed(m),
            TrawlError::InvalidInput(m) => ProxyError::InvalidInput(m),
            other => ProxyError::InvalidInput(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
