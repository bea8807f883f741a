//! trawl capture
//!
//! Frames in, packets out.
//!
//! # Modules
//!
//! - `source` - The `FrameSource` trait and in-memory replay
//! - `live` - Live interfaces through the pnet datalink layer
//! - `trace` - pcap/pcapng reading, writing and the rotating ring writer
//! - `dissect` - Frame → `Packet` dissection
//! - `bpf` - Capture (BPF-style) filter language
//! - `session` - Reader/ingest threads, limits and cooperative stop

pub mod bpf;
pub mod dissect;
pub mod live;
pub mod options;
pub mod session;
pub mod source;
#[cfg(any(test, feature = "synthetic"))]
pub mod synth;
pub mod trace;

pub use bpf::CaptureFilter;
pub use dissect::dissect;
pub use live::{list_interfaces, InterfaceInfo, LiveSource};
pub use options::CaptureOptions;
pub use session::{CaptureGuard, CaptureSession, StopReason};
pub use source::{FrameSource, Poll, ReplaySource};
pub use trace::{read_trace, write_pcap, write_pcapng, FileSource, RingWriter, TraceFormat};

use thiserror::Error;
use trawl_core::{ErrorCode, TrawlError};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("Interface busy: {0}")]
    InterfaceBusy(String),

    #[error("A capture is already running")]
    AlreadyCapturing,

    #[error("Invalid capture filter: {0}")]
    InvalidFilter(String),

    #[error("Invalid capture options: {0}")]
    InvalidOptions(String),

    #[error("Unsupported link type: {0}")]
    UnsupportedLink(String),

    #[error("Bad trace file: {0}")]
    Trace(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CaptureError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            CaptureError::InterfaceNotFound(_) => ErrorCode::NotFound,
            CaptureError::InterfaceBusy(_) | CaptureError::AlreadyCapturing => ErrorCode::ResourceBusy,
            CaptureError::InvalidFilter(_)
            | CaptureError::InvalidOptions(_)
            | CaptureError::UnsupportedLink(_)
            | CaptureError::Trace(_) => ErrorCode::InvalidInput,
            CaptureError::Io(e) => trawl_core::error::io_code(e),
        }
    }
}

impl From<CaptureError> for TrawlError {
    fn from(err: CaptureError) -> Self {
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

pub type Result<T> = std::result::Result<T, CaptureError>;
