//! trawl core
//!
//! Shared vocabulary for the capture and proxy pipelines.
//!
//! # Modules
//!
//! - `error` - Error taxonomy surfaced to the bridge
//! - `packet` - Dissected packets and raw frames
//! - `transaction` - HTTP requests, responses and proxy transactions
//! - `alert` - Expert and security alerts
//! - `record` - The `Record` trait shared by stored items
//! - `event` - Push events and the broadcast event bus

pub mod alert;
pub mod error;
pub mod event;
pub mod packet;
pub mod record;
pub mod transaction;

pub use alert::{Alert, AlertKind, ItemRef, Severity};
pub use error::{ErrorCode, TrawlError};
pub use event::{CaptureStats, Event, EventBus};
pub use packet::{proto, ArpInfo, LinkInfo, LinkType, Packet, RawFrame, TcpFlags, TcpInfo};
pub use record::Record;
pub use transaction::{
    Disposition, Headers, HttpRequest, HttpResponse, InterceptedItem, PendingTransaction,
    ProxyTransaction, Scheme, Target, TransactionState,
};

pub type Result<T> = std::result::Result<T, TrawlError>;
