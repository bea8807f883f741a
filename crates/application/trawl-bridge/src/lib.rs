//! trawl bridge
//!
//! The command surface of trawl. A UI sends named commands and receives
//! flat JSON responses, while engine events stream back on the same socket.
//!
//! # Modules
//!
//! - `command` - The request vocabulary
//! - `response` - Success and error envelopes
//! - `export` - Packet export and JSON import
//! - `engine` - Owner of stores, capture, proxy and CA; command dispatch
//! - `ws` - WebSocket and health endpoints over axum

pub mod command;
pub mod engine;
pub mod export;
pub mod response;
pub mod ws;

pub use command::Command;
pub use engine::{BridgeHandle, Engine};
pub use export::ExportFormat;
pub use response::Response;
