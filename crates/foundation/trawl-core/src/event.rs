//! Push events
//!
//! Everything the engine announces flows through one `EventBus`. Each
//! subscriber owns a bounded queue; a slow subscriber loses its oldest events
//! and the publisher never blocks.

use crate::alert::Alert;
use crate::error::ErrorCode;
use crate::packet::Packet;
use crate::transaction::{InterceptedItem, ProxyTransaction};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Final figures for a capture session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureStats {
    pub packet_count: u64,
    /// Frames lost because the ingest queue was full
    pub dropped: u64,
    /// Frames rejected by the capture filter
    pub filtered: u64,
    pub bytes: u64,
    /// Seconds
    pub duration: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum Event {
    PacketCaptured(Arc<Packet>),
    ExpertAlert(Alert),
    SecurityAlert(Alert),
    CaptureError { code: ErrorCode, message: String },
    CaptureStopped(CaptureStats),
    CaptureFileRotated { path: PathBuf },
    ProxyStarted { port: u16 },
    ProxyStopped,
    ProxyError { message: String },
    ProxyIntercept(InterceptedItem),
    ProxyHistoryUpdate(Arc<ProxyTransaction>),
    ProxyHistoryCleared,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::PacketCaptured(_) => "packet-captured",
            Event::ExpertAlert(_) => "expert-alert",
            Event::SecurityAlert(_) => "security-alert",
            Event::CaptureError { .. } => "capture-error",
            Event::CaptureStopped(_) => "capture-stopped",
            Event::CaptureFileRotated { .. } => "capture-file-rotated",
            Event::ProxyStarted { .. } => "proxy-started",
            Event::ProxyStopped => "proxy-stopped",
            Event::ProxyError { .. } => "proxy-error",
            Event::ProxyIntercept(_) => "proxy-intercept",
            Event::ProxyHistoryUpdate(_) => "proxy-history-update",
            Event::ProxyHistoryCleared => "proxy-history-cleared",
        }
    }

    pub fn alert(alert: Alert) -> Self {
        match alert.kind {
            crate::AlertKind::Expert => Event::ExpertAlert(alert),
            crate::AlertKind::Security => Event::SecurityAlert(alert),
        }
    }
}

/// Fan-out of engine events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub const DEFAULT_CAPACITY: usize = 4096;

    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Fire and forget; having no subscribers is not an error. Returns how
    /// many subscribers the event reached.
    pub fn publish(&self, event: Event) -> usize {
        match self.sender.send(event) {
            Ok(reached) => reached,
            Err(unsent) => {
                tracing::trace!(event = unsent.0.name(), "no subscribers for event");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
