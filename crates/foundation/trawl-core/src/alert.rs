//! Alerts raised by the inspection rules

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    /// Protocol anomalies (resets, zero windows, malformed frames)
    Expert,
    Security,
}

/// The stored item an alert was raised for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemRef {
    Packet(u64),
    Transaction(u64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub severity: Severity,
    pub kind: AlertKind,
    pub category: String,
    pub protocol: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(flatten)]
    pub item: ItemRef,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(kind: AlertKind, severity: Severity, category: &str, message: impl Into<String>) -> Self {
        Self {
            severity,
            kind,
            category: category.to_string(),
            protocol: String::new(),
            message: message.into(),
            details: None,
            item: ItemRef::Packet(0),
            timestamp: Utc::now(),
        }
    }

    pub fn security(severity: Severity, category: &str, message: impl Into<String>) -> Self {
        Self::new(AlertKind::Security, severity, category, message)
    }

    pub fn expert(severity: Severity, category: &str, message: impl Into<String>) -> Self {
        Self::new(AlertKind::Expert, severity, category, message)
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn on(mut self, item: ItemRef) -> Self {
        self.item = item;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_order() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn test_alert_json_carries_back_reference() {
        let alert = Alert::security(Severity::High, "suspicious-port", "Traffic on port 4444")
            .protocol("TCP")
            .on(ItemRef::Packet(42));

        let value = serde_json::to_value(&alert).unwrap();
        assert_eq!(value["packet"], 42);
        assert_eq!(value["severity"], "high");
        assert_eq!(value["kind"], "security");

        let back: Alert = serde_json::from_value(value).unwrap();
        assert_eq!(back.item, ItemRef::Packet(42));
    }
}
