//! Alert log
//!
//! Alerts are tagged with the store epoch of the item that raised them. An
//! alert from an older epoch is discarded, so a clear that races an in-flight
//! ingest never leaves stale alerts behind.

use parking_lot::RwLock;
use std::collections::VecDeque;
use trawl_core::{Alert, AlertKind};

pub struct AlertLog {
    inner: RwLock<LogInner>,
    capacity: usize,
}

struct LogInner {
    epoch: u64,
    alerts: VecDeque<Alert>,
}

impl AlertLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(LogInner { epoch: 0, alerts: VecDeque::new() }),
            capacity: capacity.max(1),
        }
    }

    /// Record `alert` for `epoch`. Returns false when the epoch is stale.
    pub fn record(&self, epoch: u64, alert: Alert) -> bool {
        let mut inner = self.inner.write();
        if epoch < inner.epoch {
            return false;
        }
        if epoch > inner.epoch {
            inner.epoch = epoch;
            inner.alerts.clear();
        }
        inner.alerts.push_back(alert);
        if inner.alerts.len() > self.capacity {
            inner.alerts.pop_front();
        }
        true
    }

    /// Alerts belonging to `epoch`, oldest first.
    pub fn list(&self, epoch: u64, kind: Option<AlertKind>) -> Vec<Alert> {
        let inner = self.inner.read();
        if inner.epoch != epoch {
            return Vec::new();
        }
        inner.alerts.iter().filter(|a| kind.map_or(true, |k| a.kind == k)).cloned().collect()
    }

    /// Move to `epoch`, dropping everything older.
    pub fn clear(&self, epoch: u64) {
        let mut inner = self.inner.write();
        inner.epoch = inner.epoch.max(epoch);
        inner.alerts.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trawl_core::Severity;

    fn alert(kind: AlertKind) -> Alert {
        Alert::new(kind, Severity::Low, "test", "message")
    }

    #[test]
    fn test_epoch_filtering() {
        let log = AlertLog::new(10);
        assert!(log.record(0, alert(AlertKind::Security)));
        assert!(log.record(0, alert(AlertKind::Expert)));
        assert_eq!(log.list(0, None).len(), 2);
        assert_eq!(log.list(0, Some(AlertKind::Expert)).len(), 1);

        log.clear(1);
        assert!(log.list(0, None).is_empty());
        assert!(!log.record(0, alert(AlertKind::Security)), "stale epoch accepted");
        assert!(log.list(1, None).is_empty());

        assert!(log.record(2, alert(AlertKind::Security)));
        assert!(log.list(1, None).is_empty());
        assert_eq!(log.list(2, None).len(), 1);
    }

    #[test]
    fn test_capacity() {
        let log = AlertLog::new(3);
        for _ in 0..5 {
            log.record(0, alert(AlertKind::Security));
        }
        assert_eq!(log.len(), 3);
    }
}
