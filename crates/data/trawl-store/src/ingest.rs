//! Ingest pipeline
//!
//! `Ingest` is the single writer for one source stream: it appends to the
//! store, runs the per-item inspector, logs the resulting alerts and
//! announces everything on the event bus, in that order.

use crate::alerts::AlertLog;
use crate::store::Store;
use std::sync::Arc;
use trawl_core::{Alert, Event, EventBus, Packet, ProxyTransaction, Record};

/// Cheap per-item rules run synchronously on every append.
pub trait Inspector<T>: Send {
    fn inspect(&mut self, item: &T) -> Vec<Alert>;

    /// Forget per-session state after the store was cleared.
    fn reset(&mut self) {}
}

impl<T> Inspector<T> for Box<dyn Inspector<T>> {
    fn inspect(&mut self, item: &T) -> Vec<Alert> {
        (**self).inspect(item)
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}

/// Inspector that never raises anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoInspection;

impl<T> Inspector<T> for NoInspection {
    fn inspect(&mut self, _item: &T) -> Vec<Alert> {
        Vec::new()
    }
}

pub struct Ingest<T: Record, I: Inspector<T>> {
    store: Arc<Store<T>>,
    alerts: Arc<AlertLog>,
    inspector: I,
    bus: EventBus,
    announce: fn(Arc<T>) -> Event,
    epoch: u64,
}

impl<I: Inspector<Packet>> Ingest<Packet, I> {
    pub fn packets(store: Arc<Store<Packet>>, alerts: Arc<AlertLog>, inspector: I, bus: EventBus) -> Self {
        Self::new(store, alerts, inspector, bus, Event::PacketCaptured)
    }
}

impl<I: Inspector<ProxyTransaction>> Ingest<ProxyTransaction, I> {
    pub fn transactions(
        store: Arc<Store<ProxyTransaction>>,
        alerts: Arc<AlertLog>,
        inspector: I,
        bus: EventBus,
    ) -> Self {
        Self::new(store, alerts, inspector, bus, Event::ProxyHistoryUpdate)
    }
}

impl<T: Record, I: Inspector<T>> Ingest<T, I> {
    pub fn new(
        store: Arc<Store<T>>,
        alerts: Arc<AlertLog>,
        inspector: I,
        bus: EventBus,
        announce: fn(Arc<T>) -> Event,
    ) -> Self {
        let epoch = store.epoch();
        Self { store, alerts, inspector, bus, announce, epoch }
    }

    pub fn push(&mut self, item: T) -> Arc<T> {
        let (item, epoch) = self.store.push(item);
        if epoch != self.epoch {
            self.inspector.reset();
            self.epoch = epoch;
        }

        let raised = self.inspector.inspect(&item);
        self.bus.publish((self.announce)(Arc::clone(&item)));

        for alert in raised {
            let alert = alert.on(item.item_ref());
            if self.alerts.record(epoch, alert.clone()) {
                self.bus.publish(Event::alert(alert));
            }
        }
        item
    }

    pub fn store(&self) -> &Arc<Store<T>> {
        &self.store
    }

    pub fn alerts(&self) -> &Arc<AlertLog> {
        &self.alerts
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::packet;
    use trawl_core::{ItemRef, Severity};

    struct FlagTelnet {
        resets: usize,
    }

    impl Inspector<Packet> for FlagTelnet {
        fn inspect(&mut self, item: &Packet) -> Vec<Alert> {
            if item.dst_port == Some(23) {
                vec![Alert::security(Severity::High, "unencrypted", "Telnet")]
            } else {
                Vec::new()
            }
        }

        fn reset(&mut self) {
            self.resets += 1;
        }
    }

    #[test]
    fn test_push_orders_events() {
        let store = Arc::new(Store::new(100));
        let alerts = Arc::new(AlertLog::new(100));
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let mut ingest = Ingest::packets(store.clone(), alerts.clone(), FlagTelnet { resets: 0 }, bus);

        let item = ingest.push(packet("10.0.0.1", "10.0.0.2", "TCP", 5000, 23));
        assert_eq!(item.no, 1);

        assert!(matches!(rx.try_recv(), Ok(Event::PacketCaptured(p)) if p.no == 1));
        match rx.try_recv() {
            Ok(Event::SecurityAlert(alert)) => assert_eq!(alert.item, ItemRef::Packet(1)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(alerts.list(store.epoch(), None).len(), 1);
    }

    #[test]
    fn test_clear_resets_inspector() {
        let store = Arc::new(Store::new(100));
        let alerts = Arc::new(AlertLog::new(100));
        let mut ingest = Ingest::packets(store.clone(), alerts.clone(), FlagTelnet { resets: 0 }, EventBus::new(16));

        ingest.push(packet("10.0.0.1", "10.0.0.2", "TCP", 5000, 23));
        let epoch = store.clear();
        alerts.clear(epoch);
        let item = ingest.push(packet("10.0.0.1", "10.0.0.2", "TCP", 5000, 80));

        assert_eq!(item.no, 1);
        assert_eq!(ingest.inspector.resets, 1);
        assert!(alerts.list(epoch, None).is_empty());
    }
}
