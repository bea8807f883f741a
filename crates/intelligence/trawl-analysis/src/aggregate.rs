//! Aggregate rules
//!
//! Port scans, beacons and broadcast storms need many packets to judge, so
//! they run on a timer instead of per packet. Each sweep examines only the
//! packets appended since the previous sweep; a store clear (new epoch)
//! forgets all state and starts again from the first packet.
//!
//! Per-source and per-flow state is dropped once it falls out of its time
//! window, and each table is capped at `alerts.max_tracked` keys. The
//! monitor also sweeps early when unexamined packets fill half the store.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use trawl_config::AlertConfig;
use trawl_core::{proto, Alert, Event, EventBus, ItemRef, Packet, Severity};
use trawl_store::{AlertLog, Store};

use crate::trim_oldest;

/// How often the monitor checks whether eviction is about to outrun it.
const PRESSURE_CHECK: Duration = Duration::from_millis(250);

fn seconds(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_microseconds().unwrap_or(i64::MAX) as f64 / 1e6
}

/// Coefficient of variation of the gaps between consecutive timestamps,
/// with the mean gap. `None` with fewer than two gaps.
fn regularity(times: &VecDeque<DateTime<Utc>>) -> Option<(f64, f64)> {
    let gaps: Vec<f64> = times.iter().zip(times.iter().skip(1)).map(|(a, b)| seconds(*a, *b)).collect();
    if gaps.len() < 2 {
        return None;
    }
    let mean = gaps.iter().sum::<f64>() / gaps.len() as f64;
    if mean <= 0.0 {
        return None;
    }
    let variance = gaps.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / gaps.len() as f64;
    Some((variance.sqrt() / mean, mean))
}

/// Latest probe time per destination port, oldest first.
#[derive(Default)]
struct ScanState {
    probes: VecDeque<(DateTime<Utc>, u16)>,
}

type Flow = (String, String, u16);

pub struct AggregateDetector {
    config: AlertConfig,
    epoch: u64,
    /// Highest packet number already examined in `epoch`
    watermark: u64,
    /// Packets evicted before any sweep saw them
    skipped: u64,
    latest: Option<DateTime<Utc>>,
    scans: HashMap<String, ScanState>,
    connections: HashMap<Flow, VecDeque<DateTime<Utc>>>,
    /// Flows already reported, with the last time they were seen
    beacons: HashMap<Flow, DateTime<Utc>>,
    broadcasts: VecDeque<DateTime<Utc>>,
}

impl AggregateDetector {
    pub fn new(config: &AlertConfig) -> Self {
        Self {
            config: config.clone(),
            epoch: 0,
            watermark: 0,
            skipped: 0,
            latest: None,
            scans: HashMap::new(),
            connections: HashMap::new(),
            beacons: HashMap::new(),
            broadcasts: VecDeque::new(),
        }
    }

    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    /// Packets of this epoch that were evicted unexamined.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Sources, flows and reported beacons currently held.
    pub fn tracked(&self) -> usize {
        self.scans.len() + self.connections.len() + self.beacons.len()
    }

    fn reset(&mut self, epoch: u64) {
        tracing::debug!(epoch, "aggregate detector reset");
        self.epoch = epoch;
        self.watermark = 0;
        self.skipped = 0;
        self.latest = None;
        self.scans.clear();
        self.connections.clear();
        self.beacons.clear();
        self.broadcasts.clear();
    }

    /// Forget state outside its window, then cap each table.
    fn prune(&mut self) {
        let Some(now) = self.latest else { return };
        let scan_window = self.config.scan_window_secs as f64;
        let idle = self.config.beacon_idle_secs as f64;
        self.scans.retain(|_, s| s.probes.back().is_some_and(|(t, _)| seconds(*t, now) <= scan_window));
        self.connections.retain(|_, times| times.back().is_some_and(|t| seconds(*t, now) <= idle));
        self.beacons.retain(|_, last| seconds(*last, now) <= idle);

        let max = self.config.max_tracked;
        let dropped = trim_oldest(&mut self.scans, max, |s| s.probes.back().map(|(t, _)| *t))
            + trim_oldest(&mut self.connections, max, |times| times.back().copied())
            + trim_oldest(&mut self.beacons, max, |last| Some(*last));
        if dropped > 0 {
            tracing::debug!(dropped, "aggregate state trimmed");
        }
    }

    /// Examine packets appended since the last sweep. Returns the epoch the
    /// alerts belong to together with the alerts.
    pub fn sweep(&mut self, store: &Store<Packet>) -> (u64, Vec<Alert>) {
        let epoch = store.epoch();
        if epoch != self.epoch {
            self.reset(epoch);
        }

        let fresh: Vec<Arc<Packet>> = store.range(self.watermark + 1, u64::MAX).collect();
        // A clear between the two reads would mix epochs; the next sweep redoes it.
        if store.epoch() != epoch {
            return (epoch, Vec::new());
        }

        if let Some(first) = fresh.first() {
            if self.watermark > 0 && first.no > self.watermark + 1 {
                let missed = first.no - self.watermark - 1;
                self.skipped += missed;
                tracing::warn!(missed, "packets evicted before the aggregate sweep saw them");
            }
        }

        let mut out = Vec::new();
        for p in &fresh {
            self.port_scan(p, &mut out);
            self.beacon(p, &mut out);
            self.broadcast_storm(p, &mut out);
            self.watermark = self.watermark.max(p.no);
            self.latest = self.latest.max(Some(p.timestamp));
        }
        self.prune();
        (epoch, out)
    }

    /// True when unexamined packets fill half of `store`, so the next
    /// evictions may take some of them.
    pub fn behind(&self, store: &Store<Packet>) -> bool {
        let watermark = if store.epoch() == self.epoch { self.watermark } else { 0 };
        let pending = store.next_no().saturating_sub(watermark + 1);
        pending.saturating_mul(2) >= store.capacity() as u64
    }

    fn port_scan(&mut self, p: &Packet, out: &mut Vec<Alert>) {
        if p.length > self.config.scan_small_packet_max {
            return;
        }
        let Some(port) = p.dst_port else { return };
        if p.protocol != proto::TCP && p.protocol != proto::UDP {
            return;
        }
        if p.tcp.as_ref().is_some_and(|t| !t.flags.is_syn_only()) {
            return;
        }

        let window = self.config.scan_window_secs as f64;
        let state = self.scans.entry(p.source.clone()).or_default();
        state.probes.retain(|(_, seen)| *seen != port);
        state.probes.push_back((p.timestamp, port));
        while state.probes.front().is_some_and(|(t, _)| seconds(*t, p.timestamp) > window) {
            state.probes.pop_front();
        }

        let ports = state.probes.len();
        if ports <= self.config.scan_port_threshold {
            return;
        }
        let elapsed = state.probes.front().map_or(0.0, |(t, _)| seconds(*t, p.timestamp));
        out.push(
            Alert::security(Severity::High, "port_scan", "Port scan detected")
                .protocol(p.protocol.clone())
                .details(format!("{} scanned {} ports in {:.1}s", p.source, ports, elapsed))
                .on(ItemRef::Packet(p.no))
                .at(p.timestamp),
        );
        // Start counting afresh so a continuing scan is reported again later
        state.probes.clear();
    }

    fn beacon(&mut self, p: &Packet, out: &mut Vec<Alert>) {
        let Some(tcp) = &p.tcp else { return };
        let Some(port) = p.dst_port else { return };
        if !tcp.flags.is_syn_only() {
            return;
        }

        let key = (p.source.clone(), p.destination.clone(), port);
        if let Some(last) = self.beacons.get_mut(&key) {
            *last = p.timestamp;
            return;
        }
        let min_events = self.config.beacon_min_events;
        let times = self.connections.entry(key.clone()).or_default();
        times.push_back(p.timestamp);
        while times.len() > min_events {
            times.pop_front();
        }
        if times.len() < min_events {
            return;
        }

        let Some((jitter, mean)) = regularity(times) else { return };
        if jitter > self.config.beacon_max_jitter || mean < self.config.beacon_min_interval_secs {
            return;
        }
        self.connections.remove(&key);
        out.push(
            Alert::security(Severity::Medium, "beacon", "Possible beaconing detected")
                .protocol(p.display_protocol())
                .details(format!(
                    "{} connects to {}:{} every {:.1}s (jitter {:.1}%)",
                    key.0,
                    key.1,
                    key.2,
                    mean,
                    jitter * 100.0
                ))
                .on(ItemRef::Packet(p.no))
                .at(p.timestamp),
        );
        self.beacons.insert(key, p.timestamp);
    }

    fn broadcast_storm(&mut self, p: &Packet, out: &mut Vec<Alert>) {
        if !p.is_broadcast() {
            return;
        }
        let window = self.config.broadcast_window_secs as f64;
        self.broadcasts.push_back(p.timestamp);
        while self.broadcasts.front().is_some_and(|t| seconds(*t, p.timestamp) > window) {
            self.broadcasts.pop_front();
        }
        if self.broadcasts.len() <= self.config.broadcast_threshold {
            return;
        }
        let elapsed = self.broadcasts.front().map_or(0.0, |t| seconds(*t, p.timestamp));
        out.push(
            Alert::security(Severity::Medium, "broadcast_storm", "Broadcast storm detected")
                .protocol(p.display_protocol())
                .details(format!("{} broadcasts in {:.1}s", self.broadcasts.len(), elapsed))
                .on(ItemRef::Packet(p.no))
                .at(p.timestamp),
        );
        self.broadcasts.clear();
    }
}

/// Sweep once, log the alerts and announce them. Returns how many were kept.
fn run_sweep(detector: &Mutex<AggregateDetector>, store: &Store<Packet>, alerts: &AlertLog, bus: &EventBus) -> usize {
    let (epoch, raised) = detector.lock().sweep(store);
    let mut kept = 0;
    for alert in raised {
        if alerts.record(epoch, alert.clone()) {
            bus.publish(Event::alert(alert));
            kept += 1;
        }
    }
    kept
}

/// Runs an `AggregateDetector` every `aggregate_interval_secs` on a tokio task.
/// Queries can force a sweep with [`AggregateMonitor::sweep`].
pub struct AggregateMonitor {
    detector: Arc<Mutex<AggregateDetector>>,
    store: Arc<Store<Packet>>,
    alerts: Arc<AlertLog>,
    bus: EventBus,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl AggregateMonitor {
    /// Spawn the sweep task. Must be called inside a tokio runtime.
    pub fn start(config: &AlertConfig, store: Arc<Store<Packet>>, alerts: Arc<AlertLog>, bus: EventBus) -> Self {
        let detector = Arc::new(Mutex::new(AggregateDetector::new(config)));
        let (shutdown, mut stopped) = watch::channel(false);
        let period = Duration::from_secs(config.aggregate_interval_secs.max(1));

        let task = {
            let detector = Arc::clone(&detector);
            let store = Arc::clone(&store);
            let alerts = Arc::clone(&alerts);
            let bus = bus.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                let mut pressure = tokio::time::interval(PRESSURE_CHECK.min(period));
                pressure.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    let kept = tokio::select! {
                        _ = ticker.tick() => run_sweep(&detector, &store, &alerts, &bus),
                        _ = pressure.tick() => {
                            if !detector.lock().behind(&store) {
                                continue;
                            }
                            run_sweep(&detector, &store, &alerts, &bus)
                        }
                        _ = stopped.changed() => break,
                    };
                    if kept > 0 {
                        tracing::debug!(kept, "aggregate alerts raised");
                    }
                }
                tracing::debug!("aggregate monitor stopped");
            })
        };

        Self { detector, store, alerts, bus, shutdown, task: Some(task) }
    }

    pub fn sweep(&self) -> usize {
        run_sweep(&self.detector, &self.store, &self.alerts, &self.bus)
    }

    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for AggregateMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{packets, synth};
    use chrono::Duration as Span;
    use trawl_core::RawFrame;

    fn fill(store: &Store<Packet>, frames: Vec<RawFrame>) {
        for p in packets(frames) {
            store.append((*p).clone());
        }
    }

    fn categories(alerts: &[Alert]) -> Vec<&str> {
        alerts.iter().map(|a| a.category.as_str()).collect()
    }

    #[test]
    fn test_port_scan_raised_once() {
        let store = Store::new(10_000);
        let mut detector = AggregateDetector::new(&AlertConfig::default());
        let mut s = synth();

        fill(&store, (1..=25).map(|port| s.syn("10.0.0.66", "10.0.0.2", 40000, port)).collect());
        let (epoch, alerts) = detector.sweep(&store);
        assert_eq!(epoch, 0);
        assert_eq!(categories(&alerts), vec!["port_scan"]);
        assert_eq!(alerts[0].item, ItemRef::Packet(21));
        assert_eq!(detector.watermark(), 25);

        assert!(detector.sweep(&store).1.is_empty());

        // a handful more ports is not a fresh scan
        fill(&store, (100..110).map(|port| s.syn("10.0.0.66", "10.0.0.2", 40000, port)).collect());
        assert!(detector.sweep(&store).1.is_empty());
    }

    #[test]
    fn test_scan_ignores_large_packets_and_slow_probes() {
        let store = Store::new(10_000);
        let mut detector = AggregateDetector::new(&AlertConfig::default());
        let mut s = synth();

        let mut frames: Vec<RawFrame> =
            (1..=30).map(|port| s.udp("10.0.0.66", "10.0.0.2", 5000, port, &[0u8; 200])).collect();
        for port in 1..=30 {
            s.advance(Span::seconds(5));
            frames.push(s.syn("10.0.0.67", "10.0.0.2", 40000, port));
        }
        fill(&store, frames);
        assert!(detector.sweep(&store).1.is_empty());
    }

    #[test]
    fn test_beacon_detection() {
        let store = Store::new(10_000);
        let mut detector = AggregateDetector::new(&AlertConfig::default());
        let mut s = synth();

        let mut frames = Vec::new();
        for i in 0..8u16 {
            frames.push(s.syn("10.0.0.5", "203.0.113.9", 50000 + i, 443));
            s.advance(Span::seconds(10));
        }
        for (i, gap) in [1, 30, 2, 50, 3, 7, 90].into_iter().enumerate() {
            frames.push(s.syn("10.0.0.6", "203.0.113.9", 50000 + i as u16, 443));
            s.advance(Span::seconds(gap));
        }
        fill(&store, frames);

        let (_, alerts) = detector.sweep(&store);
        assert_eq!(categories(&alerts), vec!["beacon"]);
        let details = alerts[0].details.clone().unwrap_or_default();
        assert!(details.starts_with("10.0.0.5 connects to 203.0.113.9:443"), "{details}");
    }

    #[test]
    fn test_broadcast_storm() {
        let store = Store::new(10_000);
        let mut detector = AggregateDetector::new(&AlertConfig::default());
        let mut s = synth();

        fill(&store, (0..150).map(|_| s.arp_request("10.0.0.1", "10.0.0.9")).collect());
        let (_, alerts) = detector.sweep(&store);
        assert_eq!(categories(&alerts), vec!["broadcast_storm"]);
        assert_eq!(alerts[0].severity, Severity::Medium);
    }

    #[test]
    fn test_clear_starts_over() {
        let store = Store::new(10_000);
        let mut detector = AggregateDetector::new(&AlertConfig::default());
        let mut s = synth();

        fill(&store, (1..=25).map(|port| s.syn("10.0.0.66", "10.0.0.2", 40000, port)).collect());
        assert_eq!(detector.sweep(&store).1.len(), 1);

        store.clear();
        fill(&store, (1..=25).map(|port| s.syn("10.0.0.66", "10.0.0.2", 40000, port)).collect());
        let (epoch, alerts) = detector.sweep(&store);
        assert_eq!(epoch, 1);
        assert_eq!(alerts.len(), 1);
        assert_eq!(detector.watermark(), 25);
    }

    #[test]
    fn test_state_stays_bounded() {
        let config = AlertConfig { max_tracked: 50, ..AlertConfig::default() };
        let store = Store::new(100);
        let mut detector = AggregateDetector::new(&config);
        let mut s = synth();

        for round in 0..20u16 {
            let frames = (0..100u16)
                .map(|i| {
                    let src = format!("10.{}.{}.{}", round, i / 200, i % 200 + 1);
                    s.syn(&src, "192.168.1.10", 40000 + i, 443)
                })
                .collect();
            fill(&store, frames);
            detector.sweep(&store);
            assert_eq!(store.len(), 100);
            assert!(detector.scans.len() <= 50, "scans {}", detector.scans.len());
            assert!(detector.connections.len() <= 50, "connections {}", detector.connections.len());
        }
        assert_eq!(detector.skipped(), 0);
    }

    #[test]
    fn test_quiet_sources_are_forgotten() {
        let store = Store::new(10_000);
        let mut detector = AggregateDetector::new(&AlertConfig::default());
        let mut s = synth();

        fill(&store, vec![s.syn("10.0.0.1", "10.0.0.2", 40000, 22)]);
        detector.sweep(&store);
        assert_eq!(detector.scans.len(), 1);
        assert_eq!(detector.connections.len(), 1);

        s.advance(Span::seconds(120));
        fill(&store, vec![s.udp("10.0.0.9", "10.0.0.2", 5000, 53, &[0u8; 10])]);
        detector.sweep(&store);
        assert!(!detector.scans.contains_key("10.0.0.1"));
        assert_eq!(detector.connections.len(), 1);

        s.advance(Span::seconds(3600));
        fill(&store, vec![s.udp("10.0.0.9", "10.0.0.2", 5000, 53, &[0u8; 10])]);
        detector.sweep(&store);
        assert!(detector.connections.is_empty());
    }

    #[test]
    fn test_evicted_packets_are_counted() {
        let store = Store::new(10);
        let mut detector = AggregateDetector::new(&AlertConfig::default());
        let mut s = synth();

        fill(&store, (0..4).map(|i| s.syn("10.0.0.1", "10.0.0.2", 40000 + i, 80)).collect());
        assert!(!detector.behind(&store));
        fill(&store, vec![s.syn("10.0.0.1", "10.0.0.2", 40010, 80)]);
        assert!(detector.behind(&store));
        detector.sweep(&store);
        assert!(!detector.behind(&store));

        fill(&store, (0..30).map(|i| s.syn("10.0.0.1", "10.0.0.2", 41000 + i, 80)).collect());
        detector.sweep(&store);
        assert_eq!(detector.skipped(), 20);
        assert_eq!(detector.watermark(), 35);
    }

    #[tokio::test]
    async fn test_monitor_records_and_publishes() {
        let store = Arc::new(Store::new(10_000));
        let alerts = Arc::new(AlertLog::new(100));
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();

        let mut s = synth();
        fill(&store, (1..=25).map(|port| s.syn("10.0.0.66", "10.0.0.2", 40000, port)).collect());

        let monitor = AggregateMonitor::start(&AlertConfig::default(), store.clone(), alerts.clone(), bus);
        monitor.sweep();
        monitor.stop().await;

        let logged = alerts.list(store.epoch(), None);
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].category, "port_scan");
        assert!(matches!(rx.try_recv(), Ok(Event::SecurityAlert(a)) if a.category == "port_scan"));
    }
}
