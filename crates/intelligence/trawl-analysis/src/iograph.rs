//! I/O graph

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use trawl_core::Packet;

/// Upper bound on buckets per graph; the interval is widened to stay under it.
pub const MAX_BUCKETS: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IoBucket {
    /// Bucket start, seconds since the first packet
    pub time: f64,
    pub packets: u64,
    pub bytes: u64,
    pub avg_packet_size: f64,
    /// Packet counts of the busiest protocols in this bucket
    pub protocols: BTreeMap<String, u64>,
}

/// Fixed-width buckets relative to the first packet. Empty buckets between
/// busy ones are kept so the series is contiguous.
pub fn io_graph(packets: &[Arc<Packet>], interval: f64, top_n: usize) -> Vec<IoBucket> {
    let Some(first) = packets.first() else {
        return Vec::new();
    };
    let base = first.timestamp;
    let span = packets
        .iter()
        .map(|p| (p.timestamp - base).num_microseconds().unwrap_or(0) as f64 / 1e6)
        .fold(0.0_f64, f64::max);

    let mut interval = if interval.is_finite() && interval > 0.0 { interval } else { 1.0 };
    if span / interval >= MAX_BUCKETS as f64 {
        interval = span / (MAX_BUCKETS - 1) as f64;
    }
    let count = (span / interval) as usize + 1;

    let mut buckets: Vec<(u64, u64, HashMap<&str, u64>)> = vec![(0, 0, HashMap::new()); count];
    for p in packets {
        let offset = (p.timestamp - base).num_microseconds().unwrap_or(0).max(0) as f64 / 1e6;
        let slot = ((offset / interval) as usize).min(count - 1);
        let bucket = &mut buckets[slot];
        bucket.0 += 1;
        bucket.1 += p.length as u64;
        *bucket.2.entry(p.display_protocol()).or_default() += 1;
    }

    buckets
        .into_iter()
        .enumerate()
        .map(|(i, (packets, bytes, protocols))| {
            let mut ranked: Vec<(&str, u64)> = protocols.into_iter().collect();
            ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
            ranked.truncate(top_n);
            IoBucket {
                time: i as f64 * interval,
                packets,
                bytes,
                avg_packet_size: if packets == 0 { 0.0 } else { bytes as f64 / packets as f64 },
                protocols: ranked.into_iter().map(|(name, n)| (name.to_string(), n)).collect(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{packets, synth};
    use chrono::Duration;

    #[test]
    fn test_buckets_are_contiguous() {
        let mut s = synth();
        let mut frames = vec![s.udp("10.0.0.1", "10.0.0.2", 1, 53, b"a"), s.syn("10.0.0.1", "10.0.0.2", 1, 80)];
        s.advance(Duration::seconds(3));
        frames.push(s.ping("10.0.0.1", "10.0.0.2", 1));

        let graph = io_graph(&packets(frames), 1.0, 5);
        assert_eq!(graph.len(), 4);
        assert_eq!(graph[0].packets, 2);
        assert_eq!(graph[1].packets, 0);
        assert_eq!(graph[1].avg_packet_size, 0.0);
        assert_eq!(graph[3].packets, 1);
        assert_eq!(graph[3].time, 3.0);
        assert_eq!(graph[3].protocols.get("ICMP"), Some(&1));
    }

    #[test]
    fn test_top_n_protocols() {
        let mut s = synth();
        let mut frames = Vec::new();
        for i in 0..5 {
            frames.push(s.udp("10.0.0.1", "10.0.0.2", 1000 + i, 53, b"q"));
        }
        for i in 0..3 {
            frames.push(s.syn("10.0.0.1", "10.0.0.2", 2000 + i, 80));
        }
        frames.push(s.ping("10.0.0.1", "10.0.0.2", 1));

        let graph = io_graph(&packets(frames), 1.0, 2);
        assert_eq!(graph.len(), 1);
        assert_eq!(graph[0].protocols.len(), 2);
        assert_eq!(graph[0].protocols.get("DNS"), Some(&5));
        assert_eq!(graph[0].protocols.get("TCP"), Some(&3));
    }

    #[test]
    fn test_interval_widens_for_long_spans() {
        let mut s = synth();
        let mut frames = vec![s.ping("10.0.0.1", "10.0.0.2", 1)];
        s.advance(Duration::hours(10));
        frames.push(s.ping("10.0.0.1", "10.0.0.2", 2));

        let graph = io_graph(&packets(frames), 0.001, 3);
        assert!(graph.len() <= MAX_BUCKETS);
        assert_eq!(graph.iter().map(|b| b.packets).sum::<u64>(), 2);
        assert!(io_graph(&[], 1.0, 3).is_empty());
    }
}
