//! trawl analysis
//!
//! Statistics views recomputed over store snapshots, plus the rule sets that
//! turn packets and proxy transactions into expert and security alerts.
//!
//! # Modules
//!
//! - `hierarchy` - Protocol hierarchy with application-protocol children
//! - `conversations` - Conversations and endpoints per address family/transport
//! - `iograph` - Fixed-width I/O buckets with top-N protocol breakdown
//! - `tcp` - TCP stream health (retransmissions, out-of-order)
//! - `lengths` - Packet length distribution
//! - `rules` - Per-packet expert and security rules
//! - `http_rules` - Per-transaction rules for proxied HTTP
//! - `aggregate` - Timer-driven scan, beacon and broadcast-storm detection

pub mod aggregate;
pub mod conversations;
pub mod hierarchy;
pub mod http_rules;
pub mod iograph;
pub mod lengths;
pub mod rules;
pub mod tcp;

pub use aggregate::{AggregateDetector, AggregateMonitor};
pub use conversations::{conversations, endpoints, Conversation, ConversationKind, Endpoint};
pub use hierarchy::{protocol_hierarchy, ProtocolStat};
pub use http_rules::TransactionInspector;
pub use iograph::{io_graph, IoBucket};
pub use lengths::{length_stats, LengthBucket, LengthStats};
pub use rules::PacketInspector;
pub use tcp::{tcp_streams, TcpStreamHealth};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::hash::Hash;

/// `part / total` as a percentage with two decimals.
pub(crate) fn percent(part: u64, total: u64) -> String {
    if total == 0 {
        return "0.00".to_string();
    }
    format!("{:.2}", part as f64 * 100.0 / total as f64)
}

/// Once `map` holds more than `max` keys, keep the most recently active
/// three quarters of `max`. Returns how many keys were dropped.
pub(crate) fn trim_oldest<K, V, F>(map: &mut HashMap<K, V>, max: usize, last_active: F) -> usize
where
    K: Clone + Eq + Hash,
    F: Fn(&V) -> Option<DateTime<Utc>>,
{
    if map.len() <= max {
        return 0;
    }
    let keep = (max - max / 4).max(1);
    let mut ages: Vec<(Option<DateTime<Utc>>, K)> = map.iter().map(|(k, v)| (last_active(v), k.clone())).collect();
    ages.sort_by(|a, b| b.0.cmp(&a.0));
    let dropped = ages.len() - keep;
    for (_, key) in ages.into_iter().skip(keep) {
        map.remove(&key);
    }
    dropped
}
