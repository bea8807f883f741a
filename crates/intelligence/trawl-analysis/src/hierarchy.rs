//! Protocol hierarchy

use crate::percent;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use trawl_core::Packet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolStat {
    pub protocol: String,
    pub packets: u64,
    pub bytes: u64,
    /// Share of all packets, two decimals
    pub percentage: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ProtocolStat>,
}

#[derive(Default)]
struct Tally {
    packets: u64,
    bytes: u64,
    children: HashMap<String, (u64, u64)>,
}

/// Group packets by transport protocol, then by application protocol.
///
/// Top-level percentages are of all packets and sum to 100 within rounding.
/// Child percentages are also of all packets, so a child never exceeds its
/// parent.
pub fn protocol_hierarchy(packets: &[Arc<Packet>]) -> Vec<ProtocolStat> {
    let total = packets.len() as u64;
    let mut groups: HashMap<&str, Tally> = HashMap::new();

    for p in packets {
        let tally = groups.entry(p.protocol.as_str()).or_default();
        tally.packets += 1;
        tally.bytes += p.length as u64;
        if let Some(app) = &p.app_protocol {
            let child = tally.children.entry(app.clone()).or_default();
            child.0 += 1;
            child.1 += p.length as u64;
        }
    }

    let mut stats: Vec<ProtocolStat> = groups
        .into_iter()
        .map(|(protocol, tally)| {
            let mut children: Vec<ProtocolStat> = tally
                .children
                .into_iter()
                .map(|(name, (packets, bytes))| ProtocolStat {
                    protocol: name,
                    packets,
                    bytes,
                    percentage: percent(packets, total),
                    children: Vec::new(),
                })
                .collect();
            sort(&mut children);
            ProtocolStat {
                protocol: protocol.to_string(),
                packets: tally.packets,
                bytes: tally.bytes,
                percentage: percent(tally.packets, total),
                children,
            }
        })
        .collect();
    sort(&mut stats);
    stats
}

fn sort(stats: &mut [ProtocolStat]) {
    stats.sort_by(|a, b| b.packets.cmp(&a.packets).then_with(|| a.protocol.cmp(&b.protocol)));
}
