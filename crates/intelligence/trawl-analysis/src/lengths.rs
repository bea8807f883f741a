//! Packet length distribution

use crate::percent;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use trawl_core::Packet;

const BUCKETS: [(usize, Option<usize>); 7] = [
    (0, Some(79)),
    (80, Some(159)),
    (160, Some(319)),
    (320, Some(639)),
    (640, Some(1279)),
    (1280, Some(2559)),
    (2560, None),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LengthBucket {
    pub range: String,
    pub count: u64,
    pub percentage: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LengthStats {
    pub min_length: usize,
    pub max_length: usize,
    pub avg_length: f64,
    pub distribution: Vec<LengthBucket>,
}

pub fn length_stats(packets: &[Arc<Packet>]) -> LengthStats {
    let mut counts = [0u64; BUCKETS.len()];
    let (mut min, mut max, mut sum) = (usize::MAX, 0usize, 0u64);

    for p in packets {
        min = min.min(p.length);
        max = max.max(p.length);
        sum += p.length as u64;
        let slot = BUCKETS
            .iter()
            .position(|(_, hi)| hi.map_or(true, |hi| p.length <= hi))
            .unwrap_or(BUCKETS.len() - 1);
        counts[slot] += 1;
    }

    let total = packets.len() as u64;
    LengthStats {
        min_length: if total == 0 { 0 } else { min },
        max_length: max,
        avg_length: if total == 0 { 0.0 } else { sum as f64 / total as f64 },
        distribution: BUCKETS
            .iter()
            .zip(counts)
            .map(|((lo, hi), count)| LengthBucket {
                range: match hi {
                    Some(hi) => format!("{lo}-{hi}"),
                    None => format!("{lo}+"),
                },
                count,
                percentage: percent(count, total),
            })
            .collect(),
    }
}
