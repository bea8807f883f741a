//! Conversations and endpoints

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use trawl_core::{proto, Packet};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Eth,
    #[default]
    Ip,
    Tcp,
    Udp,
}

impl FromStr for ConversationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "eth" | "ethernet" => Ok(ConversationKind::Eth),
            "ip" | "ipv4" | "ipv6" => Ok(ConversationKind::Ip),
            "tcp" => Ok(ConversationKind::Tcp),
            "udp" => Ok(ConversationKind::Udp),
            other => Err(format!("unknown conversation type '{other}'")),
        }
    }
}

impl fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConversationKind::Eth => "eth",
            ConversationKind::Ip => "ip",
            ConversationKind::Tcp => "tcp",
            ConversationKind::Udp => "udp",
        };
        f.write_str(name)
    }
}

type Side = (String, Option<u16>);

/// Both ends of a packet for the given grouping, or `None` when the packet
/// does not belong to it.
fn sides(p: &Packet, kind: ConversationKind) -> Option<(Side, Side)> {
    match kind {
        ConversationKind::Eth => {
            let link = p.link.as_ref()?;
            Some(((link.src_mac.clone(), None), (link.dst_mac.clone(), None)))
        }
        ConversationKind::Ip => {
            p.source_ip()?;
            p.destination_ip()?;
            if p.protocol == proto::ARP {
                return None;
            }
            Some(((p.source.clone(), None), (p.destination.clone(), None)))
        }
        ConversationKind::Tcp | ConversationKind::Udp => {
            let wanted = if kind == ConversationKind::Tcp { proto::TCP } else { proto::UDP };
            if p.protocol != wanted {
                return None;
            }
            Some(((p.source.clone(), p.src_port), (p.destination.clone(), p.dst_port)))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub address_a: String,
    pub address_b: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_a: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_b: Option<u16>,
    pub packets: u64,
    pub bytes: u64,
    #[serde(rename = "packetsAtoB")]
    pub packets_a_to_b: u64,
    #[serde(rename = "bytesAtoB")]
    pub bytes_a_to_b: u64,
    #[serde(rename = "packetsBtoA")]
    pub packets_b_to_a: u64,
    #[serde(rename = "bytesBtoA")]
    pub bytes_b_to_a: u64,
    /// Seconds since capture start
    pub start: f64,
    /// Seconds
    pub duration: f64,
}

/// Conversations keyed by the unordered pair of ends, in first-seen order.
/// Side A is whichever end sent the first packet.
pub fn conversations(packets: &[Arc<Packet>], kind: ConversationKind) -> Vec<Conversation> {
    let mut index: HashMap<(Side, Side), usize> = HashMap::new();
    let mut out: Vec<Conversation> = Vec::new();

    for p in packets {
        let Some((src, dst)) = sides(p, kind) else { continue };
        let bytes = p.length as u64;

        let (slot, a_to_b) = match index.get(&(src.clone(), dst.clone())) {
            Some(&i) => (i, true),
            None => match index.get(&(dst.clone(), src.clone())) {
                Some(&i) => (i, false),
                None => {
                    out.push(Conversation {
                        address_a: src.0.clone(),
                        address_b: dst.0.clone(),
                        port_a: src.1,
                        port_b: dst.1,
                        packets: 0,
                        bytes: 0,
                        packets_a_to_b: 0,
                        bytes_a_to_b: 0,
                        packets_b_to_a: 0,
                        bytes_b_to_a: 0,
                        start: p.relative_time,
                        duration: 0.0,
                    });
                    index.insert((src, dst), out.len() - 1);
                    (out.len() - 1, true)
                }
            },
        };

        let conv = &mut out[slot];
        conv.packets += 1;
        conv.bytes += bytes;
        if a_to_b {
            conv.packets_a_to_b += 1;
            conv.bytes_a_to_b += bytes;
        } else {
            conv.packets_b_to_a += 1;
            conv.bytes_b_to_a += bytes;
        }
        conv.duration = (p.relative_time - conv.start).max(conv.duration);
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub packets: u64,
    pub bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
}

impl Endpoint {
    fn new(side: &Side) -> Self {
        Self {
            address: side.0.clone(),
            port: side.1,
            packets: 0,
            bytes: 0,
            tx_packets: 0,
            tx_bytes: 0,
            rx_packets: 0,
            rx_bytes: 0,
        }
    }
}

/// Endpoints sorted by packet count, busiest first.
pub fn endpoints(packets: &[Arc<Packet>], kind: ConversationKind) -> Vec<Endpoint> {
    let mut table: HashMap<Side, Endpoint> = HashMap::new();

    for p in packets {
        let Some((src, dst)) = sides(p, kind) else { continue };
        let bytes = p.length as u64;

        let tx = table.entry(src.clone()).or_insert_with(|| Endpoint::new(&src));
        tx.packets += 1;
        tx.bytes += bytes;
        tx.tx_packets += 1;
        tx.tx_bytes += bytes;

        let rx = table.entry(dst.clone()).or_insert_with(|| Endpoint::new(&dst));
        rx.packets += 1;
        rx.bytes += bytes;
        rx.rx_packets += 1;
        rx.rx_bytes += bytes;
    }

    let mut out: Vec<Endpoint> = table.into_values().collect();
    out.sort_by(|a, b| {
        b.packets
            .cmp(&a.packets)
            .then_with(|| a.address.cmp(&b.address))
            .then_with(|| a.port.cmp(&b.port))
    });
    out
}
