//! Packets
//!
//! `RawFrame` is what a capture source yields; `Packet` is the dissected,
//! immutable record the store keeps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Protocol tags used in `Packet::protocol` and `Packet::app_protocol`.
pub mod proto {
    pub const ETHERNET: &str = "ETH";
    pub const ARP: &str = "ARP";
    pub const IPV4: &str = "IPv4";
    pub const IPV6: &str = "IPv6";
    pub const TCP: &str = "TCP";
    pub const UDP: &str = "UDP";
    pub const ICMP: &str = "ICMP";
    pub const ICMPV6: &str = "ICMPv6";
    pub const UNKNOWN: &str = "UNKNOWN";

    pub const HTTP: &str = "HTTP";
    pub const TLS: &str = "TLS";
    pub const DNS: &str = "DNS";
    pub const MDNS: &str = "MDNS";
    pub const SSH: &str = "SSH";
    pub const FTP: &str = "FTP";
    pub const TELNET: &str = "TELNET";
    pub const SMTP: &str = "SMTP";
    pub const POP3: &str = "POP3";
    pub const IMAP: &str = "IMAP";
    pub const DHCP: &str = "DHCP";
    pub const NTP: &str = "NTP";
    pub const SNMP: &str = "SNMP";
    pub const SSDP: &str = "SSDP";
    pub const RDP: &str = "RDP";

    /// Tags a display filter treats as protocol names rather than text.
    pub const KNOWN: &[&str] = &[
        ETHERNET, ARP, IPV4, IPV6, TCP, UDP, ICMP, ICMPV6, UNKNOWN, HTTP, TLS, DNS, MDNS, SSH,
        FTP, TELNET, SMTP, POP3, IMAP, DHCP, NTP, SNMP, SSDP, RDP,
    ];

    /// Case-insensitive lookup returning the canonical tag.
    pub fn canonical(name: &str) -> Option<&'static str> {
        let name = name.trim();
        // common aliases
        let name = match name.to_ascii_lowercase().as_str() {
            "ip" => IPV4,
            "ipv6" | "ip6" => IPV6,
            "icmp6" => ICMPV6,
            "https" | "ssl" => TLS,
            "eth" | "ethernet" => ETHERNET,
            _ => name,
        };
        KNOWN.iter().copied().find(|tag| tag.eq_ignore_ascii_case(name))
    }
}

/// Link-layer framing of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkType {
    Ethernet,
    /// Bare IPv4/IPv6 datagrams (pcap LINKTYPE_RAW)
    RawIp,
    Other(u32),
}

impl LinkType {
    pub fn linktype_code(&self) -> u32 {
        match self {
            LinkType::Ethernet => 1,
            LinkType::RawIp => 101,
            LinkType::Other(code) => *code,
        }
    }
}

/// A frame as read from a capture source, before dissection.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub timestamp: DateTime<Utc>,
    pub data: Vec<u8>,
    /// Length on the wire, which may exceed `data.len()` when truncated by snaplen
    pub orig_len: u32,
    pub link_type: LinkType,
}

impl RawFrame {
    pub fn ethernet(timestamp: DateTime<Utc>, data: Vec<u8>) -> Self {
        let orig_len = data.len() as u32;
        Self { timestamp, data, orig_len, link_type: LinkType::Ethernet }
    }
}

/// TCP control flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TcpFlags(pub u16);

impl TcpFlags {
    pub const FIN: u16 = 0x001;
    pub const SYN: u16 = 0x002;
    pub const RST: u16 = 0x004;
    pub const PSH: u16 = 0x008;
    pub const ACK: u16 = 0x010;
    pub const URG: u16 = 0x020;
    pub const ECE: u16 = 0x040;
    pub const CWR: u16 = 0x080;

    const NAMES: [(u16, &'static str); 8] = [
        (Self::SYN, "SYN"),
        (Self::FIN, "FIN"),
        (Self::RST, "RST"),
        (Self::PSH, "PSH"),
        (Self::ACK, "ACK"),
        (Self::URG, "URG"),
        (Self::ECE, "ECE"),
        (Self::CWR, "CWR"),
    ];

    pub fn has(&self, flag: u16) -> bool {
        self.0 & flag != 0
    }

    pub fn names(&self) -> Vec<&'static str> {
        Self::NAMES.iter().filter(|(bit, _)| self.has(*bit)).map(|(_, name)| *name).collect()
    }

    /// Connection opener: SYN without ACK.
    pub fn is_syn_only(&self) -> bool {
        self.has(Self::SYN) && !self.has(Self::ACK)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpInfo {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub payload_len: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkInfo {
    pub src_mac: String,
    pub dst_mac: String,
    pub ethertype: u16,
}

impl LinkInfo {
    pub fn is_broadcast(&self) -> bool {
        self.dst_mac.eq_ignore_ascii_case("ff:ff:ff:ff:ff:ff")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArpInfo {
    pub operation: u16,
    pub sender_mac: String,
    pub sender_ip: String,
    pub target_mac: String,
    pub target_ip: String,
}

/// A dissected packet. Immutable once appended to a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Packet {
    pub no: u64,
    pub timestamp: DateTime<Utc>,
    pub relative_time: f64,
    pub source: String,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_port: Option<u16>,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_protocol: Option<String>,
    pub length: usize,
    pub info: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<LinkInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arp: Option<ArpInfo>,
    /// Offset of the transport payload inside `raw`, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_offset: Option<usize>,
    #[serde(default, rename = "rawBuffer", skip_serializing_if = "Option::is_none")]
    pub raw: Option<Vec<u8>>,
}

impl Packet {
    /// An empty `UNKNOWN` packet for the dissector to fill in.
    pub fn new(timestamp: DateTime<Utc>, relative_time: f64, length: usize) -> Self {
        Self {
            no: 0,
            timestamp,
            relative_time,
            source: String::new(),
            destination: String::new(),
            src_port: None,
            dst_port: None,
            protocol: proto::UNKNOWN.to_string(),
            app_protocol: None,
            length,
            info: String::new(),
            ttl: None,
            link: None,
            tcp: None,
            arp: None,
            payload_offset: None,
            raw: None,
        }
    }

    /// Top-most protocol name, as shown in packet lists.
    pub fn display_protocol(&self) -> &str {
        self.app_protocol.as_deref().unwrap_or(&self.protocol)
    }

    pub fn is_protocol(&self, name: &str) -> bool {
        self.protocol.eq_ignore_ascii_case(name)
            || self.app_protocol.as_deref().is_some_and(|app| app.eq_ignore_ascii_case(name))
    }

    pub fn source_ip(&self) -> Option<IpAddr> {
        self.source.parse().ok()
    }

    pub fn destination_ip(&self) -> Option<IpAddr> {
        self.destination.parse().ok()
    }

    /// Transport payload bytes, when the raw frame was kept.
    pub fn payload(&self) -> &[u8] {
        match (&self.raw, self.payload_offset) {
            (Some(raw), Some(offset)) if offset <= raw.len() => &raw[offset..],
            _ => &[],
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination == "255.255.255.255"
            || self.destination.eq_ignore_ascii_case("ff:ff:ff:ff:ff:ff")
            || self.link.as_ref().is_some_and(LinkInfo::is_broadcast)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>6} {:>12.6} {} → {} {} {} {}",
            self.no,
            self.relative_time,
            self.source,
            self.destination,
            self.display_protocol(),
            self.length,
            self.info
        )
    }
}
