//! Per-packet rules
//!
//! Cheap checks run synchronously by the ingest pipeline on every packet.
//! Port and size rules fire once per conversation; credential and ARP rules
//! fire on every occurrence. Both the conversation memory and the ARP table
//! are capped at `alerts.max_tracked` entries, least recently seen first out.
//!
//! The credential rule reads payload bytes, so it stays silent when capture
//! runs with `capture.keep_raw` off.

use base64::Engine;
use lazy_static::lazy_static;
use regex::bytes::Regex;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use trawl_config::AlertConfig;
use trawl_core::{proto, Alert, Packet, Severity, TcpFlags};
use trawl_store::Inspector;

use crate::trim_oldest;

/// Cleartext protocols by well-known port.
pub const UNENCRYPTED_PORTS: &[(u16, &str, Severity)] = &[
    (21, "FTP", Severity::Medium),
    (23, "Telnet", Severity::High),
    (80, "HTTP", Severity::Low),
    (110, "POP3", Severity::Medium),
    (143, "IMAP", Severity::Medium),
    (3389, "RDP (Unencrypted)", Severity::Critical),
];

/// Ports commonly used by backdoors and C&C channels.
pub const SUSPICIOUS_PORTS: &[(u16, &str)] = &[
    (4444, "Metasploit default"),
    (5555, "Android Debug Bridge"),
    (6666, "Common backdoor"),
    (6667, "IRC (possible botnet C&C)"),
    (6668, "IRC (possible botnet C&C)"),
    (6669, "IRC (possible botnet C&C)"),
    (31337, "Back Orifice trojan"),
    (12345, "NetBus trojan"),
    (1337, "Leet port (often malicious)"),
];

lazy_static! {
    static ref BASIC_AUTH: Regex = Regex::new(r"(?i)authorization:\s*basic\s+([A-Za-z0-9+/=]+)").unwrap();
    static ref LOGIN_COMMAND: Regex = Regex::new(r"(?im)^(USER|PASS|LOGIN)\s+(\S+)").unwrap();
    static ref FORM_PASSWORD: Regex = Regex::new(r"(?i)(?:^|[&?\s])(?:password|passwd|pwd|pass)=[^&\s]+").unwrap();
}

/// Username from a Basic credential, never the password.
pub(crate) fn basic_user(encoded: &[u8]) -> Option<String> {
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, _) = text.split_once(':')?;
    Some(user.to_string())
}

fn endpoints(p: &Packet) -> String {
    match (p.src_port, p.dst_port) {
        (Some(sport), Some(dport)) => format!("{}:{} → {}:{}", p.source, sport, p.destination, dport),
        _ => format!("{} → {}", p.source, p.destination),
    }
}

type ConversationKey = (&'static str, String, String, u16);

/// Unordered conversation key for once-per-conversation rules.
fn conversation_key(category: &'static str, p: &Packet, port: u16) -> ConversationKey {
    let (a, b) = if p.source <= p.destination {
        (p.source.clone(), p.destination.clone())
    } else {
        (p.destination.clone(), p.source.clone())
    };
    (category, a, b, port)
}

pub struct PacketInspector {
    large_packet_threshold: usize,
    max_tracked: usize,
    /// Conversations already reported, with when they were last seen
    seen: HashMap<ConversationKey, DateTime<Utc>>,
    /// IP to (MAC, last seen)
    arp_cache: HashMap<String, (String, DateTime<Utc>)>,
}

impl PacketInspector {
    pub fn new(config: &AlertConfig) -> Self {
        Self {
            large_packet_threshold: config.large_packet_threshold,
            max_tracked: config.max_tracked,
            seen: HashMap::new(),
            arp_cache: HashMap::new(),
        }
    }

    /// Keys of the per-conversation memory and the ARP table together.
    pub fn tracked(&self) -> usize {
        self.seen.len() + self.arp_cache.len()
    }

    fn once(&mut self, category: &'static str, p: &Packet, port: u16) -> bool {
        let key = conversation_key(category, p, port);
        if let Some(last) = self.seen.get_mut(&key) {
            *last = p.timestamp;
            return false;
        }
        self.seen.insert(key, p.timestamp);
        trim_oldest(&mut self.seen, self.max_tracked, |last| Some(*last));
        true
    }

    fn unencrypted(&mut self, p: &Packet, out: &mut Vec<Alert>) {
        let Some(port) = p.dst_port.or(p.src_port) else { return };
        let Some(&(_, name, severity)) = UNENCRYPTED_PORTS.iter().find(|(n, _, _)| *n == port) else {
            return;
        };
        if self.once("unencrypted_protocol", p, port) {
            out.push(
                Alert::security(severity, "unencrypted_protocol", format!("{name} detected (unencrypted)"))
                    .protocol(p.display_protocol())
                    .details(endpoints(p))
                    .at(p.timestamp),
            );
        }
    }

    fn suspicious_port(&mut self, p: &Packet, out: &mut Vec<Alert>) {
        let hit = [p.dst_port, p.src_port]
            .into_iter()
            .flatten()
            .find_map(|port| SUSPICIOUS_PORTS.iter().find(|(n, _)| *n == port));
        let Some(&(port, reason)) = hit else { return };
        if self.once("suspicious_port", p, port) {
            out.push(
                Alert::security(Severity::High, "suspicious_port", format!("Suspicious port {port} detected"))
                    .protocol(p.display_protocol())
                    .details(format!("{reason} - {} ↔ {}", p.source, p.destination))
                    .at(p.timestamp),
            );
        }
    }

    fn large_packet(&mut self, p: &Packet, out: &mut Vec<Alert>) {
        if p.protocol != proto::TCP || p.length <= self.large_packet_threshold {
            return;
        }
        if self.once("large_packet", p, 0) {
            out.push(
                Alert::security(Severity::Low, "large_packet", "Unusually large packet detected")
                    .protocol(proto::TCP)
                    .details(format!("{} bytes from {} to {}", p.length, p.source, p.destination))
                    .at(p.timestamp),
            );
        }
    }

    fn arp_spoofing(&mut self, p: &Packet, out: &mut Vec<Alert>) {
        let Some(arp) = &p.arp else { return };
        if arp.sender_ip == "0.0.0.0" {
            return;
        }
        let binding = (arp.sender_mac.clone(), p.timestamp);
        let previous = self.arp_cache.insert(arp.sender_ip.clone(), binding).map(|(mac, _)| mac);
        trim_oldest(&mut self.arp_cache, self.max_tracked, |(_, last)| Some(*last));
        if let Some(previous) = previous {
            if previous != arp.sender_mac {
                out.push(
                    Alert::security(Severity::Critical, "arp_spoofing", "ARP spoofing detected!")
                        .protocol(proto::ARP)
                        .details(format!("IP {} changed MAC from {} to {}", arp.sender_ip, previous, arp.sender_mac))
                        .at(p.timestamp),
                );
            }
        }
    }

    fn credentials(&mut self, p: &Packet, out: &mut Vec<Alert>) {
        let payload = p.payload();
        if payload.is_empty() {
            return;
        }

        let mut found = Vec::new();
        if let Some(caps) = BASIC_AUTH.captures(payload) {
            let user = caps.get(1).and_then(|m| basic_user(m.as_bytes()));
            found.push(match user {
                Some(user) => format!("HTTP Basic credentials for user '{user}'"),
                None => "HTTP Basic credentials".to_string(),
            });
        }
        for caps in LOGIN_COMMAND.captures_iter(payload).take(2) {
            let command = String::from_utf8_lossy(&caps[1]).to_uppercase();
            found.push(match command.as_str() {
                "PASS" => "cleartext PASS command".to_string(),
                _ => format!("cleartext {command} {}", String::from_utf8_lossy(&caps[2])),
            });
        }
        if FORM_PASSWORD.is_match(payload) {
            found.push("password field in form data".to_string());
        }

        if !found.is_empty() {
            out.push(
                Alert::security(Severity::High, "plaintext_credentials", "Plaintext credentials detected")
                    .protocol(p.display_protocol())
                    .details(format!("{}: {}", endpoints(p), found.join(", ")))
                    .at(p.timestamp),
            );
        }
    }

    fn expert(&mut self, p: &Packet, out: &mut Vec<Alert>) {
        if p.protocol == proto::UNKNOWN {
            let malformed = p.info.starts_with("Malformed") || p.info.starts_with("Truncated");
            let (severity, category, message) = if malformed {
                (Severity::Medium, "malformed", "Malformed packet")
            } else {
                (Severity::Low, "unknown_protocol", "Unrecognized protocol")
            };
            out.push(Alert::expert(severity, category, message).protocol(proto::UNKNOWN).details(p.info.clone()).at(p.timestamp));
            return;
        }

        let Some(tcp) = &p.tcp else { return };
        if tcp.flags.has(TcpFlags::RST) {
            out.push(
                Alert::expert(Severity::Medium, "reset", "Connection reset (RST)")
                    .protocol(proto::TCP)
                    .details(endpoints(p))
                    .at(p.timestamp),
            );
        } else if tcp.window == 0 && !tcp.flags.has(TcpFlags::SYN) && !tcp.flags.has(TcpFlags::FIN) {
            out.push(
                Alert::expert(Severity::Medium, "zero_window", "TCP zero window")
                    .protocol(proto::TCP)
                    .details(endpoints(p))
                    .at(p.timestamp),
            );
        }
    }
}

impl Inspector<Packet> for PacketInspector {
    fn inspect(&mut self, p: &Packet) -> Vec<Alert> {
        let mut out = Vec::new();
        self.expert(p, &mut out);
        self.unencrypted(p, &mut out);
        self.suspicious_port(p, &mut out);
        self.large_packet(p, &mut out);
        self.arp_spoofing(p, &mut out);
        self.credentials(p, &mut out);
        out
    }

    fn reset(&mut self) {
        self.seen.clear();
        self.arp_cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{packets, synth};
    use chrono::Utc;
    use trawl_core::{AlertKind, TcpInfo};

    fn inspector() -> PacketInspector {
        PacketInspector::new(&AlertConfig::default())
    }

    fn run(frames: Vec<trawl_core::RawFrame>) -> Vec<Alert> {
        let mut inspector = inspector();
        packets(frames).iter().flat_map(|p| inspector.inspect(p)).collect()
    }

    #[test]
    fn test_unencrypted_once_per_conversation() {
        let mut s = synth();
        let alerts = run(vec![
            s.syn("10.0.0.1", "10.0.0.2", 40000, 23),
            s.syn("10.0.0.1", "10.0.0.2", 40001, 23),
            s.syn("10.0.0.1", "10.0.0.3", 40002, 23),
        ]);
        let telnet: Vec<_> = alerts.iter().filter(|a| a.category == "unencrypted_protocol").collect();
        assert_eq!(telnet.len(), 2);
        assert_eq!(telnet[0].severity, Severity::High);
        assert_eq!(telnet[0].message, "Telnet detected (unencrypted)");
        assert_eq!(telnet[0].kind, AlertKind::Security);
    }

    #[test]
    fn test_suspicious_ports() {
        let mut s = synth();
        let alerts = run(vec![
            s.syn("10.0.0.1", "10.0.0.2", 40000, 4444),
            s.udp("10.0.0.1", "10.0.0.2", 6667, 50000, b"x"),
            s.syn("10.0.0.1", "10.0.0.2", 40000, 4443),
        ]);
        let ports: Vec<_> = alerts.iter().filter(|a| a.category == "suspicious_port").map(|a| a.message.clone()).collect();
        assert_eq!(ports, vec!["Suspicious port 4444 detected", "Suspicious port 6667 detected"]);
    }

    #[test]
    fn test_large_tcp_packet() {
        let mut s = synth();
        let alerts = run(vec![
            s.tcp("10.0.0.1", "10.0.0.2", 40000, 9000, TcpFlags::ACK, 1, &[0u8; 1600]),
            s.udp("10.0.0.1", "10.0.0.2", 40000, 9000, &[0u8; 1600]),
        ]);
        let large: Vec<_> = alerts.iter().filter(|a| a.category == "large_packet").collect();
        assert_eq!(large.len(), 1);
        assert_eq!(large[0].severity, Severity::Low);
    }

    #[test]
    fn test_arp_spoofing() {
        let mut s = synth();
        let alerts = run(vec![
            s.arp_reply("10.0.0.1", [2, 0, 0, 0, 0, 1], "10.0.0.5"),
            s.arp_reply("10.0.0.1", [2, 0, 0, 0, 0, 1], "10.0.0.5"),
            s.arp_reply("10.0.0.1", [2, 0, 0, 0, 0, 0x66], "10.0.0.5"),
        ]);
        let spoofs: Vec<_> = alerts.iter().filter(|a| a.category == "arp_spoofing").collect();
        assert_eq!(spoofs.len(), 1);
        assert_eq!(spoofs[0].severity, Severity::Critical);
        assert!(spoofs[0].details.as_deref().unwrap_or_default().contains("02:00:00:00:00:66"));
    }

    #[test]
    fn test_memory_is_capped() {
        let config = AlertConfig { max_tracked: 40, ..AlertConfig::default() };
        let mut inspector = PacketInspector::new(&config);
        let mut s = synth();
        let frames = (0..500u16)
            .flat_map(|i| {
                let host = format!("10.0.{}.{}", i / 250, i % 250 + 1);
                let mac = [2, 0, 0, 0, (i >> 8) as u8, i as u8];
                vec![s.syn(&host, "10.1.0.1", 40000, 23), s.arp_reply(&host, mac, "10.1.0.1")]
            })
            .collect();
        let alerts: Vec<Alert> = packets(frames).iter().flat_map(|p| inspector.inspect(p)).collect();

        assert_eq!(alerts.iter().filter(|a| a.category == "unencrypted_protocol").count(), 500);
        assert!(inspector.seen.len() <= 40);
        assert!(inspector.arp_cache.len() <= 40);
        assert!(inspector.tracked() <= 80);

        // the newest conversation is still remembered
        let again = packets(vec![s.syn("10.0.1.250", "10.1.0.1", 40001, 23)]);
        assert!(inspector.inspect(&again[0]).iter().all(|a| a.category != "unencrypted_protocol"));
    }

    #[test]
    fn test_plaintext_credentials() {
        let mut s = synth();
        let alerts = run(vec![
            s.tcp(
                "10.0.0.1",
                "10.0.0.2",
                40000,
                8000,
                TcpFlags::PSH | TcpFlags::ACK,
                1,
                b"GET / HTTP/1.1\r\nHost: x\r\nAuthorization: Basic YWxpY2U6czNjcmV0\r\n\r\n",
            ),
            s.tcp("10.0.0.1", "10.0.0.2", 40001, 21, TcpFlags::PSH | TcpFlags::ACK, 1, b"USER bob\r\n"),
            s.tcp("10.0.0.1", "10.0.0.2", 40002, 8000, TcpFlags::PSH | TcpFlags::ACK, 1, b"user=bob&password=hunter2"),
            s.tcp("10.0.0.1", "10.0.0.2", 40003, 8000, TcpFlags::PSH | TcpFlags::ACK, 1, b"nothing to see"),
        ]);
        let creds: Vec<_> = alerts.iter().filter(|a| a.category == "plaintext_credentials").collect();
        assert_eq!(creds.len(), 3);
        let basic = creds[0].details.clone().unwrap_or_default();
        assert!(basic.contains("alice"));
        assert!(!basic.contains("s3cret"));
        assert!(creds[1].details.clone().unwrap_or_default().contains("USER bob"));
    }

    #[test]
    fn test_credentials_need_raw_bytes() {
        let mut s = synth();
        let frame = s.tcp("10.0.0.1", "10.0.0.2", 40000, 21, TcpFlags::PSH | TcpFlags::ACK, 1, b"PASS hunter2\r\n");
        let creds = |keep_raw: bool| {
            let p = trawl_capture::dissect(&frame, frame.timestamp, keep_raw);
            inspector().inspect(&p).into_iter().filter(|a| a.category == "plaintext_credentials").count()
        };
        assert_eq!(creds(true), 1);
        assert_eq!(creds(false), 0);
    }

    #[test]
    fn test_expert_alerts() {
        let mut rst = Packet::new(Utc::now(), 0.0, 60);
        rst.protocol = proto::TCP.to_string();
        rst.tcp = Some(TcpInfo { seq: 1, ack: 1, flags: TcpFlags(TcpFlags::RST | TcpFlags::ACK), window: 0, payload_len: 0 });

        let mut zero = rst.clone();
        zero.tcp = Some(TcpInfo { seq: 1, ack: 1, flags: TcpFlags(TcpFlags::ACK), window: 0, payload_len: 0 });

        let mut broken = Packet::new(Utc::now(), 0.0, 20);
        broken.info = "Malformed IPv4 header (ihl=3)".to_string();

        let mut inspector = inspector();
        let categories: Vec<String> = [rst, zero, broken]
            .iter()
            .flat_map(|p| inspector.inspect(p))
            .filter(|a| a.kind == AlertKind::Expert)
            .map(|a| a.category)
            .collect();
        assert_eq!(categories, vec!["reset", "zero_window", "malformed"]);
    }

    #[test]
    fn test_reset_forgets_state() {
        let mut s = synth();
        let list = packets(vec![s.syn("10.0.0.1", "10.0.0.2", 40000, 23)]);
        let mut inspector = inspector();
        assert_eq!(inspector.inspect(&list[0]).len(), 1);
        assert!(inspector.inspect(&list[0]).is_empty());
        inspector.reset();
        assert_eq!(inspector.inspect(&list[0]).len(), 1);
    }
}
