//! Frame dissection
//!
//! `dissect` is total: every header length is checked before the bytes behind
//! it are touched, and anything that does not parse comes back as an
//! `UNKNOWN` packet whose `info` says why.

use chrono::{DateTime, Utc};
use pnet::packet::arp::ArpPacket;
use pnet::packet::ethernet::EthernetPacket;
use pnet::packet::icmp::IcmpPacket;
use pnet::packet::icmpv6::Icmpv6Packet;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use trawl_core::{proto, ArpInfo, LinkInfo, LinkType, Packet, RawFrame, TcpFlags, TcpInfo};

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_ARP: u16 = 0x0806;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88a8;

const IP_ICMP: u8 = 1;
const IP_TCP: u8 = 6;
const IP_UDP: u8 = 17;
const IP_ICMPV6: u8 = 58;

const HTTP_METHODS: [&str; 9] = ["GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "CONNECT", "TRACE"];

pub fn dissect(frame: &RawFrame, capture_start: DateTime<Utc>, keep_raw: bool) -> Packet {
    let relative = (frame.timestamp - capture_start)
        .num_microseconds()
        .map(|us| us as f64 / 1_000_000.0)
        .unwrap_or(0.0)
        .max(0.0);
    let length = (frame.orig_len as usize).max(frame.data.len());
    let mut packet = Packet::new(frame.timestamp, relative, length);

    match frame.link_type {
        LinkType::Ethernet => ethernet(&mut packet, &frame.data),
        LinkType::RawIp => raw_ip(&mut packet, &frame.data, 0),
        LinkType::Other(code) => malformed(&mut packet, format!("Unsupported link type {code}")),
    }

    if keep_raw {
        packet.raw = Some(frame.data.clone());
    } else {
        packet.payload_offset = None;
    }
    packet
}

fn malformed(p: &mut Packet, reason: String) {
    p.protocol = proto::UNKNOWN.to_string();
    p.app_protocol = None;
    p.tcp = None;
    p.payload_offset = None;
    p.info = reason;
}

fn ethernet(p: &mut Packet, data: &[u8]) {
    let Some(eth) = EthernetPacket::new(data) else {
        return malformed(p, format!("Truncated Ethernet frame ({} bytes)", data.len()));
    };

    let mut ethertype = eth.get_ethertype().0;
    let mut offset = 14;
    if ethertype == ETHERTYPE_VLAN || ethertype == ETHERTYPE_QINQ {
        if data.len() < 18 {
            return malformed(p, "Truncated 802.1Q tag".to_string());
        }
        ethertype = u16::from_be_bytes([data[16], data[17]]);
        offset = 18;
    }

    let link = LinkInfo {
        src_mac: eth.get_source().to_string(),
        dst_mac: eth.get_destination().to_string(),
        ethertype,
    };
    p.source = link.src_mac.clone();
    p.destination = link.dst_mac.clone();
    p.link = Some(link);

    let payload = &data[offset..];
    match ethertype {
        ETHERTYPE_IPV4 => ipv4(p, payload, offset),
        ETHERTYPE_IPV6 => ipv6(p, payload, offset),
        ETHERTYPE_ARP => arp(p, payload),
        other => {
            p.protocol = proto::ETHERNET.to_string();
            p.info = format!("EtherType 0x{other:04x}");
        }
    }
}

fn raw_ip(p: &mut Packet, data: &[u8], base: usize) {
    match data.first().map(|b| b >> 4) {
        Some(4) => ipv4(p, data, base),
        Some(6) => ipv6(p, data, base),
        Some(v) => malformed(p, format!("Unknown IP version {v}")),
        None => malformed(p, "Empty frame".to_string()),
    }
}

fn ipv4(p: &mut Packet, data: &[u8], base: usize) {
    if data.len() < 20 {
        return malformed(p, format!("Truncated IPv4 header ({} bytes)", data.len()));
    }
    let version = data[0] >> 4;
    let ihl = (data[0] & 0x0f) as usize;
    if version != 4 {
        return malformed(p, format!("Malformed IPv4 header (version={version})"));
    }
    if ihl < 5 {
        return malformed(p, format!("Malformed IPv4 header (ihl={ihl})"));
    }
    let header_len = ihl * 4;
    if header_len > data.len() {
        return malformed(p, format!("Truncated IPv4 options (ihl={ihl}, {} bytes)", data.len()));
    }
    let total = u16::from_be_bytes([data[2], data[3]]) as usize;
    if total < header_len {
        return malformed(p, format!("Malformed IPv4 header (total length {total} < header {header_len})"));
    }
    let Some(ip) = Ipv4Packet::new(data) else {
        return malformed(p, "Truncated IPv4 header".to_string());
    };

    p.source = ip.get_source().to_string();
    p.destination = ip.get_destination().to_string();
    p.ttl = Some(ip.get_ttl());
    p.protocol = proto::IPV4.to_string();

    let next = ip.get_next_level_protocol().0;
    let fragment = ip.get_fragment_offset();
    if fragment != 0 {
        p.info = format!("Fragmented IP protocol (proto={next}, off={})", fragment as usize * 8);
        return;
    }

    // Snaplen may cut the datagram short of its total length
    let end = total.min(data.len());
    transport(p, next, &data[header_len..end], base + header_len);
}

fn ipv6(p: &mut Packet, data: &[u8], base: usize) {
    if data.len() < 40 {
        return malformed(p, format!("Truncated IPv6 header ({} bytes)", data.len()));
    }
    if data[0] >> 4 != 6 {
        return malformed(p, format!("Malformed IPv6 header (version={})", data[0] >> 4));
    }
    let Some(ip) = Ipv6Packet::new(data) else {
        return malformed(p, "Truncated IPv6 header".to_string());
    };

    p.source = ip.get_source().to_string();
    p.destination = ip.get_destination().to_string();
    p.ttl = Some(ip.get_hop_limit());
    p.protocol = proto::IPV6.to_string();

    let payload_len = ip.get_payload_length() as usize;
    let end = if payload_len == 0 { data.len() } else { (40 + payload_len).min(data.len()) };

    let mut next = ip.get_next_header().0;
    let mut offset = 40;
    for _ in 0..8 {
        let ext_len = match next {
            // hop-by-hop, routing, destination options
            0 | 43 | 60 => {
                if offset + 2 > end {
                    return malformed(p, "Truncated IPv6 extension header".to_string());
                }
                (data[offset + 1] as usize + 1) * 8
            }
            44 => {
                if offset + 8 > end {
                    return malformed(p, "Truncated IPv6 fragment header".to_string());
                }
                let frag = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) >> 3;
                if frag != 0 {
                    p.info = format!("IPv6 fragment (proto={}, off={})", data[offset], frag as usize * 8);
                    return;
                }
                8
            }
            51 => {
                if offset + 2 > end {
                    return malformed(p, "Truncated IPv6 authentication header".to_string());
                }
                (data[offset + 1] as usize + 2) * 4
            }
            _ => break,
        };
        if offset + ext_len > end {
            return malformed(p, "Truncated IPv6 extension header".to_string());
        }
        next = data[offset];
        offset += ext_len;
    }

    transport(p, next, &data[offset..end], base + offset);
}

fn transport(p: &mut Packet, next: u8, data: &[u8], base: usize) {
    match next {
        IP_TCP => tcp(p, data, base),
        IP_UDP => udp(p, data, base),
        IP_ICMP => icmp(p, data),
        IP_ICMPV6 => icmpv6(p, data),
        other => p.info = format!("IP protocol {other}"),
    }
}

fn tcp(p: &mut Packet, data: &[u8], base: usize) {
    if data.len() < 20 {
        return malformed(p, format!("Truncated TCP header ({} bytes)", data.len()));
    }
    let data_offset = (data[12] >> 4) as usize;
    let header_len = data_offset * 4;
    if data_offset < 5 || header_len > data.len() {
        return malformed(p, format!("Malformed TCP header (data offset={data_offset})"));
    }
    let Some(segment) = TcpPacket::new(data) else {
        return malformed(p, "Truncated TCP header".to_string());
    };

    let sport = segment.get_source();
    let dport = segment.get_destination();
    let flags = TcpFlags(u16::from_be_bytes([data[12] & 0x01, data[13]]));
    let payload = &data[header_len..];
    let info = TcpInfo {
        seq: segment.get_sequence(),
        ack: segment.get_acknowledgement(),
        flags,
        window: segment.get_window(),
        payload_len: payload.len(),
    };

    p.protocol = proto::TCP.to_string();
    p.src_port = Some(sport);
    p.dst_port = Some(dport);
    p.payload_offset = Some(base + header_len);
    p.info = format!(
        "{sport} → {dport} [{}] Seq={} Ack={} Win={} Len={}",
        flags.names().join(", "),
        info.seq,
        info.ack,
        info.window,
        info.payload_len
    );
    p.tcp = Some(info);

    if let Some(app) = application(sport, dport, payload, true) {
        p.app_protocol = Some(app.to_string());
        if let Some(summary) = app_summary(app, payload) {
            p.info = summary;
        }
    }
}

fn udp(p: &mut Packet, data: &[u8], base: usize) {
    if data.len() < 8 {
        return malformed(p, format!("Truncated UDP header ({} bytes)", data.len()));
    }
    let Some(datagram) = UdpPacket::new(data) else {
        return malformed(p, "Truncated UDP header".to_string());
    };

    let sport = datagram.get_source();
    let dport = datagram.get_destination();
    let declared = datagram.get_length() as usize;
    let end = if declared >= 8 { declared.min(data.len()) } else { data.len() };
    let payload = &data[8..end];

    p.protocol = proto::UDP.to_string();
    p.src_port = Some(sport);
    p.dst_port = Some(dport);
    p.payload_offset = Some(base + 8);
    p.info = format!("{sport} → {dport} Len={}", payload.len());

    if let Some(app) = application(sport, dport, payload, false) {
        p.app_protocol = Some(app.to_string());
        if let Some(summary) = app_summary(app, payload) {
            p.info = summary;
        }
    }
}

fn icmp(p: &mut Packet, data: &[u8]) {
    let Some(message) = IcmpPacket::new(data) else {
        return malformed(p, format!("Truncated ICMP header ({} bytes)", data.len()));
    };
    let kind = message.get_icmp_type().0;
    let code = message.get_icmp_code().0;
    let name = match kind {
        0 => Some("Echo (ping) reply"),
        3 => Some("Destination unreachable"),
        5 => Some("Redirect"),
        8 => Some("Echo (ping) request"),
        11 => Some("Time-to-live exceeded"),
        _ => None,
    };

    p.protocol = proto::ICMP.to_string();
    p.info = match name {
        Some(name) => format!("{name} Type={kind} Code={code}"),
        None => format!("Type={kind} Code={code}"),
    };
}

fn icmpv6(p: &mut Packet, data: &[u8]) {
    let Some(message) = Icmpv6Packet::new(data) else {
        return malformed(p, format!("Truncated ICMPv6 header ({} bytes)", data.len()));
    };
    let kind = message.get_icmpv6_type().0;
    let code = message.get_icmpv6_code().0;
    let name = match kind {
        1 => Some("Destination unreachable"),
        128 => Some("Echo (ping) request"),
        129 => Some("Echo (ping) reply"),
        133 => Some("Router Solicitation"),
        134 => Some("Router Advertisement"),
        135 => Some("Neighbor Solicitation"),
        136 => Some("Neighbor Advertisement"),
        _ => None,
    };

    p.protocol = proto::ICMPV6.to_string();
    p.info = match name {
        Some(name) => format!("{name} Type={kind} Code={code}"),
        None => format!("Type={kind} Code={code}"),
    };
}

fn arp(p: &mut Packet, data: &[u8]) {
    let Some(message) = ArpPacket::new(data) else {
        return malformed(p, format!("Truncated ARP message ({} bytes)", data.len()));
    };
    // Only Ethernet/IPv4 ARP has the fixed layout pnet decodes
    if data[4] != 6 || data[5] != 4 {
        return malformed(p, format!("Unsupported ARP address sizes (hw={}, proto={})", data[4], data[5]));
    }

    let info = ArpInfo {
        operation: message.get_operation().0,
        sender_mac: message.get_sender_hw_addr().to_string(),
        sender_ip: message.get_sender_proto_addr().to_string(),
        target_mac: message.get_target_hw_addr().to_string(),
        target_ip: message.get_target_proto_addr().to_string(),
    };

    p.protocol = proto::ARP.to_string();
    p.source = info.sender_ip.clone();
    p.destination = info.target_ip.clone();
    p.info = match info.operation {
        1 => format!("Who has {}? Tell {}", info.target_ip, info.sender_ip),
        2 => format!("{} is at {}", info.sender_ip, info.sender_mac),
        op => format!("ARP opcode {op}"),
    };
    p.arp = Some(info);
}

fn looks_like_http(payload: &[u8]) -> bool {
    payload.starts_with(b"HTTP/1.")
        || HTTP_METHODS.iter().any(|m| {
            payload.len() > m.len() && payload.starts_with(m.as_bytes()) && payload[m.len()] == b' '
        })
}

/// Application protocol by payload signature, then well-known port.
fn application(sport: u16, dport: u16, payload: &[u8], is_tcp: bool) -> Option<&'static str> {
    if !payload.is_empty() {
        if looks_like_http(payload) {
            return Some(proto::HTTP);
        }
        if payload.len() >= 3 && (0x14..=0x17).contains(&payload[0]) && payload[1] == 0x03 && payload[2] <= 0x04 {
            return Some(proto::TLS);
        }
        if payload.starts_with(b"SSH-") {
            return Some(proto::SSH);
        }
    } else if is_tcp {
        // Handshakes and bare ACKs stay plain TCP
        return None;
    }
    by_port(dport).or_else(|| by_port(sport))
}

fn by_port(port: u16) -> Option<&'static str> {
    Some(match port {
        20 | 21 => proto::FTP,
        22 => proto::SSH,
        23 => proto::TELNET,
        25 | 587 => proto::SMTP,
        53 => proto::DNS,
        67 | 68 => proto::DHCP,
        80 | 8080 => proto::HTTP,
        110 => proto::POP3,
        123 => proto::NTP,
        143 => proto::IMAP,
        161 | 162 => proto::SNMP,
        443 | 8443 => proto::TLS,
        1900 => proto::SSDP,
        3389 => proto::RDP,
        5353 => proto::MDNS,
        _ => return None,
    })
}

fn app_summary(app: &str, payload: &[u8]) -> Option<String> {
    match app {
        proto::HTTP if looks_like_http(payload) => {
            let line_end = payload.iter().position(|&b| b == b'\r' || b == b'\n').unwrap_or(payload.len());
            Some(String::from_utf8_lossy(&payload[..line_end.min(200)]).into_owned())
        }
        proto::DNS | proto::MDNS => dns_summary(payload),
        _ => None,
    }
}

fn dns_summary(payload: &[u8]) -> Option<String> {
    if payload.len() < 12 {
        return None;
    }
    let id = u16::from_be_bytes([payload[0], payload[1]]);
    let response = payload[2] & 0x80 != 0;
    let questions = u16::from_be_bytes([payload[4], payload[5]]);

    let kind = if response { "Standard query response" } else { "Standard query" };
    if questions == 0 {
        return Some(format!("{kind} 0x{id:04x}"));
    }

    let mut labels = Vec::new();
    let mut offset = 12;
    loop {
        let len = *payload.get(offset)? as usize;
        if len == 0 {
            offset += 1;
            break;
        }
        // Compression pointers do not occur in a first question name
        if len & 0xc0 != 0 || labels.len() >= 64 {
            return Some(format!("{kind} 0x{id:04x}"));
        }
        let label = payload.get(offset + 1..offset + 1 + len)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        offset += 1 + len;
    }
    let qtype = payload.get(offset..offset + 2).map(|b| u16::from_be_bytes([b[0], b[1]]));
    let qtype = match qtype {
        Some(1) => "A".to_string(),
        Some(2) => "NS".to_string(),
        Some(5) => "CNAME".to_string(),
        Some(12) => "PTR".to_string(),
        Some(15) => "MX".to_string(),
        Some(16) => "TXT".to_string(),
        Some(28) => "AAAA".to_string(),
        Some(33) => "SRV".to_string(),
        Some(65) => "HTTPS".to_string(),
        Some(other) => format!("TYPE{other}"),
        None => "?".to_string(),
    };
    Some(format!("{kind} 0x{id:04x} {qtype} {}", labels.join(".")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::{self, Synth};
    use std::net::Ipv4Addr;

    fn dissect_now(frame: &RawFrame) -> Packet {
        dissect(frame, frame.timestamp, true)
    }

    #[test]
    fn test_tcp_syn() {
        let mut synth = Synth::default();
        let frame = synth.tcp("10.0.0.1", "10.0.0.2", 40000, 443, TcpFlags::SYN | TcpFlags::ACK, 7, &[]);
        let p = dissect_now(&frame);

        assert_eq!(p.protocol, "TCP");
        assert_eq!(p.source, "10.0.0.1");
        assert_eq!(p.destination, "10.0.0.2");
        assert_eq!(p.src_port, Some(40000));
        assert_eq!(p.dst_port, Some(443));
        assert_eq!(p.app_protocol, None);
        assert_eq!(p.info, "40000 → 443 [SYN, ACK] Seq=7 Ack=0 Win=64240 Len=0");
        assert_eq!(p.ttl, Some(64));
        assert_eq!(p.length, frame.data.len());
    }

    #[test]
    fn test_http_request_line() {
        let mut synth = Synth::default();
        let payload = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let frame = synth.tcp("10.0.0.1", "93.184.216.34", 40000, 80, TcpFlags::PSH | TcpFlags::ACK, 1, payload);
        let p = dissect_now(&frame);

        assert_eq!(p.app_protocol.as_deref(), Some("HTTP"));
        assert_eq!(p.info, "GET /index.html HTTP/1.1");
        assert_eq!(p.payload(), payload);
        assert_eq!(p.tcp.as_ref().unwrap().payload_len, payload.len());
    }

    #[test]
    fn test_dns_query() {
        let mut query = vec![0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        for label in ["example", "com"] {
            query.push(label.len() as u8);
            query.extend_from_slice(label.as_bytes());
        }
        query.extend_from_slice(&[0, 0, 1, 0, 1]);

        let mut synth = Synth::default();
        let p = dissect_now(&synth.udp("10.0.0.1", "8.8.8.8", 5353, 53, &query));
        assert_eq!(p.protocol, "UDP");
        assert_eq!(p.app_protocol.as_deref(), Some("DNS"));
        assert_eq!(p.info, "Standard query 0x1234 A example.com");
    }

    #[test]
    fn test_udp_info() {
        let mut synth = Synth::default();
        let p = dissect_now(&synth.udp("10.0.0.1", "10.0.0.2", 40000, 40001, b"hello"));
        assert_eq!(p.info, "40000 → 40001 Len=5");
        assert_eq!(p.app_protocol, None);
    }

    #[test]
    fn test_arp() {
        let mut synth = Synth::default();
        let p = dissect_now(&synth.arp_request("192.168.1.10", "192.168.1.1"));
        assert_eq!(p.protocol, "ARP");
        assert_eq!(p.info, "Who has 192.168.1.1? Tell 192.168.1.10");
        assert!(p.is_broadcast());

        let p = dissect_now(&synth.arp_reply("192.168.1.1", synth::MAC_B, "192.168.1.10"));
        assert_eq!(p.info, "192.168.1.1 is at 02:00:00:00:00:0b");
        assert_eq!(p.arp.as_ref().unwrap().operation, 2);
    }

    #[test]
    fn test_icmp() {
        let mut synth = Synth::default();
        let p = dissect_now(&synth.ping("10.0.0.1", "10.0.0.2", 1));
        assert_eq!(p.protocol, "ICMP");
        assert_eq!(p.info, "Echo (ping) request Type=8 Code=0");
    }

    #[test]
    fn test_bad_ihl_is_unknown() {
        let mut packet = synth::ipv4(Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(2, 2, 2, 2), 6, &[0; 20]);
        packet[0] = 0x43;
        let frame = RawFrame::ethernet(Utc::now(), synth::ethernet(synth::MAC_A, synth::MAC_B, 0x0800, &packet));
        let p = dissect_now(&frame);
        assert_eq!(p.protocol, "UNKNOWN");
        assert_eq!(p.info, "Malformed IPv4 header (ihl=3)");
    }

    #[test]
    fn test_vlan_tagged() {
        let ip = synth::ipv4(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), 17, &synth::udp(1, 2, b"x"));
        let mut tagged = vec![0x00, 0x05, 0x08, 0x00];
        tagged.extend_from_slice(&ip);
        let frame = RawFrame::ethernet(Utc::now(), synth::ethernet(synth::MAC_A, synth::MAC_B, 0x8100, &tagged));
        let p = dissect_now(&frame);
        assert_eq!(p.protocol, "UDP");
        assert_eq!(p.payload(), b"x");
    }

    #[test]
    fn test_raw_ip_link() {
        let ip = synth::ipv4(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), 17, &synth::udp(1000, 2000, b""));
        let frame = RawFrame { timestamp: Utc::now(), orig_len: ip.len() as u32, data: ip, link_type: LinkType::RawIp };
        let p = dissect_now(&frame);
        assert_eq!(p.protocol, "UDP");
        assert!(p.link.is_none());
    }

    #[test]
    fn test_ipv6_udp() {
        let datagram = synth::udp(546, 547, b"dhcp");
        let mut ip = vec![0x60, 0, 0, 0];
        ip.extend_from_slice(&(datagram.len() as u16).to_be_bytes());
        ip.extend_from_slice(&[17, 1]);
        ip.extend_from_slice(&"fe80::1".parse::<std::net::Ipv6Addr>().unwrap().octets());
        ip.extend_from_slice(&"ff02::1:2".parse::<std::net::Ipv6Addr>().unwrap().octets());
        ip.extend_from_slice(&datagram);
        let frame = RawFrame::ethernet(Utc::now(), synth::ethernet(synth::MAC_A, synth::MAC_B, 0x86dd, &ip));

        let p = dissect_now(&frame);
        assert_eq!(p.protocol, "UDP");
        assert_eq!(p.source, "fe80::1");
        assert_eq!(p.destination, "ff02::1:2");
        assert_eq!(p.ttl, Some(1));
    }

    #[test]
    fn test_every_truncation_is_safe() {
        let mut synth = Synth::default();
        let frames = [
            synth.tcp("10.0.0.1", "10.0.0.2", 1, 2, TcpFlags::ACK, 1, b"GET / HTTP/1.1\r\n\r\n"),
            synth.udp("10.0.0.1", "10.0.0.2", 1, 53, &[0x12; 40]),
            synth.arp_request("10.0.0.1", "10.0.0.2"),
            synth.ping("10.0.0.1", "10.0.0.2", 3),
        ];
        for frame in &frames {
            for cut in 0..frame.data.len() {
                let truncated = RawFrame::ethernet(frame.timestamp, frame.data[..cut].to_vec());
                let p = dissect_now(&truncated);
                assert!(!p.protocol.is_empty());
            }
        }
    }

    #[test]
    fn test_random_bytes_are_safe() {
        let mut state: u32 = 0x1234_5678;
        for len in 0..512 {
            let data: Vec<u8> = (0..len)
                .map(|_| {
                    state ^= state << 13;
                    state ^= state >> 17;
                    state ^= state << 5;
                    state as u8
                })
                .collect();
            let mut frame = RawFrame::ethernet(Utc::now(), data.clone());
            dissect_now(&frame);
            frame.link_type = LinkType::RawIp;
            dissect_now(&frame);
        }
    }

    #[test]
    fn test_relative_time() {
        let mut synth = Synth::new(Utc::now(), chrono::Duration::milliseconds(250));
        let first = synth.ping("10.0.0.1", "10.0.0.2", 1);
        let second = synth.ping("10.0.0.1", "10.0.0.2", 2);
        let p = dissect(&second, first.timestamp, false);
        assert!((p.relative_time - 0.25).abs() < 1e-9);
        assert!(p.raw.is_none());
    }
}
