//! Synthetic frame builders for tests and demos. Checksums are left zero.

use chrono::{DateTime, Duration, Utc};
use std::net::Ipv4Addr;
use trawl_core::{LinkType, RawFrame, TcpFlags};

pub const MAC_A: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x0a];
pub const MAC_B: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x0b];
pub const BROADCAST: [u8; 6] = [0xff; 6];

pub fn ethernet(src: [u8; 6], dst: [u8; 6], ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(14 + payload.len());
    frame.extend_from_slice(&dst);
    frame.extend_from_slice(&src);
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

pub fn ipv4(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> Vec<u8> {
    let total = (20 + payload.len()) as u16;
    let mut packet = vec![0x45, 0x00];
    packet.extend_from_slice(&total.to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x01, 0x40, 0x00, 64, protocol, 0x00, 0x00]);
    packet.extend_from_slice(&src.octets());
    packet.extend_from_slice(&dst.octets());
    packet.extend_from_slice(payload);
    packet
}

pub fn tcp(sport: u16, dport: u16, seq: u32, ack: u32, flags: u16, payload: &[u8]) -> Vec<u8> {
    let mut segment = Vec::with_capacity(20 + payload.len());
    segment.extend_from_slice(&sport.to_be_bytes());
    segment.extend_from_slice(&dport.to_be_bytes());
    segment.extend_from_slice(&seq.to_be_bytes());
    segment.extend_from_slice(&ack.to_be_bytes());
    segment.push(0x50 | ((flags >> 8) as u8 & 0x01));
    segment.push(flags as u8);
    segment.extend_from_slice(&64240u16.to_be_bytes());
    segment.extend_from_slice(&[0, 0, 0, 0]);
    segment.extend_from_slice(payload);
    segment
}

pub fn udp(sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let len = (8 + payload.len()) as u16;
    let mut datagram = Vec::with_capacity(len as usize);
    datagram.extend_from_slice(&sport.to_be_bytes());
    datagram.extend_from_slice(&dport.to_be_bytes());
    datagram.extend_from_slice(&len.to_be_bytes());
    datagram.extend_from_slice(&[0, 0]);
    datagram.extend_from_slice(payload);
    datagram
}

pub fn icmp_echo(request: bool, id: u16, seq: u16) -> Vec<u8> {
    let mut message = vec![if request { 8 } else { 0 }, 0, 0, 0];
    message.extend_from_slice(&id.to_be_bytes());
    message.extend_from_slice(&seq.to_be_bytes());
    message
}

pub fn arp(operation: u16, sha: [u8; 6], spa: Ipv4Addr, tha: [u8; 6], tpa: Ipv4Addr) -> Vec<u8> {
    let mut message = vec![0x00, 0x01, 0x08, 0x00, 6, 4];
    message.extend_from_slice(&operation.to_be_bytes());
    message.extend_from_slice(&sha);
    message.extend_from_slice(&spa.octets());
    message.extend_from_slice(&tha);
    message.extend_from_slice(&tpa.octets());
    message
}

fn ip(addr: &str) -> Ipv4Addr {
    addr.parse().unwrap_or(Ipv4Addr::UNSPECIFIED)
}

/// Emits Ethernet frames with a steadily advancing clock.
#[derive(Debug, Clone)]
pub struct Synth {
    now: DateTime<Utc>,
    step: Duration,
}

impl Default for Synth {
    fn default() -> Self {
        Self::new(Utc::now(), Duration::milliseconds(1))
    }
}

impl Synth {
    pub fn new(start: DateTime<Utc>, step: Duration) -> Self {
        Self { now: start, step }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Move the clock without emitting a frame.
    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    fn frame(&mut self, data: Vec<u8>) -> RawFrame {
        let frame = RawFrame {
            timestamp: self.now,
            orig_len: data.len() as u32,
            data,
            link_type: LinkType::Ethernet,
        };
        self.now += self.step;
        frame
    }

    pub fn tcp(&mut self, src: &str, dst: &str, sport: u16, dport: u16, flags: u16, seq: u32, payload: &[u8]) -> RawFrame {
        let segment = tcp(sport, dport, seq, 0, flags, payload);
        let packet = ipv4(ip(src), ip(dst), 6, &segment);
        self.frame(ethernet(MAC_A, MAC_B, 0x0800, &packet))
    }

    pub fn syn(&mut self, src: &str, dst: &str, sport: u16, dport: u16) -> RawFrame {
        self.tcp(src, dst, sport, dport, TcpFlags::SYN, 1000, &[])
    }

    pub fn udp(&mut self, src: &str, dst: &str, sport: u16, dport: u16, payload: &[u8]) -> RawFrame {
        let datagram = udp(sport, dport, payload);
        let packet = ipv4(ip(src), ip(dst), 17, &datagram);
        self.frame(ethernet(MAC_A, MAC_B, 0x0800, &packet))
    }

    pub fn ping(&mut self, src: &str, dst: &str, seq: u16) -> RawFrame {
        let packet = ipv4(ip(src), ip(dst), 1, &icmp_echo(true, 1, seq));
        self.frame(ethernet(MAC_A, MAC_B, 0x0800, &packet))
    }

    /// ARP reply announcing `ip` at `mac`.
    pub fn arp_reply(&mut self, ip_addr: &str, mac: [u8; 6], to: &str) -> RawFrame {
        let message = arp(2, mac, ip(ip_addr), MAC_B, ip(to));
        self.frame(ethernet(mac, MAC_B, 0x0806, &message))
    }

    pub fn arp_request(&mut self, asking: &str, target: &str) -> RawFrame {
        let message = arp(1, MAC_A, ip(asking), [0; 6], ip(target));
        self.frame(ethernet(MAC_A, BROADCAST, 0x0806, &message))
    }
}
