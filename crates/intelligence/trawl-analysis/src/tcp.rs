//! TCP stream health
//!
//! Sequence-continuity heuristics per direction of each stream. A direction
//! has no expectations until its first data-bearing segment is seen, so
//! one-sided captures and mid-stream starts do not produce false positives.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use trawl_core::{proto, Packet, TcpFlags};

/// Outstanding gaps tracked per direction
const MAX_HOLES: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpStreamHealth {
    /// `a:port ↔ b:port`, A being the first sender seen
    pub stream: String,
    pub packets: u64,
    pub bytes: u64,
    pub retransmissions: u64,
    pub out_of_order: u64,
}

/// `a` precedes `b` in sequence space.
fn before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[derive(Default)]
struct Direction {
    next: Option<u32>,
    holes: Vec<(u32, u32)>,
}

enum Segment {
    InOrder,
    Retransmission,
    OutOfOrder,
}

impl Direction {
    fn observe(&mut self, seq: u32, len: u32) -> Segment {
        let end = seq.wrapping_add(len);
        let Some(next) = self.next else {
            self.next = Some(end);
            return Segment::InOrder;
        };

        if seq == next {
            self.next = Some(end);
            Segment::InOrder
        } else if before(next, seq) {
            if self.holes.len() < MAX_HOLES {
                self.holes.push((next, seq));
            }
            self.next = Some(end);
            Segment::InOrder
        } else {
            let filled = self.fill(seq, end);
            if before(next, end) {
                self.next = Some(end);
            }
            if filled {
                Segment::OutOfOrder
            } else {
                Segment::Retransmission
            }
        }
    }

    /// Remove `[seq, end)` from the outstanding holes. True if it filled any.
    fn fill(&mut self, seq: u32, end: u32) -> bool {
        let mut filled = false;
        let mut remaining = Vec::with_capacity(self.holes.len());
        for (start, stop) in self.holes.drain(..) {
            if !(before(seq, stop) && before(start, end)) {
                remaining.push((start, stop));
                continue;
            }
            filled = true;
            if before(start, seq) {
                remaining.push((start, seq));
            }
            if before(end, stop) {
                remaining.push((end, stop));
            }
        }
        self.holes = remaining;
        filled
    }
}

struct Stream {
    health: TcpStreamHealth,
    a: (String, u16),
    forward: Direction,
    reverse: Direction,
}

pub fn tcp_streams(packets: &[Arc<Packet>]) -> Vec<TcpStreamHealth> {
    let mut index: HashMap<((String, u16), (String, u16)), usize> = HashMap::new();
    let mut streams: Vec<Stream> = Vec::new();

    for p in packets {
        if p.protocol != proto::TCP {
            continue;
        }
        let (Some(tcp), Some(sport), Some(dport)) = (&p.tcp, p.src_port, p.dst_port) else {
            continue;
        };
        let src = (p.source.clone(), sport);
        let dst = (p.destination.clone(), dport);
        let key = if src <= dst { (src.clone(), dst.clone()) } else { (dst.clone(), src.clone()) };

        let slot = *index.entry(key).or_insert_with(|| {
            streams.push(Stream {
                health: TcpStreamHealth {
                    stream: format!("{}:{} ↔ {}:{}", src.0, src.1, dst.0, dst.1),
                    packets: 0,
                    bytes: 0,
                    retransmissions: 0,
                    out_of_order: 0,
                },
                a: src.clone(),
                forward: Direction::default(),
                reverse: Direction::default(),
            });
            streams.len() - 1
        });

        let stream = &mut streams[slot];
        stream.health.packets += 1;
        stream.health.bytes += p.length as u64;

        let mut len = tcp.payload_len as u32;
        if tcp.flags.has(TcpFlags::SYN) {
            len += 1;
        }
        if tcp.flags.has(TcpFlags::FIN) {
            len += 1;
        }
        if len == 0 || tcp.flags.has(TcpFlags::RST) {
            continue;
        }

        let direction = if src == stream.a { &mut stream.forward } else { &mut stream.reverse };
        match direction.observe(tcp.seq, len) {
            Segment::InOrder => {}
            Segment::Retransmission => stream.health.retransmissions += 1,
            Segment::OutOfOrder => stream.health.out_of_order += 1,
        }
    }

    streams.into_iter().map(|s| s.health).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{packets, synth};

    const DATA: u16 = TcpFlags::PSH | TcpFlags::ACK;

    #[test]
    fn test_clean_stream() {
        let mut s = synth();
        let list = packets(vec![
            s.tcp("10.0.0.1", "10.0.0.2", 40000, 80, TcpFlags::SYN, 100, b""),
            s.tcp("10.0.0.2", "10.0.0.1", 80, 40000, TcpFlags::SYN | TcpFlags::ACK, 900, b""),
            s.tcp("10.0.0.1", "10.0.0.2", 40000, 80, DATA, 101, b"hello"),
            s.tcp("10.0.0.1", "10.0.0.2", 40000, 80, DATA, 106, b"world"),
            s.tcp("10.0.0.2", "10.0.0.1", 80, 40000, TcpFlags::ACK, 901, b""),
        ]);
        let streams = tcp_streams(&list);
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].stream, "10.0.0.1:40000 ↔ 10.0.0.2:80");
        assert_eq!(streams[0].packets, 5);
        assert_eq!(streams[0].retransmissions, 0);
        assert_eq!(streams[0].out_of_order, 0);
    }

    #[test]
    fn test_retransmission_and_reordering() {
        let mut s = synth();
        let list = packets(vec![
            s.tcp("10.0.0.1", "10.0.0.2", 40000, 80, DATA, 1000, b"aaaa"),
            // same bytes again
            s.tcp("10.0.0.1", "10.0.0.2", 40000, 80, DATA, 1000, b"aaaa"),
            // skips 1004..1008
            s.tcp("10.0.0.1", "10.0.0.2", 40000, 80, DATA, 1008, b"cccc"),
            // back-fills the gap
            s.tcp("10.0.0.1", "10.0.0.2", 40000, 80, DATA, 1004, b"bbbb"),
            // gap is closed, so this is a plain retransmission
            s.tcp("10.0.0.1", "10.0.0.2", 40000, 80, DATA, 1004, b"bbbb"),
        ]);
        let health = &tcp_streams(&list)[0];
        assert_eq!(health.retransmissions, 2);
        assert_eq!(health.out_of_order, 1);
    }

    #[test]
    fn test_one_sided_capture_is_clean() {
        let mut s = synth();
        let list = packets(vec![
            s.tcp("10.0.0.2", "10.0.0.1", 80, 40000, DATA, 5_000_000, b"mid-stream"),
            s.tcp("10.0.0.2", "10.0.0.1", 80, 40000, DATA, 5_000_010, b"more"),
        ]);
        let health = &tcp_streams(&list)[0];
        assert_eq!(health.retransmissions, 0);
        assert_eq!(health.out_of_order, 0);
    }

    #[test]
    fn test_sequence_wraparound() {
        let mut s = synth();
        let list = packets(vec![
            s.tcp("10.0.0.1", "10.0.0.2", 1, 2, DATA, u32::MAX - 1, b"abcd"),
            s.tcp("10.0.0.1", "10.0.0.2", 1, 2, DATA, 2, b"efgh"),
        ]);
        let health = &tcp_streams(&list)[0];
        assert_eq!(health.retransmissions, 0);
        assert_eq!(health.out_of_order, 0);
    }
}
