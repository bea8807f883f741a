//! Display filters
//!
//! A deliberately small language: one clause per filter.
//!
//! | Input                          | Meaning                                 |
//! |--------------------------------|-----------------------------------------|
//! | *(empty)*                      | everything                              |
//! | `tcp`, `dns`, `arp` ...        | protocol or application protocol        |
//! | `ip.addr==X`, `ip.src==X`      | address on either side / source / dest  |
//! | `port==N`, `tcp.dstport==N`    | port, optionally per transport and side |
//! | anything else                  | case-insensitive substring search       |
//!
//! Parsing never fails; what is not understood becomes a substring search.

use trawl_core::{proto, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Src,
    Dst,
    Either,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FilterExpr {
    #[default]
    All,
    /// Canonical protocol tag, matched against protocol and app protocol
    ProtocolEq(String),
    AddrEq { dir: Direction, addr: String },
    PortEq { proto: Option<&'static str>, dir: Direction, port: u16 },
    /// Lowercased needle
    Substring(String),
}

impl FilterExpr {
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if text.is_empty() {
            return FilterExpr::All;
        }

        if let Some((key, value)) = text.split_once("==") {
            if let Some(expr) = Self::parse_clause(key.trim(), value.trim()) {
                return expr;
            }
            return FilterExpr::Substring(text.to_lowercase());
        }

        match proto::canonical(text) {
            Some(tag) => FilterExpr::ProtocolEq(tag.to_string()),
            None => FilterExpr::Substring(text.to_lowercase()),
        }
    }

    fn parse_clause(key: &str, value: &str) -> Option<Self> {
        let value = value.trim_matches('"');
        if value.is_empty() || value.contains(char::is_whitespace) {
            return None;
        }
        let key = key.to_ascii_lowercase();

        let addr = |dir| Some(FilterExpr::AddrEq { dir, addr: value.to_string() });
        let port = |proto, dir| value.parse().ok().map(|port| FilterExpr::PortEq { proto, dir, port });

        match key.as_str() {
            "ip.addr" | "ipv6.addr" | "eth.addr" | "addr" | "host" => addr(Direction::Either),
            "ip.src" | "ipv6.src" | "eth.src" | "src" => addr(Direction::Src),
            "ip.dst" | "ipv6.dst" | "eth.dst" | "dst" => addr(Direction::Dst),
            "port" => port(None, Direction::Either),
            "tcp.port" => port(Some(proto::TCP), Direction::Either),
            "udp.port" => port(Some(proto::UDP), Direction::Either),
            "tcp.srcport" => port(Some(proto::TCP), Direction::Src),
            "tcp.dstport" => port(Some(proto::TCP), Direction::Dst),
            "udp.srcport" => port(Some(proto::UDP), Direction::Src),
            "udp.dstport" => port(Some(proto::UDP), Direction::Dst),
            "protocol" | "proto" | "frame.protocols" => {
                let tag = proto::canonical(value).map(str::to_string).unwrap_or_else(|| value.to_string());
                Some(FilterExpr::ProtocolEq(tag))
            }
            _ => None,
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, FilterExpr::All)
    }

    pub fn matches<T: Record + ?Sized>(&self, item: &T) -> bool {
        match self {
            FilterExpr::All => true,
            FilterExpr::ProtocolEq(name) => {
                item.protocol().eq_ignore_ascii_case(name)
                    || item.app_protocol().is_some_and(|app| app.eq_ignore_ascii_case(name))
            }
            FilterExpr::AddrEq { dir, addr } => {
                let src = item.source().eq_ignore_ascii_case(addr);
                let dst = item.destination().eq_ignore_ascii_case(addr);
                match dir {
                    Direction::Src => src,
                    Direction::Dst => dst,
                    Direction::Either => src || dst,
                }
            }
            FilterExpr::PortEq { proto, dir, port } => {
                if let Some(proto) = proto {
                    if !item.protocol().eq_ignore_ascii_case(proto) {
                        return false;
                    }
                }
                let src = item.src_port() == Some(*port);
                let dst = item.dst_port() == Some(*port);
                match dir {
                    Direction::Src => src,
                    Direction::Dst => dst,
                    Direction::Either => src || dst,
                }
            }
            FilterExpr::Substring(needle) => {
                item.source().to_lowercase().contains(needle)
                    || item.destination().to_lowercase().contains(needle)
                    || item.info().to_lowercase().contains(needle)
            }
        }
    }
}

/// Evaluate `expr` against `item`.
pub fn matches<T: Record + ?Sized>(item: &T, expr: &FilterExpr) -> bool {
    expr.matches(item)
}
