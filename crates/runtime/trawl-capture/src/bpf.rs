//! Capture filters
//!
//! A strict subset of the BPF filter syntax, evaluated against dissected
//! packets before they are stored. Unlike display filters a malformed capture
//! filter is an error.

use crate::{CaptureError, Result};
use std::net::IpAddr;
use trawl_core::{proto, Packet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Ip,
    Ip6,
    Tcp,
    Udp,
    Icmp,
    Icmp6,
    Arp,
}

impl Proto {
    fn from_word(word: &str) -> Option<Self> {
        Some(match word {
            "ip" => Proto::Ip,
            "ip6" => Proto::Ip6,
            "tcp" => Proto::Tcp,
            "udp" => Proto::Udp,
            "icmp" => Proto::Icmp,
            "icmp6" => Proto::Icmp6,
            "arp" => Proto::Arp,
            _ => return None,
        })
    }

    fn matches(&self, p: &Packet) -> bool {
        match self {
            Proto::Ip => p.protocol != proto::ARP && matches!(p.source_ip(), Some(IpAddr::V4(_))),
            Proto::Ip6 => matches!(p.source_ip(), Some(IpAddr::V6(_))),
            Proto::Tcp => p.protocol == proto::TCP,
            Proto::Udp => p.protocol == proto::UDP,
            Proto::Icmp => p.protocol == proto::ICMP,
            Proto::Icmp6 => p.protocol == proto::ICMPV6,
            Proto::Arp => p.protocol == proto::ARP,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    Src,
    Dst,
    Either,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureFilter {
    Any,
    Proto(Proto),
    Host { dir: Dir, addr: IpAddr },
    Net { dir: Dir, net: IpAddr, prefix: u8 },
    Port { dir: Dir, lo: u16, hi: u16 },
    Length { greater: bool, len: usize },
    And(Box<CaptureFilter>, Box<CaptureFilter>),
    Or(Box<CaptureFilter>, Box<CaptureFilter>),
    Not(Box<CaptureFilter>),
}

impl Default for CaptureFilter {
    fn default() -> Self {
        CaptureFilter::Any
    }
}

impl CaptureFilter {
    pub fn parse(text: &str) -> Result<Self> {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return Ok(CaptureFilter::Any);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let filter = parser.or()?;
        if let Some(extra) = parser.peek() {
            return Err(CaptureError::InvalidFilter(format!("unexpected '{extra}'")));
        }
        Ok(filter)
    }

    pub fn is_any(&self) -> bool {
        matches!(self, CaptureFilter::Any)
    }

    pub fn matches(&self, p: &Packet) -> bool {
        match self {
            CaptureFilter::Any => true,
            CaptureFilter::Proto(proto) => proto.matches(p),
            CaptureFilter::Host { dir, addr } => {
                either(*dir, p.source_ip() == Some(*addr), p.destination_ip() == Some(*addr))
            }
            CaptureFilter::Net { dir, net, prefix } => either(
                *dir,
                p.source_ip().is_some_and(|ip| in_net(ip, *net, *prefix)),
                p.destination_ip().is_some_and(|ip| in_net(ip, *net, *prefix)),
            ),
            CaptureFilter::Port { dir, lo, hi } => either(
                *dir,
                p.src_port.is_some_and(|port| (*lo..=*hi).contains(&port)),
                p.dst_port.is_some_and(|port| (*lo..=*hi).contains(&port)),
            ),
            CaptureFilter::Length { greater, len } => {
                if *greater {
                    p.length >= *len
                } else {
                    p.length <= *len
                }
            }
            CaptureFilter::And(a, b) => a.matches(p) && b.matches(p),
            CaptureFilter::Or(a, b) => a.matches(p) || b.matches(p),
            CaptureFilter::Not(inner) => !inner.matches(p),
        }
    }
}

fn either(dir: Dir, src: bool, dst: bool) -> bool {
    match dir {
        Dir::Src => src,
        Dir::Dst => dst,
        Dir::Either => src || dst,
    }
}

fn in_net(ip: IpAddr, net: IpAddr, prefix: u8) -> bool {
    match (ip, net) {
        (IpAddr::V4(ip), IpAddr::V4(net)) => {
            let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix.min(32) as u32) };
            u32::from(ip) & mask == u32::from(net) & mask
        }
        (IpAddr::V6(ip), IpAddr::V6(net)) => {
            let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix.min(128) as u32) };
            u128::from(ip) & mask == u128::from(net) & mask
        }
        _ => false,
    }
}

fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    let flush = |current: &mut String, tokens: &mut Vec<String>| {
        if !current.is_empty() {
            tokens.push(std::mem::take(current).to_ascii_lowercase());
        }
    };

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => flush(&mut current, &mut tokens),
            '(' | ')' | '!' => {
                flush(&mut current, &mut tokens);
                tokens.push(c.to_string());
            }
            '&' | '|' if chars.peek() == Some(&c) => {
                chars.next();
                flush(&mut current, &mut tokens);
                tokens.push(format!("{c}{c}"));
            }
            _ => current.push(c),
        }
    }
    flush(&mut current, &mut tokens);
    tokens
}

struct Parser {
    tokens: Vec<String>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&str> {
        self.tokens.get(self.pos).map(String::as_str)
    }

    fn next(&mut self) -> Result<String> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| CaptureError::InvalidFilter("unexpected end of filter".into()))?;
        self.pos += 1;
        Ok(token)
    }

    fn eat(&mut self, words: &[&str]) -> bool {
        match self.peek() {
            Some(token) if words.contains(&token) => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn or(&mut self) -> Result<CaptureFilter> {
        let mut left = self.and()?;
        while self.eat(&["or", "||"]) {
            let right = self.and()?;
            left = CaptureFilter::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<CaptureFilter> {
        let mut left = self.unary()?;
        while self.eat(&["and", "&&"]) {
            let right = self.unary()?;
            left = CaptureFilter::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<CaptureFilter> {
        if self.eat(&["not", "!"]) {
            return Ok(CaptureFilter::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<CaptureFilter> {
        if self.eat(&["("]) {
            let inner = self.or()?;
            if !self.eat(&[")"]) {
                return Err(CaptureError::InvalidFilter("missing ')'".into()));
            }
            return Ok(inner);
        }

        if let Some(proto) = self.peek().and_then(Proto::from_word) {
            self.pos += 1;
            let qualified = matches!(self.peek(), Some("src" | "dst" | "host" | "net" | "port" | "portrange"));
            if qualified {
                let rest = self.qualified()?;
                return Ok(CaptureFilter::And(Box::new(CaptureFilter::Proto(proto)), Box::new(rest)));
            }
            return Ok(CaptureFilter::Proto(proto));
        }

        if let Some(word @ ("less" | "greater")) = self.peek() {
            let greater = word == "greater";
            self.pos += 1;
            let value = self.next()?;
            let len = value
                .parse()
                .map_err(|_| CaptureError::InvalidFilter(format!("bad length '{value}'")))?;
            return Ok(CaptureFilter::Length { greater, len });
        }

        self.qualified()
    }

    fn qualified(&mut self) -> Result<CaptureFilter> {
        let dir = if self.eat(&["src"]) {
            Dir::Src
        } else if self.eat(&["dst"]) {
            Dir::Dst
        } else {
            Dir::Either
        };

        let keyword = self.next()?;
        match keyword.as_str() {
            "host" => {
                let value = self.next()?;
                Ok(CaptureFilter::Host { dir, addr: parse_ip(&value)? })
            }
            "net" => {
                let value = self.next()?;
                let (addr, prefix) = match value.split_once('/') {
                    Some((addr, prefix)) => (addr, prefix),
                    None => return Err(CaptureError::InvalidFilter(format!("net needs a prefix length: '{value}'"))),
                };
                let net = parse_ip(addr)?;
                let max = if net.is_ipv4() { 32 } else { 128 };
                let prefix: u8 = prefix
                    .parse()
                    .ok()
                    .filter(|p| *p <= max)
                    .ok_or_else(|| CaptureError::InvalidFilter(format!("bad prefix length in '{value}'")))?;
                Ok(CaptureFilter::Net { dir, net, prefix })
            }
            "port" => {
                let value = self.next()?;
                let port = parse_port(&value)?;
                Ok(CaptureFilter::Port { dir, lo: port, hi: port })
            }
            "portrange" => {
                let value = self.next()?;
                let (lo, hi) = value
                    .split_once('-')
                    .ok_or_else(|| CaptureError::InvalidFilter(format!("bad port range '{value}'")))?;
                let (lo, hi) = (parse_port(lo)?, parse_port(hi)?);
                if lo > hi {
                    return Err(CaptureError::InvalidFilter(format!("empty port range '{value}'")));
                }
                Ok(CaptureFilter::Port { dir, lo, hi })
            }
            // `src 10.0.0.1` and a bare address both mean host
            other => match other.parse::<IpAddr>() {
                Ok(addr) => Ok(CaptureFilter::Host { dir, addr }),
                Err(_) => Err(CaptureError::InvalidFilter(format!("unknown primitive '{other}'"))),
            },
        }
    }
}

fn parse_ip(value: &str) -> Result<IpAddr> {
    value.parse().map_err(|_| CaptureError::InvalidFilter(format!("bad address '{value}'")))
}

fn parse_port(value: &str) -> Result<u16> {
    value.parse().map_err(|_| CaptureError::InvalidFilter(format!("bad port '{value}'")))
}

/// Builders for common filter expressions.
pub mod expr {
    pub fn host(ip: &str) -> String {
        format!("host {ip}")
    }

    pub fn port(port: u16) -> String {
        format!("port {port}")
    }

    pub fn port_range(start: u16, end: u16) -> String {
        format!("portrange {start}-{end}")
    }

    pub fn net(network: &str) -> String {
        format!("net {network}")
    }

    /// Join clauses with `and`, skipping empty ones.
    pub fn all<S: AsRef<str>>(clauses: &[S]) -> String {
        clauses
            .iter()
            .map(AsRef::as_ref)
            .filter(|c| !c.trim().is_empty())
            .map(|c| format!("({c})"))
            .collect::<Vec<_>>()
            .join(" and ")
    }
}
