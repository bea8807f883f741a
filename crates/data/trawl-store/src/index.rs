//! Secondary indices. Posting lists hold sequence numbers in append order, so
//! eviction (always oldest-first) only ever pops list fronts.

use crate::filter::FilterExpr;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use trawl_core::Record;

#[derive(Debug, Default)]
pub(crate) struct Index {
    protocol: HashMap<String, VecDeque<u64>>,
    address: HashMap<String, VecDeque<u64>>,
    pair: HashMap<(String, String), VecDeque<u64>>,
    port: HashMap<u16, VecDeque<u64>>,
}

struct Keys {
    protocols: Vec<String>,
    addresses: Vec<String>,
    pair: (String, String),
    ports: Vec<u16>,
}

fn keys<T: Record>(item: &T) -> Keys {
    let mut protocols = vec![item.protocol().to_ascii_lowercase()];
    if let Some(app) = item.app_protocol() {
        let app = app.to_ascii_lowercase();
        if app != protocols[0] {
            protocols.push(app);
        }
    }

    let src = item.source().to_ascii_lowercase();
    let dst = item.destination().to_ascii_lowercase();
    let mut addresses = vec![src.clone()];
    if dst != src {
        addresses.push(dst.clone());
    }

    let mut ports: Vec<u16> = item.src_port().into_iter().chain(item.dst_port()).collect();
    ports.dedup();

    Keys { protocols, addresses, pair: pair_key(&src, &dst), ports }
}

/// Unordered endpoint pair.
pub(crate) fn pair_key(a: &str, b: &str) -> (String, String) {
    let (a, b) = (a.to_ascii_lowercase(), b.to_ascii_lowercase());
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn insert_posting<K: Hash + Eq>(map: &mut HashMap<K, VecDeque<u64>>, key: K, no: u64) {
    map.entry(key).or_default().push_back(no);
}

fn evict_posting<K: Hash + Eq>(map: &mut HashMap<K, VecDeque<u64>>, key: &K, no: u64) {
    if let Some(list) = map.get_mut(key) {
        if list.front() == Some(&no) {
            list.pop_front();
        }
        if list.is_empty() {
            map.remove(key);
        }
    }
}

impl Index {
    pub fn insert<T: Record>(&mut self, item: &T) {
        let no = item.no();
        let keys = keys(item);
        for key in keys.protocols {
            insert_posting(&mut self.protocol, key, no);
        }
        for key in keys.addresses {
            insert_posting(&mut self.address, key, no);
        }
        insert_posting(&mut self.pair, keys.pair, no);
        for key in keys.ports {
            insert_posting(&mut self.port, key, no);
        }
    }

    pub fn evict<T: Record>(&mut self, item: &T) {
        let no = item.no();
        let keys = keys(item);
        for key in &keys.protocols {
            evict_posting(&mut self.protocol, key, no);
        }
        for key in &keys.addresses {
            evict_posting(&mut self.address, key, no);
        }
        evict_posting(&mut self.pair, &keys.pair, no);
        for key in &keys.ports {
            evict_posting(&mut self.port, key, no);
        }
    }

    /// Candidate numbers for `expr`, or `None` when it cannot use an index.
    pub fn candidates(&self, expr: &FilterExpr) -> Option<Vec<u64>> {
        let list = match expr {
            FilterExpr::ProtocolEq(name) => self.protocol.get(&name.to_ascii_lowercase()),
            FilterExpr::AddrEq { addr, .. } => self.address.get(&addr.to_ascii_lowercase()),
            FilterExpr::PortEq { port, .. } => self.port.get(port),
            FilterExpr::All | FilterExpr::Substring(_) => return None,
        };
        Some(list.map(|l| l.iter().copied().collect()).unwrap_or_default())
    }

    pub fn pair(&self, a: &str, b: &str) -> Vec<u64> {
        self.pair.get(&pair_key(a, b)).map(|l| l.iter().copied().collect()).unwrap_or_default()
    }

    #[cfg(test)]
    pub fn posting_count(&self) -> usize {
        self.protocol.len() + self.address.len() + self.pair.len() + self.port.len()
    }
}
