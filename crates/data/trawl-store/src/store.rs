//! Bounded append-only store
//!
//! One `RwLock` covers the items and every index, so readers observe either
//! the state before a `clear()` or the empty state after it. Query results
//! are snapshots of `Arc`s taken under the read lock.

use crate::filter::FilterExpr;
use crate::index::Index;
use crate::{Result, StoreError};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use trawl_core::Record;

pub struct Store<T: Record> {
    inner: RwLock<Inner<T>>,
    capacity: usize,
}

struct Inner<T> {
    items: VecDeque<Arc<T>>,
    next_no: u64,
    epoch: u64,
    index: Index,
}

impl<T: Record> Inner<T> {
    fn lookup(&self, no: u64) -> Option<&Arc<T>> {
        let first = self.items.front()?.no();
        if no < first {
            return None;
        }
        self.items.get((no - first) as usize)
    }
}

impl<T: Record> Store<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                items: VecDeque::new(),
                next_no: 1,
                epoch: 0,
                index: Index::default(),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Append and return the assigned sequence number.
    pub fn append(&self, item: T) -> u64 {
        self.push(item).0.no()
    }

    /// Append, returning the shared item and the epoch it landed in.
    pub fn push(&self, mut item: T) -> (Arc<T>, u64) {
        let mut inner = self.inner.write();
        item.set_no(inner.next_no);
        inner.next_no += 1;

        let item = Arc::new(item);
        inner.index.insert(&*item);
        inner.items.push_back(Arc::clone(&item));

        while inner.items.len() > self.capacity {
            if let Some(old) = inner.items.pop_front() {
                inner.index.evict(&*old);
            }
        }
        (item, inner.epoch)
    }

    pub fn get(&self, no: u64) -> Result<Arc<T>> {
        self.inner.read().lookup(no).cloned().ok_or(StoreError::NotFound(no))
    }

    /// Items numbered `start..=end` that are still retained.
    pub fn range(&self, start: u64, end: u64) -> impl Iterator<Item = Arc<T>> {
        let inner = self.inner.read();
        let snapshot: Vec<Arc<T>> = match inner.items.front().map(|f| f.no()) {
            Some(first) if start <= end => {
                let from = start.saturating_sub(first) as usize;
                let to = end.saturating_sub(first).saturating_add(1).min(inner.items.len() as u64) as usize;
                if end < first || from >= to {
                    Vec::new()
                } else {
                    inner.items.range(from..to).cloned().collect()
                }
            }
            _ => Vec::new(),
        };
        snapshot.into_iter()
    }

    pub fn filter(&self, expr: &FilterExpr) -> impl Iterator<Item = Arc<T>> {
        let snapshot: Vec<Arc<T>> = {
            let inner = self.inner.read();
            match inner.index.candidates(expr) {
                Some(nos) => nos.into_iter().filter_map(|no| inner.lookup(no).cloned()).collect(),
                None => inner.items.iter().cloned().collect(),
            }
        };
        let expr = expr.clone();
        snapshot.into_iter().filter(move |item| expr.matches(&**item))
    }

    /// Every item exchanged between `a` and `b`, in either direction.
    pub fn between(&self, a: &str, b: &str) -> Vec<Arc<T>> {
        let inner = self.inner.read();
        inner.index.pair(a, b).into_iter().filter_map(|no| inner.lookup(no).cloned()).collect()
    }

    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.inner.read().items.iter().cloned().collect()
    }

    /// Drop everything, restart numbering at 1 and return the new epoch.
    pub fn clear(&self) -> u64 {
        self.clear_from(1)
    }

    /// Like [`Store::clear`], but the next item is numbered `first`.
    pub fn clear_from(&self, first: u64) -> u64 {
        let mut inner = self.inner.write();
        inner.items.clear();
        inner.index = Index::default();
        inner.next_no = first.max(1);
        inner.epoch += 1;
        tracing::debug!(epoch = inner.epoch, first = inner.next_no, "store cleared");
        inner.epoch
    }

    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().items.is_empty()
    }

    pub fn epoch(&self) -> u64 {
        self.inner.read().epoch
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number the next appended item will receive.
    pub fn next_no(&self) -> u64 {
        self.inner.read().next_no
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::packet;
    use trawl_core::Packet;

    fn filled(n: u64, capacity: usize) -> Store<Packet> {
        let store = Store::new(capacity);
        for i in 0..n {
            let proto = if i % 2 == 0 { "TCP" } else { "UDP" };
            store.append(packet(&format!("10.0.0.{}", i % 5), "10.0.1.1", proto, 1000 + i as u16, 53));
        }
        store
    }

    #[test]
    fn test_numbers_are_contiguous() {
        let store = filled(10, 100);
        let nos: Vec<u64> = store.snapshot().iter().map(|p| p.no).collect();
        assert_eq!(nos, (1..=10).collect::<Vec<_>>());
        assert_eq!(store.get(4).unwrap().no, 4);
        assert_eq!(store.get(11).unwrap_err(), StoreError::NotFound(11));
    }

    #[test]
    fn test_range() {
        let store = filled(10, 100);
        let nos: Vec<u64> = store.range(3, 5).map(|p| p.no).collect();
        assert_eq!(nos, vec![3, 4, 5]);
        assert_eq!(store.range(9, 100).count(), 2);
        assert_eq!(store.range(20, 30).count(), 0);
        assert_eq!(store.range(5, 3).count(), 0);
    }

    #[test]
    fn test_eviction_updates_indices() {
        let store = filled(10, 4);
        assert_eq!(store.len(), 4);
        assert!(store.get(6).is_err());
        assert_eq!(store.get(7).unwrap().no, 7);

        let tcp: Vec<u64> = store.filter(&FilterExpr::parse("tcp")).map(|p| p.no).collect();
        assert_eq!(tcp, vec![7, 9]);
        assert_eq!(store.range(1, 8).count(), 2);
    }

    #[test]
    fn test_indexed_and_scanned_filters_agree() {
        let store = filled(50, 1000);
        for text in ["tcp", "udp", "ip.src==10.0.0.3", "ip.addr==10.0.1.1", "port==1010", "10.0.0.3"] {
            let expr = FilterExpr::parse(text);
            let indexed: Vec<u64> = store.filter(&expr).map(|p| p.no).collect();
            let scanned: Vec<u64> =
                store.snapshot().iter().filter(|p| expr.matches(&***p)).map(|p| p.no).collect();
            assert_eq!(indexed, scanned, "filter {text}");
        }
    }

    #[test]
    fn test_clear_restarts_numbering() {
        let store = filled(5, 100);
        let epoch = store.clear();
        assert_eq!(epoch, 1);
        assert!(store.is_empty());
        assert_eq!(store.filter(&FilterExpr::parse("tcp")).count(), 0);
        assert_eq!(store.append(packet("a", "b", "TCP", 1, 2)), 1);
    }

    #[test]
    fn test_clear_from_keeps_lookups_working() {
        let store = filled(3, 100);
        assert_eq!(store.clear_from(41), 1);
        store.append(packet("10.0.0.1", "10.0.0.2", "TCP", 1, 2));
        store.append(packet("10.0.0.1", "10.0.0.2", "UDP", 1, 2));
        assert_eq!(store.get(42).unwrap().protocol, "UDP");
        assert!(store.get(1).is_err());
        assert_eq!(store.range(1, 41).map(|p| p.no).collect::<Vec<_>>(), vec![41]);
        assert_eq!(store.filter(&FilterExpr::parse("udp")).map(|p| p.no).collect::<Vec<_>>(), vec![42]);
        assert_eq!(store.clear_from(0), 2);
        assert_eq!(store.next_no(), 1);
    }

    #[test]
    fn test_between() {
        let store = Store::new(100);
        store.append(packet("10.0.0.1", "10.0.0.2", "TCP", 1, 2));
        store.append(packet("10.0.0.2", "10.0.0.1", "TCP", 2, 1));
        store.append(packet("10.0.0.1", "10.0.0.3", "TCP", 1, 2));
        assert_eq!(store.between("10.0.0.2", "10.0.0.1").len(), 2);
    }

    #[test]
    fn test_concurrent_clear_is_atomic() {
        let store = Arc::new(filled(2000, 10_000));
        let reader = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    let n = store.filter(&FilterExpr::parse("tcp")).count();
                    assert!(n == 0 || n == 1000, "partial view: {n}");
                }
            })
        };
        store.clear();
        reader.join().unwrap();
        assert_eq!(store.snapshot().len(), 0);
    }
}
