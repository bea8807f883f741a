//! Held requests
//!
//! A connection that hits an in-scope request while interception is on parks
//! it here and waits on a oneshot for the user's verdict. Every item is
//! resolved at most once; resolved ids are remembered for a while so a late
//! second resolution reports `AlreadyResolved` instead of `UnknownIntercept`.

use crate::{ProxyError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::oneshot;
use trawl_core::{Disposition, Event, EventBus, HttpRequest, InterceptedItem};

const RESOLVED_MEMORY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Forward(HttpRequest),
    Drop,
}

struct Held {
    item: InterceptedItem,
    reply: oneshot::Sender<Verdict>,
}

#[derive(Default)]
struct Inner {
    enabled: bool,
    held: Vec<Held>,
    resolved: VecDeque<String>,
}

impl Inner {
    fn take(&mut self, id: &str) -> Result<Held> {
        match self.held.iter().position(|h| h.item.id == id) {
            Some(pos) => {
                let held = self.held.remove(pos);
                if self.resolved.len() == RESOLVED_MEMORY {
                    self.resolved.pop_front();
                }
                self.resolved.push_back(held.item.id.clone());
                Ok(held)
            }
            None if self.resolved.iter().any(|r| r == id) => Err(ProxyError::AlreadyResolved(id.to_string())),
            None => Err(ProxyError::UnknownIntercept(id.to_string())),
        }
    }
}

pub struct InterceptQueue {
    inner: Mutex<Inner>,
    bus: EventBus,
}

impl InterceptQueue {
    pub fn new(bus: EventBus) -> Self {
        Self { inner: Mutex::new(Inner::default()), bus }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    /// Turning interception off releases everything held, unmodified.
    pub fn set_enabled(&self, enabled: bool) {
        let released = {
            let mut inner = self.inner.lock();
            inner.enabled = enabled;
            if enabled {
                return;
            }
            let ids: Vec<String> = inner.held.iter().map(|h| h.item.id.clone()).collect();
            ids.into_iter().filter_map(|id| inner.take(&id).ok()).collect::<Vec<_>>()
        };
        tracing::info!(enabled, released = released.len(), "intercept toggled");
        for held in released {
            let _ = held.reply.send(Verdict::Forward(held.item.request));
        }
    }

    /// Park `request` and announce it. The receiver yields the verdict, or an
    /// error if the queue forgot the item.
    pub fn hold(&self, client: &str, request: HttpRequest) -> (String, oneshot::Receiver<Verdict>) {
        let (tx, rx) = oneshot::channel();
        let item = InterceptedItem::new(client, request);
        let id = item.id.clone();
        self.inner.lock().held.push(Held { item: item.clone(), reply: tx });
        tracing::debug!(%id, url = %item.request.url, "request held");
        self.bus.publish(Event::ProxyIntercept(item));
        (id, rx)
    }

    /// Release a held request, optionally replaced by an edited one.
    pub fn forward(&self, id: &str, edited: Option<HttpRequest>) -> Result<InterceptedItem> {
        let held = self.inner.lock().take(id)?;
        let mut item = held.item;
        if let Some(request) = edited {
            item.request = request;
        }
        item.disposition = Disposition::Forwarded;
        let _ = held.reply.send(Verdict::Forward(item.request.clone()));
        tracing::debug!(%id, "intercept forwarded");
        Ok(item)
    }

    pub fn discard(&self, id: &str) -> Result<InterceptedItem> {
        let held = self.inner.lock().take(id)?;
        let mut item = held.item;
        item.disposition = Disposition::Dropped;
        let _ = held.reply.send(Verdict::Drop);
        tracing::debug!(%id, "intercept dropped");
        Ok(item)
    }

    /// Resolve everything still held as dropped.
    pub fn discard_all(&self) -> usize {
        let held: Vec<Held> = {
            let mut inner = self.inner.lock();
            let ids: Vec<String> = inner.held.iter().map(|h| h.item.id.clone()).collect();
            ids.into_iter().filter_map(|id| inner.take(&id).ok()).collect()
        };
        let count = held.len();
        for h in held {
            let _ = h.reply.send(Verdict::Drop);
        }
        count
    }

    /// Held items in arrival order.
    pub fn pending(&self) -> Vec<InterceptedItem> {
        self.inner.lock().held.iter().map(|h| h.item.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> InterceptQueue {
        let queue = InterceptQueue::new(EventBus::new(16));
        queue.set_enabled(true);
        queue
    }

    #[tokio::test]
    async fn test_forward_with_edit() {
        let queue = queue();
        let mut events = queue.bus.subscribe();
        let (id, rx) = queue.hold("127.0.0.1", HttpRequest::new("GET", "http://example.com/"));
        assert!(matches!(events.recv().await.unwrap(), Event::ProxyIntercept(item) if item.id == id));
        assert_eq!(queue.pending().len(), 1);

        let edited = HttpRequest::new("GET", "http://example.com/edited");
        let item = queue.forward(&id, Some(edited.clone())).unwrap();
        assert_eq!(item.disposition, Disposition::Forwarded);
        assert_eq!(rx.await.unwrap(), Verdict::Forward(edited));
        assert!(queue.pending().is_empty());
    }

    #[tokio::test]
    async fn test_resolution_is_final() {
        let queue = queue();
        let (id, rx) = queue.hold("127.0.0.1", HttpRequest::new("GET", "http://example.com/"));
        assert_eq!(queue.discard(&id).unwrap().disposition, Disposition::Dropped);
        assert_eq!(rx.await.unwrap(), Verdict::Drop);

        assert!(matches!(queue.forward(&id, None), Err(ProxyError::AlreadyResolved(_))));
        assert!(matches!(queue.discard(&id), Err(ProxyError::AlreadyResolved(_))));
        assert!(matches!(queue.discard("nope"), Err(ProxyError::UnknownIntercept(_))));
    }

    #[tokio::test]
    async fn test_disable_releases_and_discard_all() {
        let queue = queue();
        let request = HttpRequest::new("GET", "http://example.com/");
        let (_, first) = queue.hold("127.0.0.1", request.clone());
        queue.set_enabled(false);
        assert!(!queue.is_enabled());
        assert_eq!(first.await.unwrap(), Verdict::Forward(request.clone()));

        queue.set_enabled(true);
        let (_, a) = queue.hold("127.0.0.1", request.clone());
        let (_, b) = queue.hold("127.0.0.1", request);
        assert_eq!(queue.discard_all(), 2);
        assert_eq!(a.await.unwrap(), Verdict::Drop);
        assert_eq!(b.await.unwrap(), Verdict::Drop);
    }
}
