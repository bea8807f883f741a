//! Proxy history: recording and queries

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use trawl_core::ProxyTransaction;
use trawl_store::{FilterExpr, Ingest, Inspector, Store};

pub type TransactionIngest = Ingest<ProxyTransaction, Box<dyn Inspector<ProxyTransaction>>>;

/// The single writer for proxy history, shared by every connection and the
/// repeater. Outlives any one proxy run.
pub struct Recorder {
    ingest: Mutex<TransactionIngest>,
}

impl Recorder {
    pub fn new(ingest: TransactionIngest) -> Self {
        Self { ingest: Mutex::new(ingest) }
    }

    pub fn record(&self, tx: ProxyTransaction) -> Arc<ProxyTransaction> {
        let tx = self.ingest.lock().push(tx);
        tracing::debug!(no = tx.no, summary = %tx.summary(), "transaction recorded");
        tx
    }

    pub fn store(&self) -> Arc<Store<ProxyTransaction>> {
        Arc::clone(self.ingest.lock().store())
    }
}

/// All set fields must match. `search` looks through the URL, header values
/// and both bodies; `filter` is a display filter over the history store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HistoryFilter {
    pub host: Option<String>,
    pub method: Option<String>,
    pub status: Option<u16>,
    pub search: Option<String>,
    pub filter: Option<String>,
    pub intercepted_only: bool,
}

impl HistoryFilter {
    pub fn host(host: &str) -> Self {
        Self { host: Some(host.to_string()), ..Self::default() }
    }

    pub fn search(needle: &str) -> Self {
        Self { search: Some(needle.to_string()), ..Self::default() }
    }

    pub fn matches(&self, tx: &ProxyTransaction) -> bool {
        if let Some(host) = &self.host {
            if !tx.host.to_ascii_lowercase().contains(&host.to_ascii_lowercase()) {
                return false;
            }
        }
        if let Some(method) = &self.method {
            if !tx.request.method.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        if self.status.is_some() && tx.status() != self.status {
            return false;
        }
        if self.intercepted_only && !tx.intercepted {
            return false;
        }
        match &self.search {
            Some(needle) if !needle.is_empty() => contains_text(tx, &needle.to_lowercase()),
            _ => true,
        }
    }

    pub fn apply(&self, store: &Store<ProxyTransaction>) -> Vec<Arc<ProxyTransaction>> {
        let expr = self.filter.as_deref().map(FilterExpr::parse).unwrap_or_default();
        store.filter(&expr).filter(|tx| self.matches(tx)).collect()
    }
}

fn contains_text(tx: &ProxyTransaction, needle: &str) -> bool {
    let hit = |text: &str| text.to_lowercase().contains(needle);
    let request = &tx.request;
    if hit(&request.url) || request.headers.iter().any(|h| hit(&h.value)) || hit(&String::from_utf8_lossy(&request.body)) {
        return true;
    }
    tx.response.as_ref().is_some_and(|r| {
        r.headers.iter().any(|h| hit(&h.value)) || hit(&String::from_utf8_lossy(&r.body))
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use trawl_core::{EventBus, HttpRequest, HttpResponse, PendingTransaction};
    use trawl_store::{AlertLog, NoInspection};

    pub fn recorder(bus: &EventBus) -> Arc<Recorder> {
        let ingest = Ingest::transactions(
            Arc::new(Store::new(1000)),
            Arc::new(AlertLog::new(100)),
            Box::new(NoInspection) as Box<dyn Inspector<ProxyTransaction>>,
            bus.clone(),
        );
        Arc::new(Recorder::new(ingest))
    }

    fn record(store: &Store<ProxyTransaction>, method: &str, url: &str, status: Option<u16>, body: &str) {
        let request = HttpRequest::new(method, url);
        let pending = PendingTransaction::from_request("10.0.0.5:40000".parse().unwrap(), request).unwrap();
        let tx = match status {
            Some(status) => {
                let mut response = HttpResponse::new(status, "");
                response.body = body.as_bytes().to_vec();
                pending.complete(response)
            }
            None => pending.abort("dropped by user"),
        };
        store.append(tx);
    }

    fn store() -> Store<ProxyTransaction> {
        let store = Store::new(100);
        record(&store, "GET", "http://example.com/", Some(200), "welcome");
        record(&store, "POST", "http://api.example.com/login", Some(401), "denied");
        record(&store, "GET", "https://other.org/", None, "");
        store
    }

    #[test]
    fn test_host_method_status() {
        let store = store();
        assert_eq!(HistoryFilter::host("example.com").apply(&store).len(), 2);

        let filter = HistoryFilter { method: Some("post".into()), ..Default::default() };
        assert_eq!(filter.apply(&store)[0].request.url, "http://api.example.com/login");

        let filter = HistoryFilter { status: Some(200), ..Default::default() };
        assert_eq!(filter.apply(&store).len(), 1);
        assert_eq!(HistoryFilter::default().apply(&store).len(), 3);
    }

    #[test]
    fn test_search_and_display_filter() {
        let store = store();
        let hits = HistoryFilter::search("DENIED").apply(&store);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].status(), Some(401));

        let filter = HistoryFilter { filter: Some("port==443".into()), ..Default::default() };
        let hits = filter.apply(&store);
        assert_eq!(hits.len(), 1);
        assert!(hits[0].is_aborted());
    }

    #[test]
    fn test_recorder_numbers_and_announces() {
        let bus = EventBus::new(16);
        let mut events = bus.subscribe();
        let recorder = recorder(&bus);
        record(&recorder.store(), "GET", "http://example.com/", Some(200), "");

        let pending = PendingTransaction::from_request("10.0.0.5:40000".parse().unwrap(), HttpRequest::new("GET", "http://example.com/2")).unwrap();
        let tx = recorder.record(pending.abort("reset"));
        assert_eq!(tx.no, 2);
        assert!(matches!(events.try_recv(), Ok(trawl_core::Event::ProxyHistoryUpdate(t)) if t.no == 2));
    }

    #[test]
    fn test_filter_from_json() {
        let filter: HistoryFilter = serde_json::from_str(r#"{"host":"example","status":401}"#).unwrap();
        assert_eq!(filter.host.as_deref(), Some("example"));
        assert_eq!(filter.status, Some(401));
    }
}
