//! Manual request replay

use crate::history::Recorder;
use crate::upstream::Upstream;
use crate::Result;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use trawl_core::{HttpRequest, PendingTransaction, ProxyTransaction};

/// Re-sends requests through the proxy's upstream client. Works whether or
/// not the proxy is listening; every attempt lands in history.
#[derive(Clone)]
pub struct Repeater {
    upstream: Upstream,
    recorder: Arc<Recorder>,
}

impl Repeater {
    pub fn new(upstream: Upstream, recorder: Arc<Recorder>) -> Self {
        Self { upstream, recorder }
    }

    pub async fn repeat(&self, request: HttpRequest) -> Result<Arc<ProxyTransaction>> {
        let local = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        let pending = PendingTransaction::from_request(local, request)?;
        tracing::debug!(url = %pending.request.url, "repeating request");

        match self.upstream.send(&pending.request).await {
            Ok(response) => Ok(self.recorder.record(pending.complete(response))),
            Err(e) => {
                self.recorder.record(pending.abort(e.to_string()));
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::tests::recorder;
    use crate::upstream::tests::echo_origin;
    use crate::ProxyError;
    use trawl_config::ProxyConfig;
    use trawl_core::EventBus;

    #[tokio::test]
    async fn test_repeat_records() {
        let origin = echo_origin().await;
        let recorder = recorder(&EventBus::new(16));
        let repeater = Repeater::new(Upstream::new(&ProxyConfig::default()), Arc::clone(&recorder));

        let request = HttpRequest::new("PUT", format!("http://{origin}/items/1")).with_body("x=1");
        let tx = repeater.repeat(request).await.unwrap();
        assert_eq!(tx.status(), Some(200));
        assert_eq!(String::from_utf8_lossy(&tx.response.as_ref().unwrap().body), "PUT /items/1 HTTP/1.1|x=1");
        assert_eq!(recorder.store().len(), 1);
    }

    #[tokio::test]
    async fn test_repeat_failure_is_recorded() {
        let recorder = recorder(&EventBus::new(16));
        let repeater = Repeater::new(Upstream::new(&ProxyConfig::default()), Arc::clone(&recorder));

        let err = repeater.repeat(HttpRequest::new("GET", "not a url")).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidInput(_) | ProxyError::Malformed(_)));
        assert!(recorder.store().is_empty());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed = listener.local_addr().unwrap();
        drop(listener);
        assert!(repeater.repeat(HttpRequest::new("GET", format!("http://{closed}/"))).await.is_err());
        assert!(recorder.store().snapshot()[0].is_aborted());
    }
}
