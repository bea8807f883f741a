//! Listener, accept loop and shutdown

use crate::ca::CertificateAuthority;
use crate::codec::Limits;
use crate::conn::{self, Context};
use crate::history::Recorder;
use crate::intercept::InterceptQueue;
use crate::rules::{MatchReplaceRule, ScopeRule};
use crate::upstream::Upstream;
use crate::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use trawl_config::ProxyConfig;
use trawl_core::{Event, EventBus};

/// How long stop waits for connection tasks before aborting them.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Per-run proxy settings, seeded from `ProxyConfig`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxySettings {
    pub listen_addr: String,
    pub port: u16,
    /// Decrypt `CONNECT` tunnels when a CA is available
    pub intercept_tls: bool,
    /// Start with interception on
    pub intercept: bool,
    pub scope: Vec<ScopeRule>,
    pub match_replace: Vec<MatchReplaceRule>,
}

impl From<&ProxyConfig> for ProxySettings {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            listen_addr: config.listen_addr.clone(),
            port: config.port,
            intercept_tls: config.intercept_tls,
            intercept: false,
            scope: Vec::new(),
            match_replace: Vec::new(),
        }
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self::from(&ProxyConfig::default())
    }
}

impl ProxySettings {
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.trim().is_empty() {
            return Err(ProxyError::InvalidInput("listen address is empty".into()));
        }
        self.match_replace.iter().try_for_each(MatchReplaceRule::validate)
    }
}

pub struct ProxyServer {
    addr: SocketAddr,
    settings: ProxySettings,
    intercept: Arc<InterceptQueue>,
    bus: EventBus,
    shutdown: watch::Sender<bool>,
    accept: Option<JoinHandle<()>>,
}

impl ProxyServer {
    /// Bind and start accepting. Without a CA, `CONNECT` tunnels are relayed
    /// blind even when TLS interception is requested.
    pub async fn start(
        settings: ProxySettings,
        config: &ProxyConfig,
        recorder: Arc<Recorder>,
        ca: Option<Arc<CertificateAuthority>>,
        bus: EventBus,
    ) -> Result<Self> {
        settings.validate()?;
        let addr = format!("{}:{}", settings.listen_addr, settings.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ProxyError::Bind { addr: addr.clone(), source })?;
        let local = listener.local_addr()?;

        if settings.intercept_tls && ca.is_none() {
            tracing::warn!("no CA certificate, HTTPS will be tunnelled without inspection");
        }

        let intercept = Arc::new(InterceptQueue::new(bus.clone()));
        intercept.set_enabled(settings.intercept);

        let cx = Arc::new(Context {
            upstream: Upstream::new(config),
            limits: Limits::from(config),
            idle: Duration::from_secs(config.client_idle_timeout_secs.max(1)),
            intercept_tls: settings.intercept_tls,
            scope: settings.scope.clone(),
            match_replace: settings.match_replace.clone(),
            ca,
            intercept: Arc::clone(&intercept),
            recorder,
        });

        let (shutdown, stopped) = watch::channel(false);
        let accept = tokio::spawn(accept_loop(listener, cx, stopped, bus.clone()));

        tracing::info!(addr = %local, "proxy listening");
        bus.publish(Event::ProxyStarted { port: local.port() });
        Ok(Self { addr: local, settings, intercept, bus, shutdown, accept: Some(accept) })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    pub fn intercept(&self) -> &Arc<InterceptQueue> {
        &self.intercept
    }

    /// Drop everything held, close every connection and wait for the
    /// accept loop.
    pub async fn stop(mut self) {
        let dropped = self.intercept.discard_all();
        let _ = self.shutdown.send(true);
        if let Some(accept) = self.accept.take() {
            let _ = accept.await;
        }
        tracing::info!(port = self.addr.port(), dropped, "proxy stopped");
        self.bus.publish(Event::ProxyStopped);
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        if let Some(accept) = self.accept.take() {
            let _ = self.shutdown.send(true);
            accept.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, cx: Arc<Context>, mut stopped: watch::Receiver<bool>, bus: EventBus) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(conn::handle(stream, peer, Arc::clone(&cx), stopped.clone()));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    bus.publish(Event::ProxyError { message: e.to_string() });
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = stopped.changed() => break,
        }
    }
    drop(listener);

    let drained = tokio::time::timeout(STOP_GRACE, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(remaining = connections.len(), "aborting connections");
        connections.abort_all();
    }
}
