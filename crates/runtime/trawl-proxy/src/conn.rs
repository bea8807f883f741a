//! Per-connection state machine
//!
//! ```text
//! Listening -> [TlsHandshake] -> RequestParsed -> {InterceptHeld | Forwarding}
//!           -> ResponseParsed -> Completed | Aborted
//! ```
//!
//! Every request that got far enough to be parsed ends up in history exactly
//! once, completed or aborted. Unparseable requests are recorded against a
//! placeholder request so the failure is still visible.

use crate::ca::CertificateAuthority;
use crate::codec::{self, Incoming, Limits};
use crate::history::Recorder;
use crate::intercept::{InterceptQueue, Verdict};
use crate::rules::{self, MatchReplaceRule, ScopeRule};
use crate::upstream::Upstream;
use crate::ProxyError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use trawl_core::transaction::split_authority;
use trawl_core::{HttpRequest, HttpResponse, PendingTransaction, Scheme};

pub const DROPPED_BY_USER: &str = "dropped by user";
pub const PROXY_STOPPED: &str = "proxy stopped";

const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Everything a connection task needs, shared by all of them.
pub(crate) struct Context {
    pub upstream: Upstream,
    pub limits: Limits,
    pub idle: Duration,
    pub intercept_tls: bool,
    pub scope: Vec<ScopeRule>,
    pub match_replace: Vec<MatchReplaceRule>,
    pub ca: Option<Arc<CertificateAuthority>>,
    pub intercept: Arc<InterceptQueue>,
    pub recorder: Arc<Recorder>,
}

enum Next {
    Close,
    Connect(HttpRequest),
}

pub(crate) async fn handle(stream: TcpStream, peer: SocketAddr, cx: Arc<Context>, mut shutdown: watch::Receiver<bool>) {
    tracing::debug!(%peer, "connection accepted");
    let mut stream = BufReader::new(stream);
    if let Next::Connect(request) = exchange_loop(&mut stream, peer, None, &cx, &mut shutdown).await {
        tunnel(stream, peer, request, &cx, &mut shutdown).await;
    }
    tracing::debug!(%peer, "connection closed");
}

/// Stand-in for a request that never parsed.
fn placeholder(peer: SocketAddr, base: Option<&str>) -> PendingTransaction {
    let url = base.map_or_else(|| "http://unknown/".to_string(), |base| format!("{base}/"));
    let request = HttpRequest::new("-", url);
    PendingTransaction::from_request(peer, request.clone())
        .unwrap_or_else(|_| PendingTransaction::new(peer, Scheme::Http, "unknown", 80, request))
}

/// Record the abort, then answer with a proxy-generated error.
async fn fail<S: AsyncWrite + Unpin>(
    stream: &mut S,
    cx: &Context,
    pending: PendingTransaction,
    status: u16,
    reason: &str,
    err: &ProxyError,
) {
    let tx = cx.recorder.record(pending.abort(err.to_string()));
    tracing::debug!(no = tx.no, status, error = %err, "aborted");
    let response = codec::error_response(status, reason, &err.to_string());
    let _ = codec::write_response(stream, &response, false).await;
}

async fn exchange_loop<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut BufReader<S>,
    peer: SocketAddr,
    base: Option<&str>,
    cx: &Context,
    shutdown: &mut watch::Receiver<bool>,
) -> Next {
    loop {
        if *shutdown.borrow() {
            return Next::Close;
        }
        let read = tokio::select! {
            read = tokio::time::timeout(cx.idle, codec::read_request(stream, base, &cx.limits)) => read,
            _ = shutdown.changed() => return Next::Close,
        };

        let incoming = match read {
            Err(_) => {
                tracing::debug!(%peer, "client idle");
                return Next::Close;
            }
            Ok(Ok(None)) => return Next::Close,
            Ok(Ok(Some(incoming))) => incoming,
            Ok(Err(ProxyError::Io(e))) => {
                tracing::debug!(%peer, error = %e, "client read failed");
                return Next::Close;
            }
            Ok(Err(e)) => {
                let (status, reason) = match e {
                    ProxyError::TooLarge(_) => (413, "Payload Too Large"),
                    _ => (400, "Bad Request"),
                };
                fail(stream, cx, placeholder(peer, base), status, reason, &e).await;
                return Next::Close;
            }
        };

        if incoming.request.is_connect() {
            if base.is_none() {
                return Next::Connect(incoming.request);
            }
            let pending = placeholder(peer, base);
            let err = ProxyError::Malformed("CONNECT inside a tunnel".into());
            fail(stream, cx, pending, 400, "Bad Request", &err).await;
            return Next::Close;
        }

        if !process(stream, peer, incoming, cx, shutdown).await {
            return Next::Close;
        }
    }
}

/// Run one parsed request to completion. True to keep the connection.
async fn process<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut BufReader<S>,
    peer: SocketAddr,
    incoming: Incoming,
    cx: &Context,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let Incoming { request, keep_alive } = incoming;
    tracing::debug!(%peer, method = %request.method, url = %request.url, "request parsed");

    let mut pending = match PendingTransaction::from_request(peer, request.clone()) {
        Ok(pending) => pending,
        Err(e) => {
            let pending = PendingTransaction::new(peer, Scheme::Http, "unknown", 80, request);
            fail(stream, cx, pending, 400, "Bad Request", &e.into()).await;
            return false;
        }
    };

    let mut rewritten = pending.request.clone();
    if rules::rewrite_request(&cx.match_replace, &mut rewritten, pending.scheme, &pending.host, pending.port) {
        if let Err(e) = pending.replace_request(rewritten) {
            fail(stream, cx, pending, 400, "Bad Request", &e.into()).await;
            return false;
        }
    }

    if cx.intercept.is_enabled() && rules::in_scope(&cx.scope, pending.scheme, &pending.host, pending.port) {
        pending.intercepted = true;
        let (id, verdict) = cx.intercept.hold(&pending.client, pending.request.clone());
        tracing::debug!(%peer, %id, "intercept held");
        let verdict = tokio::select! {
            verdict = verdict => verdict.unwrap_or(Verdict::Drop),
            _ = shutdown.changed() => Verdict::Drop,
        };
        match verdict {
            Verdict::Forward(edited) => {
                if let Err(e) = pending.replace_request(edited) {
                    fail(stream, cx, pending, 400, "Bad Request", &e.into()).await;
                    return false;
                }
            }
            Verdict::Drop => {
                let tx = cx.recorder.record(pending.abort(DROPPED_BY_USER));
                tracing::debug!(%peer, no = tx.no, "dropped by user");
                return false;
            }
        }
    }

    tracing::debug!(%peer, host = %pending.host, port = pending.port, "forwarding");
    let sent = tokio::select! {
        sent = cx.upstream.send(&pending.request) => Some(sent),
        _ = shutdown.changed() => None,
    };

    match sent {
        None => {
            cx.recorder.record(pending.abort(PROXY_STOPPED));
            false
        }
        Some(Err(e)) => {
            tracing::warn!(host = %pending.host, port = pending.port, error = %e, "upstream failed");
            let (status, reason) = match e {
                ProxyError::Timeout(_) => (504, "Gateway Timeout"),
                _ => (502, "Bad Gateway"),
            };
            fail(stream, cx, pending, status, reason, &e).await;
            false
        }
        Some(Ok(mut response)) => {
            tracing::debug!(%peer, status = response.status, "response parsed");
            if rules::rewrite_response(&cx.match_replace, &mut response, pending.scheme, &pending.host, pending.port) {
                pending.modified = true;
            }
            let tx = cx.recorder.record(pending.complete(response));
            tracing::debug!(%peer, no = tx.no, "completed");
            let written = match &tx.response {
                Some(response) => codec::write_response(stream, response, keep_alive).await,
                None => Ok(()),
            };
            match written {
                Ok(()) => keep_alive,
                Err(e) => {
                    tracing::debug!(%peer, error = %e, "client went away");
                    false
                }
            }
        }
    }
}

async fn tunnel(
    mut stream: BufReader<TcpStream>,
    peer: SocketAddr,
    request: HttpRequest,
    cx: &Context,
    shutdown: &mut watch::Receiver<bool>,
) {
    let (host, port) = match split_authority(&request.url, Scheme::Https.default_port()) {
        Ok(target) => target,
        Err(e) => {
            let pending = PendingTransaction::new(peer, Scheme::Https, "unknown", 443, request);
            fail(&mut stream, cx, pending, 400, "Bad Request", &e.into()).await;
            return;
        }
    };
    let pending = PendingTransaction::new(peer, Scheme::Https, host, port, request);

    match &cx.ca {
        Some(ca) if cx.intercept_tls => decrypt(stream, peer, pending, ca, cx, shutdown).await,
        _ => blind(stream, pending, cx, shutdown).await,
    }
}

/// Terminate TLS with a minted leaf and proxy the requests inside.
async fn decrypt(
    mut stream: BufReader<TcpStream>,
    peer: SocketAddr,
    pending: PendingTransaction,
    ca: &CertificateAuthority,
    cx: &Context,
    shutdown: &mut watch::Receiver<bool>,
) {
    let config = match ca.leaf_for(&pending.host) {
        Ok(config) => config,
        Err(e) => return fail(&mut stream, cx, pending, 502, "Bad Gateway", &e).await,
    };
    if stream.write_all(ESTABLISHED).await.is_err() || stream.flush().await.is_err() {
        return;
    }

    tracing::debug!(%peer, host = %pending.host, "tls handshake");
    let handshake = tokio::time::timeout(cx.idle, TlsAcceptor::from(config).accept(stream.into_inner())).await;
    let tls = match handshake {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            let tx = cx.recorder.record(pending.abort(format!("TLS handshake failed: {e}")));
            tracing::debug!(%peer, no = tx.no, error = %e, "tls handshake failed");
            return;
        }
        Err(_) => {
            cx.recorder.record(pending.abort("TLS handshake timed out"));
            return;
        }
    };

    let base = if pending.port == Scheme::Https.default_port() {
        format!("https://{}", pending.host)
    } else {
        format!("https://{}:{}", pending.host, pending.port)
    };
    let mut stream = BufReader::new(tls);
    exchange_loop(&mut stream, peer, Some(&base), cx, shutdown).await;
    let _ = stream.shutdown().await;
}

/// Relay bytes untouched; the CONNECT itself is the recorded transaction.
async fn blind(
    mut stream: BufReader<TcpStream>,
    pending: PendingTransaction,
    cx: &Context,
    shutdown: &mut watch::Receiver<bool>,
) {
    let started = Instant::now();
    let mut origin = match cx.upstream.connect(&pending.host, pending.port).await {
        Ok(origin) => origin,
        Err(e) => return fail(&mut stream, cx, pending, 502, "Bad Gateway", &e).await,
    };
    if stream.write_all(ESTABLISHED).await.is_err() || stream.flush().await.is_err() {
        return;
    }

    let early = stream.buffer().to_vec();
    let mut client = stream.into_inner();
    if !early.is_empty() && origin.write_all(&early).await.is_err() {
        return;
    }

    tracing::debug!(host = %pending.host, port = pending.port, "blind tunnel open");
    let relayed = tokio::select! {
        relayed = tokio::io::copy_bidirectional(&mut client, &mut origin) => Some(relayed),
        _ = shutdown.changed() => None,
    };

    let mut response = HttpResponse::new(200, "Connection Established");
    response.elapsed_ms = started.elapsed().as_millis() as u64;
    let tx = match relayed {
        Some(Ok((sent, received))) => {
            tracing::debug!(host = %pending.host, sent, received, "blind tunnel closed");
            pending.complete(response)
        }
        Some(Err(e)) => pending.abort(format!("tunnel: {e}")),
        None => pending.abort(PROXY_STOPPED),
    };
    cx.recorder.record(tx);
}
