//! HTTP transactions
//!
//! A proxied exchange starts life as a `PendingTransaction` and is frozen into
//! a `ProxyTransaction` exactly once, by `complete` or `abort`.

use crate::{Result, TrawlError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use url::Url;

/// One header line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Ordered header multimap. Duplicates and original order are preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push(Header { name: name.into(), value: value.into() });
    }

    /// First value for `name`, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|h| h.name.eq_ignore_ascii_case(name)).map(|h| h.value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0.iter().filter(move |h| h.name.eq_ignore_ascii_case(name)).map(|h| h.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace every `name` line with a single one, keeping the first position.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter().position(|h| h.name.eq_ignore_ascii_case(name)) {
            Some(pos) => {
                self.0[pos].value = value;
                let mut index = 0;
                self.0.retain(|h| {
                    let keep = index <= pos || !h.name.eq_ignore_ascii_case(name);
                    index += 1;
                    keep
                });
            }
            None => self.append(name, value),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|h| !h.name.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Header> {
        self.0.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Approximate size on the wire (`Name: value\r\n` per line).
    pub fn wire_len(&self) -> usize {
        self.0.iter().map(|h| h.name.len() + h.value.len() + 4).sum()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(n, v)| Header { name: n.into(), value: v.into() }).collect())
    }
}

/// Bodies travel as text; bytes that are not UTF-8 are replaced.
mod body_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        Ok(String::deserialize(deserializer)?.into_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        })
    }
}

/// Where a request is headed, resolved from its absolute URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Origin-form request target (`/path?query`)
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
    pub method: String,
    /// Absolute URL, or `host:port` for CONNECT
    pub url: String,
    #[serde(default = "default_version")]
    pub http_version: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, rename = "bodyString", with = "body_text")]
    pub body: Vec<u8>,
}

fn default_version() -> String {
    "HTTP/1.1".to_string()
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            http_version: default_version(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Resolve scheme, host, port and origin-form path.
    pub fn target(&self) -> Result<Target> {
        if self.is_connect() {
            let (host, port) = split_authority(&self.url, 443)?;
            return Ok(Target { scheme: Scheme::Https, host, port, path: String::new() });
        }

        let url = Url::parse(&self.url)
            .map_err(|e| TrawlError::InvalidInput(format!("bad request URL {:?}: {e}", self.url)))?;
        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => return Err(TrawlError::InvalidInput(format!("unsupported scheme {other}"))),
        };
        let host = url
            .host_str()
            .ok_or_else(|| TrawlError::InvalidInput(format!("no host in {:?}", self.url)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port().unwrap_or_else(|| scheme.default_port());
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        Ok(Target { scheme, host, port, path })
    }

    /// Approximate size on the wire.
    pub fn wire_len(&self) -> usize {
        self.method.len() + self.url.len() + self.http_version.len() + 4
            + self.headers.wire_len()
            + 2
            + self.body.len()
    }
}

/// Split `host:port`, tolerating bracketed IPv6 literals.
pub fn split_authority(authority: &str, default_port: u16) -> Result<(String, u16)> {
    let bad = || TrawlError::InvalidInput(format!("bad authority {authority:?}"));
    if authority.is_empty() {
        return Err(bad());
    }
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(bad)?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().map_err(|_| bad())?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            Ok((host.to_string(), port.parse().map_err(|_| bad())?))
        }
        _ => Ok((authority.to_string(), default_port)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    #[serde(default = "default_version")]
    pub http_version: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, rename = "bodyString", with = "body_text")]
    pub body: Vec<u8>,
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl HttpResponse {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            http_version: default_version(),
            headers: Headers::new(),
            body: Vec::new(),
            elapsed_ms: 0,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn wire_len(&self) -> usize {
        self.http_version.len() + 5 + self.reason.len() + 2 + self.headers.wire_len() + 2 + self.body.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TransactionState {
    Completed,
    Aborted { reason: String },
}

/// A transaction still in flight. Consumed by `complete` or `abort`.
#[derive(Debug, Clone)]
pub struct PendingTransaction {
    pub client: String,
    pub client_port: u16,
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub request: HttpRequest,
    pub started_at: DateTime<Utc>,
    pub intercepted: bool,
    pub modified: bool,
}

impl PendingTransaction {
    pub fn new(client: SocketAddr, scheme: Scheme, host: impl Into<String>, port: u16, request: HttpRequest) -> Self {
        Self {
            client: client.ip().to_string(),
            client_port: client.port(),
            scheme,
            host: host.into(),
            port,
            request,
            started_at: Utc::now(),
            intercepted: false,
            modified: false,
        }
    }

    /// Build from the request's own URL.
    pub fn from_request(client: SocketAddr, request: HttpRequest) -> Result<Self> {
        let target = request.target()?;
        Ok(Self::new(client, target.scheme, target.host, target.port, request))
    }

    /// Swap in an edited request, re-deriving the target.
    pub fn replace_request(&mut self, request: HttpRequest) -> Result<()> {
        let target = request.target()?;
        if request != self.request {
            self.modified = true;
        }
        self.scheme = target.scheme;
        self.host = target.host;
        self.port = target.port;
        self.request = request;
        Ok(())
    }

    pub fn complete(self, response: HttpResponse) -> ProxyTransaction {
        self.finish(TransactionState::Completed, Some(response))
    }

    pub fn abort(self, reason: impl Into<String>) -> ProxyTransaction {
        self.finish(TransactionState::Aborted { reason: reason.into() }, None)
    }

    fn finish(self, state: TransactionState, response: Option<HttpResponse>) -> ProxyTransaction {
        ProxyTransaction {
            no: 0,
            client: self.client,
            client_port: self.client_port,
            scheme: self.scheme,
            host: self.host,
            port: self.port,
            started_at: self.started_at,
            request: self.request,
            response,
            state,
            intercepted: self.intercepted,
            modified: self.modified,
        }
    }
}

/// A finished proxy exchange as kept in history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyTransaction {
    #[serde(rename = "id")]
    pub no: u64,
    pub client: String,
    pub client_port: u16,
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    #[serde(rename = "timestamp")]
    pub started_at: DateTime<Utc>,
    pub request: HttpRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<HttpResponse>,
    pub state: TransactionState,
    #[serde(default)]
    pub intercepted: bool,
    #[serde(default)]
    pub modified: bool,
}

impl ProxyTransaction {
    pub fn status(&self) -> Option<u16> {
        self.response.as_ref().map(|r| r.status)
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.state, TransactionState::Aborted { .. })
    }

    pub fn length(&self) -> usize {
        self.request.wire_len() + self.response.as_ref().map_or(0, HttpResponse::wire_len)
    }

    pub fn summary(&self) -> String {
        match (&self.state, &self.response) {
            (TransactionState::Completed, Some(resp)) => {
                format!("{} {} → {} {}", self.request.method, self.request.url, resp.status, resp.reason)
            }
            (TransactionState::Aborted { reason }, _) => {
                format!("{} {} (aborted: {reason})", self.request.method, self.request.url)
            }
            _ => format!("{} {}", self.request.method, self.request.url),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    Pending,
    Forwarded,
    Dropped,
}

/// A request held for the user to forward, edit or drop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptedItem {
    pub id: String,
    pub client: String,
    pub request: HttpRequest,
    pub disposition: Disposition,
    pub created_at: DateTime<Utc>,
}

impl InterceptedItem {
    pub fn new(client: impl Into<String>, request: HttpRequest) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            client: client.into(),
            request,
            disposition: Disposition::Pending,
            created_at: Utc::now(),
        }
    }
}
