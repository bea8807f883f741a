//! HTTP/1.1 codec
//!
//! Heads are collected line by line and parsed with `httparse`; bodies are
//! framed by `Content-Length`, chunked encoding or (responses only) the end
//! of the stream. Chunked bodies are decoded, and every message is written
//! back out with an explicit `Content-Length`.

use crate::{ProxyError, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use trawl_config::ProxyConfig;
use trawl_core::{Headers, HttpRequest, HttpResponse};

const MAX_HEADERS: usize = 256;

/// Headers that describe a single hop and are never forwarded.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "proxy-authorization",
    "proxy-authenticate",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self::from(&ProxyConfig::default())
    }
}

impl From<&ProxyConfig> for Limits {
    fn from(config: &ProxyConfig) -> Self {
        Self { max_header_bytes: config.max_header_bytes, max_body_bytes: config.max_body_bytes }
    }
}

/// A request read off a client connection.
#[derive(Debug, Clone)]
pub struct Incoming {
    pub request: HttpRequest,
    /// The client wants the connection kept open afterwards
    pub keep_alive: bool,
}

fn version(minor: Option<u8>) -> String {
    match minor {
        Some(0) => "HTTP/1.0".to_string(),
        _ => "HTTP/1.1".to_string(),
    }
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Headers {
    raw.iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect()
}

fn has_token(headers: &Headers, name: &str, token: &str) -> bool {
    headers
        .get_all(name)
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

fn wants_keep_alive(http_version: &str, headers: &Headers) -> bool {
    let close = has_token(headers, "connection", "close") || has_token(headers, "proxy-connection", "close");
    if http_version == "HTTP/1.0" {
        !close && (has_token(headers, "connection", "keep-alive") || has_token(headers, "proxy-connection", "keep-alive"))
    } else {
        !close
    }
}

/// Read the head up to and including the blank line. `None` on EOF before
/// the first byte.
async fn read_head<R: AsyncBufRead + Unpin>(reader: &mut R, limits: &Limits) -> Result<Option<Vec<u8>>> {
    let mut head = Vec::new();
    loop {
        let before = head.len();
        let n = reader.read_until(b'\n', &mut head).await?;
        if n == 0 {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        if head.len() > limits.max_header_bytes {
            return Err(ProxyError::TooLarge(format!("head exceeds {} bytes", limits.max_header_bytes)));
        }
        let line = &head[before..];
        // Leading blank lines before a request are tolerated
        if (line == b"\r\n" || line == b"\n") && before == 0 {
            head.clear();
            continue;
        }
        if line == b"\r\n" || line == b"\n" {
            return Ok(Some(head));
        }
    }
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R, limit: usize) -> Result<String> {
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Err(ProxyError::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }
    if line.len() > limit {
        return Err(ProxyError::TooLarge("chunk line".to_string()));
    }
    Ok(String::from_utf8_lossy(&line).trim_end().to_string())
}

async fn read_exact_body<R: AsyncBufRead + Unpin>(reader: &mut R, len: usize, limits: &Limits) -> Result<Vec<u8>> {
    if len > limits.max_body_bytes {
        return Err(ProxyError::TooLarge(format!("body of {len} bytes")));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

async fn read_chunked<R: AsyncBufRead + Unpin>(reader: &mut R, limits: &Limits) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let line = read_line(reader, limits.max_header_bytes).await?;
        let size_text = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| ProxyError::Malformed(format!("bad chunk size {size_text:?}")))?;
        if size == 0 {
            // Trailers up to the blank line
            while !read_line(reader, limits.max_header_bytes).await?.is_empty() {}
            return Ok(body);
        }
        if body.len() + size > limits.max_body_bytes {
            return Err(ProxyError::TooLarge(format!("chunked body over {} bytes", limits.max_body_bytes)));
        }
        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..]).await?;
        read_line(reader, limits.max_header_bytes).await?;
    }
}

fn content_length(headers: &Headers) -> Result<Option<usize>> {
    match headers.get("content-length") {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ProxyError::Malformed(format!("bad Content-Length {value:?}"))),
        None => Ok(None),
    }
}

/// Read one request. `base` (`https://host:port`) resolves origin-form
/// targets inside a decrypted tunnel. `Ok(None)` when the client closed the
/// connection between requests.
pub async fn read_request<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    base: Option<&str>,
    limits: &Limits,
) -> Result<Option<Incoming>> {
    let Some(head) = read_head(reader, limits).await? else {
        return Ok(None);
    };

    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut slots);
    match parsed.parse(&head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(ProxyError::Malformed("incomplete request head".into())),
        Err(e) => return Err(ProxyError::Malformed(format!("request head: {e}"))),
    }

    let method = parsed.method.unwrap_or_default().to_string();
    let target = parsed.path.unwrap_or_default().to_string();
    let http_version = version(parsed.version);
    let headers = collect_headers(parsed.headers);

    let url = if target.starts_with('/') {
        match (base, headers.get("host")) {
            (Some(base), _) => format!("{base}{target}"),
            (None, Some(host)) => format!("http://{host}{target}"),
            (None, None) => return Err(ProxyError::Malformed(format!("origin-form target {target} without Host"))),
        }
    } else {
        target
    };

    let body = if has_token(&headers, "transfer-encoding", "chunked") {
        read_chunked(reader, limits).await?
    } else {
        match content_length(&headers)? {
            Some(len) => read_exact_body(reader, len, limits).await?,
            None => Vec::new(),
        }
    };

    let keep_alive = wants_keep_alive(&http_version, &headers);
    Ok(Some(Incoming {
        request: HttpRequest { method, url, http_version, headers, body },
        keep_alive,
    }))
}

/// Read the response to a `method` request.
pub async fn read_response<R: AsyncBufRead + Unpin>(reader: &mut R, method: &str, limits: &Limits) -> Result<HttpResponse> {
    let head = read_head(reader, limits)
        .await?
        .ok_or_else(|| ProxyError::Malformed("upstream closed without a response".into()))?;

    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut slots);
    match parsed.parse(&head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(ProxyError::Malformed("incomplete response head".into())),
        Err(e) => return Err(ProxyError::Malformed(format!("response head: {e}"))),
    }

    let status = parsed.code.unwrap_or_default();
    let mut response = HttpResponse::new(status, parsed.reason.unwrap_or_default());
    response.http_version = version(parsed.version);
    response.headers = collect_headers(parsed.headers);

    let bodiless = method.eq_ignore_ascii_case("HEAD") || (100..200).contains(&status) || status == 204 || status == 304;
    response.body = if bodiless {
        Vec::new()
    } else if has_token(&response.headers, "transfer-encoding", "chunked") {
        read_chunked(reader, limits).await?
    } else if let Some(len) = content_length(&response.headers)? {
        read_exact_body(reader, len, limits).await?
    } else {
        let mut body = Vec::new();
        let cap = limits.max_body_bytes as u64 + 1;
        (&mut *reader).take(cap).read_to_end(&mut body).await?;
        if body.len() > limits.max_body_bytes {
            return Err(ProxyError::TooLarge(format!("response body over {} bytes", limits.max_body_bytes)));
        }
        body
    };
    Ok(response)
}

fn end_to_end(headers: &Headers) -> impl Iterator<Item = &trawl_core::transaction::Header> {
    headers.iter().filter(|h| {
        let name = h.name.to_ascii_lowercase();
        name != "content-length" && !HOP_BY_HOP.contains(&name.as_str())
    })
}

fn needs_length(method: &str) -> bool {
    matches!(method.to_ascii_uppercase().as_str(), "POST" | "PUT" | "PATCH")
}

/// Serialize a request for an origin server (`path` in origin form). Upstream
/// connections carry one request each, so `Connection: close` is always sent.
pub fn encode_request(request: &HttpRequest, path: &str) -> Vec<u8> {
    let mut out = format!("{} {} {}\r\n", request.method, path, request.http_version);
    for h in end_to_end(&request.headers) {
        out.push_str(&format!("{}: {}\r\n", h.name, h.value));
    }
    if !request.body.is_empty() || needs_length(&request.method) {
        out.push_str(&format!("Content-Length: {}\r\n", request.body.len()));
    }
    out.push_str("Connection: close\r\n\r\n");
    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(&request.body);
    bytes
}

pub fn encode_response(response: &HttpResponse, keep_alive: bool) -> Vec<u8> {
    let mut out = format!("{} {} {}\r\n", response.http_version, response.status, response.reason);
    for h in end_to_end(&response.headers) {
        out.push_str(&format!("{}: {}\r\n", h.name, h.value));
    }
    out.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
    out.push_str(if keep_alive { "Connection: keep-alive\r\n\r\n" } else { "Connection: close\r\n\r\n" });
    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(&response.body);
    bytes
}

pub async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &HttpResponse, keep_alive: bool) -> Result<()> {
    writer.write_all(&encode_response(response, keep_alive)).await?;
    writer.flush().await?;
    Ok(())
}

/// Plain-text response generated by the proxy itself.
pub fn error_response(status: u16, reason: &str, message: &str) -> HttpResponse {
    let mut response = HttpResponse::new(status, reason);
    response.headers.append("Content-Type", "text/plain; charset=utf-8");
    response.body = message.as_bytes().to_vec();
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn request(raw: &[u8], base: Option<&str>) -> Result<Option<Incoming>> {
        let mut reader = BufReader::new(raw);
        read_request(&mut reader, base, &Limits::default()).await
    }

    #[tokio::test]
    async fn test_proxy_form_request() {
        let raw = b"POST http://example.com/login HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\nX-A: 1\r\nX-A: 2\r\n\r\nhello";
        let incoming = request(raw, None).await.unwrap().unwrap();
        assert_eq!(incoming.request.method, "POST");
        assert_eq!(incoming.request.url, "http://example.com/login");
        assert_eq!(incoming.request.body, b"hello");
        assert_eq!(incoming.request.headers.get_all("x-a").collect::<Vec<_>>(), vec!["1", "2"]);
        assert!(incoming.keep_alive);
    }

    #[tokio::test]
    async fn test_origin_form_inside_tunnel() {
        let raw = b"GET /a?b=1 HTTP/1.1\r\nHost: secure.example\r\nConnection: close\r\n\r\n";
        let incoming = request(raw, Some("https://secure.example:443")).await.unwrap().unwrap();
        assert_eq!(incoming.request.url, "https://secure.example:443/a?b=1");
        assert!(!incoming.keep_alive);
    }

    #[tokio::test]
    async fn test_chunked_request_and_keep_alive_pipelining() {
        let raw = b"POST http://h/ HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5;x=y\r\npedia\r\n0\r\n\r\nGET http://h/2 HTTP/1.1\r\nHost: h\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let limits = Limits::default();
        let first = read_request(&mut reader, None, &limits).await.unwrap().unwrap();
        assert_eq!(first.request.body, b"Wikipedia");
        let second = read_request(&mut reader, None, &limits).await.unwrap().unwrap();
        assert_eq!(second.request.url, "http://h/2");
        assert!(read_request(&mut reader, None, &limits).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_requests() {
        assert!(matches!(request(b"NOT A REQUEST\r\n\r\n", None).await, Err(ProxyError::Malformed(_))));
        assert!(matches!(request(b"GET / HTTP/1.1\r\n\r\n", None).await, Err(ProxyError::Malformed(_))));
        assert!(matches!(request(b"GET http://h/ HTTP/1.1\r\nHost: h\r\n", None).await, Err(ProxyError::Io(_))));

        let limits = Limits { max_header_bytes: 1024, max_body_bytes: 4 };
        let raw = b"POST http://h/ HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789";
        let mut reader = BufReader::new(&raw[..]);
        assert!(matches!(read_request(&mut reader, None, &limits).await, Err(ProxyError::TooLarge(_))));
    }

    #[tokio::test]
    async fn test_http10_defaults_to_close() {
        let incoming = request(b"GET http://h/ HTTP/1.0\r\n\r\n", None).await.unwrap().unwrap();
        assert!(!incoming.keep_alive);
        let incoming = request(b"GET http://h/ HTTP/1.0\r\nConnection: keep-alive\r\n\r\n", None).await.unwrap().unwrap();
        assert!(incoming.keep_alive);
    }

    #[tokio::test]
    async fn test_response_framing() {
        let limits = Limits::default();
        let mut reader = BufReader::new(&b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"[..]);
        let resp = read_response(&mut reader, "GET", &limits).await.unwrap();
        assert_eq!((resp.status, resp.reason.as_str(), resp.body.as_slice()), (200, "OK", &b"ok"[..]));

        let mut reader = BufReader::new(&b"HTTP/1.0 200 OK\r\n\r\nuntil close"[..]);
        let resp = read_response(&mut reader, "GET", &limits).await.unwrap();
        assert_eq!(resp.body, b"until close");
        assert_eq!(resp.http_version, "HTTP/1.0");

        let mut reader = BufReader::new(&b"HTTP/1.1 200 OK\r\nContent-Length: 50\r\n\r\n"[..]);
        let resp = read_response(&mut reader, "HEAD", &limits).await.unwrap();
        assert!(resp.body.is_empty());

        let mut reader = BufReader::new(&b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n"[..]);
        let resp = read_response(&mut reader, "GET", &limits).await.unwrap();
        assert_eq!(resp.body, b"abc");
    }

    #[test]
    fn test_encoding_strips_hop_by_hop() {
        let request = HttpRequest::new("POST", "http://h/x")
            .with_header("Host", "h")
            .with_header("Proxy-Connection", "keep-alive")
            .with_header("Transfer-Encoding", "chunked")
            .with_body("abc");
        let wire = String::from_utf8(encode_request(&request, "/x")).unwrap();
        assert!(wire.starts_with("POST /x HTTP/1.1\r\nHost: h\r\n"));
        assert!(wire.contains("Content-Length: 3\r\n"));
        assert!(wire.contains("Connection: close\r\n\r\nabc"));
        assert!(!wire.to_ascii_lowercase().contains("transfer-encoding"));
        assert!(!wire.to_ascii_lowercase().contains("proxy-connection"));

        let mut response = HttpResponse::new(404, "Not Found");
        response.headers.append("Content-Length", "999");
        response.headers.append("Keep-Alive", "timeout=5");
        let wire = String::from_utf8(encode_response(&response, true)).unwrap();
        assert_eq!(wire, "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: keep-alive\r\n\r\n");
    }
}
