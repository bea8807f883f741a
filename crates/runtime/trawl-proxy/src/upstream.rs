//! Origin connections
//!
//! One request per connection. HTTPS origins are verified against the
//! webpki root set and offered `http/1.1` only.

use crate::codec::{self, Limits};
use crate::{ProxyError, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use trawl_config::ProxyConfig;
use trawl_core::{HttpRequest, HttpResponse, Scheme, Target};

#[derive(Clone)]
pub struct Upstream {
    tls: TlsConnector,
    timeout: Duration,
    limits: Limits,
}

impl Upstream {
    pub fn new(config: &ProxyConfig) -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let mut tls = ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
        tls.alpn_protocols = vec![b"http/1.1".to_vec()];

        Self {
            tls: TlsConnector::from(Arc::new(tls)),
            timeout: Duration::from_secs(config.upstream_timeout_secs.max(1)),
            limits: Limits::from(config),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Open a TCP connection to `host:port` within the upstream timeout.
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        let unreachable = |reason: String| ProxyError::Upstream { host: host.to_string(), port, reason };
        match tokio::time::timeout(self.timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(unreachable(e.to_string())),
            Err(_) => Err(unreachable("connect timed out".to_string())),
        }
    }

    /// Forward `request` to the origin named by its URL and read the reply.
    pub async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let target = request.target()?;
        let started = Instant::now();
        let stream = self.connect(&target.host, target.port).await?;
        tracing::debug!(host = %target.host, port = target.port, "upstream connected");

        let wire = codec::encode_request(&with_host(request, &target), &target.path);
        let exchange = async {
            match target.scheme {
                Scheme::Http => exchange(stream, &wire, &request.method, &self.limits).await,
                Scheme::Https => {
                    let name = ServerName::try_from(target.host.clone())
                        .map_err(|e| ProxyError::Tls(format!("bad server name {}: {e}", target.host)))?;
                    let tls = self
                        .tls
                        .connect(name, stream)
                        .await
                        .map_err(|e| ProxyError::Tls(format!("handshake with {}: {e}", target.host)))?;
                    exchange(tls, &wire, &request.method, &self.limits).await
                }
            }
        };

        let mut response = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ProxyError::Timeout(format!("{}:{} did not answer", target.host, target.port)))??;
        response.elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(response)
    }
}

fn with_host(request: &HttpRequest, target: &Target) -> HttpRequest {
    if request.headers.contains("host") {
        return request.clone();
    }
    let host = if target.port == target.scheme.default_port() {
        target.host.clone()
    } else {
        format!("{}:{}", target.host, target.port)
    };
    let mut request = request.clone();
    request.headers.append("Host", host);
    request
}

async fn exchange<S: AsyncRead + AsyncWrite + Unpin>(
    mut stream: S,
    wire: &[u8],
    method: &str,
    limits: &Limits,
) -> Result<HttpResponse> {
    stream.write_all(wire).await?;
    stream.flush().await?;
    let mut reader = BufReader::new(stream);
    codec::read_response(&mut reader, method, limits).await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt};
    use tokio::net::TcpListener;

    /// Origin answering every request with `200` and the request line as body.
    pub async fn echo_origin() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut reader = BufReader::new(stream);
                    let mut line = String::new();
                    reader.read_line(&mut line).await.unwrap();
                    let mut length = 0usize;
                    loop {
                        let mut header = String::new();
                        reader.read_line(&mut header).await.unwrap();
                        if header.trim().is_empty() {
                            break;
                        }
                        if let Some(value) = header.to_ascii_lowercase().strip_prefix("content-length:") {
                            length = value.trim().parse().unwrap();
                        }
                    }
                    let mut body = vec![0u8; length];
                    reader.read_exact(&mut body).await.unwrap();
                    let reply = format!("{}|{}", line.trim(), String::from_utf8_lossy(&body));
                    let wire = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\nX-Origin: echo\r\n\r\n{reply}", reply.len());
                    let mut stream = reader.into_inner();
                    stream.write_all(wire.as_bytes()).await.unwrap();
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_send_plain() {
        let origin = echo_origin().await;
        let upstream = Upstream::new(&ProxyConfig::default());
        let request = HttpRequest::new("POST", format!("http://{origin}/submit?x=1")).with_body("data");

        let response = upstream.send(&request).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.header("x-origin"), Some("echo"));
        assert_eq!(String::from_utf8_lossy(&response.body), "POST /submit?x=1 HTTP/1.1|data");
    }

    #[tokio::test]
    async fn test_unreachable_origin() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let upstream = Upstream::new(&ProxyConfig::default());
        let err = upstream.send(&HttpRequest::new("GET", format!("http://{addr}/"))).await.unwrap_err();
        assert!(matches!(err, ProxyError::Upstream { port, .. } if port == addr.port()));
    }

    #[test]
    fn test_host_header_added() {
        let request = HttpRequest::new("GET", "http://example.com:8080/");
        let target = request.target().unwrap();
        assert_eq!(with_host(&request, &target).header("host"), Some("example.com:8080"));

        let request = HttpRequest::new("GET", "http://example.com/").with_header("Host", "override");
        let target = request.target().unwrap();
        assert_eq!(with_host(&request, &target).header("host"), Some("override"));
    }
}
