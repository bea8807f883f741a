//! Per-transaction rules for proxied HTTP

use crate::rules::basic_user;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;
use trawl_core::{Alert, ProxyTransaction, Scheme, Severity};
use trawl_store::Inspector;

/// Requests carrying more header lines than this are flagged.
pub const MAX_HEADERS: usize = 100;

lazy_static! {
    static ref URL_SECRET: Regex = Regex::new(r"(?i)[?&](?:password|passwd|pwd|token|api_?key|secret)=[^&#]+").unwrap();
}

#[derive(Default)]
pub struct TransactionInspector {
    seen: HashSet<(&'static str, String)>,
}

impl TransactionInspector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Once per host and category.
    fn once(&mut self, category: &'static str, host: &str) -> bool {
        self.seen.insert((category, host.to_ascii_lowercase()))
    }

    fn alert(tx: &ProxyTransaction, severity: Severity, category: &str, message: &str) -> Alert {
        Alert::security(severity, category, message)
            .protocol(tx.scheme.to_string().to_uppercase())
            .at(tx.started_at)
    }

    fn cleartext(&mut self, tx: &ProxyTransaction, out: &mut Vec<Alert>) {
        if tx.scheme != Scheme::Http {
            return;
        }
        let request = &tx.request;

        if let Some(value) = request.header("authorization") {
            let mut parts = value.trim().splitn(2, char::is_whitespace);
            let is_basic = parts.next().is_some_and(|s| s.eq_ignore_ascii_case("basic"));
            if is_basic {
                let details = match parts.next().and_then(|cred| basic_user(cred.trim().as_bytes())) {
                    Some(user) => format!("Basic credentials for user '{user}' sent to {}", tx.host),
                    None => format!("Basic credentials sent to {}", tx.host),
                };
                out.push(
                    Self::alert(tx, Severity::High, "plaintext_credentials", "Credentials sent over plain HTTP")
                        .details(details),
                );
            }
        }

        if request.headers.contains("cookie") && self.once("cleartext_cookie", &tx.host) {
            out.push(
                Self::alert(tx, Severity::Medium, "cleartext_cookie", "Cookies sent over plain HTTP")
                    .details(format!("{} {}", request.method, request.url)),
            );
        }
    }

    fn cookie_flags(&mut self, tx: &ProxyTransaction, out: &mut Vec<Alert>) {
        let Some(response) = &tx.response else { return };
        for cookie in response.headers.get_all("set-cookie") {
            let attrs: Vec<String> = cookie.split(';').skip(1).map(|a| a.trim().to_ascii_lowercase()).collect();
            let mut missing = Vec::new();
            if !attrs.iter().any(|a| a == "secure") {
                missing.push("Secure");
            }
            if !attrs.iter().any(|a| a == "httponly") {
                missing.push("HttpOnly");
            }
            if missing.is_empty() || !self.once("insecure_cookie", &tx.host) {
                continue;
            }
            let name = cookie.split('=').next().unwrap_or_default().trim();
            out.push(
                Self::alert(tx, Severity::Low, "insecure_cookie", "Cookie set without security flags")
                    .details(format!("{name} on {} lacks {}", tx.host, missing.join(", "))),
            );
        }
    }

    fn headers(&mut self, tx: &ProxyTransaction, out: &mut Vec<Alert>) {
        let request = &tx.request;
        if request.is_connect() {
            return;
        }
        if !request.headers.contains("host") && request.http_version != "HTTP/1.0" {
            out.push(
                Alert::expert(Severity::Low, "missing_host", "Request without Host header")
                    .protocol("HTTP")
                    .details(format!("{} {}", request.method, request.url))
                    .at(tx.started_at),
            );
        }
        if request.headers.len() > MAX_HEADERS {
            out.push(
                Alert::expert(Severity::Medium, "oversized_headers", "Unusually many request headers")
                    .protocol("HTTP")
                    .details(format!("{} headers in {} {}", request.headers.len(), request.method, request.url))
                    .at(tx.started_at),
            );
        }
        if URL_SECRET.is_match(&request.url) {
            out.push(
                Self::alert(tx, Severity::Medium, "secret_in_url", "Secret passed in the URL query")
                    .details(format!("{} {}", request.method, tx.host)),
            );
        }
    }
}

impl Inspector<ProxyTransaction> for TransactionInspector {
    fn inspect(&mut self, tx: &ProxyTransaction) -> Vec<Alert> {
        let mut out = Vec::new();
        self.cleartext(tx, &mut out);
        self.cookie_flags(tx, &mut out);
        self.headers(tx, &mut out);
        out
    }

    fn reset(&mut self) {
        self.seen.clear();
    }
}
