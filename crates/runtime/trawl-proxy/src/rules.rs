//! Scope and match-and-replace rules

use crate::{ProxyError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use trawl_core::{Headers, HttpRequest, HttpResponse, Scheme};

/// Host pattern (`*`, `*.example.com` or exact), optional port and scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeRule {
    pub host_pattern: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub scheme: Option<Scheme>,
}

impl ScopeRule {
    pub fn all() -> Self {
        Self::host("*")
    }

    pub fn host(pattern: &str) -> Self {
        Self { host_pattern: pattern.to_string(), port: None, scheme: None }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn matches(&self, scheme: Scheme, host: &str, port: u16) -> bool {
        let host = host.to_ascii_lowercase();
        let pattern = self.host_pattern.to_ascii_lowercase();
        let host_matches = if pattern == "*" {
            true
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            host.ends_with(suffix)
        } else {
            host == pattern
        };

        host_matches && self.port.map_or(true, |p| p == port) && self.scheme.map_or(true, |s| s == scheme)
    }
}

/// True when any rule matches; an empty rule set matches everything.
pub fn in_scope(rules: &[ScopeRule], scheme: Scheme, host: &str, port: u16) -> bool {
    rules.is_empty() || rules.iter().any(|r| r.matches(scheme, host, port))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchType {
    RequestHeader,
    RequestBody,
    ResponseHeader,
    ResponseBody,
    Url,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchReplaceRule {
    #[serde(default)]
    pub name: String,
    #[serde(default = "enabled")]
    pub enabled: bool,
    pub match_type: MatchType,
    pub match_pattern: String,
    #[serde(default)]
    pub replace_with: String,
    #[serde(default)]
    pub regex: bool,
    #[serde(default)]
    pub scope: Option<ScopeRule>,
}

fn enabled() -> bool {
    true
}

impl MatchReplaceRule {
    pub fn literal(match_type: MatchType, pattern: &str, replace: &str) -> Self {
        Self {
            name: String::new(),
            enabled: true,
            match_type,
            match_pattern: pattern.to_string(),
            replace_with: replace.to_string(),
            regex: false,
            scope: None,
        }
    }

    pub fn regex(match_type: MatchType, pattern: &str, replace: &str) -> Self {
        Self { regex: true, ..Self::literal(match_type, pattern, replace) }
    }

    /// Reject empty patterns and regexes that do not compile.
    pub fn validate(&self) -> Result<()> {
        if self.match_pattern.is_empty() {
            return Err(ProxyError::InvalidInput(format!("rule '{}' has an empty pattern", self.name)));
        }
        if self.regex {
            Regex::new(&self.match_pattern)
                .map_err(|e| ProxyError::InvalidInput(format!("rule '{}': {e}", self.name)))?;
        }
        Ok(())
    }

    fn applies(&self, scheme: Scheme, host: &str, port: u16) -> bool {
        self.enabled && self.scope.as_ref().map_or(true, |s| s.matches(scheme, host, port))
    }

    fn replace<'a>(&self, text: &'a str) -> Cow<'a, str> {
        if self.regex {
            match Regex::new(&self.match_pattern) {
                Ok(re) => re.replace_all(text, self.replace_with.as_str()),
                Err(_) => Cow::Borrowed(text),
            }
        } else if text.contains(&self.match_pattern) {
            Cow::Owned(text.replace(&self.match_pattern, &self.replace_with))
        } else {
            Cow::Borrowed(text)
        }
    }

    fn rewrite_headers(&self, headers: &mut Headers) -> bool {
        let mut changed = false;
        for header in headers.iter_mut() {
            changed |= self.rewrite_text(&mut header.value);
        }
        changed
    }

    /// Non-UTF-8 bodies are left alone.
    fn rewrite_body(&self, body: &mut Vec<u8>) -> bool {
        let Ok(text) = std::str::from_utf8(body) else { return false };
        let new = match self.replace(text) {
            Cow::Owned(new) => new,
            Cow::Borrowed(_) => return false,
        };
        if new.as_bytes() == body.as_slice() {
            return false;
        }
        *body = new.into_bytes();
        true
    }

    fn rewrite_text(&self, text: &mut String) -> bool {
        let new = match self.replace(text) {
            Cow::Owned(new) => new,
            Cow::Borrowed(_) => return false,
        };
        if new == *text {
            return false;
        }
        *text = new;
        true
    }

    pub fn apply_request(&self, request: &mut HttpRequest, scheme: Scheme, host: &str, port: u16) -> bool {
        if !self.applies(scheme, host, port) {
            return false;
        }
        match self.match_type {
            MatchType::RequestHeader => self.rewrite_headers(&mut request.headers),
            MatchType::RequestBody => self.rewrite_body(&mut request.body),
            MatchType::Url => self.rewrite_text(&mut request.url),
            _ => false,
        }
    }

    pub fn apply_response(&self, response: &mut HttpResponse, scheme: Scheme, host: &str, port: u16) -> bool {
        if !self.applies(scheme, host, port) {
            return false;
        }
        match self.match_type {
            MatchType::ResponseHeader => self.rewrite_headers(&mut response.headers),
            MatchType::ResponseBody => self.rewrite_body(&mut response.body),
            _ => false,
        }
    }
}

/// Run every rule over the request; true if anything changed.
pub fn rewrite_request(rules: &[MatchReplaceRule], request: &mut HttpRequest, scheme: Scheme, host: &str, port: u16) -> bool {
    rules.iter().fold(false, |changed, rule| rule.apply_request(request, scheme, host, port) | changed)
}

pub fn rewrite_response(
    rules: &[MatchReplaceRule],
    response: &mut HttpResponse,
    scheme: Scheme,
    host: &str,
    port: u16,
) -> bool {
    rules.iter().fold(false, |changed, rule| rule.apply_response(response, scheme, host, port) | changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_rule() {
        let rule = ScopeRule::host("*.example.com");
        assert!(rule.matches(Scheme::Https, "api.example.com", 443));
        assert!(rule.matches(Scheme::Http, "WWW.example.com", 80));
        assert!(!rule.matches(Scheme::Http, "other.com", 80));

        let rule = ScopeRule::host("example.com").with_port(8443);
        assert!(rule.matches(Scheme::Https, "example.com", 8443));
        assert!(!rule.matches(Scheme::Https, "example.com", 443));

        assert!(in_scope(&[], Scheme::Http, "anything", 1));
        assert!(!in_scope(&[rule], Scheme::Http, "anything", 1));
    }

    #[test]
    fn test_request_rules() {
        let mut request = HttpRequest::new("POST", "http://example.com/v1/items")
            .with_header("User-Agent", "curl/8.0")
            .with_body("name=old");
        let rules = vec![
            MatchReplaceRule::literal(MatchType::RequestHeader, "curl/8.0", "trawl"),
            MatchReplaceRule::regex(MatchType::Url, r"/v\d+/", "/v2/"),
            MatchReplaceRule::literal(MatchType::RequestBody, "old", "new"),
            MatchReplaceRule::literal(MatchType::ResponseBody, "old", "never"),
        ];

        assert!(rewrite_request(&rules, &mut request, Scheme::Http, "example.com", 80));
        assert_eq!(request.header("user-agent"), Some("trawl"));
        assert_eq!(request.url, "http://example.com/v2/items");
        assert_eq!(request.body, b"name=new");
        assert!(!rewrite_request(&rules[..1], &mut request, Scheme::Http, "example.com", 80));
    }

    #[test]
    fn test_response_rules_respect_scope() {
        let mut rule = MatchReplaceRule::literal(MatchType::ResponseBody, "secret", "[redacted]");
        rule.scope = Some(ScopeRule::host("internal.example"));

        let mut response = HttpResponse::new(200, "OK");
        response.body = b"the secret".to_vec();
        assert!(!rule.apply_response(&mut response, Scheme::Http, "example.com", 80));
        assert!(rule.apply_response(&mut response, Scheme::Http, "internal.example", 80));
        assert_eq!(response.body, b"the [redacted]");

        rule.enabled = false;
        response.body = b"secret".to_vec();
        assert!(!rule.apply_response(&mut response, Scheme::Http, "internal.example", 80));
    }

    #[test]
    fn test_validate() {
        assert!(MatchReplaceRule::regex(MatchType::Url, "(", "x").validate().is_err());
        assert!(MatchReplaceRule::literal(MatchType::Url, "", "x").validate().is_err());
        assert!(MatchReplaceRule::regex(MatchType::Url, "a+", "b").validate().is_ok());
    }

    #[test]
    fn test_rule_from_json() {
        let rule: MatchReplaceRule = serde_json::from_str(
            r#"{"matchType":"responseHeader","matchPattern":"nginx","replaceWith":"hidden"}"#,
        )
        .unwrap();
        assert!(rule.enabled);
        assert_eq!(rule.match_type, MatchType::ResponseHeader);
    }
}
