//! Response rewriting.
//!
//! Makes a proxied response indistinguishable, to the browser, from one
//! served directly by the gateway's public address: absolute URLs in HTML
//! attributes, residual upstream host references, redirect `Location`
//! headers, and `Set-Cookie` scoping are all pointed back at the gateway.
//!
//! HTML handling is attribute-level pattern matching, not a parse — only
//! attribute rewriting is required, and a structural parse would be strictly
//! more code for no behavioral gain.

use bytes::Bytes;
use hyper::header::{HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, SET_COOKIE};
use hyper::{HeaderMap, StatusCode};
use regex::Regex;
use rgate_core::{GateError, GateResult};
use std::sync::OnceLock;

/// Status codes whose `Location` header is rewritten.
const REDIRECT_CODES: [u16; 5] = [201, 301, 302, 307, 308];

/// `href=` / `src=` / `action=` attributes carrying an absolute http(s) URL,
/// single- or double-quoted.
fn attr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\s+(href|src|action)\s*=\s*(["'])(https?://[^"']+)(["'])"#)
            .expect("attribute regex is valid")
    })
}

/// Rewrites one upstream response so it keeps routing through the gateway.
///
/// Built per proxied request: the forwarded host/port come from the registry
/// at request time and the host regexes are scoped to this instance.
pub struct ResponseRewriter {
    gateway_scheme: String,
    gateway_host: String,
    gateway_port: u16,
    /// `forwardedHost:forwardedPort`, case-insensitive.
    host_port_re: Regex,
    /// `forwardedHost` alone, case-insensitive.
    host_re: Regex,
}

impl ResponseRewriter {
    pub fn new(
        gateway_scheme: &str,
        gateway_host: &str,
        gateway_port: u16,
        forwarded_host: &str,
        forwarded_port: u16,
    ) -> GateResult<Self> {
        let host_port_re = Regex::new(&format!(
            "(?i){}",
            regex::escape(&format!("{forwarded_host}:{forwarded_port}"))
        ))
        .map_err(|e| GateError::Other(e.to_string()))?;
        let host_re = Regex::new(&format!("(?i){}", regex::escape(forwarded_host)))
            .map_err(|e| GateError::Other(e.to_string()))?;

        Ok(Self {
            gateway_scheme: gateway_scheme.to_string(),
            gateway_host: gateway_host.to_string(),
            gateway_port,
            host_port_re,
            host_re,
        })
    }

    /// Redirect an absolute (or bare-path) URL at the gateway, keeping only
    /// the path of the original value.
    pub fn target(&self, value: &str) -> String {
        let mut rest = value;
        if let Some(i) = rest.find("//") {
            rest = &rest[i + 2..];
        }
        let path = match rest.find('/') {
            Some(i) => &rest[i..],
            None => "",
        };
        format!(
            "{}://{}:{}{}",
            self.gateway_scheme, self.gateway_host, self.gateway_port, path
        )
    }

    /// Rewrite absolute URLs in `href`/`src`/`action` attributes.
    pub fn rewrite_html(&self, body: &str) -> String {
        attr_re()
            .replace_all(body, |caps: &regex::Captures<'_>| {
                format!(
                    " {}={}{}{}",
                    &caps[1],
                    &caps[2],
                    self.target(&caps[3]),
                    &caps[4]
                )
            })
            .into_owned()
    }

    /// Replace residual `host:port` / `host` references to the upstream,
    /// e.g. origins embedded in inline scripts.
    pub fn rewrite_host_refs(&self, body: &str) -> String {
        let with_port = format!("{}:{}", self.gateway_host, self.gateway_port);
        let body = self.host_port_re.replace_all(body, with_port.as_str());
        self.host_re
            .replace_all(&body, self.gateway_host.as_str())
            .into_owned()
    }

    /// Drop the `Domain` attribute and force `Path=/` so device cookies bind
    /// to the gateway host.
    fn rescope_cookie(value: &str) -> String {
        value
            .split(';')
            .map(str::trim)
            .enumerate()
            .filter_map(|(i, part)| {
                if i == 0 {
                    return Some(part.to_string());
                }
                let lower = part.to_ascii_lowercase();
                if lower.starts_with("domain=") || lower == "domain" {
                    None
                } else if lower.starts_with("path=") {
                    Some("Path=/".to_string())
                } else {
                    Some(part.to_string())
                }
            })
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Apply the full rewrite pipeline to one buffered response.
    ///
    /// Strips headers whose values are stale after buffering, rewrites the
    /// body when it is HTML / valid text, and fixes `Location` on
    /// redirect-family statuses. The body must be complete: rewriting cannot
    /// be streamed.
    pub fn rewrite(&self, status: StatusCode, headers: &mut HeaderMap, body: Bytes) -> Bytes {
        let is_html = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().starts_with("text/html"))
            .unwrap_or(false);

        headers.remove("x-frame-options");
        headers.remove(CONTENT_ENCODING);
        headers.remove(CONTENT_LENGTH);

        if REDIRECT_CODES.contains(&status.as_u16()) {
            if let Some(location) = headers.get(LOCATION).and_then(|v| v.to_str().ok()) {
                let rewritten = self.target(location);
                if let Ok(value) = HeaderValue::from_str(&rewritten) {
                    headers.insert(LOCATION, value);
                }
            }
        }

        let cookies: Vec<String> = headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(Self::rescope_cookie)
            .collect();
        if !cookies.is_empty() {
            headers.remove(SET_COOKIE);
            for cookie in cookies {
                if let Ok(value) = HeaderValue::from_str(&cookie) {
                    headers.append(SET_COOKIE, value);
                }
            }
        }

        // Binary bodies pass through untouched; textual replacement only
        // applies to valid UTF-8.
        match String::from_utf8(body.to_vec()) {
            Ok(text) => {
                let text = if is_html { self.rewrite_html(&text) } else { text };
                Bytes::from(self.rewrite_host_refs(&text))
            }
            Err(_) => body,
        }
    }
}
