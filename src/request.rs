//! Read-only view of the incoming HTTP request.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use chrono::DateTime;
use http::HeaderMap;
use http::header::{
    CACHE_CONTROL, CONTENT_LENGTH, ETAG, HOST, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
    USER_AGENT,
};
use http::request::Parts;

use crate::error::{Error, Result};

const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// An incoming HTTP request: head, remote peer and the body read once at
/// dispatch.
///
/// Host and protocol derivation depends on proxy mode
/// ([`ServerConfig::proxy`](crate::config::ServerConfig::proxy)): behind a
/// proxy the `X-Forwarded-*` headers win.
#[derive(Debug)]
pub struct Request {
    parts: Parts,
    remote_addr: SocketAddr,
    proxy: bool,
    body: std::result::Result<Bytes, String>,
}

impl Request {
    pub(crate) fn new(
        parts: Parts,
        remote_addr: SocketAddr,
        proxy: bool,
        body: std::result::Result<Bytes, String>,
    ) -> Self {
        Self { parts, remote_addr, proxy, body }
    }

    /// The request head as received.
    pub fn parts(&self) -> &Parts { &self.parts }
    pub fn headers(&self) -> &HeaderMap { &self.parts.headers }
    pub fn remote_addr(&self) -> SocketAddr { self.remote_addr }

    /// Case-insensitive header lookup. First value wins; empty and
    /// non-UTF-8 values read as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.parts.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
    }

    /// Uppercase verb, e.g. `"GET"`.
    pub fn method(&self) -> &str { self.parts.method.as_str() }

    /// Path only, without the query.
    pub fn uri(&self) -> &str { self.parts.uri.path() }

    /// The raw query string, without the leading `?`.
    pub fn querystring(&self) -> &str { self.parts.uri.query().unwrap_or("") }

    /// Parsed query, every value kept in arrival order.
    pub fn query(&self) -> HashMap<String, Vec<String>> {
        let mut query: HashMap<String, Vec<String>> = HashMap::new();
        for (k, v) in url::form_urlencoded::parse(self.querystring().as_bytes()) {
            query.entry(k.into_owned()).or_default().push(v.into_owned());
        }
        query
    }

    /// `host[:port]` the client addressed.
    pub fn host(&self) -> String {
        if self.proxy {
            if let Some(host) = self.header(X_FORWARDED_HOST) {
                return host.to_owned();
            }
        }
        // HTTP/2 carries the host in the :authority pseudo-header.
        if let Some(authority) = self.parts.uri.authority() {
            return authority.as_str().to_owned();
        }
        self.header(HOST.as_str()).unwrap_or_default().to_owned()
    }

    /// [`host`](Self::host) without the port. IPv6 literals lose their brackets.
    pub fn hostname(&self) -> String {
        let host = self.host();
        if let Some(rest) = host.strip_prefix('[') {
            return rest.split(']').next().unwrap_or_default().to_owned();
        }
        host.split(':').next().unwrap_or_default().to_owned()
    }

    /// `"http"` or `"https"`. TLS is terminated upstream, so only a trusted
    /// proxy can make this `https`.
    pub fn protocol(&self) -> &str {
        if !self.proxy {
            return "http";
        }
        self.header(X_FORWARDED_PROTO).unwrap_or("http")
    }

    pub fn is_secure(&self) -> bool { self.protocol() == "https" }

    /// e.g. `http://www.demo.com`
    pub fn origin(&self) -> String {
        format!("{}://{}", self.protocol(), self.host())
    }

    /// e.g. `http://www.demo.com/a/b?c=d`
    pub fn href(&self) -> String {
        let path = self.parts.uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        format!("{}{}", self.origin(), path)
    }

    /// `Content-Length` from the header, 0 when absent or malformed.
    pub fn content_length(&self) -> u64 {
        self.header(CONTENT_LENGTH.as_str())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn user_agent(&self) -> &str { self.header(USER_AGENT.as_str()).unwrap_or("") }

    /// First `X-Forwarded-For` entry, then `X-Real-Ip`, then the peer address.
    pub fn client_ip(&self) -> String {
        if let Some(ip) = self.header(X_FORWARDED_FOR)
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
        {
            return ip.to_owned();
        }
        if let Some(ip) = self.header(X_REAL_IP).map(str::trim).filter(|ip| !ip.is_empty()) {
            return ip.to_owned();
        }
        self.remote_addr.ip().to_string()
    }

    /// The body bytes, or the error recorded when reading them failed.
    ///
    /// Empty for `multipart/form-data`, whose body is consumed by the form
    /// parser as it arrives.
    pub fn raw_body(&self) -> Result<&Bytes> {
        self.body.as_ref().map_err(|e| Error::BodyRead(e.clone()))
    }

    /// Whether the client's cached representation can be reused for a
    /// response with this status and these headers.
    ///
    /// Only GET and HEAD with a 2xx or 304 status qualify, and
    /// `Cache-Control: no-cache` always disqualifies. Then either
    /// `If-None-Match` must match the response `ETag`, or the response
    /// `Last-Modified` must not be after `If-Modified-Since`.
    pub fn is_fresh(&self, status: u16, response_headers: &HeaderMap) -> bool {
        if self.parts.method != http::Method::GET && self.parts.method != http::Method::HEAD {
            return false;
        }
        if !((200..300).contains(&status) || status == 304) {
            return false;
        }

        let modified_since = self.header(IF_MODIFIED_SINCE.as_str());
        let none_match = self.header(IF_NONE_MATCH.as_str());
        if modified_since.is_none() && none_match.is_none() {
            return false;
        }
        if self.header(CACHE_CONTROL.as_str()).is_some_and(has_no_cache) {
            return false;
        }

        let response_header = |name| {
            response_headers.get(name).and_then(|v| v.to_str().ok()).filter(|v| !v.is_empty())
        };

        let etag_fresh = match (none_match, response_header(ETAG)) {
            (Some(none_match), Some(etag)) => etag_matches(none_match, etag),
            _ => false,
        };
        let date_fresh = match (modified_since, response_header(LAST_MODIFIED)) {
            (Some(since), Some(last_modified)) => not_modified_since(since, last_modified),
            _ => false,
        };

        etag_fresh || date_fresh
    }
}

fn has_no_cache(cache_control: &str) -> bool {
    cache_control.split(',').any(|d| d.trim().eq_ignore_ascii_case("no-cache"))
}

fn opaque_tag(tag: &str) -> &str {
    let tag = tag.trim();
    tag.strip_prefix("W/").unwrap_or(tag).trim_matches('"')
}

fn etag_matches(none_match: &str, etag: &str) -> bool {
    if none_match.trim() == "*" {
        return true;
    }
    let etag = opaque_tag(etag);
    none_match.split(',').any(|candidate| opaque_tag(candidate) == etag)
}

/// Equal timestamps count as not modified.
fn not_modified_since(since: &str, last_modified: &str) -> bool {
    match (DateTime::parse_from_rfc2822(since), DateTime::parse_from_rfc2822(last_modified)) {
        (Ok(since), Ok(last_modified)) => last_modified <= since,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn request(method: &str, uri: &str, headers: &[(&str, &str)], proxy: bool) -> Request {
        let mut builder = http::Request::builder().method(method).uri(uri);
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        let (parts, ()) = builder.body(()).unwrap().into_parts();
        Request::new(parts, "10.0.0.9:5555".parse().unwrap(), proxy, Ok(Bytes::new()))
    }

    fn response_headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (k, v) in pairs {
            headers.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        headers
    }

    #[test]
    fn direct_mode_ignores_forwarded_headers() {
        let req = request(
            "GET",
            "/a/b?x=1&x=2&y=3",
            &[("host", "example.com:8080"), ("x-forwarded-host", "evil.com"), ("x-forwarded-proto", "https")],
            false,
        );
        assert_eq!(req.host(), "example.com:8080");
        assert_eq!(req.hostname(), "example.com");
        assert_eq!(req.protocol(), "http");
        assert!(!req.is_secure());
        assert_eq!(req.origin(), "http://example.com:8080");
        assert_eq!(req.href(), "http://example.com:8080/a/b?x=1&x=2&y=3");
        assert_eq!(req.uri(), "/a/b");
        assert_eq!(req.querystring(), "x=1&x=2&y=3");
        assert_eq!(req.query()["x"], vec!["1", "2"]);
    }

    #[test]
    fn proxy_mode_trusts_forwarded_headers() {
        let req = request(
            "GET",
            "/",
            &[("host", "internal:9505"), ("x-forwarded-host", "shop.example"), ("x-forwarded-proto", "https")],
            true,
        );
        assert_eq!(req.host(), "shop.example");
        assert_eq!(req.protocol(), "https");
        assert!(req.is_secure());
        assert_eq!(req.origin(), "https://shop.example");
    }

    #[test]
    fn hostname_strips_ipv6_brackets() {
        let req = request("GET", "/", &[("host", "[::1]:9505")], false);
        assert_eq!(req.hostname(), "::1");
    }

    #[test]
    fn client_ip_prefers_forwarded_for_then_real_ip_then_peer() {
        let req = request("GET", "/", &[("x-forwarded-for", " 1.2.3.4 , 5.6.7.8"), ("x-real-ip", "9.9.9.9")], false);
        assert_eq!(req.client_ip(), "1.2.3.4");
        let req = request("GET", "/", &[("x-real-ip", "9.9.9.9")], false);
        assert_eq!(req.client_ip(), "9.9.9.9");
        let req = request("GET", "/", &[], false);
        assert_eq!(req.client_ip(), "10.0.0.9");
    }

    #[test]
    fn content_length_defaults_to_zero() {
        assert_eq!(request("POST", "/", &[("content-length", "42")], false).content_length(), 42);
        assert_eq!(request("POST", "/", &[("content-length", "x")], false).content_length(), 0);
        assert_eq!(request("POST", "/", &[], false).content_length(), 0);
    }

    #[test]
    fn fresh_when_if_none_match_matches_etag() {
        let req = request("GET", "/", &[("if-none-match", "\"abc\"")], false);
        assert!(req.is_fresh(200, &response_headers(&[("etag", "abc")])));
        assert!(req.is_fresh(304, &response_headers(&[("etag", "W/\"abc\"")])));
        assert!(!req.is_fresh(200, &response_headers(&[("etag", "xyz")])));
        assert!(!req.is_fresh(200, &HeaderMap::new()));
    }

    #[test]
    fn wildcard_matches_any_etag() {
        let req = request("HEAD", "/", &[("if-none-match", "*")], false);
        assert!(req.is_fresh(200, &response_headers(&[("etag", "anything")])));
    }

    #[test]
    fn never_fresh_for_other_methods_statuses_or_no_cache() {
        let etag = response_headers(&[("etag", "abc")]);
        assert!(!request("POST", "/", &[("if-none-match", "abc")], false).is_fresh(200, &etag));
        assert!(!request("GET", "/", &[("if-none-match", "abc")], false).is_fresh(404, &etag));
        assert!(!request("GET", "/", &[], false).is_fresh(200, &etag));
        let req = request("GET", "/", &[("if-none-match", "abc"), ("cache-control", "max-age=0, no-cache")], false);
        assert!(!req.is_fresh(200, &etag));
    }

    #[test]
    fn if_modified_since_treats_equal_timestamps_as_fresh() {
        let req = request("GET", "/", &[("if-modified-since", "Mon, 02 Jan 2006 15:04:05 GMT")], false);
        let same = response_headers(&[("last-modified", "Mon, 02 Jan 2006 15:04:05 GMT")]);
        let older = response_headers(&[("last-modified", "Sun, 01 Jan 2006 15:04:05 GMT")]);
        let newer = response_headers(&[("last-modified", "Tue, 03 Jan 2006 15:04:05 GMT")]);
        assert!(req.is_fresh(200, &same));
        assert!(req.is_fresh(200, &older));
        assert!(!req.is_fresh(200, &newer));
        assert!(!req.is_fresh(200, &response_headers(&[("last-modified", "garbage")])));
    }

    #[test]
    fn body_read_failure_is_reported() {
        let (parts, ()) = http::Request::builder().body(()).unwrap().into_parts();
        let req = Request::new(parts, "127.0.0.1:1".parse().unwrap(), false, Err("reset".to_owned()));
        assert!(matches!(req.raw_body(), Err(Error::BodyRead(msg)) if msg == "reset"));
    }
}
