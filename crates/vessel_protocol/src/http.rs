//! HTTP record types crossing the sandbox boundary.
//!
//! Injected requests and synthesized responses use these plain record
//! shapes on both sides of the channel; the worker constructs the
//! in-sandbox request view from `HttpRequest` and maps the sandbox
//! response back into `HttpResponse`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Request injected by the embedder, targeting a virtual port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: HashMap::new(),
            body: None,
        }
    }

    /// Bytes received accounting: url + header keys + header values + body.
    pub fn wire_size(&self) -> u64 {
        let headers: usize = self
            .headers
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        (self.url.len() + headers + self.body.as_deref().map_or(0, str::len)) as u64
    }
}

/// Response produced by the sandbox (or synthesized by the gates).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl HttpResponse {
    pub fn new(status: u16, headers: HashMap<String, String>, body: Option<String>) -> Self {
        Self {
            status,
            status_text: status_text(status).to_string(),
            headers,
            body,
        }
    }

    /// Plain-text response with a `Content-Type` header.
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "text/plain".to_string());
        Self::new(status, headers, Some(body.into()))
    }

    /// `503 Service Unavailable` for a port with no running server.
    pub fn unavailable(port: u16) -> Self {
        Self::text(503, format!("No server listening on port {}", port))
    }

    /// `404 Not Found` for a port the sandbox never bound.
    pub fn not_found(url: &str) -> Self {
        Self::text(404, format!("Not found: {}", url))
    }

    /// `500 Internal Server Error` carrying the failure message.
    pub fn server_error(message: impl Into<String>) -> Self {
        Self::text(500, message.into())
    }

    pub fn is_success(&self) -> bool {
        self.status < 400
    }

    /// Bytes sent accounting: header keys + header values + body.
    pub fn wire_size(&self) -> u64 {
        let headers: usize = self
            .headers
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        (headers + self.body.as_deref().map_or(0, str::len)) as u64
    }
}

/// Reason phrase for the handful of statuses the container emits itself.
pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

/// Extract the port a request URL targets. Defaults to 80.
///
/// Accepts full URLs (`http://localhost:8080/x`), authority-relative forms
/// (`localhost:8080/x`), and bare paths (`/x` -> 80).
pub fn port_from_url(url: &str) -> u16 {
    let rest = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url);
    if rest.starts_with('/') {
        return 80;
    }
    let authority = rest.split('/').next().unwrap_or(rest);
    match authority.rsplit_once(':') {
        Some((_, port)) => port.parse().unwrap_or(80),
        None => 80,
    }
}

/// Extract the path component of a request URL. Defaults to `/`.
pub fn path_from_url(url: &str) -> &str {
    let rest = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url);
    if rest.starts_with('/') {
        return rest;
    }
    match rest.find('/') {
        Some(idx) => &rest[idx..],
        None => "/",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_parsing_handles_common_shapes() {
        assert_eq!(port_from_url("http://localhost:8080/"), 8080);
        assert_eq!(port_from_url("http://localhost/"), 80);
        assert_eq!(port_from_url("localhost:3000/api"), 3000);
        assert_eq!(port_from_url("/index.html"), 80);
        assert_eq!(port_from_url("http://localhost:nope/"), 80);
    }

    #[test]
    fn path_parsing_defaults_to_root() {
        assert_eq!(path_from_url("http://localhost:8080/a/b?q=1"), "/a/b?q=1");
        assert_eq!(path_from_url("http://localhost:8080"), "/");
        assert_eq!(path_from_url("/raw"), "/raw");
    }

    #[test]
    fn wire_sizes_count_urls_headers_and_bodies() {
        let mut req = HttpRequest::get("/ab");
        req.headers.insert("K".to_string(), "vv".to_string());
        req.body = Some("xyz".to_string());
        // url(3) + key(1) + value(2) + body(3)
        assert_eq!(req.wire_size(), 9);

        let res = HttpResponse::text(200, "ok");
        // "Content-Type"(12) + "text/plain"(10) + "ok"(2)
        assert_eq!(res.wire_size(), 24);
    }

    #[test]
    fn synthetic_responses_carry_reason_phrases() {
        assert_eq!(HttpResponse::unavailable(9999).status, 503);
        assert_eq!(
            HttpResponse::unavailable(9999).status_text,
            "Service Unavailable"
        );
        assert_eq!(HttpResponse::not_found("/x").status, 404);
        assert_eq!(HttpResponse::server_error("boom").status, 500);
        assert!(HttpResponse::text(200, "ok").is_success());
        assert!(!HttpResponse::server_error("boom").is_success());
    }
}
