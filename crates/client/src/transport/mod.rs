//! Outbound request plumbing.
//!
//! A request is an opaque (method, URL, headers, body) tuple and a response
//! an opaque status/headers/payload triple. Everything above this module
//! talks to the network only through the [`Transport`] trait, so the worker
//! can be driven by a scripted transport in tests.
//!
//! ### URL Canonicalization
//! - Trim whitespace, ensure scheme (default: `https`)
//! - Lowercase host, remove fragments
//! - Sort query parameters by name so equivalent reads share a cache entry

pub mod http;
#[cfg(test)]
pub(crate) mod mock;
pub mod url;

use async_trait::async_trait;
use bytes::Bytes;
use harbor_core::{Error, QueuedRequest};
use serde::Serialize;

pub use http::{HttpTransport, TransportConfig};
pub use url::{UrlError, canonicalize};

/// Methods that never change server state.
const SAFE_METHODS: &[&str] = &["GET", "HEAD", "OPTIONS"];

/// An outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Upper-case HTTP method.
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl Request {
    pub fn new(method: &str, url: impl Into<String>) -> Self {
        Self { method: method.to_ascii_uppercase(), url: url.into(), headers: Vec::new(), body: None }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Whether the response to this request may be cached and served offline.
    pub fn is_cacheable(&self) -> bool {
        self.method == "GET"
    }

    /// Whether this request changes server state and must be queued when it
    /// cannot be delivered.
    pub fn is_mutation(&self) -> bool {
        !SAFE_METHODS.contains(&self.method.as_str())
    }
}

impl From<&QueuedRequest> for Request {
    fn from(entry: &QueuedRequest) -> Self {
        Self {
            method: entry.method.clone(),
            url: entry.url.clone(),
            headers: entry.headers.clone(),
            body: entry.body.clone(),
        }
    }
}

/// A response received from (or replayed on behalf of) the upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(serialize_with = "serialize_body")]
    pub body: Bytes,
}

fn serialize_body<S: serde::Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(body))
}

impl Response {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self { status, headers: Vec::new(), body: body.into() }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body decoded as UTF-8, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Sends a request to the upstream.
///
/// Implementations return `Ok` only for 2xx responses. Other statuses map
/// through [`Error::from_status`] and transport failures to
/// [`Error::Network`] or [`Error::Timeout`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &Request) -> Result<Response, Error>;
}
