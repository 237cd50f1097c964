//! Scripted transport for tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use harbor_core::Error;

use super::{Request, Response, Transport};

type Responder = Box<dyn Fn(&Request, u32) -> Result<Response, Error> + Send + Sync>;

/// Transport that answers from a closure and records every call.
///
/// The closure receives the request and the 1-based call number.
pub(crate) struct MockTransport {
    responder: Responder,
    latency: Option<Duration>,
    attempts: AtomicU32,
    requests: Mutex<Vec<Request>>,
}

impl MockTransport {
    pub(crate) fn from_fn(f: impl Fn(&Request, u32) -> Result<Response, Error> + Send + Sync + 'static) -> Self {
        Self { responder: Box::new(f), latency: None, attempts: AtomicU32::new(0), requests: Mutex::new(Vec::new()) }
    }

    pub(crate) fn ok(body: &'static str) -> Self {
        Self::from_fn(move |_, _| Ok(Response::new(200, body)))
    }

    pub(crate) fn network_down() -> Self {
        Self::from_fn(|_, _| Err(Error::Network("connection refused".into())))
    }

    pub(crate) fn status(status: u16) -> Self {
        Self::from_fn(move |_, _| Err(Error::from_status(status, "scripted")))
    }

    /// Delay every answer by `latency` of (virtual) time.
    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn urls(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.url).collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &Request) -> Result<Response, Error> {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().unwrap().push(request.clone());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        (self.responder)(request, n)
    }
}
