//! Background sync worker.
//!
//! Sits between the application and the transport:
//!
//! - Online: forward through the circuit breaker, caching successful GETs.
//! - Offline, or after a retryable failure: serve GETs from the cache and
//!   append mutations to the durable queue.
//! - Drain: replay queued mutations in id order, each replay retried with
//!   backoff and every attempt guarded by the breaker.
//!
//! Queued acknowledgements are provisional. A mutation is only confirmed
//! when a drain replays it successfully and removes it from the queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use harbor_core::store::hash::compute_cache_key;
use harbor_core::{AppConfig, CacheStats, CachedEntry, Error, ErrorClass, NewQueuedRequest, QueueCounts, QueuedRequest, Store};
use serde::Serialize;

use crate::breaker::CircuitBreaker;
use crate::listeners::{ListenerRegistry, Subscription};
use crate::probe::NetworkProbe;
use crate::retry::{RetryOptions, with_retry};
use crate::transport::{Request, Response, Transport, canonicalize};

/// What the caller got back for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RequestOutcome {
    /// Fresh from the upstream.
    #[serde(rename = "ok")]
    Live(Response),
    /// Served from the cache; may be stale.
    Cached { response: Response, cached_at: DateTime<Utc> },
    /// Accepted for later replay. Not yet confirmed by the upstream.
    Queued { id: i64 },
    /// No network, no usable cache entry, and nothing queued.
    Unavailable,
}

impl RequestOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            RequestOutcome::Live(_) => "ok",
            RequestOutcome::Cached { .. } => "cached",
            RequestOutcome::Queued { .. } => "queued",
            RequestOutcome::Unavailable => "unavailable",
        }
    }

    pub fn response(&self) -> Option<&Response> {
        match self {
            RequestOutcome::Live(response) | RequestOutcome::Cached { response, .. } => Some(response),
            _ => None,
        }
    }
}

/// Emitted as the worker queues and replays mutations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    Enqueued { id: i64, method: String, url: String },
    Replayed { id: i64, attempts: u32 },
    /// The entry moved to `failed` and needs the user's attention.
    PermanentlyFailed { id: i64, attempts: u32, reason: String },
    DrainStarted { pending: u64 },
    DrainFinished(DrainReport),
}

/// Summary of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub replayed: u32,
    /// Ids moved to `failed` during this pass.
    pub failed: Vec<i64>,
    /// Stopped early because the breaker rejected a replay.
    pub halted_by_breaker: bool,
    /// Stopped early because connectivity was lost.
    pub halted_offline: bool,
    /// Cooldown left on the breaker when it halted the drain.
    pub retry_in_ms: Option<u64>,
    /// Pending entries left after the pass.
    pub remaining: u64,
    /// Another drain was already running; nothing was done.
    pub skipped: bool,
}

#[derive(Debug)]
enum Replay {
    Delivered,
    Rejected(Error),
    /// Breaker rejected the attempt; carries the rejection and its cooldown.
    Halted(Error, Duration),
    Interrupted(Error),
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub retry: RetryOptions,
    /// Cached entries older than this are never served.
    pub cache_max_age: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self { retry: RetryOptions::default(), cache_max_age: Duration::from_secs(7 * 24 * 60 * 60) }
    }
}

impl From<&AppConfig> for WorkerOptions {
    fn from(config: &AppConfig) -> Self {
        Self { retry: RetryOptions::from_config(&config.retry), cache_max_age: config.cache.max_age() }
    }
}

pub struct SyncWorker {
    store: Store,
    transport: Arc<dyn Transport>,
    probe: Arc<dyn NetworkProbe>,
    breaker: Arc<CircuitBreaker>,
    /// Retry policy for replays; stops early when the probe reports offline.
    replay_retry: RetryOptions,
    cache_max_age: chrono::Duration,
    events: ListenerRegistry<SyncEvent>,
    drain_lock: tokio::sync::Mutex<()>,
}

impl SyncWorker {
    pub fn new(
        store: Store, transport: Arc<dyn Transport>, probe: Arc<dyn NetworkProbe>, breaker: Arc<CircuitBreaker>,
        options: WorkerOptions,
    ) -> Self {
        let base = Arc::clone(&options.retry.retry_condition);
        let online = Arc::clone(&probe);
        let replay_retry = RetryOptions {
            retry_condition: Arc::new(move |e: &Error| base(e) && online.is_online()),
            ..options.retry
        };
        let cache_max_age = chrono::Duration::from_std(options.cache_max_age).unwrap_or(chrono::Duration::MAX);

        Self {
            store,
            transport,
            probe,
            breaker,
            replay_retry,
            cache_max_age,
            events: ListenerRegistry::new(),
            drain_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn probe(&self) -> &Arc<dyn NetworkProbe> {
        &self.probe
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn on_event(&self, callback: impl Fn(&SyncEvent) + Send + Sync + 'static) -> Subscription {
        self.events.subscribe(callback)
    }

    /// Send `request`, degrading to the cache or the queue when the upstream
    /// is unreachable.
    ///
    /// # Errors
    ///
    /// Client errors (4xx) from the upstream and invalid URLs are returned to
    /// the caller. Network, server and breaker failures never are: they turn
    /// into `Cached`, `Queued` or `Unavailable`.
    pub async fn request(&self, request: Request) -> Result<RequestOutcome, Error> {
        // The URL is sent and queued as given, so it must be absolute on its
        // own. Canonicalization alone would accept `example.com/path`.
        url::Url::parse(&request.url).map_err(|e| Error::InvalidUrl(format!("{}: {e}", request.url)))?;
        let canonical = canonicalize(&request.url)?;
        let cache_key = compute_cache_key(&request.method, canonical.as_str(), request.body.as_deref());

        if !self.probe.is_online() {
            tracing::debug!(method = %request.method, url = %request.url, "offline, not contacting upstream");
            return Ok(self.fallback(&request, &cache_key).await);
        }

        match self.breaker.call(|| self.transport.send(&request)).await {
            Ok(response) => {
                if request.is_cacheable() && response.is_success() {
                    self.cache_response(&request, canonical.as_str(), &cache_key, &response).await;
                }
                Ok(RequestOutcome::Live(response))
            }
            Err(err) if err.is_transient() || err.class() == ErrorClass::Circuit => {
                tracing::debug!(method = %request.method, url = %request.url, error = %err, "upstream unavailable, falling back");
                Ok(self.fallback(&request, &cache_key).await)
            }
            Err(err) => Err(err),
        }
    }

    async fn fallback(&self, request: &Request, cache_key: &str) -> RequestOutcome {
        if request.is_cacheable() {
            return self.cached_or_unavailable(cache_key).await;
        }
        if request.is_mutation() {
            return self.enqueue(request).await;
        }
        RequestOutcome::Unavailable
    }

    async fn cache_response(&self, request: &Request, canonical_url: &str, cache_key: &str, response: &Response) {
        let entry = CachedEntry::new(
            cache_key,
            request.method.as_str(),
            canonical_url,
            response.status,
            response.headers.clone(),
            response.body.to_vec(),
        );
        match self.store.put_entry(&entry).await {
            Ok(()) => tracing::debug!(url = %canonical_url, bytes = entry.body.len(), "cached response"),
            Err(e) => tracing::warn!(url = %canonical_url, error = %e, "failed to cache response, continuing without it"),
        }
    }

    async fn cached_or_unavailable(&self, cache_key: &str) -> RequestOutcome {
        match self.store.get_entry(cache_key).await {
            Ok(Some(entry)) if !entry.is_expired(self.cache_max_age) => {
                tracing::debug!(url = %entry.url, cached_at = %entry.cached_at, "cache hit");
                RequestOutcome::Cached {
                    response: Response { status: entry.status_code, headers: entry.headers, body: Bytes::from(entry.body) },
                    cached_at: entry.cached_at,
                }
            }
            Ok(Some(entry)) => {
                tracing::debug!(url = %entry.url, cached_at = %entry.cached_at, "cache entry expired");
                RequestOutcome::Unavailable
            }
            Ok(None) => {
                tracing::debug!(cache_key, "cache miss");
                RequestOutcome::Unavailable
            }
            Err(e) => {
                tracing::warn!(error = %e, "cache read failed");
                RequestOutcome::Unavailable
            }
        }
    }

    async fn enqueue(&self, request: &Request) -> RequestOutcome {
        let entry = NewQueuedRequest {
            method: request.method.clone(),
            url: request.url.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
        };
        match self.store.append_to_queue(&entry).await {
            Ok(id) => {
                tracing::info!(queue_id = id, method = %entry.method, url = %entry.url, "queued mutation for replay");
                self.events.notify(&SyncEvent::Enqueued { id, method: entry.method, url: entry.url });
                RequestOutcome::Queued { id }
            }
            Err(e) => {
                tracing::warn!(method = %entry.method, url = %entry.url, error = %e, "failed to queue mutation");
                RequestOutcome::Unavailable
            }
        }
    }

    /// Replay pending mutations in ascending id order.
    ///
    /// Only one drain runs at a time per worker; a concurrent call returns a
    /// report with `skipped` set. Entries appended while a drain runs are
    /// picked up by the same pass. An empty queue returns without emitting
    /// any events.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails while reading or updating the
    /// queue. Entries already replayed stay removed.
    pub async fn drain(&self) -> Result<DrainReport, Error> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            tracing::debug!("drain already in progress");
            return Ok(DrainReport { skipped: true, ..Default::default() });
        };

        let pending = self.store.pending_count().await?;
        if pending == 0 {
            return Ok(DrainReport::default());
        }

        tracing::info!(pending, "draining sync queue");
        self.events.notify(&SyncEvent::DrainStarted { pending });

        let mut report = DrainReport::default();
        let result = self.drain_entries(&mut report).await;
        report.remaining = self.store.pending_count().await.unwrap_or(pending);

        tracing::info!(
            replayed = report.replayed,
            failed = report.failed.len(),
            remaining = report.remaining,
            halted_by_breaker = report.halted_by_breaker,
            halted_offline = report.halted_offline,
            "drain finished"
        );
        self.events.notify(&SyncEvent::DrainFinished(report.clone()));

        result.map(|()| report)
    }

    /// Transport attempts an entry may use across all drains before it is
    /// marked failed.
    fn attempt_budget(&self) -> u32 {
        self.replay_retry.max_retries.saturating_add(1)
    }

    async fn drain_entries(&self, report: &mut DrainReport) -> Result<(), Error> {
        let budget = self.attempt_budget();
        loop {
            if !self.probe.is_online() {
                report.halted_offline = true;
                return Ok(());
            }

            let Some(entry) = self.store.next_pending().await? else {
                return Ok(());
            };

            if entry.attempt_count >= budget {
                let reason = entry.last_error.clone().unwrap_or_else(|| format!("retry budget of {budget} attempts used"));
                self.fail_entry(&entry, 0, reason, report).await?;
                continue;
            }

            let (attempts, outcome) = self.replay(&entry, budget - entry.attempt_count).await;
            let total_attempts = entry.attempt_count + attempts;

            match outcome {
                Replay::Delivered => {
                    self.store.remove_from_queue(entry.id).await?;
                    tracing::debug!(queue_id = entry.id, attempts, "replayed queued request");
                    report.replayed += 1;
                    self.events.notify(&SyncEvent::Replayed { id: entry.id, attempts });
                }
                Replay::Rejected(err) => self.fail_entry(&entry, attempts, err.to_string(), report).await?,
                Replay::Halted(err, retry_in) => {
                    if total_attempts >= budget {
                        let exhausted = Error::RetryExhausted { attempts: total_attempts, last: Box::new(err) };
                        self.fail_entry(&entry, attempts, exhausted.to_string(), report).await?;
                    } else if attempts > 0 {
                        self.store.record_attempts(entry.id, attempts, None).await?;
                    }
                    tracing::info!(queue_id = entry.id, retry_in_ms = retry_in.as_millis() as u64, "breaker open, pausing drain");
                    report.halted_by_breaker = true;
                    report.retry_in_ms = Some(retry_in.as_millis() as u64);
                    return Ok(());
                }
                Replay::Interrupted(err) => {
                    if total_attempts >= budget {
                        let exhausted = Error::RetryExhausted { attempts: total_attempts, last: Box::new(err) };
                        self.fail_entry(&entry, attempts, exhausted.to_string(), report).await?;
                    } else {
                        self.store.record_attempts(entry.id, attempts, Some(&err.to_string())).await?;
                        tracing::info!(queue_id = entry.id, error = %err, "replay interrupted, entry stays pending");
                    }
                    report.halted_offline = !self.probe.is_online();
                    return Ok(());
                }
            }
        }
    }

    /// Record this pass's attempts and move the entry to `failed`.
    async fn fail_entry(
        &self, entry: &QueuedRequest, attempts: u32, reason: String, report: &mut DrainReport,
    ) -> Result<(), Error> {
        if attempts > 0 {
            self.store.record_attempts(entry.id, attempts, Some(&reason)).await?;
        }
        self.store.mark_failed(entry.id, &reason).await?;

        let total_attempts = entry.attempt_count + attempts;
        let failure = Error::ReplayFailed { id: entry.id, attempts: total_attempts, reason: reason.clone() };
        tracing::warn!(queue_id = entry.id, error = %failure, "queued request needs manual resolution");
        report.failed.push(entry.id);
        self.events.notify(&SyncEvent::PermanentlyFailed { id: entry.id, attempts: total_attempts, reason });
        Ok(())
    }

    /// Replay one entry with at most `allowed` transport attempts. Returns the
    /// number of attempts that reached the transport and how the replay ended.
    async fn replay(&self, entry: &QueuedRequest, allowed: u32) -> (u32, Replay) {
        let request = Request::from(entry);
        let attempts = AtomicU32::new(0);
        let options = RetryOptions { max_retries: allowed.saturating_sub(1), ..self.replay_retry.clone() };

        let worker = self;
        let request_ref = &request;
        let attempts_ref = &attempts;
        let result = with_retry(
            move || {
                worker.breaker.call(move || {
                    attempts_ref.fetch_add(1, Ordering::SeqCst);
                    tracing::debug!(queue_id = entry.id, url = %request_ref.url, "replaying queued request");
                    worker.transport.send(request_ref)
                })
            },
            &options,
        )
        .await;

        let outcome = match result {
            Ok(_) => Replay::Delivered,
            Err(Error::CircuitOpen { dependency, retry_in }) => {
                Replay::Halted(Error::CircuitOpen { dependency, retry_in }, retry_in)
            }
            Err(err) if err.is_transient() => Replay::Interrupted(err),
            Err(err) => Replay::Rejected(err),
        };
        (attempts.load(Ordering::SeqCst), outcome)
    }

    /// Every queue entry, pending and failed, in ascending id order.
    pub async fn queued_requests(&self) -> Result<Vec<QueuedRequest>, Error> {
        self.store.list_queue().await
    }

    pub async fn queue_counts(&self) -> Result<QueueCounts, Error> {
        self.store.queue_counts().await
    }

    /// Acknowledge and delete a permanently failed entry.
    pub async fn dismiss_failed(&self, id: i64) -> Result<(), Error> {
        self.store.dismiss_failed(id).await?;
        tracing::info!(queue_id = id, "dismissed failed request");
        Ok(())
    }

    /// Give a permanently failed entry another chance on the next drain.
    pub async fn requeue_failed(&self, id: i64) -> Result<(), Error> {
        self.store.requeue_failed(id).await?;
        tracing::info!(queue_id = id, "requeued failed request");
        Ok(())
    }

    pub async fn clear_queue(&self) -> Result<u64, Error> {
        let count = self.store.clear_queue().await?;
        tracing::info!(count, "cleared sync queue");
        Ok(count)
    }

    /// Delete cache entries past the max age.
    pub async fn cleanup_cache(&self) -> Result<u64, Error> {
        let removed = self.store.purge_expired_entries(self.cache_max_age).await?;
        if removed > 0 {
            tracing::info!(removed, "cache cleanup removed expired entries");
        } else {
            tracing::debug!("cache cleanup found no expired entries");
        }
        Ok(removed)
    }

    pub async fn clear_cache(&self) -> Result<u64, Error> {
        self.store.purge_all_entries().await
    }

    pub async fn cache_stats(&self) -> Result<CacheStats, Error> {
        self.store.cache_stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerOptions, CircuitState};
    use crate::probe::ConnectivityMonitor;
    use crate::transport::mock::MockTransport;
    use harbor_core::QueueStatus;
    use std::sync::Mutex;

    struct Harness {
        worker: SyncWorker,
        transport: Arc<MockTransport>,
        monitor: ConnectivityMonitor,
    }

    fn quick_retry(max_retries: u32) -> RetryOptions {
        RetryOptions {
            max_retries,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            ..Default::default()
        }
    }

    async fn harness(transport: MockTransport, online: bool) -> Harness {
        harness_with(transport, online, BreakerOptions::default(), quick_retry(2)).await
    }

    async fn harness_with(transport: MockTransport, online: bool, breaker: BreakerOptions, retry: RetryOptions) -> Harness {
        let store = Store::open_in_memory().await.unwrap();
        let transport = Arc::new(transport);
        let monitor = ConnectivityMonitor::new(online, Duration::ZERO);
        let worker = SyncWorker::new(
            store,
            transport.clone(),
            Arc::new(monitor.clone()),
            Arc::new(CircuitBreaker::new("api", breaker)),
            WorkerOptions { retry, ..Default::default() },
        );
        Harness { worker, transport, monitor }
    }

    fn post(url: &str) -> Request {
        Request::new("POST", url).with_header("content-type", "application/json").with_body("{}")
    }

    fn record_events(worker: &SyncWorker) -> (Arc<Mutex<Vec<SyncEvent>>>, Subscription) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sub = {
            let events = Arc::clone(&events);
            worker.on_event(move |e| events.lock().unwrap().push(e.clone()))
        };
        (events, sub)
    }

    #[tokio::test]
    async fn test_online_get_is_cached_then_served_offline() {
        let h = harness(MockTransport::ok("{\"notices\":[]}"), true).await;
        let url = "https://example.com/api/notices";

        let outcome = h.worker.request(Request::get(url)).await.unwrap();
        assert_eq!(outcome.kind(), "ok");

        h.monitor.report(false);
        let outcome = h.worker.request(Request::get(url)).await.unwrap();
        match outcome {
            RequestOutcome::Cached { response, .. } => assert_eq!(response.text(), "{\"notices\":[]}"),
            other => panic!("expected cached response, got {other:?}"),
        }
        assert_eq!(h.transport.attempts(), 1);
    }

    #[tokio::test]
    async fn test_equivalent_urls_share_cache_entry() {
        let h = harness(MockTransport::ok("page"), true).await;
        h.worker.request(Request::get("https://example.com/list?b=2&a=1")).await.unwrap();

        h.monitor.report(false);
        let outcome = h.worker.request(Request::get("https://EXAMPLE.com/list?a=1&b=2#top")).await.unwrap();
        assert_eq!(outcome.kind(), "cached");
    }

    #[tokio::test]
    async fn test_expired_entry_not_served() {
        let h = harness(MockTransport::ok("fresh"), false).await;
        let url = "https://example.com/api/weather";
        let canonical = canonicalize(url).unwrap();
        let mut entry = CachedEntry::new(
            compute_cache_key("GET", canonical.as_str(), None),
            "GET",
            canonical.as_str(),
            200,
            Vec::new(),
            b"old".to_vec(),
        );
        entry.cached_at = Utc::now() - chrono::Duration::days(8);
        h.worker.store().put_entry(&entry).await.unwrap();

        let outcome = h.worker.request(Request::get(url)).await.unwrap();
        assert_eq!(outcome, RequestOutcome::Unavailable);
    }

    #[tokio::test]
    async fn test_offline_get_without_cache_is_unavailable() {
        let h = harness(MockTransport::ok("x"), false).await;
        let outcome = h.worker.request(Request::get("https://example.com/api/payments")).await.unwrap();
        assert_eq!(outcome, RequestOutcome::Unavailable);
        assert_eq!(h.transport.attempts(), 0);
    }

    #[tokio::test]
    async fn test_offline_mutations_queue_in_order() {
        let h = harness(MockTransport::ok(""), false).await;
        let (events, _sub) = record_events(&h.worker);

        let a = h.worker.request(post("https://example.com/api/a")).await.unwrap();
        assert_eq!(h.worker.queue_counts().await.unwrap().pending, 1);
        let b = h.worker.request(post("https://example.com/api/b")).await.unwrap();
        assert_eq!(h.worker.queue_counts().await.unwrap().pending, 2);

        let (RequestOutcome::Queued { id: a }, RequestOutcome::Queued { id: b }) = (a, b) else {
            panic!("expected both mutations to be queued");
        };
        assert!(a < b);

        let queue = h.worker.queued_requests().await.unwrap();
        assert_eq!(queue.iter().map(|r| r.id).collect::<Vec<_>>(), [a, b]);
        assert_eq!(queue[0].headers, [("content-type".to_string(), "application/json".to_string())]);
        assert_eq!(events.lock().unwrap().len(), 2);
        assert_eq!(h.transport.attempts(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_queues_mutation() {
        let h = harness(MockTransport::status(503), true).await;
        let outcome = h.worker.request(post("https://example.com/api/a")).await.unwrap();
        assert!(matches!(outcome, RequestOutcome::Queued { .. }));
        assert_eq!(h.transport.attempts(), 1);
    }

    #[tokio::test]
    async fn test_client_error_bubbles() {
        let h = harness(MockTransport::status(422), true).await;
        let err = h.worker.request(post("https://example.com/api/a")).await.unwrap_err();
        assert!(matches!(err, Error::Client { status: 422, .. }));
        assert!(h.worker.queued_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_breaker_serves_cache() {
        let breaker = BreakerOptions { failure_threshold: 1, recovery_timeout: Duration::from_secs(60) };
        let transport = MockTransport::from_fn(|_, n| if n == 1 { Ok(Response::new(200, "cached")) } else { Err(Error::Network("down".into())) });
        let h = harness_with(transport, true, breaker, quick_retry(0)).await;
        let url = "https://example.com/api/cameras";

        h.worker.request(Request::get(url)).await.unwrap();
        assert_eq!(h.worker.request(Request::get(url)).await.unwrap().kind(), "cached");
        assert_eq!(h.worker.breaker().state(), CircuitState::Open);

        assert_eq!(h.worker.request(Request::get(url)).await.unwrap().kind(), "cached");
        assert_eq!(h.transport.attempts(), 2);
    }

    #[tokio::test]
    async fn test_drain_replays_in_id_order() {
        let h = harness(MockTransport::ok(""), false).await;
        h.worker.request(post("https://example.com/api/a")).await.unwrap();
        h.worker.request(post("https://example.com/api/b")).await.unwrap();

        h.monitor.report(true);
        let report = h.worker.drain().await.unwrap();

        assert_eq!(report.replayed, 2);
        assert_eq!(report.remaining, 0);
        assert_eq!(h.transport.urls(), ["https://example.com/api/a", "https://example.com/api/b"]);
        assert!(h.worker.queued_requests().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_head_of_line_blocks_later_entries() {
        // A fails twice before succeeding; B would succeed at once.
        let transport = MockTransport::from_fn(|req, _| {
            if req.url.ends_with("/a") && A_FAILURES.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::from_status(503, "busy"))
            } else {
                Ok(Response::new(200, ""))
            }
        });
        static A_FAILURES: AtomicU32 = AtomicU32::new(0);

        let h = harness(transport, false).await;
        h.worker.request(post("https://example.com/api/a")).await.unwrap();
        h.worker.request(post("https://example.com/api/b")).await.unwrap();
        h.monitor.report(true);

        let report = h.worker.drain().await.unwrap();
        assert_eq!(report.replayed, 2);
        assert_eq!(
            h.transport.urls(),
            ["https://example.com/api/a", "https://example.com/api/a", "https://example.com/api/a", "https://example.com/api/b"]
        );
    }

    #[tokio::test]
    async fn test_drain_empty_queue_is_noop() {
        let h = harness(MockTransport::ok(""), true).await;
        let (events, _sub) = record_events(&h.worker);

        let report = h.worker.drain().await.unwrap();
        assert_eq!(report, DrainReport::default());
        assert!(events.lock().unwrap().is_empty());
        assert_eq!(h.transport.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_replay_marks_failed_and_continues() {
        let transport = MockTransport::from_fn(|req, _| {
            if req.url.ends_with("/a") { Err(Error::from_status(500, "boom")) } else { Ok(Response::new(200, "")) }
        });
        let h = harness(transport, false).await;
        let (events, _sub) = record_events(&h.worker);
        h.worker.request(post("https://example.com/api/a")).await.unwrap();
        h.worker.request(post("https://example.com/api/b")).await.unwrap();
        h.monitor.report(true);

        let report = h.worker.drain().await.unwrap();
        assert_eq!(report.replayed, 1);
        assert_eq!(report.failed.len(), 1);

        let queue = h.worker.queued_requests().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].status, QueueStatus::Failed);
        assert_eq!(queue[0].attempt_count, 3);
        assert!(queue[0].last_error.as_deref().unwrap().contains("RETRY_EXHAUSTED"));

        let events = events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(e, SyncEvent::PermanentlyFailed { attempts: 3, .. })));
    }

    #[tokio::test]
    async fn test_client_error_on_replay_fails_without_retry() {
        let h = harness(MockTransport::status(409), false).await;
        let id = match h.worker.request(post("https://example.com/api/a")).await.unwrap() {
            RequestOutcome::Queued { id } => id,
            other => panic!("expected queued, got {other:?}"),
        };
        h.monitor.report(true);

        let report = h.worker.drain().await.unwrap();
        assert_eq!(report.failed, [id]);
        assert_eq!(h.transport.attempts(), 1);

        h.worker.dismiss_failed(id).await.unwrap();
        assert!(h.worker.queued_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_breaker_halts_drain_untouched() {
        let breaker = BreakerOptions { failure_threshold: 1, recovery_timeout: Duration::from_secs(60) };
        let h = harness_with(MockTransport::network_down(), true, breaker, quick_retry(0)).await;
        h.worker.request(post("https://example.com/api/a")).await.unwrap();
        h.worker.request(post("https://example.com/api/b")).await.unwrap();
        assert_eq!(h.worker.breaker().state(), CircuitState::Open);
        let before = h.transport.attempts();

        let report = h.worker.drain().await.unwrap();
        assert!(report.halted_by_breaker);
        assert!(report.retry_in_ms.is_some());
        assert_eq!(report.remaining, 2);
        assert_eq!(h.transport.attempts(), before);

        let queue = h.worker.queued_requests().await.unwrap();
        assert!(queue.iter().all(|r| r.status == QueueStatus::Pending && r.attempt_count == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connectivity_loss_mid_replay_keeps_entry_pending() {
        let h = harness(MockTransport::network_down(), false).await;
        h.worker.request(post("https://example.com/api/a")).await.unwrap();
        h.monitor.report(true);

        let monitor = h.monitor.clone();
        let _sub = h.worker.on_event(move |e| {
            if matches!(e, SyncEvent::DrainStarted { .. }) {
                monitor.report(false);
            }
        });

        let report = h.worker.drain().await.unwrap();
        assert!(report.halted_offline);
        assert_eq!(report.remaining, 1);

        let queue = h.worker.queued_requests().await.unwrap();
        assert_eq!(queue[0].status, QueueStatus::Pending);
        assert_eq!(h.transport.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_during_retries_stops_without_failing() {
        let h = harness(MockTransport::network_down(), false).await;
        h.worker.request(post("https://example.com/api/a")).await.unwrap();
        h.monitor.report(true);

        let monitor = h.monitor.clone();
        let transport = h.transport.clone();
        let watcher = tokio::spawn(async move {
            while transport.attempts() == 0 {
                tokio::task::yield_now().await;
            }
            monitor.report(false);
        });

        let report = h.worker.drain().await.unwrap();
        watcher.await.unwrap();
        assert!(report.halted_offline);
        assert!(report.failed.is_empty());

        let entry = &h.worker.queued_requests().await.unwrap()[0];
        assert_eq!(entry.status, QueueStatus::Pending);
        assert!(entry.attempt_count >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_budget_spans_breaker_halted_drains() {
        let h = harness_with(MockTransport::network_down(), false, BreakerOptions::default(), quick_retry(3)).await;
        let (events, _sub) = record_events(&h.worker);
        h.worker.request(post("https://example.com/api/a")).await.unwrap();
        let b = match h.worker.request(post("https://example.com/api/b")).await.unwrap() {
            RequestOutcome::Queued { id } => id,
            other => panic!("expected queued, got {other:?}"),
        };
        h.monitor.report(true);

        // A uses its four attempts; B trips the breaker on its first.
        let report = h.worker.drain().await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(report.halted_by_breaker);

        // Each cooldown admits exactly one trial for B.
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(61)).await;
            h.worker.drain().await.unwrap();
        }

        let entry = h.worker.store().get_queued(b).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Failed);
        assert_eq!(entry.attempt_count, 4);
        assert!(entry.last_error.as_deref().unwrap().contains("RETRY_EXHAUSTED"));
        assert_eq!(h.transport.urls().iter().filter(|u| u.ends_with("/b")).count(), 4);

        let events = events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(e, SyncEvent::PermanentlyFailed { id, attempts: 4, .. } if *id == b)));
    }

    #[tokio::test]
    async fn test_entry_over_budget_fails_without_sending() {
        let h = harness(MockTransport::ok(""), false).await;
        let id = match h.worker.request(post("https://example.com/api/a")).await.unwrap() {
            RequestOutcome::Queued { id } => id,
            other => panic!("expected queued, got {other:?}"),
        };
        h.worker.store().record_attempts(id, 3, Some("NETWORK_ERROR: refused")).await.unwrap();
        h.monitor.report(true);

        let report = h.worker.drain().await.unwrap();
        assert_eq!(report.failed, [id]);
        assert_eq!(h.transport.attempts(), 0);

        h.worker.requeue_failed(id).await.unwrap();
        let report = h.worker.drain().await.unwrap();
        assert_eq!(report.replayed, 1);
    }

    #[tokio::test]
    async fn test_schemeless_url_rejected_online_and_offline() {
        let h = harness(MockTransport::ok(""), false).await;
        let offline = h.worker.request(post("example.com/api/a")).await;
        assert!(matches!(offline, Err(Error::InvalidUrl(_))));
        assert!(h.worker.queued_requests().await.unwrap().is_empty());

        h.monitor.report(true);
        let online = h.worker.request(post("example.com/api/a")).await;
        assert!(matches!(online, Err(Error::InvalidUrl(_))));
        assert_eq!(h.transport.attempts(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_drain_is_skipped() {
        let h = harness(MockTransport::ok("").with_latency(Duration::from_millis(50)), false).await;
        h.worker.request(post("https://example.com/api/a")).await.unwrap();
        h.monitor.report(true);

        let (first, second) = tokio::join!(h.worker.drain(), async {
            tokio::task::yield_now().await;
            h.worker.drain().await
        });
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(first.replayed, 1);
        assert!(second.skipped);
        assert_eq!(h.transport.attempts(), 1);
    }

    #[tokio::test]
    async fn test_storage_failure_degrades_to_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harbor.sqlite");
        let store = Store::open(&path).await.unwrap();
        let monitor = ConnectivityMonitor::new(false, Duration::ZERO);
        let worker = SyncWorker::new(
            store.clone(),
            Arc::new(MockTransport::ok("")),
            Arc::new(monitor),
            Arc::new(CircuitBreaker::new("api", BreakerOptions::default())),
            WorkerOptions::default(),
        );

        store.close().await.unwrap();

        let outcome = worker.request(post("https://example.com/api/a")).await.unwrap();
        assert_eq!(outcome, RequestOutcome::Unavailable);
        let outcome = worker.request(Request::get("https://example.com/api/a")).await.unwrap();
        assert_eq!(outcome, RequestOutcome::Unavailable);
    }

    #[tokio::test]
    async fn test_cleanup_cache_removes_expired() {
        let h = harness(MockTransport::ok(""), true).await;
        let mut old = CachedEntry::new("cache:GET:old", "GET", "https://example.com/old", 200, Vec::new(), b"x".to_vec());
        old.cached_at = Utc::now() - chrono::Duration::days(30);
        h.worker.store().put_entry(&old).await.unwrap();
        h.worker.request(Request::get("https://example.com/new")).await.unwrap();

        assert_eq!(h.worker.cleanup_cache().await.unwrap(), 1);
        assert_eq!(h.worker.cache_stats().await.unwrap().entries, 1);
        assert_eq!(h.worker.clear_cache().await.unwrap(), 1);
    }
}
