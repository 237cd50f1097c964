//! Offline state controller.
//!
//! Foreground façade over the worker: exposes an observable [`OfflineState`]
//! and owns the background loop that drains the queue when connectivity
//! returns. Construct one per process at startup and share it through an
//! `Arc`.
//!
//! The state is updated synchronously from probe transitions and worker
//! events, and reconciled against the store on [`OfflineController::refresh`]
//! (which the background loop calls on every re-drain tick, so entries queued
//! by another process show up too).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use harbor_core::{AppConfig, Error, QueuedRequest};
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::listeners::{ListenerRegistry, Subscription};
use crate::probe::ConnectivityState;
use crate::transport::Request;
use crate::worker::{DrainReport, RequestOutcome, SyncEvent, SyncWorker};

/// Shortest wait before retrying a drain the breaker halted.
const MIN_RESUME_DELAY: Duration = Duration::from_millis(100);

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// What the application shows about offline operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OfflineState {
    pub is_online: bool,
    /// Pending entries waiting for replay.
    pub queued_request_count: u64,
    pub has_queued_requests: bool,
    /// Entries that failed permanently and await dismissal.
    pub failed_request_count: u64,
    /// Set on an online transition with work pending; cleared once the queue
    /// has drained. Drives a "syncing..." indicator.
    pub just_came_back_online: bool,
    pub last_online_at: Option<DateTime<Utc>>,
    pub last_offline_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// How often expired cache entries are deleted.
    pub cleanup_interval: Duration,
    /// How often to re-check the store and drain while online.
    pub drain_interval: Duration,
    /// GET endpoints re-fetched into the cache after every reconnect.
    pub revalidate_urls: Vec<String>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(60 * 60),
            drain_interval: Duration::from_secs(60),
            revalidate_urls: Vec::new(),
        }
    }
}

impl From<&AppConfig> for ControllerOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            cleanup_interval: config.cache.cleanup_interval(),
            drain_interval: config.drain_interval(),
            revalidate_urls: config.cache.revalidate_urls.clone(),
        }
    }
}

struct Shared {
    state: watch::Sender<OfflineState>,
    listeners: ListenerRegistry<OfflineState>,
}

impl Shared {
    /// Apply `f`, normalize derived fields, and notify if anything changed.
    fn update(&self, f: impl FnOnce(&mut OfflineState)) {
        let mut published = None;
        self.state.send_if_modified(|state| {
            let before = state.clone();
            f(state);
            state.has_queued_requests = state.queued_request_count > 0;
            if !state.has_queued_requests {
                state.just_came_back_online = false;
            }
            if *state == before {
                return false;
            }
            published = Some(state.clone());
            true
        });

        if let Some(state) = published {
            self.listeners.notify(&state);
        }
    }
}

fn apply_connectivity(state: &mut OfflineState, connectivity: &ConnectivityState) {
    state.is_online = connectivity.is_online;
    state.last_online_at = connectivity.last_online_at;
    state.last_offline_at = connectivity.last_offline_at;
    state.just_came_back_online = connectivity.is_online && state.queued_request_count > 0;
    if state.just_came_back_online {
        tracing::info!(queued = state.queued_request_count, "back online, syncing queued requests");
    }
}

fn apply_event(state: &mut OfflineState, event: &SyncEvent) {
    match event {
        SyncEvent::Enqueued { .. } => state.queued_request_count += 1,
        SyncEvent::Replayed { .. } => state.queued_request_count = state.queued_request_count.saturating_sub(1),
        SyncEvent::PermanentlyFailed { .. } => {
            state.queued_request_count = state.queued_request_count.saturating_sub(1);
            state.failed_request_count += 1;
        }
        SyncEvent::DrainStarted { pending } => state.queued_request_count = *pending,
        SyncEvent::DrainFinished(report) => state.queued_request_count = report.remaining,
    }
}

pub struct OfflineController {
    worker: Arc<SyncWorker>,
    shared: Arc<Shared>,
    options: ControllerOptions,
    _subscriptions: [Subscription; 2],
}

impl OfflineController {
    pub fn new(worker: Arc<SyncWorker>, options: ControllerOptions) -> Self {
        let probe = Arc::clone(worker.probe());
        let mut initial = OfflineState::default();
        apply_connectivity(&mut initial, &probe.state());

        let (state, _rx) = watch::channel(initial);
        let shared = Arc::new(Shared { state, listeners: ListenerRegistry::new() });

        let connectivity = {
            let shared = Arc::clone(&shared);
            probe.on_change(Box::new(move |c: &ConnectivityState| shared.update(|s| apply_connectivity(s, c))))
        };
        let events = {
            let shared = Arc::clone(&shared);
            worker.on_event(move |e| shared.update(|s| apply_event(s, e)))
        };

        Self { worker, shared, options, _subscriptions: [connectivity, events] }
    }

    pub fn worker(&self) -> &Arc<SyncWorker> {
        &self.worker
    }

    pub fn state(&self) -> OfflineState {
        self.shared.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<OfflineState> {
        self.shared.state.subscribe()
    }

    /// Call `callback` with every new state.
    pub fn subscribe(&self, callback: impl Fn(&OfflineState) + Send + Sync + 'static) -> Subscription {
        self.shared.listeners.subscribe(callback)
    }

    pub async fn request(&self, request: Request) -> Result<RequestOutcome, Error> {
        self.worker.request(request).await
    }

    /// Queue entries in ascending id order.
    pub async fn get_queued_requests(&self) -> Result<Vec<QueuedRequest>, Error> {
        self.worker.queued_requests().await
    }

    /// Re-read queue counts from the store.
    pub async fn refresh(&self) -> Result<OfflineState, Error> {
        let counts = self.worker.queue_counts().await?;
        let connectivity = self.worker.probe().state();
        self.shared.update(|s| {
            s.is_online = connectivity.is_online;
            s.queued_request_count = counts.pending;
            s.failed_request_count = counts.failed;
        });
        Ok(self.state())
    }

    pub async fn drain(&self) -> Result<DrainReport, Error> {
        self.worker.drain().await
    }

    pub async fn dismiss_failed(&self, id: i64) -> Result<(), Error> {
        self.worker.dismiss_failed(id).await?;
        self.refresh().await?;
        Ok(())
    }

    pub async fn requeue_failed(&self, id: i64) -> Result<(), Error> {
        self.worker.requeue_failed(id).await?;
        self.refresh().await?;
        Ok(())
    }

    pub async fn clear_queue(&self) -> Result<u64, Error> {
        let count = self.worker.clear_queue().await?;
        self.refresh().await?;
        Ok(count)
    }

    /// Re-fetch the configured endpoints so the cache holds fresh copies.
    ///
    /// Stops early if connectivity drops. Returns how many endpoints answered
    /// live.
    pub async fn revalidate(&self) -> usize {
        let mut refreshed = 0;
        for url in &self.options.revalidate_urls {
            if !self.worker.probe().is_online() {
                break;
            }
            match self.worker.request(Request::get(url.as_str())).await {
                Ok(RequestOutcome::Live(_)) => refreshed += 1,
                Ok(outcome) => tracing::debug!(url = %url, outcome = outcome.kind(), "revalidation fell back"),
                Err(e) => tracing::warn!(url = %url, error = %e, "revalidation failed"),
            }
        }
        if refreshed > 0 {
            tracing::info!(refreshed, "revalidated cached endpoints");
        }
        refreshed
    }

    /// Spawn the background sync loop.
    ///
    /// The loop drains on every online transition and then revalidates the
    /// configured endpoints. It also resumes after a breaker cooldown, re-drains periodically while online with work pending, and
    /// deletes expired cache entries. It runs until [`ControllerHandle::stop`]
    /// is called or the handle is dropped.
    pub fn start(self: &Arc<Self>) -> ControllerHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let controller = Arc::clone(self);
        let task = tokio::spawn(async move { controller.run(stop_rx).await });
        ControllerHandle { stop: stop_tx, task }
    }

    async fn run(&self, mut stop: oneshot::Receiver<()>) {
        let probe = Arc::clone(self.worker.probe());
        let mut connectivity = probe.watch();

        let mut cleanup = tokio::time::interval(self.options.cleanup_interval.max(MIN_INTERVAL));
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let drain_interval = self.options.drain_interval.max(MIN_INTERVAL);
        let mut redrain = tokio::time::interval_at(Instant::now() + drain_interval, drain_interval);
        redrain.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            cleanup_interval_secs = self.options.cleanup_interval.as_secs(),
            drain_interval_secs = self.options.drain_interval.as_secs(),
            "background sync started"
        );

        self.refresh_logged().await;
        let mut resume_at = if probe.is_online() { self.drain_logged().await } else { None };

        loop {
            tokio::select! {
                _ = &mut stop => break,
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = connectivity.borrow_and_update().is_online;
                    if online {
                        resume_at = self.drain_logged().await;
                        self.revalidate().await;
                    }
                }
                _ = tokio::time::sleep_until(resume_at.unwrap_or_else(Instant::now)), if resume_at.is_some() => {
                    resume_at = None;
                    if probe.is_online() {
                        resume_at = self.drain_logged().await;
                    }
                }
                _ = redrain.tick() => {
                    self.refresh_logged().await;
                    if probe.is_online() && self.state().has_queued_requests {
                        resume_at = self.drain_logged().await;
                    }
                }
                _ = cleanup.tick() => {
                    if let Err(e) = self.worker.cleanup_cache().await {
                        tracing::warn!(error = %e, "cache cleanup failed");
                    }
                }
            }
        }

        tracing::info!("background sync stopped");
    }

    async fn refresh_logged(&self) {
        if let Err(e) = self.refresh().await {
            tracing::warn!(error = %e, "failed to refresh offline state");
        }
    }

    /// Drain once. Returns when to try again if the breaker halted the pass.
    async fn drain_logged(&self) -> Option<Instant> {
        match self.worker.drain().await {
            Ok(report) if report.halted_by_breaker => {
                let wait = report
                    .retry_in_ms
                    .map(Duration::from_millis)
                    .unwrap_or_default()
                    .max(MIN_RESUME_DELAY);
                Some(Instant::now() + wait)
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "queue drain failed");
                None
            }
        }
    }
}

/// Stops the background loop.
pub struct ControllerHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ControllerHandle {
    /// Signal the loop and wait for it to exit. A drain or revalidation pass
    /// already running completes before the loop sees the signal.
    pub async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "background sync task ended abnormally");
        }
    }
}
