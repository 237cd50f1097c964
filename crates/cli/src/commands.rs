//! Subcommand handlers.
//!
//! Each handler returns a serializable value; `main` prints it as JSON on
//! stdout.

use clap::ValueEnum;
use harbor_client::{CircuitState, DrainReport, OfflineState, Request, RequestOutcome};
use harbor_core::{CacheStats, Error, QueueStatus, QueuedRequest};
use serde::Serialize;

use crate::app::App;

/// Parse a `Name: value` header argument.
pub fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw.split_once(':').ok_or_else(|| format!("expected `Name: value`, got `{raw}`"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in `{raw}`"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusFilter {
    Pending,
    Failed,
}

impl From<StatusFilter> for QueueStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Pending => QueueStatus::Pending,
            StatusFilter::Failed => QueueStatus::Failed,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failures: u32,
}

#[derive(Debug, Serialize)]
pub struct StatusOutput {
    pub state: OfflineState,
    pub breaker: BreakerStatus,
    pub cache: CacheStats,
}

#[derive(Debug, Serialize)]
pub struct IdOutput {
    pub id: i64,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct PurgeOutput {
    pub cache_entries: u64,
    pub queued_requests: u64,
}

pub fn build_request(method: &str, url: &str, headers: Vec<(String, String)>, body: Option<Vec<u8>>) -> Request {
    let mut request = Request::new(method, url);
    request.headers = headers;
    request.body = body;
    request
}

pub async fn request(app: &App, request: Request) -> Result<RequestOutcome, Error> {
    app.check_liveness().await;
    app.controller.request(request).await
}

pub async fn queue(app: &App, filter: Option<StatusFilter>) -> Result<Vec<QueuedRequest>, Error> {
    match filter {
        Some(filter) => app.controller.worker().store().list_queue_by_status(filter.into()).await,
        None => app.controller.get_queued_requests().await,
    }
}

pub async fn drain(app: &App) -> Result<DrainReport, Error> {
    app.check_liveness().await;
    app.controller.drain().await
}

pub async fn dismiss(app: &App, id: i64) -> Result<IdOutput, Error> {
    app.controller.dismiss_failed(id).await?;
    Ok(IdOutput { id, status: "dismissed" })
}

pub async fn requeue(app: &App, id: i64) -> Result<IdOutput, Error> {
    app.controller.requeue_failed(id).await?;
    Ok(IdOutput { id, status: "pending" })
}

pub async fn status(app: &App) -> Result<StatusOutput, Error> {
    app.check_liveness().await;
    let state = app.controller.refresh().await?;
    let worker = app.controller.worker();
    let breaker = worker.breaker();
    Ok(StatusOutput {
        state,
        breaker: BreakerStatus { name: breaker.name().to_string(), state: breaker.state(), failures: breaker.failure_count() },
        cache: worker.cache_stats().await?,
    })
}

/// Delete expired cache entries, or all of them with `all`. With `queue`,
/// also drop every queued request.
pub async fn purge(app: &App, all: bool, queue: bool) -> Result<PurgeOutput, Error> {
    let worker = app.controller.worker();
    let cache_entries = if all { worker.clear_cache().await? } else { worker.cleanup_cache().await? };
    let queued_requests = if queue { app.controller.clear_queue().await? } else { 0 };
    Ok(PurgeOutput { cache_entries, queued_requests })
}
