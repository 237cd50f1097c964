//! SQLite-backed durable store for cached responses and the sync queue.
//!
//! This module provides a persistent store using SQLite with async access via
//! tokio-rusqlite. It supports:
//!
//! - Response cache keyed by canonical request identity (`cache:<method>:<hash>`)
//! - FIFO sync queue keyed by an auto-incrementing id
//! - Automatic schema migrations
//! - WAL mode so a foreground process and a background worker can share one file

pub mod connection;
pub mod entries;
pub mod hash;
pub mod migrations;
pub mod queue;

pub use crate::Error;

pub use connection::Store;
pub use entries::{CacheStats, CachedEntry};
pub use queue::{NewQueuedRequest, QueueCounts, QueueStatus, QueuedRequest};

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};

/// Current time at the precision the store keeps.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Format a timestamp for storage.
///
/// Fixed precision and a `Z` suffix keep stored values lexicographically
/// ordered, so age comparisons can run in SQL.
pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp written by [`format_timestamp`].
pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Serialization(format!("invalid timestamp '{s}': {e}")))
}
