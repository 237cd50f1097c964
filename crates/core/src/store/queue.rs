//! Sync queue operations.
//!
//! The queue is an append-only log of mutations that could not be delivered.
//! Ids come from SQLite `AUTOINCREMENT`, so id order is insertion order and
//! doubles as replay order. Every operation is a single statement, which
//! SQLite makes atomic across connections and processes.

use super::connection::Store;
use super::{format_timestamp, now, parse_timestamp};
use crate::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite;

const SELECT_COLUMNS: &str =
    "SELECT id, method, url, headers_json, body, created_at, attempt_count, last_error, status, failed_at FROM sync_queue";

/// Lifecycle of a queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting for replay.
    Pending,
    /// Exceeded its retry budget; kept until the user dismisses it.
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(Error::Serialization(format!("unknown queue status '{other}'"))),
        }
    }
}

/// A mutation to append to the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewQueuedRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

/// A persisted queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub id: i64,
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub status: QueueStatus,
    pub failed_at: Option<DateTime<Utc>>,
}

/// Queue sizes by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub failed: u64,
}

type QueueRow = (i64, String, String, String, Option<Vec<u8>>, String, u32, Option<String>, String, Option<String>);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn into_request(row: QueueRow) -> Result<QueuedRequest, Error> {
    let (id, method, url, headers_json, body, created_at, attempt_count, last_error, status, failed_at) = row;
    Ok(QueuedRequest {
        id,
        method,
        url,
        headers: serde_json::from_str(&headers_json)?,
        body,
        created_at: parse_timestamp(&created_at)?,
        attempt_count,
        last_error,
        status: QueueStatus::parse(&status)?,
        failed_at: failed_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

impl Store {
    /// Append a mutation to the tail of the queue and return its id.
    pub async fn append_to_queue(&self, request: &NewQueuedRequest) -> Result<i64, Error> {
        let request = request.clone();
        let headers_json = serde_json::to_string(&request.headers)?;
        let created_at = format_timestamp(now());
        self.conn
            .call(move |conn| -> Result<i64, Error> {
                conn.execute(
                    "INSERT INTO sync_queue (method, url, headers_json, body, created_at, status)
                    VALUES (?1, ?2, ?3, ?4, ?5, 'pending')",
                    params![request.method, request.url, headers_json, request.body, created_at],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(Error::from)
    }

    /// Every queue entry, pending and failed, in ascending id order.
    pub async fn list_queue(&self) -> Result<Vec<QueuedRequest>, Error> {
        self.conn
            .call(|conn| -> Result<Vec<QueuedRequest>, Error> {
                let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY id ASC"))?;
                let rows = stmt.query_map([], read_row)?.collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(into_request).collect()
            })
            .await
            .map_err(Error::from)
    }

    /// Entries in the given status, in ascending id order.
    pub async fn list_queue_by_status(&self, status: QueueStatus) -> Result<Vec<QueuedRequest>, Error> {
        self.conn
            .call(move |conn| -> Result<Vec<QueuedRequest>, Error> {
                let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE status = ?1 ORDER BY id ASC"))?;
                let rows = stmt
                    .query_map(params![status.as_str()], read_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(into_request).collect()
            })
            .await
            .map_err(Error::from)
    }

    /// The oldest pending entry, if any.
    pub async fn next_pending(&self) -> Result<Option<QueuedRequest>, Error> {
        self.conn
            .call(|conn| -> Result<Option<QueuedRequest>, Error> {
                let mut stmt =
                    conn.prepare(&format!("{SELECT_COLUMNS} WHERE status = 'pending' ORDER BY id ASC LIMIT 1"))?;
                match stmt.query_row([], read_row) {
                    Ok(row) => into_request(row).map(Some),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(Error::from)
    }

    /// Get a single entry by id.
    pub async fn get_queued(&self, id: i64) -> Result<Option<QueuedRequest>, Error> {
        self.conn
            .call(move |conn| -> Result<Option<QueuedRequest>, Error> {
                let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE id = ?1"))?;
                match stmt.query_row(params![id], read_row) {
                    Ok(row) => into_request(row).map(Some),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(Error::from)
    }

    /// Remove an entry after a confirmed replay. Returns whether it existed.
    pub async fn remove_from_queue(&self, id: i64) -> Result<bool, Error> {
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let count = conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![id])?;
                Ok(count > 0)
            })
            .await
            .map_err(Error::from)
    }

    /// Add `attempts` to an entry's attempt count and store the latest error.
    pub async fn record_attempts(&self, id: i64, attempts: u32, last_error: Option<&str>) -> Result<(), Error> {
        let last_error = last_error.map(str::to_string);
        self.conn
            .call(move |conn| -> Result<(), Error> {
                let count = conn.execute(
                    "UPDATE sync_queue
                    SET attempt_count = attempt_count + ?2, last_error = COALESCE(?3, last_error)
                    WHERE id = ?1",
                    params![id, attempts, last_error],
                )?;
                if count == 0 {
                    return Err(Error::QueueEntryNotFound(id));
                }
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Move a pending entry to `failed`. It stays listed until dismissed.
    pub async fn mark_failed(&self, id: i64, reason: &str) -> Result<(), Error> {
        let reason = reason.to_string();
        let failed_at = format_timestamp(now());
        self.conn
            .call(move |conn| -> Result<(), Error> {
                let count = conn.execute(
                    "UPDATE sync_queue SET status = 'failed', last_error = ?2, failed_at = ?3
                    WHERE id = ?1 AND status = 'pending'",
                    params![id, reason, failed_at],
                )?;
                if count == 0 {
                    return Err(Error::QueueEntryNotFound(id));
                }
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Put a failed entry back in line with a fresh attempt budget. It keeps
    /// its id, so it replays in its original position relative to other
    /// pending entries.
    pub async fn requeue_failed(&self, id: i64) -> Result<(), Error> {
        self.conn
            .call(move |conn| -> Result<(), Error> {
                let count = conn.execute(
                    "UPDATE sync_queue SET status = 'pending', failed_at = NULL, attempt_count = 0
                    WHERE id = ?1 AND status = 'failed'",
                    params![id],
                )?;
                if count == 0 {
                    return Err(Error::QueueEntryNotFound(id));
                }
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Delete a failed entry the user has acknowledged.
    pub async fn dismiss_failed(&self, id: i64) -> Result<(), Error> {
        self.conn
            .call(move |conn| -> Result<(), Error> {
                let count = conn.execute("DELETE FROM sync_queue WHERE id = ?1 AND status = 'failed'", params![id])?;
                if count == 0 {
                    return Err(Error::QueueEntryNotFound(id));
                }
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Pending and failed entry counts.
    pub async fn queue_counts(&self) -> Result<QueueCounts, Error> {
        self.conn
            .call(|conn| -> Result<QueueCounts, Error> {
                let (pending, failed): (i64, i64) = conn.query_row(
                    "SELECT
                        COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0)
                    FROM sync_queue",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                Ok(QueueCounts { pending: pending as u64, failed: failed as u64 })
            })
            .await
            .map_err(Error::from)
    }

    pub async fn pending_count(&self) -> Result<u64, Error> {
        Ok(self.queue_counts().await?.pending)
    }

    pub async fn failed_count(&self) -> Result<u64, Error> {
        Ok(self.queue_counts().await?.failed)
    }

    /// Delete every queue entry. Returns the number deleted.
    pub async fn clear_queue(&self) -> Result<u64, Error> {
        self.conn
            .call(|conn| -> Result<u64, Error> {
                let count = conn.execute("DELETE FROM sync_queue", [])?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }
}
