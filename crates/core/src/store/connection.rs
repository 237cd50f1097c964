//! Database connection management with pragma configuration.
//!
//! This module handles opening the SQLite database, applying the pragmas the
//! store relies on for cross-process safety (WAL mode, busy timeout), and
//! running migrations.

use super::migrations;
use crate::Error;
use std::path::Path;
use tokio_rusqlite::Connection;

/// How long a writer waits on a lock held by another process before failing.
const BUSY_TIMEOUT_MS: u32 = 5_000;

/// Durable store handle.
///
/// Wraps a tokio-rusqlite Connection that runs database operations on a
/// background thread. Cloning is cheap and shares the connection.
#[derive(Clone, Debug)]
pub struct Store {
    pub(crate) conn: Connection,
}

impl Store {
    /// Open a database at the specified path.
    ///
    /// Creates the file (and its parent directory) if it doesn't exist,
    /// applies pragmas, and runs any pending migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::StorageUnavailable(format!("failed to create {}: {e}", parent.display())))?;
        }

        let conn = Connection::open(path).await.map_err(Error::from)?;
        Self::init(conn).await
    }

    /// Open an in-memory database for testing.
    pub async fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory().await.map_err(Error::from)?;
        Self::init(conn).await
    }

    /// Close the underlying connection. Other clones of this handle fail with
    /// [`Error::StorageUnavailable`] afterwards.
    pub async fn close(self) -> Result<(), Error> {
        self.conn.close().await.map_err(Error::from)
    }

    async fn init(conn: Connection) -> Result<Self, Error> {
        conn.call(|conn| -> Result<(), Error> {
            conn.execute_batch(&format!(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;
                 PRAGMA temp_store=MEMORY;
                 PRAGMA foreign_keys=ON;
                 PRAGMA busy_timeout={BUSY_TIMEOUT_MS};"
            ))?;
            Ok(())
        })
        .await
        .map_err(Error::from)?;

        migrations::run(&conn).await?;

        tracing::debug!("durable store ready");
        Ok(Self { conn })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory() {
        let store = Store::open_in_memory().await.unwrap();
        let version = store
            .conn
            .call(|conn| conn.query_row("SELECT sqlite_version()", [], |row| row.get::<_, String>(0)))
            .await
            .unwrap();
        assert!(!version.is_empty());
    }

    #[tokio::test]
    async fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("harbor.sqlite");

        Store::open(&path).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_clone_fails_after_close() {
        let store = Store::open_in_memory().await.unwrap();
        let other = store.clone();
        store.close().await.unwrap();

        let err = other.cache_stats().await.unwrap_err();
        assert!(err.is_storage_unavailable());
    }

    #[tokio::test]
    async fn test_file_store_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("harbor.sqlite")).await.unwrap();
        let mode = store
            .conn
            .call(|conn| conn.query_row("PRAGMA journal_mode", [], |row| row.get::<_, String>(0)))
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
