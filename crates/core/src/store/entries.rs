//! Response cache operations.
//!
//! Provides the key-value half of the store: one entry per canonical request
//! identity, overwritten on every successful GET and removed by age-based
//! cleanup.

use super::connection::Store;
use super::{format_timestamp, now, parse_timestamp};
use crate::Error;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite;

/// A cached response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedEntry {
    pub key: String,
    pub method: String,
    pub url: String,
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub cached_at: DateTime<Utc>,
}

impl CachedEntry {
    /// Build an entry stamped with the current time.
    pub fn new(
        key: impl Into<String>, method: impl Into<String>, url: impl Into<String>, status_code: u16,
        headers: Vec<(String, String)>, body: Vec<u8>,
    ) -> Self {
        Self {
            key: key.into(),
            method: method.into(),
            url: url.into(),
            status_code,
            headers,
            body,
            cached_at: now(),
        }
    }

    /// How long ago the entry was stored. Clock skew reads as zero.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.cached_at).max(Duration::zero())
    }

    /// Whether the entry is older than `max_age` and must not be served.
    pub fn is_expired(&self, max_age: Duration) -> bool {
        self.age() > max_age
    }
}

/// Aggregate size of the response cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: u64,
    pub total_bytes: u64,
}

impl Store {
    /// Insert or overwrite the entry for `entry.key`.
    ///
    /// Last writer wins by completion time.
    pub async fn put_entry(&self, entry: &CachedEntry) -> Result<(), Error> {
        let entry = entry.clone();
        let headers_json = serde_json::to_string(&entry.headers)?;
        let cached_at = format_timestamp(entry.cached_at);
        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute(
                    "INSERT INTO response_cache (cache_key, method, url, status_code, headers_json, body, cached_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    ON CONFLICT(cache_key) DO UPDATE SET
                        method = excluded.method,
                        url = excluded.url,
                        status_code = excluded.status_code,
                        headers_json = excluded.headers_json,
                        body = excluded.body,
                        cached_at = excluded.cached_at",
                    params![entry.key, entry.method, entry.url, entry.status_code, headers_json, entry.body, cached_at],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Get the entry stored under `key`, if any.
    pub async fn get_entry(&self, key: &str) -> Result<Option<CachedEntry>, Error> {
        let key = key.to_string();
        self.conn
            .call(move |conn| -> Result<Option<CachedEntry>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT cache_key, method, url, status_code, headers_json, body, cached_at
                    FROM response_cache WHERE cache_key = ?1",
                )?;

                let result = stmt.query_row(params![key], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, u16>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Vec<u8>>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                });

                match result {
                    Ok((key, method, url, status_code, headers_json, body, cached_at)) => Ok(Some(CachedEntry {
                        key,
                        method,
                        url,
                        status_code,
                        headers: serde_json::from_str(&headers_json)?,
                        body,
                        cached_at: parse_timestamp(&cached_at)?,
                    })),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(Error::from)
    }

    /// Delete the entry stored under `key`. Returns whether one existed.
    pub async fn delete_entry(&self, key: &str) -> Result<bool, Error> {
        let key = key.to_string();
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let count = conn.execute("DELETE FROM response_cache WHERE cache_key = ?1", params![key])?;
                Ok(count > 0)
            })
            .await
            .map_err(Error::from)
    }

    /// Delete entries older than `max_age`.
    ///
    /// Returns the number of deleted entries.
    pub async fn purge_expired_entries(&self, max_age: Duration) -> Result<u64, Error> {
        let Some(cutoff) = Utc::now().checked_sub_signed(max_age) else {
            return Ok(0);
        };
        let cutoff = format_timestamp(cutoff);
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let count = conn.execute("DELETE FROM response_cache WHERE cached_at < ?1", params![cutoff])?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }

    /// Delete every cached response.
    pub async fn purge_all_entries(&self) -> Result<u64, Error> {
        self.conn
            .call(|conn| -> Result<u64, Error> {
                let count = conn.execute("DELETE FROM response_cache", [])?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }

    /// Count cached responses and their stored body size.
    pub async fn cache_stats(&self) -> Result<CacheStats, Error> {
        self.conn
            .call(|conn| -> Result<CacheStats, Error> {
                let (entries, total_bytes): (i64, i64) = conn.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(LENGTH(body)), 0) FROM response_cache",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                Ok(CacheStats { entries: entries as u64, total_bytes: total_bytes as u64 })
            })
            .await
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::hash::compute_cache_key;

    fn make_entry(url: &str, body: &str) -> CachedEntry {
        CachedEntry::new(
            compute_cache_key("GET", url, None),
            "GET",
            url,
            200,
            vec![("content-type".to_string(), "application/json".to_string())],
            body.as_bytes().to_vec(),
        )
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = Store::open_in_memory().await.unwrap();
        let entry = make_entry("https://example.com/api/weather", "{\"temp\":12}");

        store.put_entry(&entry).await.unwrap();

        let retrieved = store.get_entry(&entry.key).await.unwrap().unwrap();
        assert_eq!(retrieved.body, entry.body);
        assert_eq!(retrieved.headers, entry.headers);
        assert_eq!(retrieved.status_code, 200);
        assert_eq!(retrieved.cached_at, entry.cached_at);
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(store.get_entry("cache:GET:nonexistent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_overwrites_single_entry() {
        let store = Store::open_in_memory().await.unwrap();
        let url = "https://example.com/api/emergency";
        store.put_entry(&make_entry(url, "old")).await.unwrap();
        store.put_entry(&make_entry(url, "new")).await.unwrap();

        let key = compute_cache_key("GET", url, None);
        let retrieved = store.get_entry(&key).await.unwrap().unwrap();
        assert_eq!(retrieved.body, b"new");
        assert_eq!(store.cache_stats().await.unwrap().entries, 1);
    }

    #[tokio::test]
    async fn test_delete_entry() {
        let store = Store::open_in_memory().await.unwrap();
        let entry = make_entry("https://example.com", "x");
        store.put_entry(&entry).await.unwrap();

        assert!(store.delete_entry(&entry.key).await.unwrap());
        assert!(!store.delete_entry(&entry.key).await.unwrap());
        assert!(store.get_entry(&entry.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = Store::open_in_memory().await.unwrap();
        let mut old = make_entry("https://example.com/old", "old");
        old.cached_at = Utc::now() - Duration::days(8);
        let fresh = make_entry("https://example.com/fresh", "fresh");
        store.put_entry(&old).await.unwrap();
        store.put_entry(&fresh).await.unwrap();

        let deleted = store.purge_expired_entries(Duration::days(7)).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_entry(&old.key).await.unwrap().is_none());
        assert!(store.get_entry(&fresh.key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cache_stats() {
        let store = Store::open_in_memory().await.unwrap();
        store.put_entry(&make_entry("https://example.com/a", "1234")).await.unwrap();
        store.put_entry(&make_entry("https://example.com/b", "56")).await.unwrap();

        let stats = store.cache_stats().await.unwrap();
        assert_eq!(stats, CacheStats { entries: 2, total_bytes: 6 });

        assert_eq!(store.purge_all_entries().await.unwrap(), 2);
        assert_eq!(store.cache_stats().await.unwrap(), CacheStats::default());
    }

    #[test]
    fn test_entry_expiry() {
        let mut entry = make_entry("https://example.com", "x");
        assert!(!entry.is_expired(Duration::days(7)));

        entry.cached_at = Utc::now() - Duration::days(7) - Duration::minutes(1);
        assert!(entry.is_expired(Duration::days(7)));
    }
}
