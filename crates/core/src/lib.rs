//! Core types and shared functionality for harbor.
//!
//! This crate provides:
//! - Durable store (response cache + sync queue) with SQLite backend
//! - Unified error types
//! - Configuration structures

pub mod config;
pub mod error;
pub mod store;

pub use config::AppConfig;
pub use error::{Error, ErrorClass};
pub use store::{CacheStats, CachedEntry, NewQueuedRequest, QueueCounts, QueueStatus, QueuedRequest, Store};
