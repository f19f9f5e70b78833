//! Shared atomic counters: the traffic counter and the PDF emission counts.
//!
//! Counters live behind [`CounterStore`] so that every worker and admission
//! path, in any process, increments the same value. Increments must be a
//! single atomic primitive of the backing store (`INCRBY` in Redis,
//! `fetch_add` in memory).

use async_trait::async_trait;
use dashmap::DashMap;
use redis::{aio::ConnectionManager, AsyncCommands};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Key of the monthly output traffic counter, in bytes.
pub const TRAFFIC_KEY: &str = "monthly:traffic:bytes";

pub const PDF_TOTAL_KEY: &str = "pdf:total";
pub const PDF_WEEK_KEY: &str = "pdf:week";
pub const PDF_MONTH_KEY: &str = "pdf:month";

#[derive(Debug, Error)]
pub enum CounterError {
    #[error("counter store unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically adds `by` to `key` and returns the new value.
    async fn increment(&self, key: &str, by: u64) -> Result<u64, CounterError>;

    async fn read(&self, key: &str) -> Result<u64, CounterError>;

    async fn reset(&self, key: &str) -> Result<(), CounterError>;
}

/// In-process counters, for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryCounters {
    values: DashMap<String, AtomicU64>,
}

impl MemoryCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounters {
    async fn increment(&self, key: &str, by: u64) -> Result<u64, CounterError> {
        if let Some(value) = self.values.get(key) {
            return Ok(value.fetch_add(by, Ordering::SeqCst) + by);
        }
        let entry = self.values.entry(key.to_string()).or_default();
        Ok(entry.fetch_add(by, Ordering::SeqCst) + by)
    }

    async fn read(&self, key: &str) -> Result<u64, CounterError> {
        Ok(self
            .values
            .get(key)
            .map(|value| value.load(Ordering::SeqCst))
            .unwrap_or(0))
    }

    async fn reset(&self, key: &str) -> Result<(), CounterError> {
        if let Some(value) = self.values.get(key) {
            value.store(0, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Redis-backed counters shared by every process using the same server.
#[derive(Clone)]
pub struct RedisCounters {
    conn: ConnectionManager,
}

impl RedisCounters {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl CounterStore for RedisCounters {
    async fn increment(&self, key: &str, by: u64) -> Result<u64, CounterError> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, by).await?)
    }

    async fn read(&self, key: &str) -> Result<u64, CounterError> {
        let mut conn = self.conn.clone();
        let value: Option<u64> = conn.get(key).await?;
        Ok(value.unwrap_or(0))
    }

    async fn reset(&self, key: &str) -> Result<(), CounterError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, 0u64).await?;
        Ok(())
    }
}

/// Lifetime, weekly and monthly PDF counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PdfCounts {
    pub total: u64,
    pub week: u64,
    pub month: u64,
}

/// Emission counters incremented once per successfully produced PDF.
#[derive(Clone)]
pub struct PdfCounters {
    store: Arc<dyn CounterStore>,
}

impl PdfCounters {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    pub async fn increment(&self) -> Result<PdfCounts, CounterError> {
        Ok(PdfCounts {
            total: self.store.increment(PDF_TOTAL_KEY, 1).await?,
            week: self.store.increment(PDF_WEEK_KEY, 1).await?,
            month: self.store.increment(PDF_MONTH_KEY, 1).await?,
        })
    }

    pub async fn snapshot(&self) -> Result<PdfCounts, CounterError> {
        Ok(PdfCounts {
            total: self.store.read(PDF_TOTAL_KEY).await?,
            week: self.store.read(PDF_WEEK_KEY).await?,
            month: self.store.read(PDF_MONTH_KEY).await?,
        })
    }

    pub async fn reset_weekly(&self) -> Result<(), CounterError> {
        self.store.reset(PDF_WEEK_KEY).await?;
        info!("Weekly PDF counter reset");
        Ok(())
    }

    pub async fn reset_monthly(&self) -> Result<(), CounterError> {
        self.store.reset(PDF_MONTH_KEY).await?;
        info!("Monthly PDF counter reset");
        Ok(())
    }
}
