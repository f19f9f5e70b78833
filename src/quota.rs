//! Monthly output traffic quota.
//!
//! The guard admits new work while `usage + estimate <= effective_limit`,
//! where the effective limit is the configured limit scaled by a safety
//! margin. The estimate is a fixed conservative size because the real
//! output size is only known after rendering; the margin absorbs the error.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::counters::{CounterError, CounterStore, TRAFFIC_KEY};

/// Size assumed for a not-yet-rendered PDF at admission time (2 MiB).
pub const DEFAULT_ESTIMATE_BYTES: u64 = 2 * 1024 * 1024;

const GIB: f64 = (1u64 << 30) as f64;
const TIB: f64 = (1u64 << 40) as f64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrafficState {
    Ok,
    Warning,
    LimitReached,
}

impl TrafficState {
    fn from_percent(percent: f64) -> Self {
        if percent >= 100.0 {
            TrafficState::LimitReached
        } else if percent >= 90.0 {
            TrafficState::Warning
        } else {
            TrafficState::Ok
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrafficUsage {
    pub bytes: u64,
    pub gb: f64,
    pub tb: f64,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrafficRemaining {
    pub bytes: u64,
    pub gb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrafficLimit {
    pub bytes: u64,
    pub gb: f64,
    pub tb: f64,
}

/// Traffic report served to operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficStatus {
    pub usage: TrafficUsage,
    pub remaining: TrafficRemaining,
    pub limit: TrafficLimit,
    pub status: TrafficState,
    pub reset_date: String,
}

#[derive(Clone)]
pub struct QuotaGuard {
    store: Arc<dyn CounterStore>,
    configured_limit: u64,
    effective_limit: u64,
}

impl QuotaGuard {
    pub fn new(store: Arc<dyn CounterStore>, configured_limit: u64, safety_margin: f64) -> Self {
        let effective_limit = (configured_limit as f64 * safety_margin).floor() as u64;
        Self {
            store,
            configured_limit,
            effective_limit,
        }
    }

    pub fn effective_limit(&self) -> u64 {
        self.effective_limit
    }

    pub fn configured_limit(&self) -> u64 {
        self.configured_limit
    }

    pub async fn usage(&self) -> Result<u64, CounterError> {
        self.store.read(TRAFFIC_KEY).await
    }

    pub async fn can_admit(&self, estimated_bytes: u64) -> Result<bool, CounterError> {
        let usage = self.usage().await?;
        Ok(usage.saturating_add(estimated_bytes) <= self.effective_limit)
    }

    /// Adds the exact size of a produced PDF to the traffic counter.
    pub async fn record(&self, bytes: u64) -> Result<u64, CounterError> {
        self.store.increment(TRAFFIC_KEY, bytes).await
    }

    pub async fn remaining(&self) -> Result<u64, CounterError> {
        Ok(self.effective_limit.saturating_sub(self.usage().await?))
    }

    pub async fn usage_percent(&self) -> Result<f64, CounterError> {
        Ok(self.percent_of(self.usage().await?))
    }

    pub async fn reset(&self) -> Result<(), CounterError> {
        self.store.reset(TRAFFIC_KEY).await?;
        info!("Monthly traffic counter reset");
        Ok(())
    }

    pub async fn status(&self) -> Result<TrafficStatus, CounterError> {
        let usage = self.usage().await?;
        let percent = self.percent_of(usage);
        let remaining = self.effective_limit.saturating_sub(usage);

        Ok(TrafficStatus {
            usage: TrafficUsage {
                bytes: usage,
                gb: round_to(usage as f64 / GIB, 2),
                tb: round_to(usage as f64 / TIB, 3),
                percent: round_to(percent, 2),
            },
            remaining: TrafficRemaining {
                bytes: remaining,
                gb: round_to(remaining as f64 / GIB, 2),
            },
            limit: TrafficLimit {
                bytes: self.effective_limit,
                gb: round_to(self.effective_limit as f64 / GIB, 2),
                tb: (self.configured_limit as f64 / TIB).round(),
            },
            status: TrafficState::from_percent(percent),
            reset_date: next_reset_date(Utc::now()).to_string(),
        })
    }

    fn percent_of(&self, usage: u64) -> f64 {
        if self.effective_limit == 0 {
            return 100.0;
        }
        usage as f64 / self.effective_limit as f64 * 100.0
    }
}

/// First day of the month following `now`, when the traffic counter resets.
pub fn next_reset_date(now: DateTime<Utc>) -> NaiveDate {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or_else(|| now.date_naive())
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::MemoryCounters;
    use chrono::TimeZone;

    const TIB_BYTES: u64 = 1 << 40;

    fn guard(limit: u64, margin: f64) -> (QuotaGuard, Arc<MemoryCounters>) {
        let store = Arc::new(MemoryCounters::new());
        (QuotaGuard::new(store.clone(), limit, margin), store)
    }

    #[test]
    fn test_effective_limit_applies_margin() {
        let (guard, _) = guard(20 * TIB_BYTES, 0.95);
        assert_eq!(guard.effective_limit(), 19 * TIB_BYTES);
    }

    #[tokio::test]
    async fn test_can_admit_boundary() {
        let (guard, store) = guard(1_000, 1.0);
        for usage in [0u64, 500, 900, 990, 991, 1_000] {
            store.reset(TRAFFIC_KEY).await.unwrap();
            store.increment(TRAFFIC_KEY, usage).await.unwrap();
            assert_eq!(
                guard.can_admit(10).await.unwrap(),
                usage + 10 <= 1_000,
                "usage={usage}"
            );
        }
    }

    #[tokio::test]
    async fn test_record_accumulates_and_reduces_remaining() {
        let (guard, _) = guard(1_000, 0.5);
        guard.record(100).await.unwrap();
        guard.record(150).await.unwrap();
        assert_eq!(guard.usage().await.unwrap(), 250);
        assert_eq!(guard.remaining().await.unwrap(), 250);
        assert_eq!(guard.usage_percent().await.unwrap(), 50.0);

        guard.record(1_000).await.unwrap();
        assert_eq!(guard.remaining().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_status_report_thresholds() {
        let (guard, _) = guard(1_000, 1.0);
        assert_eq!(guard.status().await.unwrap().status, TrafficState::Ok);
        guard.record(900).await.unwrap();
        assert_eq!(guard.status().await.unwrap().status, TrafficState::Warning);
        guard.record(100).await.unwrap();
        let status = guard.status().await.unwrap();
        assert_eq!(status.status, TrafficState::LimitReached);
        assert_eq!(status.usage.percent, 100.0);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "LIMIT_REACHED");
        assert!(json["resetDate"].is_string());
    }

    #[tokio::test]
    async fn test_reset_clears_usage() {
        let (guard, _) = guard(1_000, 1.0);
        guard.record(700).await.unwrap();
        guard.reset().await.unwrap();
        assert_eq!(guard.usage().await.unwrap(), 0);
    }

    #[test]
    fn test_next_reset_date() {
        let mid_year = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        assert_eq!(next_reset_date(mid_year).to_string(), "2026-11-01");

        let december = Utc.with_ymd_and_hms(2026, 12, 31, 23, 59, 0).unwrap();
        assert_eq!(next_reset_date(december).to_string(), "2027-01-01");
    }
}
