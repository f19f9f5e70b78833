//! Periodic maintenance: counter resets and reclaim of uncollected jobs.

use chrono::{DateTime, Datelike, Utc, Weekday};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::counters::{CounterStore, PdfCounters};
use crate::quota::QuotaGuard;
use crate::store::JobStore;

/// Prefix of the per-period markers recording a completed reset.
const RESET_MARKER_PREFIX: &str = "maintenance:reset";

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub monthly_reset: bool,
    pub weekly_reset: bool,
    pub purged: usize,
}

/// Runs hourly. Resets the monthly traffic and `pdf:month` counters on the
/// first day of a month, `pdf:week` on a Monday, and purges stale jobs on
/// every tick.
///
/// Each reset is recorded under a per-period marker in the counter store,
/// so it happens once per period across every process and restart. A
/// failed reset drops its marker and is attempted again on the next tick
/// of the same day.
pub struct Janitor {
    counters: Arc<dyn CounterStore>,
    quota: QuotaGuard,
    pdf_counters: PdfCounters,
    store: Arc<dyn JobStore>,
}

impl Janitor {
    pub fn new(
        counters: Arc<dyn CounterStore>,
        quota: QuotaGuard,
        pdf_counters: PdfCounters,
        store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            counters,
            quota,
            pdf_counters,
            store,
        }
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        if now.day() == 1 {
            let marker = monthly_marker(now);
            if self.claim_period(&marker).await {
                report.monthly_reset = self.reset_monthly().await;
                if !report.monthly_reset {
                    self.drop_claim(&marker).await;
                }
            }
        }
        if now.weekday() == Weekday::Mon {
            let marker = weekly_marker(now);
            if self.claim_period(&marker).await {
                report.weekly_reset = self.reset_weekly().await;
                if !report.weekly_reset {
                    self.drop_claim(&marker).await;
                }
            }
        }

        match self.store.purge_stale(now).await {
            Ok(purged) => {
                if purged > 0 {
                    info!("Cleanup: removed {} stale jobs", purged);
                }
                report.purged = purged;
            }
            Err(err) => error!("Job cleanup failed: {}", err),
        }

        report
    }

    /// True for exactly one caller per marker until the claim is dropped.
    async fn claim_period(&self, marker: &str) -> bool {
        match self.counters.increment(marker, 1).await {
            Ok(claims) => claims == 1,
            Err(err) => {
                error!("Failed to claim counter reset {}: {}", marker, err);
                false
            }
        }
    }

    async fn drop_claim(&self, marker: &str) {
        if let Err(err) = self.counters.reset(marker).await {
            warn!("Failed to drop counter reset claim {}: {}", marker, err);
        }
    }

    async fn reset_monthly(&self) -> bool {
        let last_month = self.quota.usage().await.unwrap_or_default();
        if let Err(err) = self.quota.reset().await {
            error!("Failed to reset monthly traffic counter: {}", err);
            return false;
        }
        info!(
            "Last month traffic: {:.2} GB",
            last_month as f64 / (1u64 << 30) as f64
        );
        if let Err(err) = self.pdf_counters.reset_monthly().await {
            error!("Failed to reset monthly PDF counter: {}", err);
        }
        true
    }

    async fn reset_weekly(&self) -> bool {
        match self.pdf_counters.reset_weekly().await {
            Ok(()) => true,
            Err(err) => {
                error!("Failed to reset weekly PDF counter: {}", err);
                false
            }
        }
    }
}

fn monthly_marker(now: DateTime<Utc>) -> String {
    format!("{}:monthly:{}", RESET_MARKER_PREFIX, now.format("%Y-%m"))
}

fn weekly_marker(now: DateTime<Utc>) -> String {
    let week = now.iso_week();
    format!(
        "{}:weekly:{}-W{:02}",
        RESET_MARKER_PREFIX,
        week.year(),
        week.week()
    )
}
