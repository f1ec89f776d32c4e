//! Admission control over the usage log.
//!
//! Two limits apply to every account with an active subscription: a per-minute
//! request count over a trailing 60 second window, and a monthly unit sum over the
//! current UTC calendar month. The month "resets" only because the window moves;
//! nothing is ever zeroed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime};

use super::store::{AccountingStore, StoreError};
use super::store_types::{NewUsage, ReservationRecord, UsageRecord};
use super::subscriptions::TierLimits;
use super::Clock;

pub const RATE_WINDOW_MS: i64 = 60_000;

/// Aggregation bounds for a single admission check, all in epoch milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageWindow {
    pub now_ms: i64,
    /// Inclusive.
    pub month_start_ms: i64,
    /// Exclusive.
    pub month_end_ms: i64,
    /// Exclusive lower bound of the rate window. The window has no upper bound:
    /// rows stamped after `now_ms` (the clock stepped back) still count as recent.
    pub rate_after_ms: i64,
}

impl UsageWindow {
    pub fn at(now_ms: i64) -> Result<Self, StoreError> {
        let (month_start_ms, month_end_ms) = month_bounds(now_ms)?;
        Ok(Self {
            now_ms,
            month_start_ms,
            month_end_ms,
            rate_after_ms: now_ms.saturating_sub(RATE_WINDOW_MS),
        })
    }

    pub fn in_month(&self, ts_ms: i64) -> bool {
        ts_ms >= self.month_start_ms && ts_ms < self.month_end_ms
    }

    pub fn in_rate_window(&self, ts_ms: i64) -> bool {
        ts_ms > self.rate_after_ms
    }
}

/// `[first instant of the month, first instant of the next month)` in UTC.
pub fn month_bounds(now_ms: i64) -> Result<(i64, i64), StoreError> {
    let now = OffsetDateTime::from_unix_timestamp_nanos(i128::from(now_ms) * 1_000_000)
        .map_err(|err| StoreError::Corrupt(format!("timestamp {now_ms} out of range: {err}")))?;
    let start = first_of_month(now.year(), now.month())?;
    let (next_year, next_month) = match now.month() {
        Month::December => (now.year() + 1, Month::January),
        month => (now.year(), month.next()),
    };
    let end = first_of_month(next_year, next_month)?;
    Ok((start, end))
}

fn first_of_month(year: i32, month: Month) -> Result<i64, StoreError> {
    let date = Date::from_calendar_date(year, month, 1)
        .map_err(|err| StoreError::Corrupt(format!("invalid month start: {err}")))?;
    let nanos = date.midnight().assume_utc().unix_timestamp_nanos();
    Ok((nanos / 1_000_000) as i64)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub monthly_units: u64,
    pub recent_requests: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenyReason {
    NoSubscription,
    RateLimited { limit: u32, recent_requests: u64 },
    QuotaExceeded { limit: u64, used: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AdmissionDecision {
    Admit,
    Deny(DenyReason),
}

impl AdmissionDecision {
    pub fn is_admit(&self) -> bool {
        matches!(self, AdmissionDecision::Admit)
    }
}

/// The admission rule. The rate limit is checked before the monthly quota so a
/// throttled client sees a retryable outcome first.
pub fn decide(limits: Option<TierLimits>, usage: UsageSnapshot) -> AdmissionDecision {
    let Some(limits) = limits else {
        return AdmissionDecision::Deny(DenyReason::NoSubscription);
    };

    if usage.recent_requests >= u64::from(limits.requests_per_minute) {
        return AdmissionDecision::Deny(DenyReason::RateLimited {
            limit: limits.requests_per_minute,
            recent_requests: usage.recent_requests,
        });
    }

    if usage.monthly_units >= limits.monthly_units {
        return AdmissionDecision::Deny(DenyReason::QuotaExceeded {
            limit: limits.monthly_units,
            used: usage.monthly_units,
        });
    }

    AdmissionDecision::Admit
}

#[derive(Clone)]
pub struct QuotaEvaluator {
    store: Arc<dyn AccountingStore>,
    clock: Arc<dyn Clock>,
}

impl QuotaEvaluator {
    pub fn new(store: Arc<dyn AccountingStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn window(&self) -> Result<UsageWindow, StoreError> {
        UsageWindow::at(self.clock.now_epoch_millis())
    }

    pub async fn snapshot(&self, account_id: &str) -> Result<UsageSnapshot, StoreError> {
        let window = self.window()?;
        self.store.usage_snapshot(account_id, &window).await
    }

    /// Read-then-decide. Nothing is held between the read and the caller acting on
    /// the result, so concurrent callers can all pass; use [`Self::reserve`] when
    /// limits must hold under concurrency.
    pub async fn check_and_admit(&self, account_id: &str) -> Result<AdmissionDecision, StoreError> {
        let window = self.window()?;
        let usage = self.store.usage_snapshot(account_id, &window).await?;
        let rows = self.store.active_subscriptions(account_id).await?;
        let limits = super::subscriptions::select_current(&rows).map(|row| row.limits());
        Ok(decide(limits, usage))
    }

    /// Atomic admission: on `Admit` a reservation for `units` is held under
    /// `request_id` and counts against both limits until committed or rolled back.
    pub async fn reserve(
        &self,
        request_id: &str,
        account_id: &str,
        units: u64,
    ) -> Result<AdmissionDecision, StoreError> {
        let window = self.window()?;
        let reservation = ReservationRecord {
            request_id: request_id.to_string(),
            account_id: account_id.to_string(),
            units,
            ts_ms: window.now_ms,
        };
        self.store.reserve_admission(&reservation, &window).await
    }

    pub async fn commit(
        &self,
        request_id: &str,
        usage: &NewUsage,
        ts_ms: i64,
    ) -> Result<Option<UsageRecord>, StoreError> {
        self.store.commit_admission(request_id, usage, ts_ms).await
    }

    pub async fn rollback(&self, request_id: &str) -> Result<bool, StoreError> {
        self.store.rollback_admission(request_id).await
    }
}
