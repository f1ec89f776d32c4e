use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

use super::Clock;
use super::quota::{UsageSnapshot, UsageWindow};
use super::store::{AccountingStore, StoreError};
use super::store_types::{NewUsage, UsageRecord};
use super::subscriptions::{Tier, TierLimits};

/// What happens when a usage row cannot be written after the work was done.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeteringPolicy {
    /// The request fails; nothing is served without a usage row.
    #[default]
    Strict,
    /// The response is served and the failure is logged.
    Lenient,
}

impl std::str::FromStr for MeteringPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(MeteringPolicy::Strict),
            "lenient" => Ok(MeteringPolicy::Lenient),
            other => Err(format!("unknown metering policy: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageSummary {
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<TierLimits>,
    pub usage: UsageSnapshot,
    pub window: UsageWindow,
}

/// Append-only writer for the usage log. Timestamps handed out by one writer never
/// go backwards, even if the wall clock does.
pub struct UsageLog {
    store: Arc<dyn AccountingStore>,
    clock: Arc<dyn Clock>,
    last_ts_ms: AtomicI64,
}

impl UsageLog {
    pub fn new(store: Arc<dyn AccountingStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            last_ts_ms: AtomicI64::new(i64::MIN),
        }
    }

    pub fn next_timestamp(&self) -> i64 {
        let now = self.clock.now_epoch_millis();
        let previous = self.last_ts_ms.fetch_max(now, Ordering::AcqRel);
        previous.max(now)
    }

    pub async fn append(&self, usage: &NewUsage) -> Result<UsageRecord, StoreError> {
        let ts_ms = self.next_timestamp();
        self.store.append_usage(usage, ts_ms).await
    }

    pub async fn recent(
        &self,
        account_id: &str,
        since_ms: Option<i64>,
        limit: usize,
    ) -> Result<Vec<UsageRecord>, StoreError> {
        self.store.list_usage(account_id, since_ms, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ManualClock;
    use crate::gateway::memory_store::MemoryStore;
    use crate::gateway::store_types::NewAccount;

    #[test]
    fn metering_policy_parses() {
        assert_eq!("STRICT".parse::<MeteringPolicy>(), Ok(MeteringPolicy::Strict));
        assert_eq!("lenient".parse::<MeteringPolicy>(), Ok(MeteringPolicy::Lenient));
        assert!("sometimes".parse::<MeteringPolicy>().is_err());
    }

    #[tokio::test]
    async fn timestamps_do_not_go_backwards() {
        let clock = Arc::new(ManualClock::new(10_000));
        let store: Arc<dyn AccountingStore> = Arc::new(MemoryStore::new());
        let account = store
            .create_account(&NewAccount::default(), 0)
            .await
            .unwrap();
        let log = UsageLog::new(store, clock.clone());
        let usage = NewUsage {
            account_id: account.id.clone(),
            credential_id: None,
            operation: "/api/v1/generate".to_string(),
            units: 3,
            latency_ms: 2,
            status_code: 200,
        };

        let first = log.append(&usage).await.unwrap();
        clock.set(5_000);
        let second = log.append(&usage).await.unwrap();
        assert_eq!(first.ts_ms, 10_000);
        assert_eq!(second.ts_ms, 10_000);

        let rows = log.recent(&account.id, None, 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| row.units == 3));
    }
}
