use async_trait::async_trait;
use thiserror::Error;

use super::quota::{AdmissionDecision, UsageSnapshot, UsageWindow};
use super::store_types::{
    Account, CredentialRecord, NewAccount, NewSubscription, NewUsage, ReservationRecord,
    SubscriptionRecord, UsageRecord,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[cfg(feature = "store-sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid stored value: {0}")]
    Corrupt(String),
    #[error("account not found: {0}")]
    AccountNotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable state shared by every request handler: accounts, credentials,
/// subscriptions, the usage log and pending admissions.
///
/// Implementations only aggregate over explicit windows; admission decisions are
/// made by [`super::quota::decide`] so every backend enforces the same rules.
#[async_trait]
pub trait AccountingStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn create_account(&self, account: &NewAccount, now_ms: i64)
    -> Result<Account, StoreError>;

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>, StoreError>;

    /// Removes the account with its credentials, subscriptions and pending
    /// reservations. Usage rows keep the account id and lose their credential link.
    async fn delete_account(&self, account_id: &str) -> Result<bool, StoreError>;

    async fn insert_credential(&self, credential: &CredentialRecord) -> Result<(), StoreError>;

    async fn find_credential_by_digest(
        &self,
        key_digest: &str,
    ) -> Result<Option<CredentialRecord>, StoreError>;

    async fn touch_credential(&self, credential_id: &str, now_ms: i64) -> Result<(), StoreError>;

    async fn deactivate_credential(&self, credential_id: &str) -> Result<bool, StoreError>;

    async fn list_credentials(&self, account_id: &str)
    -> Result<Vec<CredentialRecord>, StoreError>;

    /// Deactivates the current active subscription and inserts the new one as the
    /// only active row, atomically.
    async fn replace_active_subscription(
        &self,
        subscription: &NewSubscription,
        now_ms: i64,
    ) -> Result<SubscriptionRecord, StoreError>;

    async fn deactivate_subscriptions(&self, account_id: &str, now_ms: i64)
    -> Result<u64, StoreError>;

    async fn active_subscriptions(
        &self,
        account_id: &str,
    ) -> Result<Vec<SubscriptionRecord>, StoreError>;

    async fn append_usage(&self, usage: &NewUsage, ts_ms: i64) -> Result<UsageRecord, StoreError>;

    /// Sums units over the monthly window and counts requests over the rate window,
    /// including admissions that are reserved but not yet committed.
    async fn usage_snapshot(
        &self,
        account_id: &str,
        window: &UsageWindow,
    ) -> Result<UsageSnapshot, StoreError>;

    async fn list_usage(
        &self,
        account_id: &str,
        since_ms: Option<i64>,
        limit: usize,
    ) -> Result<Vec<UsageRecord>, StoreError>;

    /// Reads limits and usage, decides, and records a reservation when admitted,
    /// as one isolated step.
    async fn reserve_admission(
        &self,
        reservation: &ReservationRecord,
        window: &UsageWindow,
    ) -> Result<AdmissionDecision, StoreError>;

    /// Turns a reservation into a usage row. Returns `None` when the reservation
    /// is unknown (already committed, rolled back or reaped).
    async fn commit_admission(
        &self,
        request_id: &str,
        usage: &NewUsage,
        ts_ms: i64,
    ) -> Result<Option<UsageRecord>, StoreError>;

    async fn rollback_admission(&self, request_id: &str) -> Result<bool, StoreError>;

    /// Drops reservations created before `older_than_ms` (requests that never
    /// completed). Returns how many were removed.
    async fn reap_reservations(&self, older_than_ms: i64) -> Result<u64, StoreError>;
}
