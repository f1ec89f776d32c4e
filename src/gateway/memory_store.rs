use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::keys::generate_id;
use super::quota::{AdmissionDecision, UsageSnapshot, UsageWindow, decide};
use super::store::{AccountingStore, StoreError};
use super::store_types::{
    Account, CredentialRecord, NewAccount, NewSubscription, NewUsage, ReservationRecord,
    SubscriptionRecord, UsageRecord,
};
use super::subscriptions::select_current;

/// Process-local store. Backs demo mode and tests; every operation runs under one
/// lock so reservations are as isolated as the SQLite store's.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

#[derive(Debug, Default)]
struct Tables {
    accounts: BTreeMap<String, Account>,
    credentials: BTreeMap<String, CredentialRecord>,
    subscriptions: Vec<SubscriptionRecord>,
    usage: Vec<UsageRecord>,
    reservations: BTreeMap<String, ReservationRecord>,
    next_subscription_id: i64,
    next_usage_id: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an account with a caller-chosen id. Used to seed fixed demo data.
    pub fn insert_account(&self, account: Account) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        if tables.accounts.contains_key(&account.id) {
            return Err(StoreError::Conflict(format!(
                "account already exists: {}",
                account.id
            )));
        }
        tables.accounts.insert(account.id.clone(), account);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl Tables {
    fn snapshot(&self, account_id: &str, window: &UsageWindow) -> UsageSnapshot {
        let mut snapshot = UsageSnapshot::default();
        let usage = self
            .usage
            .iter()
            .filter(|row| row.account_id == account_id)
            .map(|row| (row.ts_ms, row.units));
        let pending = self
            .reservations
            .values()
            .filter(|row| row.account_id == account_id)
            .map(|row| (row.ts_ms, row.units));
        for (ts_ms, units) in usage.chain(pending) {
            if window.in_month(ts_ms) {
                snapshot.monthly_units = snapshot.monthly_units.saturating_add(units);
            }
            if window.in_rate_window(ts_ms) {
                snapshot.recent_requests = snapshot.recent_requests.saturating_add(1);
            }
        }
        snapshot
    }

    fn active_subscriptions(&self, account_id: &str) -> Vec<SubscriptionRecord> {
        self.subscriptions
            .iter()
            .filter(|row| row.account_id == account_id && row.active)
            .cloned()
            .collect()
    }

    fn deactivate_subscriptions(&mut self, account_id: &str, now_ms: i64) -> u64 {
        let mut changed = 0;
        for row in self
            .subscriptions
            .iter_mut()
            .filter(|row| row.account_id == account_id && row.active)
        {
            row.active = false;
            row.period_end_ms = Some(now_ms);
            changed += 1;
        }
        changed
    }

    fn push_usage(&mut self, usage: &NewUsage, ts_ms: i64) -> UsageRecord {
        self.next_usage_id += 1;
        let record = UsageRecord {
            id: self.next_usage_id,
            account_id: usage.account_id.clone(),
            credential_id: usage.credential_id.clone(),
            operation: usage.operation.clone(),
            units: usage.units,
            latency_ms: usage.latency_ms,
            status_code: usage.status_code,
            ts_ms,
        };
        self.usage.push(record.clone());
        record
    }
}

#[async_trait]
impl AccountingStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn create_account(
        &self,
        account: &NewAccount,
        now_ms: i64,
    ) -> Result<Account, StoreError> {
        let mut tables = self.lock()?;
        if let Some(email) = account.email.as_deref() {
            if tables
                .accounts
                .values()
                .any(|existing| existing.email.as_deref() == Some(email))
            {
                return Err(StoreError::Conflict(format!("email already registered: {email}")));
            }
        }
        let record = Account {
            id: generate_id("acct"),
            email: account.email.clone(),
            billing_customer_id: account.billing_customer_id.clone(),
            created_at_ms: now_ms,
        };
        tables.accounts.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>, StoreError> {
        Ok(self.lock()?.accounts.get(account_id).cloned())
    }

    async fn delete_account(&self, account_id: &str) -> Result<bool, StoreError> {
        let mut tables = self.lock()?;
        if tables.accounts.remove(account_id).is_none() {
            return Ok(false);
        }
        let removed: Vec<String> = tables
            .credentials
            .values()
            .filter(|row| row.account_id == account_id)
            .map(|row| row.id.clone())
            .collect();
        for id in &removed {
            tables.credentials.remove(id);
        }
        for row in tables.usage.iter_mut() {
            if row
                .credential_id
                .as_ref()
                .is_some_and(|id| removed.contains(id))
            {
                row.credential_id = None;
            }
        }
        tables.subscriptions.retain(|row| row.account_id != account_id);
        tables.reservations.retain(|_, row| row.account_id != account_id);
        Ok(true)
    }

    async fn insert_credential(&self, credential: &CredentialRecord) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        if !tables.accounts.contains_key(&credential.account_id) {
            return Err(StoreError::AccountNotFound(credential.account_id.clone()));
        }
        if tables
            .credentials
            .values()
            .any(|row| row.key_digest == credential.key_digest)
        {
            return Err(StoreError::Conflict("credential digest already exists".to_string()));
        }
        tables
            .credentials
            .insert(credential.id.clone(), credential.clone());
        Ok(())
    }

    async fn find_credential_by_digest(
        &self,
        key_digest: &str,
    ) -> Result<Option<CredentialRecord>, StoreError> {
        Ok(self
            .lock()?
            .credentials
            .values()
            .find(|row| row.key_digest == key_digest)
            .cloned())
    }

    async fn touch_credential(&self, credential_id: &str, now_ms: i64) -> Result<(), StoreError> {
        if let Some(row) = self.lock()?.credentials.get_mut(credential_id) {
            row.last_used_at_ms = Some(now_ms);
        }
        Ok(())
    }

    async fn deactivate_credential(&self, credential_id: &str) -> Result<bool, StoreError> {
        let mut tables = self.lock()?;
        match tables.credentials.get_mut(credential_id) {
            Some(row) if row.active => {
                row.active = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_credentials(
        &self,
        account_id: &str,
    ) -> Result<Vec<CredentialRecord>, StoreError> {
        let mut rows: Vec<CredentialRecord> = self
            .lock()?
            .credentials
            .values()
            .filter(|row| row.account_id == account_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.created_at_ms, &a.id).cmp(&(b.created_at_ms, &b.id)));
        Ok(rows)
    }

    async fn replace_active_subscription(
        &self,
        subscription: &NewSubscription,
        now_ms: i64,
    ) -> Result<SubscriptionRecord, StoreError> {
        let mut tables = self.lock()?;
        if !tables.accounts.contains_key(&subscription.account_id) {
            return Err(StoreError::AccountNotFound(subscription.account_id.clone()));
        }
        tables.deactivate_subscriptions(&subscription.account_id, now_ms);
        tables.next_subscription_id += 1;
        let record = SubscriptionRecord {
            id: tables.next_subscription_id,
            account_id: subscription.account_id.clone(),
            tier: subscription.tier,
            monthly_unit_limit: subscription.limits.monthly_units,
            per_minute_limit: subscription.limits.requests_per_minute,
            active: true,
            period_start_ms: now_ms,
            period_end_ms: None,
            billing_subscription_id: subscription.billing_subscription_id.clone(),
            created_at_ms: now_ms,
        };
        tables.subscriptions.push(record.clone());
        Ok(record)
    }

    async fn deactivate_subscriptions(
        &self,
        account_id: &str,
        now_ms: i64,
    ) -> Result<u64, StoreError> {
        Ok(self.lock()?.deactivate_subscriptions(account_id, now_ms))
    }

    async fn active_subscriptions(
        &self,
        account_id: &str,
    ) -> Result<Vec<SubscriptionRecord>, StoreError> {
        Ok(self.lock()?.active_subscriptions(account_id))
    }

    async fn append_usage(&self, usage: &NewUsage, ts_ms: i64) -> Result<UsageRecord, StoreError> {
        Ok(self.lock()?.push_usage(usage, ts_ms))
    }

    async fn usage_snapshot(
        &self,
        account_id: &str,
        window: &UsageWindow,
    ) -> Result<UsageSnapshot, StoreError> {
        Ok(self.lock()?.snapshot(account_id, window))
    }

    async fn list_usage(
        &self,
        account_id: &str,
        since_ms: Option<i64>,
        limit: usize,
    ) -> Result<Vec<UsageRecord>, StoreError> {
        let tables = self.lock()?;
        Ok(tables
            .usage
            .iter()
            .rev()
            .filter(|row| row.account_id == account_id)
            .filter(|row| since_ms.is_none_or(|since| row.ts_ms >= since))
            .take(limit.max(1))
            .cloned()
            .collect())
    }

    async fn reserve_admission(
        &self,
        reservation: &ReservationRecord,
        window: &UsageWindow,
    ) -> Result<AdmissionDecision, StoreError> {
        let mut tables = self.lock()?;
        if tables.reservations.contains_key(&reservation.request_id) {
            return Err(StoreError::Conflict(format!(
                "duplicate request id: {}",
                reservation.request_id
            )));
        }
        let rows = tables.active_subscriptions(&reservation.account_id);
        let limits = select_current(&rows).map(|row| row.limits());
        let decision = decide(limits, tables.snapshot(&reservation.account_id, window));
        if decision.is_admit() {
            tables
                .reservations
                .insert(reservation.request_id.clone(), reservation.clone());
        }
        Ok(decision)
    }

    async fn commit_admission(
        &self,
        request_id: &str,
        usage: &NewUsage,
        ts_ms: i64,
    ) -> Result<Option<UsageRecord>, StoreError> {
        let mut tables = self.lock()?;
        if tables.reservations.remove(request_id).is_none() {
            return Ok(None);
        }
        Ok(Some(tables.push_usage(usage, ts_ms)))
    }

    async fn rollback_admission(&self, request_id: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.reservations.remove(request_id).is_some())
    }

    async fn reap_reservations(&self, older_than_ms: i64) -> Result<u64, StoreError> {
        let mut tables = self.lock()?;
        let before = tables.reservations.len();
        tables
            .reservations
            .retain(|_, row| row.ts_ms >= older_than_ms);
        Ok((before - tables.reservations.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::subscriptions::{Tier, TierLimits};

    fn subscription(account_id: &str, tier: Tier) -> NewSubscription {
        NewSubscription {
            account_id: account_id.to_string(),
            tier,
            limits: tier.default_limits(),
            billing_subscription_id: None,
        }
    }

    #[tokio::test]
    async fn replacing_subscription_leaves_one_active_row() {
        let store = MemoryStore::new();
        let account = store.create_account(&NewAccount::default(), 1).await.unwrap();
        store
            .replace_active_subscription(&subscription(&account.id, Tier::Free), 10)
            .await
            .unwrap();
        let upgraded = store
            .replace_active_subscription(&subscription(&account.id, Tier::Studio), 20)
            .await
            .unwrap();

        let active = store.active_subscriptions(&account.id).await.unwrap();
        assert_eq!(active, vec![upgraded]);
        assert_eq!(
            active[0].limits(),
            TierLimits {
                monthly_units: 10_000_000,
                requests_per_minute: 10_000
            }
        );
    }

    #[tokio::test]
    async fn duplicate_email_is_a_conflict() {
        let store = MemoryStore::new();
        let account = NewAccount {
            email: Some("dev@example.com".to_string()),
            billing_customer_id: None,
        };
        store.create_account(&account, 1).await.unwrap();
        assert!(matches!(
            store.create_account(&account, 2).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn reaping_drops_only_stale_reservations() {
        let store = MemoryStore::new();
        let account = store.create_account(&NewAccount::default(), 1).await.unwrap();
        store
            .replace_active_subscription(&subscription(&account.id, Tier::Free), 1)
            .await
            .unwrap();
        for (request_id, now_ms) in [("old", 1_000), ("new", 9_000)] {
            let window = UsageWindow::at(now_ms).unwrap();
            let reservation = ReservationRecord {
                request_id: request_id.to_string(),
                account_id: account.id.clone(),
                units: 1,
                ts_ms: now_ms,
            };
            assert!(
                store
                    .reserve_admission(&reservation, &window)
                    .await
                    .unwrap()
                    .is_admit()
            );
        }

        assert_eq!(store.reap_reservations(5_000).await.unwrap(), 1);
        assert!(!store.rollback_admission("old").await.unwrap());
        assert!(store.rollback_admission("new").await.unwrap());
    }
}
