use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::store::{AccountingStore, StoreError};
use super::store_types::{NewSubscription, SubscriptionRecord};
use super::{Clock, GatewayError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Indie,
    Studio,
    Enterprise,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Free, Tier::Indie, Tier::Studio, Tier::Enterprise];

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Indie => "indie",
            Tier::Studio => "studio",
            Tier::Enterprise => "enterprise",
        }
    }

    pub fn default_limits(self) -> TierLimits {
        let (monthly_units, requests_per_minute) = match self {
            Tier::Free => (10_000, 100),
            Tier::Indie => (1_000_000, 1_000),
            Tier::Studio => (10_000_000, 10_000),
            Tier::Enterprise => (100_000_000, 100_000),
        };
        TierLimits {
            monthly_units,
            requests_per_minute,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown tier: {0}")]
pub struct UnknownTier(pub String);

impl FromStr for Tier {
    type Err = UnknownTier;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        Tier::ALL
            .into_iter()
            .find(|tier| tier.as_str() == normalized)
            .ok_or_else(|| UnknownTier(raw.to_string()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub monthly_units: u64,
    pub requests_per_minute: u32,
}

/// Limits applied when a subscription is created for a tier. Tiers left unset in
/// config fall back to [`Tier::default_limits`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TierTable {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free: Option<TierLimits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indie: Option<TierLimits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub studio: Option<TierLimits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enterprise: Option<TierLimits>,
}

impl TierTable {
    pub fn with_override(mut self, tier: Tier, limits: TierLimits) -> Self {
        *self.slot_mut(tier) = Some(limits);
        self
    }

    pub fn limits(&self, tier: Tier) -> TierLimits {
        let configured = match tier {
            Tier::Free => self.free,
            Tier::Indie => self.indie,
            Tier::Studio => self.studio,
            Tier::Enterprise => self.enterprise,
        };
        configured.unwrap_or_else(|| tier.default_limits())
    }

    fn slot_mut(&mut self, tier: Tier) -> &mut Option<TierLimits> {
        match tier {
            Tier::Free => &mut self.free,
            Tier::Indie => &mut self.indie,
            Tier::Studio => &mut self.studio,
            Tier::Enterprise => &mut self.enterprise,
        }
    }
}

/// Picks the authoritative row among active subscriptions: latest `created_at_ms`,
/// then highest id. The store should never hold more than one, but reads stay
/// deterministic if it does.
pub fn select_current(rows: &[SubscriptionRecord]) -> Option<&SubscriptionRecord> {
    rows.iter()
        .filter(|row| row.active)
        .max_by_key(|row| (row.created_at_ms, row.id))
}

#[derive(Clone)]
pub struct SubscriptionLedger {
    store: Arc<dyn AccountingStore>,
    clock: Arc<dyn Clock>,
    tiers: TierTable,
}

impl SubscriptionLedger {
    pub fn new(store: Arc<dyn AccountingStore>, clock: Arc<dyn Clock>, tiers: TierTable) -> Self {
        Self {
            store,
            clock,
            tiers,
        }
    }

    pub async fn current(
        &self,
        account_id: &str,
    ) -> Result<Option<SubscriptionRecord>, StoreError> {
        let rows = self.store.active_subscriptions(account_id).await?;
        if rows.len() > 1 {
            tracing::warn!(
                account_id,
                active_rows = rows.len(),
                "multiple active subscriptions; using the most recent"
            );
        }
        Ok(select_current(&rows).cloned())
    }

    pub async fn current_limits(&self, account_id: &str) -> Result<TierLimits, GatewayError> {
        self.current(account_id)
            .await?
            .map(|row| row.limits())
            .ok_or(GatewayError::NoSubscription)
    }

    /// Supersedes the active subscription (if any) with a new one for `tier`.
    pub async fn subscribe(
        &self,
        account_id: &str,
        tier: Tier,
        billing_subscription_id: Option<String>,
    ) -> Result<SubscriptionRecord, StoreError> {
        let subscription = NewSubscription {
            account_id: account_id.to_string(),
            tier,
            limits: self.tiers.limits(tier),
            billing_subscription_id,
        };
        let record = self
            .store
            .replace_active_subscription(&subscription, self.clock.now_epoch_millis())
            .await?;
        tracing::info!(account_id, tier = %tier, subscription_id = record.id, "subscription activated");
        Ok(record)
    }

    pub async fn cancel(&self, account_id: &str) -> Result<u64, StoreError> {
        self.store
            .deactivate_subscriptions(account_id, self.clock.now_epoch_millis())
            .await
    }
}
