use serde::{Deserialize, Serialize};

use super::subscriptions::{Tier, TierLimits};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_customer_id: Option<String>,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NewAccount {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_customer_id: Option<String>,
}

/// Stored form of an issued credential. Only the digest of the secret is kept.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub id: String,
    pub account_id: String,
    #[serde(default, skip_serializing)]
    pub key_digest: String,
    pub key_prefix: String,
    pub name: String,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at_ms: Option<i64>,
    pub created_at_ms: i64,
}

impl std::fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("id", &self.id)
            .field("account_id", &self.account_id)
            .field("key_digest", &"<redacted>")
            .field("key_prefix", &self.key_prefix)
            .field("name", &self.name)
            .field("active", &self.active)
            .field("expires_at_ms", &self.expires_at_ms)
            .field("last_used_at_ms", &self.last_used_at_ms)
            .field("created_at_ms", &self.created_at_ms)
            .finish()
    }
}

impl CredentialRecord {
    pub fn is_usable_at(&self, now_ms: i64) -> bool {
        self.active && self.expires_at_ms.is_none_or(|expires| expires > now_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: i64,
    pub account_id: String,
    pub tier: Tier,
    pub monthly_unit_limit: u64,
    pub per_minute_limit: u32,
    pub active: bool,
    pub period_start_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_end_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_subscription_id: Option<String>,
    pub created_at_ms: i64,
}

impl SubscriptionRecord {
    pub fn limits(&self) -> TierLimits {
        TierLimits {
            monthly_units: self.monthly_unit_limit,
            requests_per_minute: self.per_minute_limit,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewSubscription {
    pub account_id: String,
    pub tier: Tier,
    pub limits: TierLimits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_subscription_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: i64,
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<String>,
    pub operation: String,
    pub units: u64,
    pub latency_ms: u64,
    pub status_code: u16,
    pub ts_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewUsage {
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<String>,
    pub operation: String,
    pub units: u64,
    pub latency_ms: u64,
    pub status_code: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRecord {
    pub request_id: String,
    pub account_id: String,
    pub units: u64,
    pub ts_ms: i64,
}

pub(crate) fn units_to_i64(units: u64) -> i64 {
    if units > i64::MAX as u64 {
        i64::MAX
    } else {
        units as i64
    }
}

pub(crate) fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}
