use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::quota::DenyReason;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilitySnapshot {
    pub requests: u64,
    pub admitted: u64,
    pub invalid_credential: u64,
    pub no_subscription: u64,
    pub rate_limited: u64,
    pub quota_exceeded: u64,
    pub metering_failures: u64,
    pub units_generated: u64,
}

#[derive(Debug, Default)]
pub struct Observability {
    requests: AtomicU64,
    admitted: AtomicU64,
    invalid_credential: AtomicU64,
    no_subscription: AtomicU64,
    rate_limited: AtomicU64,
    quota_exceeded: AtomicU64,
    metering_failures: AtomicU64,
    units_generated: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl Observability {
    pub fn record_request(&self) {
        bump(&self.requests, 1);
    }

    pub fn record_admitted(&self) {
        bump(&self.admitted, 1);
    }

    pub fn record_invalid_credential(&self) {
        bump(&self.invalid_credential, 1);
    }

    pub fn record_denied(&self, reason: &DenyReason) {
        match reason {
            DenyReason::NoSubscription => bump(&self.no_subscription, 1),
            DenyReason::RateLimited { .. } => bump(&self.rate_limited, 1),
            DenyReason::QuotaExceeded { .. } => bump(&self.quota_exceeded, 1),
        }
    }

    pub fn record_metering_failure(&self) {
        bump(&self.metering_failures, 1);
    }

    pub fn record_units(&self, units: u64) {
        bump(&self.units_generated, units);
    }

    pub fn snapshot(&self) -> ObservabilitySnapshot {
        ObservabilitySnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            invalid_credential: self.invalid_credential.load(Ordering::Relaxed),
            no_subscription: self.no_subscription.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            quota_exceeded: self.quota_exceeded.load(Ordering::Relaxed),
            metering_failures: self.metering_failures.load(Ordering::Relaxed),
            units_generated: self.units_generated.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denials_land_in_their_own_counter() {
        let obs = Observability::default();
        obs.record_request();
        obs.record_denied(&DenyReason::NoSubscription);
        obs.record_denied(&DenyReason::RateLimited {
            limit: 1,
            recent_requests: 1,
        });
        obs.record_denied(&DenyReason::QuotaExceeded { limit: 1, used: 1 });
        obs.record_units(40);
        obs.record_units(2);

        let snapshot = obs.snapshot();
        assert_eq!(snapshot.requests, 1);
        assert_eq!(snapshot.no_subscription, 1);
        assert_eq!(snapshot.rate_limited, 1);
        assert_eq!(snapshot.quota_exceeded, 1);
        assert_eq!(snapshot.units_generated, 42);
        assert_eq!(snapshot.admitted, 0);
    }
}
