//! GoldenSeed API: deterministic block generation served over HTTP, metered per
//! account against subscription tiers.

pub mod gateway;

pub use gateway::{
    AccountingStore, Gateway, GatewayConfig, GatewayError, MeteringPolicy, StoreError, Tier,
    TierLimits,
};
