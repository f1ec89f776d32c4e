//! Usage-metered generation gateway.
//!
//! A request presents a bearer credential, is admitted against the owning
//! account's subscription limits, runs the generator, and leaves exactly one row in
//! the usage log. All shared state lives behind [`store::AccountingStore`].

pub mod config;
pub mod generator;
pub mod http;
pub mod keys;
pub mod memory_store;
pub mod observability;
pub mod quota;
#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;
pub mod store;
pub mod store_types;
pub mod subscriptions;
pub mod telemetry;
pub mod usage;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use generator::{
    BlockData, CoinflipStats, Generator, GeneratorError, HashChainGenerator, OutputFormat,
    coinflip_stats, last_position, verification_hash, verification_url,
};
use keys::{KeyStore, hash_secret};
use memory_store::MemoryStore;
use observability::{Observability, ObservabilitySnapshot};
use quota::{AdmissionDecision, DenyReason, QuotaEvaluator};
use store_types::{Account, CredentialRecord, NewAccount, NewUsage, SubscriptionRecord};
use subscriptions::SubscriptionLedger;
use usage::UsageLog;

pub use config::{ConfigError, GatewayConfig, RequestLimits};
pub use keys::{IssuedCredential, ResolvedCredential};
pub use store::{AccountingStore, StoreError};
pub use subscriptions::{Tier, TierLimits, TierTable};
pub use usage::{MeteringPolicy, UsageSummary};

#[cfg(feature = "store-sqlite")]
pub use sqlite_store::SqliteStore;

pub const GENERATE_OPERATION: &str = "/api/v1/generate";
pub const BATCH_OPERATION: &str = "/api/v1/batch";

pub const DEMO_ACCOUNT_ID: &str = "demo-user";
pub const DEMO_CREDENTIAL_ID: &str = "demo-key";
pub const DEMO_SECRET: &str = "gs_demo_key_12345";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid or expired credential")]
    InvalidCredential,
    #[error("no active subscription")]
    NoSubscription,
    #[error("rate limit exceeded: {limit} requests/minute")]
    RateLimited { limit: u32 },
    #[error("monthly unit limit exceeded: used {used} of {limit}")]
    QuotaExceeded { limit: u64, used: u64 },
    #[error("metering unavailable: {0}")]
    MeteringUnavailable(#[source] StoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("generation failed: {0}")]
    Generator(#[from] GeneratorError),
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl From<DenyReason> for GatewayError {
    fn from(reason: DenyReason) -> Self {
        match reason {
            DenyReason::NoSubscription => GatewayError::NoSubscription,
            DenyReason::RateLimited { limit, .. } => GatewayError::RateLimited { limit },
            DenyReason::QuotaExceeded { limit, used } => {
                GatewayError::QuotaExceeded { limit, used }
            }
        }
    }
}

fn invalid_request(reason: impl Into<String>) -> GatewayError {
    GatewayError::InvalidRequest {
        reason: reason.into(),
    }
}

pub trait Clock: Send + Sync {
    fn now_epoch_millis(&self) -> i64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_millis(&self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0));
        i64::try_from(now.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Settable clock for tests and replay.
#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by_ms: i64) {
        self.now_ms.fetch_add(by_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_epoch_millis(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn generate_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    format!("gs-{ts_ms}-{seq}")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayMode {
    Production,
    Demo,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_chunks")]
    pub chunks: u32,
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default)]
    pub skip: u64,
}

fn default_chunks() -> u32 {
    100
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub data: BlockData,
    pub hash: String,
    pub chunks_generated: u32,
    pub seed: u64,
    pub verification_url: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchRequest {
    pub seeds: Vec<u64>,
    #[serde(default = "default_chunks")]
    pub chunks_per_seed: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchResponse {
    pub results: Vec<GenerateResponse>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoinflipRequest {
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_flips")]
    pub flips: u32,
}

fn default_flips() -> u32 {
    100_000
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateAccountRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    #[serde(default = "default_issue_key")]
    pub issue_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,
}

fn default_issue_key() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountCreated {
    pub account: Account,
    pub subscription: SubscriptionRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<IssuedCredential>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountOverview {
    pub account: Account,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionRecord>,
    pub credentials: Vec<CredentialRecord>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub tier: Tier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_subscription_id: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IssueKeyRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<i64>,
}

pub struct Gateway {
    store: Arc<dyn AccountingStore>,
    clock: Arc<dyn Clock>,
    keys: KeyStore,
    ledger: SubscriptionLedger,
    meter: Meter,
    generator: Arc<dyn Generator>,
    limits: RequestLimits,
    verify_base_url: String,
    mode: GatewayMode,
}

impl Gateway {
    pub fn new(store: Arc<dyn AccountingStore>, config: &GatewayConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn AccountingStore>,
        config: &GatewayConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mode = if config.is_demo() {
            GatewayMode::Demo
        } else {
            GatewayMode::Production
        };
        Self {
            keys: KeyStore::new(store.clone(), clock.clone()),
            ledger: SubscriptionLedger::new(store.clone(), clock.clone(), config.tiers.clone()),
            meter: Meter {
                quota: QuotaEvaluator::new(store.clone(), clock.clone()),
                usage: Arc::new(UsageLog::new(store.clone(), clock.clone())),
                observability: Arc::new(Observability::default()),
                policy: config.metering,
            },
            generator: Arc::new(HashChainGenerator::default()),
            limits: config.limits,
            verify_base_url: config.verify_base_url.clone(),
            mode,
            store,
            clock,
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn mode(&self) -> GatewayMode {
        self.mode
    }

    pub fn store_backend(&self) -> &'static str {
        self.store.backend_name()
    }

    pub fn generator_name(&self) -> &'static str {
        self.generator.name()
    }

    pub fn observability(&self) -> ObservabilitySnapshot {
        self.meter.observability.snapshot()
    }

    pub async fn authenticate(&self, secret: &str) -> Result<ResolvedCredential, GatewayError> {
        self.meter.observability.record_request();
        match self.keys.resolve(secret).await {
            Ok(resolved) => Ok(resolved),
            Err(GatewayError::InvalidCredential) => {
                self.meter.observability.record_invalid_credential();
                Err(GatewayError::InvalidCredential)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn generate(
        &self,
        caller: &ResolvedCredential,
        request_id: &str,
        request: GenerateRequest,
    ) -> Result<GenerateResponse, GatewayError> {
        let max = self.limits.max_chunks;
        if request.chunks == 0 || request.chunks > max {
            return Err(invalid_request(format!("chunks must be between 1 and {max}")));
        }
        let start = request
            .seed
            .checked_add(request.skip)
            .ok_or_else(|| invalid_request("seed + skip overflows"))?;
        if last_position(start, u64::from(request.chunks)).is_none() {
            return Err(invalid_request("seed + skip + chunks overflows the stream"));
        }

        let generator = self.generator.clone();
        let base_url = self.verify_base_url.clone();
        self.metered(
            caller,
            request_id,
            GENERATE_OPERATION,
            u64::from(request.chunks),
            move || {
                let blocks = generator.blocks(start, request.chunks as usize)?;
                Ok(render(&blocks, request.seed, request.format, &base_url))
            },
        )
        .await
    }

    /// All seeds are admitted together as one request worth `seeds x chunks_per_seed`
    /// units; output is always hex.
    pub async fn batch(
        &self,
        caller: &ResolvedCredential,
        request_id: &str,
        request: BatchRequest,
    ) -> Result<BatchResponse, GatewayError> {
        let max_seeds = self.limits.max_batch_seeds as usize;
        if request.seeds.is_empty() || request.seeds.len() > max_seeds {
            return Err(invalid_request(format!(
                "seeds must contain between 1 and {max_seeds} entries"
            )));
        }
        let max_chunks = self.limits.max_chunks_per_seed;
        if request.chunks_per_seed == 0 || request.chunks_per_seed > max_chunks {
            return Err(invalid_request(format!(
                "chunks_per_seed must be between 1 and {max_chunks}"
            )));
        }

        let chunks = u64::from(request.chunks_per_seed);
        if let Some(seed) = request
            .seeds
            .iter()
            .find(|seed| last_position(**seed, chunks).is_none())
        {
            return Err(invalid_request(format!(
                "seed {seed} + chunks_per_seed overflows the stream"
            )));
        }

        let units = request.seeds.len() as u64 * chunks;
        let generator = self.generator.clone();
        let base_url = self.verify_base_url.clone();
        self.metered(caller, request_id, BATCH_OPERATION, units, move || {
            let mut results = Vec::with_capacity(request.seeds.len());
            for seed in &request.seeds {
                let blocks = generator.blocks(*seed, request.chunks_per_seed as usize)?;
                results.push(render(&blocks, *seed, OutputFormat::Hex, &base_url));
            }
            Ok(BatchResponse { results })
        })
        .await
    }

    /// Unmetered demonstration endpoint.
    pub async fn coinflip(&self, request: CoinflipRequest) -> Result<CoinflipStats, GatewayError> {
        let max = self.limits.max_flips;
        if request.flips == 0 || request.flips > max {
            return Err(invalid_request(format!("flips must be between 1 and {max}")));
        }
        let generator = self.generator.clone();
        let blocks = tokio::task::spawn_blocking(move || {
            generator.blocks(request.seed, request.flips as usize)
        })
        .await
        .map_err(|err| GatewayError::Internal {
            message: err.to_string(),
        })??;
        Ok(coinflip_stats(&blocks))
    }

    /// Reads usage without consuming quota.
    pub async fn usage_summary(
        &self,
        caller: &ResolvedCredential,
    ) -> Result<UsageSummary, GatewayError> {
        let account_id = caller.account.id.as_str();
        let window = self.meter.quota.window()?;
        let usage = self.store.usage_snapshot(account_id, &window).await?;
        let current = self.ledger.current(account_id).await?;
        Ok(UsageSummary {
            account_id: account_id.to_string(),
            tier: current.as_ref().map(|row| row.tier),
            limits: current.as_ref().map(|row| row.limits()),
            usage,
            window,
        })
    }

    /// Runs the metered sequence on its own task. Dropping the returned future
    /// leaves the task running, so the reservation is always committed or released.
    async fn metered<T, F>(
        &self,
        caller: &ResolvedCredential,
        request_id: &str,
        operation: &'static str,
        units: u64,
        work: F,
    ) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, GeneratorError> + Send + 'static,
    {
        let meter = self.meter.clone();
        let caller = caller.clone();
        let request_id = request_id.to_string();
        tokio::spawn(async move { meter.run(&caller, &request_id, operation, units, work).await })
            .await
            .map_err(|err| GatewayError::Internal {
                message: err.to_string(),
            })?
    }

    pub async fn create_account(
        &self,
        request: CreateAccountRequest,
    ) -> Result<AccountCreated, GatewayError> {
        let now_ms = self.clock.now_epoch_millis();
        let account = self
            .store
            .create_account(
                &NewAccount {
                    email: request.email,
                    billing_customer_id: request.billing_customer_id,
                },
                now_ms,
            )
            .await?;
        let tier = request.tier.unwrap_or(Tier::Free);
        let subscription = self.ledger.subscribe(&account.id, tier, None).await?;
        let key = if request.issue_key {
            Some(self.keys.issue(&account.id, request.key_name, None).await?)
        } else {
            None
        };
        tracing::info!(account_id = %account.id, tier = %tier, "account created");
        Ok(AccountCreated {
            account,
            subscription,
            key,
        })
    }

    pub async fn account_overview(&self, account_id: &str) -> Result<AccountOverview, GatewayError> {
        let Some(account) = self.store.get_account(account_id).await? else {
            return Err(StoreError::AccountNotFound(account_id.to_string()).into());
        };
        let subscription = self.ledger.current(account_id).await?;
        let credentials = self.keys.list(account_id).await?;
        Ok(AccountOverview {
            account,
            subscription,
            credentials,
        })
    }

    pub async fn delete_account(&self, account_id: &str) -> Result<bool, GatewayError> {
        let deleted = self.store.delete_account(account_id).await?;
        if deleted {
            tracing::info!(account_id, "account deleted");
        }
        Ok(deleted)
    }

    pub async fn change_subscription(
        &self,
        account_id: &str,
        request: SubscribeRequest,
    ) -> Result<SubscriptionRecord, GatewayError> {
        Ok(self
            .ledger
            .subscribe(account_id, request.tier, request.billing_subscription_id)
            .await?)
    }

    pub async fn cancel_subscription(&self, account_id: &str) -> Result<u64, GatewayError> {
        Ok(self.ledger.cancel(account_id).await?)
    }

    pub async fn issue_key(
        &self,
        account_id: &str,
        request: IssueKeyRequest,
    ) -> Result<IssuedCredential, GatewayError> {
        self.keys
            .issue(account_id, request.name, request.expires_at_ms)
            .await
    }

    pub async fn deactivate_key(&self, credential_id: &str) -> Result<bool, GatewayError> {
        Ok(self.keys.deactivate(credential_id).await?)
    }

    /// Drops reservations older than `older_than_ms`, i.e. those left behind by
    /// requests that never committed or rolled back.
    pub async fn reap_reservations(&self, older_than_ms: i64) -> Result<u64, GatewayError> {
        let cutoff = self.clock.now_epoch_millis().saturating_sub(older_than_ms);
        let reaped = self.store.reap_reservations(cutoff).await?;
        if reaped > 0 {
            tracing::warn!(reaped, "reaped stale admission reservations");
        }
        Ok(reaped)
    }
}

/// The reserve-to-commit half of a metered request.
#[derive(Clone)]
struct Meter {
    quota: QuotaEvaluator,
    usage: Arc<UsageLog>,
    observability: Arc<Observability>,
    policy: MeteringPolicy,
}

impl Meter {
    /// Reserve, run `work` off the async runtime, then turn the reservation into a
    /// usage row. Failed work is still recorded, with zero units and status 500.
    async fn run<T, F>(
        &self,
        caller: &ResolvedCredential,
        request_id: &str,
        operation: &'static str,
        units: u64,
        work: F,
    ) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, GeneratorError> + Send + 'static,
    {
        let account_id = caller.account.id.as_str();
        let decision = match self.quota.reserve(request_id, account_id, units).await {
            Ok(decision) => decision,
            Err(err) => {
                self.observability.record_metering_failure();
                tracing::error!(account_id, request_id, error = %err, "admission check failed");
                return Err(GatewayError::MeteringUnavailable(err));
            }
        };
        if let AdmissionDecision::Deny(reason) = decision {
            self.observability.record_denied(&reason);
            tracing::debug!(account_id, request_id, ?reason, "request denied");
            return Err(reason.into());
        }
        self.observability.record_admitted();
        tracing::debug!(account_id, request_id, units, "request admitted");

        let started = Instant::now();
        let outcome = tokio::task::spawn_blocking(work).await;
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let (result, units_used, status_code) = match outcome {
            Ok(Ok(value)) => (Ok(value), units, 200),
            Ok(Err(err)) => (Err(GatewayError::Generator(err)), 0, 500),
            Err(err) => (
                Err(GatewayError::Internal {
                    message: err.to_string(),
                }),
                0,
                500,
            ),
        };

        let usage = NewUsage {
            account_id: account_id.to_string(),
            credential_id: Some(caller.credential_id.clone()),
            operation: operation.to_string(),
            units: units_used,
            latency_ms,
            status_code,
        };
        if let Err(err) = self.record_usage(request_id, &usage).await {
            self.observability.record_metering_failure();
            if let Err(rollback_err) = self.quota.rollback(request_id).await {
                tracing::warn!(request_id, error = %rollback_err, "failed to release reservation");
            }
            match self.policy {
                MeteringPolicy::Strict => {
                    tracing::error!(account_id, request_id, error = %err, "usage write failed; request rejected");
                    return Err(GatewayError::MeteringUnavailable(err));
                }
                MeteringPolicy::Lenient => {
                    tracing::error!(account_id, request_id, error = %err, "usage write failed; response served unmetered");
                }
            }
        }

        if result.is_ok() {
            self.observability.record_units(units_used);
        }
        result
    }

    async fn record_usage(&self, request_id: &str, usage: &NewUsage) -> Result<(), StoreError> {
        let ts_ms = self.usage.next_timestamp();
        if self.quota.commit(request_id, usage, ts_ms).await?.is_some() {
            return Ok(());
        }
        // The reservation was reaped while the work ran.
        tracing::warn!(request_id, "reservation missing at commit; appending usage directly");
        self.usage.append(usage).await.map(|_| ())
    }
}

/// Drops reservations older than `ttl` every `every` until the handle is aborted.
pub fn spawn_reservation_reaper(
    gateway: Arc<Gateway>,
    ttl: Duration,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            if let Err(err) = gateway.reap_reservations(ttl_ms).await {
                tracing::warn!(error = %err, "reservation reaper pass failed");
            }
        }
    })
}

fn render(
    blocks: &[generator::Block],
    seed: u64,
    format: OutputFormat,
    verify_base_url: &str,
) -> GenerateResponse {
    let hash = verification_hash(blocks);
    GenerateResponse {
        data: BlockData::encode(blocks, format),
        verification_url: verification_url(verify_base_url, &hash),
        hash,
        chunks_generated: blocks.len() as u32,
        seed,
    }
}

/// Seeds the fixed demo account, its well-known key and a free-tier subscription.
pub async fn seed_demo(store: &MemoryStore, tiers: &TierTable, now_ms: i64) -> Result<(), StoreError> {
    store.insert_account(Account {
        id: DEMO_ACCOUNT_ID.to_string(),
        email: Some("demo@goldenseed.io".to_string()),
        billing_customer_id: None,
        created_at_ms: now_ms,
    })?;
    store
        .insert_credential(&CredentialRecord {
            id: DEMO_CREDENTIAL_ID.to_string(),
            account_id: DEMO_ACCOUNT_ID.to_string(),
            key_digest: hash_secret(DEMO_SECRET),
            key_prefix: keys::display_prefix(DEMO_SECRET),
            name: "Demo Key".to_string(),
            active: true,
            expires_at_ms: None,
            last_used_at_ms: None,
            created_at_ms: now_ms,
        })
        .await?;
    store
        .replace_active_subscription(
            &store_types::NewSubscription {
                account_id: DEMO_ACCOUNT_ID.to_string(),
                tier: Tier::Free,
                limits: tiers.limits(Tier::Free),
                billing_subscription_id: None,
            },
            now_ms,
        )
        .await?;
    tracing::info!(account_id = DEMO_ACCOUNT_ID, "demo account seeded");
    Ok(())
}
