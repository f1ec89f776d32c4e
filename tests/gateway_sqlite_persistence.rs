#![cfg(feature = "store-sqlite")]

use std::sync::Arc;

use goldenseed_api::gateway::quota::UsageWindow;
use goldenseed_api::gateway::{
    AccountingStore, CreateAccountRequest, Gateway, GatewayConfig, GatewayError, GatewayMode,
    GenerateRequest, ManualClock, SqliteStore, Tier, TierLimits, TierTable,
};

// 2026-03-10T00:00:00Z
const NOW_MS: i64 = 1_773_100_800_000;

fn config_for(path: &std::path::Path, tiers: TierTable) -> GatewayConfig {
    GatewayConfig {
        sqlite_path: Some(path.to_path_buf()),
        tiers,
        ..GatewayConfig::default()
    }
}

fn generate_request(chunks: u32) -> GenerateRequest {
    GenerateRequest {
        seed: 7,
        chunks,
        format: Default::default(),
        skip: 0,
    }
}

fn indie_account() -> CreateAccountRequest {
    CreateAccountRequest {
        email: Some("persist@example.com".to_string()),
        billing_customer_id: None,
        tier: Some(Tier::Indie),
        issue_key: true,
        key_name: Some("primary".to_string()),
    }
}

#[tokio::test]
async fn accounts_keys_and_usage_survive_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("goldenseed.sqlite");
    let config = config_for(&db_path, TierTable::default());

    let secret;
    let account_id;
    {
        let store = SqliteStore::new(&db_path);
        store.init().await.expect("init");
        let gateway = Gateway::with_clock(
            Arc::new(store),
            &config,
            Arc::new(ManualClock::new(NOW_MS)),
        );
        assert_eq!(gateway.mode(), GatewayMode::Production);
        assert_eq!(gateway.store_backend(), "sqlite");

        let created = gateway.create_account(indie_account()).await.expect("create");
        account_id = created.account.id.clone();
        secret = created.key.expect("issued key").secret;

        let caller = gateway.authenticate(&secret).await.expect("auth");
        gateway
            .generate(&caller, "req-1", generate_request(25))
            .await
            .expect("generate");
    }

    let store = SqliteStore::new(&db_path);
    let gateway = Gateway::with_clock(
        Arc::new(store.clone()),
        &config,
        Arc::new(ManualClock::new(NOW_MS + 1_000)),
    );
    let caller = gateway.authenticate(&secret).await.expect("auth after reopen");
    assert_eq!(caller.account.id, account_id);

    let summary = gateway.usage_summary(&caller).await.expect("summary");
    assert_eq!(summary.tier, Some(Tier::Indie));
    assert_eq!(summary.usage.monthly_units, 25);
    assert_eq!(summary.usage.recent_requests, 1);

    let rows = store.list_usage(&account_id, None, 10).await.expect("usage");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].operation, "/api/v1/generate");
    assert_eq!(rows[0].status_code, 200);
    assert!(store.list_reservations().await.expect("reservations").is_empty());

    let credentials = store.list_credentials(&account_id).await.expect("credentials");
    assert_eq!(credentials.len(), 1);
    assert_eq!(credentials[0].last_used_at_ms, Some(NOW_MS + 1_000));
}

#[tokio::test]
async fn concurrent_requests_never_exceed_the_rate_limit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("goldenseed.sqlite");
    let tiers = TierTable::default().with_override(
        Tier::Indie,
        TierLimits {
            monthly_units: 1_000_000,
            requests_per_minute: 5,
        },
    );
    let config = config_for(&db_path, tiers);
    let store = SqliteStore::new(&db_path);
    store.init().await.expect("init");
    let gateway = Arc::new(Gateway::with_clock(
        Arc::new(store.clone()),
        &config,
        Arc::new(ManualClock::new(NOW_MS)),
    ));

    let created = gateway.create_account(indie_account()).await.expect("create");
    let secret = created.key.expect("issued key").secret;
    let caller = gateway.authenticate(&secret).await.expect("auth");

    let mut handles = Vec::new();
    for i in 0..16 {
        let gateway = gateway.clone();
        let caller = caller.clone();
        handles.push(tokio::spawn(async move {
            gateway
                .generate(&caller, &format!("req-{i}"), generate_request(1))
                .await
        }));
    }

    let mut admitted = 0;
    let mut limited = 0;
    for handle in handles {
        match handle.await.expect("join") {
            Ok(_) => admitted += 1,
            Err(GatewayError::RateLimited { limit: 5 }) => limited += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(admitted, 5);
    assert_eq!(limited, 11);

    let window = UsageWindow::at(NOW_MS).expect("window");
    let snapshot = store
        .usage_snapshot(&created.account.id, &window)
        .await
        .expect("snapshot");
    assert_eq!(snapshot.recent_requests, 5);
    assert_eq!(snapshot.monthly_units, 5);
}

#[tokio::test]
async fn deleting_an_account_revokes_its_keys() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("goldenseed.sqlite");
    let config = config_for(&db_path, TierTable::default());
    let store = SqliteStore::new(&db_path);
    store.init().await.expect("init");
    let gateway = Gateway::with_clock(
        Arc::new(store.clone()),
        &config,
        Arc::new(ManualClock::new(NOW_MS)),
    );

    let created = gateway.create_account(indie_account()).await.expect("create");
    let secret = created.key.expect("issued key").secret;
    assert!(gateway.delete_account(&created.account.id).await.expect("delete"));

    assert!(matches!(
        gateway.authenticate(&secret).await,
        Err(GatewayError::InvalidCredential)
    ));
    assert!(store
        .get_account(&created.account.id)
        .await
        .expect("get")
        .is_none());
}
