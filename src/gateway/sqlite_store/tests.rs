use super::*;
use crate::gateway::subscriptions::TierLimits;

// 2026-03-01T00:00:00Z
const MARCH_START_MS: i64 = 1_772_323_200_000;

async fn open_store(dir: &tempfile::TempDir) -> SqliteStore {
    let store = SqliteStore::new(dir.path().join("goldenseed.sqlite"));
    store.init().await.expect("init");
    store
}

fn credential(id: &str, account_id: &str, digest: &str) -> CredentialRecord {
    CredentialRecord {
        id: id.to_string(),
        account_id: account_id.to_string(),
        key_digest: digest.to_string(),
        key_prefix: "gs_abcdefg".to_string(),
        name: "Default API Key".to_string(),
        active: true,
        expires_at_ms: None,
        last_used_at_ms: None,
        created_at_ms: 1,
    }
}

fn subscription(account_id: &str, tier: Tier, limits: TierLimits) -> NewSubscription {
    NewSubscription {
        account_id: account_id.to_string(),
        tier,
        limits,
        billing_subscription_id: None,
    }
}

fn usage(account_id: &str, credential_id: Option<&str>, units: u64) -> NewUsage {
    NewUsage {
        account_id: account_id.to_string(),
        credential_id: credential_id.map(str::to_string),
        operation: "/api/v1/generate".to_string(),
        units,
        latency_ms: 1,
        status_code: 200,
    }
}

#[tokio::test]
async fn sqlite_store_round_trips_accounts_and_credentials() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir).await;

    let account = store
        .create_account(
            &NewAccount {
                email: Some("dev@example.com".to_string()),
                billing_customer_id: None,
            },
            10,
        )
        .await
        .expect("create");
    assert_eq!(
        store.get_account(&account.id).await.expect("get"),
        Some(account.clone())
    );

    let duplicate = store
        .create_account(
            &NewAccount {
                email: Some("dev@example.com".to_string()),
                billing_customer_id: None,
            },
            11,
        )
        .await;
    assert!(matches!(duplicate, Err(StoreError::Conflict(_))));

    store
        .insert_credential(&credential("key-1", &account.id, "digest-1"))
        .await
        .expect("insert credential");
    let found = store
        .find_credential_by_digest("digest-1")
        .await
        .expect("find")
        .expect("present");
    assert_eq!(found.id, "key-1");
    assert_eq!(found.key_digest, "digest-1");
    assert!(store
        .find_credential_by_digest("digest-2")
        .await
        .expect("find")
        .is_none());

    let clash = store
        .insert_credential(&credential("key-2", &account.id, "digest-1"))
        .await;
    assert!(matches!(clash, Err(StoreError::Conflict(_))));

    let orphan = store
        .insert_credential(&credential("key-3", "acct_missing", "digest-3"))
        .await;
    assert!(matches!(orphan, Err(StoreError::AccountNotFound(_))));

    store.touch_credential("key-1", 99).await.expect("touch");
    assert!(store.deactivate_credential("key-1").await.expect("deactivate"));
    assert!(!store.deactivate_credential("key-1").await.expect("deactivate again"));
    let listed = store.list_credentials(&account.id).await.expect("list");
    assert_eq!(listed.len(), 1);
    assert!(!listed[0].active);
    assert_eq!(listed[0].last_used_at_ms, Some(99));
}

#[tokio::test]
async fn sqlite_store_keeps_a_single_active_subscription() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir).await;
    let account = store
        .create_account(&NewAccount::default(), 1)
        .await
        .expect("create");

    store
        .replace_active_subscription(
            &subscription(&account.id, Tier::Free, Tier::Free.default_limits()),
            100,
        )
        .await
        .expect("free");
    let studio = store
        .replace_active_subscription(
            &subscription(&account.id, Tier::Studio, Tier::Studio.default_limits()),
            200,
        )
        .await
        .expect("studio");

    let active = store.active_subscriptions(&account.id).await.expect("active");
    assert_eq!(active, vec![studio]);

    let conn = open_connection(store.path.clone()).expect("open");
    let err = conn
        .execute(
            "INSERT INTO subscriptions
                (account_id, tier, monthly_unit_limit, per_minute_limit, active,
                 period_start_ms, created_at_ms)
             VALUES (?1, 'indie', 1, 1, 1, 300, 300)",
            rusqlite::params![account.id],
        )
        .expect_err("second active row must be refused");
    assert_eq!(err.sqlite_error_code(), Some(ErrorCode::ConstraintViolation));

    assert_eq!(
        store
            .deactivate_subscriptions(&account.id, 400)
            .await
            .expect("cancel"),
        1
    );
    assert!(store
        .active_subscriptions(&account.id)
        .await
        .expect("active")
        .is_empty());
}

#[tokio::test]
async fn sqlite_store_snapshot_respects_window_bounds() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir).await;
    let account = store
        .create_account(&NewAccount::default(), 1)
        .await
        .expect("create");

    store
        .append_usage(&usage(&account.id, None, 7), MARCH_START_MS - 1)
        .await
        .expect("february");
    store
        .append_usage(&usage(&account.id, None, 5), MARCH_START_MS)
        .await
        .expect("march start");
    store
        .append_usage(&usage(&account.id, None, 3), MARCH_START_MS + 90_000)
        .await
        .expect("recent");

    let window = UsageWindow::at(MARCH_START_MS + 100_000).expect("window");
    let snapshot = store
        .usage_snapshot(&account.id, &window)
        .await
        .expect("snapshot");
    assert_eq!(snapshot.monthly_units, 8);
    assert_eq!(snapshot.recent_requests, 1);

    let rows = store
        .list_usage(&account.id, Some(MARCH_START_MS), 10)
        .await
        .expect("list");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].units, 3);
}

#[tokio::test]
async fn sqlite_store_counts_rows_stamped_after_now_as_recent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir).await;
    let account = store
        .create_account(&NewAccount::default(), 1)
        .await
        .expect("create");

    let now_ms = MARCH_START_MS + 100_000;
    store
        .append_usage(&usage(&account.id, None, 4), now_ms + 5_000)
        .await
        .expect("ahead of clock");

    let window = UsageWindow::at(now_ms).expect("window");
    let snapshot = store
        .usage_snapshot(&account.id, &window)
        .await
        .expect("snapshot");
    assert_eq!(snapshot.recent_requests, 1);
    assert_eq!(snapshot.monthly_units, 4);
}

#[tokio::test]
async fn sqlite_store_reservations_enforce_limits() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir).await;
    let account = store
        .create_account(&NewAccount::default(), 1)
        .await
        .expect("create");
    store
        .replace_active_subscription(
            &subscription(
                &account.id,
                Tier::Free,
                TierLimits {
                    monthly_units: 100,
                    requests_per_minute: 2,
                },
            ),
            1,
        )
        .await
        .expect("subscribe");

    let now_ms = MARCH_START_MS + 1_000;
    let window = UsageWindow::at(now_ms).expect("window");
    let reserve = |request_id: &str| ReservationRecord {
        request_id: request_id.to_string(),
        account_id: account.id.clone(),
        units: 10,
        ts_ms: now_ms,
    };

    assert!(store
        .reserve_admission(&reserve("r1"), &window)
        .await
        .expect("r1")
        .is_admit());
    assert!(store
        .reserve_admission(&reserve("r2"), &window)
        .await
        .expect("r2")
        .is_admit());
    assert!(matches!(
        store.reserve_admission(&reserve("r3"), &window).await,
        Ok(AdmissionDecision::Deny(crate::gateway::quota::DenyReason::RateLimited { .. }))
    ));
    assert!(matches!(
        store.reserve_admission(&reserve("r1"), &window).await,
        Err(StoreError::Conflict(_))
    ));

    assert!(store.rollback_admission("r2").await.expect("rollback"));
    let committed = store
        .commit_admission("r1", &usage(&account.id, None, 10), now_ms)
        .await
        .expect("commit")
        .expect("reservation present");
    assert_eq!(committed.units, 10);
    assert!(store
        .commit_admission("r1", &usage(&account.id, None, 10), now_ms)
        .await
        .expect("commit again")
        .is_none());

    assert!(store
        .reserve_admission(&reserve("r4"), &window)
        .await
        .expect("r4")
        .is_admit());
    assert_eq!(store.list_reservations().await.expect("list").len(), 1);
    assert_eq!(store.reap_reservations(now_ms + 1).await.expect("reap"), 1);
    assert!(store.list_reservations().await.expect("list").is_empty());
}

#[tokio::test]
async fn sqlite_store_account_deletion_cascades_and_keeps_usage() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir).await;
    let account = store
        .create_account(&NewAccount::default(), 1)
        .await
        .expect("create");
    store
        .insert_credential(&credential("key-1", &account.id, "digest-1"))
        .await
        .expect("credential");
    store
        .replace_active_subscription(
            &subscription(&account.id, Tier::Indie, Tier::Indie.default_limits()),
            2,
        )
        .await
        .expect("subscribe");
    store
        .append_usage(&usage(&account.id, Some("key-1"), 4), 3)
        .await
        .expect("usage");

    assert!(store.delete_account(&account.id).await.expect("delete"));
    assert!(!store.delete_account(&account.id).await.expect("delete again"));
    assert!(store.get_account(&account.id).await.expect("get").is_none());
    assert!(store
        .find_credential_by_digest("digest-1")
        .await
        .expect("find")
        .is_none());
    assert!(store
        .active_subscriptions(&account.id)
        .await
        .expect("active")
        .is_empty());

    let rows = store.list_usage(&account.id, None, 10).await.expect("usage");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].credential_id, None);
}
