use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{ErrorCode, OptionalExtension, TransactionBehavior};

use super::keys::generate_id;
use super::quota::{AdmissionDecision, UsageSnapshot, UsageWindow, decide};
use super::store::{AccountingStore, StoreError};
use super::store_types::{
    Account, CredentialRecord, NewAccount, NewSubscription, NewUsage, ReservationRecord,
    SubscriptionRecord, UsageRecord, i64_to_u64, units_to_i64,
};
use super::subscriptions::{Tier, select_current};

#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    pub async fn list_reservations(&self) -> Result<Vec<ReservationRecord>, StoreError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT request_id, account_id, units, ts_ms
                 FROM admission_reservations
                 ORDER BY ts_ms, request_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(ReservationRecord {
                    request_id: row.get(0)?,
                    account_id: row.get(1)?,
                    units: i64_to_u64(row.get(2)?),
                    ts_ms: row.get(3)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn with_connection<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            op(&mut conn)
        })
        .await?
    }
}

#[async_trait]
impl AccountingStore for SqliteStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn create_account(
        &self,
        account: &NewAccount,
        now_ms: i64,
    ) -> Result<Account, StoreError> {
        let record = Account {
            id: generate_id("acct"),
            email: account.email.clone(),
            billing_customer_id: account.billing_customer_id.clone(),
            created_at_ms: now_ms,
        };
        self.with_connection(move |conn| {
            conn.execute(
                "INSERT INTO accounts (id, email, billing_customer_id, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    record.id,
                    record.email,
                    record.billing_customer_id,
                    record.created_at_ms
                ],
            )
            .map_err(|err| constraint_to_conflict(err, "email already registered"))?;
            Ok(record)
        })
        .await
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>, StoreError> {
        let account_id = account_id.to_string();
        self.with_connection(move |conn| {
            let account = conn
                .query_row(
                    "SELECT id, email, billing_customer_id, created_at_ms
                     FROM accounts WHERE id = ?1",
                    rusqlite::params![account_id],
                    |row| {
                        Ok(Account {
                            id: row.get(0)?,
                            email: row.get(1)?,
                            billing_customer_id: row.get(2)?,
                            created_at_ms: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(account)
        })
        .await
    }

    async fn delete_account(&self, account_id: &str) -> Result<bool, StoreError> {
        let account_id = account_id.to_string();
        self.with_connection(move |conn| {
            let tx = conn.transaction()?;
            // Credentials cascade, and their removal nulls usage_logs.credential_id.
            let deleted = tx.execute(
                "DELETE FROM accounts WHERE id = ?1",
                rusqlite::params![account_id],
            )?;
            tx.commit()?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn insert_credential(&self, credential: &CredentialRecord) -> Result<(), StoreError> {
        let credential = credential.clone();
        self.with_connection(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            ensure_account(&tx, &credential.account_id)?;
            tx.execute(
                "INSERT INTO credentials
                    (id, account_id, key_digest, key_prefix, name, active, expires_at_ms,
                     last_used_at_ms, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    credential.id,
                    credential.account_id,
                    credential.key_digest,
                    credential.key_prefix,
                    credential.name,
                    credential.active,
                    credential.expires_at_ms,
                    credential.last_used_at_ms,
                    credential.created_at_ms
                ],
            )
            .map_err(|err| constraint_to_conflict(err, "credential digest already exists"))?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn find_credential_by_digest(
        &self,
        key_digest: &str,
    ) -> Result<Option<CredentialRecord>, StoreError> {
        let key_digest = key_digest.to_string();
        self.with_connection(move |conn| {
            let credential = conn
                .query_row(
                    &format!("SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE key_digest = ?1"),
                    rusqlite::params![key_digest],
                    credential_from_row,
                )
                .optional()?;
            Ok(credential)
        })
        .await
    }

    async fn touch_credential(&self, credential_id: &str, now_ms: i64) -> Result<(), StoreError> {
        let credential_id = credential_id.to_string();
        self.with_connection(move |conn| {
            conn.execute(
                "UPDATE credentials SET last_used_at_ms = ?2 WHERE id = ?1",
                rusqlite::params![credential_id, now_ms],
            )?;
            Ok(())
        })
        .await
    }

    async fn deactivate_credential(&self, credential_id: &str) -> Result<bool, StoreError> {
        let credential_id = credential_id.to_string();
        self.with_connection(move |conn| {
            let changed = conn.execute(
                "UPDATE credentials SET active = 0 WHERE id = ?1 AND active = 1",
                rusqlite::params![credential_id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn list_credentials(
        &self,
        account_id: &str,
    ) -> Result<Vec<CredentialRecord>, StoreError> {
        let account_id = account_id.to_string();
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CREDENTIAL_COLUMNS} FROM credentials
                 WHERE account_id = ?1
                 ORDER BY created_at_ms, id"
            ))?;
            let rows = stmt.query_map(rusqlite::params![account_id], credential_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn replace_active_subscription(
        &self,
        subscription: &NewSubscription,
        now_ms: i64,
    ) -> Result<SubscriptionRecord, StoreError> {
        let subscription = subscription.clone();
        self.with_connection(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            ensure_account(&tx, &subscription.account_id)?;
            tx.execute(
                "UPDATE subscriptions
                 SET active = 0, period_end_ms = ?2
                 WHERE account_id = ?1 AND active = 1",
                rusqlite::params![subscription.account_id, now_ms],
            )?;
            tx.execute(
                "INSERT INTO subscriptions
                    (account_id, tier, monthly_unit_limit, per_minute_limit, active,
                     period_start_ms, period_end_ms, billing_subscription_id, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, NULL, ?6, ?5)",
                rusqlite::params![
                    subscription.account_id,
                    subscription.tier.as_str(),
                    units_to_i64(subscription.limits.monthly_units),
                    i64::from(subscription.limits.requests_per_minute),
                    now_ms,
                    subscription.billing_subscription_id
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;
            Ok(SubscriptionRecord {
                id,
                account_id: subscription.account_id,
                tier: subscription.tier,
                monthly_unit_limit: subscription.limits.monthly_units,
                per_minute_limit: subscription.limits.requests_per_minute,
                active: true,
                period_start_ms: now_ms,
                period_end_ms: None,
                billing_subscription_id: subscription.billing_subscription_id,
                created_at_ms: now_ms,
            })
        })
        .await
    }

    async fn deactivate_subscriptions(
        &self,
        account_id: &str,
        now_ms: i64,
    ) -> Result<u64, StoreError> {
        let account_id = account_id.to_string();
        self.with_connection(move |conn| {
            let changed = conn.execute(
                "UPDATE subscriptions
                 SET active = 0, period_end_ms = ?2
                 WHERE account_id = ?1 AND active = 1",
                rusqlite::params![account_id, now_ms],
            )?;
            Ok(changed as u64)
        })
        .await
    }

    async fn active_subscriptions(
        &self,
        account_id: &str,
    ) -> Result<Vec<SubscriptionRecord>, StoreError> {
        let account_id = account_id.to_string();
        self.with_connection(move |conn| Ok(active_subscriptions_in(conn, &account_id)?))
            .await
    }

    async fn append_usage(&self, usage: &NewUsage, ts_ms: i64) -> Result<UsageRecord, StoreError> {
        let usage = usage.clone();
        self.with_connection(move |conn| Ok(insert_usage(conn, usage, ts_ms)?))
            .await
    }

    async fn usage_snapshot(
        &self,
        account_id: &str,
        window: &UsageWindow,
    ) -> Result<UsageSnapshot, StoreError> {
        let account_id = account_id.to_string();
        let window = *window;
        self.with_connection(move |conn| Ok(snapshot_in(conn, &account_id, &window)?))
            .await
    }

    async fn list_usage(
        &self,
        account_id: &str,
        since_ms: Option<i64>,
        limit: usize,
    ) -> Result<Vec<UsageRecord>, StoreError> {
        let account_id = account_id.to_string();
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);
        let since_ms = since_ms.unwrap_or(i64::MIN);
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, account_id, credential_id, operation, units, latency_ms, status_code, ts_ms
                 FROM usage_logs
                 WHERE account_id = ?1 AND ts_ms >= ?2
                 ORDER BY id DESC
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(rusqlite::params![account_id, since_ms, limit], |row| {
                Ok(UsageRecord {
                    id: row.get(0)?,
                    account_id: row.get(1)?,
                    credential_id: row.get(2)?,
                    operation: row.get(3)?,
                    units: i64_to_u64(row.get(4)?),
                    latency_ms: i64_to_u64(row.get(5)?),
                    status_code: u16::try_from(row.get::<_, i64>(6)?).unwrap_or(0),
                    ts_ms: row.get(7)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn reserve_admission(
        &self,
        reservation: &ReservationRecord,
        window: &UsageWindow,
    ) -> Result<AdmissionDecision, StoreError> {
        let reservation = reservation.clone();
        let window = *window;
        self.with_connection(move |conn| {
            // IMMEDIATE takes the write lock up front, so concurrent admissions for
            // any account serialize on the read-decide-insert sequence.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM admission_reservations WHERE request_id = ?1",
                    rusqlite::params![reservation.request_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(StoreError::Conflict(format!(
                    "duplicate request id: {}",
                    reservation.request_id
                )));
            }

            let rows = active_subscriptions_in(&tx, &reservation.account_id)?;
            let limits = select_current(&rows).map(|row| row.limits());
            let usage = snapshot_in(&tx, &reservation.account_id, &window)?;
            let decision = decide(limits, usage);
            if decision.is_admit() {
                tx.execute(
                    "INSERT INTO admission_reservations (request_id, account_id, units, ts_ms)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![
                        reservation.request_id,
                        reservation.account_id,
                        units_to_i64(reservation.units),
                        reservation.ts_ms
                    ],
                )?;
            }
            tx.commit()?;
            Ok(decision)
        })
        .await
    }

    async fn commit_admission(
        &self,
        request_id: &str,
        usage: &NewUsage,
        ts_ms: i64,
    ) -> Result<Option<UsageRecord>, StoreError> {
        let request_id = request_id.to_string();
        let usage = usage.clone();
        self.with_connection(move |conn| {
            let tx = conn.transaction()?;
            let deleted = tx.execute(
                "DELETE FROM admission_reservations WHERE request_id = ?1",
                rusqlite::params![request_id],
            )?;
            if deleted == 0 {
                return Ok(None);
            }
            let record = insert_usage(&tx, usage, ts_ms)?;
            tx.commit()?;
            Ok(Some(record))
        })
        .await
    }

    async fn rollback_admission(&self, request_id: &str) -> Result<bool, StoreError> {
        let request_id = request_id.to_string();
        self.with_connection(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM admission_reservations WHERE request_id = ?1",
                rusqlite::params![request_id],
            )?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn reap_reservations(&self, older_than_ms: i64) -> Result<u64, StoreError> {
        self.with_connection(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM admission_reservations WHERE ts_ms < ?1",
                rusqlite::params![older_than_ms],
            )?;
            Ok(deleted as u64)
        })
        .await
    }
}

const CREDENTIAL_COLUMNS: &str = "id, account_id, key_digest, key_prefix, name, active, \
     expires_at_ms, last_used_at_ms, created_at_ms";

fn credential_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CredentialRecord> {
    Ok(CredentialRecord {
        id: row.get(0)?,
        account_id: row.get(1)?,
        key_digest: row.get(2)?,
        key_prefix: row.get(3)?,
        name: row.get(4)?,
        active: row.get(5)?,
        expires_at_ms: row.get(6)?,
        last_used_at_ms: row.get(7)?,
        created_at_ms: row.get(8)?,
    })
}

fn subscription_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SubscriptionRecord> {
    let tier: String = row.get(2)?;
    let tier = tier
        .parse::<Tier>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(err)))?;
    Ok(SubscriptionRecord {
        id: row.get(0)?,
        account_id: row.get(1)?,
        tier,
        monthly_unit_limit: i64_to_u64(row.get(3)?),
        per_minute_limit: u32::try_from(row.get::<_, i64>(4)?).unwrap_or(u32::MAX),
        active: row.get(5)?,
        period_start_ms: row.get(6)?,
        period_end_ms: row.get(7)?,
        billing_subscription_id: row.get(8)?,
        created_at_ms: row.get(9)?,
    })
}

fn active_subscriptions_in(
    conn: &rusqlite::Connection,
    account_id: &str,
) -> rusqlite::Result<Vec<SubscriptionRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, account_id, tier, monthly_unit_limit, per_minute_limit, active,
                period_start_ms, period_end_ms, billing_subscription_id, created_at_ms
         FROM subscriptions
         WHERE account_id = ?1 AND active = 1
         ORDER BY created_at_ms DESC, id DESC",
    )?;
    let rows = stmt.query_map(rusqlite::params![account_id], subscription_from_row)?;
    rows.collect()
}

fn snapshot_in(
    conn: &rusqlite::Connection,
    account_id: &str,
    window: &UsageWindow,
) -> rusqlite::Result<UsageSnapshot> {
    let (monthly_units, recent_requests): (i64, i64) = conn.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN ts_ms >= ?2 AND ts_ms < ?3 THEN units ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN ts_ms > ?4 THEN 1 ELSE 0 END), 0)
         FROM (
            SELECT ts_ms, units FROM usage_logs
            WHERE account_id = ?1 AND ts_ms >= MIN(?2, ?4)
            UNION ALL
            SELECT ts_ms, units FROM admission_reservations
            WHERE account_id = ?1
         )",
        rusqlite::params![
            account_id,
            window.month_start_ms,
            window.month_end_ms,
            window.rate_after_ms
        ],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(UsageSnapshot {
        monthly_units: i64_to_u64(monthly_units),
        recent_requests: i64_to_u64(recent_requests),
    })
}

fn insert_usage(
    conn: &rusqlite::Connection,
    usage: NewUsage,
    ts_ms: i64,
) -> rusqlite::Result<UsageRecord> {
    conn.execute(
        "INSERT INTO usage_logs
            (account_id, credential_id, operation, units, latency_ms, status_code, ts_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            usage.account_id,
            usage.credential_id,
            usage.operation,
            units_to_i64(usage.units),
            units_to_i64(usage.latency_ms),
            i64::from(usage.status_code),
            ts_ms
        ],
    )?;
    Ok(UsageRecord {
        id: conn.last_insert_rowid(),
        account_id: usage.account_id,
        credential_id: usage.credential_id,
        operation: usage.operation,
        units: usage.units,
        latency_ms: usage.latency_ms,
        status_code: usage.status_code,
        ts_ms,
    })
}

fn ensure_account(conn: &rusqlite::Connection, account_id: &str) -> Result<(), StoreError> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM accounts WHERE id = ?1",
            rusqlite::params![account_id],
            |row| row.get(0),
        )
        .optional()?;
    match exists {
        Some(_) => Ok(()),
        None => Err(StoreError::AccountNotFound(account_id.to_string())),
    }
}

fn constraint_to_conflict(err: rusqlite::Error, message: &str) -> StoreError {
    match err.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => StoreError::Conflict(message.to_string()),
        _ => StoreError::Sqlite(err),
    }
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY NOT NULL,
            email TEXT UNIQUE,
            billing_customer_id TEXT,
            created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS credentials (
            id TEXT PRIMARY KEY NOT NULL,
            account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            key_digest TEXT NOT NULL UNIQUE,
            key_prefix TEXT NOT NULL,
            name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            expires_at_ms INTEGER,
            last_used_at_ms INTEGER,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_credentials_account_id
            ON credentials(account_id);

        CREATE TABLE IF NOT EXISTS subscriptions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            tier TEXT NOT NULL,
            monthly_unit_limit INTEGER NOT NULL,
            per_minute_limit INTEGER NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            period_start_ms INTEGER NOT NULL,
            period_end_ms INTEGER,
            billing_subscription_id TEXT,
            created_at_ms INTEGER NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_subscriptions_single_active
            ON subscriptions(account_id) WHERE active = 1;

        CREATE TABLE IF NOT EXISTS usage_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            credential_id TEXT REFERENCES credentials(id) ON DELETE SET NULL,
            operation TEXT NOT NULL,
            units INTEGER NOT NULL,
            latency_ms INTEGER NOT NULL,
            status_code INTEGER NOT NULL,
            ts_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_usage_logs_account_ts_ms
            ON usage_logs(account_id, ts_ms);

        CREATE TABLE IF NOT EXISTS admission_reservations (
            request_id TEXT PRIMARY KEY NOT NULL,
            account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            units INTEGER NOT NULL,
            ts_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_admission_reservations_account_id
            ON admission_reservations(account_id);",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

#[cfg(test)]
mod tests;
