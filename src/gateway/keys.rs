use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::store::{AccountingStore, StoreError};
use super::store_types::{Account, CredentialRecord};
use super::{Clock, GatewayError};

pub const SECRET_PREFIX: &str = "gs_";
pub const DISPLAY_PREFIX_CHARS: usize = 10;
const SECRET_RANDOM_BYTES: usize = 32;

static ID_SEQ: AtomicU64 = AtomicU64::new(0);

/// Lowercase hex SHA-256 of the secret. This is the only form a secret is stored in.
pub fn hash_secret(secret: &str) -> String {
    format!("{:x}", Sha256::digest(secret.as_bytes()))
}

pub fn display_prefix(secret: &str) -> String {
    secret.chars().take(DISPLAY_PREFIX_CHARS).collect()
}

pub fn generate_secret() -> Result<String, GatewayError> {
    let mut bytes = [0u8; SECRET_RANDOM_BYTES];
    getrandom::fill(&mut bytes).map_err(|err| GatewayError::Internal {
        message: format!("os randomness unavailable: {err}"),
    })?;
    Ok(format!("{SECRET_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes)))
}

pub(crate) fn generate_id(prefix: &str) -> String {
    let mut bytes = [0u8; 12];
    if getrandom::fill(&mut bytes).is_err() {
        let seq = ID_SEQ.fetch_add(1, Ordering::Relaxed);
        let ts_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_millis())
            .unwrap_or(0);
        return format!("{prefix}_{ts_ms}_{seq}");
    }
    format!("{prefix}_{}", hex_encode(&bytes))
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}

/// Returned exactly once, when a credential is issued.
#[derive(Clone, Serialize, Deserialize)]
pub struct IssuedCredential {
    pub secret: String,
    pub credential: CredentialRecord,
}

impl std::fmt::Debug for IssuedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCredential")
            .field("secret", &"<redacted>")
            .field("credential", &self.credential)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedCredential {
    pub account: Account,
    pub credential_id: String,
}

#[derive(Clone)]
pub struct KeyStore {
    store: Arc<dyn AccountingStore>,
    clock: Arc<dyn Clock>,
}

impl KeyStore {
    pub fn new(store: Arc<dyn AccountingStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Resolves a presented secret to its account. Unknown, inactive and expired
    /// credentials are indistinguishable to the caller.
    pub async fn resolve(&self, presented: &str) -> Result<ResolvedCredential, GatewayError> {
        let presented = presented.trim();
        if presented.is_empty() {
            return Err(GatewayError::InvalidCredential);
        }

        let digest = hash_secret(presented);
        let Some(credential) = self.store.find_credential_by_digest(&digest).await? else {
            return Err(GatewayError::InvalidCredential);
        };

        let now_ms = self.clock.now_epoch_millis();
        if !credential.is_usable_at(now_ms) {
            tracing::debug!(
                credential_id = %credential.id,
                active = credential.active,
                "credential rejected"
            );
            return Err(GatewayError::InvalidCredential);
        }

        let Some(account) = self.store.get_account(&credential.account_id).await? else {
            return Err(GatewayError::InvalidCredential);
        };

        if let Err(err) = self.store.touch_credential(&credential.id, now_ms).await {
            tracing::warn!(credential_id = %credential.id, error = %err, "failed to update last_used_at");
        }

        Ok(ResolvedCredential {
            account,
            credential_id: credential.id,
        })
    }

    pub async fn issue(
        &self,
        account_id: &str,
        name: Option<String>,
        expires_at_ms: Option<i64>,
    ) -> Result<IssuedCredential, GatewayError> {
        if self.store.get_account(account_id).await?.is_none() {
            return Err(StoreError::AccountNotFound(account_id.to_string()).into());
        }

        let secret = generate_secret()?;
        let credential = CredentialRecord {
            id: generate_id("key"),
            account_id: account_id.to_string(),
            key_digest: hash_secret(&secret),
            key_prefix: display_prefix(&secret),
            name: name
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| "Default API Key".to_string()),
            active: true,
            expires_at_ms,
            last_used_at_ms: None,
            created_at_ms: self.clock.now_epoch_millis(),
        };
        self.store.insert_credential(&credential).await?;
        tracing::info!(
            account_id,
            credential_id = %credential.id,
            key_prefix = %credential.key_prefix,
            "credential issued"
        );
        Ok(IssuedCredential { secret, credential })
    }

    pub async fn deactivate(&self, credential_id: &str) -> Result<bool, StoreError> {
        let changed = self.store.deactivate_credential(credential_id).await?;
        if changed {
            tracing::info!(credential_id, "credential deactivated");
        }
        Ok(changed)
    }

    pub async fn list(&self, account_id: &str) -> Result<Vec<CredentialRecord>, StoreError> {
        self.store.list_credentials(account_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ManualClock;
    use crate::gateway::memory_store::MemoryStore;
    use crate::gateway::store_types::NewAccount;

    async fn key_store(now_ms: i64) -> (KeyStore, Arc<ManualClock>, Account) {
        let clock = Arc::new(ManualClock::new(now_ms));
        let store: Arc<dyn AccountingStore> = Arc::new(MemoryStore::new());
        let account = store
            .create_account(&NewAccount::default(), now_ms)
            .await
            .unwrap();
        (KeyStore::new(store, clock.clone()), clock, account)
    }

    #[test]
    fn hash_is_deterministic_sha256_hex() {
        assert_eq!(
            hash_secret("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(hash_secret("gs_demo_key_12345"), hash_secret("gs_demo_key_12345"));
        assert_ne!(hash_secret("gs_a"), hash_secret("gs_b"));
    }

    #[test]
    fn generated_secrets_are_distinct_and_prefixed() {
        let a = generate_secret().unwrap();
        let b = generate_secret().unwrap();
        assert!(a.starts_with(SECRET_PREFIX));
        assert_eq!(a.len(), SECRET_PREFIX.len() + 43);
        assert_ne!(a, b);
        assert_ne!(hash_secret(&a), hash_secret(&b));
    }

    #[test]
    fn display_prefix_comes_from_plaintext() {
        assert_eq!(display_prefix("gs_abcdefghijkl"), "gs_abcdefg");
        assert_eq!(display_prefix("short"), "short");
    }

    #[tokio::test]
    async fn issued_credential_resolves_to_owner() {
        let (keys, _clock, account) = key_store(1_000).await;
        let issued = keys.issue(&account.id, None, None).await.unwrap();
        assert_eq!(issued.credential.key_digest, hash_secret(&issued.secret));
        assert_ne!(issued.credential.key_digest, issued.secret);
        assert_eq!(issued.credential.name, "Default API Key");

        let resolved = keys.resolve(&issued.secret).await.unwrap();
        assert_eq!(resolved.account, account);
        assert_eq!(resolved.credential_id, issued.credential.id);

        let listed = keys.list(&account.id).await.unwrap();
        assert_eq!(listed[0].last_used_at_ms, Some(1_000));
    }

    #[tokio::test]
    async fn unknown_inactive_and_expired_credentials_are_rejected() {
        let (keys, clock, account) = key_store(1_000).await;
        assert!(matches!(
            keys.resolve("gs_nope").await,
            Err(GatewayError::InvalidCredential)
        ));
        assert!(matches!(keys.resolve("  ").await, Err(GatewayError::InvalidCredential)));

        let revoked = keys.issue(&account.id, None, None).await.unwrap();
        assert!(keys.deactivate(&revoked.credential.id).await.unwrap());
        assert!(matches!(
            keys.resolve(&revoked.secret).await,
            Err(GatewayError::InvalidCredential)
        ));

        let expiring = keys
            .issue(&account.id, Some("ci".to_string()), Some(2_000))
            .await
            .unwrap();
        assert!(keys.resolve(&expiring.secret).await.is_ok());
        clock.set(2_000);
        assert!(matches!(
            keys.resolve(&expiring.secret).await,
            Err(GatewayError::InvalidCredential)
        ));
    }

    #[tokio::test]
    async fn issuing_for_missing_account_fails() {
        let (keys, _clock, _account) = key_store(1_000).await;
        assert!(matches!(
            keys.issue("acct_missing", None, None).await,
            Err(GatewayError::Store(StoreError::AccountNotFound(_)))
        ));
    }
}
