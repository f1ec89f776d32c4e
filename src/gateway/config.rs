use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::subscriptions::TierTable;
use super::usage::MeteringPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid toml config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid json config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqlite_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,
    #[serde(default)]
    pub metering: MeteringPolicy,
    #[serde(default = "default_verify_base_url")]
    pub verify_base_url: String,
    #[serde(default)]
    pub tiers: TierTable,
    #[serde(default)]
    pub limits: RequestLimits,
    #[serde(default)]
    pub json_logs: bool,
    /// Reservations older than this are presumed abandoned and reaped.
    #[serde(default = "default_reservation_ttl_secs")]
    pub reservation_ttl_secs: u64,
    /// Background reaper period; 0 disables the reaper.
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
    /// Allow any origin, method and header (browser clients).
    #[serde(default)]
    pub cors_permissive: bool,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("listen", &self.listen)
            .field("sqlite_path", &self.sqlite_path)
            .field(
                "admin_token",
                &self.admin_token.as_ref().map(|_| "<redacted>"),
            )
            .field("metering", &self.metering)
            .field("verify_base_url", &self.verify_base_url)
            .field("tiers", &self.tiers)
            .field("limits", &self.limits)
            .field("json_logs", &self.json_logs)
            .field("reservation_ttl_secs", &self.reservation_ttl_secs)
            .field("reap_interval_secs", &self.reap_interval_secs)
            .field("cors_permissive", &self.cors_permissive)
            .finish()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            sqlite_path: None,
            admin_token: None,
            metering: MeteringPolicy::default(),
            verify_base_url: default_verify_base_url(),
            tiers: TierTable::default(),
            limits: RequestLimits::default(),
            json_logs: false,
            reservation_ttl_secs: default_reservation_ttl_secs(),
            reap_interval_secs: default_reap_interval_secs(),
            cors_permissive: false,
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_reservation_ttl_secs() -> u64 {
    300
}

fn default_reap_interval_secs() -> u64 {
    60
}

fn default_verify_base_url() -> String {
    "https://goldenseed.io/verify".to_string()
}

/// Upper bounds on request parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestLimits {
    pub max_chunks: u32,
    pub max_batch_seeds: u32,
    pub max_chunks_per_seed: u32,
    pub max_flips: u32,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_chunks: 10_000,
            max_batch_seeds: 10,
            max_chunks_per_seed: 1_000,
            max_flips: 1_000_000,
        }
    }
}

impl GatewayConfig {
    /// Parses a `.toml` file as TOML and anything else as JSON.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let config: Self = if is_toml {
            toml::from_str(&raw)?
        } else {
            serde_json::from_str(&raw)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Invalid("listen must not be empty".to_string()));
        }
        if self.verify_base_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "verify_base_url must not be empty".to_string(),
            ));
        }
        if self
            .admin_token
            .as_deref()
            .is_some_and(|token| token.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "admin_token must not be blank".to_string(),
            ));
        }
        if self.reservation_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "reservation_ttl_secs must be > 0".to_string(),
            ));
        }
        let limits = &self.limits;
        for (name, value) in [
            ("max_chunks", limits.max_chunks),
            ("max_batch_seeds", limits.max_batch_seeds),
            ("max_chunks_per_seed", limits.max_chunks_per_seed),
            ("max_flips", limits.max_flips),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("limits.{name} must be > 0")));
            }
        }
        Ok(())
    }

    pub fn is_demo(&self) -> bool {
        self.sqlite_path.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::subscriptions::{Tier, TierLimits};

    #[test]
    fn loads_toml_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gateway.toml");
        std::fs::write(
            &path,
            r#"
listen = "0.0.0.0:9000"
sqlite_path = "goldenseed.sqlite"
metering = "lenient"

[tiers.indie]
monthly_units = 5
requests_per_minute = 2

[limits]
max_flips = 10
"#,
        )
        .expect("write");

        let config = GatewayConfig::load(&path).expect("load");
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.metering, MeteringPolicy::Lenient);
        assert!(!config.is_demo());
        assert_eq!(
            config.tiers.limits(Tier::Indie),
            TierLimits {
                monthly_units: 5,
                requests_per_minute: 2
            }
        );
        assert_eq!(config.tiers.limits(Tier::Free), Tier::Free.default_limits());
        assert_eq!(config.limits.max_flips, 10);
        assert_eq!(config.limits.max_chunks, 10_000);
        assert_eq!(config.verify_base_url, "https://goldenseed.io/verify");
        assert_eq!(config.reservation_ttl_secs, 300);
        assert_eq!(config.reap_interval_secs, 60);
        assert!(!config.cors_permissive);
    }

    #[test]
    fn loads_json_and_rejects_bad_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gateway.json");
        std::fs::write(&path, r#"{"admin_token": "secret"}"#).expect("write");
        let config = GatewayConfig::load(&path).expect("load");
        assert!(config.is_demo());
        assert!(!format!("{config:?}").contains("secret"));

        std::fs::write(&path, r#"{"limits": {"max_chunks": 0}}"#).expect("write");
        assert!(matches!(
            GatewayConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));

        std::fs::write(&path, r#"{"reservation_ttl_secs": 0}"#).expect("write");
        assert!(matches!(
            GatewayConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));

        std::fs::write(&path, r#"{"metering": "sometimes"}"#).expect("write");
        assert!(matches!(GatewayConfig::load(&path), Err(ConfigError::Json(_))));
    }
}
