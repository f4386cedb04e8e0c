//! # Runtime Configuration
//!
//! Engine tuning, chain providers, alerting and persistence. Loaded from a
//! TOML file, then overridden by `SWAP_*` environment variables.
//!
//! ## Security Requirements
//!
//! - Private keys and the sealing key come from the environment only and
//!   are redacted in `Debug` output
//! - Without `SWAP_SEALING_KEY`, sealed secrets in a snapshot cannot be
//!   reopened after a restart

use bitcoin::secp256k1::SecretKey;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use swap_core::algorithms::SecretSealer;
use swap_core::domain::EngineConfig;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// File path
        path: PathBuf,
        /// Cause
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for [`RuntimeConfig`].
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// File path
        path: PathBuf,
        /// Cause
        #[source]
        source: toml::de::Error,
    },

    /// Environment override has an unusable value.
    #[error("invalid value for {var}: {reason}")]
    Env {
        /// Variable name
        var: &'static str,
        /// What was wrong
        reason: String,
    },

    /// Engine section failed validation.
    #[error(transparent)]
    Engine(#[from] swap_core::domain::ConfigError),

    /// Sections are inconsistent with each other.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Chain data backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Esplora REST API.
    Esplora,
    /// BlockCypher REST API.
    Blockcypher,
    /// In-process chain for local runs.
    Simulated,
}

impl ProviderKind {
    fn needs_url(self) -> bool {
        !matches!(self, ProviderKind::Simulated)
    }
}

/// One chain provider in priority order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Name used in logs and metrics.
    pub name: String,
    /// Backend.
    pub kind: ProviderKind,
    /// API root for REST backends.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Initial tip height of a simulated chain.
    #[serde(default)]
    pub start_height: u32,
}

/// Alert delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Webhook receiving alerts as JSON; alerts are logged when unset.
    pub webhook_url: Option<String>,
    /// Webhook request timeout.
    pub timeout_ms: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_ms: 5_000,
        }
    }
}

/// Where claimed and refunded funds go.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// Address receiving claimed HTLC outputs.
    pub claim_destination: Option<String>,
    /// Address receiving auto-refunds.
    pub refund_destination: Option<String>,
    /// Fixed refund fee rate (sat/vB); the gateway estimate when unset.
    pub refund_fee_rate: Option<f64>,
}

/// Keys supplied through the environment.
#[derive(Clone, Default)]
pub struct KeyMaterial {
    /// Claim-branch key (`SWAP_CLAIM_KEY`).
    pub claim_key: Option<SecretKey>,
    /// Refund-branch key (`SWAP_REFUND_KEY`).
    pub refund_key: Option<SecretKey>,
    /// 32-byte hex key sealing stored secrets (`SWAP_SEALING_KEY`).
    pub sealing_key: Option<String>,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown = |present: bool| if present { "<redacted>" } else { "<unset>" };
        f.debug_struct("KeyMaterial")
            .field("claim_key", &shown(self.claim_key.is_some()))
            .field("refund_key", &shown(self.refund_key.is_some()))
            .field("sealing_key", &shown(self.sealing_key.is_some()))
            .finish()
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Engine components.
    pub engine: EngineConfig,
    /// Chain providers, first is preferred.
    pub providers: Vec<ProviderConfig>,
    /// Alert delivery.
    pub alerts: AlertConfig,
    /// Payout addresses.
    pub wallet: WalletConfig,
    /// JSON snapshot written on shutdown and read on startup.
    pub snapshot_path: Option<PathBuf>,
    /// Period of the swap sync and claim cleanup loop.
    pub maintenance_interval_ms: u64,
    /// How long shutdown waits for in-flight claims.
    pub shutdown_grace_ms: u64,
    /// Address of the Prometheus `/metrics` endpoint; unset disables it.
    pub metrics_addr: Option<SocketAddr>,
    /// Environment-only key material.
    #[serde(skip)]
    pub keys: KeyMaterial,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            providers: vec![
                ProviderConfig {
                    name: "blockstream".into(),
                    kind: ProviderKind::Esplora,
                    base_url: Some("https://blockstream.info/testnet/api".into()),
                    start_height: 0,
                },
                ProviderConfig {
                    name: "blockcypher".into(),
                    kind: ProviderKind::Blockcypher,
                    base_url: Some("https://api.blockcypher.com/v1/btc/test3".into()),
                    start_height: 0,
                },
            ],
            alerts: AlertConfig::default(),
            wallet: WalletConfig::default(),
            snapshot_path: None,
            maintenance_interval_ms: 60_000,
            shutdown_grace_ms: 10_000,
            metrics_addr: None,
            keys: KeyMaterial::default(),
        }
    }
}

impl RuntimeConfig {
    /// File (if any), then process environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file. Missing sections take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `SWAP_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(network) = lookup("SWAP_NETWORK") {
            self.engine.network = bitcoin::Network::from_str(&network).map_err(|e| ConfigError::Env {
                var: "SWAP_NETWORK",
                reason: e.to_string(),
            })?;
        }
        if let Some(url) = lookup("SWAP_ESPLORA_URL") {
            self.override_provider(ProviderKind::Esplora, url);
        }
        if let Some(url) = lookup("SWAP_BLOCKCYPHER_URL") {
            self.override_provider(ProviderKind::Blockcypher, url);
        }
        if let Some(n) = lookup("SWAP_CONCURRENT_CLAIMS") {
            self.engine.scheduler.concurrent_claims = n.parse().map_err(|_| ConfigError::Env {
                var: "SWAP_CONCURRENT_CLAIMS",
                reason: format!("'{n}' is not a positive integer"),
            })?;
        }
        if let Some(flag) = lookup("SWAP_DRY_RUN") {
            self.engine.scheduler.dry_run = parse_bool("SWAP_DRY_RUN", &flag)?;
        }
        if let Some(url) = lookup("SWAP_ALERT_WEBHOOK") {
            self.alerts.webhook_url = Some(url);
        }
        if let Some(path) = lookup("SWAP_SNAPSHOT_PATH") {
            self.snapshot_path = Some(PathBuf::from(path));
        }
        if let Some(address) = lookup("SWAP_CLAIM_DESTINATION") {
            self.wallet.claim_destination = Some(address);
        }
        if let Some(address) = lookup("SWAP_REFUND_DESTINATION") {
            self.wallet.refund_destination = Some(address);
        }
        if let Some(key) = lookup("SWAP_CLAIM_KEY") {
            self.keys.claim_key = Some(parse_secret_key("SWAP_CLAIM_KEY", &key)?);
        }
        if let Some(key) = lookup("SWAP_REFUND_KEY") {
            self.keys.refund_key = Some(parse_secret_key("SWAP_REFUND_KEY", &key)?);
        }
        if let Some(key) = lookup("SWAP_SEALING_KEY") {
            SecretSealer::from_hex(&key).map_err(|e| ConfigError::Env {
                var: "SWAP_SEALING_KEY",
                reason: e.to_string(),
            })?;
            self.keys.sealing_key = Some(key);
        }
        Ok(())
    }

    /// Check the engine section and cross-section consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;

        if self.providers.is_empty() {
            return Err(ConfigError::Invalid("at least one chain provider is required".into()));
        }
        let mut names = std::collections::HashSet::new();
        for provider in &self.providers {
            if !names.insert(provider.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate provider name '{}'", provider.name)));
            }
            if provider.kind.needs_url() && provider.base_url.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::Invalid(format!("provider '{}' needs a base_url", provider.name)));
            }
            if provider.kind == ProviderKind::Simulated && self.engine.network == bitcoin::Network::Bitcoin {
                return Err(ConfigError::Invalid(format!(
                    "simulated provider '{}' cannot run on mainnet",
                    provider.name
                )));
            }
        }

        if self.keys.claim_key.is_some() && self.wallet.claim_destination.is_none() {
            return Err(ConfigError::Invalid("SWAP_CLAIM_KEY set without a claim destination".into()));
        }
        if self.keys.refund_key.is_some() && self.wallet.refund_destination.is_none() {
            return Err(ConfigError::Invalid("SWAP_REFUND_KEY set without a refund destination".into()));
        }
        if self.maintenance_interval_ms == 0 {
            return Err(ConfigError::Invalid("maintenance_interval_ms cannot be 0".into()));
        }
        Ok(())
    }

    /// Point the first provider of `kind` at `url`, or append one.
    fn override_provider(&mut self, kind: ProviderKind, url: String) {
        match self.providers.iter_mut().find(|p| p.kind == kind) {
            Some(provider) => provider.base_url = Some(url),
            None => self.providers.push(ProviderConfig {
                name: format!("{kind:?}").to_lowercase(),
                kind,
                base_url: Some(url),
                start_height: 0,
            }),
        }
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Env {
            var,
            reason: format!("'{other}' is not a boolean"),
        }),
    }
}

fn parse_secret_key(var: &'static str, value: &str) -> Result<SecretKey, ConfigError> {
    // Never echo the value.
    SecretKey::from_str(value.trim()).map_err(|_| ConfigError::Env {
        var,
        reason: "expected a 32-byte hex private key".into(),
    })
}
