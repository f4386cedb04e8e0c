//! Engine configuration with validation.
//!
//! Every section has a working default; `validate()` rejects values that
//! would make a component spin, hang or never retry.

use super::invariants::{DUST_THRESHOLD_SAT, MIN_TIMELOCK_MARGIN_SECS};
use super::value_objects::{CongestionBand, FeePriority};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A value that must be non-zero is zero.
    #[error("{0} cannot be 0")]
    Zero(&'static str),
    /// Values are inconsistent with each other.
    #[error("invalid configuration: {0}")]
    Inconsistent(String),
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Script-chain network.
    pub network: bitcoin::Network,
    /// Network gateway.
    pub gateway: GatewayConfig,
    /// Transaction builder.
    pub tx_builder: TxBuilderConfig,
    /// Watchtower.
    pub watchtower: WatchtowerConfig,
    /// Claim scheduler.
    pub scheduler: SchedulerConfig,
    /// Coordinator.
    pub coordinator: CoordinatorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network: bitcoin::Network::Testnet,
            gateway: GatewayConfig::default(),
            tx_builder: TxBuilderConfig::default(),
            watchtower: WatchtowerConfig::default(),
            scheduler: SchedulerConfig::default(),
            coordinator: CoordinatorConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.gateway.validate()?;
        self.tx_builder.validate()?;
        self.watchtower.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }
}

/// Network gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Per-call provider timeout.
    pub request_timeout_ms: u64,
    /// Full rotations over all providers before giving up.
    pub max_retries: u32,
    /// Back-off unit between rotations (linear: pass * delay).
    pub retry_delay_ms: u64,
    /// Rotations for block-height queries.
    pub height_max_retries: u32,
    /// Back-off unit for block-height rotations.
    pub height_retry_delay_ms: u64,
    /// Mempool count at which congestion becomes elevated.
    pub congestion_elevated: u64,
    /// Mempool count at which congestion becomes high.
    pub congestion_high: u64,
    /// Mempool count at which congestion becomes very high.
    pub congestion_very_high: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            max_retries: 3,
            retry_delay_ms: 500,
            height_max_retries: 5,
            height_retry_delay_ms: 250,
            congestion_elevated: 10_000,
            congestion_high: 50_000,
            congestion_very_high: 100_000,
        }
    }
}

impl GatewayConfig {
    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Zero("gateway.request_timeout_ms"));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Zero("gateway.max_retries"));
        }
        if self.height_max_retries < self.max_retries {
            return Err(ConfigError::Inconsistent(
                "gateway.height_max_retries must be >= gateway.max_retries".into(),
            ));
        }
        if !(self.congestion_elevated < self.congestion_high
            && self.congestion_high < self.congestion_very_high)
        {
            return Err(ConfigError::Inconsistent(
                "congestion thresholds must be strictly increasing".into(),
            ));
        }
        Ok(())
    }

    /// Per-call timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Band for a mempool transaction count.
    pub fn band_for(&self, mempool_count: u64) -> CongestionBand {
        if mempool_count >= self.congestion_very_high {
            CongestionBand::VeryHigh
        } else if mempool_count >= self.congestion_high {
            CongestionBand::High
        } else if mempool_count >= self.congestion_elevated {
            CongestionBand::Elevated
        } else {
            CongestionBand::Normal
        }
    }
}

/// Transaction builder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TxBuilderConfig {
    /// Change at or below this is folded into the fee.
    pub dust_threshold: u64,
    /// Sanity ceiling on the derived fee rate (sat/vB).
    pub max_fee_rate: f64,
    /// Floor applied to estimated rates (sat/vB).
    pub min_fee_rate: f64,
    /// Confirmation target for claim/refund spends.
    pub spend_priority: FeePriority,
}

impl Default for TxBuilderConfig {
    fn default() -> Self {
        Self {
            dust_threshold: DUST_THRESHOLD_SAT,
            max_fee_rate: 1_000.0,
            min_fee_rate: 1.0,
            spend_priority: FeePriority::High,
        }
    }
}

impl TxBuilderConfig {
    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dust_threshold == 0 {
            return Err(ConfigError::Zero("tx_builder.dust_threshold"));
        }
        if !(self.min_fee_rate > 0.0 && self.min_fee_rate < self.max_fee_rate) {
            return Err(ConfigError::Inconsistent(
                "tx_builder fee bounds must satisfy 0 < min_fee_rate < max_fee_rate".into(),
            ));
        }
        Ok(())
    }
}

/// Watchtower configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchtowerConfig {
    /// Poll interval while far from expiry.
    pub poll_interval_ms: u64,
    /// Poll interval inside the refund buffer.
    pub fast_poll_interval_ms: u64,
    /// Broadcast refunds automatically.
    pub auto_refund: bool,
    /// Blocks before timelock at which the manager switches to fast polling.
    pub refund_buffer_blocks: u32,
    /// Forward poll failures to the alert sink.
    pub alert_on_poll_failure: bool,
}

impl Default for WatchtowerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 30_000,
            fast_poll_interval_ms: 5_000,
            auto_refund: true,
            refund_buffer_blocks: 2,
            alert_on_poll_failure: true,
        }
    }
}

impl WatchtowerConfig {
    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Zero("watchtower.poll_interval_ms"));
        }
        if self.fast_poll_interval_ms == 0 {
            return Err(ConfigError::Zero("watchtower.fast_poll_interval_ms"));
        }
        Ok(())
    }
}

/// Claim scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Semaphore size.
    pub concurrent_claims: usize,
    /// Tick interval.
    pub tick_interval_ms: u64,
    /// Back-off base (`base * 2^(retry_count - 1)`).
    pub base_delay_ms: u64,
    /// Upper bound on a single back-off.
    pub max_delay_ms: u64,
    /// Default retry budget for new claims.
    pub max_retries: u32,
    /// Estimate and simulate, never broadcast.
    pub dry_run: bool,
    /// Terminal claims older than this are removed by cleanup.
    pub cleanup_age_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrent_claims: 3,
            tick_interval_ms: 5_000,
            base_delay_ms: 2_000,
            max_delay_ms: 300_000,
            max_retries: 5,
            dry_run: false,
            cleanup_age_secs: 24 * 3600,
        }
    }
}

impl SchedulerConfig {
    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrent_claims == 0 {
            return Err(ConfigError::Zero("scheduler.concurrent_claims"));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Zero("scheduler.tick_interval_ms"));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ConfigError::Inconsistent(
                "scheduler.base_delay_ms must be <= scheduler.max_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Escrow deadline must exceed the script-chain expiry by this much.
    pub min_timelock_margin_secs: u64,
    /// Confirmations required on the counterparty's funding.
    pub min_confirmations: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            min_timelock_margin_secs: MIN_TIMELOCK_MARGIN_SECS,
            min_confirmations: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_retries_rejected() {
        let config = GatewayConfig {
            max_retries: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero("gateway.max_retries")));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = SchedulerConfig {
            concurrent_claims: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_congestion_bands() {
        let config = GatewayConfig::default();
        assert_eq!(config.band_for(0), CongestionBand::Normal);
        assert_eq!(config.band_for(9_999), CongestionBand::Normal);
        assert_eq!(config.band_for(10_000), CongestionBand::Elevated);
        assert_eq!(config.band_for(50_000), CongestionBand::High);
        assert_eq!(config.band_for(250_000), CongestionBand::VeryHigh);
    }

    #[test]
    fn test_partial_toml_style_json_uses_defaults() {
        let config: SchedulerConfig = serde_json::from_str(r#"{"concurrent_claims": 7}"#).unwrap();
        assert_eq!(config.concurrent_claims, 7);
        assert_eq!(config.max_retries, 5);
    }
}
