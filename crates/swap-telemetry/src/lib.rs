//! # Swap Telemetry
//!
//! Logging and metrics shared by the swap engine binaries.
//!
//! - **Logs**: `tracing-subscriber` with an `EnvFilter`, human-readable or JSON
//! - **Metrics**: Prometheus counters and gauges in one registry
//!
//! ## Usage
//!
//! ```rust,ignore
//! use swap_telemetry::{init_telemetry, TelemetryConfig};
//!
//! let config = TelemetryConfig::from_env();
//! init_telemetry(&config)?;
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SWAP_LOG_LEVEL` | `info` | Log filter (falls back to `RUST_LOG`) |
//! | `SWAP_JSON_LOGS` | `false` | JSON output (`true` inside containers) |
//! | `SWAP_CONSOLE_OUTPUT` | `true` | Emit logs to stdout |
//! | `SWAP_SERVICE_NAME` | `atomic-swap` | Service name in logs |
//! | `SWAP_METRICS_PORT` | `9100` | Metrics port |

#![warn(missing_docs)]

mod config;
mod logging;
pub mod metrics;

pub use config::TelemetryConfig;
pub use logging::{env_filter, init_logging};
pub use metrics::{
    gather_metrics, register_metrics, AUTO_REFUNDS, BROADCASTS, CLAIMS, CLAIMS_IN_FLIGHT, HTLC_TRANSITIONS,
    POLL_FAILURES, PROVIDER_REQUESTS, SECRETS_REVEALED, SWAP_TRANSITIONS,
};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// Subscriber could not be installed.
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    /// Metric registration or encoding failed.
    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    /// Bad configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Register metrics, then install the log subscriber.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    register_metrics()?;
    init_logging(config)
}

/// Convenience macro for recording a metric increment.
#[macro_export]
macro_rules! metric_inc {
    ($metric:expr) => {
        $metric.inc()
    };
    ($metric:expr, $labels:expr) => {
        $metric.with_label_values($labels).inc()
    };
}
