//! Prometheus metrics for the swap engine.
//!
//! All metrics follow the naming convention: `swap_<component>_<metric>_<unit>`

use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, Gauge, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Once;

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // GATEWAY
    // =========================================================================

    /// Provider requests by outcome
    pub static ref PROVIDER_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("swap_gateway_provider_requests_total", "Chain provider requests"),
        &["operation", "outcome"]  // outcome: ok/failed
    ).expect("metric creation failed");

    /// Broadcasts by outcome
    pub static ref BROADCASTS: IntCounterVec = IntCounterVec::new(
        Opts::new("swap_gateway_broadcasts_total", "Raw transaction broadcasts"),
        &["outcome"]  // outcome: accepted/already_known/failed
    ).expect("metric creation failed");

    // =========================================================================
    // WATCHTOWER
    // =========================================================================

    /// HTLC status transitions
    pub static ref HTLC_TRANSITIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("swap_watchtower_htlc_transitions_total", "HTLC status transitions"),
        &["to"]
    ).expect("metric creation failed");

    /// Failed watchtower polls
    pub static ref POLL_FAILURES: IntCounter = IntCounter::new(
        "swap_watchtower_poll_failures_total",
        "Watchtower polls that failed without changing state"
    ).expect("metric creation failed");

    /// Refunds broadcast by the watchtower
    pub static ref AUTO_REFUNDS: IntCounter = IntCounter::new(
        "swap_watchtower_auto_refunds_total",
        "Refunds broadcast automatically after expiry"
    ).expect("metric creation failed");

    /// Secrets extracted from claim spends
    pub static ref SECRETS_REVEALED: IntCounter = IntCounter::new(
        "swap_watchtower_secrets_revealed_total",
        "Preimages extracted from observed claim spends"
    ).expect("metric creation failed");

    // =========================================================================
    // SCHEDULER
    // =========================================================================

    /// Claim lifecycle events
    pub static ref CLAIMS: CounterVec = CounterVec::new(
        Opts::new("swap_scheduler_claims_total", "Claim lifecycle events"),
        &["event"]  // event: ready/dispatched/succeeded/failed/abandoned
    ).expect("metric creation failed");

    /// Claims currently executing
    pub static ref CLAIMS_IN_FLIGHT: Gauge = Gauge::new(
        "swap_scheduler_claims_in_flight",
        "Claims currently held by an executor"
    ).expect("metric creation failed");

    // =========================================================================
    // COORDINATOR
    // =========================================================================

    /// Swap phase transitions
    pub static ref SWAP_TRANSITIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("swap_coordinator_transitions_total", "Swap phase transitions"),
        &["to"]
    ).expect("metric creation failed");
}

static REGISTER: Once = Once::new();

/// Register every metric with [`REGISTRY`]. Idempotent.
pub fn register_metrics() -> Result<(), TelemetryError> {
    let mut result = Ok(());
    REGISTER.call_once(|| {
        let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(PROVIDER_REQUESTS.clone()),
            Box::new(BROADCASTS.clone()),
            Box::new(HTLC_TRANSITIONS.clone()),
            Box::new(POLL_FAILURES.clone()),
            Box::new(AUTO_REFUNDS.clone()),
            Box::new(SECRETS_REVEALED.clone()),
            Box::new(CLAIMS.clone()),
            Box::new(CLAIMS_IN_FLIGHT.clone()),
            Box::new(SWAP_TRANSITIONS.clone()),
        ];
        for metric in metrics {
            if let Err(e) = REGISTRY.register(metric) {
                result = Err(TelemetryError::MetricsInit(e.to_string()));
                return;
            }
        }
    });
    result
}

/// Render every registered metric in the Prometheus text format.
pub fn gather_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}
