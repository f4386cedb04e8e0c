//! # Network Gateway
//!
//! Single entry point to script-chain data. Every read rotates through the
//! configured providers: one pass tries each provider once, starting from
//! the last provider that answered; passes repeat up to `max_retries` times
//! with a linearly growing pause between them. Each call is bounded by the
//! request timeout.
//!
//! Block height is the one read with no fallback value: if every provider
//! fails (or reports zero) the gateway returns `HeightUnavailable` and the
//! caller must stop, since guessing a height could make a refund look valid
//! or a claim look safe.

use crate::algorithms::transaction::decode_hex;
use crate::domain::{
    BroadcastResult, CongestionBand, FeeEstimates, FeePriority, GatewayConfig, MempoolStats,
    OutputSpend, ProviderError, SwapError, Utxo,
};
use crate::ports::ChainProvider;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Rotation ran out of providers and passes.
#[derive(Debug)]
struct Exhausted {
    attempts: u32,
    errors: Vec<String>,
}

impl Exhausted {
    fn last_error(&self) -> String {
        self.errors.last().cloned().unwrap_or_else(|| "no providers".into())
    }
}

/// Multi-provider script-chain gateway.
pub struct NetworkGateway {
    providers: Vec<Arc<dyn ChainProvider>>,
    current: AtomicUsize,
    config: GatewayConfig,
}

impl NetworkGateway {
    /// Gateway over `providers`, tried in order.
    pub fn new(providers: Vec<Arc<dyn ChainProvider>>, config: GatewayConfig) -> Result<Self, SwapError> {
        if providers.is_empty() {
            return Err(SwapError::InvalidParameter("at least one chain provider is required".into()));
        }
        config
            .validate()
            .map_err(|e| SwapError::InvalidParameter(e.to_string()))?;
        Ok(Self {
            providers,
            current: AtomicUsize::new(0),
            config,
        })
    }

    /// Gateway configuration.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Name of the provider the next call starts with.
    pub fn current_provider(&self) -> &str {
        let idx = self.current.load(Ordering::Relaxed) % self.providers.len();
        self.providers[idx].name()
    }

    async fn rotate<T, F, Fut>(&self, operation: &str, passes: u32, pass_delay: Duration, call: F) -> Result<(T, String), Exhausted>
    where
        F: Fn(Arc<dyn ChainProvider>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let count = self.providers.len();
        let start = self.current.load(Ordering::Relaxed) % count;
        let timeout = self.config.request_timeout();
        let mut attempts = 0u32;
        let mut errors = Vec::new();

        for pass in 0..passes {
            if pass > 0 {
                tokio::time::sleep(pass_delay * pass).await;
            }
            for offset in 0..count {
                let idx = (start + offset) % count;
                let provider = Arc::clone(&self.providers[idx]);
                attempts += 1;

                let outcome = match tokio::time::timeout(timeout, call(Arc::clone(&provider))).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout(self.config.request_timeout_ms)),
                };
                match outcome {
                    Ok(value) => {
                        if idx != start {
                            info!(provider = provider.name(), "[gateway] switched provider for {}", operation);
                        }
                        self.current.store(idx, Ordering::Relaxed);
                        debug!(provider = provider.name(), attempt = attempts, "[gateway] {} ok", operation);
                        return Ok((value, provider.name().to_string()));
                    }
                    Err(e) => {
                        warn!(
                            provider = provider.name(),
                            attempt = attempts,
                            "[gateway] {} failed: {}",
                            operation,
                            e
                        );
                        errors.push(format!("{}: {}", provider.name(), e));
                    }
                }
            }
        }
        Err(Exhausted { attempts, errors })
    }

    async fn read<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, SwapError>
    where
        F: Fn(Arc<dyn ChainProvider>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let delay = Duration::from_millis(self.config.retry_delay_ms);
        self.rotate(operation, self.config.max_retries, delay, call)
            .await
            .map(|(value, _)| value)
            .map_err(|exhausted| SwapError::NetworkExhausted {
                operation: operation.to_string(),
                attempts: exhausted.attempts,
                last_error: exhausted.last_error(),
            })
    }

    /// UTXOs paying to `address`.
    pub async fn get_utxos(&self, address: &str) -> Result<Vec<Utxo>, SwapError> {
        let address = address.to_string();
        self.read("get_utxos", move |p| {
            let address = address.clone();
            async move { p.get_utxos(&address).await }
        })
        .await
    }

    /// Raw transaction hex.
    pub async fn get_transaction_hex(&self, txid: &str) -> Result<String, SwapError> {
        let txid = txid.to_string();
        self.read("get_transaction_hex", move |p| {
            let txid = txid.clone();
            async move { p.get_transaction_hex(&txid).await }
        })
        .await
    }

    /// Spend of `txid:vout`, if any.
    pub async fn get_output_spend(&self, txid: &str, vout: u32) -> Result<Option<OutputSpend>, SwapError> {
        let txid = txid.to_string();
        self.read("get_output_spend", move |p| {
            let txid = txid.clone();
            async move { p.get_output_spend(&txid, vout).await }
        })
        .await
    }

    /// Fee estimates.
    pub async fn get_fee_estimates(&self) -> Result<FeeEstimates, SwapError> {
        self.read("get_fee_estimates", |p| async move { p.get_fee_estimates().await })
            .await
    }

    /// Mempool backlog.
    pub async fn get_mempool_stats(&self) -> Result<MempoolStats, SwapError> {
        self.read("get_mempool_stats", |p| async move { p.get_mempool_stats().await })
            .await
    }

    /// Current tip height. Never returns 0; fails with `HeightUnavailable`.
    pub async fn get_current_block_height(&self) -> Result<u32, SwapError> {
        let delay = Duration::from_millis(self.config.height_retry_delay_ms);
        let result = self
            .rotate("get_current_block_height", self.config.height_max_retries, delay, |p| async move {
                match p.get_tip_height().await? {
                    0 => Err(ProviderError::Decode("provider reported height 0".into())),
                    height => Ok(height),
                }
            })
            .await;
        match result {
            Ok((height, _)) => Ok(height),
            Err(exhausted) => {
                error!(
                    attempts = exhausted.attempts,
                    "[gateway] block height unavailable from every provider; halting dependent operation"
                );
                Err(SwapError::HeightUnavailable {
                    attempts: exhausted.attempts,
                    last_error: exhausted.last_error(),
                })
            }
        }
    }

    /// Congestion band from mempool size. Falls back to `Normal` when no
    /// provider answers.
    pub async fn congestion_band(&self) -> CongestionBand {
        match self.get_mempool_stats().await {
            Ok(stats) => self.config.band_for(stats.count),
            Err(e) => {
                warn!("[gateway] mempool stats unavailable, assuming normal congestion: {}", e);
                CongestionBand::Normal
            }
        }
    }

    /// Fee rate (sat/vB) for `priority`, scaled by the congestion multiplier.
    pub async fn estimate_fee(&self, priority: FeePriority) -> Result<f64, SwapError> {
        let estimates = self.get_fee_estimates().await?;
        let band = self.congestion_band().await;
        let rate = estimates.for_priority(priority) * band.multiplier();
        debug!("[gateway] fee estimate {:?} x {:?} = {:.2} sat/vB", priority, band, rate);
        Ok(rate)
    }

    /// Broadcast a raw transaction.
    ///
    /// The raw transaction is decoded and its txid compared with
    /// `expected_txid` before any provider is contacted. Each provider is
    /// tried once; a provider that already knows the transaction counts as
    /// success with `already_broadcast = true`.
    pub async fn broadcast_transaction(&self, raw_hex: &str, expected_txid: Option<&str>) -> Result<BroadcastResult, SwapError> {
        let txid = decode_hex(raw_hex)?.compute_txid().to_string();
        if let Some(expected) = expected_txid {
            if !expected.eq_ignore_ascii_case(&txid) {
                error!(expected, actual = %txid, "[gateway] refusing broadcast: txid mismatch");
                return Err(SwapError::TxidMismatch {
                    expected: expected.to_string(),
                    actual: txid,
                });
            }
        }

        let raw = raw_hex.trim().to_string();
        let result = self
            .rotate("broadcast", 1, Duration::ZERO, {
                let txid = txid.clone();
                move |p| {
                    let raw = raw.clone();
                    let txid = txid.clone();
                    async move {
                        match p.broadcast(&raw).await {
                            Ok(returned) => {
                                if !returned.eq_ignore_ascii_case(&txid) {
                                    warn!(provider = p.name(), "[gateway] provider echoed txid {} for {}", returned, txid);
                                }
                                Ok(false)
                            }
                            Err(ProviderError::AlreadyKnown) => Ok(true),
                            Err(e) => Err(e),
                        }
                    }
                }
            })
            .await;

        match result {
            Ok((already_broadcast, provider)) => {
                if already_broadcast {
                    info!(txid = %txid, provider = %provider, "[gateway] transaction already known");
                } else {
                    info!(txid = %txid, provider = %provider, "[gateway] transaction broadcast");
                }
                Ok(BroadcastResult {
                    txid,
                    provider,
                    already_broadcast,
                })
            }
            Err(exhausted) => {
                let last_error = exhausted.last_error();
                error!(txid = %txid, "[gateway] broadcast failed on every provider: {}", last_error);
                Err(SwapError::TransactionBroadcastFailed {
                    attempts: exhausted.attempts,
                    errors: exhausted.errors,
                    last_error,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SimulatedChain;
    use crate::algorithms::transaction::{encode_hex, single_output_spend};
    use bitcoin::absolute::LockTime;
    use bitcoin::{OutPoint, ScriptBuf};

    fn config() -> GatewayConfig {
        GatewayConfig {
            request_timeout_ms: 1_000,
            max_retries: 3,
            retry_delay_ms: 100,
            height_max_retries: 4,
            height_retry_delay_ms: 50,
            ..Default::default()
        }
    }

    fn gateway(chains: &[Arc<SimulatedChain>]) -> NetworkGateway {
        let providers = chains
            .iter()
            .map(|c| Arc::clone(c) as Arc<dyn ChainProvider>)
            .collect();
        NetworkGateway::new(providers, config()).unwrap()
    }

    fn raw_tx() -> (String, String) {
        let tx = single_output_spend(
            OutPoint {
                txid: "22".repeat(32).parse().unwrap(),
                vout: 1,
            },
            50_000,
            1_000,
            ScriptBuf::new(),
            LockTime::ZERO,
        );
        (encode_hex(&tx), tx.compute_txid().to_string())
    }

    #[test]
    fn test_requires_a_provider() {
        assert!(NetworkGateway::new(vec![], config()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_attempts_every_provider_every_pass() {
        let a = Arc::new(SimulatedChain::new("a", 100));
        let b = Arc::new(SimulatedChain::new("b", 100));
        a.set_failing(true);
        b.set_failing(true);
        let gw = gateway(&[a.clone(), b.clone()]);

        let err = gw.get_utxos("bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080").await.unwrap_err();
        match err {
            SwapError::NetworkExhausted { attempts, ref last_error, .. } => {
                assert_eq!(attempts, 6);
                assert!(last_error.starts_with("b:"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(a.call_count(), 3);
        assert_eq!(b.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sticky_provider_after_failover() {
        let a = Arc::new(SimulatedChain::new("a", 100));
        let b = Arc::new(SimulatedChain::new("b", 100));
        a.set_failing(true);
        let gw = gateway(&[a.clone(), b.clone()]);

        assert_eq!(gw.get_mempool_stats().await.unwrap().count, 0);
        assert_eq!(gw.current_provider(), "b");
        assert_eq!(a.call_count(), 1);

        gw.get_mempool_stats().await.unwrap();
        assert_eq!(a.call_count(), 1);
        assert_eq!(b.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_on_later_pass() {
        let a = Arc::new(SimulatedChain::new("a", 100));
        a.fail_next(2);
        let gw = gateway(&[a.clone()]);
        assert!(gw.get_fee_estimates().await.is_ok());
        assert_eq!(a.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let slow = Arc::new(SimulatedChain::new("slow", 100));
        let fast = Arc::new(SimulatedChain::new("fast", 200));
        slow.set_latency(Some(Duration::from_secs(5)));
        let gw = gateway(&[slow, fast]);
        assert_eq!(gw.get_current_block_height().await.unwrap(), 200);
        assert_eq!(gw.current_provider(), "fast");
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_height_is_never_returned() {
        let zero = Arc::new(SimulatedChain::new("zero", 100));
        zero.set_zero_height(true);
        let gw = gateway(&[zero.clone()]);

        let err = gw.get_current_block_height().await.unwrap_err();
        assert!(matches!(err, SwapError::HeightUnavailable { attempts: 4, .. }));
        assert!(err.is_fatal());

        let good = Arc::new(SimulatedChain::new("good", 321));
        let gw = gateway(&[zero, good]);
        assert_eq!(gw.get_current_block_height().await.unwrap(), 321);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_already_known_is_success() {
        let a = Arc::new(SimulatedChain::new("a", 100));
        let gw = gateway(&[a.clone()]);
        let (raw, txid) = raw_tx();

        let first = gw.broadcast_transaction(&raw, Some(&txid)).await.unwrap();
        assert!(!first.already_broadcast);
        let second = gw.broadcast_transaction(&raw, Some(&txid)).await.unwrap();
        assert!(second.already_broadcast);
        assert_eq!(second.txid, txid);
        assert_eq!(a.broadcasts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_txid_checked_before_network() {
        let a = Arc::new(SimulatedChain::new("a", 100));
        let gw = gateway(&[a.clone()]);
        let (raw, _) = raw_tx();

        let err = gw.broadcast_transaction(&raw, Some(&"00".repeat(32))).await.unwrap_err();
        assert!(matches!(err, SwapError::TxidMismatch { .. }));
        assert!(gw.broadcast_transaction("beef", None).await.is_err());
        assert_eq!(a.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_aggregates_errors_single_pass() {
        let a = Arc::new(SimulatedChain::new("a", 100));
        let b = Arc::new(SimulatedChain::new("b", 100));
        a.set_broadcast_error(Some(ProviderError::Rejected("min relay fee not met".into())));
        b.set_failing(true);
        let gw = gateway(&[a.clone(), b.clone()]);
        let (raw, txid) = raw_tx();

        match gw.broadcast_transaction(&raw, Some(&txid)).await.unwrap_err() {
            SwapError::TransactionBroadcastFailed { attempts, errors, .. } => {
                assert_eq!(attempts, 2);
                assert!(errors[0].contains("min relay fee"));
                assert!(errors[1].starts_with("b:"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(a.call_count(), 1);
        assert_eq!(b.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fee_estimate_scaled_by_congestion() {
        let a = Arc::new(SimulatedChain::new("a", 100));
        let gw = gateway(&[a.clone()]);
        assert_eq!(gw.estimate_fee(FeePriority::Medium).await.unwrap(), 10.0);

        a.set_mempool_count(60_000);
        assert_eq!(gw.congestion_band().await, CongestionBand::High);
        assert_eq!(gw.estimate_fee(FeePriority::High).await.unwrap(), 30.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_congestion_falls_back_to_normal() {
        let a = Arc::new(SimulatedChain::new("a", 100));
        a.set_failing(true);
        let gw = gateway(&[a]);
        assert_eq!(gw.congestion_band().await, CongestionBand::Normal);
    }
}
