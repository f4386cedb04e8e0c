//! Chain provider decorator counting requests and broadcasts.

use async_trait::async_trait;
use std::sync::Arc;
use swap_core::domain::{FeeEstimates, MempoolStats, OutputSpend, ProviderError, Utxo};
use swap_core::ChainProvider;
use swap_telemetry::{metric_inc, BROADCASTS, PROVIDER_REQUESTS};

/// Wraps a [`ChainProvider`] and records every call in
/// `swap_gateway_provider_requests_total`.
pub struct InstrumentedProvider {
    inner: Arc<dyn ChainProvider>,
}

impl InstrumentedProvider {
    /// Decorate `inner`.
    pub fn new(inner: Arc<dyn ChainProvider>) -> Self {
        Self { inner }
    }

    fn record<T>(operation: &str, result: &Result<T, ProviderError>) {
        let outcome = if result.is_ok() { "ok" } else { "failed" };
        metric_inc!(PROVIDER_REQUESTS, &[operation, outcome]);
    }
}

#[async_trait]
impl ChainProvider for InstrumentedProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get_utxos(&self, address: &str) -> Result<Vec<Utxo>, ProviderError> {
        let result = self.inner.get_utxos(address).await;
        Self::record("utxos", &result);
        result
    }

    async fn get_transaction_hex(&self, txid: &str) -> Result<String, ProviderError> {
        let result = self.inner.get_transaction_hex(txid).await;
        Self::record("transaction", &result);
        result
    }

    async fn get_output_spend(&self, txid: &str, vout: u32) -> Result<Option<OutputSpend>, ProviderError> {
        let result = self.inner.get_output_spend(txid, vout).await;
        Self::record("outspend", &result);
        result
    }

    async fn get_tip_height(&self) -> Result<u32, ProviderError> {
        let result = self.inner.get_tip_height().await;
        Self::record("tip_height", &result);
        result
    }

    async fn get_fee_estimates(&self) -> Result<FeeEstimates, ProviderError> {
        let result = self.inner.get_fee_estimates().await;
        Self::record("fee_estimates", &result);
        result
    }

    async fn get_mempool_stats(&self) -> Result<MempoolStats, ProviderError> {
        let result = self.inner.get_mempool_stats().await;
        Self::record("mempool", &result);
        result
    }

    async fn broadcast(&self, tx_hex: &str) -> Result<String, ProviderError> {
        let result = self.inner.broadcast(tx_hex).await;
        let outcome = match &result {
            Ok(_) => "accepted",
            Err(ProviderError::AlreadyKnown) => "already_known",
            Err(_) => "failed",
        };
        metric_inc!(BROADCASTS, &[outcome]);
        Self::record("broadcast", &result);
        result
    }
}
