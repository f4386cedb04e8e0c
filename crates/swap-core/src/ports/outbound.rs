//! # Outbound Ports
//!
//! Traits for external dependencies: chain data providers, the
//! smart-contract-chain escrow, alert delivery, persistence and claim
//! execution.

use crate::domain::{
    Entity, FeeEstimates, Hash, HtlcStatus, MempoolStats, OutputSpend, PendingClaim, ProviderError,
    SecureSecret, SwapError, Utxo,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// =============================================================================
// Chain data providers
// =============================================================================

/// One script-chain data provider. Responses are already normalized into
/// the canonical shapes; the gateway adds rotation, retries and timeouts.
#[async_trait]
pub trait ChainProvider: Send + Sync {
    /// Name used in logs and aggregated errors.
    fn name(&self) -> &str;

    /// Unspent outputs paying to an address.
    async fn get_utxos(&self, address: &str) -> Result<Vec<Utxo>, ProviderError>;

    /// Raw transaction hex.
    async fn get_transaction_hex(&self, txid: &str) -> Result<String, ProviderError>;

    /// The input spending `txid:vout`, if any.
    async fn get_output_spend(&self, txid: &str, vout: u32) -> Result<Option<OutputSpend>, ProviderError>;

    /// Chain tip height.
    async fn get_tip_height(&self) -> Result<u32, ProviderError>;

    /// Fee rates per confirmation target.
    async fn get_fee_estimates(&self) -> Result<FeeEstimates, ProviderError>;

    /// Mempool backlog.
    async fn get_mempool_stats(&self) -> Result<MempoolStats, ProviderError>;

    /// Submit a raw transaction; returns its txid or `AlreadyKnown`.
    async fn broadcast(&self, tx_hex: &str) -> Result<String, ProviderError>;
}

// =============================================================================
// Smart-contract-chain escrow
// =============================================================================

/// `createEscrow` arguments.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowParams {
    /// Party allowed to execute with the secret.
    pub resolver: String,
    /// Asset locked.
    pub from_asset: String,
    /// Asset expected in return.
    pub to_asset: String,
    /// Amount locked.
    pub amount: u64,
    /// Amount expected in return.
    pub expected_amount: u64,
    /// SHA-256 hash-lock.
    #[serde(with = "hex")]
    pub hash_lock: Hash,
    /// Refund deadline (unix secs).
    pub timelock: u64,
}

/// `getEscrow` view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowInfo {
    /// Escrow id.
    pub id: String,
    /// Executed with the secret.
    pub executed: bool,
    /// Refunded to the creator.
    pub refunded: bool,
    /// SHA-256 hash-lock.
    #[serde(with = "hex")]
    pub hash_lock: Hash,
    /// Refund deadline (unix secs).
    pub timelock: u64,
    /// Amount locked.
    pub amount: u64,
    /// Resolver.
    pub resolver: String,
}

/// Narrow call interface of the escrow contract.
#[async_trait]
pub trait EscrowContract: Send + Sync {
    /// Lock funds; returns the escrow id.
    async fn create_escrow(&self, params: EscrowParams) -> Result<String, SwapError>;

    /// Release to the resolver by revealing the secret; returns a call reference.
    async fn execute_with_secret(&self, escrow_id: &str, secret: &SecureSecret) -> Result<String, SwapError>;

    /// Reclaim after the deadline; returns a call reference.
    async fn refund(&self, escrow_id: &str) -> Result<String, SwapError>;

    /// Current escrow state.
    async fn get_escrow(&self, escrow_id: &str) -> Result<EscrowInfo, SwapError>;
}

// =============================================================================
// Alerts
// =============================================================================

/// Payload posted to the alert sink.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// HTLC id.
    pub htlc_id: String,
    /// Human-readable message.
    pub message: String,
    /// Unix secs.
    pub timestamp: u64,
    /// HTLC status at the time of the alert.
    pub status: HtlcStatus,
    /// HTLC timelock height.
    pub timelock: u32,
}

/// Alert delivery. Failures are logged by callers, never fatal.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver one alert.
    async fn send(&self, alert: &Alert) -> Result<(), SwapError>;
}

// =============================================================================
// Persistence
// =============================================================================

/// Per-entity store.
///
/// `update` is the single-writer status gate: the closure runs under the
/// store's write lock and its changes are only kept if it returns `Ok`.
pub trait Repository<T: Entity>: Send + Sync {
    /// Fetch by id.
    fn get(&self, id: &str) -> Result<Option<T>, SwapError>;

    /// Insert or replace.
    fn put(&self, item: T) -> Result<(), SwapError>;

    /// Remove; `true` if it existed.
    fn delete(&self, id: &str) -> Result<bool, SwapError>;

    /// All records.
    fn list(&self) -> Result<Vec<T>, SwapError>;

    /// Atomic read-modify-write; returns the stored result.
    fn update(&self, id: &str, f: &mut dyn FnMut(&mut T) -> Result<(), SwapError>) -> Result<T, SwapError>;

    /// Fetch or `NotFound`.
    fn require(&self, id: &str) -> Result<T, SwapError> {
        self.get(id)?.ok_or_else(|| SwapError::NotFound {
            kind: T::KIND,
            id: id.to_string(),
        })
    }
}

// =============================================================================
// Claim execution
// =============================================================================

/// Result of one claim execution.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimOutcome {
    /// Transaction id or call reference.
    pub txid: Option<String>,
    /// Fee paid or estimated, in the target chain's base unit.
    pub fee: Option<u64>,
    /// Dry-run result; nothing was broadcast.
    pub simulated: bool,
}

/// Executes ready claims against one target chain.
#[async_trait]
pub trait ClaimExecutor: Send + Sync {
    /// Perform the claim.
    async fn execute(&self, claim: &PendingClaim, secret: &SecureSecret) -> Result<ClaimOutcome, SwapError>;

    /// Estimate without broadcasting.
    async fn simulate(&self, claim: &PendingClaim, secret: &SecureSecret) -> Result<ClaimOutcome, SwapError>;
}
