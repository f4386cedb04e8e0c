//! # Domain Entities
//!
//! Records owned by the engine plus the canonical chain-data shapes every
//! provider response is normalized into.
//!
//! Byte fields serialize as hex so any persistence layer round-trips them
//! losslessly.

use super::errors::{Hash, SwapError};
use super::secure_secret::SecureSecret;
use super::value_objects::{AddressFormat, ClaimStatus, ClaimTarget, HtlcStatus, SwapStatus};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A record stored behind a [`crate::ports::Repository`].
pub trait Entity: Clone + Send + Sync + Serialize + serde::de::DeserializeOwned + 'static {
    /// Record kind used in `NotFound` errors.
    const KIND: &'static str;

    /// Primary key.
    fn id(&self) -> &str;
}

// =============================================================================
// Script chain
// =============================================================================

/// Inputs to the script builder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtlcConfig {
    /// SHA-256 of the secret.
    #[serde(with = "hex")]
    pub hash_lock: Hash,
    /// Recipient key (hex, compressed or uncompressed).
    pub claim_pubkey: String,
    /// Sender key (hex, compressed or uncompressed).
    pub refund_pubkey: String,
    /// Optional revocation key; makes the script three-branch.
    #[serde(default)]
    pub revocation_pubkey: Option<String>,
    /// Absolute block height after which refund is valid.
    pub timelock: u32,
    /// Funded amount in satoshis.
    pub amount: u64,
    /// Funding address format.
    #[serde(default)]
    pub format: AddressFormat,
}

/// Display/recovery metadata embedded alongside a compiled script.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptMetadata {
    /// SHA-256 hash-lock.
    #[serde(with = "hex")]
    pub hash_lock: Hash,
    /// Normalized (compressed) claim key, hex.
    pub claim_pubkey: String,
    /// Normalized (compressed) refund key, hex.
    pub refund_pubkey: String,
    /// Normalized revocation key, hex.
    #[serde(default)]
    pub revocation_pubkey: Option<String>,
    /// Absolute timelock height.
    pub timelock: u32,
    /// Amount in satoshis.
    pub amount: u64,
}

const METADATA_VERSION: u8 = 1;
const FLAG_REVOCABLE: u8 = 0x01;

impl ScriptMetadata {
    /// Compact hex blob: version, flags, hash-lock, timelock, amount, keys.
    pub fn encode(&self) -> Result<String, SwapError> {
        let mut out = Vec::with_capacity(1 + 1 + 32 + 4 + 8 + 33 * 3);
        out.push(METADATA_VERSION);
        out.push(if self.revocation_pubkey.is_some() { FLAG_REVOCABLE } else { 0 });
        out.extend_from_slice(&self.hash_lock);
        out.extend_from_slice(&self.timelock.to_be_bytes());
        out.extend_from_slice(&self.amount.to_be_bytes());
        for key in [Some(&self.claim_pubkey), Some(&self.refund_pubkey), self.revocation_pubkey.as_ref()]
            .into_iter()
            .flatten()
        {
            let bytes = hex::decode(key)
                .map_err(|e| SwapError::InvalidParameter(format!("metadata key: {e}")))?;
            if bytes.len() != 33 {
                return Err(SwapError::InvalidParameter(
                    "metadata keys must be compressed".to_string(),
                ));
            }
            out.extend_from_slice(&bytes);
        }
        Ok(hex::encode(out))
    }

    /// Inverse of [`ScriptMetadata::encode`].
    pub fn decode(encoded: &str) -> Result<Self, SwapError> {
        let bad = |why: &str| SwapError::InvalidParameter(format!("script metadata: {why}"));
        let bytes = hex::decode(encoded).map_err(|_| bad("not hex"))?;
        if bytes.len() < 2 || bytes[0] != METADATA_VERSION {
            return Err(bad("unknown version"));
        }
        let revocable = bytes[1] & FLAG_REVOCABLE != 0;
        let expected = 2 + 32 + 4 + 8 + 33 * if revocable { 3 } else { 2 };
        if bytes.len() != expected {
            return Err(bad("wrong length"));
        }

        let mut hash_lock = [0u8; 32];
        hash_lock.copy_from_slice(&bytes[2..34]);
        let mut timelock = [0u8; 4];
        timelock.copy_from_slice(&bytes[34..38]);
        let mut amount = [0u8; 8];
        amount.copy_from_slice(&bytes[38..46]);
        let key_at = |i: usize| hex::encode(&bytes[46 + 33 * i..46 + 33 * (i + 1)]);

        Ok(Self {
            hash_lock,
            claim_pubkey: key_at(0),
            refund_pubkey: key_at(1),
            revocation_pubkey: revocable.then(|| key_at(2)),
            timelock: u32::from_be_bytes(timelock),
            amount: u64::from_be_bytes(amount),
        })
    }
}

/// A compiled HTLC redeem script and its funding address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtlcScript {
    /// Redeem / witness script bytes.
    #[serde(with = "hex")]
    pub script: Vec<u8>,
    /// Funding address.
    pub address: String,
    /// SHA-256 of the script; replay-protection key.
    #[serde(with = "hex")]
    pub script_hash: Hash,
    /// Address format the script was compiled for.
    pub format: AddressFormat,
    /// Whether the script carries a revocation branch.
    pub revocable: bool,
    /// Normalized build parameters.
    pub metadata: ScriptMetadata,
}

impl HtlcScript {
    /// Script as a `bitcoin` script buffer.
    pub fn script_buf(&self) -> bitcoin::ScriptBuf {
        bitcoin::ScriptBuf::from_bytes(self.script.clone())
    }

    /// Output script paying to this HTLC.
    pub fn script_pubkey(&self) -> bitcoin::ScriptBuf {
        let script = self.script_buf();
        match self.format {
            AddressFormat::P2wsh => bitcoin::ScriptBuf::new_p2wsh(&script.wscript_hash()),
            AddressFormat::P2sh => bitcoin::ScriptBuf::new_p2sh(&script.script_hash()),
        }
    }

    /// Hex script hash.
    pub fn script_hash_hex(&self) -> String {
        hex::encode(self.script_hash)
    }

    /// Absolute timelock height.
    pub fn timelock(&self) -> u32 {
        self.metadata.timelock
    }
}

/// Authoritative record of one script-chain HTLC.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HtlcState {
    /// Record id.
    pub id: String,
    /// Build parameters.
    pub config: HtlcConfig,
    /// Compiled script.
    pub script: HtlcScript,
    /// Funding transaction id.
    pub funding_txid: Option<String>,
    /// Funding output index.
    pub funding_vout: Option<u32>,
    /// Lifecycle status.
    pub status: HtlcStatus,
    /// Preimage once revealed on chain.
    pub secret: Option<SecureSecret>,
    /// Claim spend txid.
    pub claim_txid: Option<String>,
    /// Refund spend txid.
    pub refund_txid: Option<String>,
    /// Revocation spend txid.
    pub revoke_txid: Option<String>,
    /// Creation time (unix secs).
    pub created_at: u64,
    /// Timelock height.
    pub expires_at: u32,
    /// Last successful watchtower poll (unix secs).
    pub last_checked: Option<u64>,
    /// Last claim/refund failure for operator inspection.
    pub last_error: Option<String>,
}

impl HtlcState {
    /// New record in `created`.
    pub fn new(id: impl Into<String>, config: HtlcConfig, script: HtlcScript) -> Self {
        let expires_at = script.timelock();
        Self {
            id: id.into(),
            config,
            script,
            funding_txid: None,
            funding_vout: None,
            status: HtlcStatus::Created,
            secret: None,
            claim_txid: None,
            refund_txid: None,
            revoke_txid: None,
            created_at: unix_now(),
            expires_at,
            last_checked: None,
            last_error: None,
        }
    }

    /// Move to `next` if the state machine allows it.
    pub fn transition(&mut self, next: HtlcStatus) -> Result<(), SwapError> {
        if !self.status.can_transition_to(next) {
            return Err(SwapError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Funding outpoint, once known.
    pub fn funding_outpoint(&self) -> Option<(&str, u32)> {
        Some((self.funding_txid.as_deref()?, self.funding_vout?))
    }
}

impl Entity for HtlcState {
    const KIND: &'static str = "HTLC";

    fn id(&self) -> &str {
        &self.id
    }
}

// =============================================================================
// Cross-chain swap
// =============================================================================

/// A 32-byte secret encrypted under the process sealing key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSecret {
    /// XChaCha20 nonce.
    #[serde(with = "hex")]
    pub nonce: [u8; 24],
    /// Ciphertext with Poly1305 tag.
    #[serde(with = "hex")]
    pub ciphertext: Vec<u8>,
}

impl std::fmt::Debug for SealedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SealedSecret(***)")
    }
}

/// Numeric quote consumed from the liquidity aggregator.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapQuote {
    /// Asset given.
    pub from_asset: String,
    /// Asset received.
    pub to_asset: String,
    /// Amount given.
    pub amount: u64,
    /// Amount expected in return.
    pub expected_amount: u64,
    /// Aggregator fee estimate.
    pub fee_estimate: u64,
}

/// Cross-chain record for one user-initiated swap.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AtomicSwapState {
    /// Swap id.
    pub id: String,
    /// Phase.
    pub status: SwapStatus,
    /// Smart-contract-chain escrow id.
    pub escrow_id: Option<String>,
    /// Script-chain HTLC record id.
    pub htlc_id: Option<String>,
    /// Sealed preimage (initiator side only).
    pub secret: Option<SealedSecret>,
    /// SHA-256 hash-lock shared by both legs.
    #[serde(with = "hex")]
    pub secret_hash: Hash,
    /// Escrow deadline (unix secs).
    pub timelock: u64,
    /// Counterparty / resolver address on the smart-contract chain.
    pub resolver: String,
    /// Fixed quote.
    pub quote: SwapQuote,
    /// Queued script-chain claim.
    pub claim_id: Option<String>,
    /// Creation time (unix secs).
    pub created_at: u64,
    /// Completion time (unix secs).
    pub completed_at: Option<u64>,
    /// Reason for `failed`.
    pub last_error: Option<String>,
}

impl AtomicSwapState {
    /// Move to `next` if the state machine allows it.
    pub fn transition(&mut self, next: SwapStatus) -> Result<(), SwapError> {
        if !self.status.can_transition_to(next) {
            return Err(SwapError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(unix_now());
        }
        Ok(())
    }
}

impl Entity for AtomicSwapState {
    const KIND: &'static str = "Swap";

    fn id(&self) -> &str {
        &self.id
    }
}

// =============================================================================
// Claim queue
// =============================================================================

/// Scheduler queue entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingClaim {
    /// Claim id.
    pub id: String,
    /// Where to execute.
    pub target: ClaimTarget,
    /// Hash-lock the secret must match.
    #[serde(with = "hex")]
    pub secret_hash: Hash,
    /// Sealed secret, once known.
    pub secret: Option<SealedSecret>,
    /// Claim deadline (unix secs).
    pub timelock: u64,
    /// Status; `claiming` is the dispatch lock.
    pub status: ClaimStatus,
    /// Minutes until deadline; lower runs first.
    pub priority: i64,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Attempts allowed before abandoning.
    pub max_retries: u32,
    /// Last failure.
    pub last_error: Option<String>,
    /// Claim transaction / call reference.
    pub txid: Option<String>,
    /// Creation time (unix secs).
    pub created_at: u64,
    /// Last status change (unix secs).
    pub updated_at: u64,
}

impl PendingClaim {
    /// New claim in `pending` (or `ready` when the secret is supplied).
    pub fn new(
        target: ClaimTarget,
        secret_hash: Hash,
        secret: Option<SealedSecret>,
        timelock: u64,
        max_retries: u32,
    ) -> Self {
        let now = unix_now();
        let status = if secret.is_some() { ClaimStatus::Ready } else { ClaimStatus::Pending };
        let mut claim = Self {
            id: uuid::Uuid::new_v4().to_string(),
            target,
            secret_hash,
            secret,
            timelock,
            status,
            priority: 0,
            retry_count: 0,
            max_retries,
            last_error: None,
            txid: None,
            created_at: now,
            updated_at: now,
        };
        claim.refresh_priority(now);
        claim
    }

    /// Recompute priority as whole minutes until the deadline.
    pub fn refresh_priority(&mut self, now: u64) {
        self.priority = (self.timelock as i64 - now as i64).div_euclid(60);
    }

    /// Deadline reached.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.timelock
    }

    /// Retry budget remaining.
    pub fn has_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Set status and bump `updated_at`.
    pub fn set_status(&mut self, status: ClaimStatus) {
        self.status = status;
        self.updated_at = unix_now();
    }
}

impl Entity for PendingClaim {
    const KIND: &'static str = "Claim";

    fn id(&self) -> &str {
        &self.id
    }
}

// =============================================================================
// Canonical chain data
// =============================================================================

/// Unspent output as reported by a provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    /// Transaction id.
    pub txid: String,
    /// Output index.
    pub vout: u32,
    /// Value in satoshis.
    pub value: u64,
    /// Output script, hex.
    pub script_pubkey: String,
    /// Confirmations (0 = mempool).
    pub confirmations: u32,
}

/// The input that spent a watched output.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpend {
    /// Spending transaction id.
    pub txid: String,
    /// Input index in the spending transaction.
    pub vin: u32,
    /// Witness stack items.
    pub witness: Vec<Vec<u8>>,
    /// scriptSig bytes (legacy spends).
    pub script_sig: Vec<u8>,
}

impl OutputSpend {
    /// Witness items, or scriptSig pushes for legacy spends.
    pub fn stack(&self) -> Vec<Vec<u8>> {
        if !self.witness.is_empty() {
            return self.witness.clone();
        }
        bitcoin::Script::from_bytes(&self.script_sig)
            .instructions()
            .filter_map(|ins| match ins {
                Ok(bitcoin::script::Instruction::PushBytes(bytes)) => Some(bytes.as_bytes().to_vec()),
                _ => None,
            })
            .collect()
    }
}

/// Fee rates in sat/vB per confirmation target.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeeEstimates {
    /// Next block.
    pub fastest: f64,
    /// ~3 blocks.
    pub half_hour: f64,
    /// ~6 blocks.
    pub hour: f64,
    /// ~144 blocks.
    pub economy: f64,
}

impl FeeEstimates {
    /// Rate for a priority.
    pub fn for_priority(&self, priority: super::value_objects::FeePriority) -> f64 {
        use super::value_objects::FeePriority::*;
        match priority {
            High => self.fastest,
            Medium => self.half_hour,
            Low => self.hour,
        }
    }
}

/// Mempool backlog snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MempoolStats {
    /// Unconfirmed transaction count.
    pub count: u64,
    /// Total virtual size, when reported.
    pub vsize: u64,
}

/// Outcome of a gateway broadcast.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastResult {
    /// Transaction id.
    pub txid: String,
    /// Provider that accepted it.
    pub provider: String,
    /// Provider reported the transaction as already known.
    pub already_broadcast: bool,
}
