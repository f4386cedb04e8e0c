//! # HTLC Script Builder
//!
//! Compiles the script-chain redeem script and derives its funding address.
//!
//! ## Script layout
//!
//! ```text
//! OP_IF
//!     OP_SIZE 32 OP_EQUALVERIFY OP_SHA256 <hash_lock> OP_EQUALVERIFY
//!     <claim_pubkey> OP_CHECKSIG
//! OP_ELSE
//!     <timelock> OP_CHECKLOCKTIMEVERIFY OP_DROP
//!     <refund_pubkey> OP_CHECKSIG
//! OP_ENDIF
//! ```
//!
//! The revocable variant wraps that in an outer `OP_IF <revocation_pubkey>
//! OP_CHECKSIG OP_ELSE ... OP_ENDIF`, so the revoke branch is evaluated first.
//!
//! ## Replay protection
//!
//! Every built script is recorded in a [`ScriptRegistry`]. Rebuilding a
//! script that was seen before only logs a warning; rebuilding one that has
//! been claimed or refunded fails with `ScriptReuse`, because its
//! deterministic address could be funded a second time.

use crate::algorithms::secret::SecretVault;
use crate::domain::{
    invariant_above_dust, AddressFormat, Hash, HtlcConfig, HtlcScript, ScriptMetadata, SpendPath,
    SwapError, DUST_THRESHOLD_SAT, MAX_TIMELOCK,
};
use bitcoin::opcodes::all::{
    OP_CHECKSIG, OP_CLTV, OP_DROP, OP_ELSE, OP_ENDIF, OP_EQUALVERIFY, OP_IF, OP_SHA256, OP_SIZE,
};
use bitcoin::script::Builder;
use bitcoin::{Address, Network, PublicKey, ScriptBuf};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Witness selector that takes the `OP_IF` branch.
pub const BRANCH_TRUE: &[u8] = &[0x01];

/// Witness selector that takes the `OP_ELSE` branch.
pub const BRANCH_FALSE: &[u8] = &[];

/// Seen / redeemed script hashes.
///
/// One instance is shared by every builder in the process.
#[derive(Default)]
pub struct ScriptRegistry {
    seen: RwLock<HashSet<Hash>>,
    redeemed: RwLock<HashSet<Hash>>,
}

impl ScriptRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a build. Returns `true` on first sight.
    pub fn observe(&self, script_hash: Hash) -> bool {
        self.seen.write().insert(script_hash)
    }

    /// Mark a script as claimed or refunded.
    pub fn mark_redeemed(&self, script_hash: Hash) {
        if self.redeemed.write().insert(script_hash) {
            info!("[script] Marked script {} as redeemed", hex::encode(script_hash));
        }
    }

    /// Whether a script was redeemed.
    pub fn is_redeemed(&self, script_hash: &Hash) -> bool {
        self.redeemed.read().contains(script_hash)
    }

    /// `ScriptReuse` if the script was redeemed.
    pub fn ensure_not_redeemed(&self, script_hash: &Hash) -> Result<(), SwapError> {
        if self.is_redeemed(script_hash) {
            return Err(SwapError::ScriptReuse {
                script_hash: hex::encode(script_hash),
            });
        }
        Ok(())
    }

    /// Redeemed hashes as hex, for persistence.
    pub fn export_redeemed(&self) -> Vec<String> {
        let mut out: Vec<String> = self.redeemed.read().iter().map(hex::encode).collect();
        out.sort();
        out
    }

    /// Restore redeemed hashes. Malformed entries are skipped.
    pub fn import_redeemed<I: IntoIterator<Item = String>>(&self, hashes: I) -> usize {
        let mut redeemed = self.redeemed.write();
        let mut seen = self.seen.write();
        let mut count = 0;
        for h in hashes {
            match hex::decode(&h).ok().and_then(|b| <[u8; 32]>::try_from(b).ok()) {
                Some(hash) => {
                    redeemed.insert(hash);
                    seen.insert(hash);
                    count += 1;
                }
                None => warn!("[script] Skipping malformed redeemed hash {}", h),
            }
        }
        count
    }
}

/// Compiles HTLC scripts for one network.
pub struct ScriptBuilder {
    network: Network,
    registry: Arc<ScriptRegistry>,
    dust_threshold: u64,
}

impl ScriptBuilder {
    /// Builder with the default dust threshold.
    pub fn new(network: Network, registry: Arc<ScriptRegistry>) -> Self {
        Self {
            network,
            registry,
            dust_threshold: DUST_THRESHOLD_SAT,
        }
    }

    /// Override the dust threshold.
    pub fn with_dust_threshold(mut self, dust_threshold: u64) -> Self {
        self.dust_threshold = dust_threshold;
        self
    }

    /// Shared registry.
    pub fn registry(&self) -> &Arc<ScriptRegistry> {
        &self.registry
    }

    /// Network scripts are built for.
    pub fn network(&self) -> Network {
        self.network
    }

    /// Two-branch claim/refund script.
    pub fn build_htlc_script(&self, config: &HtlcConfig) -> Result<HtlcScript, SwapError> {
        if config.revocation_pubkey.is_some() {
            return Err(SwapError::InvalidParameter(
                "revocation key given; use build_revocable_htlc_script".to_string(),
            ));
        }
        self.build(config)
    }

    /// Three-branch script with an immediate revoke path checked first.
    pub fn build_revocable_htlc_script(&self, config: &HtlcConfig) -> Result<HtlcScript, SwapError> {
        if config.revocation_pubkey.is_none() {
            return Err(SwapError::InvalidParameter(
                "revocable script requires a revocation key".to_string(),
            ));
        }
        self.build(config)
    }

    /// Build whichever variant `config` describes.
    pub fn build(&self, config: &HtlcConfig) -> Result<HtlcScript, SwapError> {
        let claim = parse_pubkey("claim", &config.claim_pubkey)?;
        let refund = parse_pubkey("refund", &config.refund_pubkey)?;
        let revocation = config
            .revocation_pubkey
            .as_deref()
            .map(|k| parse_pubkey("revocation", k))
            .transpose()?;
        if config.timelock == 0 || config.timelock > MAX_TIMELOCK {
            return Err(SwapError::InvalidParameter(format!(
                "timelock {} outside 1..={}",
                config.timelock, MAX_TIMELOCK
            )));
        }
        invariant_above_dust(config.amount, self.dust_threshold)?;

        let script = match &revocation {
            None => two_branch(&config.hash_lock, &claim, &refund, config.timelock),
            Some(revoke) => {
                revocable(&config.hash_lock, &claim, &refund, revoke, config.timelock)
            }
        };

        let script_hash = SecretVault::hash_lock(script.as_bytes());
        self.registry.ensure_not_redeemed(&script_hash)?;
        if self.registry.observe(script_hash) {
            debug!("[script] Built new HTLC script {}", hex::encode(script_hash));
        } else {
            warn!(
                "[script] Rebuilding previously seen HTLC script {} (not yet redeemed)",
                hex::encode(script_hash)
            );
        }

        let address = match config.format {
            AddressFormat::P2wsh => Address::p2wsh(&script, self.network),
            AddressFormat::P2sh => Address::p2sh(&script, self.network)
                .map_err(|e| SwapError::InvalidParameter(format!("p2sh: {e}")))?,
        };

        Ok(HtlcScript {
            script: script.into_bytes(),
            address: address.to_string(),
            script_hash,
            format: config.format,
            revocable: revocation.is_some(),
            metadata: ScriptMetadata {
                hash_lock: config.hash_lock,
                claim_pubkey: claim.to_string(),
                refund_pubkey: refund.to_string(),
                revocation_pubkey: revocation.map(|k| k.to_string()),
                timelock: config.timelock,
                amount: config.amount,
            },
        })
    }
}

/// Parse a hex key and normalize it to compressed form.
pub fn parse_pubkey(role: &str, hex_key: &str) -> Result<PublicKey, SwapError> {
    let bytes = hex::decode(hex_key)
        .map_err(|e| SwapError::InvalidParameter(format!("{role} pubkey is not hex: {e}")))?;
    let key = PublicKey::from_slice(&bytes)
        .map_err(|e| SwapError::InvalidParameter(format!("{role} pubkey invalid: {e}")))?;
    Ok(PublicKey::new(key.inner))
}

fn claim_refund_branches(builder: Builder, hash_lock: &Hash, claim: &PublicKey, refund: &PublicKey, timelock: u32) -> Builder {
    builder
        .push_opcode(OP_IF)
        .push_opcode(OP_SIZE)
        .push_int(32)
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_SHA256)
        .push_slice(hash_lock)
        .push_opcode(OP_EQUALVERIFY)
        .push_key(claim)
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ELSE)
        .push_int(i64::from(timelock))
        .push_opcode(OP_CLTV)
        .push_opcode(OP_DROP)
        .push_key(refund)
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ENDIF)
}

fn two_branch(hash_lock: &Hash, claim: &PublicKey, refund: &PublicKey, timelock: u32) -> ScriptBuf {
    claim_refund_branches(Builder::new(), hash_lock, claim, refund, timelock).into_script()
}

fn revocable(
    hash_lock: &Hash,
    claim: &PublicKey,
    refund: &PublicKey,
    revoke: &PublicKey,
    timelock: u32,
) -> ScriptBuf {
    let builder = Builder::new()
        .push_opcode(OP_IF)
        .push_key(revoke)
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ELSE);
    claim_refund_branches(builder, hash_lock, claim, refund, timelock)
        .push_opcode(OP_ENDIF)
        .into_script()
}

// =============================================================================
// Spending stacks (script excluded)
// =============================================================================

/// `[sig, secret, 1]` (plus outer `0` when revocable).
pub fn claim_stack(signature: Vec<u8>, secret: &[u8; 32], revocable: bool) -> Vec<Vec<u8>> {
    let mut stack = vec![signature, secret.to_vec(), BRANCH_TRUE.to_vec()];
    if revocable {
        stack.push(BRANCH_FALSE.to_vec());
    }
    stack
}

/// `[sig, 0]` (plus outer `0` when revocable).
pub fn refund_stack(signature: Vec<u8>, revocable: bool) -> Vec<Vec<u8>> {
    let mut stack = vec![signature, BRANCH_FALSE.to_vec()];
    if revocable {
        stack.push(BRANCH_FALSE.to_vec());
    }
    stack
}

/// `[sig, 1]`.
pub fn revoke_stack(signature: Vec<u8>) -> Vec<Vec<u8>> {
    vec![signature, BRANCH_TRUE.to_vec()]
}

/// Branch taken by an observed spend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObservedSpend {
    /// Claim branch; carries the pushed preimage (not yet checked against the hash-lock).
    Claim {
        /// Preimage candidate
        preimage: Vec<u8>,
    },
    /// Refund branch.
    Refund,
    /// Revocation branch.
    Revoke,
    /// Stack does not match this script.
    Unknown,
}

impl ObservedSpend {
    /// Path, when recognized.
    pub fn path(&self) -> Option<SpendPath> {
        match self {
            Self::Claim { .. } => Some(SpendPath::Claim),
            Self::Refund => Some(SpendPath::Refund),
            Self::Revoke => Some(SpendPath::Revoke),
            Self::Unknown => None,
        }
    }
}

/// Classify a spending stack (witness items or scriptSig pushes, script last).
pub fn classify_spend(script: &HtlcScript, stack: &[Vec<u8>]) -> ObservedSpend {
    let Some((last, items)) = stack.split_last() else {
        return ObservedSpend::Unknown;
    };
    if last.as_slice() != script.script.as_slice() {
        return ObservedSpend::Unknown;
    }
    let mut items = items.to_vec();
    if script.revocable {
        match items.pop() {
            Some(sel) if sel == BRANCH_TRUE => return ObservedSpend::Revoke,
            Some(sel) if sel.is_empty() => {}
            _ => return ObservedSpend::Unknown,
        }
    }
    match items.pop() {
        Some(sel) if sel == BRANCH_TRUE => match items.pop() {
            Some(preimage) => ObservedSpend::Claim { preimage },
            None => ObservedSpend::Unknown,
        },
        Some(sel) if sel.is_empty() => ObservedSpend::Refund,
        _ => ObservedSpend::Unknown,
    }
}
