//! # Transaction Builder
//!
//! Builds, signs and broadcasts the transactions that move HTLC funds:
//! funding, claim (secret branch), refund (timelock branch) and revoke.
//!
//! Every spend is checked against the live chain height before signing,
//! passes the fee sanity check, and is run through the script interpreter
//! after signing. A script is recorded as redeemed only after its spend was
//! accepted by the network, so a failed broadcast can be retried.

use super::gateway::NetworkGateway;
use crate::algorithms::fees::P2WPKH_WITNESS_VBYTES;
use crate::algorithms::transaction::{
    attach_htlc_stack, dummy_signature, encode_hex, htlc_signature, p2wpkh_script, parse_address,
    parse_txid, rbf_input, self_check, sign_p2wpkh_input, single_output_spend,
};
use crate::algorithms::{
    check_fee_sanity, clamp_rate, claim_stack, fee_for_vsize, refund_stack, revoke_stack, ScriptRegistry,
    SecretVault,
};
use crate::domain::{
    invariant_above_dust, BroadcastResult, Hash, HtlcScript, SecureSecret, SpendPath, SwapError,
    TxBuilderConfig, Utxo,
};
use bitcoin::absolute::LockTime;
use bitcoin::secp256k1::{All, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{Amount, Network, OutPoint, PublicKey, ScriptBuf, Transaction, TxOut};
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Requests and results
// =============================================================================

/// Inputs for a funding transaction.
#[derive(Clone, Debug)]
pub struct FundingRequest {
    /// Candidate inputs, used in order until the target is covered.
    pub utxos: Vec<Utxo>,
    /// HTLC funding address.
    pub htlc_address: String,
    /// Change address.
    pub change_address: String,
    /// Amount locked in the HTLC.
    pub amount: u64,
    /// Fee rate, sat/vB.
    pub fee_rate: f64,
}

/// Unsigned (or P2WPKH-signed) funding transaction.
#[derive(Clone, Debug)]
pub struct FundingTransaction {
    /// Transaction.
    pub tx: Transaction,
    /// Transaction id.
    pub txid: String,
    /// Fee paid.
    pub fee: u64,
    /// Estimated vsize with witnesses.
    pub vsize: u64,
    /// Change returned (0 when folded into the fee).
    pub change: u64,
    /// Index of the HTLC output.
    pub htlc_vout: u32,
    /// Selected inputs, in input order.
    pub inputs: Vec<Utxo>,
}

/// An HTLC output to spend.
#[derive(Clone, Debug)]
pub struct SpendRequest {
    /// Funding transaction id.
    pub funding_txid: String,
    /// Funding output index.
    pub funding_vout: u32,
    /// Funding output value.
    pub value: u64,
    /// Script being spent.
    pub htlc: HtlcScript,
    /// Key for the branch taken.
    pub key: SecretKey,
    /// Where the funds go.
    pub destination: String,
    /// Explicit fee rate (sat/vB) before the congestion multiplier; `None`
    /// uses the gateway estimate.
    pub fee_rate: Option<f64>,
}

/// A signed, self-checked HTLC spend.
#[derive(Clone, Debug)]
pub struct SignedSpend {
    /// Transaction.
    pub tx: Transaction,
    /// Transaction id.
    pub txid: String,
    /// Raw hex.
    pub hex: String,
    /// Fee paid.
    pub fee: u64,
    /// Estimated vsize.
    pub vsize: u64,
    /// Fee rate used.
    pub fee_rate: f64,
    /// Script spent.
    pub script_hash: Hash,
    /// Branch taken.
    pub path: SpendPath,
}

// =============================================================================
// Builder
// =============================================================================

/// Script-chain transaction builder.
pub struct TransactionBuilder {
    gateway: Arc<NetworkGateway>,
    registry: Arc<ScriptRegistry>,
    config: TxBuilderConfig,
    network: Network,
    secp: Secp256k1<All>,
}

impl TransactionBuilder {
    /// Builder sharing the gateway and the script registry.
    pub fn new(
        gateway: Arc<NetworkGateway>,
        registry: Arc<ScriptRegistry>,
        config: TxBuilderConfig,
        network: Network,
    ) -> Self {
        Self {
            gateway,
            registry,
            config,
            network,
            secp: Secp256k1::new(),
        }
    }

    /// Gateway used for heights, fees and broadcast.
    pub fn gateway(&self) -> &Arc<NetworkGateway> {
        &self.gateway
    }

    /// Shared script registry.
    pub fn registry(&self) -> &Arc<ScriptRegistry> {
        &self.registry
    }

    /// Network addresses must belong to.
    pub fn network(&self) -> Network {
        self.network
    }

    /// Build a funding transaction paying `amount` to the HTLC address.
    ///
    /// Inputs are taken in order until amount plus fee is covered. Change at
    /// or below the dust threshold is left to the fee.
    pub fn build_funding(&self, request: &FundingRequest) -> Result<FundingTransaction, SwapError> {
        let htlc_spk = parse_address(&request.htlc_address, self.network)?.script_pubkey();
        let change_spk = parse_address(&request.change_address, self.network)?.script_pubkey();
        invariant_above_dust(request.amount, self.config.dust_threshold)?;
        if !request.fee_rate.is_finite() || request.fee_rate <= 0.0 {
            return Err(SwapError::InvalidParameter(format!("fee rate {} must be positive", request.fee_rate)));
        }
        let rate = clamp_rate(request.fee_rate, self.config.min_fee_rate, self.config.max_fee_rate);

        let mut selected: Vec<Utxo> = Vec::new();
        let mut total = 0u64;
        let mut fee = 0u64;
        for utxo in &request.utxos {
            selected.push(utxo.clone());
            total += utxo.value;
            let draft = funding_draft(&selected, &htlc_spk, request.amount, Some((&change_spk, 0)))?;
            fee = fee_for_vsize(estimate_funding_vsize(&draft), rate);
            if total >= request.amount + fee {
                break;
            }
        }
        if selected.is_empty() || total < request.amount + fee {
            return Err(SwapError::InsufficientFunds {
                required: request.amount + fee,
                available: total,
            });
        }

        let mut change = total - request.amount - fee;
        let tx = if change <= self.config.dust_threshold {
            debug!("[tx-builder] folding {} sat change into fee", change);
            change = 0;
            funding_draft(&selected, &htlc_spk, request.amount, None)?
        } else {
            funding_draft(&selected, &htlc_spk, request.amount, Some((&change_spk, change)))?
        };
        let vsize = estimate_funding_vsize(&tx);
        let (fee, _) = check_fee_sanity(total, request.amount + change, vsize, self.config.max_fee_rate)?;

        let txid = tx.compute_txid().to_string();
        info!(txid = %txid, fee, inputs = selected.len(), "[tx-builder] built funding transaction");
        Ok(FundingTransaction {
            tx,
            txid,
            fee,
            vsize,
            change,
            htlc_vout: 0,
            inputs: selected,
        })
    }

    /// Sign every funding input as a P2WPKH output of `key`.
    pub fn sign_funding_p2wpkh(&self, funding: &mut FundingTransaction, key: &SecretKey) -> Result<(), SwapError> {
        let ours = hex::encode(p2wpkh_script(&self.secp, key).as_bytes());
        for (index, utxo) in funding.inputs.iter().enumerate() {
            if !utxo.script_pubkey.eq_ignore_ascii_case(&ours) {
                return Err(SwapError::Signing(format!(
                    "input {}:{} is not a P2WPKH output of the funding key",
                    utxo.txid, utxo.vout
                )));
            }
            sign_p2wpkh_input(&self.secp, &mut funding.tx, index, utxo.value, key)?;
        }
        Ok(())
    }

    /// Claim via the secret branch. Refused once the chain reaches the timelock.
    pub async fn build_claim(&self, request: &SpendRequest, secret: &SecureSecret) -> Result<SignedSpend, SwapError> {
        self.prepare(SpendPath::Claim, request, Some(secret), None, false).await
    }

    /// Refund via the timelock branch. Refused before the timelock height.
    pub async fn build_refund(&self, request: &SpendRequest) -> Result<SignedSpend, SwapError> {
        self.prepare(SpendPath::Refund, request, None, None, false).await
    }

    /// Spend the revocation branch of a revocable script.
    pub async fn build_revoke(&self, request: &SpendRequest) -> Result<SignedSpend, SwapError> {
        self.prepare(SpendPath::Revoke, request, None, None, false).await
    }

    /// Broadcast a spend; the script is marked redeemed only on success.
    pub async fn broadcast_spend(&self, spend: &SignedSpend) -> Result<BroadcastResult, SwapError> {
        let result = self.gateway.broadcast_transaction(&spend.hex, Some(&spend.txid)).await?;
        self.registry.mark_redeemed(spend.script_hash);
        info!(
            txid = %result.txid,
            path = %spend.path,
            "[tx-builder] spend accepted; script {} marked redeemed",
            hex::encode(spend.script_hash)
        );
        Ok(result)
    }

    /// Rebuild `previous` at `fee_rate`. The new fee must exceed the old one.
    pub async fn bump_fee(
        &self,
        previous: &SignedSpend,
        request: &SpendRequest,
        secret: Option<&SecureSecret>,
        fee_rate: f64,
    ) -> Result<SignedSpend, SwapError> {
        if request.htlc.script_hash != previous.script_hash {
            return Err(SwapError::InvalidParameter("fee bump must spend the same script".into()));
        }
        let replacement = self
            .prepare(previous.path, request, secret, Some(fee_rate), true)
            .await?;
        if replacement.fee <= previous.fee {
            return Err(SwapError::InvalidParameter(format!(
                "replacement fee {} must exceed previous fee {}",
                replacement.fee, previous.fee
            )));
        }
        info!(
            old = %previous.txid,
            new = %replacement.txid,
            "[tx-builder] fee bumped {} -> {} sat",
            previous.fee,
            replacement.fee
        );
        Ok(replacement)
    }

    async fn prepare(
        &self,
        path: SpendPath,
        request: &SpendRequest,
        secret: Option<&SecureSecret>,
        exact_rate: Option<f64>,
        replacing: bool,
    ) -> Result<SignedSpend, SwapError> {
        let htlc = &request.htlc;
        if !replacing {
            self.registry.ensure_not_redeemed(&htlc.script_hash)?;
        }
        if SecretVault::hash_lock(&htlc.script) != htlc.script_hash {
            return Err(SwapError::InvalidParameter("script hash does not match script".into()));
        }

        let timelock = htlc.timelock();
        let lock_time = match path {
            SpendPath::Claim => {
                let secret = secret.ok_or(SwapError::InvalidSecret)?;
                SecretVault::ensure_valid(secret, &htlc.metadata.hash_lock)?;
                let height = self.gateway.get_current_block_height().await?;
                if height >= timelock {
                    warn!(height, timelock, "[tx-builder] claim refused: timelock reached");
                    return Err(SwapError::TimelockExpired {
                        current: u64::from(height),
                        timelock: u64::from(timelock),
                    });
                }
                LockTime::ZERO
            }
            SpendPath::Refund => {
                let height = self.gateway.get_current_block_height().await?;
                if height < timelock {
                    return Err(SwapError::TimelockNotExpired {
                        current: u64::from(height),
                        timelock: u64::from(timelock),
                    });
                }
                LockTime::from_height(timelock)
                    .map_err(|e| SwapError::InvalidParameter(format!("timelock {timelock}: {e}")))?
            }
            SpendPath::Revoke => {
                if !htlc.revocable {
                    return Err(SwapError::InvalidParameter("script has no revocation branch".into()));
                }
                LockTime::ZERO
            }
        };

        let expected_key = match path {
            SpendPath::Claim => Some(&htlc.metadata.claim_pubkey),
            SpendPath::Refund => Some(&htlc.metadata.refund_pubkey),
            SpendPath::Revoke => htlc.metadata.revocation_pubkey.as_ref(),
        };
        let actual_key = PublicKey::new(request.key.public_key(&self.secp)).to_string();
        if expected_key.map(|k| !k.eq_ignore_ascii_case(&actual_key)).unwrap_or(true) {
            return Err(SwapError::InvalidParameter(format!("signing key does not match the {path} key")));
        }

        let destination = parse_address(&request.destination, self.network)?.script_pubkey();
        let outpoint = OutPoint {
            txid: parse_txid(&request.funding_txid)?,
            vout: request.funding_vout,
        };
        let rate = self.spend_rate(request.fee_rate, exact_rate).await?;

        let stack_for = |signature: Vec<u8>| match path {
            SpendPath::Claim => match secret {
                Some(secret) => claim_stack(signature, secret.as_bytes(), htlc.revocable),
                None => claim_stack(signature, &[0u8; 32], htlc.revocable),
            },
            SpendPath::Refund => refund_stack(signature, htlc.revocable),
            SpendPath::Revoke => revoke_stack(signature),
        };

        let mut draft = single_output_spend(outpoint, request.value, 0, destination.clone(), lock_time);
        attach_htlc_stack(&mut draft, 0, htlc, stack_for(dummy_signature()))?;
        let vsize = draft.vsize() as u64;
        let fee = fee_for_vsize(vsize, rate);
        if request.value < fee + self.config.dust_threshold {
            return Err(SwapError::InsufficientFunds {
                required: fee + self.config.dust_threshold,
                available: request.value,
            });
        }

        let mut tx = single_output_spend(outpoint, request.value, fee, destination, lock_time);
        let output_value = tx.output.iter().map(|o| o.value.to_sat()).sum();
        let (fee, fee_rate) = check_fee_sanity(request.value, output_value, vsize, self.config.max_fee_rate)?;

        let signature = htlc_signature(&self.secp, &tx, 0, htlc, request.value, &request.key)?;
        attach_htlc_stack(&mut tx, 0, htlc, stack_for(signature))?;
        self_check(&tx, 0, htlc, request.value)?;

        let txid = tx.compute_txid().to_string();
        info!(txid = %txid, path = %path, fee, "[tx-builder] built {} transaction", path);
        Ok(SignedSpend {
            hex: encode_hex(&tx),
            tx,
            txid,
            fee,
            vsize,
            fee_rate,
            script_hash: htlc.script_hash,
            path,
        })
    }

    async fn spend_rate(&self, requested: Option<f64>, exact: Option<f64>) -> Result<f64, SwapError> {
        let (floor, ceiling) = (self.config.min_fee_rate, self.config.max_fee_rate);
        if let Some(rate) = exact {
            return Ok(rate.max(floor));
        }
        match requested {
            Some(rate) => {
                let band = self.gateway.congestion_band().await;
                Ok((rate * band.multiplier()).max(floor))
            }
            None => {
                let estimate = self.gateway.estimate_fee(self.config.spend_priority).await?;
                Ok(clamp_rate(estimate, floor, ceiling))
            }
        }
    }
}

fn funding_draft(
    inputs: &[Utxo],
    htlc_spk: &ScriptBuf,
    amount: u64,
    change: Option<(&ScriptBuf, u64)>,
) -> Result<Transaction, SwapError> {
    let input = inputs
        .iter()
        .map(|u| {
            Ok(rbf_input(OutPoint {
                txid: parse_txid(&u.txid)?,
                vout: u.vout,
            }))
        })
        .collect::<Result<Vec<_>, SwapError>>()?;
    let mut output = vec![TxOut {
        value: Amount::from_sat(amount),
        script_pubkey: htlc_spk.clone(),
    }];
    if let Some((script_pubkey, value)) = change {
        output.push(TxOut {
            value: Amount::from_sat(value),
            script_pubkey: script_pubkey.clone(),
        });
    }
    Ok(Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input,
        output,
    })
}

fn estimate_funding_vsize(unsigned: &Transaction) -> u64 {
    unsigned.vsize() as u64 + unsigned.input.len() as u64 * P2WPKH_WITNESS_VBYTES
}
