//! # Transaction Assembly
//!
//! Pure helpers for building, signing and encoding script-chain
//! transactions. No network access; the async
//! [`crate::service::TransactionBuilder`] composes these with live chain data.

use super::fees::MAX_SIGNATURE_LEN;
use super::verify::{verify_spend, SpendContext};
use crate::domain::{AddressFormat, HtlcScript, SwapError};
use bitcoin::address::NetworkUnchecked;
use bitcoin::absolute::LockTime;
use bitcoin::consensus;
use bitcoin::hashes::Hash as _;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{All, Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, CompressedPublicKey, Network, OutPoint, ScriptBuf, Sequence, Transaction,
    TxIn, TxOut, Txid, Witness,
};
use std::str::FromStr;

/// Parse an address and require it to belong to `network`.
pub fn parse_address(address: &str, network: Network) -> Result<Address, SwapError> {
    address
        .parse::<Address<NetworkUnchecked>>()
        .map_err(|e| SwapError::InvalidAddress(format!("{address}: {e}")))?
        .require_network(network)
        .map_err(|e| SwapError::InvalidAddress(format!("{address}: {e}")))
}

/// Parse a hex txid.
pub fn parse_txid(txid: &str) -> Result<Txid, SwapError> {
    Txid::from_str(txid).map_err(|e| SwapError::InvalidParameter(format!("txid {txid}: {e}")))
}

/// Consensus-encode as hex.
pub fn encode_hex(tx: &Transaction) -> String {
    hex::encode(consensus::serialize(tx))
}

/// Decode a raw hex transaction.
pub fn decode_hex(raw: &str) -> Result<Transaction, SwapError> {
    let bytes = hex::decode(raw.trim())
        .map_err(|e| SwapError::InvalidParameter(format!("raw transaction is not hex: {e}")))?;
    consensus::deserialize::<Transaction>(&bytes)
        .map_err(|e| SwapError::InvalidParameter(format!("raw transaction does not decode: {e}")))
}

/// Replaceable input with an empty script/witness.
pub fn rbf_input(previous_output: OutPoint) -> TxIn {
    TxIn {
        previous_output,
        script_sig: ScriptBuf::new(),
        sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
        witness: Witness::new(),
    }
}

/// One input, one output spend of an HTLC outpoint.
pub fn single_output_spend(
    outpoint: OutPoint,
    value: u64,
    fee: u64,
    destination: ScriptBuf,
    lock_time: LockTime,
) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time,
        input: vec![rbf_input(outpoint)],
        output: vec![TxOut {
            value: Amount::from_sat(value.saturating_sub(fee)),
            script_pubkey: destination,
        }],
    }
}

/// Placeholder signature of maximum length, for size estimation.
pub fn dummy_signature() -> Vec<u8> {
    vec![0u8; MAX_SIGNATURE_LEN]
}

/// ECDSA signature over the HTLC input, DER plus `SIGHASH_ALL`.
pub fn htlc_signature(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    input_index: usize,
    htlc: &HtlcScript,
    value: u64,
    key: &SecretKey,
) -> Result<Vec<u8>, SwapError> {
    let script = htlc.script_buf();
    let cache = SighashCache::new(tx);
    let digest: [u8; 32] = match htlc.format {
        AddressFormat::P2wsh => {
            let mut cache = cache;
            cache
                .p2wsh_signature_hash(input_index, &script, Amount::from_sat(value), EcdsaSighashType::All)
                .map_err(|e| SwapError::Signing(format!("sighash: {e}")))?
                .to_byte_array()
        }
        AddressFormat::P2sh => cache
            .legacy_signature_hash(input_index, &script, EcdsaSighashType::All.to_u32())
            .map_err(|e| SwapError::Signing(format!("sighash: {e}")))?
            .to_byte_array(),
    };
    let msg = Message::from_digest(digest);
    let signature = bitcoin::ecdsa::Signature {
        signature: secp.sign_ecdsa(&msg, key),
        sighash_type: EcdsaSighashType::All,
    };
    Ok(signature.to_vec())
}

/// Place a spending stack plus the script on an input.
pub fn attach_htlc_stack(
    tx: &mut Transaction,
    input_index: usize,
    htlc: &HtlcScript,
    stack: Vec<Vec<u8>>,
) -> Result<(), SwapError> {
    let input = tx
        .input
        .get_mut(input_index)
        .ok_or_else(|| SwapError::Signing(format!("no input {input_index}")))?;
    match htlc.format {
        AddressFormat::P2wsh => {
            let mut witness = Witness::new();
            for item in stack {
                witness.push(item);
            }
            witness.push(&htlc.script);
            input.witness = witness;
        }
        AddressFormat::P2sh => {
            let mut builder = Builder::new();
            for item in stack.into_iter().chain(std::iter::once(htlc.script.clone())) {
                let push = PushBytesBuf::try_from(item)
                    .map_err(|e| SwapError::Signing(format!("scriptSig push: {e}")))?;
                builder = builder.push_slice(push);
            }
            input.script_sig = builder.into_script();
        }
    }
    Ok(())
}

/// Run the signed input through the script interpreter.
pub fn self_check(tx: &Transaction, input_index: usize, htlc: &HtlcScript, value: u64) -> Result<(), SwapError> {
    let input = tx
        .input
        .get(input_index)
        .ok_or_else(|| SwapError::Signing(format!("no input {input_index}")))?;
    let mut stack: Vec<Vec<u8>> = match htlc.format {
        AddressFormat::P2wsh => input.witness.to_vec(),
        AddressFormat::P2sh => crate::domain::OutputSpend {
            script_sig: input.script_sig.to_bytes(),
            ..Default::default()
        }
        .stack(),
    };
    stack.pop();
    let ctx = SpendContext {
        tx,
        input_index,
        amount: value,
        format: htlc.format,
    };
    verify_spend(&htlc.script_buf(), &stack, &ctx)
        .map_err(|e| SwapError::Signing(format!("self-check failed: {e}")))
}

/// Output script of the P2WPKH address controlled by `key`.
pub fn p2wpkh_script(secp: &Secp256k1<All>, key: &SecretKey) -> ScriptBuf {
    let pubkey = CompressedPublicKey(key.public_key(secp));
    ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash())
}

/// Sign a P2WPKH input controlled by `key`.
pub fn sign_p2wpkh_input(
    secp: &Secp256k1<All>,
    tx: &mut Transaction,
    input_index: usize,
    value: u64,
    key: &SecretKey,
) -> Result<(), SwapError> {
    let script_pubkey = p2wpkh_script(secp, key);
    let sighash = SighashCache::new(&*tx)
        .p2wpkh_signature_hash(input_index, &script_pubkey, Amount::from_sat(value), EcdsaSighashType::All)
        .map_err(|e| SwapError::Signing(format!("sighash: {e}")))?;
    let msg = Message::from_digest(sighash.to_byte_array());
    let signature = bitcoin::ecdsa::Signature {
        signature: secp.sign_ecdsa(&msg, key),
        sighash_type: EcdsaSighashType::All,
    };
    let witness = Witness::p2wpkh(&signature, &key.public_key(secp));
    let input = tx
        .input
        .get_mut(input_index)
        .ok_or_else(|| SwapError::Signing(format!("no input {input_index}")))?;
    input.witness = witness;
    Ok(())
}
