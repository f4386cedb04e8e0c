//! # HTLC Script Interpreter
//!
//! Minimal evaluator for the opcode subset HTLC scripts use, with real
//! ECDSA checks against the segwit-v0 (P2WSH) or legacy (P2SH) sighash.
//!
//! The transaction builder runs every signed spend through this before
//! returning it, and the property tests use it to show that exactly one
//! branch accepts a given witness.

use crate::domain::AddressFormat;
use bitcoin::hashes::Hash as _;
use bitcoin::opcodes::all::{
    OP_CHECKSIG, OP_CLTV, OP_DROP, OP_ELSE, OP_ENDIF, OP_EQUALVERIFY, OP_IF, OP_SHA256, OP_SIZE,
};
use bitcoin::script::Instruction;
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::SighashCache;
use bitcoin::{absolute::LockTime, Amount, PublicKey, Script, Transaction};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Why a script rejected a stack.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScriptFailure {
    /// Not enough stack items for an opcode.
    #[error("stack underflow at {0}")]
    StackUnderflow(&'static str),
    /// `OP_IF` argument was not empty or `0x01`.
    #[error("non-minimal OP_IF argument")]
    MinimalIf,
    /// `OP_EQUALVERIFY` failed.
    #[error("OP_EQUALVERIFY failed")]
    EqualVerify,
    /// Timelock requirement not met.
    #[error("OP_CHECKLOCKTIMEVERIFY failed: {0}")]
    LockTime(String),
    /// Unbalanced conditionals.
    #[error("unbalanced conditional")]
    UnbalancedConditional,
    /// Opcode outside the supported subset.
    #[error("unsupported opcode {0}")]
    Unsupported(String),
    /// Numeric push could not be decoded.
    #[error("invalid script number")]
    BadNumber,
    /// Script bytes do not parse.
    #[error("malformed script: {0}")]
    Malformed(String),
    /// Sighash could not be computed.
    #[error("sighash: {0}")]
    Sighash(String),
    /// Final stack is not a single true value.
    #[error("script evaluated to false")]
    EvalFalse,
}

/// Input being verified.
pub struct SpendContext<'a> {
    /// Spending transaction.
    pub tx: &'a Transaction,
    /// Input index.
    pub input_index: usize,
    /// Value of the spent output (segwit sighash commits to it).
    pub amount: u64,
    /// How the script is wrapped.
    pub format: AddressFormat,
}

/// Evaluate `script` against `stack` (bottom first, script excluded).
pub fn verify_spend(script: &Script, stack: &[Vec<u8>], ctx: &SpendContext<'_>) -> Result<(), ScriptFailure> {
    let secp = Secp256k1::verification_only();
    let mut stack: Vec<Vec<u8>> = stack.to_vec();
    let mut exec: Vec<bool> = Vec::new();

    for instruction in script.instructions() {
        let instruction = instruction.map_err(|e| ScriptFailure::Malformed(e.to_string()))?;
        let executing = exec.iter().all(|b| *b);

        let op = match instruction {
            Instruction::PushBytes(bytes) => {
                if executing {
                    stack.push(bytes.as_bytes().to_vec());
                }
                continue;
            }
            Instruction::Op(op) => op,
        };

        if op == OP_IF {
            let cond = if executing {
                let top = pop(&mut stack, "OP_IF")?;
                match top.as_slice() {
                    [] => false,
                    [1] => true,
                    _ => return Err(ScriptFailure::MinimalIf),
                }
            } else {
                false
            };
            exec.push(cond);
            continue;
        }
        if op == OP_ELSE {
            let top = exec.last_mut().ok_or(ScriptFailure::UnbalancedConditional)?;
            *top = !*top;
            continue;
        }
        if op == OP_ENDIF {
            exec.pop().ok_or(ScriptFailure::UnbalancedConditional)?;
            continue;
        }
        if !executing {
            continue;
        }

        let code = op.to_u8();
        if (0x51..=0x60).contains(&code) {
            // OP_1 .. OP_16
            stack.push(encode_num(i64::from(code - 0x50)));
        } else if op == OP_SIZE {
            let len = stack.last().ok_or(ScriptFailure::StackUnderflow("OP_SIZE"))?.len();
            stack.push(encode_num(len as i64));
        } else if op == OP_EQUALVERIFY {
            let a = pop(&mut stack, "OP_EQUALVERIFY")?;
            let b = pop(&mut stack, "OP_EQUALVERIFY")?;
            if a != b {
                return Err(ScriptFailure::EqualVerify);
            }
        } else if op == OP_SHA256 {
            let top = pop(&mut stack, "OP_SHA256")?;
            stack.push(Sha256::digest(&top).to_vec());
        } else if op == OP_DROP {
            pop(&mut stack, "OP_DROP")?;
        } else if op == OP_CLTV {
            let top = stack.last().ok_or(ScriptFailure::StackUnderflow("OP_CLTV"))?;
            check_locktime(decode_num(top, 5)?, ctx)?;
        } else if op == OP_CHECKSIG {
            let pubkey = pop(&mut stack, "OP_CHECKSIG")?;
            let sig = pop(&mut stack, "OP_CHECKSIG")?;
            let ok = check_sig(&secp, &sig, &pubkey, script, ctx)?;
            stack.push(if ok { vec![1] } else { vec![] });
        } else {
            return Err(ScriptFailure::Unsupported(op.to_string()));
        }
    }

    if !exec.is_empty() {
        return Err(ScriptFailure::UnbalancedConditional);
    }
    match stack.as_slice() {
        [only] if is_true(only) => Ok(()),
        _ => Err(ScriptFailure::EvalFalse),
    }
}

fn pop(stack: &mut Vec<Vec<u8>>, at: &'static str) -> Result<Vec<u8>, ScriptFailure> {
    stack.pop().ok_or(ScriptFailure::StackUnderflow(at))
}

fn is_true(bytes: &[u8]) -> bool {
    match bytes.split_last() {
        None => false,
        Some((last, rest)) => rest.iter().any(|b| *b != 0) || (*last != 0 && *last != 0x80),
    }
}

fn check_locktime(required: i64, ctx: &SpendContext<'_>) -> Result<(), ScriptFailure> {
    if required < 0 {
        return Err(ScriptFailure::LockTime("negative lock".into()));
    }
    let required = u32::try_from(required).map_err(|_| ScriptFailure::BadNumber)?;
    let required = LockTime::from_consensus(required);
    let tx_lock = ctx.tx.lock_time;
    if !required.is_same_unit(tx_lock) {
        return Err(ScriptFailure::LockTime("lock type mismatch".into()));
    }
    if tx_lock.to_consensus_u32() < required.to_consensus_u32() {
        return Err(ScriptFailure::LockTime(format!(
            "tx lock {} below required {}",
            tx_lock.to_consensus_u32(),
            required.to_consensus_u32()
        )));
    }
    let input = ctx
        .tx
        .input
        .get(ctx.input_index)
        .ok_or_else(|| ScriptFailure::Sighash("input index out of range".into()))?;
    if input.sequence.is_final() {
        return Err(ScriptFailure::LockTime("final sequence disables lock time".into()));
    }
    Ok(())
}

fn check_sig(
    secp: &Secp256k1<bitcoin::secp256k1::VerifyOnly>,
    sig: &[u8],
    pubkey: &[u8],
    script: &Script,
    ctx: &SpendContext<'_>,
) -> Result<bool, ScriptFailure> {
    let Ok(signature) = bitcoin::ecdsa::Signature::from_slice(sig) else {
        return Ok(false);
    };
    let Ok(pubkey) = PublicKey::from_slice(pubkey) else {
        return Ok(false);
    };
    let cache = SighashCache::new(ctx.tx);
    let digest: [u8; 32] = match ctx.format {
        AddressFormat::P2wsh => {
            let mut cache = cache;
            cache
                .p2wsh_signature_hash(
                    ctx.input_index,
                    script,
                    Amount::from_sat(ctx.amount),
                    signature.sighash_type,
                )
                .map_err(|e| ScriptFailure::Sighash(e.to_string()))?
                .to_byte_array()
        }
        AddressFormat::P2sh => cache
            .legacy_signature_hash(ctx.input_index, script, signature.sighash_type.to_u32())
            .map_err(|e| ScriptFailure::Sighash(e.to_string()))?
            .to_byte_array(),
    };
    let msg = Message::from_digest(digest);
    Ok(secp.verify_ecdsa(&msg, &signature.signature, &pubkey.inner).is_ok())
}

/// Minimal little-endian sign-magnitude encoding.
pub fn encode_num(n: i64) -> Vec<u8> {
    if n == 0 {
        return Vec::new();
    }
    let negative = n < 0;
    let mut abs = n.unsigned_abs();
    let mut out = Vec::new();
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if out.last().is_some_and(|b| b & 0x80 != 0) {
        out.push(if negative { 0x80 } else { 0 });
    } else if negative {
        if let Some(last) = out.last_mut() {
            *last |= 0x80;
        }
    }
    out
}

/// Decode a script number of at most `max_len` bytes.
pub fn decode_num(bytes: &[u8], max_len: usize) -> Result<i64, ScriptFailure> {
    if bytes.len() > max_len {
        return Err(ScriptFailure::BadNumber);
    }
    let Some((last, _)) = bytes.split_last() else {
        return Ok(0);
    };
    let mut value: i64 = 0;
    for (i, b) in bytes.iter().enumerate() {
        value |= i64::from(*b) << (8 * i);
    }
    if last & 0x80 != 0 {
        let mask = !(0x80_i64 << (8 * (bytes.len() - 1)));
        Ok(-(value & mask))
    } else {
        Ok(value)
    }
}
