//! # HTLC Script Properties
//!
//! Fuzzed hash-locks and timelocks through the script interpreter: every
//! signed witness satisfies exactly the branch it was built for.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash as _;
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::{Network, OutPoint, Transaction, Txid};
use proptest::prelude::*;
use std::sync::Arc;
use swap_core::algorithms::transaction::{htlc_signature, p2wpkh_script, single_output_spend};
use swap_core::algorithms::{claim_stack, refund_stack, verify_spend, SpendContext};
use swap_core::domain::AddressFormat;
use swap_core::{HtlcConfig, HtlcScript, ScriptBuilder, ScriptRegistry, SecretVault};

const AMOUNT: u64 = 100_000;

fn secret_key(byte: u8) -> SecretKey {
    SecretKey::from_slice(&[byte; 32]).unwrap()
}

fn pubkey_hex(byte: u8) -> String {
    let secp = Secp256k1::new();
    bitcoin::PublicKey::new(secret_key(byte).public_key(&secp)).to_string()
}

fn build(hash_lock: [u8; 32], timelock: u32, format: AddressFormat) -> HtlcScript {
    ScriptBuilder::new(Network::Regtest, Arc::new(ScriptRegistry::new()))
        .build_htlc_script(&HtlcConfig {
            hash_lock,
            claim_pubkey: pubkey_hex(0x11),
            refund_pubkey: pubkey_hex(0x22),
            revocation_pubkey: None,
            timelock,
            amount: AMOUNT,
            format,
        })
        .unwrap()
}

fn spending_tx(lock_height: u32) -> Transaction {
    let secp = Secp256k1::new();
    single_output_spend(
        OutPoint::new(Txid::from_byte_array([0xAB; 32]), 0),
        AMOUNT,
        500,
        p2wpkh_script(&secp, &secret_key(0x44)),
        LockTime::from_height(lock_height).unwrap(),
    )
}

/// Sign with `key_byte` and evaluate `stack_for(signature)`.
fn evaluate(
    htlc: &HtlcScript,
    tx: &Transaction,
    key_byte: u8,
    stack_for: impl FnOnce(Vec<u8>) -> Vec<Vec<u8>>,
) -> bool {
    let secp = Secp256k1::new();
    let signature = htlc_signature(&secp, tx, 0, htlc, AMOUNT, &secret_key(key_byte)).unwrap();
    let ctx = SpendContext {
        tx,
        input_index: 0,
        amount: AMOUNT,
        format: htlc.format,
    };
    verify_spend(&htlc.script_buf(), &stack_for(signature), &ctx).is_ok()
}

fn format_strategy() -> impl Strategy<Value = AddressFormat> {
    prop_oneof![Just(AddressFormat::P2wsh), Just(AddressFormat::P2sh)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn claim_branch_needs_the_preimage(
        secret in any::<[u8; 32]>(),
        other in any::<[u8; 32]>(),
        timelock in 1u32..1_000_000,
        format in format_strategy(),
    ) {
        prop_assume!(secret != other);
        let htlc = build(SecretVault::hash_lock(&secret), timelock, format);
        let tx = spending_tx(0);

        prop_assert!(evaluate(&htlc, &tx, 0x11, |sig| claim_stack(sig, &secret, false)));
        prop_assert!(!evaluate(&htlc, &tx, 0x11, |sig| claim_stack(sig, &other, false)));
        // The refund key cannot take the claim branch even with the secret.
        prop_assert!(!evaluate(&htlc, &tx, 0x22, |sig| claim_stack(sig, &secret, false)));
    }

    #[test]
    fn refund_branch_opens_exactly_at_timelock(
        secret in any::<[u8; 32]>(),
        timelock in 1u32..1_000_000,
        offset in 0u32..1_000,
        format in format_strategy(),
    ) {
        let htlc = build(SecretVault::hash_lock(&secret), timelock, format);

        let early = spending_tx(offset % timelock);
        prop_assert!(!evaluate(&htlc, &early, 0x22, |sig| refund_stack(sig, false)));

        let due = spending_tx(timelock + offset);
        prop_assert!(evaluate(&htlc, &due, 0x22, |sig| refund_stack(sig, false)));
        // The claim key cannot take the refund branch.
        prop_assert!(!evaluate(&htlc, &due, 0x11, |sig| refund_stack(sig, false)));
    }

    #[test]
    fn exactly_one_branch_accepts_each_witness(
        secret in any::<[u8; 32]>(),
        timelock in 1u32..1_000_000,
        claim_branch in any::<bool>(),
    ) {
        let htlc = build(SecretVault::hash_lock(&secret), timelock, AddressFormat::P2wsh);
        let tx = spending_tx(timelock);
        let (as_claim, as_refund) = if claim_branch {
            (
                evaluate(&htlc, &tx, 0x11, |sig| claim_stack(sig, &secret, false)),
                evaluate(&htlc, &tx, 0x11, |sig| refund_stack(sig, false)),
            )
        } else {
            (
                evaluate(&htlc, &tx, 0x22, |sig| claim_stack(sig, &secret, false)),
                evaluate(&htlc, &tx, 0x22, |sig| refund_stack(sig, false)),
            )
        };
        prop_assert!(as_claim ^ as_refund);
        prop_assert_eq!(as_claim, claim_branch);
    }

    #[test]
    fn validate_iff_hash_matches(secret in any::<[u8; 32]>(), other in any::<[u8; 32]>()) {
        let hash_lock = SecretVault::hash_lock(&secret);
        prop_assert!(SecretVault::validate(&secret, &hash_lock));
        prop_assert_eq!(SecretVault::validate(&other, &hash_lock), other == secret);
    }
}
