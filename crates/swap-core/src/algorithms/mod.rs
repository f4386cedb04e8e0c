//! # Algorithms
//!
//! Pure, synchronous building blocks: secrets, scripts, fees, transaction
//! assembly, the script interpreter and secret sealing.

pub mod fees;
pub mod script;
pub mod sealing;
pub mod secret;
pub mod transaction;
pub mod verify;

pub use fees::{check_fee_sanity, clamp_rate, fee_for_vsize};
pub use script::{
    classify_spend, claim_stack, parse_pubkey, refund_stack, revoke_stack, ObservedSpend,
    ScriptBuilder, ScriptRegistry,
};
pub use sealing::SecretSealer;
pub use secret::SecretVault;
pub use verify::{verify_spend, ScriptFailure, SpendContext};
