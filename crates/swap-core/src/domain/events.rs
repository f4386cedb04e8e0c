//! # Domain Events
//!
//! Typed notifications emitted by the watchtower, the claim scheduler and
//! the coordinator. Published on [`crate::service::EventBus`].

use super::errors::Hash;
use super::value_objects::{HtlcStatus, SwapStatus};
use serde::{Deserialize, Serialize};

/// Engine event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SwapEvent {
    /// HTLC moved between lifecycle states.
    HtlcStatusChanged {
        /// HTLC id
        htlc_id: String,
        /// Previous status
        from: HtlcStatus,
        /// New status
        to: HtlcStatus,
    },
    /// A claim spend revealed the preimage on chain.
    SecretRevealed {
        /// HTLC id
        htlc_id: String,
        /// Hash-lock the revealed secret satisfies
        #[serde(with = "hex")]
        secret_hash: Hash,
    },
    /// Timelock is within the auto-refund buffer.
    RefundImminent {
        /// HTLC id
        htlc_id: String,
        /// Blocks until timelock
        blocks_remaining: u32,
    },
    /// Watchtower broadcast a refund.
    RefundBroadcast {
        /// HTLC id
        htlc_id: String,
        /// Refund txid
        txid: String,
    },
    /// A watchtower poll failed; state unchanged.
    PollFailed {
        /// HTLC id
        htlc_id: String,
        /// Error text
        error: String,
    },
    /// Claim became eligible for dispatch.
    ClaimReady {
        /// Claim id
        claim_id: String,
    },
    /// Claim handed to an executor.
    ClaimDispatched {
        /// Claim id
        claim_id: String,
        /// Priority at dispatch
        priority: i64,
    },
    /// Claim executed.
    ClaimSucceeded {
        /// Claim id
        claim_id: String,
        /// Resulting txid / call reference
        txid: Option<String>,
        /// Dry-run result
        simulated: bool,
    },
    /// Claim attempt failed; will back off.
    ClaimFailed {
        /// Claim id
        claim_id: String,
        /// Failed attempts so far
        retry_count: u32,
        /// Error text
        error: String,
    },
    /// Claim permanently abandoned.
    ClaimAbandoned {
        /// Claim id
        claim_id: String,
        /// Why
        reason: String,
    },
    /// Swap moved between phases.
    SwapStatusChanged {
        /// Swap id
        swap_id: String,
        /// Previous phase
        from: SwapStatus,
        /// New phase
        to: SwapStatus,
    },
}

impl SwapEvent {
    /// Topic name used for logging and filtering.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::HtlcStatusChanged { .. }
            | Self::SecretRevealed { .. }
            | Self::RefundImminent { .. }
            | Self::RefundBroadcast { .. }
            | Self::PollFailed { .. } => "watchtower",
            Self::ClaimReady { .. }
            | Self::ClaimDispatched { .. }
            | Self::ClaimSucceeded { .. }
            | Self::ClaimFailed { .. }
            | Self::ClaimAbandoned { .. } => "scheduler",
            Self::SwapStatusChanged { .. } => "coordinator",
        }
    }
}
