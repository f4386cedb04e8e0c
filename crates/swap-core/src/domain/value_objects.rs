//! # Domain Value Objects
//!
//! State machines and small value types shared across the engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Script-chain HTLC lifecycle.
///
/// ```text
/// created -> funded -> { claimed | refunded | revoked }
///                  \-> expired -> refunded
///  (any non-terminal) -> failed -> { claimed | refunded | revoked }
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HtlcStatus {
    /// Script built, funding not yet accepted by the network.
    #[default]
    Created,
    /// Funding output confirmed or accepted, watchtower polling.
    Funded,
    /// Spent through the claim branch with the matching preimage.
    Claimed,
    /// Spent back to the sender.
    Refunded,
    /// Timelock reached while the funding output is still unspent.
    Expired,
    /// Spent through the revocation branch.
    Revoked,
    /// A claim or refund attempt failed; see `last_error`.
    Failed,
}

impl HtlcStatus {
    /// Check if transition is valid.
    pub fn can_transition_to(&self, next: HtlcStatus) -> bool {
        use HtlcStatus::*;
        match (self, next) {
            (Created, Funded) | (Created, Failed) => true,
            (Funded, Claimed | Refunded | Expired | Revoked | Failed) => true,
            // The claim branch carries no on-chain expiry, so a late claim can still land.
            (Expired, Claimed | Refunded | Revoked | Failed) => true,
            (Failed, Claimed | Refunded | Revoked | Expired) => true,
            _ => false,
        }
    }

    /// Terminal states end watchtower polling.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Claimed | Self::Refunded | Self::Revoked)
    }

    /// States in which the funding output may still be on chain unspent.
    pub fn is_watchable(&self) -> bool {
        matches!(self, Self::Funded | Self::Expired | Self::Failed)
    }
}

impl fmt::Display for HtlcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Funded => "funded",
            Self::Claimed => "claimed",
            Self::Refunded => "refunded",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Cross-chain swap phases.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapStatus {
    /// Secret generated, escrow created, quote fixed.
    #[default]
    Initiated,
    /// Counterparty's script-chain HTLC funded and confirmed.
    ParticipantFunded,
    /// Secret revealed on both chains.
    Completed,
    /// Both legs reclaimed after their timelocks.
    Refunded,
    /// Halted on a non-recoverable error.
    Failed,
}

impl SwapStatus {
    /// Check if transition is valid.
    pub fn can_transition_to(&self, next: SwapStatus) -> bool {
        use SwapStatus::*;
        match (self, next) {
            (Initiated, ParticipantFunded) => true,
            (Initiated, Refunded) => true,
            (ParticipantFunded, Completed) => true,
            (ParticipantFunded, Refunded) => true,
            (Initiated | ParticipantFunded, Failed) => true,
            // Escrow can still be reclaimed after the swap was halted.
            (Failed, Refunded) => true,
            _ => false,
        }
    }

    /// Check if terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Refunded)
    }
}

impl fmt::Display for SwapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initiated => "initiated",
            Self::ParticipantFunded => "participant_funded",
            Self::Completed => "completed",
            Self::Refunded => "refunded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Claim queue entry status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    /// Waiting for the secret.
    #[default]
    Pending,
    /// Secret known, eligible for dispatch.
    Ready,
    /// Dispatched; doubles as the per-claim lock.
    Claiming,
    /// Waiting on a back-off timer.
    Backoff,
    /// Claim accepted.
    Completed,
    /// Permanently abandoned.
    Failed,
}

impl ClaimStatus {
    /// Completed or permanently failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Claiming => "claiming",
            Self::Backoff => "backoff",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Where a queued claim is executed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "chain", rename_all = "snake_case")]
pub enum ClaimTarget {
    /// Spend the claim branch of a script-chain HTLC.
    ScriptChain {
        /// HTLC record id
        htlc_id: String,
    },
    /// Call `executeWithSecret` on a smart-contract-chain escrow.
    Escrow {
        /// Escrow id
        escrow_id: String,
    },
}

impl ClaimTarget {
    /// Executor routing key.
    pub fn kind(&self) -> ClaimKind {
        match self {
            Self::ScriptChain { .. } => ClaimKind::ScriptChain,
            Self::Escrow { .. } => ClaimKind::Escrow,
        }
    }
}

/// Executor routing key for a claim target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimKind {
    /// Script-chain HTLC.
    ScriptChain,
    /// Smart-contract-chain escrow.
    Escrow,
}

/// Confirmation target for fee estimation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeePriority {
    /// ~6 blocks.
    Low,
    /// ~3 blocks.
    #[default]
    Medium,
    /// Next block.
    High,
}

/// Discrete mempool congestion level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CongestionBand {
    /// Backlog below the elevated threshold.
    #[default]
    Normal,
    /// Moderate backlog.
    Elevated,
    /// Heavy backlog.
    High,
    /// Severe backlog.
    VeryHigh,
}

impl CongestionBand {
    /// Fee multiplier for the band.
    pub fn multiplier(&self) -> f64 {
        match self {
            Self::Normal => 1.0,
            Self::Elevated => 1.25,
            Self::High => 1.5,
            Self::VeryHigh => 2.0,
        }
    }
}

/// Funding address format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressFormat {
    /// Pay-to-witness-script-hash.
    #[default]
    P2wsh,
    /// Legacy pay-to-script-hash.
    P2sh,
}

/// Which script branch a spend used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpendPath {
    /// Preimage + claim signature.
    Claim,
    /// Timelock + refund signature.
    Refund,
    /// Revocation key signature.
    Revoke,
}

impl fmt::Display for SpendPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Claim => "claim",
            Self::Refund => "refund",
            Self::Revoke => "revoke",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_htlc_transitions() {
        assert!(HtlcStatus::Created.can_transition_to(HtlcStatus::Funded));
        assert!(HtlcStatus::Funded.can_transition_to(HtlcStatus::Claimed));
        assert!(HtlcStatus::Funded.can_transition_to(HtlcStatus::Expired));
        assert!(HtlcStatus::Expired.can_transition_to(HtlcStatus::Refunded));
        assert!(HtlcStatus::Failed.can_transition_to(HtlcStatus::Refunded));
        assert!(!HtlcStatus::Created.can_transition_to(HtlcStatus::Claimed));
        assert!(!HtlcStatus::Claimed.can_transition_to(HtlcStatus::Refunded));
        assert!(!HtlcStatus::Refunded.can_transition_to(HtlcStatus::Funded));
    }

    #[test]
    fn test_htlc_terminal() {
        assert!(HtlcStatus::Claimed.is_terminal());
        assert!(HtlcStatus::Refunded.is_terminal());
        assert!(HtlcStatus::Revoked.is_terminal());
        assert!(!HtlcStatus::Expired.is_terminal());
        assert!(!HtlcStatus::Failed.is_terminal());
    }

    #[test]
    fn test_swap_transitions() {
        assert!(SwapStatus::Initiated.can_transition_to(SwapStatus::ParticipantFunded));
        assert!(SwapStatus::ParticipantFunded.can_transition_to(SwapStatus::Completed));
        assert!(!SwapStatus::Initiated.can_transition_to(SwapStatus::Completed));
        assert!(!SwapStatus::Completed.can_transition_to(SwapStatus::Refunded));
        assert!(SwapStatus::Failed.can_transition_to(SwapStatus::Refunded));
    }

    #[test]
    fn test_congestion_multipliers_increase() {
        let bands = [
            CongestionBand::Normal,
            CongestionBand::Elevated,
            CongestionBand::High,
            CongestionBand::VeryHigh,
        ];
        for pair in bands.windows(2) {
            assert!(pair[0].multiplier() < pair[1].multiplier());
        }
    }

    #[test]
    fn test_claim_target_serde_tag() {
        let target = ClaimTarget::Escrow {
            escrow_id: "e-1".into(),
        };
        let json = serde_json::to_string(&target).unwrap();
        assert!(json.contains("\"chain\":\"escrow\""));
        assert_eq!(target.kind(), ClaimKind::Escrow);
    }
}
