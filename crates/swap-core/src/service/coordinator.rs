//! # Cross-Chain Coordinator
//!
//! Drives one [`AtomicSwapState`] through its phases:
//!
//! ```text
//! initiated ──► participant_funded ──► completed
//!     │                 │
//!     └──────► refunded ◄────┘        (any non-terminal) ──► failed
//! ```
//!
//! The initiator locks funds in the smart-contract-chain escrow first. The
//! counterparty then locks script-chain funds to our claim key under the same
//! hash-lock with an earlier deadline. We claim that HTLC, which publishes
//! the secret; the counterparty uses it on the escrow. The coordinator only
//! orchestrates: scripts, transactions and claims are built by the
//! components it holds.

use super::events::EventBus;
use super::gateway::NetworkGateway;
use super::scheduler::ClaimScheduler;
use super::watchtower::WatchtowerRegistry;
use crate::algorithms::{parse_pubkey, SecretVault};
use crate::domain::{
    height_to_deadline, invariant_hashlock_match, invariant_timelock_ordering, unix_now, AtomicSwapState,
    ClaimTarget, CoordinatorConfig, HtlcConfig, HtlcState, HtlcStatus, PendingClaim, SwapError, SwapEvent,
    SwapQuote, SwapStatus,
};
use crate::ports::{EscrowContract, EscrowParams, Repository};
use std::sync::Arc;
use tracing::{info, warn};

/// Parameters of a new swap.
#[derive(Clone, Debug)]
pub struct SwapRequest {
    /// Counterparty address on the smart-contract chain.
    pub resolver: String,
    /// Fixed quote.
    pub quote: SwapQuote,
    /// Escrow deadline (unix secs).
    pub escrow_deadline: u64,
}

/// Collaborators of the coordinator.
#[derive(Clone)]
pub struct CoordinatorDeps {
    /// Swap records.
    pub swaps: Arc<dyn Repository<AtomicSwapState>>,
    /// HTLC records.
    pub htlcs: Arc<dyn Repository<HtlcState>>,
    /// Smart-contract-chain escrow.
    pub escrow: Arc<dyn EscrowContract>,
    /// Script-chain watchtowers.
    pub watchtowers: Arc<WatchtowerRegistry>,
    /// Claim queue.
    pub scheduler: Arc<ClaimScheduler>,
    /// Script-chain access.
    pub gateway: Arc<NetworkGateway>,
    /// Event output.
    pub events: Arc<EventBus>,
}

/// Orchestrates atomic swaps.
pub struct CrossChainCoordinator {
    deps: CoordinatorDeps,
    config: CoordinatorConfig,
    claim_pubkey: String,
}

impl CrossChainCoordinator {
    /// Coordinator whose script-chain claims use `claim_pubkey`.
    pub fn new(deps: CoordinatorDeps, config: CoordinatorConfig, claim_pubkey: &str) -> Result<Self, SwapError> {
        let claim_pubkey = parse_pubkey("claim", claim_pubkey)?.to_string();
        Ok(Self {
            deps,
            config,
            claim_pubkey,
        })
    }

    /// Our script-chain claim key (compressed hex).
    pub fn claim_pubkey(&self) -> &str {
        &self.claim_pubkey
    }

    /// Swap by id.
    pub fn get(&self, swap_id: &str) -> Result<AtomicSwapState, SwapError> {
        self.deps.swaps.require(swap_id)
    }

    /// Every swap.
    pub fn list(&self) -> Result<Vec<AtomicSwapState>, SwapError> {
        self.deps.swaps.list()
    }

    /// Generate the secret, lock our side in the escrow and record the swap.
    pub async fn initiate(&self, request: SwapRequest) -> Result<AtomicSwapState, SwapError> {
        let now = unix_now();
        if request.escrow_deadline <= now + self.config.min_timelock_margin_secs {
            return Err(SwapError::InvalidParameter(format!(
                "escrow deadline {} leaves less than {}s for the counterparty leg",
                request.escrow_deadline, self.config.min_timelock_margin_secs
            )));
        }

        let (secret, secret_hash) = SecretVault::generate();
        let sealed = self.deps.scheduler.sealer().seal(&secret)?;
        drop(secret);

        let escrow_id = self
            .deps
            .escrow
            .create_escrow(EscrowParams {
                resolver: request.resolver.clone(),
                from_asset: request.quote.from_asset.clone(),
                to_asset: request.quote.to_asset.clone(),
                amount: request.quote.amount,
                expected_amount: request.quote.expected_amount,
                hash_lock: secret_hash,
                timelock: request.escrow_deadline,
            })
            .await?;

        let swap = AtomicSwapState {
            id: uuid::Uuid::new_v4().to_string(),
            status: SwapStatus::Initiated,
            escrow_id: Some(escrow_id.clone()),
            htlc_id: None,
            secret: Some(sealed),
            secret_hash,
            timelock: request.escrow_deadline,
            resolver: request.resolver,
            quote: request.quote,
            claim_id: None,
            created_at: now,
            completed_at: None,
            last_error: None,
        };
        self.deps.swaps.put(swap.clone())?;
        info!(
            swap_id = %swap.id,
            escrow_id = %escrow_id,
            hash_lock = %hex::encode(secret_hash),
            "[coordinator] swap initiated"
        );
        Ok(swap)
    }

    /// Attach the counterparty's script-chain HTLC after checking it pays our
    /// claim key under our hash-lock and expires early enough.
    pub async fn register_participant_htlc(&self, swap_id: &str, config: HtlcConfig) -> Result<HtlcState, SwapError> {
        let swap = self.get(swap_id)?;
        if swap.status != SwapStatus::Initiated || swap.htlc_id.is_some() {
            return Err(SwapError::InvalidParameter(format!(
                "swap {swap_id} is {} and already has or no longer accepts an HTLC",
                swap.status
            )));
        }
        invariant_hashlock_match(&config.hash_lock, &swap.secret_hash)?;
        if parse_pubkey("claim", &config.claim_pubkey)?.to_string() != self.claim_pubkey {
            return Err(SwapError::InvalidParameter("HTLC does not pay our claim key".into()));
        }
        let height = self.deps.gateway.get_current_block_height().await?;
        if config.timelock <= height {
            return Err(SwapError::TimelockExpired {
                current: u64::from(height),
                timelock: u64::from(config.timelock),
            });
        }
        let htlc_deadline = height_to_deadline(height, config.timelock, unix_now());
        invariant_timelock_ordering(swap.timelock, htlc_deadline, self.config.min_timelock_margin_secs)?;

        let manager = self.deps.watchtowers.create(config, None)?;
        let htlc = manager.state()?;
        self.deps.swaps.update(swap_id, &mut |s| {
            s.htlc_id = Some(htlc.id.clone());
            Ok(())
        })?;
        info!(swap_id = %swap_id, htlc_id = %htlc.id, address = %htlc.script.address, "[coordinator] participant HTLC registered");
        Ok(htlc)
    }

    /// Verify the counterparty's funding on chain and start watching it.
    pub async fn confirm_participant_funding(
        &self,
        swap_id: &str,
        txid: &str,
        vout: u32,
    ) -> Result<AtomicSwapState, SwapError> {
        let swap = self.get(swap_id)?;
        let htlc_id = swap
            .htlc_id
            .clone()
            .ok_or_else(|| SwapError::InvalidParameter(format!("swap {swap_id} has no participant HTLC")))?;
        let manager = self.deps.watchtowers.attach(&htlc_id, None)?;
        let utxo = manager.mark_funded(txid, vout, self.config.min_confirmations).await?;
        manager.start();
        info!(swap_id = %swap_id, htlc_id = %htlc_id, confirmations = utxo.confirmations, "[coordinator] participant funding confirmed");
        self.transition(swap_id, SwapStatus::ParticipantFunded, None)
    }

    /// Queue the script-chain claim that reveals the secret. Idempotent.
    pub async fn claim(&self, swap_id: &str) -> Result<PendingClaim, SwapError> {
        let swap = self.get(swap_id)?;
        if let Some(claim_id) = &swap.claim_id {
            return self.deps.scheduler.get(claim_id);
        }
        if swap.status != SwapStatus::ParticipantFunded {
            return Err(SwapError::InvalidTransition {
                from: swap.status.to_string(),
                to: "claiming".into(),
            });
        }
        let htlc_id = swap
            .htlc_id
            .clone()
            .ok_or_else(|| SwapError::InvalidParameter(format!("swap {swap_id} has no participant HTLC")))?;
        let htlc = self.deps.htlcs.require(&htlc_id)?;
        let sealed = swap
            .secret
            .as_ref()
            .ok_or_else(|| SwapError::InvalidParameter(format!("swap {swap_id} holds no secret")))?;

        let scheduler = &self.deps.scheduler;
        let secret = scheduler.sealer().unseal(sealed)?;
        let height = self.deps.gateway.get_current_block_height().await?;
        let deadline = height_to_deadline(height, htlc.expires_at, unix_now());
        let claim = scheduler.enqueue(
            ClaimTarget::ScriptChain { htlc_id },
            swap.secret_hash,
            Some(&secret),
            deadline,
        )?;
        self.deps.swaps.update(swap_id, &mut |s| {
            s.claim_id = Some(claim.id.clone());
            Ok(())
        })?;
        info!(swap_id = %swap_id, claim_id = %claim.id, "[coordinator] claim queued");
        Ok(claim)
    }

    /// Advance the swap from the observed HTLC and escrow state.
    pub async fn sync(&self, swap_id: &str) -> Result<AtomicSwapState, SwapError> {
        let swap = self.get(swap_id)?;
        if swap.status.is_terminal() {
            return Ok(swap);
        }
        let escrow_id = swap
            .escrow_id
            .as_deref()
            .ok_or_else(|| SwapError::InvalidParameter(format!("swap {swap_id} has no escrow")))?;
        let escrow = self.deps.escrow.get_escrow(escrow_id).await?;
        let htlc_status = match &swap.htlc_id {
            Some(id) => Some(self.deps.htlcs.require(id)?.status),
            None => None,
        };

        if escrow.refunded {
            return self.transition(swap_id, SwapStatus::Refunded, None);
        }
        if escrow.executed && htlc_status == Some(HtlcStatus::Claimed) {
            return self.transition(swap_id, SwapStatus::Completed, None);
        }
        if matches!(htlc_status, Some(HtlcStatus::Refunded | HtlcStatus::Revoked))
            && swap.status != SwapStatus::Failed
        {
            warn!(swap_id = %swap_id, "[coordinator] participant reclaimed before our claim");
            return self.transition(
                swap_id,
                SwapStatus::Failed,
                Some("participant HTLC reclaimed before claim; refund escrow after deadline".into()),
            );
        }
        Ok(swap)
    }

    /// Reclaim our escrow after its deadline.
    pub async fn refund(&self, swap_id: &str) -> Result<AtomicSwapState, SwapError> {
        let swap = self.get(swap_id)?;
        let escrow_id = swap
            .escrow_id
            .as_deref()
            .ok_or_else(|| SwapError::InvalidParameter(format!("swap {swap_id} has no escrow")))?;
        if !swap.status.can_transition_to(SwapStatus::Refunded) {
            return Err(SwapError::InvalidTransition {
                from: swap.status.to_string(),
                to: SwapStatus::Refunded.to_string(),
            });
        }
        let reference = self.deps.escrow.refund(escrow_id).await?;
        info!(swap_id = %swap_id, reference = %reference, "[coordinator] escrow refunded");
        self.transition(swap_id, SwapStatus::Refunded, None)
    }

    /// Halt the swap.
    pub fn fail(&self, swap_id: &str, reason: &str) -> Result<AtomicSwapState, SwapError> {
        self.transition(swap_id, SwapStatus::Failed, Some(reason.to_string()))
    }

    /// Hand a secret revealed on the script chain to pending claims.
    pub fn on_secret_revealed(&self, htlc_id: &str) -> Result<Vec<String>, SwapError> {
        let htlc = self.deps.htlcs.require(htlc_id)?;
        match &htlc.secret {
            Some(secret) => self.deps.scheduler.reveal_secret_for_hash(secret),
            None => Ok(Vec::new()),
        }
    }

    fn transition(
        &self,
        swap_id: &str,
        next: SwapStatus,
        reason: Option<String>,
    ) -> Result<AtomicSwapState, SwapError> {
        let mut from = next;
        let updated = self.deps.swaps.update(swap_id, &mut |s| {
            from = s.status;
            s.transition(next)?;
            if let Some(reason) = &reason {
                s.last_error = Some(reason.clone());
            }
            Ok(())
        })?;
        info!(swap_id = %swap_id, "[coordinator] {} -> {}", from, next);
        self.deps.events.publish(SwapEvent::SwapStatusChanged {
            swap_id: swap_id.to_string(),
            from,
            to: next,
        });
        Ok(updated)
    }
}
