//! # Claim Executors
//!
//! [`ClaimExecutor`] implementations routed by claim target:
//!
//! - [`ScriptChainClaimExecutor`] spends the claim branch of a script-chain
//!   HTLC and records the result on the HTLC.
//! - [`EscrowClaimExecutor`] calls `executeWithSecret` on the smart-contract
//!   chain escrow.
//!
//! Both are idempotent against a leg that is already settled in their
//! favour, so a retry after a lost response does not fail the claim.

use super::events::EventBus;
use super::transaction_builder::{SpendRequest, TransactionBuilder};
use crate::algorithms::SecretVault;
use crate::domain::{
    invariant_hashlock_match, unix_now, ClaimTarget, HtlcState, HtlcStatus, PendingClaim, SecureSecret, SwapError,
    SwapEvent,
};
use crate::ports::{ClaimExecutor, ClaimOutcome, EscrowContract, Repository};
use async_trait::async_trait;
use bitcoin::secp256k1::SecretKey;
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Script chain
// =============================================================================

/// Claims script-chain HTLCs with one claim key.
pub struct ScriptChainClaimExecutor {
    htlcs: Arc<dyn Repository<HtlcState>>,
    builder: Arc<TransactionBuilder>,
    events: Arc<EventBus>,
    claim_key: SecretKey,
    destination: String,
    fee_rate: Option<f64>,
}

impl ScriptChainClaimExecutor {
    /// Executor paying claimed funds to `destination`.
    pub fn new(
        htlcs: Arc<dyn Repository<HtlcState>>,
        builder: Arc<TransactionBuilder>,
        events: Arc<EventBus>,
        claim_key: SecretKey,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            htlcs,
            builder,
            events,
            claim_key,
            destination: destination.into(),
            fee_rate: None,
        }
    }

    /// Use an explicit fee rate instead of the gateway estimate.
    pub fn with_fee_rate(mut self, fee_rate: f64) -> Self {
        self.fee_rate = Some(fee_rate);
        self
    }

    fn request(&self, claim: &PendingClaim) -> Result<(HtlcState, SpendRequest), SwapError> {
        let ClaimTarget::ScriptChain { htlc_id } = &claim.target else {
            return Err(SwapError::InvalidParameter("not a script-chain claim".into()));
        };
        let htlc = self.htlcs.require(htlc_id)?;
        invariant_hashlock_match(&htlc.script.metadata.hash_lock, &claim.secret_hash)?;
        let (txid, vout) = htlc
            .funding_outpoint()
            .ok_or_else(|| SwapError::InvalidParameter(format!("HTLC {htlc_id} is not funded")))?;
        let request = SpendRequest {
            funding_txid: txid.to_string(),
            funding_vout: vout,
            value: htlc.config.amount,
            htlc: htlc.script.clone(),
            key: self.claim_key,
            destination: self.destination.clone(),
            fee_rate: self.fee_rate,
        };
        Ok((htlc, request))
    }
}

#[async_trait]
impl ClaimExecutor for ScriptChainClaimExecutor {
    async fn execute(&self, claim: &PendingClaim, secret: &SecureSecret) -> Result<ClaimOutcome, SwapError> {
        let (htlc, request) = self.request(claim)?;
        if htlc.status == HtlcStatus::Claimed {
            debug!(htlc_id = %htlc.id, "[executor] HTLC already claimed");
            return Ok(ClaimOutcome {
                txid: htlc.claim_txid,
                ..Default::default()
            });
        }

        let spend = self.builder.build_claim(&request, secret).await?;
        let result = self.builder.broadcast_spend(&spend).await?;

        let mut from = htlc.status;
        let updated = self.htlcs.update(&htlc.id, &mut |h| {
            from = h.status;
            if h.status != HtlcStatus::Claimed {
                h.transition(HtlcStatus::Claimed)?;
            }
            h.claim_txid = Some(result.txid.clone());
            h.secret = Some(secret.clone());
            Ok(())
        })?;
        if from != updated.status {
            self.events.publish(SwapEvent::HtlcStatusChanged {
                htlc_id: htlc.id.clone(),
                from,
                to: updated.status,
            });
        }
        info!(
            htlc_id = %htlc.id,
            txid = %result.txid,
            already_broadcast = result.already_broadcast,
            "[executor] script-chain claim broadcast"
        );
        Ok(ClaimOutcome {
            txid: Some(result.txid),
            fee: Some(spend.fee),
            simulated: false,
        })
    }

    async fn simulate(&self, claim: &PendingClaim, secret: &SecureSecret) -> Result<ClaimOutcome, SwapError> {
        let (htlc, request) = self.request(claim)?;
        let spend = self.builder.build_claim(&request, secret).await?;
        info!(
            htlc_id = %htlc.id,
            txid = %spend.txid,
            fee = spend.fee,
            "[executor] dry-run claim built, not broadcast"
        );
        Ok(ClaimOutcome {
            txid: Some(spend.txid),
            fee: Some(spend.fee),
            simulated: true,
        })
    }
}

// =============================================================================
// Escrow
// =============================================================================

/// Claims smart-contract-chain escrows.
pub struct EscrowClaimExecutor {
    escrow: Arc<dyn EscrowContract>,
}

impl EscrowClaimExecutor {
    /// Executor over `escrow`.
    pub fn new(escrow: Arc<dyn EscrowContract>) -> Self {
        Self { escrow }
    }

    async fn preflight(&self, claim: &PendingClaim, secret: &SecureSecret) -> Result<Option<String>, SwapError> {
        let ClaimTarget::Escrow { escrow_id } = &claim.target else {
            return Err(SwapError::InvalidParameter("not an escrow claim".into()));
        };
        let info = self.escrow.get_escrow(escrow_id).await?;
        if info.refunded {
            return Err(SwapError::InvalidParameter(format!("escrow {escrow_id} was refunded")));
        }
        invariant_hashlock_match(&info.hash_lock, &claim.secret_hash)?;
        if !SecretVault::validate(secret.as_bytes(), &info.hash_lock) {
            return Err(SwapError::InvalidSecret);
        }
        let now = unix_now();
        if !info.executed && now >= info.timelock {
            return Err(SwapError::TimelockExpired {
                current: now,
                timelock: info.timelock,
            });
        }
        Ok((!info.executed).then(|| escrow_id.clone()))
    }
}

#[async_trait]
impl ClaimExecutor for EscrowClaimExecutor {
    async fn execute(&self, claim: &PendingClaim, secret: &SecureSecret) -> Result<ClaimOutcome, SwapError> {
        let Some(escrow_id) = self.preflight(claim, secret).await? else {
            debug!(claim_id = %claim.id, "[executor] escrow already executed");
            return Ok(ClaimOutcome::default());
        };
        let reference = self.escrow.execute_with_secret(&escrow_id, secret).await?;
        info!(escrow_id = %escrow_id, reference = %reference, "[executor] escrow executed");
        Ok(ClaimOutcome {
            txid: Some(reference),
            fee: None,
            simulated: false,
        })
    }

    async fn simulate(&self, claim: &PendingClaim, secret: &SecureSecret) -> Result<ClaimOutcome, SwapError> {
        self.preflight(claim, secret).await?;
        Ok(ClaimOutcome {
            simulated: true,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryEscrow, InMemoryRepository, SimulatedChain};
    use crate::algorithms::script::tests::{config, key};
    use crate::algorithms::{ScriptBuilder, ScriptRegistry};
    use crate::domain::{ClaimTarget, GatewayConfig, TxBuilderConfig};
    use crate::ports::{ChainProvider, EscrowParams};
    use crate::service::NetworkGateway;
    use bitcoin::secp256k1::Secp256k1;
    use bitcoin::{Address, CompressedPublicKey, Network};

    const SECRET: [u8; 32] = [0x01; 32];

    fn claim_for(target: ClaimTarget) -> PendingClaim {
        PendingClaim::new(target, SecretVault::hash_lock(&SECRET), None, unix_now() + 3600, 3)
    }

    struct ScriptFixture {
        chain: Arc<SimulatedChain>,
        htlcs: Arc<InMemoryRepository<HtlcState>>,
        executor: ScriptChainClaimExecutor,
        htlc_id: String,
    }

    fn script_fixture() -> ScriptFixture {
        let chain = Arc::new(SimulatedChain::new("sim", 100));
        let gateway = Arc::new(
            NetworkGateway::new(vec![chain.clone() as Arc<dyn ChainProvider>], GatewayConfig::default()).unwrap(),
        );
        let registry = Arc::new(ScriptRegistry::new());
        let builder = Arc::new(TransactionBuilder::new(
            gateway,
            registry.clone(),
            TxBuilderConfig::default(),
            Network::Regtest,
        ));
        let script = ScriptBuilder::new(Network::Regtest, registry).build(&config(110)).unwrap();
        let utxo = chain.fund_address(&script.address, 100_000, 1).unwrap();
        let mut htlc = HtlcState::new("htlc-1", config(110), script);
        htlc.funding_txid = Some(utxo.txid);
        htlc.funding_vout = Some(0);
        htlc.status = HtlcStatus::Funded;
        let htlcs = Arc::new(InMemoryRepository::<HtlcState>::new());
        htlcs.put(htlc).unwrap();

        let secp = Secp256k1::new();
        let destination =
            Address::p2wpkh(&CompressedPublicKey(key(0x44).0.public_key(&secp)), Network::Regtest).to_string();
        let executor = ScriptChainClaimExecutor::new(
            htlcs.clone(),
            builder,
            Arc::new(EventBus::new()),
            key(0x11).0,
            destination,
        );
        ScriptFixture {
            chain,
            htlcs,
            executor,
            htlc_id: "htlc-1".into(),
        }
    }

    #[tokio::test]
    async fn test_script_chain_claim_updates_htlc() {
        let f = script_fixture();
        let claim = claim_for(ClaimTarget::ScriptChain {
            htlc_id: f.htlc_id.clone(),
        });
        let outcome = f.executor.execute(&claim, &SecureSecret::new(SECRET)).await.unwrap();
        let htlc = f.htlcs.require(&f.htlc_id).unwrap();
        assert_eq!(htlc.status, HtlcStatus::Claimed);
        assert_eq!(htlc.claim_txid, outcome.txid);
        assert_eq!(f.chain.broadcasts().len(), 1);

        // A repeat is answered from the record without another broadcast.
        let again = f.executor.execute(&claim, &SecureSecret::new(SECRET)).await.unwrap();
        assert_eq!(again.txid, outcome.txid);
        assert_eq!(f.chain.broadcasts().len(), 1);
    }

    #[tokio::test]
    async fn test_script_chain_simulate_does_not_broadcast() {
        let f = script_fixture();
        let claim = claim_for(ClaimTarget::ScriptChain {
            htlc_id: f.htlc_id.clone(),
        });
        let outcome = f.executor.simulate(&claim, &SecureSecret::new(SECRET)).await.unwrap();
        assert!(outcome.simulated);
        assert!(outcome.txid.is_some());
        assert!(f.chain.broadcasts().is_empty());
        assert_eq!(f.htlcs.require(&f.htlc_id).unwrap().status, HtlcStatus::Funded);
    }

    #[tokio::test]
    async fn test_script_chain_claim_after_timelock_fails() {
        let f = script_fixture();
        f.chain.set_height(110);
        let claim = claim_for(ClaimTarget::ScriptChain {
            htlc_id: f.htlc_id.clone(),
        });
        assert!(matches!(
            f.executor.execute(&claim, &SecureSecret::new(SECRET)).await,
            Err(SwapError::TimelockExpired { .. })
        ));
    }

    async fn escrow_with(escrow: &InMemoryEscrow, deadline: u64) -> String {
        escrow
            .create_escrow(EscrowParams {
                resolver: "0xresolver".into(),
                from_asset: "ETH".into(),
                to_asset: "BTC".into(),
                amount: 1_000,
                expected_amount: 900,
                hash_lock: SecretVault::hash_lock(&SECRET),
                timelock: deadline,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_escrow_claim_is_idempotent() {
        let escrow = Arc::new(InMemoryEscrow::new());
        let id = escrow_with(&escrow, unix_now() + 3600).await;
        let executor = EscrowClaimExecutor::new(escrow.clone());
        let claim = claim_for(ClaimTarget::Escrow { escrow_id: id.clone() });

        let dry = executor.simulate(&claim, &SecureSecret::new(SECRET)).await.unwrap();
        assert!(dry.simulated);
        assert_eq!(escrow.executions(), 0);

        let outcome = executor.execute(&claim, &SecureSecret::new(SECRET)).await.unwrap();
        assert!(outcome.txid.unwrap().starts_with("0x"));
        assert_eq!(escrow.revealed_secret(&id), Some(SecureSecret::new(SECRET)));

        let again = executor.execute(&claim, &SecureSecret::new(SECRET)).await.unwrap();
        assert_eq!(again.txid, None);
        assert_eq!(escrow.executions(), 1);
    }

    #[tokio::test]
    async fn test_escrow_claim_refused_when_refunded() {
        let escrow = Arc::new(InMemoryEscrow::new());
        let id = escrow_with(&escrow, unix_now() + 60).await;
        escrow.advance_time(61);
        escrow.refund(&id).await.unwrap();
        let executor = EscrowClaimExecutor::new(escrow);
        let err = executor
            .execute(&claim_for(ClaimTarget::Escrow { escrow_id: id }), &SecureSecret::new(SECRET))
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::InvalidParameter(_)));
        assert!(!err.is_retryable());
    }
}
