//! # HTLC Watchtower
//!
//! One [`HtlcLifecycleManager`] per script-chain HTLC. It owns the record's
//! lifecycle after creation, polls the funding outpoint through the gateway
//! and resolves the HTLC without operator action:
//!
//! - spent with a matching preimage → `claimed`, secret stored and published
//! - spent through the revocation branch → `revoked`
//! - spent any other way → `refunded`
//! - unspent at the timelock → `expired`, then auto-refund when enabled
//!
//! Inside the refund buffer the manager switches to fast polling so the
//! refund goes out on the first block it is valid in. Poll failures are
//! logged, published and optionally alerted; they never change state.
//!
//! [`WatchtowerRegistry`] creates managers, resumes them for persisted
//! HTLCs and stops every timer on shutdown.

use super::events::EventBus;
use super::gateway::NetworkGateway;
use super::task::ScheduledTask;
use super::transaction_builder::{FundingRequest, SpendRequest, TransactionBuilder};
use crate::algorithms::transaction::encode_hex;
use crate::algorithms::{classify_spend, ObservedSpend, ScriptBuilder, SecretVault};
use crate::domain::{
    invariant_sufficient_confirmations, unix_now, BroadcastResult, HtlcConfig, HtlcState, HtlcStatus,
    OutputSpend, SecureSecret, SwapError, SwapEvent, Utxo, WatchtowerConfig,
};
use crate::ports::{Alert, AlertSink, Repository};
use bitcoin::secp256k1::SecretKey;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Key and destination used to sign automatic refunds.
#[derive(Clone)]
pub struct RefundAuthority {
    /// Refund-branch key.
    pub key: SecretKey,
    /// Where refunded funds go.
    pub destination: String,
    /// Explicit fee rate; `None` uses the gateway estimate.
    pub fee_rate: Option<f64>,
}

impl std::fmt::Debug for RefundAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefundAuthority")
            .field("destination", &self.destination)
            .field("fee_rate", &self.fee_rate)
            .finish_non_exhaustive()
    }
}

/// Inputs for [`HtlcLifecycleManager::fund`].
#[derive(Clone, Debug)]
pub struct FundingPlan {
    /// Wallet outputs to spend, in order.
    pub utxos: Vec<Utxo>,
    /// Change address.
    pub change_address: String,
    /// Fee rate, sat/vB.
    pub fee_rate: f64,
    /// Signs the inputs when they are P2WPKH outputs of this key.
    pub signing_key: Option<SecretKey>,
}

/// Result of one poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollReport {
    /// Status after the poll.
    pub status: HtlcStatus,
    /// Blocks until the timelock, when the output is still unspent.
    pub blocks_remaining: Option<u32>,
}

/// Shared collaborators of every manager.
#[derive(Clone)]
pub struct WatchtowerDeps {
    /// Chain access.
    pub gateway: Arc<NetworkGateway>,
    /// Funding and refund construction.
    pub builder: Arc<TransactionBuilder>,
    /// HTLC records.
    pub repository: Arc<dyn Repository<HtlcState>>,
    /// Event output.
    pub events: Arc<EventBus>,
    /// Optional alert delivery.
    pub alerts: Option<Arc<dyn AlertSink>>,
}

// =============================================================================
// Lifecycle manager
// =============================================================================

/// Watches and resolves one HTLC.
pub struct HtlcLifecycleManager {
    htlc_id: String,
    deps: WatchtowerDeps,
    config: WatchtowerConfig,
    refund: Option<RefundAuthority>,
    task: Mutex<Option<ScheduledTask>>,
}

impl HtlcLifecycleManager {
    /// Manager for an existing record.
    pub fn new(
        htlc_id: impl Into<String>,
        deps: WatchtowerDeps,
        config: WatchtowerConfig,
        refund: Option<RefundAuthority>,
    ) -> Self {
        Self {
            htlc_id: htlc_id.into(),
            deps,
            config,
            refund,
            task: Mutex::new(None),
        }
    }

    /// Record id.
    pub fn htlc_id(&self) -> &str {
        &self.htlc_id
    }

    /// Current record.
    pub fn state(&self) -> Result<HtlcState, SwapError> {
        self.deps.repository.require(&self.htlc_id)
    }

    /// Build, sign (optionally), broadcast and record the funding transaction.
    pub async fn fund(&self, plan: FundingPlan) -> Result<BroadcastResult, SwapError> {
        let htlc = self.state()?;
        if htlc.status != HtlcStatus::Created {
            return Err(SwapError::InvalidTransition {
                from: htlc.status.to_string(),
                to: HtlcStatus::Funded.to_string(),
            });
        }
        let builder = &self.deps.builder;
        let mut funding = builder.build_funding(&FundingRequest {
            utxos: plan.utxos,
            htlc_address: htlc.script.address.clone(),
            change_address: plan.change_address,
            amount: htlc.config.amount,
            fee_rate: plan.fee_rate,
        })?;
        if let Some(key) = &plan.signing_key {
            builder.sign_funding_p2wpkh(&mut funding, key)?;
        }
        let result = self
            .deps
            .gateway
            .broadcast_transaction(&encode_hex(&funding.tx), Some(&funding.txid))
            .await?;
        self.record_funding(&funding.txid, funding.htlc_vout)?;
        info!(htlc_id = %self.htlc_id, txid = %funding.txid, "[watchtower] funding broadcast");
        Ok(result)
    }

    /// Record a funding output broadcast elsewhere, after finding it on chain
    /// with at least `min_confirmations`.
    pub async fn mark_funded(&self, txid: &str, vout: u32, min_confirmations: u32) -> Result<Utxo, SwapError> {
        let htlc = self.state()?;
        let utxo = self
            .deps
            .gateway
            .get_utxos(&htlc.script.address)
            .await?
            .into_iter()
            .find(|u| u.txid == txid && u.vout == vout)
            .ok_or_else(|| {
                SwapError::InvalidParameter(format!("funding output {txid}:{vout} not found at {}", htlc.script.address))
            })?;
        if utxo.value < htlc.config.amount {
            return Err(SwapError::InvalidParameter(format!(
                "funding output holds {} sat, HTLC requires {}",
                utxo.value, htlc.config.amount
            )));
        }
        invariant_sufficient_confirmations(utxo.confirmations, min_confirmations)?;
        self.record_funding(txid, vout)?;
        Ok(utxo)
    }

    fn record_funding(&self, txid: &str, vout: u32) -> Result<(), SwapError> {
        self.apply(|h| {
            h.transition(HtlcStatus::Funded)?;
            h.funding_txid = Some(txid.to_string());
            h.funding_vout = Some(vout);
            Ok(())
        })?;
        Ok(())
    }

    /// Poll once and act on what the chain shows.
    pub async fn poll_once(&self) -> Result<PollReport, SwapError> {
        let htlc = self.state()?;
        if !htlc.status.is_watchable() {
            return Ok(PollReport {
                status: htlc.status,
                blocks_remaining: None,
            });
        }
        match self.inspect(&htlc).await {
            Ok(report) => Ok(report),
            Err(e) => {
                self.poll_failed(&htlc, &e).await;
                Err(e)
            }
        }
    }

    async fn inspect(&self, htlc: &HtlcState) -> Result<PollReport, SwapError> {
        let (txid, vout) = htlc
            .funding_outpoint()
            .ok_or_else(|| SwapError::InvalidParameter("funded HTLC has no funding outpoint".into()))?;
        let gateway = &self.deps.gateway;

        if let Some(spend) = gateway.get_output_spend(txid, vout).await? {
            let status = self.resolve_spend(htlc, &spend)?;
            return Ok(PollReport {
                status,
                blocks_remaining: None,
            });
        }

        let height = gateway.get_current_block_height().await?;
        self.deps.repository.update(&self.htlc_id, &mut |h| {
            h.last_checked = Some(unix_now());
            Ok(())
        })?;

        let timelock = htlc.expires_at;
        if height >= timelock {
            let mut status = htlc.status;
            if status == HtlcStatus::Funded {
                status = self.apply(|h| h.transition(HtlcStatus::Expired))?.status;
                self.alert(htlc, format!("timelock {timelock} reached at height {height}"), status)
                    .await;
            }
            if self.config.auto_refund {
                status = self.auto_refund(htlc).await?;
            }
            return Ok(PollReport {
                status,
                blocks_remaining: Some(0),
            });
        }

        let remaining = timelock - height;
        if remaining <= self.config.refund_buffer_blocks {
            debug!(htlc_id = %self.htlc_id, remaining, "[watchtower] inside refund buffer");
            self.deps.events.publish(SwapEvent::RefundImminent {
                htlc_id: self.htlc_id.clone(),
                blocks_remaining: remaining,
            });
        }
        Ok(PollReport {
            status: htlc.status,
            blocks_remaining: Some(remaining),
        })
    }

    fn resolve_spend(&self, htlc: &HtlcState, spend: &OutputSpend) -> Result<HtlcStatus, SwapError> {
        let hash_lock = htlc.script.metadata.hash_lock;
        let observed = classify_spend(&htlc.script, &spend.stack());
        let revealed = match &observed {
            ObservedSpend::Claim { preimage } if SecretVault::validate(preimage, &hash_lock) => {
                SecureSecret::from_slice(preimage)
            }
            _ => None,
        };

        let updated = match (observed, revealed) {
            (_, Some(secret)) => {
                let updated = self.apply(|h| {
                    h.transition(HtlcStatus::Claimed)?;
                    h.claim_txid = Some(spend.txid.clone());
                    h.secret = Some(secret.clone());
                    Ok(())
                })?;
                info!(htlc_id = %self.htlc_id, txid = %spend.txid, "[watchtower] claim observed, secret revealed");
                self.deps.events.publish(SwapEvent::SecretRevealed {
                    htlc_id: self.htlc_id.clone(),
                    secret_hash: hash_lock,
                });
                updated
            }
            (ObservedSpend::Revoke, None) => self.apply(|h| {
                h.transition(HtlcStatus::Revoked)?;
                h.revoke_txid = Some(spend.txid.clone());
                Ok(())
            })?,
            (observed, None) => {
                if observed == ObservedSpend::Unknown {
                    warn!(htlc_id = %self.htlc_id, txid = %spend.txid, "[watchtower] unrecognized spend, treating as refund");
                }
                self.apply(|h| {
                    h.transition(HtlcStatus::Refunded)?;
                    h.refund_txid = Some(spend.txid.clone());
                    Ok(())
                })?
            }
        };
        self.deps.builder.registry().mark_redeemed(htlc.script.script_hash);
        Ok(updated.status)
    }

    async fn auto_refund(&self, htlc: &HtlcState) -> Result<HtlcStatus, SwapError> {
        let Some(authority) = &self.refund else {
            warn!(htlc_id = %self.htlc_id, "[watchtower] expired but no refund key configured");
            return Ok(self.state()?.status);
        };
        let (txid, vout) = htlc
            .funding_outpoint()
            .ok_or_else(|| SwapError::InvalidParameter("funded HTLC has no funding outpoint".into()))?;
        let request = SpendRequest {
            funding_txid: txid.to_string(),
            funding_vout: vout,
            value: htlc.config.amount,
            htlc: htlc.script.clone(),
            key: authority.key,
            destination: authority.destination.clone(),
            fee_rate: authority.fee_rate,
        };
        let builder = &self.deps.builder;
        let attempt = async {
            let spend = builder.build_refund(&request).await?;
            builder.broadcast_spend(&spend).await
        };

        match attempt.await {
            Ok(result) => {
                let updated = self.apply(|h| {
                    h.transition(HtlcStatus::Refunded)?;
                    h.refund_txid = Some(result.txid.clone());
                    h.last_error = None;
                    Ok(())
                })?;
                info!(htlc_id = %self.htlc_id, txid = %result.txid, "[watchtower] auto-refund broadcast");
                self.deps.events.publish(SwapEvent::RefundBroadcast {
                    htlc_id: self.htlc_id.clone(),
                    txid: result.txid.clone(),
                });
                self.alert(&updated, format!("auto-refund broadcast: {}", result.txid), updated.status)
                    .await;
                Ok(updated.status)
            }
            Err(e) => {
                error!(htlc_id = %self.htlc_id, "[watchtower] auto-refund failed: {}", e);
                let message = e.to_string();
                let updated = self.apply(|h| {
                    if h.status != HtlcStatus::Failed {
                        h.transition(HtlcStatus::Failed)?;
                    }
                    h.last_error = Some(message.clone());
                    Ok(())
                })?;
                self.alert(&updated, format!("auto-refund failed: {message}"), updated.status)
                    .await;
                Ok(updated.status)
            }
        }
    }

    async fn poll_failed(&self, htlc: &HtlcState, e: &SwapError) {
        warn!(htlc_id = %self.htlc_id, "[watchtower] poll failed: {}", e);
        self.deps.events.publish(SwapEvent::PollFailed {
            htlc_id: self.htlc_id.clone(),
            error: e.to_string(),
        });
        if self.config.alert_on_poll_failure {
            self.alert(htlc, format!("poll failed: {e}"), htlc.status).await;
        }
    }

    async fn alert(&self, htlc: &HtlcState, message: String, status: HtlcStatus) {
        let Some(sink) = &self.deps.alerts else {
            return;
        };
        let alert = Alert {
            htlc_id: self.htlc_id.clone(),
            message,
            timestamp: unix_now(),
            status,
            timelock: htlc.expires_at,
        };
        if let Err(e) = sink.send(&alert).await {
            warn!(htlc_id = %self.htlc_id, "[watchtower] alert delivery failed: {}", e);
        }
    }

    /// Apply `f` atomically and publish the status change, if any.
    fn apply<F>(&self, mut f: F) -> Result<HtlcState, SwapError>
    where
        F: FnMut(&mut HtlcState) -> Result<(), SwapError>,
    {
        let mut from = HtlcStatus::Created;
        let updated = self.deps.repository.update(&self.htlc_id, &mut |h| {
            from = h.status;
            f(h)
        })?;
        if updated.status != from {
            info!(htlc_id = %self.htlc_id, "[watchtower] {} -> {}", from, updated.status);
            self.deps.events.publish(SwapEvent::HtlcStatusChanged {
                htlc_id: self.htlc_id.clone(),
                from,
                to: updated.status,
            });
        }
        Ok(updated)
    }

    /// Start polling. Replaces a running loop. The loop ends on a terminal state.
    pub fn start(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = ScheduledTask::adaptive(format!("watchtower-{}", self.htlc_id), Duration::ZERO, move || {
            let weak = weak.clone();
            async move {
                let this = weak.upgrade()?;
                this.next_delay(this.poll_once().await)
            }
        });
        if let Some(previous) = self.task.lock().replace(task) {
            previous.stop();
        }
        info!(htlc_id = %self.htlc_id, "[watchtower] started");
    }

    fn next_delay(&self, outcome: Result<PollReport, SwapError>) -> Option<Duration> {
        let fast = Duration::from_millis(self.config.fast_poll_interval_ms);
        let normal = Duration::from_millis(self.config.poll_interval_ms);
        match outcome {
            Ok(report) if report.status.is_terminal() => {
                info!(htlc_id = %self.htlc_id, status = %report.status, "[watchtower] terminal, polling stopped");
                None
            }
            Ok(report) => match report.blocks_remaining {
                Some(remaining) if remaining <= self.config.refund_buffer_blocks => Some(fast),
                _ if matches!(report.status, HtlcStatus::Expired | HtlcStatus::Failed) => Some(fast),
                _ => Some(normal),
            },
            Err(_) => Some(normal),
        }
    }

    /// Cancel the polling loop. Idempotent.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.stop();
            info!(htlc_id = %self.htlc_id, "[watchtower] stopped");
        }
    }

    /// Polling loop alive.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for HtlcLifecycleManager {
    fn drop(&mut self) {
        self.stop();
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Owns one manager per HTLC id.
pub struct WatchtowerRegistry {
    scripts: Arc<ScriptBuilder>,
    deps: WatchtowerDeps,
    config: WatchtowerConfig,
    default_refund: Option<RefundAuthority>,
    managers: RwLock<HashMap<String, Arc<HtlcLifecycleManager>>>,
}

impl WatchtowerRegistry {
    /// Empty registry.
    pub fn new(scripts: Arc<ScriptBuilder>, deps: WatchtowerDeps, config: WatchtowerConfig) -> Self {
        Self {
            scripts,
            deps,
            config,
            default_refund: None,
            managers: RwLock::new(HashMap::new()),
        }
    }

    /// Refund authority for managers created without one.
    pub fn with_default_refund(mut self, refund: RefundAuthority) -> Self {
        self.default_refund = Some(refund);
        self
    }

    /// Build the script, persist a `created` record and return its manager.
    pub fn create(
        &self,
        config: HtlcConfig,
        refund: Option<RefundAuthority>,
    ) -> Result<Arc<HtlcLifecycleManager>, SwapError> {
        let script = self.scripts.build(&config)?;
        let htlc = HtlcState::new(uuid::Uuid::new_v4().to_string(), config, script);
        let id = htlc.id.clone();
        info!(htlc_id = %id, address = %htlc.script.address, "[watchtower] HTLC created");
        self.deps.repository.put(htlc)?;
        self.attach(&id, refund)
    }

    /// Manager for an existing record, created on first use.
    pub fn attach(
        &self,
        htlc_id: &str,
        refund: Option<RefundAuthority>,
    ) -> Result<Arc<HtlcLifecycleManager>, SwapError> {
        self.deps.repository.require(htlc_id)?;
        let mut managers = self.managers.write();
        let manager = managers.entry(htlc_id.to_string()).or_insert_with(|| {
            Arc::new(HtlcLifecycleManager::new(
                htlc_id,
                self.deps.clone(),
                self.config.clone(),
                refund.or_else(|| self.default_refund.clone()),
            ))
        });
        Ok(manager.clone())
    }

    /// Manager by id.
    pub fn get(&self, htlc_id: &str) -> Option<Arc<HtlcLifecycleManager>> {
        self.managers.read().get(htlc_id).cloned()
    }

    /// Start managers for every persisted HTLC that may still be unspent.
    pub fn resume(&self) -> Result<usize, SwapError> {
        let mut resumed = 0;
        for htlc in self.deps.repository.list()? {
            if htlc.status.is_watchable() {
                self.attach(&htlc.id, None)?.start();
                resumed += 1;
            }
        }
        if resumed > 0 {
            info!("[watchtower] resumed {} HTLC(s)", resumed);
        }
        Ok(resumed)
    }

    /// Managers with a live polling loop.
    pub fn running(&self) -> usize {
        self.managers.read().values().filter(|m| m.is_running()).count()
    }

    /// Stop every polling loop.
    pub fn stop_all(&self) {
        let managers: Vec<_> = self.managers.read().values().cloned().collect();
        for manager in managers {
            manager.stop();
        }
        debug!("[watchtower] all managers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryRepository, MemoryAlertSink, SimulatedChain};
    use crate::algorithms::script::tests::{config, key};
    use crate::algorithms::{refund_stack, ScriptRegistry};
    use crate::domain::{GatewayConfig, TxBuilderConfig};
    use crate::ports::ChainProvider;
    use bitcoin::secp256k1::Secp256k1;
    use bitcoin::{Address, CompressedPublicKey, Network};
    use tokio::sync::broadcast::Receiver;

    struct Fixture {
        chain: Arc<SimulatedChain>,
        registry: WatchtowerRegistry,
        builder: Arc<TransactionBuilder>,
        alerts: Arc<MemoryAlertSink>,
        events: Receiver<SwapEvent>,
    }

    fn wallet_address(byte: u8) -> String {
        let secp = Secp256k1::new();
        Address::p2wpkh(&CompressedPublicKey(key(byte).0.public_key(&secp)), Network::Regtest).to_string()
    }

    fn fixture(height: u32) -> Fixture {
        let chain = Arc::new(SimulatedChain::new("sim", height));
        let gateway = Arc::new(
            NetworkGateway::new(
                vec![chain.clone() as Arc<dyn ChainProvider>],
                GatewayConfig {
                    retry_delay_ms: 1,
                    height_retry_delay_ms: 1,
                    ..Default::default()
                },
            )
            .unwrap(),
        );
        let scripts_registry = Arc::new(ScriptRegistry::new());
        let builder = Arc::new(TransactionBuilder::new(
            gateway.clone(),
            scripts_registry.clone(),
            TxBuilderConfig::default(),
            Network::Regtest,
        ));
        let events = Arc::new(EventBus::new());
        let rx = events.subscribe();
        let alerts = Arc::new(MemoryAlertSink::new());
        let deps = WatchtowerDeps {
            gateway,
            builder: builder.clone(),
            repository: Arc::new(InMemoryRepository::<HtlcState>::new()),
            events,
            alerts: Some(alerts.clone()),
        };
        let scripts = Arc::new(ScriptBuilder::new(Network::Regtest, scripts_registry));
        let registry = WatchtowerRegistry::new(
            scripts,
            deps,
            WatchtowerConfig {
                poll_interval_ms: 10_000,
                fast_poll_interval_ms: 1_000,
                ..Default::default()
            },
        )
        .with_default_refund(RefundAuthority {
            key: key(0x22).0,
            destination: wallet_address(0x33),
            fee_rate: None,
        });
        Fixture {
            chain,
            registry,
            builder,
            alerts,
            events: rx,
        }
    }

    async fn funded(f: &Fixture, timelock: u32) -> Arc<HtlcLifecycleManager> {
        let manager = f.registry.create(config(timelock), None).unwrap();
        let address = manager.state().unwrap().script.address;
        let utxo = f.chain.fund_address(&address, 100_000, 1).unwrap();
        manager.mark_funded(&utxo.txid, utxo.vout, 1).await.unwrap();
        manager
    }

    fn drain(rx: &mut Receiver<SwapEvent>) -> Vec<SwapEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_mark_funded_checks_chain() {
        let f = fixture(100);
        let manager = f.registry.create(config(110), None).unwrap();
        assert!(manager.mark_funded(&"00".repeat(32), 0, 1).await.is_err());

        let address = manager.state().unwrap().script.address;
        let utxo = f.chain.fund_address(&address, 100_000, 0).unwrap();
        assert!(manager.mark_funded(&utxo.txid, 0, 1).await.is_err());
        assert_eq!(manager.state().unwrap().status, HtlcStatus::Created);

        f.chain.advance(1);
        manager.mark_funded(&utxo.txid, 0, 1).await.unwrap();
        assert_eq!(manager.state().unwrap().status, HtlcStatus::Funded);
    }

    #[tokio::test]
    async fn test_fund_builds_and_broadcasts() {
        let f = fixture(100);
        let manager = f.registry.create(config(110), None).unwrap();
        let wallet = f.chain.fund_address(&wallet_address(0x33), 200_000, 3).unwrap();
        let result = manager
            .fund(FundingPlan {
                utxos: vec![wallet],
                change_address: wallet_address(0x33),
                fee_rate: 2.0,
                signing_key: Some(key(0x33).0),
            })
            .await
            .unwrap();
        let htlc = manager.state().unwrap();
        assert_eq!(htlc.status, HtlcStatus::Funded);
        assert_eq!(htlc.funding_txid.as_deref(), Some(result.txid.as_str()));
        assert_eq!(f.chain.broadcasts(), vec![result.txid]);
    }

    #[tokio::test]
    async fn test_unspent_before_timelock_stays_funded() {
        let f = fixture(100);
        let manager = funded(&f, 110).await;
        let report = manager.poll_once().await.unwrap();
        assert_eq!(report.status, HtlcStatus::Funded);
        assert_eq!(report.blocks_remaining, Some(10));
        assert!(manager.state().unwrap().last_checked.is_some());
    }

    #[tokio::test]
    async fn test_claim_spend_reveals_secret() {
        let mut f = fixture(100);
        let manager = funded(&f, 110).await;
        let htlc = manager.state().unwrap();
        let (txid, vout) = htlc.funding_outpoint().unwrap();
        let spend = f
            .builder
            .build_claim(
                &SpendRequest {
                    funding_txid: txid.to_string(),
                    funding_vout: vout,
                    value: 100_000,
                    htlc: htlc.script.clone(),
                    key: key(0x11).0,
                    destination: wallet_address(0x44),
                    fee_rate: None,
                },
                &SecureSecret::new([0x01; 32]),
            )
            .await
            .unwrap();
        f.builder.broadcast_spend(&spend).await.unwrap();
        drain(&mut f.events);

        let report = manager.poll_once().await.unwrap();
        assert_eq!(report.status, HtlcStatus::Claimed);
        let htlc = manager.state().unwrap();
        assert_eq!(htlc.secret, Some(SecureSecret::new([0x01; 32])));
        assert_eq!(htlc.claim_txid, Some(spend.txid));
        let events = drain(&mut f.events);
        assert!(events.iter().any(|e| matches!(e, SwapEvent::SecretRevealed { .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            SwapEvent::HtlcStatusChanged { to: HtlcStatus::Claimed, .. }
        )));
    }

    #[tokio::test]
    async fn test_foreign_refund_spend_marks_refunded() {
        let f = fixture(100);
        let manager = funded(&f, 110).await;
        let htlc = manager.state().unwrap();
        let (txid, vout) = htlc.funding_outpoint().unwrap();
        let mut witness = refund_stack(vec![0x30; 71], false);
        witness.push(htlc.script.script.clone());
        f.chain.record_spend(
            txid,
            vout,
            OutputSpend {
                txid: "cd".repeat(32),
                vin: 0,
                witness,
                script_sig: Vec::new(),
            },
        );
        assert_eq!(manager.poll_once().await.unwrap().status, HtlcStatus::Refunded);
        assert!(manager.state().unwrap().secret.is_none());
        assert!(f.builder.registry().is_redeemed(&htlc.script.script_hash));
    }

    #[tokio::test]
    async fn test_expiry_triggers_auto_refund() {
        let mut f = fixture(100);
        let manager = funded(&f, 110).await;
        drain(&mut f.events);
        f.chain.set_height(110);

        let report = manager.poll_once().await.unwrap();
        assert_eq!(report.status, HtlcStatus::Refunded);
        let htlc = manager.state().unwrap();
        let refund_txid = htlc.refund_txid.clone().unwrap();
        assert_eq!(f.chain.broadcasts().last(), Some(&refund_txid));
        assert!(f.builder.registry().is_redeemed(&htlc.script.script_hash));

        let transitions: Vec<HtlcStatus> = drain(&mut f.events)
            .into_iter()
            .filter_map(|e| match e {
                SwapEvent::HtlcStatusChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(transitions, vec![HtlcStatus::Expired, HtlcStatus::Refunded]);
        assert!(f.alerts.alerts().iter().any(|a| a.message.contains("auto-refund broadcast")));
    }

    #[tokio::test]
    async fn test_failed_refund_records_error_and_retries() {
        let f = fixture(100);
        let manager = funded(&f, 110).await;
        f.chain.set_height(110);
        f.chain
            .set_broadcast_error(Some(crate::domain::ProviderError::Rejected("min relay fee".into())));

        assert_eq!(manager.poll_once().await.unwrap().status, HtlcStatus::Failed);
        let htlc = manager.state().unwrap();
        assert!(htlc.last_error.unwrap().contains("min relay fee"));
        assert!(f.alerts.alerts().iter().any(|a| a.status == HtlcStatus::Failed));

        f.chain.set_broadcast_error(None);
        assert_eq!(manager.poll_once().await.unwrap().status, HtlcStatus::Refunded);
        assert!(manager.state().unwrap().last_error.is_none());
    }

    #[tokio::test]
    async fn test_poll_failure_keeps_state() {
        let mut f = fixture(100);
        let manager = funded(&f, 110).await;
        drain(&mut f.events);
        f.chain.set_failing(true);

        assert!(manager.poll_once().await.is_err());
        assert_eq!(manager.state().unwrap().status, HtlcStatus::Funded);
        let events = drain(&mut f.events);
        assert!(matches!(events.as_slice(), [SwapEvent::PollFailed { .. }]));
        assert!(f.alerts.alerts().iter().any(|a| a.message.starts_with("poll failed")));
    }

    #[tokio::test]
    async fn test_refund_buffer_publishes_imminent() {
        let mut f = fixture(108);
        let manager = funded(&f, 110).await;
        drain(&mut f.events);
        let report = manager.poll_once().await.unwrap();
        assert_eq!(report.blocks_remaining, Some(2));
        assert!(drain(&mut f.events)
            .iter()
            .any(|e| matches!(e, SwapEvent::RefundImminent { blocks_remaining: 2, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_loop_stops_on_terminal_state() {
        let f = fixture(100);
        let manager = funded(&f, 110).await;
        manager.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(manager.is_running());
        assert_eq!(manager.state().unwrap().status, HtlcStatus::Funded);

        f.chain.set_height(110);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(manager.state().unwrap().status, HtlcStatus::Refunded);
        assert!(!manager.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_cancels_timers() {
        let f = fixture(100);
        let a = funded(&f, 110).await;
        let b = funded(&f, 120).await;
        a.start();
        b.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.registry.running(), 2);

        f.registry.stop_all();
        let calls = f.chain.call_count();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(f.chain.call_count(), calls);
        assert_eq!(f.registry.running(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_starts_watchable_records() {
        let f = fixture(100);
        let _funded = funded(&f, 110).await;
        let _created = f.registry.create(config(130), None).unwrap();
        assert_eq!(f.registry.resume().unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.registry.running(), 1);
        f.registry.stop_all();
    }
}
