//! # Event Routing
//!
//! One subscriber on the engine [`EventBus`](swap_core::EventBus) that
//! feeds Prometheus and closes the loops between components:
//!
//! ```text
//! Watchtower ──SecretRevealed──→ Router ──reveal──→ ClaimScheduler
//!     │                                                  │
//!     └──HtlcStatusChanged──→ Router ──sync──→ Coordinator
//!                                                        │
//! ClaimScheduler ──Claim*──→ Router ──gauge──→ CLAIMS_IN_FLIGHT
//! ```

use crate::container::EngineContainer;
use std::sync::Arc;
use swap_core::domain::{HtlcStatus, SwapEvent};
use swap_core::Repository;
use swap_telemetry::{
    metric_inc, AUTO_REFUNDS, CLAIMS, CLAIMS_IN_FLIGHT, HTLC_TRANSITIONS, POLL_FAILURES, SECRETS_REVEALED,
    SWAP_TRANSITIONS,
};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Update the metrics for one event.
pub fn record_metrics(event: &SwapEvent) {
    match event {
        SwapEvent::HtlcStatusChanged { to, .. } => metric_inc!(HTLC_TRANSITIONS, &[to.to_string().as_str()]),
        SwapEvent::SecretRevealed { .. } => metric_inc!(SECRETS_REVEALED),
        SwapEvent::RefundImminent { .. } => {}
        SwapEvent::RefundBroadcast { .. } => metric_inc!(AUTO_REFUNDS),
        SwapEvent::PollFailed { .. } => metric_inc!(POLL_FAILURES),
        SwapEvent::ClaimReady { .. } => metric_inc!(CLAIMS, &["ready"]),
        SwapEvent::ClaimDispatched { .. } => metric_inc!(CLAIMS, &["dispatched"]),
        SwapEvent::ClaimSucceeded { .. } => metric_inc!(CLAIMS, &["succeeded"]),
        SwapEvent::ClaimFailed { .. } => metric_inc!(CLAIMS, &["failed"]),
        SwapEvent::ClaimAbandoned { .. } => metric_inc!(CLAIMS, &["abandoned"]),
        SwapEvent::SwapStatusChanged { to, .. } => metric_inc!(SWAP_TRANSITIONS, &[to.to_string().as_str()]),
    }
}

/// Routes engine events until shutdown or until the bus closes.
pub struct EventRouter {
    container: Arc<EngineContainer>,
}

impl EventRouter {
    /// Router over `container`.
    pub fn new(container: Arc<EngineContainer>) -> Self {
        Self { container }
    }

    /// Subscribe now and route on a spawned task.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut rx = self.container.events.subscribe();
        tokio::spawn(async move {
            info!("[router] started");
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(event) => self.route(&event).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("[router] lagged, {} event(s) dropped; maintenance re-derives them", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            info!("[router] stopped");
        })
    }

    /// Handle one event.
    pub async fn route(&self, event: &SwapEvent) {
        debug!("[router] {} event", event.topic());
        record_metrics(event);

        match event {
            SwapEvent::SecretRevealed { htlc_id, .. } => self.forward_secret(htlc_id),
            SwapEvent::HtlcStatusChanged { htlc_id, to, .. } if to.is_terminal() => {
                // Our own claim reveals the preimage without a watchtower observation.
                if *to == HtlcStatus::Claimed {
                    self.forward_secret(htlc_id);
                }
                self.sync_swaps_for(htlc_id).await;
            }
            SwapEvent::ClaimDispatched { .. }
            | SwapEvent::ClaimSucceeded { .. }
            | SwapEvent::ClaimFailed { .. }
            | SwapEvent::ClaimAbandoned { .. } => {
                CLAIMS_IN_FLIGHT.set(self.container.scheduler.in_flight() as f64);
            }
            _ => {}
        }
    }

    /// Hand a revealed preimage to every claim waiting on its hash.
    fn forward_secret(&self, htlc_id: &str) {
        let result = match &self.container.coordinator {
            Some(coordinator) => coordinator.on_secret_revealed(htlc_id),
            None => match self.container.htlcs.get(htlc_id) {
                Ok(Some(htlc)) => match &htlc.secret {
                    Some(secret) => self.container.scheduler.reveal_secret_for_hash(secret),
                    None => Ok(Vec::new()),
                },
                Ok(None) => Ok(Vec::new()),
                Err(e) => Err(e),
            },
        };
        match result {
            Ok(claims) if !claims.is_empty() => {
                info!(htlc_id = %htlc_id, "[router] secret released to {} claim(s)", claims.len());
            }
            Ok(_) => {}
            Err(e) => warn!(htlc_id = %htlc_id, "[router] secret forwarding failed: {}", e),
        }
    }

    /// Re-derive the phase of every live swap tracking `htlc_id`.
    async fn sync_swaps_for(&self, htlc_id: &str) {
        let Some(coordinator) = &self.container.coordinator else {
            return;
        };
        let swaps = match coordinator.list() {
            Ok(swaps) => swaps,
            Err(e) => {
                warn!("[router] cannot list swaps: {}", e);
                return;
            }
        };
        for swap in swaps
            .into_iter()
            .filter(|s| !s.status.is_terminal() && s.htlc_id.as_deref() == Some(htlc_id))
        {
            if let Err(e) = coordinator.sync(&swap.id).await {
                warn!(swap_id = %swap.id, "[router] sync failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ProviderConfig, ProviderKind, RuntimeConfig};
    use swap_core::domain::{unix_now, SwapStatus};
    use swap_core::{ClaimStatus, ClaimTarget, SecretVault, SecureSecret};

    fn container() -> Arc<EngineContainer> {
        Arc::new(
            EngineContainer::new(RuntimeConfig {
                engine: swap_core::EngineConfig {
                    network: bitcoin::Network::Regtest,
                    ..Default::default()
                },
                providers: vec![ProviderConfig {
                    name: "sim".into(),
                    kind: ProviderKind::Simulated,
                    base_url: None,
                    start_height: 100,
                }],
                ..Default::default()
            })
            .unwrap(),
        )
    }

    #[test]
    fn test_metrics_follow_events() {
        let refunds = AUTO_REFUNDS.get();
        let transitions = SWAP_TRANSITIONS.with_label_values(&[SwapStatus::Completed.to_string().as_str()]).get();
        record_metrics(&SwapEvent::RefundBroadcast {
            htlc_id: "h".into(),
            txid: "t".into(),
        });
        record_metrics(&SwapEvent::SwapStatusChanged {
            swap_id: "s".into(),
            from: SwapStatus::ParticipantFunded,
            to: SwapStatus::Completed,
        });
        assert!(AUTO_REFUNDS.get() > refunds);
        assert!(SWAP_TRANSITIONS.with_label_values(&[SwapStatus::Completed.to_string().as_str()]).get() > transitions);
    }

    #[tokio::test]
    async fn test_revealed_secret_reaches_waiting_claim() {
        let container = container();
        let secret = [0x0c; 32];
        let hash = SecretVault::hash_lock(&secret);
        let claim = container
            .scheduler
            .enqueue(ClaimTarget::Escrow { escrow_id: "0xe".into() }, hash, None, unix_now() + 3600)
            .unwrap();

        // A claimed HTLC record carrying the extracted preimage.
        let mut htlc = container
            .watchtowers
            .create(
                swap_core::HtlcConfig {
                    hash_lock: hash,
                    claim_pubkey: pubkey(0x11),
                    refund_pubkey: pubkey(0x22),
                    revocation_pubkey: None,
                    timelock: 200,
                    amount: 50_000,
                    format: swap_core::domain::AddressFormat::P2wsh,
                },
                None,
            )
            .unwrap()
            .state()
            .unwrap();
        htlc.secret = Some(SecureSecret::new(secret));
        htlc.status = HtlcStatus::Claimed;
        let htlc_id = htlc.id.clone();
        container.htlcs.put(htlc).unwrap();

        let router = EventRouter::new(container.clone());
        router
            .route(&SwapEvent::SecretRevealed {
                htlc_id,
                secret_hash: hash,
            })
            .await;
        assert_eq!(container.scheduler.get(&claim.id).unwrap().status, ClaimStatus::Ready);
    }

    #[tokio::test]
    async fn test_router_stops_on_shutdown() {
        let container = container();
        let (tx, rx) = watch::channel(false);
        let handle = EventRouter::new(container.clone()).spawn(rx);
        container.events.publish(SwapEvent::ClaimReady { claim_id: "c".into() });
        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    fn pubkey(byte: u8) -> String {
        let secp = bitcoin::secp256k1::Secp256k1::new();
        let sk = bitcoin::secp256k1::SecretKey::from_slice(&[byte; 32]).unwrap();
        bitcoin::PublicKey::new(sk.public_key(&secp)).to_string()
    }
}
