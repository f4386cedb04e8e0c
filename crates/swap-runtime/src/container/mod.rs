//! # Engine Container
//!
//! Builds every swap-core component from a [`RuntimeConfig`] and holds the
//! shared handles.
//!
//! ## Initialization Order
//!
//! 1. Chain providers (each wrapped in [`InstrumentedProvider`]) and the gateway
//! 2. Script registry, script builder and transaction builder
//! 3. Event bus and repositories
//! 4. Watchtower registry with the default refund authority
//! 5. Claim scheduler with its executors
//! 6. Coordinator (only when a claim key is configured)

pub mod config;

pub use config::{AlertConfig, ConfigError, KeyMaterial, ProviderConfig, ProviderKind, RuntimeConfig, WalletConfig};

use crate::adapters::InstrumentedProvider;
use anyhow::{Context, Result};
use bitcoin::secp256k1::Secp256k1;
use std::sync::Arc;
use std::time::Duration;
use swap_core::adapters::{
    BlockCypherProvider, EsploraProvider, InMemoryEscrow, InMemoryRepository, LogAlertSink, SimulatedChain,
    WebhookAlertSink,
};
use swap_core::domain::ClaimKind;
use swap_core::service::{
    CoordinatorDeps, EscrowClaimExecutor, RefundAuthority, ScriptChainClaimExecutor, WatchtowerDeps,
};
use swap_core::{
    AlertSink, AtomicSwapState, ChainProvider, ClaimScheduler, CrossChainCoordinator, EventBus, HtlcState,
    NetworkGateway, PendingClaim, Repository, ScriptBuilder, ScriptRegistry, SecretSealer, TransactionBuilder,
    WatchtowerRegistry,
};
use tracing::{info, warn};

/// Assembled engine.
pub struct EngineContainer {
    /// Configuration the container was built from.
    pub config: RuntimeConfig,
    /// Simulated chains among the providers, for local runs and tests.
    pub simulated: Vec<Arc<SimulatedChain>>,
    /// Provider rotation.
    pub gateway: Arc<NetworkGateway>,
    /// Redeemed script hashes.
    pub registry: Arc<ScriptRegistry>,
    /// Spend construction and broadcast.
    pub builder: Arc<TransactionBuilder>,
    /// Engine events.
    pub events: Arc<EventBus>,
    /// HTLC records.
    pub htlcs: Arc<dyn Repository<HtlcState>>,
    /// Claim records.
    pub claims: Arc<dyn Repository<PendingClaim>>,
    /// Swap records.
    pub swaps: Arc<dyn Repository<AtomicSwapState>>,
    /// Smart-contract-chain escrow.
    pub escrow: Arc<InMemoryEscrow>,
    /// Running watchtowers.
    pub watchtowers: Arc<WatchtowerRegistry>,
    /// Claim queue.
    pub scheduler: Arc<ClaimScheduler>,
    /// Swap orchestration, present when a claim key is configured.
    pub coordinator: Option<Arc<CrossChainCoordinator>>,
}

impl EngineContainer {
    /// Build all components. Does not start any background work.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let network = config.engine.network;
        let (providers, simulated) = build_providers(&config)?;
        info!("[container] {} chain provider(s) on {}", providers.len(), network);

        let gateway = Arc::new(
            NetworkGateway::new(providers, config.engine.gateway.clone()).context("failed to create network gateway")?,
        );
        let registry = Arc::new(ScriptRegistry::new());
        let scripts = Arc::new(ScriptBuilder::new(network, registry.clone()));
        let builder = Arc::new(TransactionBuilder::new(
            gateway.clone(),
            registry.clone(),
            config.engine.tx_builder.clone(),
            network,
        ));

        let events = Arc::new(EventBus::new());
        let htlcs: Arc<dyn Repository<HtlcState>> = Arc::new(InMemoryRepository::<HtlcState>::new());
        let claims: Arc<dyn Repository<PendingClaim>> = Arc::new(InMemoryRepository::<PendingClaim>::new());
        let swaps: Arc<dyn Repository<AtomicSwapState>> = Arc::new(InMemoryRepository::<AtomicSwapState>::new());

        let mut watchtowers = WatchtowerRegistry::new(
            scripts,
            WatchtowerDeps {
                gateway: gateway.clone(),
                builder: builder.clone(),
                repository: htlcs.clone(),
                events: events.clone(),
                alerts: Some(build_alert_sink(&config)?),
            },
            config.engine.watchtower.clone(),
        );
        if let (Some(key), Some(destination)) = (config.keys.refund_key, config.wallet.refund_destination.clone()) {
            watchtowers = watchtowers.with_default_refund(RefundAuthority {
                key,
                destination,
                fee_rate: config.wallet.refund_fee_rate,
            });
        } else {
            warn!("[container] no refund key configured; expired HTLCs will only raise alerts");
        }
        let watchtowers = Arc::new(watchtowers);

        let sealer = match &config.keys.sealing_key {
            Some(key) => SecretSealer::from_hex(key).context("invalid sealing key")?,
            None => {
                warn!("[container] SWAP_SEALING_KEY unset; sealed secrets will not survive a restart");
                SecretSealer::generate()
            }
        };

        let escrow = Arc::new(InMemoryEscrow::new());
        let mut scheduler = ClaimScheduler::new(
            claims.clone(),
            Arc::new(sealer),
            events.clone(),
            config.engine.scheduler.clone(),
        )
        .context("failed to create claim scheduler")?
        .with_executor(ClaimKind::Escrow, Arc::new(EscrowClaimExecutor::new(escrow.clone())));
        if let (Some(key), Some(destination)) = (config.keys.claim_key, config.wallet.claim_destination.clone()) {
            scheduler = scheduler.with_executor(
                ClaimKind::ScriptChain,
                Arc::new(ScriptChainClaimExecutor::new(
                    htlcs.clone(),
                    builder.clone(),
                    events.clone(),
                    key,
                    destination,
                )),
            );
        }
        let scheduler = Arc::new(scheduler);

        let coordinator = match config.keys.claim_key {
            Some(key) => {
                let secp = Secp256k1::new();
                let claim_pubkey = bitcoin::PublicKey::new(key.public_key(&secp)).to_string();
                let coordinator = CrossChainCoordinator::new(
                    CoordinatorDeps {
                        swaps: swaps.clone(),
                        htlcs: htlcs.clone(),
                        escrow: escrow.clone(),
                        watchtowers: watchtowers.clone(),
                        scheduler: scheduler.clone(),
                        gateway: gateway.clone(),
                        events: events.clone(),
                    },
                    config.engine.coordinator.clone(),
                    &claim_pubkey,
                )
                .context("failed to create coordinator")?;
                info!("[container] coordinator claiming with {}", claim_pubkey);
                Some(Arc::new(coordinator))
            }
            None => {
                warn!("[container] no claim key configured; running as a watchtower only");
                None
            }
        };

        Ok(Self {
            config,
            simulated,
            gateway,
            registry,
            builder,
            events,
            htlcs,
            claims,
            swaps,
            escrow,
            watchtowers,
            scheduler,
            coordinator,
        })
    }
}

/// Providers in configured order, plus handles to the simulated ones.
fn build_providers(config: &RuntimeConfig) -> Result<(Vec<Arc<dyn ChainProvider>>, Vec<Arc<SimulatedChain>>)> {
    let timeout = config.engine.gateway.request_timeout();
    let mut providers: Vec<Arc<dyn ChainProvider>> = Vec::with_capacity(config.providers.len());
    let mut simulated = Vec::new();

    for provider in &config.providers {
        let url = provider.base_url.clone().unwrap_or_default();
        let inner: Arc<dyn ChainProvider> = match provider.kind {
            ProviderKind::Esplora => Arc::new(
                EsploraProvider::new(&provider.name, url, timeout)
                    .with_context(|| format!("provider '{}'", provider.name))?,
            ),
            ProviderKind::Blockcypher => Arc::new(
                BlockCypherProvider::new(&provider.name, url, timeout)
                    .with_context(|| format!("provider '{}'", provider.name))?,
            ),
            ProviderKind::Simulated => {
                let chain = Arc::new(SimulatedChain::new(&provider.name, provider.start_height));
                simulated.push(chain.clone());
                chain
            }
        };
        providers.push(Arc::new(InstrumentedProvider::new(inner)));
    }
    Ok((providers, simulated))
}

fn build_alert_sink(config: &RuntimeConfig) -> Result<Arc<dyn AlertSink>> {
    Ok(match &config.alerts.webhook_url {
        Some(url) => Arc::new(
            WebhookAlertSink::new(url.clone(), Duration::from_millis(config.alerts.timeout_ms))
                .context("failed to create alert webhook client")?,
        ),
        None => Arc::new(LogAlertSink),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simulated_config() -> RuntimeConfig {
        RuntimeConfig {
            providers: vec![ProviderConfig {
                name: "sim".into(),
                kind: ProviderKind::Simulated,
                base_url: None,
                start_height: 1_000,
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_watch_only_without_claim_key() {
        let container = EngineContainer::new(simulated_config()).unwrap();
        assert!(container.coordinator.is_none());
        assert_eq!(container.simulated.len(), 1);
        assert_eq!(container.gateway.get_current_block_height().await.unwrap(), 1_000);
    }

    #[tokio::test]
    async fn test_coordinator_built_with_claim_key() {
        let mut config = simulated_config();
        config
            .apply_env(|var| match var {
                "SWAP_CLAIM_KEY" => Some("11".repeat(32)),
                "SWAP_CLAIM_DESTINATION" => Some("tb1qclaim".into()),
                _ => None,
            })
            .unwrap();
        let container = EngineContainer::new(config).unwrap();
        let coordinator = container.coordinator.as_ref().unwrap();
        assert_eq!(coordinator.claim_pubkey().len(), 66);
    }

    #[test]
    fn test_rest_providers_are_constructed_lazily() {
        let config = RuntimeConfig::default();
        let (providers, simulated) = build_providers(&config).unwrap();
        assert_eq!(providers.len(), 2);
        assert!(simulated.is_empty());
        assert_eq!(providers[0].name(), "blockstream");
    }
}
