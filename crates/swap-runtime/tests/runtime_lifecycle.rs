//! # Runtime Lifecycle
//!
//! The assembled runtime over a simulated chain:
//!
//! 1. **Swap** - claim, secret routing, escrow claim and completion run
//!    from the background loops alone, and show up on `/metrics`
//! 2. **Restart** - shutdown writes a snapshot, the next start restores it
//!    and resumes the watchtower

use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::{Address, CompressedPublicKey, Network};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use swap_core::domain::{unix_now, AddressFormat, SwapQuote};
use swap_core::service::SwapRequest;
use swap_core::{ClaimTarget, HtlcConfig, HtlcStatus, Repository, SecretVault, SwapStatus};
use swap_runtime::container::{ProviderConfig, ProviderKind};
use swap_runtime::{RuntimeConfig, SwapRuntime};

// =============================================================================
// TEST HELPERS
// =============================================================================

const START_HEIGHT: u32 = 3_000;
const SEALING_KEY: &str = "5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a";

fn pubkey(byte: u8) -> String {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
    bitcoin::PublicKey::new(sk.public_key(&secp)).to_string()
}

fn wallet_address(byte: u8) -> String {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
    Address::p2wpkh(&CompressedPublicKey(sk.public_key(&secp)), Network::Regtest).to_string()
}

fn config(snapshot: Option<PathBuf>) -> RuntimeConfig {
    let mut config = RuntimeConfig {
        providers: vec![ProviderConfig {
            name: "sim".into(),
            kind: ProviderKind::Simulated,
            base_url: None,
            start_height: START_HEIGHT,
        }],
        snapshot_path: snapshot,
        maintenance_interval_ms: 100,
        shutdown_grace_ms: 1_000,
        ..Default::default()
    };
    config.engine.network = Network::Regtest;
    config.engine.scheduler.tick_interval_ms = 50;
    let claim_key = "11".repeat(32);
    let destination = wallet_address(0x44);
    config
        .apply_env(|var| match var {
            "SWAP_CLAIM_KEY" => Some(claim_key.clone()),
            "SWAP_CLAIM_DESTINATION" => Some(destination.clone()),
            "SWAP_SEALING_KEY" => Some(SEALING_KEY.into()),
            _ => None,
        })
        .unwrap();
    config.validate().unwrap();
    config
}

fn participant_htlc(hash_lock: [u8; 32]) -> HtlcConfig {
    HtlcConfig {
        hash_lock,
        claim_pubkey: pubkey(0x11),
        refund_pubkey: pubkey(0x22),
        revocation_pubkey: None,
        timelock: START_HEIGHT + 12,
        amount: 120_000,
        format: AddressFormat::P2wsh,
    }
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

// =============================================================================
// SWAP
// =============================================================================

#[tokio::test]
async fn swap_completes_from_background_loops() {
    let mut settings = config(None);
    settings.metrics_addr = Some(SocketAddr::from(([127, 0, 0, 1], 0)));
    let runtime = SwapRuntime::new(settings).unwrap();
    let report = runtime.start().await.unwrap();
    let metrics_addr = report.metrics_addr.unwrap();
    let c = runtime.container();
    let coordinator = c.coordinator.clone().unwrap();

    let swap = coordinator
        .initiate(SwapRequest {
            resolver: "0xresolver".into(),
            quote: SwapQuote {
                from_asset: "ETH".into(),
                to_asset: "BTC".into(),
                amount: 1_500_000,
                expected_amount: 120_000,
                fee_estimate: 800,
            },
            escrow_deadline: unix_now() + 24 * 3600,
        })
        .await
        .unwrap();
    let resolver_claim = c
        .scheduler
        .enqueue(
            ClaimTarget::Escrow {
                escrow_id: swap.escrow_id.clone().unwrap(),
            },
            swap.secret_hash,
            None,
            swap.timelock,
        )
        .unwrap();

    let htlc = coordinator
        .register_participant_htlc(&swap.id, participant_htlc(swap.secret_hash))
        .await
        .unwrap();
    let utxo = c.simulated[0].fund_address(&htlc.script.address, 120_000, 2).unwrap();
    coordinator
        .confirm_participant_funding(&swap.id, &utxo.txid, utxo.vout)
        .await
        .unwrap();
    coordinator.claim(&swap.id).await.unwrap();

    eventually("the HTLC claim", || {
        c.htlcs.require(&htlc.id).map(|h| h.status == HtlcStatus::Claimed).unwrap_or(false)
    })
    .await;
    eventually("the escrow claim", || {
        c.scheduler.get(&resolver_claim.id).map(|cl| cl.status.is_terminal()).unwrap_or(false)
    })
    .await;
    eventually("swap completion", || {
        coordinator.get(&swap.id).map(|s| s.status == SwapStatus::Completed).unwrap_or(false)
    })
    .await;

    assert_eq!(c.escrow.executions(), 1);

    // The router records metrics after the state change it observes.
    let mut scraped = String::new();
    for _ in 0..100 {
        scraped = reqwest::get(format!("http://{metrics_addr}/metrics"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        if scraped.contains("swap_coordinator_transitions_total{to=\"completed\"}") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(scraped.contains("swap_scheduler_claims_total{event=\"succeeded\"}"));
    assert!(scraped.contains("swap_coordinator_transitions_total{to=\"completed\"}"));

    runtime.shutdown().await.unwrap();
    assert!(!c.scheduler.is_running());
    assert_eq!(c.watchtowers.running(), 0);
}

// =============================================================================
// RESTART
// =============================================================================

#[tokio::test]
async fn restart_restores_snapshot_and_resumes_watchtower() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("swap-state.json");

    let first = SwapRuntime::new(config(Some(path.clone()))).unwrap();
    let report = first.start().await.unwrap();
    assert!(report.restored.is_none());
    let c = first.container();
    let manager = c
        .watchtowers
        .create(participant_htlc(SecretVault::hash_lock(&[0x31; 32])), None)
        .unwrap();
    let utxo = c.simulated[0]
        .fund_address(&manager.state().unwrap().script.address, 120_000, 1)
        .unwrap();
    manager.mark_funded(&utxo.txid, utxo.vout, 1).await.unwrap();
    first.shutdown().await.unwrap();
    assert!(path.exists());

    let second = SwapRuntime::new(config(Some(path.clone()))).unwrap();
    let report = second.start().await.unwrap();
    let restored = report.restored.unwrap();
    assert_eq!(restored.htlcs, 1);
    assert_eq!(report.resumed_watchtowers, 1);
    assert!(second.start().await.is_err());
    second.shutdown().await.unwrap();
}
