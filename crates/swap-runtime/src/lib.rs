//! # Atomic Swap Runtime
//!
//! Assembles and runs the swap engine.
//!
//! ## Modular Structure
//!
//! - `container/` - Configuration and component assembly
//! - `adapters/` - Instrumented chain providers
//! - `wiring/` - Event routing into telemetry and between components
//! - `snapshot` - Persistence of records across restarts
//! - `metrics_server` - Prometheus `/metrics` endpoint
//!
//! ## Startup Sequence
//!
//! 1. Load configuration (file, then `SWAP_*` environment)
//! 2. Build the container
//! 3. Restore the snapshot, if one exists
//! 4. Return interrupted claims to `ready`
//! 5. Start the event router
//! 6. Resume watchtowers for unspent HTLCs
//! 7. Start the claim scheduler and the maintenance loop
//! 8. Serve `/metrics`, when an address is configured
//!
//! ## Shutdown Sequence
//!
//! 1. Stop the maintenance loop, the scheduler and every watchtower
//! 2. Wait (bounded) for in-flight claims
//! 3. Stop the router and the metrics endpoint
//! 4. Write the snapshot

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapters;
pub mod container;
pub mod metrics_server;
pub mod snapshot;
pub mod wiring;

pub use container::{EngineContainer, RuntimeConfig};
pub use metrics_server::MetricsServer;
pub use snapshot::{RestoreReport, Snapshot};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use swap_core::domain::unix_now;
use swap_core::{HtlcStatus, Repository, ScheduledTask};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::wiring::EventRouter;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// What `start` found and resumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartupReport {
    /// Records loaded from the snapshot.
    pub restored: Option<RestoreReport>,
    /// Claims returned to `ready`.
    pub recovered_claims: usize,
    /// Watchtowers polling again.
    pub resumed_watchtowers: usize,
    /// Where `/metrics` is served.
    pub metrics_addr: Option<SocketAddr>,
}

/// The running engine.
pub struct SwapRuntime {
    container: Arc<EngineContainer>,
    maintenance: Mutex<Option<ScheduledTask>>,
    router: Mutex<Option<JoinHandle<()>>>,
    metrics: Mutex<Option<MetricsServer>>,
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
}

impl SwapRuntime {
    /// Build the container. Nothing runs until [`SwapRuntime::start`].
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        info!("[runtime] creating atomic swap runtime v{}", VERSION);
        let container = Arc::new(EngineContainer::new(config)?);
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            container,
            maintenance: Mutex::new(None),
            router: Mutex::new(None),
            metrics: Mutex::new(None),
            shutdown_tx,
            started: AtomicBool::new(false),
        })
    }

    /// Shared component handles.
    pub fn container(&self) -> Arc<EngineContainer> {
        Arc::clone(&self.container)
    }

    /// Restore, recover and start every background loop.
    pub async fn start(&self) -> Result<StartupReport> {
        if self.started.swap(true, Ordering::SeqCst) {
            anyhow::bail!("runtime already started");
        }
        let container = &self.container;
        let mut report = StartupReport::default();

        if let Some(path) = container.config.snapshot_path.as_deref().filter(|p| p.exists()) {
            let restored = Snapshot::read(path)
                .and_then(|s| s.restore(container))
                .with_context(|| format!("failed to restore snapshot {}", path.display()))?;
            info!(
                "[runtime] restored {} htlc(s), {} claim(s), {} swap(s), {} redeemed script(s)",
                restored.htlcs, restored.claims, restored.swaps, restored.redeemed_scripts
            );
            report.restored = Some(restored);
        }

        report.recovered_claims = container
            .scheduler
            .recover_interrupted()
            .context("failed to recover interrupted claims")?;

        let router = EventRouter::new(container.clone()).spawn(self.shutdown_tx.subscribe());
        *self.router.lock() = Some(router);

        report.resumed_watchtowers = container.watchtowers.resume().context("failed to resume watchtowers")?;
        container.scheduler.start();

        let interval = Duration::from_millis(container.config.maintenance_interval_ms);
        let handle = container.clone();
        *self.maintenance.lock() = Some(ScheduledTask::every("runtime-maintenance", interval, move || {
            let container = handle.clone();
            async move { maintain(&container).await }
        }));

        if let Some(addr) = container.config.metrics_addr {
            let server = MetricsServer::bind(addr).await?;
            report.metrics_addr = Some(server.local_addr());
            *self.metrics.lock() = Some(server);
        }

        info!(
            recovered_claims = report.recovered_claims,
            resumed_watchtowers = report.resumed_watchtowers,
            "[runtime] started"
        );
        Ok(report)
    }

    /// Stop every loop and persist the snapshot.
    pub async fn shutdown(&self) -> Result<()> {
        info!("[runtime] initiating graceful shutdown");
        let container = &self.container;

        if let Some(task) = self.maintenance.lock().take() {
            task.stop();
        }
        container.scheduler.stop();
        container.watchtowers.stop_all();

        let grace = Duration::from_millis(container.config.shutdown_grace_ms);
        if tokio::time::timeout(grace, container.scheduler.wait_idle()).await.is_err() {
            warn!(
                in_flight = container.scheduler.in_flight(),
                "[runtime] claims still executing after {:?}; they resume as ready on restart", grace
            );
        }

        let _ = self.shutdown_tx.send(true);
        let router = self.router.lock().take();
        if let Some(router) = router {
            if let Err(e) = router.await {
                warn!("[runtime] router task ended abnormally: {}", e);
            }
        }
        let metrics = self.metrics.lock().take();
        if let Some(server) = metrics {
            server.stop().await;
        }

        if let Some(path) = &container.config.snapshot_path {
            Snapshot::capture(container)
                .and_then(|s| s.write(path))
                .with_context(|| format!("failed to write snapshot {}", path.display()))?;
        }
        info!("[runtime] shutdown complete");
        Ok(())
    }
}

/// Periodic upkeep: drop old terminal claims, release known secrets to
/// claims still waiting on them, and re-sync live swaps.
pub async fn maintain(container: &EngineContainer) {
    match container.scheduler.cleanup(unix_now()) {
        Ok(0) => {}
        Ok(removed) => info!("[runtime] cleaned up {} claim(s)", removed),
        Err(e) => warn!("[runtime] claim cleanup failed: {}", e),
    }
    release_revealed_secrets(container);

    let Some(coordinator) = &container.coordinator else {
        return;
    };
    match coordinator.list() {
        Ok(swaps) => {
            for swap in swaps.into_iter().filter(|s| !s.status.is_terminal()) {
                if let Err(e) = coordinator.sync(&swap.id).await {
                    warn!(swap_id = %swap.id, "[runtime] sync failed: {}", e);
                }
            }
        }
        Err(e) => warn!("[runtime] cannot list swaps: {}", e),
    }
}

/// Reveal the preimage of every claimed HTLC to pending claims on its hash.
/// Covers secret events the router missed.
fn release_revealed_secrets(container: &EngineContainer) {
    let htlcs = match container.htlcs.list() {
        Ok(htlcs) => htlcs,
        Err(e) => {
            warn!("[runtime] cannot list htlcs: {}", e);
            return;
        }
    };
    for htlc in htlcs.iter().filter(|h| h.status == HtlcStatus::Claimed) {
        let Some(secret) = &htlc.secret else {
            continue;
        };
        match container.scheduler.reveal_secret_for_hash(secret) {
            Ok(released) if !released.is_empty() => {
                info!(htlc_id = %htlc.id, "[runtime] released secret to {} waiting claim(s)", released.len());
            }
            Ok(_) => {}
            Err(e) => warn!(htlc_id = %htlc.id, "[runtime] secret release failed: {}", e),
        }
    }
}
