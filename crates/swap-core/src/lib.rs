//! # Cross-Chain Atomic Swap Engine
//!
//! Hash Time-Locked Contracts between a UTXO script chain and a
//! smart-contract chain escrow.
//!
//! ## Components
//!
//! | Component | Responsibility |
//! |-----------|----------------|
//! | [`SecretVault`] / [`ScriptBuilder`] | Secrets, hash-locks, HTLC scripts, replay registry |
//! | [`NetworkGateway`] | Multi-provider chain access with failover |
//! | [`TransactionBuilder`] | Funding, claim, refund and revoke transactions |
//! | [`HtlcLifecycleManager`] | Watchtower: detect spends, auto-refund on expiry |
//! | [`ClaimScheduler`] | Priority claim queue with bounded concurrency and back-off |
//! | [`CrossChainCoordinator`] | Swap phases across both legs |
//!
//! ## Safety Invariants
//!
//! - A secret is only accepted if `SHA256(secret) == hash_lock`.
//! - The second leg expires at least the configured margin before the first.
//! - Claims are refused at or after their timelock; refunds before it.
//! - A script hash is never redeemed twice.
//!
//! ## Crate Structure
//!
//! ```text
//! swap-core/
//! ├── domain/          # Records, state machines, errors, events, config
//! ├── algorithms/      # Secrets, scripts, fees, transactions, interpreter
//! ├── ports/           # ChainProvider, EscrowContract, Repository, ClaimExecutor
//! ├── adapters/        # Esplora, BlockCypher, simulated chain, in-memory stores
//! └── service/         # Gateway, builder, watchtower, scheduler, coordinator
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapters;
pub mod algorithms;
pub mod domain;
pub mod ports;
pub mod service;

// Re-exports
pub use algorithms::{ScriptBuilder, ScriptRegistry, SecretSealer, SecretVault};
pub use domain::{
    AtomicSwapState, ClaimStatus, ClaimTarget, EngineConfig, Hash, HtlcConfig, HtlcScript, HtlcState, HtlcStatus,
    PendingClaim, ProviderError, SecureSecret, SwapError, SwapEvent, SwapStatus,
};
pub use ports::{AlertSink, ChainProvider, ClaimExecutor, EscrowContract, Repository};
pub use service::{
    ClaimScheduler, CrossChainCoordinator, EventBus, HtlcLifecycleManager, NetworkGateway, ScheduledTask,
    TransactionBuilder, WatchtowerRegistry,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
