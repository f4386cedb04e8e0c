//! # Service Layer
//!
//! Async components that talk to chains and run background work.

pub mod coordinator;
pub mod events;
pub mod executors;
pub mod gateway;
pub mod scheduler;
pub mod task;
pub mod transaction_builder;
pub mod watchtower;

pub use coordinator::{CoordinatorDeps, CrossChainCoordinator, SwapRequest};
pub use events::EventBus;
pub use executors::{EscrowClaimExecutor, ScriptChainClaimExecutor};
pub use gateway::NetworkGateway;
pub use scheduler::{ClaimScheduler, TickReport};
pub use task::ScheduledTask;
pub use transaction_builder::{FundingRequest, FundingTransaction, SignedSpend, SpendRequest, TransactionBuilder};
pub use watchtower::{
    FundingPlan, HtlcLifecycleManager, PollReport, RefundAuthority, WatchtowerDeps, WatchtowerRegistry,
};
