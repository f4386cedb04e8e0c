//! # Adapters Layer
//!
//! Implementations of the outbound ports: REST chain providers, a simulated
//! chain, in-memory persistence, an in-memory escrow and alert sinks.

pub mod alert;
pub mod blockcypher;
pub mod escrow;
pub mod esplora;
pub mod http;
pub mod memory_store;
pub mod simulated;

pub use alert::{LogAlertSink, MemoryAlertSink, WebhookAlertSink};
pub use blockcypher::BlockCypherProvider;
pub use escrow::InMemoryEscrow;
pub use esplora::EsploraProvider;
pub use memory_store::InMemoryRepository;
pub use simulated::SimulatedChain;
