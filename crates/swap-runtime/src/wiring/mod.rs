//! # Wiring
//!
//! Event routing between the engine components and into telemetry.

pub mod event_routing;

pub use event_routing::{record_metrics, EventRouter};
