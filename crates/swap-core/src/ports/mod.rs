//! # Ports Layer
//!
//! Outbound interfaces the engine depends on.

pub mod outbound;

pub use outbound::*;
