//! # Domain Layer
//!
//! Records, state machines, errors, events and configuration.

pub mod config;
pub mod entities;
pub mod errors;
pub mod events;
pub mod invariants;
pub mod secure_secret;
pub mod value_objects;

pub use config::*;
pub use entities::*;
pub use errors::*;
pub use events::*;
pub use invariants::*;
pub use secure_secret::SecureSecret;
pub use value_objects::*;
