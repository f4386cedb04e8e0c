//! # Runtime Adapters
//!
//! Port implementations that exist only in the deployed binary.

mod instrumented;

pub use instrumented::InstrumentedProvider;
