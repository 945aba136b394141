//! Simulation harnesses for the dispatcher.
//!
//! - a byte oracle holding the expected device image,
//! - a backend wrapper that fails chosen calls with chosen codes,
//! - a seeded action generator driving a dispatcher through `NbdClient`.

pub mod dispatcher;
pub mod fault;

pub use dispatcher::{DispatcherAction, DispatcherHarness, DispatcherStats, ImageOracle};
pub use fault::FaultyBackend;

use thiserror::Error;

/// Error type for simulation failures.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("oracle mismatch: {context}")]
    Mismatch { context: String },

    #[error("unexpected error: {0}")]
    Unexpected(String),
}
