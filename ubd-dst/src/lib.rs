//! Deterministic Simulation Testing (DST) for the ubd dispatcher.
//!
//! Kept out of the `ubd` crate so fault-injecting backends are never compiled
//! into the binary.
//!
//! ## Crate Structure
//!
//! - `harness` - dispatcher harness, byte oracle and fault injection
//! - `simulation` - runtime and simulation runners
//!
//! ## Running DST Tests
//!
//! ```bash
//! # PR-level quick tests
//! cargo test -p ubd-dst simulation
//!
//! # Nightly long-running tests
//! cargo test -p ubd-dst simulation -- --ignored
//!
//! # Reproduce a failure
//! DST_SEED=1234 cargo test -p ubd-dst simulation
//! ```

pub mod harness;
pub mod simulation;

pub use nbd::{NbdClient, NbdError};

pub use harness::{
    DispatcherAction, DispatcherHarness, DispatcherStats, FaultyBackend, ImageOracle,
    SimulationError,
};
pub use simulation::{build_runtime, get_seed, run_dispatcher_simulation};
