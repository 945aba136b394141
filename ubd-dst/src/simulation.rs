//! Simulation runners and utilities.

use crate::harness::{DispatcherHarness, SimulationError};

/// Build a single-threaded tokio runtime for simulation.
///
/// Client and dispatcher alternate strictly (one request in flight), so with
/// one worker thread and a seeded workload the run is reproducible from the
/// seed alone.
pub fn build_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime")
}

/// Run a dispatcher simulation with the given seed and number of operations.
pub async fn run_dispatcher_simulation(
    seed: u64,
    size_bytes: u64,
    operations: u64,
) -> Result<(), SimulationError> {
    let mut harness = DispatcherHarness::start(seed, size_bytes);
    eprintln!(
        "dispatcher simulation: seed={}, size={}, ops={}, policy={:?}",
        seed,
        size_bytes,
        operations,
        harness.policy()
    );

    harness.run(operations).await?;
    let stats = harness.stats().clone();
    let report = harness.finish().await?;

    eprintln!(
        "dispatcher simulation complete: {:?}, bytes_read={}, bytes_written={}",
        stats, report.stats.bytes_read, report.stats.bytes_written
    );
    Ok(())
}

/// Get the seed from environment or generate a random one.
pub fn get_seed() -> u64 {
    std::env::var("DST_SEED")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(rand::random)
}
