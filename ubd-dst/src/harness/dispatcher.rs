//! Dispatcher simulation harness.
//!
//! Plays the kernel's side of the wire with `NbdClient` against a dispatcher
//! serving a [`FaultyBackend`], and checks every read against an in-memory
//! image of what the device should hold. Backend faults and out-of-range
//! requests are injected to check error codes arrive verbatim and the session
//! keeps going.

use std::sync::Arc;

use nbd::{NBD_EINVAL, NBD_EIO, NBD_ENOSPC, NBD_EPERM, NbdClient, NbdError, ReadErrorPayload};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::io::{DuplexStream, duplex};
use tokio::task::JoinHandle;
use ubd::{DispatchConfig, Dispatcher, SessionEnd, SessionReport};

use super::{FaultyBackend, SimulationError};

const MAX_IO_BYTES: u64 = 32 * 1024;

/// Actions that can be performed in a dispatcher simulation.
#[derive(Debug, Clone)]
pub enum DispatcherAction {
    Read { offset: u64, length: u32 },
    Write { offset: u64, data: Vec<u8> },
    Trim { offset: u64, length: u32 },
    Flush,
    /// Read or write crossing the end of the device.
    OutOfBounds { offset: u64, length: u32, write: bool },
    /// Run the inner action with the backend armed to fail it.
    Faulted {
        action: Box<DispatcherAction>,
        code: u32,
    },
}

/// Expected device contents.
pub struct ImageOracle {
    image: Vec<u8>,
}

impl ImageOracle {
    pub fn new(size_bytes: u64) -> Self {
        Self {
            image: vec![0u8; size_bytes as usize],
        }
    }

    pub fn read(&self, offset: u64, length: u32) -> &[u8] {
        let start = offset as usize;
        &self.image[start..start + length as usize]
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) {
        let start = offset as usize;
        self.image[start..start + data.len()].copy_from_slice(data);
    }

    pub fn trim(&mut self, offset: u64, length: u32) {
        let start = offset as usize;
        self.image[start..start + length as usize].fill(0);
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }
}

/// Simulation statistics, counted per request sent.
#[derive(Debug, Default, Clone)]
pub struct DispatcherStats {
    pub operations: u64,
    pub reads: u64,
    pub writes: u64,
    pub trims: u64,
    pub flushes: u64,
    pub faults: u64,
    pub out_of_bounds: u64,
}

/// Dispatcher simulation harness.
pub struct DispatcherHarness {
    rng: SmallRng,
    size_bytes: u64,
    policy: ReadErrorPayload,
    backend: Arc<FaultyBackend>,
    client: NbdClient<DuplexStream>,
    session: Option<JoinHandle<Result<SessionReport, NbdError>>>,
    oracle: ImageOracle,
    stats: DispatcherStats,
}

impl DispatcherHarness {
    /// Spawn a dispatcher on the current runtime.
    ///
    /// The seed also picks the read-error payload policy and the in-memory
    /// pipe capacity, so short transfers get exercised.
    pub fn start(seed: u64, size_bytes: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let policy = if rng.random_bool(0.5) {
            ReadErrorPayload::ZeroFill
        } else {
            ReadErrorPayload::Omit
        };
        let pipe_bytes = rng.random_range(64..=64 * 1024);

        let backend = Arc::new(FaultyBackend::new(size_bytes));
        let config = DispatchConfig {
            read_error_payload: policy,
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(backend.clone(), config);

        let (client_stream, server_stream) = duplex(pipe_bytes);
        let session = tokio::spawn(async move { dispatcher.run(server_stream).await });
        let client = NbdClient::new(client_stream).with_read_error_payload(policy);

        Self {
            rng,
            size_bytes,
            policy,
            backend,
            client,
            session: Some(session),
            oracle: ImageOracle::new(size_bytes),
            stats: DispatcherStats::default(),
        }
    }

    pub fn policy(&self) -> ReadErrorPayload {
        self.policy
    }

    /// Run the simulation for a given number of operations.
    pub async fn run(&mut self, operations: u64) -> Result<(), SimulationError> {
        for _ in 0..operations {
            let action = self.sample_action();
            self.execute(action).await?;
        }
        Ok(())
    }

    fn sample_range(&mut self) -> (u64, u32) {
        let max_len = MAX_IO_BYTES.min(self.size_bytes);
        let length = self.rng.random_range(1..=max_len);
        let offset = self.rng.random_range(0..=self.size_bytes - length);
        (offset, length as u32)
    }

    fn sample_plain(&mut self) -> DispatcherAction {
        match self.rng.random_range(0..100) {
            0..40 => {
                let (offset, length) = self.sample_range();
                DispatcherAction::Read { offset, length }
            }
            40..75 => {
                let (offset, length) = self.sample_range();
                let data: Vec<u8> = (0..length).map(|_| self.rng.random()).collect();
                DispatcherAction::Write { offset, data }
            }
            75..88 => {
                let (offset, length) = self.sample_range();
                DispatcherAction::Trim { offset, length }
            }
            _ => DispatcherAction::Flush,
        }
    }

    fn sample_action(&mut self) -> DispatcherAction {
        match self.rng.random_range(0..100) {
            0..5 => {
                let action = Box::new(self.sample_plain());
                let code = match self.rng.random_range(0..4) {
                    0 => NBD_EIO,
                    1 => NBD_ENOSPC,
                    2 => NBD_EPERM,
                    _ => self.rng.random_range(1..=u32::MAX),
                };
                DispatcherAction::Faulted { action, code }
            }
            5..8 => {
                let spill = self.rng.random_range(1..=512u64);
                let length = self.rng.random_range(spill + 1..=spill + 4096);
                let offset = (self.size_bytes + spill).saturating_sub(length);
                DispatcherAction::OutOfBounds {
                    offset,
                    length: length as u32,
                    write: self.rng.random_bool(0.5),
                }
            }
            _ => self.sample_plain(),
        }
    }

    /// Execute a single action.
    pub async fn execute(&mut self, action: DispatcherAction) -> Result<(), SimulationError> {
        self.stats.operations += 1;
        match action {
            DispatcherAction::Faulted { action, code } => {
                self.stats.faults += 1;
                self.backend.arm(code);
                self.execute_failing(*action, code).await
            }
            DispatcherAction::OutOfBounds {
                offset,
                length,
                write,
            } => {
                self.stats.out_of_bounds += 1;
                let action = if write {
                    DispatcherAction::Write {
                        offset,
                        data: vec![0xFF; length as usize],
                    }
                } else {
                    DispatcherAction::Read { offset, length }
                };
                self.execute_failing(action, NBD_EINVAL).await
            }
            action => self.execute_ok(action).await,
        }
    }

    async fn execute_ok(&mut self, action: DispatcherAction) -> Result<(), SimulationError> {
        match action {
            DispatcherAction::Read { offset, length } => {
                self.stats.reads += 1;
                let actual = self
                    .client
                    .read(offset, length)
                    .await
                    .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
                let expected = self.oracle.read(offset, length);
                if actual.as_ref() != expected {
                    return Err(SimulationError::Mismatch {
                        context: format!(
                            "read(offset={}, len={}): first diff at byte {}",
                            offset,
                            length,
                            find_diff(expected, &actual)
                        ),
                    });
                }
            }
            DispatcherAction::Write { offset, data } => {
                self.stats.writes += 1;
                self.client
                    .write(offset, &data)
                    .await
                    .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
                self.oracle.write(offset, &data);
            }
            DispatcherAction::Trim { offset, length } => {
                self.stats.trims += 1;
                self.client
                    .trim(offset, length)
                    .await
                    .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
                self.oracle.trim(offset, length);
            }
            DispatcherAction::Flush => {
                self.stats.flushes += 1;
                self.client
                    .flush()
                    .await
                    .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
            }
            other => {
                return Err(SimulationError::Unexpected(format!(
                    "nested action not supported: {other:?}"
                )));
            }
        }
        Ok(())
    }

    /// Send `action` and expect the reply to carry `code`. The oracle is left
    /// alone since the backend never applied it.
    async fn execute_failing(
        &mut self,
        action: DispatcherAction,
        code: u32,
    ) -> Result<(), SimulationError> {
        let description = describe(&action);
        let result = match action {
            DispatcherAction::Read { offset, length } => {
                self.stats.reads += 1;
                self.client.read(offset, length).await.map(|_| ())
            }
            DispatcherAction::Write { offset, data } => {
                self.stats.writes += 1;
                self.client.write(offset, &data).await
            }
            DispatcherAction::Trim { offset, length } => {
                self.stats.trims += 1;
                self.client.trim(offset, length).await
            }
            DispatcherAction::Flush => {
                self.stats.flushes += 1;
                self.client.flush().await
            }
            other => {
                return Err(SimulationError::Unexpected(format!(
                    "nested action not supported: {other:?}"
                )));
            }
        };

        match result {
            Err(NbdError::ServerError { code: actual }) if actual == code => {}
            Err(e) => return Err(SimulationError::Unexpected(e.to_string())),
            Ok(()) => {
                return Err(SimulationError::Mismatch {
                    context: format!("{description}: expected error {code}, got success"),
                });
            }
        }
        if self.backend.is_armed() {
            return Err(SimulationError::Mismatch {
                context: format!("{description}: backend never saw the request"),
            });
        }
        Ok(())
    }

    /// Disconnect and check the session's own accounting and the final image.
    pub async fn finish(mut self) -> Result<SessionReport, SimulationError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
        let report = self
            .session
            .take()
            .ok_or_else(|| SimulationError::Unexpected("session already finished".into()))?
            .await
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?;

        let s = &self.stats;
        let expected = [
            ("end", matches!(report.end, SessionEnd::Disconnect)),
            ("requests", report.stats.requests == s.operations + 1),
            ("reads", report.stats.reads == s.reads),
            ("writes", report.stats.writes == s.writes),
            ("trims", report.stats.trims == s.trims),
            ("flushes", report.stats.flushes == s.flushes),
            ("errors", report.stats.errors == s.faults + s.out_of_bounds),
            ("disconnects", self.backend.disconnects() == 1),
            ("cleanups", self.backend.cleanups() == 1),
        ];
        if let Some((what, _)) = expected.iter().find(|(_, ok)| !ok) {
            return Err(SimulationError::Mismatch {
                context: format!("session report {what}: {report:?} vs {s:?}"),
            });
        }

        let image = self.backend.snapshot().await;
        if image != self.oracle.image() {
            return Err(SimulationError::Mismatch {
                context: format!(
                    "final image: first diff at byte {}",
                    find_diff(self.oracle.image(), &image)
                ),
            });
        }
        Ok(report)
    }

    pub fn stats(&self) -> &DispatcherStats {
        &self.stats
    }
}

fn describe(action: &DispatcherAction) -> String {
    match action {
        DispatcherAction::Read { offset, length } => format!("read(offset={offset}, len={length})"),
        DispatcherAction::Write { offset, data } => {
            format!("write(offset={offset}, len={})", data.len())
        }
        DispatcherAction::Trim { offset, length } => format!("trim(offset={offset}, len={length})"),
        DispatcherAction::Flush => "flush".to_string(),
        DispatcherAction::OutOfBounds { .. } | DispatcherAction::Faulted { .. } => {
            format!("{action:?}")
        }
    }
}

fn find_diff(expected: &[u8], actual: &[u8]) -> usize {
    expected
        .iter()
        .zip(actual)
        .position(|(e, a)| e != a)
        .unwrap_or_else(|| expected.len().min(actual.len()))
}
