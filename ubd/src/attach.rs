//! Device attachment.
//!
//! Binds a block device node to a [`StorageBackend`]. After geometry is
//! negotiated, a socketpair is split between two activities:
//!
//! - a dedicated OS thread hands one end to the kernel and parks in
//!   `NBD_DO_IT` for the life of the device,
//! - a tokio task runs the [`Dispatcher`] on the other end.
//!
//! They share nothing but the socketpair. When the kernel lets go of its end
//! the dispatcher sees EOF, and when the dispatcher drops its end the kernel's
//! request pump returns.

use std::os::fd::AsFd;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nbd::{KernelControl, NbdDevice, NbdError, disconnect_device};
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::StorageBackend;
use crate::config::{DeviceConfig, DispatchConfig};
use crate::dispatcher::{Dispatcher, SessionReport};
use crate::error::{AttachError, Error, Result};

/// Geometry negotiated with the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGeometry {
    pub size_bytes: u64,
    pub block_size: u64,
    pub block_count: u64,
    pub timeout: Option<Duration>,
}

impl DeviceGeometry {
    fn from_config(config: &DeviceConfig) -> Self {
        Self {
            size_bytes: config.size_bytes,
            block_size: config.block_size,
            block_count: config.block_count(),
            timeout: config.timeout(),
        }
    }
}

/// A device bound to a running dispatcher.
pub struct AttachedDevice {
    path: PathBuf,
    geometry: DeviceGeometry,
    driver: thread::JoinHandle<()>,
    dispatcher: JoinHandle<std::result::Result<SessionReport, NbdError>>,
}

impl AttachedDevice {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    /// Ask the kernel to disconnect the device. See [`detach`].
    pub fn detach(&self) -> bool {
        detach(&self.path)
    }

    /// Wait for the session to end and the device to be released.
    pub async fn wait(self) -> Result<SessionReport> {
        let report = self.dispatcher.await.map_err(|e| {
            Error::Io(std::io::Error::other(format!("dispatcher task failed: {e}")))
        })?;

        // The dispatcher has dropped its end of the socketpair, so the kernel
        // pump is returning if it has not already.
        let driver = self.driver;
        let joined = tokio::task::spawn_blocking(move || driver.join()).await;
        if !matches!(joined, Ok(Ok(()))) {
            error!(device = %self.path.display(), "device thread panicked");
        }

        Ok(report?)
    }
}

/// Attach the device node named by `config` to `backend`.
///
/// Fails without touching the kernel if the device arguments are invalid, and
/// fails if the node cannot be opened read-write. Control calls other than
/// socket binding and `NBD_DO_IT` are best-effort.
pub async fn attach(
    config: &DeviceConfig,
    dispatch: DispatchConfig,
    backend: Arc<dyn StorageBackend>,
) -> std::result::Result<AttachedDevice, AttachError> {
    config.validate().map_err(AttachError::InvalidArgument)?;
    let device = NbdDevice::open(&config.path).map_err(|source| AttachError::Open {
        path: config.path.clone(),
        source,
    })?;
    attach_with(device, config, dispatch, backend).await
}

/// [`attach`] against an already opened control surface.
pub async fn attach_with<C: KernelControl>(
    control: C,
    config: &DeviceConfig,
    dispatch: DispatchConfig,
    backend: Arc<dyn StorageBackend>,
) -> std::result::Result<AttachedDevice, AttachError> {
    config.validate().map_err(AttachError::InvalidArgument)?;
    let path = config.path.clone();
    let geometry = DeviceGeometry::from_config(config);

    let (kernel_end, engine_end) = StdUnixStream::pair().map_err(AttachError::Transport)?;

    negotiate(&control, &path, &geometry);
    let flags = backend.transmission_flags();

    engine_end
        .set_nonblocking(true)
        .map_err(AttachError::Transport)?;
    let engine_end = UnixStream::from_std(engine_end).map_err(AttachError::Transport)?;

    let control = Arc::new(control);
    let (bound_tx, bound_rx) = oneshot::channel();

    // Kernel side first: the dispatcher is useless until the socket is bound.
    let driver = thread::Builder::new()
        .name(driver_thread_name(&path))
        .spawn({
            let control = control.clone();
            let path = path.clone();
            move || drive(control, kernel_end, flags, &path, bound_tx)
        })
        .map_err(AttachError::Spawn)?;

    let dispatcher = Dispatcher::new(backend, dispatch);
    let dispatcher = tokio::spawn(async move { dispatcher.run(engine_end).await });

    // The sender is dropped unsent if binding failed.
    if bound_rx.await.is_ok() {
        rescan(control, &path).await;
    }

    info!(
        device = %path.display(),
        size_bytes = geometry.size_bytes,
        block_size = geometry.block_size,
        blocks = geometry.block_count,
        flags,
        "NBD device attached"
    );

    Ok(AttachedDevice {
        path,
        geometry,
        driver,
        dispatcher,
    })
}

fn negotiate<C: KernelControl>(control: &C, path: &Path, geometry: &DeviceGeometry) {
    let device = path.display();
    if let Err(e) = control.set_block_size(geometry.block_size) {
        warn!(device = %device, error = %e, "failed to set block size");
    }
    if let Err(e) = control.set_size_blocks(geometry.block_count) {
        warn!(device = %device, error = %e, "failed to set device size");
    }
    if let Some(timeout) = geometry.timeout {
        if let Err(e) = control.set_timeout(timeout.as_secs()) {
            warn!(device = %device, error = %e, "failed to set timeout");
        }
    }
    // A socket left behind by a previous session would keep the device busy.
    if let Err(e) = control.clear_sock() {
        warn!(device = %device, error = %e, "failed to clear stale socket");
    }
}

/// Best-effort partition rescan. Blocks while the kernel reads the partition
/// table through the dispatcher, so it runs off the async workers.
async fn rescan<C: KernelControl>(control: Arc<C>, path: &Path) {
    let target = path.to_path_buf();
    match tokio::task::spawn_blocking(move || control.rescan(&target)).await {
        Ok(Ok(())) => debug!(device = %path.display(), "partition rescan done"),
        Ok(Err(e)) => warn!(device = %path.display(), error = %e, "failed to rescan device"),
        Err(e) => warn!(device = %path.display(), error = %e, "rescan task failed"),
    }
}

/// Body of the kernel-bound thread. Tears down exactly once on every path.
fn drive<C: KernelControl>(
    control: Arc<C>,
    socket: StdUnixStream,
    flags: u16,
    path: &Path,
    bound: oneshot::Sender<()>,
) {
    let device = path.display();

    match control.set_sock(socket.as_fd()) {
        Ok(()) => {
            if let Err(e) = control.set_flags(flags) {
                warn!(device = %device, flags, error = %e, "failed to set flags");
            }
            let _ = bound.send(());
            debug!(device = %device, "entering NBD_DO_IT");
            match control.do_it() {
                Ok(()) => debug!(device = %device, "NBD_DO_IT returned"),
                Err(e) => warn!(device = %device, error = %e, "NBD_DO_IT failed"),
            }
        }
        Err(e) => error!(device = %device, error = %e, "failed to bind socket to device"),
    }

    if let Err(e) = control.clear_queue() {
        warn!(device = %device, error = %e, "failed to clear queue");
    }
    if let Err(e) = control.clear_sock() {
        warn!(device = %device, error = %e, "failed to clear socket");
    }
    drop(socket);
    drop(control);
    debug!(device = %device, "device released");
}

fn driver_thread_name(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "device".to_string());
    format!("ubd-{name}")
}

/// Disconnect the device at `path`.
///
/// Issues `NBD_DISCONNECT` unconditionally and reports whether the kernel
/// accepted it. The dispatcher is not touched; it ends when the kernel sends
/// `NBD_CMD_DISC` or closes the socket.
pub fn detach(path: impl AsRef<Path>) -> bool {
    let path = path.as_ref();
    match disconnect_device(path) {
        Ok(()) => {
            info!(device = %path.display(), "NBD device detached");
            true
        }
        Err(e) => {
            warn!(device = %path.display(), error = %e, "failed to detach NBD device");
            false
        }
    }
}

/// [`detach`] through an already opened control surface.
pub fn detach_with<C: KernelControl>(control: &C, path: impl AsRef<Path>) -> bool {
    let path = path.as_ref();
    match control.disconnect() {
        Ok(()) => {
            info!(device = %path.display(), "NBD device detached");
            true
        }
        Err(e) => {
            warn!(device = %path.display(), error = %e, "failed to detach NBD device");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::os::fd::BorrowedFd;
    use std::sync::mpsc;
    use std::sync::{Condvar, Mutex};

    use nbd::{NBD_FLAG_HAS_FLAGS, NBD_FLAG_SEND_FLUSH, NBD_FLAG_SEND_TRIM, NbdClient};

    use super::*;
    use crate::backend::{FileBackend, MemoryBackend};
    use crate::dispatcher::SessionEnd;
    use crate::error::ConfigError;

    /// In-process stand-in for the kernel driver.
    ///
    /// `set_sock` hands a duplicate of the bound socket to the test, which
    /// then plays the kernel's side of the wire. `do_it` blocks until
    /// `disconnect` is called.
    #[derive(Clone, Default)]
    struct FakeKernel {
        state: Arc<FakeState>,
    }

    #[derive(Default)]
    struct FakeState {
        calls: Mutex<Vec<String>>,
        socket_tx: Mutex<Option<mpsc::Sender<StdUnixStream>>>,
        disconnected: Mutex<bool>,
        released: Condvar,
        fail_set_sock: bool,
    }

    impl FakeKernel {
        fn new() -> (Self, mpsc::Receiver<StdUnixStream>) {
            Self::with_state(FakeState::default())
        }

        fn with_state(state: FakeState) -> (Self, mpsc::Receiver<StdUnixStream>) {
            let (tx, rx) = mpsc::channel();
            *state.socket_tx.lock().unwrap() = Some(tx);
            (
                Self {
                    state: Arc::new(state),
                },
                rx,
            )
        }

        fn record(&self, call: String) {
            self.state.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.state.calls.lock().unwrap().clone()
        }
    }

    impl KernelControl for FakeKernel {
        fn set_block_size(&self, bytes: u64) -> io::Result<()> {
            self.record(format!("set_block_size({bytes})"));
            Ok(())
        }

        fn set_size_blocks(&self, blocks: u64) -> io::Result<()> {
            self.record(format!("set_size_blocks({blocks})"));
            Ok(())
        }

        fn set_timeout(&self, secs: u64) -> io::Result<()> {
            self.record(format!("set_timeout({secs})"));
            // Best-effort calls may fail without ending the attach.
            Err(io::Error::from_raw_os_error(25))
        }

        fn set_flags(&self, flags: u16) -> io::Result<()> {
            self.record(format!("set_flags({flags})"));
            Ok(())
        }

        fn set_sock(&self, sock: BorrowedFd<'_>) -> io::Result<()> {
            self.record("set_sock".to_string());
            if self.state.fail_set_sock {
                return Err(io::Error::from_raw_os_error(16));
            }
            let stream = StdUnixStream::from(sock.try_clone_to_owned()?);
            if let Some(tx) = self.state.socket_tx.lock().unwrap().take() {
                let _ = tx.send(stream);
            }
            Ok(())
        }

        fn do_it(&self) -> io::Result<()> {
            self.record("do_it".to_string());
            let mut disconnected = self.state.disconnected.lock().unwrap();
            while !*disconnected {
                disconnected = self.state.released.wait(disconnected).unwrap();
            }
            Ok(())
        }

        fn clear_queue(&self) -> io::Result<()> {
            self.record("clear_queue".to_string());
            Ok(())
        }

        fn clear_sock(&self) -> io::Result<()> {
            self.record("clear_sock".to_string());
            Ok(())
        }

        fn disconnect(&self) -> io::Result<()> {
            self.record("disconnect".to_string());
            *self.state.disconnected.lock().unwrap() = true;
            self.state.released.notify_all();
            Ok(())
        }

        fn rescan(&self, path: &Path) -> io::Result<()> {
            self.record(format!("rescan({})", path.display()));
            Err(io::Error::from_raw_os_error(2))
        }
    }

    fn device_config(size_bytes: u64) -> DeviceConfig {
        DeviceConfig {
            path: PathBuf::from("/dev/nbd-test"),
            size_bytes,
            block_size: 4096,
            timeout_secs: None,
        }
    }

    /// Wait until the driver thread has entered `do_it`.
    async fn parked(kernel: &FakeKernel) {
        for _ in 0..500 {
            if kernel.calls().iter().any(|c| c == "do_it") {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("driver never entered do_it");
    }

    fn kernel_client(rx: &mpsc::Receiver<StdUnixStream>) -> NbdClient<UnixStream> {
        let socket = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("socket never bound");
        socket.set_nonblocking(true).unwrap();
        NbdClient::new(UnixStream::from_std(socket).unwrap())
    }

    #[tokio::test]
    async fn write_then_read_through_attached_device() {
        let (kernel, rx) = FakeKernel::new();
        let backend = Arc::new(MemoryBackend::new(4096 * 100));
        let device = attach_with(
            kernel.clone(),
            &device_config(4096 * 100),
            DispatchConfig::default(),
            backend.clone(),
        )
        .await
        .unwrap();
        assert_eq!(device.geometry().block_count, 100);

        let mut client = kernel_client(&rx);
        client.write(0, &[0xAA; 512]).await.unwrap();
        assert_eq!(client.read(0, 512).await.unwrap().as_ref(), &[0xAA; 512]);

        // Kernel lets go: its duplicate closes, then DO_IT returns and the
        // driver drops the original.
        drop(client);
        assert!(detach_with(&kernel, "/dev/nbd-test"));

        let report = device.wait().await.unwrap();
        assert_eq!(report.end, SessionEnd::Eof);
        assert_eq!(report.stats.reads, 1);
        assert_eq!(report.stats.writes, 1);
        assert_eq!(&backend.snapshot().await[..512], &[0xAA; 512]);
    }

    #[tokio::test]
    async fn negotiation_and_teardown_run_in_order() {
        let (kernel, rx) = FakeKernel::new();
        let mut config = device_config(4096 * 10 + 100);
        config.timeout_secs = Some(30);
        let device = attach_with(
            kernel.clone(),
            &config,
            DispatchConfig::default(),
            Arc::new(MemoryBackend::new(4096 * 10)),
        )
        .await
        .unwrap();

        let mut client = kernel_client(&rx);
        parked(&kernel).await;
        client.disconnect().await.unwrap();
        kernel.disconnect().unwrap();

        let report = device.wait().await.unwrap();
        assert_eq!(report.end, SessionEnd::Disconnect);

        // The rescan races the driver thread entering do_it, but always
        // follows set_flags.
        let mut calls = kernel.calls();
        let rescan = calls
            .iter()
            .position(|c| c == "rescan(/dev/nbd-test)")
            .unwrap();
        let set_flags = calls.iter().position(|c| c.starts_with("set_flags")).unwrap();
        assert!(rescan > set_flags);
        calls.remove(rescan);

        let flags = NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH | NBD_FLAG_SEND_TRIM;
        assert_eq!(
            calls,
            vec![
                "set_block_size(4096)".to_string(),
                "set_size_blocks(10)".to_string(),
                "set_timeout(30)".to_string(),
                "clear_sock".to_string(),
                "set_sock".to_string(),
                format!("set_flags({flags})"),
                "do_it".to_string(),
                "disconnect".to_string(),
                "clear_queue".to_string(),
                "clear_sock".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn flags_follow_backend_capabilities() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileBackend::open(dir.path().join("disk.img"), 8192).unwrap());

        let (kernel, rx) = FakeKernel::new();
        let device = attach_with(
            kernel.clone(),
            &device_config(8192),
            DispatchConfig::default(),
            backend,
        )
        .await
        .unwrap();

        let mut client = kernel_client(&rx);
        // Trim is not advertised, but a kernel that sends it still gets success.
        client.trim(0, 4096).await.unwrap();
        drop(client);
        kernel.disconnect().unwrap();
        device.wait().await.unwrap();

        let flags = NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH;
        assert!(kernel.calls().contains(&format!("set_flags({flags})")));
    }

    #[tokio::test]
    async fn failed_socket_bind_still_tears_down() {
        let (kernel, _rx) = FakeKernel::with_state(FakeState {
            fail_set_sock: true,
            ..Default::default()
        });
        let device = attach_with(
            kernel.clone(),
            &device_config(4096),
            DispatchConfig::default(),
            Arc::new(MemoryBackend::new(4096)),
        )
        .await
        .unwrap();

        // The driver drops its end straight away, so the dispatcher sees EOF.
        let report = device.wait().await.unwrap();
        assert_eq!(report.end, SessionEnd::Eof);
        assert_eq!(report.stats.requests, 0);

        let calls = kernel.calls();
        assert!(!calls.contains(&"do_it".to_string()));
        assert!(!calls.iter().any(|c| c.starts_with("rescan")));
        assert_eq!(calls[calls.len() - 2..], ["clear_queue", "clear_sock"]);
    }

    #[tokio::test]
    async fn invalid_arguments_are_rejected_before_negotiation() {
        let (kernel, _rx) = FakeKernel::new();
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new(4096));

        let mut config = device_config(0);
        let err = attach_with(kernel.clone(), &config, DispatchConfig::default(), backend.clone())
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            AttachError::InvalidArgument(ConfigError::InvalidValue {
                field: "device.size_bytes",
                ..
            })
        ));

        config = device_config(4096);
        config.path = PathBuf::new();
        let err = attach_with(kernel.clone(), &config, DispatchConfig::default(), backend.clone())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AttachError::InvalidArgument(_)));

        config = device_config(4096);
        config.block_size = 1000;
        let err = attach_with(kernel.clone(), &config, DispatchConfig::default(), backend)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AttachError::InvalidArgument(_)));

        assert!(kernel.calls().is_empty());
    }

    #[tokio::test]
    async fn attach_missing_node_is_open_error() {
        let mut config = device_config(4096);
        config.path = PathBuf::from("/nonexistent/nbd0");
        let err = attach(
            &config,
            DispatchConfig::default(),
            Arc::new(MemoryBackend::new(4096)),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, AttachError::Open { ref path, .. } if path == &config.path));
    }

    #[test]
    fn detach_missing_node_fails_twice() {
        assert!(!detach("/nonexistent/nbd0"));
        assert!(!detach("/nonexistent/nbd0"));
    }

    #[test]
    fn detach_with_is_repeatable() {
        let (kernel, _rx) = FakeKernel::new();
        assert!(detach_with(&kernel, "/dev/nbd-test"));
        assert!(detach_with(&kernel, "/dev/nbd-test"));
        assert_eq!(kernel.calls(), vec!["disconnect", "disconnect"]);
    }

    #[test]
    fn thread_name_uses_device_name() {
        assert_eq!(driver_thread_name(Path::new("/dev/nbd3")), "ubd-nbd3");
        assert_eq!(driver_thread_name(Path::new("/")), "ubd-device");
    }
}
