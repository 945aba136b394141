//! ubd - serve a block device from user space over the kernel NBD driver.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ubd::{BackendKind, Config, FileBackend, MemoryBackend, StorageBackend};

#[derive(Parser)]
#[command(name = "ubd", about = "User-space block device over NBD")]
struct Cli {
    /// Verbosity (-v info, -vv debug, -vvv trace). RUST_LOG overrides.
    #[arg(short, action = clap::ArgAction::Count, global = true)]
    v: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Attach a device node and serve it until it is detached.
    Attach {
        /// Path to config file. If omitted, uses defaults (1GB in-memory device).
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Device node. Overrides config file if specified.
        #[arg(long)]
        device: Option<PathBuf>,

        /// Device size in bytes.
        #[arg(long)]
        size_bytes: Option<u64>,

        /// Backend to serve.
        #[arg(long, value_enum)]
        backend: Option<BackendArg>,

        /// Backing file for the file backend.
        #[arg(long)]
        file: Option<PathBuf>,

        /// Kernel request timeout in seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Disconnect a device node.
    Detach {
        #[arg(long)]
        device: PathBuf,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum BackendArg {
    Memory,
    File,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Memory => BackendKind::Memory,
            BackendArg::File => BackendKind::File,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.v {
        0 => "ubd=warn,nbd=warn,warn".to_string(),
        1 => "ubd=info,nbd=info,warn".to_string(),
        2 => "ubd=debug,nbd=debug,warn".to_string(),
        _ => "ubd=trace,nbd=trace,warn".to_string(),
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match cli.command {
        Command::Attach {
            config,
            device,
            size_bytes,
            backend,
            file,
            timeout_secs,
        } => {
            let mut config = match config {
                Some(ref path) => Config::load(path)
                    .with_context(|| format!("Failed to load config: {}", path.display()))?,
                None => Config::default(),
            };

            // CLI overrides
            if let Some(device) = device {
                config.device.path = device;
            }
            if let Some(size_bytes) = size_bytes {
                config.device.size_bytes = size_bytes;
            }
            if let Some(backend) = backend {
                config.backend.kind = backend.into();
            }
            if let Some(file) = file {
                config.backend.path = Some(file);
            }
            if let Some(timeout_secs) = timeout_secs {
                config.device.timeout_secs = Some(timeout_secs);
            }
            config.validate().context("Invalid configuration")?;

            run_attach(config).await
        }
        Command::Detach { device } => {
            if !ubd::detach(&device) {
                bail!("Failed to detach {}", device.display());
            }
            Ok(())
        }
    }
}

async fn run_attach(config: Config) -> Result<()> {
    let backend: Arc<dyn StorageBackend> = match config.backend.kind {
        BackendKind::Memory => Arc::new(MemoryBackend::new(config.device.size_bytes)),
        BackendKind::File => {
            let path = config
                .backend
                .path
                .as_ref()
                .context("backend.path is required for the file backend")?;
            Arc::new(
                FileBackend::open(path, config.device.size_bytes)
                    .with_context(|| format!("Failed to open backing file: {}", path.display()))?,
            )
        }
    };

    let device = ubd::attach(&config.device, config.dispatch, backend)
        .await
        .with_context(|| format!("Failed to attach {}", config.device.path.display()))?;
    let path = device.path().to_path_buf();

    info!(
        device = %path.display(),
        size_bytes = device.geometry().size_bytes,
        backend = ?config.backend.kind,
        "ubd started"
    );

    let session = device.wait();
    tokio::pin!(session);

    let report = tokio::select! {
        report = &mut session => report,
        () = shutdown_signal() => {
            if !ubd::detach(&path) {
                warn!(device = %path.display(), "detach on shutdown failed");
            }
            session.await
        }
    }
    .context("NBD session failed")?;

    info!(
        device = %path.display(),
        end = ?report.end,
        requests = report.stats.requests,
        "ubd stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c() => {}
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to register SIGTERM handler");
            ctrl_c().await;
        }
    }
}

/// Resolves on SIGINT. Never resolves if the handler cannot be installed.
async fn ctrl_c() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received SIGINT"),
        Err(e) => {
            warn!(error = %e, "Failed to register SIGINT handler");
            std::future::pending::<()>().await;
        }
    }
}
