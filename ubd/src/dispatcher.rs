//! NBD request dispatcher.
//!
//! Drains request frames from the kernel, one at a time and in arrival order,
//! calls the matching [`StorageBackend`] operation and writes the reply. A
//! session moves through three states:
//!
//! - awaiting a 28-byte request header,
//! - dispatching it to the backend (for WRITE, after pulling the payload),
//! - replying, then back to awaiting.
//!
//! Clean EOF at a frame boundary or `NBD_CMD_DISC` ends the session normally.
//! Any transport failure or malformed header ends it with an error. Either way
//! the backend's `cleanup` runs exactly once before [`Dispatcher::run`]
//! returns.

use std::sync::Arc;

use bytes::BytesMut;
use nbd::{NbdCommand, NbdError, NbdReply, NbdRequest, ReadErrorPayload};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, trace, warn};

use crate::backend::StorageBackend;
use crate::config::DispatchConfig;
use crate::transport::Transport;

/// Why a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The kernel closed its end of the socket between frames.
    Eof,
    /// The kernel sent `NBD_CMD_DISC`.
    Disconnect,
}

/// Per-session request counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub requests: u64,
    pub reads: u64,
    pub writes: u64,
    pub flushes: u64,
    pub trims: u64,
    /// Requests whose command we do not serve. They get no reply.
    pub ignored: u64,
    /// Replies sent with a non-zero error code.
    pub errors: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Outcome of a session that ended without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub end: SessionEnd,
    pub stats: SessionStats,
}

enum Step {
    Continue,
    End(SessionEnd),
}

/// Serves NBD requests from one transport against one backend.
#[derive(Clone)]
pub struct Dispatcher {
    backend: Arc<dyn StorageBackend>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(backend: Arc<dyn StorageBackend>, config: DispatchConfig) -> Self {
        Self { backend, config }
    }

    /// Serve requests until the session ends.
    ///
    /// The stream is closed before returning, whatever the outcome.
    pub async fn run<S>(&self, stream: S) -> Result<SessionReport, NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut transport = Transport::new(stream);
        let mut stats = SessionStats::default();

        let result = self.serve(&mut transport, &mut stats).await;

        // Disconnect handling has already run cleanup.
        if !matches!(result, Ok(SessionEnd::Disconnect)) {
            self.backend.cleanup().await;
        }
        if let Err(e) = transport.close().await {
            debug!(error = %e, "transport close failed");
        }

        match result {
            Ok(end) => {
                info!(
                    end = ?end,
                    requests = stats.requests,
                    errors = stats.errors,
                    bytes_read = stats.bytes_read,
                    bytes_written = stats.bytes_written,
                    "NBD session ended"
                );
                Ok(SessionReport { end, stats })
            }
            Err(e) => {
                error!(error = %e, requests = stats.requests, "NBD session failed");
                Err(e)
            }
        }
    }

    async fn serve<S>(
        &self,
        transport: &mut Transport<S>,
        stats: &mut SessionStats,
    ) -> Result<SessionEnd, NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut req_buf = [0u8; NbdRequest::SIZE_BYTES];

        loop {
            if !transport.read_exact_or_eof(&mut req_buf).await? {
                return Ok(SessionEnd::Eof);
            }
            let req = NbdRequest::from_bytes(&req_buf, self.config.max_payload_bytes)?;
            stats.requests += 1;

            trace!(
                kind = req.kind,
                flags = req.flags,
                handle = %req.handle,
                offset = req.offset,
                length = req.length,
                "NBD request"
            );

            if let Step::End(end) = self.dispatch(transport, &req, stats).await? {
                return Ok(end);
            }
        }
    }

    async fn dispatch<S>(
        &self,
        transport: &mut Transport<S>,
        req: &NbdRequest,
        stats: &mut SessionStats,
    ) -> Result<Step, NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match req.command() {
            Some(NbdCommand::Read) => {
                stats.reads += 1;
                let len = req.length as usize;
                let mut data = BytesMut::zeroed(len);
                let error = match self.backend.read(&mut data, req.offset).await {
                    Ok(_) => 0,
                    Err(e) => {
                        warn!(error = %e, offset = req.offset, length = len, "read error");
                        e.code()
                    }
                };

                let reply = NbdReply::error(req.handle, error);
                transport.write_exact(&reply.to_bytes()).await?;
                if error == 0 {
                    transport.write_exact(&data).await?;
                    stats.bytes_read += len as u64;
                } else {
                    stats.errors += 1;
                    if self.config.read_error_payload == ReadErrorPayload::ZeroFill {
                        // Never hand the kernel whatever the backend left behind.
                        data.fill(0);
                        transport.write_exact(&data).await?;
                    }
                }
                transport.flush().await?;
            }
            Some(NbdCommand::Write) => {
                stats.writes += 1;
                let len = req.length as usize;
                let mut data = BytesMut::zeroed(len);
                transport.read_exact(&mut data).await?;

                let error = match self.backend.write(data.freeze(), req.offset).await {
                    Ok(()) => {
                        stats.bytes_written += len as u64;
                        0
                    }
                    Err(e) => {
                        warn!(error = %e, offset = req.offset, length = len, "write error");
                        e.code()
                    }
                };
                self.reply(transport, NbdReply::error(req.handle, error), stats)
                    .await?;
            }
            Some(NbdCommand::Flush) => {
                stats.flushes += 1;
                let error = if self.backend.supports_flush() {
                    match self.backend.flush().await {
                        Ok(()) => 0,
                        Err(e) => {
                            warn!(error = %e, "flush error");
                            e.code()
                        }
                    }
                } else {
                    0
                };
                self.reply(transport, NbdReply::error(req.handle, error), stats)
                    .await?;
            }
            Some(NbdCommand::Trim) => {
                stats.trims += 1;
                let error = if self.backend.supports_trim() {
                    match self.backend.trim(req.offset, req.length as u64).await {
                        Ok(()) => 0,
                        Err(e) => {
                            warn!(error = %e, offset = req.offset, length = req.length, "trim error");
                            e.code()
                        }
                    }
                } else {
                    0
                };
                self.reply(transport, NbdReply::error(req.handle, error), stats)
                    .await?;
            }
            Some(NbdCommand::Disconnect) => {
                debug!("NBD disconnect requested");
                self.backend.disconnect().await;
                self.backend.cleanup().await;
                return Ok(Step::End(SessionEnd::Disconnect));
            }
            // Never advertised to the kernel, so treated like any unknown kind.
            Some(NbdCommand::Cache | NbdCommand::WriteZeroes) | None => {
                stats.ignored += 1;
                warn!(kind = req.kind, handle = %req.handle, "ignoring unsupported NBD command");
            }
        }
        Ok(Step::Continue)
    }

    async fn reply<S>(
        &self,
        transport: &mut Transport<S>,
        reply: NbdReply,
        stats: &mut SessionStats,
    ) -> Result<(), NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if reply.error != 0 {
            stats.errors += 1;
        }
        transport.write_exact(&reply.to_bytes()).await?;
        transport.flush().await?;
        Ok(())
    }
}
