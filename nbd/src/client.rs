//! Kernel-side NBD transmission client.
//!
//! Speaks the transmission phase the way the Linux `nbd` driver does after
//! `NBD_SET_SOCK`: no handshake, one request at a time, handles chosen by the
//! client. Used to drive servers in tests and simulations without a kernel.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::*;

/// NBD transmission client over any async stream.
pub struct NbdClient<S> {
    stream: S,
    next_handle: u64,
    read_error_payload: ReadErrorPayload,
}

impl<S> NbdClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a stream that is already in the transmission phase.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            next_handle: 0,
            read_error_payload: ReadErrorPayload::default(),
        }
    }

    /// Set how the server frames errored READ replies.
    pub fn with_read_error_payload(mut self, policy: ReadErrorPayload) -> Self {
        self.read_error_payload = policy;
        self
    }

    fn next_handle(&mut self) -> Handle {
        let handle = Handle::from(self.next_handle);
        self.next_handle += 1;
        handle
    }

    /// Write a raw request header, bypassing command encoding.
    pub async fn send_request(&mut self, request: &NbdRequest) -> Result<(), NbdError> {
        self.stream.write_all(&request.to_bytes()).await?;
        Ok(())
    }

    /// Read one reply header.
    pub async fn read_reply(&mut self) -> Result<NbdReply, NbdError> {
        let mut buf = [0u8; NbdReply::SIZE_BYTES];
        self.stream.read_exact(&mut buf).await?;
        NbdReply::from_bytes(&buf)
    }

    async fn request(
        &mut self,
        command: NbdCommand,
        offset: u64,
        length: u32,
    ) -> Result<Handle, NbdError> {
        let handle = self.next_handle();
        self.send_request(&NbdRequest::new(command, handle, offset, length))
            .await?;
        Ok(handle)
    }

    async fn expect_reply(&mut self, handle: Handle) -> Result<NbdReply, NbdError> {
        let reply = self.read_reply().await?;
        if reply.handle != handle {
            return Err(NbdError::HandleMismatch {
                expected: handle,
                actual: reply.handle,
            });
        }
        Ok(reply)
    }

    async fn execute(
        &mut self,
        command: NbdCommand,
        offset: u64,
        length: u32,
    ) -> Result<(), NbdError> {
        let handle = self.request(command, offset, length).await?;
        let reply = self.expect_reply(handle).await?;
        if reply.error != NBD_OK {
            return Err(NbdError::ServerError { code: reply.error });
        }
        Ok(())
    }

    /// Read data from the device.
    pub async fn read(&mut self, offset: u64, length: u32) -> Result<Bytes, NbdError> {
        let handle = self.request(NbdCommand::Read, offset, length).await?;
        let reply = self.expect_reply(handle).await?;

        let with_payload =
            reply.error == NBD_OK || self.read_error_payload == ReadErrorPayload::ZeroFill;
        let mut data = BytesMut::zeroed(if with_payload { length as usize } else { 0 });
        self.stream.read_exact(&mut data).await.map_err(|e| {
            NbdError::Io(io::Error::other(format!(
                "failed to read {} bytes of response data at offset {}: {}",
                length, offset, e
            )))
        })?;

        if reply.error != NBD_OK {
            return Err(NbdError::ServerError { code: reply.error });
        }
        Ok(data.freeze())
    }

    /// Write data to the device.
    pub async fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), NbdError> {
        let handle = self
            .request(NbdCommand::Write, offset, data.len() as u32)
            .await?;
        self.stream.write_all(data).await?;

        let reply = self.expect_reply(handle).await?;
        if reply.error != NBD_OK {
            return Err(NbdError::ServerError { code: reply.error });
        }
        Ok(())
    }

    /// Flush pending writes.
    pub async fn flush(&mut self) -> Result<(), NbdError> {
        self.execute(NbdCommand::Flush, 0, 0).await
    }

    /// Trim a range (hint that data is no longer needed).
    pub async fn trim(&mut self, offset: u64, length: u32) -> Result<(), NbdError> {
        self.execute(NbdCommand::Trim, offset, length).await
    }

    /// Send `NBD_CMD_DISC`. The server sends no reply.
    pub async fn disconnect(&mut self) -> Result<(), NbdError> {
        self.request(NbdCommand::Disconnect, 0, 0).await?;
        Ok(())
    }

    /// Give back the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn read_rejects_mismatched_handle() {
        let (client_end, mut server_end) = duplex(1024);
        let mut client = NbdClient::new(client_end);

        let server = tokio::spawn(async move {
            let mut req = [0u8; NbdRequest::SIZE_BYTES];
            server_end.read_exact(&mut req).await.unwrap();
            let reply = NbdReply::ok(Handle::from(999));
            server_end.write_all(&reply.to_bytes()).await.unwrap();
            server_end
        });

        let err = client.read(0, 0).await.unwrap_err();
        assert!(matches!(err, NbdError::HandleMismatch { .. }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn handles_are_sequential() {
        let (client_end, mut server_end) = duplex(1024);
        let mut client = NbdClient::new(client_end);
        client.disconnect().await.unwrap();
        client.disconnect().await.unwrap();

        let mut buf = [0u8; NbdRequest::SIZE_BYTES];
        server_end.read_exact(&mut buf).await.unwrap();
        let first = NbdRequest::from_bytes(&buf, NBD_MAX_PAYLOAD_SIZE).unwrap();
        server_end.read_exact(&mut buf).await.unwrap();
        let second = NbdRequest::from_bytes(&buf, NBD_MAX_PAYLOAD_SIZE).unwrap();
        assert_eq!(first.handle, Handle::from(0));
        assert_eq!(second.handle, Handle::from(1));
        assert_eq!(second.command(), Some(NbdCommand::Disconnect));
    }
}
