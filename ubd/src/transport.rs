//! Exact-count framing over the dispatcher's socket endpoint.
//!
//! Every read and write transfers the full requested byte count or fails.
//! Running out of input before a frame starts is the kernel closing its end;
//! running out partway through a frame is a desync and reported as
//! `UnexpectedEof`.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// One end of the kernel/dispatcher byte channel.
pub struct Transport<S> {
    stream: S,
    bytes_read: u64,
    bytes_written: u64,
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    /// Fill `buf`, or return `Ok(false)` if the peer closed before sending
    /// anything.
    pub async fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> io::Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]).await {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("connection closed after {filled} of {} bytes", buf.len()),
                    ));
                }
                Ok(n) => {
                    filled += n;
                    self.bytes_read += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Fill `buf` completely. EOF at any point is an error.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.stream.read_exact(buf).await?;
        self.bytes_read += buf.len() as u64;
        Ok(())
    }

    /// Write all of `buf`.
    pub async fn write_exact(&mut self, buf: &[u8]) -> io::Result<()> {
        self.stream.write_all(buf).await?;
        self.bytes_written += buf.len() as u64;
        Ok(())
    }

    /// Push buffered output to the peer.
    pub async fn flush(&mut self) -> io::Result<()> {
        self.stream.flush().await
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Shut down the write side and release the stream.
    pub async fn close(mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn eof_before_frame_is_clean() {
        let (peer, ours) = duplex(64);
        drop(peer);
        let mut transport = Transport::new(ours);
        let mut buf = [0u8; 28];
        assert!(!transport.read_exact_or_eof(&mut buf).await.unwrap());
    }

    #[tokio::test]
    async fn eof_mid_frame_is_error() {
        let (mut peer, ours) = duplex(64);
        peer.write_all(&[1, 2, 3]).await.unwrap();
        drop(peer);
        let mut transport = Transport::new(ours);
        let mut buf = [0u8; 28];
        let err = transport.read_exact_or_eof(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(transport.bytes_read(), 3);
    }

    #[tokio::test]
    async fn short_reads_are_reassembled() {
        // A 4-byte pipe forces the 28-byte frame to arrive in pieces.
        let (mut peer, ours) = duplex(4);
        let frame: Vec<u8> = (0..28).collect();
        let writer = tokio::spawn({
            let frame = frame.clone();
            async move {
                peer.write_all(&frame).await.unwrap();
                peer
            }
        });

        let mut transport = Transport::new(ours);
        let mut buf = [0u8; 28];
        assert!(transport.read_exact_or_eof(&mut buf).await.unwrap());
        assert_eq!(buf.as_slice(), frame.as_slice());
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn write_exact_counts_bytes() {
        let (mut peer, ours) = duplex(1024);
        let mut transport = Transport::new(ours);
        transport.write_exact(&[9; 16]).await.unwrap();
        transport.write_exact(&[8; 512]).await.unwrap();
        transport.flush().await.unwrap();
        assert_eq!(transport.bytes_written(), 528);
        transport.close().await.unwrap();

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), 528);
    }
}
