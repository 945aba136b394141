//! NBD transmission-phase constants and frame types.
//!
//! These are the frames the Linux `nbd` driver exchanges with user space once a
//! socket has been bound to a device with `NBD_SET_SOCK`. The kernel performs no
//! option negotiation on that socket, so only the request/reply layout lives here.
//!
//! Based on https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
//! and `include/uapi/linux/nbd.h`.

use std::fmt;
use std::io;

use thiserror::Error;

// Magic values
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
pub const NBD_SIMPLE_REPLY_MAGIC: u32 = 0x67446698;

// Transmission flags
pub const NBD_FLAG_HAS_FLAGS: u16 = 1 << 0;
pub const NBD_FLAG_READ_ONLY: u16 = 1 << 1;
pub const NBD_FLAG_SEND_FLUSH: u16 = 1 << 2;
pub const NBD_FLAG_SEND_FUA: u16 = 1 << 3;
pub const NBD_FLAG_ROTATIONAL: u16 = 1 << 4;
pub const NBD_FLAG_SEND_TRIM: u16 = 1 << 5;
pub const NBD_FLAG_SEND_WRITE_ZEROES: u16 = 1 << 6;

/// Maximum READ/WRITE payload accepted by default (32 MiB).
///
/// Bounds memory allocation for READ/WRITE buffers. TRIM carries no payload
/// and is not bounded by it.
pub const NBD_MAX_PAYLOAD_SIZE: u32 = 32 * 1024 * 1024; // 32 MiB

// Commands
pub const NBD_CMD_READ: u16 = 0;
pub const NBD_CMD_WRITE: u16 = 1;
pub const NBD_CMD_DISCONNECT: u16 = 2;
pub const NBD_CMD_FLUSH: u16 = 3;
pub const NBD_CMD_TRIM: u16 = 4;
pub const NBD_CMD_CACHE: u16 = 5;
pub const NBD_CMD_WRITE_ZEROES: u16 = 6;

pub const NBD_CMD_FLAG_FUA: u16 = 1 << 0;
pub const NBD_CMD_FLAG_NO_HOLE: u16 = 1 << 1;

// Error codes
pub const NBD_OK: u32 = 0;
pub const NBD_EPERM: u32 = 1;
pub const NBD_EIO: u32 = 5;
pub const NBD_ENOMEM: u32 = 12;
pub const NBD_EINVAL: u32 = 22;
pub const NBD_ENOSPC: u32 = 28;
pub const NBD_EOVERFLOW: u32 = 75;
pub const NBD_ESHUTDOWN: u32 = 108;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NbdCommand {
    Read,
    Write,
    Disconnect,
    Flush,
    Trim,
    Cache,
    WriteZeroes,
}

impl NbdCommand {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            NBD_CMD_READ => Some(Self::Read),
            NBD_CMD_WRITE => Some(Self::Write),
            NBD_CMD_DISCONNECT => Some(Self::Disconnect),
            NBD_CMD_FLUSH => Some(Self::Flush),
            NBD_CMD_TRIM => Some(Self::Trim),
            NBD_CMD_CACHE => Some(Self::Cache),
            NBD_CMD_WRITE_ZEROES => Some(Self::WriteZeroes),
            _ => None,
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::Read => NBD_CMD_READ,
            Self::Write => NBD_CMD_WRITE,
            Self::Disconnect => NBD_CMD_DISCONNECT,
            Self::Flush => NBD_CMD_FLUSH,
            Self::Trim => NBD_CMD_TRIM,
            Self::Cache => NBD_CMD_CACHE,
            Self::WriteZeroes => NBD_CMD_WRITE_ZEROES,
        }
    }

    /// Whether `length` bytes of payload travel with the request or its reply.
    pub fn carries_payload(self) -> bool {
        matches!(self, Self::Read | Self::Write)
    }
}

/// What a READ reply carries when the backend reported an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case")
)]
pub enum ReadErrorPayload {
    /// Header followed by `length` zero bytes; framing never depends on the
    /// outcome of the read.
    #[default]
    ZeroFill,
    /// Header only, as the simple-reply rules of the NBD protocol require.
    Omit,
}

/// Opaque request correlation token.
///
/// The kernel picks the value; servers copy it into the reply untouched.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Handle(pub [u8; 8]);

impl From<u64> for Handle {
    fn from(v: u64) -> Self {
        Self(v.to_be_bytes())
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle(0x")?;
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", u64::from_be_bytes(self.0))
    }
}

/// NBD protocol errors.
#[derive(Debug, Error)]
pub enum NbdError {
    #[error("invalid magic: expected 0x{expected:08x}, got 0x{actual:08x}")]
    InvalidMagic { expected: u32, actual: u32 },

    #[error("request too large: {length_bytes} bytes (max: {max_bytes})")]
    RequestTooLarge { length_bytes: u32, max_bytes: u32 },

    #[error("server error: {code}")]
    ServerError { code: u32 },

    #[error("handle mismatch: expected {expected}, got {actual}")]
    HandleMismatch { expected: Handle, actual: Handle },

    #[error("transmission error: {0}")]
    Io(#[from] io::Error),
}

/// NBD request header (28 bytes on wire).
///
/// The 32-bit type field is split into command flags (high half) and the
/// command itself (low half). Unknown commands decode successfully; deciding
/// what to do with them is up to the server loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NbdRequest {
    pub flags: u16,
    pub kind: u16,
    pub handle: Handle,
    pub offset: u64,
    pub length: u32,
}

impl NbdRequest {
    pub const SIZE_BYTES: usize = 28;

    pub fn new(command: NbdCommand, handle: Handle, offset: u64, length: u32) -> Self {
        Self {
            flags: 0,
            kind: command.to_u16(),
            handle,
            offset,
            length,
        }
    }

    /// The decoded command, or `None` if the kind is not one we know.
    pub fn command(&self) -> Option<NbdCommand> {
        NbdCommand::from_u16(self.kind)
    }

    /// Serialize an NBD request to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        buf[4..6].copy_from_slice(&self.flags.to_be_bytes());
        buf[6..8].copy_from_slice(&self.kind.to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle.0);
        buf[16..24].copy_from_slice(&self.offset.to_be_bytes());
        buf[24..28].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Parse and validate an NBD request.
    ///
    /// READ and WRITE lengths are bounded by `max_payload`, since those are the
    /// commands whose length decides a buffer allocation.
    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES], max_payload: u32) -> Result<Self, NbdError> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != NBD_REQUEST_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_REQUEST_MAGIC,
                actual: magic,
            });
        }

        let flags = u16::from_be_bytes([buf[4], buf[5]]);
        let kind = u16::from_be_bytes([buf[6], buf[7]]);
        let mut handle = [0u8; 8];
        handle.copy_from_slice(&buf[8..16]);
        let offset = u64::from_be_bytes([
            buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
        ]);
        let length = u32::from_be_bytes([buf[24], buf[25], buf[26], buf[27]]);

        let carries_payload = NbdCommand::from_u16(kind).is_some_and(NbdCommand::carries_payload);
        if carries_payload && length > max_payload {
            return Err(NbdError::RequestTooLarge {
                length_bytes: length,
                max_bytes: max_payload,
            });
        }

        Ok(Self {
            flags,
            kind,
            handle: Handle(handle),
            offset,
            length,
        })
    }
}

/// NBD simple reply header (16 bytes on wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NbdReply {
    pub error: u32,
    pub handle: Handle,
}

impl NbdReply {
    pub const SIZE_BYTES: usize = 16;

    pub fn ok(handle: Handle) -> Self {
        Self {
            error: NBD_OK,
            handle,
        }
    }

    pub fn error(handle: Handle, error: u32) -> Self {
        Self { error, handle }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&NBD_SIMPLE_REPLY_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.error.to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle.0);
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != NBD_SIMPLE_REPLY_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_SIMPLE_REPLY_MAGIC,
                actual: magic,
            });
        }

        let error = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let mut handle = [0u8; 8];
        handle.copy_from_slice(&buf[8..16]);
        Ok(Self {
            error,
            handle: Handle(handle),
        })
    }
}

const _: () = {
    assert!(NbdRequest::SIZE_BYTES == 28);
    assert!(NbdReply::SIZE_BYTES == 16);
};
