//! Linux kernel NBD device control.
//!
//! The kernel side of NBD is driven entirely through ioctls on the device node
//! (`/dev/nbdN`). A user-space server hands the kernel one end of a connected
//! socket with `NBD_SET_SOCK` and then parks a thread in `NBD_DO_IT`, which
//! runs the kernel's request pump until the device is disconnected.
//!
//! [`KernelControl`] names that vocabulary so callers can be exercised against
//! something other than a real device node.
//!
//! # Example
//!
//! ```ignore
//! use nbd::{KernelControl, NbdDevice};
//!
//! let device = NbdDevice::open("/dev/nbd0")?;
//! device.set_block_size(4096)?;
//! device.set_size_blocks(256)?;
//! device.set_sock(socket.as_fd())?;
//! device.do_it()?; // blocks until disconnect
//! ```

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::{Path, PathBuf};

use nix::libc;
use tracing::debug;

// NBD ioctl numbers from linux/nbd.h (architecture-independent)
#[allow(dead_code)]
mod ioctl {
    use nix::libc;
    pub const NBD_SET_SOCK: libc::c_ulong = 0xab00;
    pub const NBD_SET_BLKSIZE: libc::c_ulong = 0xab01;
    pub const NBD_SET_SIZE: libc::c_ulong = 0xab02;
    pub const NBD_DO_IT: libc::c_ulong = 0xab03;
    pub const NBD_CLEAR_SOCK: libc::c_ulong = 0xab04;
    pub const NBD_CLEAR_QUE: libc::c_ulong = 0xab05;
    pub const NBD_SET_SIZE_BLOCKS: libc::c_ulong = 0xab07;
    pub const NBD_DISCONNECT: libc::c_ulong = 0xab08;
    pub const NBD_SET_TIMEOUT: libc::c_ulong = 0xab09;
    pub const NBD_SET_FLAGS: libc::c_ulong = 0xab0a;
}
use ioctl::*;

/// The kernel NBD driver's control vocabulary.
///
/// Every call except [`rescan`](Self::rescan) maps to one ioctl on the device
/// node. Implementations are shared with the thread that runs the blocking
/// [`do_it`](Self::do_it) call and the teardown that follows it.
pub trait KernelControl: Send + Sync + 'static {
    /// `NBD_SET_BLKSIZE`: logical block size in bytes.
    fn set_block_size(&self, bytes: u64) -> io::Result<()>;

    /// `NBD_SET_SIZE_BLOCKS`: device size in blocks of the configured size.
    fn set_size_blocks(&self, blocks: u64) -> io::Result<()>;

    /// `NBD_SET_TIMEOUT`: per-request timeout in seconds.
    fn set_timeout(&self, secs: u64) -> io::Result<()>;

    /// `NBD_SET_FLAGS`: transmission flags (`NBD_FLAG_*`).
    fn set_flags(&self, flags: u16) -> io::Result<()>;

    /// `NBD_SET_SOCK`: bind a connected stream socket to the device.
    fn set_sock(&self, sock: BorrowedFd<'_>) -> io::Result<()>;

    /// `NBD_DO_IT`: run the kernel request pump. Blocks until the device is
    /// disconnected or the socket fails.
    fn do_it(&self) -> io::Result<()>;

    /// `NBD_CLEAR_QUE`: fail any requests still queued on the device.
    fn clear_queue(&self) -> io::Result<()>;

    /// `NBD_CLEAR_SOCK`: release the bound socket.
    fn clear_sock(&self) -> io::Result<()>;

    /// `NBD_DISCONNECT`: ask the kernel to send `NBD_CMD_DISC` and stop.
    fn disconnect(&self) -> io::Result<()>;

    /// Open and close the node read-only once the socket is bound, so the
    /// kernel rescans partitions and udev sees the new device.
    fn rescan(&self, path: &Path) -> io::Result<()> {
        File::open(path).map(drop)
    }
}

/// An open NBD device node.
///
/// The descriptor is closed when the value is dropped.
#[derive(Debug)]
pub struct NbdDevice {
    path: PathBuf,
    file: File,
}

impl NbdDevice {
    /// Open the device node read-write, as needed to configure and run it.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Open the device node write-only, which is enough to disconnect it.
    pub fn open_write_only(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().write(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Get the device path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ioctl(
        &self,
        name: &'static str,
        request: libc::c_ulong,
        arg: libc::c_ulong,
    ) -> io::Result<()> {
        // SAFETY: the NBD ioctls used here take an integer argument (or none),
        // never a pointer, and the descriptor is owned by `self.file`.
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), request as _, arg) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            debug!(device = %self.path.display(), ioctl = name, error = %err, "ioctl failed");
            return Err(err);
        }
        Ok(())
    }
}

impl AsFd for NbdDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl KernelControl for NbdDevice {
    fn set_block_size(&self, bytes: u64) -> io::Result<()> {
        self.ioctl("NBD_SET_BLKSIZE", NBD_SET_BLKSIZE, bytes as libc::c_ulong)
    }

    fn set_size_blocks(&self, blocks: u64) -> io::Result<()> {
        self.ioctl("NBD_SET_SIZE_BLOCKS", NBD_SET_SIZE_BLOCKS, blocks as libc::c_ulong)
    }

    fn set_timeout(&self, secs: u64) -> io::Result<()> {
        self.ioctl("NBD_SET_TIMEOUT", NBD_SET_TIMEOUT, secs as libc::c_ulong)
    }

    fn set_flags(&self, flags: u16) -> io::Result<()> {
        self.ioctl("NBD_SET_FLAGS", NBD_SET_FLAGS, flags as libc::c_ulong)
    }

    fn set_sock(&self, sock: BorrowedFd<'_>) -> io::Result<()> {
        self.ioctl("NBD_SET_SOCK", NBD_SET_SOCK, sock.as_raw_fd() as libc::c_ulong)
    }

    fn do_it(&self) -> io::Result<()> {
        self.ioctl("NBD_DO_IT", NBD_DO_IT, 0)
    }

    fn clear_queue(&self) -> io::Result<()> {
        self.ioctl("NBD_CLEAR_QUE", NBD_CLEAR_QUE, 0)
    }

    fn clear_sock(&self) -> io::Result<()> {
        self.ioctl("NBD_CLEAR_SOCK", NBD_CLEAR_SOCK, 0)
    }

    fn disconnect(&self) -> io::Result<()> {
        self.ioctl("NBD_DISCONNECT", NBD_DISCONNECT, 0)
    }
}

/// Disconnect an NBD device by path.
///
/// Opens the node write-only and issues `NBD_DISCONNECT` unconditionally. The
/// kernel then sends `NBD_CMD_DISC` on the bound socket and `NBD_DO_IT`
/// returns on the thread running it.
pub fn disconnect_device(device_path: impl AsRef<Path>) -> io::Result<()> {
    NbdDevice::open_write_only(device_path)?.disconnect()
}
