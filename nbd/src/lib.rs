//! NBD (Network Block Device) transmission protocol and kernel device control.
//!
//! This crate covers the two interfaces a user-space block device server has
//! with the Linux `nbd` driver: the request/reply frames exchanged on the bound
//! socket, and the ioctl vocabulary used to configure and run the device node.
//!
//! Based on https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
//!
//! # Features
//!
//! - `serde` - Derive `Serialize`/`Deserialize` for configuration-facing types

mod client;
mod device;
mod protocol;

pub use client::NbdClient;
pub use device::{KernelControl, NbdDevice, disconnect_device};
pub use protocol::*;
