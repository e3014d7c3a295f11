//! TFTP endpoint library.
//!
//! A complete implementation of the Trivial File Transfer Protocol for both
//! sides of the wire:
//!
//! - **RFC 1350** base protocol in binary (octet) and netascii modes
//! - **RFC 2347** option extension framing
//! - **RFC 2348** `blksize`, **RFC 2349** `timeout` and `tsize`,
//!   **RFC 7440** `windowsize` windowed transfers
//!
//! The [`Server`] listens on the well-known port and runs every accepted
//! request as an independent transfer on its own ephemeral socket; register
//! a [`ReadHandler`] and/or [`WriteHandler`] to supply and consume file
//! bytes. The [`Client`] offers `get` and `put` against a
//! `host:port/path` URL.
//!
//! # Example
//!
//! ```no_run
//! use tftp::Client;
//!
//! # async fn example() -> tftp::Result<()> {
//! let client = Client::new().blocksize(1468)?.windowsize(16)?;
//! let mut response = client.get("198.51.100.4:69/boot/kernel.img").await?;
//! let mut image = Vec::new();
//! response.read_to_end(&mut image).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod netascii;
pub mod options;
pub mod protocol;
pub mod server;

mod transfer;
mod window;

pub use client::{Client, Response};
pub use error::{Error, Result};
pub use options::TransferOptions;
pub use protocol::{ErrorCode, Mode, Opcode, Packet, PacketError, Request};
pub use server::{ReadHandler, ReadRequest, Server, Shutdown, WriteHandler, WriteRequest};
