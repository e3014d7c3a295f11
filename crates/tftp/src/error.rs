//! Error taxonomy for the endpoint.
//!
//! Wire-level decode failures live in [`crate::protocol::PacketError`];
//! everything a transfer or the client can surface to a caller is an
//! [`Error`]. Source chains are preserved so callers can inspect the
//! original failure.

use thiserror::Error;

use crate::options::NegotiationError;
use crate::protocol::{ErrorCode, Opcode, PacketError};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A datagram could not be decoded. Dispatch paths drop these without
    /// replying; the variant exists for callers that decode directly.
    #[error("malformed packet")]
    Packet(#[from] PacketError),

    /// The peer terminated the transfer with an ERROR packet.
    #[error("peer error: {code}: {message}")]
    Peer { code: ErrorCode, message: String },

    /// The peer sent a packet that is illegal in the current state.
    #[error("unexpected {opcode} packet while {state}")]
    Protocol { opcode: Opcode, state: &'static str },

    /// The per-packet retransmission budget ran out.
    #[error("retransmit limit exceeded")]
    RetransmitExceeded,

    /// Requested options could not be agreed on.
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    /// The local side abandoned the transfer.
    #[error("transfer cancelled: {0}")]
    Cancelled(String),

    /// A client configuration value is outside its legal range.
    #[error("invalid client option: {0}")]
    InvalidOption(String),

    /// A transfer URL was not of the form `host:port/path`.
    #[error("invalid transfer url {0:?}")]
    InvalidUrl(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Peer error code, when the failure was reported by the remote side.
    pub fn peer_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Peer { code, .. } => Some(*code),
            _ => None,
        }
    }
}
