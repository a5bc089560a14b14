//! # Error Types
//!
//! One error enum for every layer of the client: validation, encoding,
//! transport, protocol violations and server status failures.
//!
//! Errors are `Clone` because a single transport failure is delivered to every
//! request pending on the connection; the underlying `io::Error` is shared
//! behind an `Arc` for that reason.

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::protocol::{Opcode, Status};

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the client.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Key exceeds the protocol limit; rejected before any I/O.
    #[error("Key too long (len={len})")]
    KeyTooLong { len: usize },

    /// Configuration rejected at construction time.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A packet segment does not fit its fixed-width length field.
    #[error("Packet too large ({field} length {len} exceeds wire limit)")]
    PacketTooLarge { field: &'static str, len: usize },

    /// Response header carried a magic byte other than the response magic.
    #[error("Invalid magic in header (magic=0x{magic:02x}, sequence={sequence})")]
    InvalidMagic { sequence: u32, magic: u8 },

    /// Response header carried a data type other than raw bytes.
    #[error("Invalid data type in header (data_type=0x{data_type:02x}, sequence={sequence})")]
    InvalidDataType { sequence: u32, data_type: u8 },

    /// The response for a sequence answered a different operation.
    #[error("Opcode mismatch (sent=0x{sent:02x}, received=0x{received:02x})")]
    OpcodeMismatch { sent: u8, received: u8 },

    /// Successful response whose payload does not have the expected shape.
    #[error("Malformed {opcode} response: {reason}")]
    MalformedResponse { opcode: Opcode, reason: &'static str },

    /// Server answered with a status that is not part of the operation's
    /// success or absence semantics.
    #[error(
        "{message} (status={status}{})",
        .key.as_ref().map(|key| format!(", key={key}")).unwrap_or_default()
    )]
    Status {
        status: Status,
        message: String,
        key: Option<String>,
    },

    /// No response arrived within the configured timeout.
    #[error("No response")]
    Timeout,

    /// The TCP connection could not be established within the timeout.
    #[error("Timeout connecting to {addr}")]
    ConnectTimeout { addr: String },

    /// The socket closed while the request was still pending.
    #[error("Connection closed")]
    Closed,

    /// Network or IO failure, shared by every waiter it fails.
    #[error("{0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl Error {
    /// True for failures that took the whole connection down.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Closed | Error::ConnectTimeout { .. }
        )
    }
}
