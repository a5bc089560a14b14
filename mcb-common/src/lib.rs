// mcb-common - Shared wire definitions for the memcached binary protocol client
//
// This crate defines the packet header layout, opcodes, status codes, the
// validated key type and the error type shared by every other crate.

pub mod error;
pub mod protocol;
pub mod types;

// Re-export for convenience
pub use error::*;
pub use protocol::*;
pub use types::*;
