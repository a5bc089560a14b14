//! # Protocol Structures
//!
//! Purpose: Define the memcached binary protocol header, opcodes and status
//! codes exactly as they travel on the wire.
//!
//! ## Design Principles
//!
//! 1. **Byte-Exact Layout**: Every multi-byte field is big-endian; the header is
//!    always 24 bytes and is read/written field by field, never transmuted.
//! 2. **Open Status Space**: Status codes are a newtype over `u16` so codes the
//!    client does not know about still round-trip and can be reported.
//! 3. **Fixed Body Order**: The body is always `[extras][key][value]`.
//!
//! ## Memory Layout Example
//!
//! ```text
//! Header (24 bytes total):
//! +--------+--------+-----------+-----------+-----------+------------------+
//! | magic  | opcode | key_len   | extra_len | data_type | status / vbucket |
//! +--------+--------+-----------+-----------+-----------+------------------+
//! | 1B     | 1B     | 2B        | 1B        | 1B        | 2B               |
//! +--------+--------+-----------+-----------+-----------+------------------+
//! | body_length:4B  | sequence (opaque):4B  | cas:8B                       |
//! +-----------------+-----------------------+------------------------------+
//!
//! Body (body_length bytes):
//! +-----------------+-----------+--------------------------------+
//! | extras          | key       | value                          |
//! +-----------------+-----------+--------------------------------+
//! ```

use std::fmt;

use bytes::{Buf, BufMut};

/// Magic byte for request packets.
pub const MAGIC_REQUEST: u8 = 0x80;

/// Magic byte for response packets.
pub const MAGIC_RESPONSE: u8 = 0x81;

/// The only data type defined by the protocol.
pub const DATA_TYPE_RAW: u8 = 0x00;

/// Requests always target vbucket zero.
pub const VBUCKET_NIL: u16 = 0x0000;

/// Size of the fixed packet header in bytes.
pub const HEADER_SIZE: usize = 24;

/// Longest key accepted by the server.
pub const MAX_KEY_SIZE: usize = 250;

/// Operation identifiers understood by this client.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Quit = 0x07,
    Flush = 0x08,
    Noop = 0x0a,
    Version = 0x0b,
    Append = 0x0e,
    Prepend = 0x0f,
    Stat = 0x10,
    Touch = 0x1c,
    Gat = 0x1d,
}

impl Opcode {
    /// Convert opcode to its wire byte
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Try to create an opcode from its wire byte
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Get),
            0x01 => Some(Self::Set),
            0x02 => Some(Self::Add),
            0x03 => Some(Self::Replace),
            0x04 => Some(Self::Delete),
            0x05 => Some(Self::Increment),
            0x06 => Some(Self::Decrement),
            0x07 => Some(Self::Quit),
            0x08 => Some(Self::Flush),
            0x0a => Some(Self::Noop),
            0x0b => Some(Self::Version),
            0x0e => Some(Self::Append),
            0x0f => Some(Self::Prepend),
            0x10 => Some(Self::Stat),
            0x1c => Some(Self::Touch),
            0x1d => Some(Self::Gat),
            _ => None,
        }
    }

    /// Get human-readable opcode name
    pub const fn name(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Set => "SET",
            Self::Add => "ADD",
            Self::Replace => "REPLACE",
            Self::Delete => "DELETE",
            Self::Increment => "INCREMENT",
            Self::Decrement => "DECREMENT",
            Self::Quit => "QUIT",
            Self::Flush => "FLUSH",
            Self::Noop => "NOOP",
            Self::Version => "VERSION",
            Self::Append => "APPEND",
            Self::Prepend => "PREPEND",
            Self::Stat => "STAT",
            Self::Touch => "TOUCH",
            Self::Gat => "GAT",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Response status code.
///
/// Kept as a raw `u16` so unknown codes survive decoding and can be shown in
/// error messages as hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u16);

impl Status {
    pub const OK: Status = Status(0x0000);
    pub const KEY_NOT_FOUND: Status = Status(0x0001);
    pub const KEY_EXISTS: Status = Status(0x0002);
    pub const TOO_LARGE: Status = Status(0x0003);
    pub const INVALID_ARGS: Status = Status(0x0004);
    pub const ITEM_NOT_STORED: Status = Status(0x0005);
    pub const NON_NUMERIC_VALUE: Status = Status(0x0006);
    pub const WRONG_VBUCKET: Status = Status(0x0007);
    pub const AUTH_ERROR: Status = Status(0x0008);
    pub const AUTH_CONTINUE: Status = Status(0x0009);
    pub const UNKNOWN_COMMAND: Status = Status(0x0081);
    pub const OUT_OF_MEMORY: Status = Status(0x0082);
    pub const NOT_SUPPORTED: Status = Status(0x0083);
    pub const INTERNAL_ERROR: Status = Status(0x0084);
    pub const BUSY: Status = Status(0x0085);
    pub const TEMPORARY_FAILURE: Status = Status(0x0086);

    /// Returns the raw status code
    #[inline]
    pub const fn code(self) -> u16 {
        self.0
    }

    /// Symbolic name for codes defined by the protocol.
    pub const fn name(self) -> Option<&'static str> {
        match self.0 {
            0x0000 => Some("OK"),
            0x0001 => Some("KEY_NOT_FOUND"),
            0x0002 => Some("KEY_EXISTS"),
            0x0003 => Some("TOO_LARGE"),
            0x0004 => Some("INVALID_ARGS"),
            0x0005 => Some("ITEM_NOT_STORED"),
            0x0006 => Some("NON_NUMERIC_VALUE"),
            0x0007 => Some("WRONG_VBUCKET"),
            0x0008 => Some("AUTH_ERROR"),
            0x0009 => Some("AUTH_CONTINUE"),
            0x0081 => Some("UNKNOWN_COMMAND"),
            0x0082 => Some("OUT_OF_MEMORY"),
            0x0083 => Some("NOT_SUPPORTED"),
            0x0084 => Some("INTERNAL_ERROR"),
            0x0085 => Some("BUSY"),
            0x0086 => Some("TEMPORARY_FAILURE"),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "0x{:04x}", self.0),
        }
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Status({})", self)
    }
}

/// Decoded form of the fixed 24-byte header.
///
/// The `status` field doubles as the vbucket id on requests, where it is
/// always `VBUCKET_NIL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub magic: u8,
    pub opcode: u8,
    pub key_length: u16,
    pub extras_length: u8,
    pub data_type: u8,
    pub status: u16,
    pub body_length: u32,
    pub sequence: u32,
    pub cas: u64,
}

impl Header {
    /// Reads a header from exactly `HEADER_SIZE` bytes.
    pub fn read(bytes: &[u8; HEADER_SIZE]) -> Self {
        let mut buf = &bytes[..];
        Header {
            magic: buf.get_u8(),
            opcode: buf.get_u8(),
            key_length: buf.get_u16(),
            extras_length: buf.get_u8(),
            data_type: buf.get_u8(),
            status: buf.get_u16(),
            body_length: buf.get_u32(),
            sequence: buf.get_u32(),
            cas: buf.get_u64(),
        }
    }

    /// Appends the 24 header bytes to `buf`.
    pub fn write<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.magic);
        buf.put_u8(self.opcode);
        buf.put_u16(self.key_length);
        buf.put_u8(self.extras_length);
        buf.put_u8(self.data_type);
        buf.put_u16(self.status);
        buf.put_u32(self.body_length);
        buf.put_u32(self.sequence);
        buf.put_u64(self.cas);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_conversion() {
        let opcodes = [
            Opcode::Get,
            Opcode::Set,
            Opcode::Add,
            Opcode::Replace,
            Opcode::Delete,
            Opcode::Increment,
            Opcode::Decrement,
            Opcode::Quit,
            Opcode::Flush,
            Opcode::Noop,
            Opcode::Version,
            Opcode::Append,
            Opcode::Prepend,
            Opcode::Stat,
            Opcode::Touch,
            Opcode::Gat,
        ];

        for opcode in opcodes {
            assert_eq!(Opcode::from_u8(opcode.as_u8()), Some(opcode));
        }
        assert_eq!(Opcode::from_u8(0x09), None);
        assert_eq!(Opcode::from_u8(0xff), None);
    }

    #[test]
    fn test_opcode_wire_values() {
        assert_eq!(Opcode::Quit.as_u8(), 0x07);
        assert_eq!(Opcode::Stat.as_u8(), 0x10);
        assert_eq!(Opcode::Gat.as_u8(), 0x1d);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::TOO_LARGE.to_string(), "TOO_LARGE");
        assert_eq!(Status::TEMPORARY_FAILURE.to_string(), "TEMPORARY_FAILURE");
        assert_eq!(Status(0x0123).to_string(), "0x0123");
        assert_eq!(Status(0x0123).name(), None);
    }

    #[test]
    fn test_header_write_layout() {
        let header = Header {
            magic: MAGIC_REQUEST,
            opcode: Opcode::Quit.as_u8(),
            key_length: 5,
            extras_length: 6,
            data_type: DATA_TYPE_RAW,
            status: VBUCKET_NIL,
            body_length: 17,
            sequence: 0x0102_0304,
            cas: 0x0506_0708_090a_0b0c,
        };

        let mut buf = Vec::new();
        header.write(&mut buf);
        assert_eq!(
            buf,
            [
                0x80, 0x07, 0x00, 0x05, 0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x11, 0x01,
                0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c,
            ]
        );

        let mut bytes = [0u8; HEADER_SIZE];
        bytes.copy_from_slice(&buf);
        assert_eq!(Header::read(&bytes), header);
    }
}
