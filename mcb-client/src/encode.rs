//! # Packet Encoding
//!
//! Purpose: Serialize one outgoing request into header + body bytes.
//!
//! ## Design Principles
//! 1. **Borrowed Segments**: Extras, key and value are borrowed slices, so
//!    callers can point into their own buffers without copying first.
//! 2. **Buffer Reuse**: Requests whose body fits `BODY_SIZE` are written into a
//!    reusable scratch buffer; larger ones get a one-off allocation.
//! 3. **Fixed Body Order**: `[extras][key][value]`, matching the decoder.
//! 4. **Fail Fast**: Segments that overflow their length fields are rejected
//!    instead of being silently truncated.

use std::borrow::Cow;

use bytes::BufMut;
use mcb_common::{
    Error, Header, Opcode, Result, DATA_TYPE_RAW, HEADER_SIZE, MAGIC_REQUEST, VBUCKET_NIL,
};

/// Size of the reusable scratch buffer.
pub const SCRATCH_SIZE: usize = 16384;

/// Largest body that is encoded into the scratch buffer.
pub const BODY_SIZE: usize = SCRATCH_SIZE - HEADER_SIZE;

/// Logical request before it is framed.
///
/// `sequence` is normally left unset and assigned by the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutgoingPacket<'a> {
    pub opcode: Opcode,
    pub sequence: Option<u32>,
    pub cas: u64,
    pub extras: &'a [u8],
    pub key: &'a [u8],
    pub value: &'a [u8],
}

impl<'a> OutgoingPacket<'a> {
    /// Request with no CAS and empty extras/key/value.
    pub const fn new(opcode: Opcode) -> Self {
        OutgoingPacket {
            opcode,
            sequence: None,
            cas: 0,
            extras: &[],
            key: &[],
            value: &[],
        }
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_extras(mut self, extras: &'a [u8]) -> Self {
        self.extras = extras;
        self
    }

    pub fn with_key(mut self, key: &'a [u8]) -> Self {
        self.key = key;
        self
    }

    pub fn with_value(mut self, value: &'a [u8]) -> Self {
        self.value = value;
        self
    }

    /// Combined length of extras, key and value.
    #[inline]
    pub fn body_length(&self) -> usize {
        self.extras.len() + self.key.len() + self.value.len()
    }
}

/// Request encoder owning a reusable scratch buffer.
#[derive(Debug)]
pub struct Encoder {
    scratch: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Encoder {
            scratch: Vec::with_capacity(SCRATCH_SIZE),
        }
    }

    /// Encodes `packet`, using `sequence` unless the packet carries its own.
    ///
    /// The borrowed result points into the scratch buffer and is valid until
    /// the next call; oversized bodies come back owned.
    pub fn encode(&mut self, packet: &OutgoingPacket<'_>, sequence: u32) -> Result<Cow<'_, [u8]>> {
        let header = request_header(packet, sequence)?;
        let body_length = packet.body_length();

        if body_length <= BODY_SIZE {
            self.scratch.clear();
            write_packet(&mut self.scratch, &header, packet);
            return Ok(Cow::Borrowed(&self.scratch[..]));
        }

        let mut buffer = Vec::with_capacity(HEADER_SIZE + body_length);
        write_packet(&mut buffer, &header, packet);
        Ok(Cow::Owned(buffer))
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

fn request_header(packet: &OutgoingPacket<'_>, sequence: u32) -> Result<Header> {
    let extras_length = u8::try_from(packet.extras.len()).map_err(|_| Error::PacketTooLarge {
        field: "extras",
        len: packet.extras.len(),
    })?;
    let key_length = u16::try_from(packet.key.len()).map_err(|_| Error::PacketTooLarge {
        field: "key",
        len: packet.key.len(),
    })?;
    let body_length = u32::try_from(packet.body_length()).map_err(|_| Error::PacketTooLarge {
        field: "body",
        len: packet.body_length(),
    })?;

    Ok(Header {
        magic: MAGIC_REQUEST,
        opcode: packet.opcode.as_u8(),
        key_length,
        extras_length,
        data_type: DATA_TYPE_RAW,
        status: VBUCKET_NIL,
        body_length,
        sequence: packet.sequence.unwrap_or(sequence),
        cas: packet.cas,
    })
}

fn write_packet<B: BufMut>(buf: &mut B, header: &Header, packet: &OutgoingPacket<'_>) {
    header.write(buf);
    buf.put_slice(packet.extras);
    buf.put_slice(packet.key);
    buf.put_slice(packet.value);
}
