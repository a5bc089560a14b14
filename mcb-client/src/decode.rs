//! # Packet Decoding
//!
//! Purpose: Reassemble complete response packets from socket reads that may
//! split a header or body at any byte.
//!
//! ## Design Principles
//! 1. **Two-State Machine**: `Header` accumulates the fixed 24 bytes, `Body`
//!    accumulates exactly `body_length` bytes into a pooled buffer.
//! 2. **Zero-Copy Views**: Extras, key and value are ranges over the single
//!    body buffer of their packet; releasing the packet releases all three.
//! 3. **Fail Fast, Keep Framing**: Bad magic or data type fail the packet, but
//!    the full body is still consumed so the next packet starts aligned.
//!
//! ## Structure Overview
//!
//! ```text
//! append(chunk)
//!   └── Header { pos }  --24 bytes-->  Body { header, body, pos }
//!          ^   \--body_length == 0--> emit          |
//!          \-------------------- emit <--body full--/
//! ```

use std::fmt;
use std::sync::Arc;

use mcb_common::{Error, Header, Status, DATA_TYPE_RAW, HEADER_SIZE, MAGIC_RESPONSE};

use crate::buffers::{BufferPool, PooledBuf};

/// Outcome of decoding one packet.
pub type Decoded = Result<IncomingPacket, Error>;

/// A complete response packet.
///
/// The segment accessors borrow the packet, so the bytes can not outlive
/// [`IncomingPacket::release`] (or drop), which hands the body buffer back to
/// its pool.
pub struct IncomingPacket {
    pub opcode: u8,
    pub status: Status,
    pub sequence: u32,
    pub cas: u64,
    body: Option<PooledBuf>,
    extras_end: usize,
    key_end: usize,
}

impl IncomingPacket {
    fn new(header: &Header, body: Option<PooledBuf>) -> Self {
        let body_length = body.as_ref().map_or(0, |body| body.len());
        let extras_end = (header.extras_length as usize).min(body_length);
        let key_end = (extras_end + header.key_length as usize).min(body_length);

        IncomingPacket {
            opcode: header.opcode,
            status: Status(header.status),
            sequence: header.sequence,
            cas: header.cas,
            body,
            extras_end,
            key_end,
        }
    }

    fn body(&self) -> &[u8] {
        self.body.as_deref().unwrap_or(&[])
    }

    #[inline]
    pub fn extras(&self) -> &[u8] {
        &self.body()[..self.extras_end]
    }

    #[inline]
    pub fn key(&self) -> &[u8] {
        &self.body()[self.extras_end..self.key_end]
    }

    #[inline]
    pub fn value(&self) -> &[u8] {
        &self.body()[self.key_end..]
    }

    /// Returns the body buffer to its pool.
    pub fn release(self) {
        drop(self);
    }
}

impl fmt::Debug for IncomingPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingPacket")
            .field("opcode", &format_args!("0x{:02x}", self.opcode))
            .field("status", &self.status)
            .field("sequence", &self.sequence)
            .field("cas", &self.cas)
            .field("extras", &String::from_utf8_lossy(self.extras()))
            .field("key", &String::from_utf8_lossy(self.key()))
            .field("value", &String::from_utf8_lossy(self.value()))
            .finish()
    }
}

enum State {
    Header { pos: usize },
    Body { header: Header, body: PooledBuf, pos: usize },
}

/// Incremental response decoder feeding complete packets to `consumer`.
pub struct Decoder<C> {
    consumer: C,
    pool: Arc<BufferPool>,
    header: [u8; HEADER_SIZE],
    state: State,
}

impl<C> Decoder<C>
where
    C: FnMut(Decoded),
{
    pub fn new(pool: Arc<BufferPool>, consumer: C) -> Self {
        Decoder {
            consumer,
            pool,
            header: [0u8; HEADER_SIZE],
            state: State::Header { pos: 0 },
        }
    }

    /// Consumes `chunk`, emitting every packet it completes.
    ///
    /// A chunk may end anywhere; the next call resumes mid-header or mid-body.
    pub fn append(&mut self, mut chunk: &[u8]) {
        while !chunk.is_empty() {
            match &mut self.state {
                State::Header { pos } => {
                    let count = (HEADER_SIZE - *pos).min(chunk.len());
                    self.header[*pos..*pos + count].copy_from_slice(&chunk[..count]);
                    *pos += count;
                    chunk = &chunk[count..];
                    if *pos < HEADER_SIZE {
                        return;
                    }

                    let header = Header::read(&self.header);
                    if header.body_length == 0 {
                        self.state = State::Header { pos: 0 };
                        self.emit(&header, None);
                    } else {
                        let body = self.pool.acquire(header.body_length as usize);
                        self.state = State::Body { header, body, pos: 0 };
                    }
                }
                State::Body { body, pos, .. } => {
                    let count = (body.len() - *pos).min(chunk.len());
                    body[*pos..*pos + count].copy_from_slice(&chunk[..count]);
                    *pos += count;
                    chunk = &chunk[count..];
                    if *pos < body.len() {
                        return;
                    }

                    let finished = std::mem::replace(&mut self.state, State::Header { pos: 0 });
                    if let State::Body { header, body, .. } = finished {
                        self.emit(&header, Some(body));
                    }
                }
            }
        }
    }

    /// True when no partial packet is buffered.
    #[cfg(test)]
    fn is_idle(&self) -> bool {
        matches!(self.state, State::Header { pos: 0 })
    }

    fn emit(&mut self, header: &Header, body: Option<PooledBuf>) {
        let decoded = if header.magic != MAGIC_RESPONSE {
            Err(Error::InvalidMagic {
                sequence: header.sequence,
                magic: header.magic,
            })
        } else if header.data_type != DATA_TYPE_RAW {
            Err(Error::InvalidDataType {
                sequence: header.sequence,
                data_type: header.data_type,
            })
        } else {
            Ok(IncomingPacket::new(header, body))
        };
        (self.consumer)(decoded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::BUFFER_SIZE;
    use crate::encode::{Encoder, OutgoingPacket};
    use mcb_common::Opcode;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn collecting_decoder(
        pool: Arc<BufferPool>,
    ) -> (Decoder<impl FnMut(Decoded)>, Rc<RefCell<Vec<Decoded>>>) {
        let sink = Rc::new(RefCell::new(Vec::new()));
        let out = sink.clone();
        let decoder = Decoder::new(pool, move |decoded| out.borrow_mut().push(decoded));
        (decoder, sink)
    }

    // Deterministic filler so failures are reproducible.
    fn fill(buf: &mut [u8], mut seed: u32) {
        for byte in buf.iter_mut() {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            *byte = (seed >> 16) as u8;
        }
    }

    fn raw_packet(body_length: usize, key_length: u16, extras_length: u8, seed: u32) -> Vec<u8> {
        let mut packet = vec![0u8; HEADER_SIZE + body_length];
        fill(&mut packet, seed);
        packet[0] = MAGIC_RESPONSE;
        packet[5] = DATA_TYPE_RAW;
        packet[2..4].copy_from_slice(&key_length.to_be_bytes());
        packet[4] = extras_length;
        packet[8..12].copy_from_slice(&(body_length as u32).to_be_bytes());
        packet
    }

    #[test]
    fn decodes_known_packet() {
        let mut bytes = vec![
            0x81, 0x07, 0x00, 0x05, 0x06, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00, 0x11, 0x01, 0x02,
            0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c,
        ];
        bytes.extend_from_slice(b"FooBarHelloWorld!");

        let (mut decoder, sink) = collecting_decoder(BufferPool::new());
        decoder.append(&bytes);

        let packets = sink.borrow();
        assert_eq!(packets.len(), 1);
        let packet = packets[0].as_ref().expect("packet");
        assert_eq!(packet.opcode, Opcode::Quit.as_u8());
        assert_eq!(packet.status, Status::TOO_LARGE);
        assert_eq!(packet.sequence, 0x0102_0304);
        assert_eq!(packet.cas, 0x0506_0708_090a_0b0c);
        assert_eq!(packet.extras(), b"FooBar");
        assert_eq!(packet.key(), b"Hello");
        assert_eq!(packet.value(), b"World!");
        assert!(decoder.is_idle());
    }

    #[test]
    fn decodes_regardless_of_chunk_size() {
        let packets = [
            raw_packet(0, 0, 0, 1),
            raw_packet(64, 20, 10, 2),
            raw_packet(512, 200, 100, 3),
        ];
        let expected: Vec<(Vec<u8>, Vec<u8>, Vec<u8>)> = packets
            .iter()
            .zip([(0usize, 0usize), (10, 20), (100, 200)])
            .map(|(packet, (extras, key))| {
                let body = &packet[HEADER_SIZE..];
                (
                    body[..extras].to_vec(),
                    body[extras..extras + key].to_vec(),
                    body[extras + key..].to_vec(),
                )
            })
            .collect();
        let stream = packets.concat();

        for size in 1..=stream.len() {
            let (mut decoder, sink) = collecting_decoder(BufferPool::new());
            for chunk in stream.chunks(size) {
                decoder.append(chunk);
            }

            let decoded = sink.borrow();
            assert_eq!(decoded.len(), 3, "wrong packet count for chunk size {}", size);
            for (n, (extras, key, value)) in expected.iter().enumerate() {
                let packet = decoded[n].as_ref().expect("packet");
                assert_eq!(packet.extras(), &extras[..], "extras p={} size={}", n, size);
                assert_eq!(packet.key(), &key[..], "key p={} size={}", n, size);
                assert_eq!(packet.value(), &value[..], "value p={} size={}", n, size);
            }
            assert!(decoder.is_idle());
        }
    }

    #[test]
    fn encoded_request_decodes_once_magic_is_flipped() {
        let request = OutgoingPacket::new(Opcode::Append)
            .with_cas(u64::MAX)
            .with_extras(b"\x00\x01")
            .with_key(b"counter")
            .with_value(b"payload");
        let mut encoder = Encoder::new();
        let mut bytes = encoder.encode(&request, 0xdead_beef).expect("encode").into_owned();
        bytes[0] = MAGIC_RESPONSE;

        let (mut decoder, sink) = collecting_decoder(BufferPool::new());
        decoder.append(&bytes);

        let decoded = sink.borrow();
        let packet = decoded[0].as_ref().expect("packet");
        assert_eq!(packet.opcode, Opcode::Append.as_u8());
        assert_eq!(packet.status, Status::OK);
        assert_eq!(packet.sequence, 0xdead_beef);
        assert_eq!(packet.cas, u64::MAX);
        assert_eq!(packet.extras(), b"\x00\x01");
        assert_eq!(packet.key(), b"counter");
        assert_eq!(packet.value(), b"payload");
    }

    #[test]
    fn bad_magic_fails_one_packet_and_keeps_framing() {
        let mut bad = raw_packet(8, 0, 0, 4);
        bad[0] = 0x80;
        bad[12..16].copy_from_slice(&7u32.to_be_bytes());
        let mut good = raw_packet(3, 0, 0, 5);
        good[12..16].copy_from_slice(&8u32.to_be_bytes());

        let (mut decoder, sink) = collecting_decoder(BufferPool::new());
        decoder.append(&[bad, good].concat());

        let decoded = sink.borrow();
        assert_eq!(decoded.len(), 2);
        assert!(matches!(
            decoded[0],
            Err(Error::InvalidMagic { sequence: 7, magic: 0x80 })
        ));
        assert_eq!(decoded[1].as_ref().expect("packet").sequence, 8);
    }

    #[test]
    fn bad_data_type_is_rejected() {
        let mut packet = raw_packet(0, 0, 0, 6);
        packet[5] = 0x01;
        let (mut decoder, sink) = collecting_decoder(BufferPool::new());
        decoder.append(&packet);
        assert!(matches!(
            sink.borrow()[0],
            Err(Error::InvalidDataType { data_type: 0x01, .. })
        ));
    }

    #[test]
    fn empty_body_does_not_touch_the_pool() {
        let pool = BufferPool::new();
        let (mut decoder, sink) = collecting_decoder(pool.clone());
        decoder.append(&raw_packet(0, 0, 0, 9));

        let packet = sink.borrow_mut().pop().expect("one packet").expect("packet");
        assert!(packet.extras().is_empty());
        assert!(packet.key().is_empty());
        assert!(packet.value().is_empty());
        packet.release();
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn releasing_a_packet_recycles_its_body() {
        let pool = BufferPool::new();
        let (mut decoder, sink) = collecting_decoder(pool.clone());
        decoder.append(&raw_packet(32, 4, 4, 10));
        decoder.append(&raw_packet(BUFFER_SIZE + 1, 0, 0, 11));

        let mut decoded = sink.borrow_mut();
        let large = decoded.pop().expect("large").expect("packet");
        let small = decoded.pop().expect("small").expect("packet");
        assert_eq!(large.value().len(), BUFFER_SIZE + 1);

        large.release();
        assert_eq!(pool.available(), 0);
        small.release();
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn oversized_segment_lengths_are_clamped_to_the_body() {
        let packet = raw_packet(4, 10, 2, 12);
        let (mut decoder, sink) = collecting_decoder(BufferPool::new());
        decoder.append(&packet);

        let decoded = sink.borrow();
        let packet = decoded[0].as_ref().expect("packet");
        assert_eq!(packet.extras().len(), 2);
        assert_eq!(packet.key().len(), 2);
        assert!(packet.value().is_empty());
    }
}
