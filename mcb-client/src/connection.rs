//! # Connection
//!
//! Purpose: Own one persistent TCP link to a server and multiplex any number
//! of concurrent requests over it, matching replies by sequence number.
//!
//! ## Design Principles
//! 1. **Pending Table**: Every in-flight request is a oneshot sender keyed by
//!    its sequence number; whoever removes the entry completes it, so each
//!    request finishes at most once.
//! 2. **Serialized Writes**: The write half lives behind an async mutex, which
//!    also memoizes connecting: concurrent senders wait for the same attempt.
//! 3. **Dedicated Reader**: A spawned task feeds socket reads to the decoder
//!    and routes packets; replies may arrive in any order.
//! 4. **Failure Scope**: A timeout fails one request, a protocol violation
//!    fails the request it belongs to, a transport error fails them all.
//!
//! ## Structure Overview
//!
//! ```text
//! Connection
//!   ├── writer: tokio Mutex<Writer>
//!   │     ├── encoder (scratch buffer)
//!   │     └── link: Option<Link { id, write half, reader task }>
//!   └── shared: Arc<Shared>             (also held by the reader task)
//!         ├── pool: Arc<BufferPool>
//!         └── state: Mutex<SharedState>
//!               ├── pending: HashMap<sequence, Pending>
//!               └── link: Option<id>    (None once the reader saw EOF/error)
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace, warn};

use mcb_common::{Error, Opcode, Result};

use crate::buffers::{BufferPool, BUFFER_SIZE};
use crate::config::ConnectionConfig;
use crate::decode::{Decoded, Decoder, IncomingPacket};
use crate::encode::{Encoder, OutgoingPacket};

type Completion = oneshot::Sender<Result<Vec<IncomingPacket>>>;

/// A request waiting for its reply.
struct Pending {
    opcode: u8,
    // Non-terminal STAT packets collected so far.
    packets: Vec<IncomingPacket>,
    done: Completion,
}

impl Pending {
    fn complete(self, outcome: Result<Vec<IncomingPacket>>) {
        // The caller may have given up already; its packets are released here.
        let _ = self.done.send(outcome);
    }
}

#[derive(Default)]
struct SharedState {
    pending: HashMap<u32, Pending>,
    link: Option<u64>,
}

/// State touched by both senders and the reader task.
struct Shared {
    addr: String,
    pool: Arc<BufferPool>,
    state: Mutex<SharedState>,
}

impl Shared {
    fn is_current(&self, link_id: u64) -> bool {
        self.state.lock().link == Some(link_id)
    }

    /// Registers a waiter, unless the link died since it was checked.
    fn register(&self, link_id: u64, sequence: u32, pending: Pending) -> bool {
        let mut state = self.state.lock();
        if state.link != Some(link_id) {
            return false;
        }
        if let Some(previous) = state.pending.insert(sequence, pending) {
            drop(state);
            warn!(addr = %self.addr, sequence, "sequence reused while still pending");
            previous.complete(Err(Error::Closed));
        }
        true
    }

    fn remove(&self, sequence: u32) -> Option<Pending> {
        self.state.lock().pending.remove(&sequence)
    }

    /// Marks `link_id` as gone and fails every pending request with `err`.
    ///
    /// Returns false when the link was already replaced or torn down.
    fn link_lost(&self, link_id: u64, err: Error) -> bool {
        let failed: Vec<Pending> = {
            let mut state = self.state.lock();
            if state.link != Some(link_id) {
                return false;
            }
            state.link = None;
            state.pending.drain().map(|(_, pending)| pending).collect()
        };

        if failed.is_empty() {
            debug!(addr = %self.addr, link = link_id, reason = %err, "disconnected");
        } else {
            warn!(addr = %self.addr, link = link_id, reason = %err, failed = failed.len(), "disconnected with pending requests");
        }
        for pending in failed {
            pending.complete(Err(err.clone()));
        }
        true
    }

    /// Delivers one decoded packet to the request with the same sequence.
    fn route(&self, decoded: Decoded) {
        let (sequence, outcome) = match decoded {
            Ok(packet) => (packet.sequence, Ok(packet)),
            Err(err) => match err {
                Error::InvalidMagic { sequence, .. } | Error::InvalidDataType { sequence, .. } => {
                    warn!(addr = %self.addr, sequence, error = %err, "protocol violation");
                    (sequence, Err(err))
                }
                other => {
                    warn!(addr = %self.addr, error = %other, "undeliverable decoder error");
                    return;
                }
            },
        };

        let mut state = self.state.lock();
        let Some(pending) = state.pending.get_mut(&sequence) else {
            drop(state);
            debug!(addr = %self.addr, sequence, "dropping unsolicited response");
            return;
        };

        let packet = match outcome {
            Ok(packet) if packet.opcode != pending.opcode => Err(Error::OpcodeMismatch {
                sent: pending.opcode,
                received: packet.opcode,
            }),
            other => other,
        };

        // STAT replies are a run of packets closed by one with an empty key.
        let packet = match packet {
            Ok(packet) if packet.opcode == Opcode::Stat.as_u8() && !packet.key().is_empty() => {
                pending.packets.push(packet);
                return;
            }
            other => other,
        };

        let removed = state.pending.remove(&sequence);
        drop(state);
        let Some(mut pending) = removed else {
            return;
        };
        match packet {
            Ok(packet) => {
                trace!(addr = %self.addr, sequence, opcode = packet.opcode, status = %packet.status, "response routed");
                pending.packets.push(packet);
                let packets = std::mem::take(&mut pending.packets);
                pending.complete(Ok(packets));
            }
            Err(err) => {
                debug!(addr = %self.addr, sequence, error = %err, "request failed");
                pending.complete(Err(err));
            }
        }
    }
}

/// One established socket.
struct Link {
    id: u64,
    stream: OwnedWriteHalf,
    reader: JoinHandle<()>,
    // Set while a write is in progress; still set afterwards means the
    // sending future was dropped mid-frame.
    torn: bool,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

struct Writer {
    encoder: Encoder,
    link: Option<Link>,
    next_link_id: u64,
}

/// Removes a pending entry when the sending future goes away early.
struct PendingGuard<'a> {
    shared: &'a Shared,
    sequence: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.remove(self.sequence);
    }
}

/// Persistent, multiplexed connection to one server.
///
/// Connecting is lazy: the first [`Connection::send`] opens the socket and
/// later sends reuse it. After the socket fails or closes the next send
/// reconnects. Dropping the connection closes the socket.
pub struct Connection {
    config: ConnectionConfig,
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<Writer>,
    sequence: AtomicU32,
}

impl Connection {
    /// Creates a connection using the process-wide buffer pool.
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        Self::with_pool(config, BufferPool::shared())
    }

    /// Creates a connection decoding into buffers from `pool`.
    pub fn with_pool(config: ConnectionConfig, pool: Arc<BufferPool>) -> Result<Self> {
        config.validate()?;
        Ok(Connection {
            shared: Arc::new(Shared {
                addr: config.addr(),
                pool,
                state: Mutex::new(SharedState::default()),
            }),
            config,
            writer: tokio::sync::Mutex::new(Writer {
                encoder: Encoder::new(),
                link: None,
                next_link_id: 0,
            }),
            sequence: AtomicU32::new(0),
        })
    }

    /// True while a socket is established and has not failed.
    pub fn connected(&self) -> bool {
        self.shared.state.lock().link.is_some()
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    fn next_sequence(&self) -> u32 {
        // fetch_add wraps on overflow.
        self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Sends one request and waits for its reply.
    ///
    /// Resolves with one packet, or for `STAT` with every packet up to and
    /// including the terminator. Packets release their buffers when dropped.
    ///
    /// **Logic**:
    /// 1. Fix the deadline: the configured timeout covers the whole call.
    /// 2. Take the writer lock, connect if there is no live link, encode,
    ///    register the waiter and write the frame.
    /// 3. Release the lock and wait for the reader to route the reply.
    ///
    /// A deadline hit mid-write leaves the link torn; the next send reconnects.
    pub async fn send(&self, packet: OutgoingPacket<'_>) -> Result<Vec<IncomingPacket>> {
        let deadline = Instant::now() + self.config.timeout;
        let sequence = packet.sequence.unwrap_or_else(|| self.next_sequence());
        let (done, mut reply) = oneshot::channel();

        let guard = match timeout_at(deadline, self.transmit(&packet, sequence, done, deadline)).await
        {
            Ok(guard) => guard?,
            Err(_) => {
                debug!(addr = %self.shared.addr, sequence, "request timed out before it was written");
                return Err(Error::Timeout);
            }
        };

        let outcome = match timeout_at(deadline, &mut reply).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                if self.shared.remove(sequence).is_some() {
                    debug!(addr = %self.shared.addr, sequence, "request timed out");
                    Err(Error::Timeout)
                } else {
                    // Routed between the deadline and the removal.
                    reply.try_recv().unwrap_or(Err(Error::Timeout))
                }
            }
        };
        drop(guard);
        outcome
    }

    /// Writes one frame under the writer lock and leaves its waiter registered.
    async fn transmit(
        &self,
        packet: &OutgoingPacket<'_>,
        sequence: u32,
        done: Completion,
        deadline: Instant,
    ) -> Result<PendingGuard<'_>> {
        let mut writer = self.writer.lock().await;
        let link_id = self.ensure_link(&mut writer, deadline).await?;

        let Writer { encoder, link, .. } = &mut *writer;
        let bytes = encoder.encode(packet, sequence)?;

        let pending = Pending {
            opcode: packet.opcode.as_u8(),
            packets: Vec::new(),
            done,
        };
        if !self.shared.register(link_id, sequence, pending) {
            *link = None;
            return Err(Error::Closed);
        }
        let guard = PendingGuard {
            shared: &self.shared,
            sequence,
        };

        let Some(active) = link.as_mut() else {
            return Err(Error::Closed);
        };
        active.torn = true;
        if let Err(err) = active.stream.write_all(&bytes).await {
            let err = Error::from(err);
            self.shared.link_lost(link_id, err.clone());
            *link = None;
            return Err(err);
        }
        active.torn = false;
        Ok(guard)
    }

    /// Sends a request that is answered by exactly one packet.
    pub async fn request(&self, packet: OutgoingPacket<'_>) -> Result<IncomingPacket> {
        self.send(packet).await?.pop().ok_or(Error::Closed)
    }

    /// Closes the socket.
    ///
    /// Returns false when there was no live socket to close. Pending requests
    /// fail with `Error::Closed` right away, even while a stalled write still
    /// holds the writer.
    pub async fn destroy(&self) -> bool {
        let current = self.shared.state.lock().link;
        let Some(link_id) = current else {
            return false;
        };
        if !self.shared.link_lost(link_id, Error::Closed) {
            return false;
        }

        let mut writer = self.writer.lock().await;
        if writer.link.as_ref().map_or(false, |link| link.id == link_id) {
            if let Some(mut link) = writer.link.take() {
                if let Err(err) = link.stream.shutdown().await {
                    warn!(addr = %self.shared.addr, link = link_id, error = %err, "error while closing");
                }
            }
        }
        debug!(addr = %self.shared.addr, link = link_id, "destroyed");
        true
    }

    async fn ensure_link(&self, writer: &mut Writer, deadline: Instant) -> Result<u64> {
        if let Some(link) = writer.link.as_ref() {
            if !link.torn && self.shared.is_current(link.id) {
                return Ok(link.id);
            }
        }
        if let Some(stale) = writer.link.take() {
            self.shared.link_lost(stale.id, Error::Closed);
        }

        let stream = connect(&self.config, deadline).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        writer.next_link_id += 1;
        let id = writer.next_link_id;
        self.shared.state.lock().link = Some(id);
        let reader = tokio::spawn(read_loop(read_half, self.shared.clone(), id));

        writer.link = Some(Link {
            id,
            stream: write_half,
            reader,
            torn: false,
        });
        debug!(addr = %self.shared.addr, link = id, "connected");
        Ok(id)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.shared.addr)
            .field("timeout", &self.config.timeout)
            .field("connected", &self.connected())
            .finish()
    }
}

async fn connect(config: &ConnectionConfig, deadline: Instant) -> Result<TcpStream> {
    let attempt = TcpStream::connect((config.host.as_str(), config.port));
    match timeout_at(deadline, attempt).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(Error::ConnectTimeout { addr: config.addr() }),
    }
}

async fn read_loop(mut stream: OwnedReadHalf, shared: Arc<Shared>, link_id: u64) {
    let router = shared.clone();
    let mut decoder = Decoder::new(shared.pool.clone(), move |decoded| router.route(decoded));
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

    let reason = loop {
        match stream.read_buf(&mut buffer).await {
            Ok(0) => break Error::Closed,
            Ok(_) => {
                decoder.append(&buffer);
                buffer.clear();
            }
            Err(err) => break Error::from(err),
        }
    };
    shared.link_lost(link_id, reason);
}
