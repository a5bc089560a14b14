//! # Server Adapter
//!
//! Purpose: Map cache operations (get, set, counters, stats, ...) onto binary
//! protocol requests against a single server and interpret the reply status.
//!
//! ## Design Principles
//! 1. **Absence Is Not Failure**: `KEY_NOT_FOUND`, `KEY_EXISTS` and
//!    `ITEM_NOT_STORED` map to `None`/`false` where the operation gives them a
//!    meaning; every other non-OK status becomes [`Error::Status`].
//! 2. **Fail Fast**: Keys are validated before any I/O.
//! 3. **Scoped Buffers**: Response packets are owned values; whatever path an
//!    operation takes, dropping the packet returns its buffer to the pool.
//! 4. **Default TTL**: Writes without an explicit TTL use the adapter's TTL.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::BufMut;
use tracing::debug;

use mcb_common::{Error, Key, Opcode, Result, Status};

use crate::buffers::BufferPool;
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::decode::IncomingPacket;
use crate::encode::OutgoingPacket;
use crate::stats::{typed_stat, Stats};

/// TTL value telling the server not to create a missing counter.
pub const COUNTER_NO_CREATE: u32 = 0xffff_ffff;

/// A value returned by `get`/`gat`.
///
/// Holds the response packet, so the value is borrowed without copying;
/// drop it (or call [`GetResult::release`]) to hand the buffer back.
pub struct GetResult {
    packet: IncomingPacket,
    pub flags: u32,
    pub cas: u64,
}

impl GetResult {
    pub fn value(&self) -> &[u8] {
        self.packet.value()
    }

    /// Copies the value out and releases the buffer.
    pub fn into_vec(self) -> Vec<u8> {
        let value = self.packet.value().to_vec();
        self.release();
        value
    }

    pub fn release(self) {
        self.packet.release();
    }
}

impl fmt::Debug for GetResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GetResult")
            .field("len", &self.value().len())
            .field("flags", &self.flags)
            .field("cas", &self.cas)
            .finish()
    }
}

/// Options for `set`, `add` and `replace`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreOptions {
    /// Opaque client flags stored with the value.
    pub flags: u32,
    /// Only store if the current CAS matches (0 = unconditional).
    pub cas: u64,
    /// Overrides the adapter TTL.
    pub ttl: Option<u32>,
}

/// Options for `increment` and `decrement`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterOptions {
    /// Value to create a missing counter with; `None` leaves it missing.
    pub initial: Option<u64>,
    pub cas: u64,
    pub ttl: Option<u32>,
}

/// Counter value after an increment or decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    pub value: u64,
    pub cas: u64,
}

/// Cache operations against one server.
pub struct ServerAdapter {
    connection: Connection,
    ttl: u32,
    id: String,
}

impl ServerAdapter {
    pub fn new(config: ServerConfig) -> Result<Self> {
        Self::with_pool(config, BufferPool::shared())
    }

    pub fn with_pool(config: ServerConfig, pool: Arc<BufferPool>) -> Result<Self> {
        let id = config.connection.addr();
        let connection = Connection::with_pool(config.connection, pool)?;
        Ok(ServerAdapter {
            connection,
            ttl: config.ttl,
            id,
        })
    }

    pub fn connected(&self) -> bool {
        self.connection.connected()
    }

    pub fn host(&self) -> &str {
        self.connection.host()
    }

    pub fn port(&self) -> u16 {
        self.connection.port()
    }

    pub fn timeout(&self) -> Duration {
        self.connection.timeout()
    }

    /// Default TTL in seconds.
    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    /// `host:port`.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Closes the underlying socket; see [`Connection::destroy`].
    pub async fn destroy(&self) -> bool {
        self.connection.destroy().await
    }

    /// Fetches a value; `None` when the key does not exist.
    pub async fn get(&self, key: &str) -> Result<Option<GetResult>> {
        let key = Key::new(key)?;
        let response = self
            .connection
            .request(OutgoingPacket::new(Opcode::Get).with_key(key.as_bytes()))
            .await?;
        fetched(response, key)
    }

    /// Fetches a value and sets a new TTL in one round trip.
    pub async fn gat(&self, key: &str, ttl: u32) -> Result<Option<GetResult>> {
        let key = Key::new(key)?;
        let extras = ttl.to_be_bytes();
        let response = self
            .connection
            .request(
                OutgoingPacket::new(Opcode::Gat)
                    .with_extras(&extras)
                    .with_key(key.as_bytes()),
            )
            .await?;
        fetched(response, key)
    }

    /// Sets a new TTL; false when the key does not exist.
    pub async fn touch(&self, key: &str, ttl: Option<u32>) -> Result<bool> {
        let key = Key::new(key)?;
        let extras = ttl.unwrap_or(self.ttl).to_be_bytes();
        let response = self
            .connection
            .request(
                OutgoingPacket::new(Opcode::Touch)
                    .with_extras(&extras)
                    .with_key(key.as_bytes()),
            )
            .await?;
        match response.status {
            Status::OK => Ok(true),
            Status::KEY_NOT_FOUND => Ok(false),
            _ => Err(fail(&response, Some(key))),
        }
    }

    /// Stores unconditionally (or on CAS match); returns the new CAS.
    pub async fn set(&self, key: &str, value: &[u8], options: StoreOptions) -> Result<Option<u64>> {
        self.store(Opcode::Set, key, value, options).await
    }

    /// Stores only if the key does not exist yet.
    pub async fn add(&self, key: &str, value: &[u8], options: StoreOptions) -> Result<Option<u64>> {
        self.store(Opcode::Add, key, value, options).await
    }

    /// Stores only if the key already exists.
    pub async fn replace(
        &self,
        key: &str,
        value: &[u8],
        options: StoreOptions,
    ) -> Result<Option<u64>> {
        self.store(Opcode::Replace, key, value, options).await
    }

    async fn store(
        &self,
        opcode: Opcode,
        key: &str,
        value: &[u8],
        options: StoreOptions,
    ) -> Result<Option<u64>> {
        let key = Key::new(key)?;
        let mut extras = [0u8; 8];
        {
            let mut cursor = &mut extras[..];
            cursor.put_u32(options.flags);
            cursor.put_u32(options.ttl.unwrap_or(self.ttl));
        }

        let response = self
            .connection
            .request(
                OutgoingPacket::new(opcode)
                    .with_cas(options.cas)
                    .with_extras(&extras)
                    .with_key(key.as_bytes())
                    .with_value(value),
            )
            .await?;
        match response.status {
            Status::OK => Ok(Some(response.cas)),
            Status::KEY_NOT_FOUND | Status::KEY_EXISTS | Status::ITEM_NOT_STORED => Ok(None),
            _ => Err(fail(&response, Some(key))),
        }
    }

    pub async fn append(&self, key: &str, value: &[u8], cas: u64) -> Result<bool> {
        self.concat(Opcode::Append, key, value, cas).await
    }

    pub async fn prepend(&self, key: &str, value: &[u8], cas: u64) -> Result<bool> {
        self.concat(Opcode::Prepend, key, value, cas).await
    }

    async fn concat(&self, opcode: Opcode, key: &str, value: &[u8], cas: u64) -> Result<bool> {
        let key = Key::new(key)?;
        let response = self
            .connection
            .request(
                OutgoingPacket::new(opcode)
                    .with_cas(cas)
                    .with_key(key.as_bytes())
                    .with_value(value),
            )
            .await?;
        match response.status {
            Status::OK => Ok(true),
            Status::ITEM_NOT_STORED | Status::KEY_EXISTS => Ok(false),
            _ => Err(fail(&response, Some(key))),
        }
    }

    pub async fn increment(
        &self,
        key: &str,
        delta: u64,
        options: CounterOptions,
    ) -> Result<Option<Counter>> {
        self.counter(Opcode::Increment, key, delta, options).await
    }

    /// Decrements a counter; the server clamps at zero.
    pub async fn decrement(
        &self,
        key: &str,
        delta: u64,
        options: CounterOptions,
    ) -> Result<Option<Counter>> {
        self.counter(Opcode::Decrement, key, delta, options).await
    }

    /// **Extras**: `[delta: u64][initial: u64][ttl: u32]`, where the TTL is
    /// [`COUNTER_NO_CREATE`] when no initial value is given.
    async fn counter(
        &self,
        opcode: Opcode,
        key: &str,
        delta: u64,
        options: CounterOptions,
    ) -> Result<Option<Counter>> {
        let key = Key::new(key)?;
        let mut extras = [0u8; 20];
        {
            let mut cursor = &mut extras[..];
            cursor.put_u64(delta);
            cursor.put_u64(options.initial.unwrap_or(0));
            cursor.put_u32(match options.initial {
                Some(_) => options.ttl.unwrap_or(self.ttl),
                None => COUNTER_NO_CREATE,
            });
        }

        let response = self
            .connection
            .request(
                OutgoingPacket::new(opcode)
                    .with_cas(options.cas)
                    .with_extras(&extras)
                    .with_key(key.as_bytes()),
            )
            .await?;
        match response.status {
            Status::OK => {
                let value = response
                    .value()
                    .get(..8)
                    .and_then(|bytes| <[u8; 8]>::try_from(bytes).ok())
                    .map(u64::from_be_bytes)
                    .ok_or(Error::MalformedResponse {
                        opcode,
                        reason: "counter value shorter than 8 bytes",
                    })?;
                Ok(Some(Counter {
                    value,
                    cas: response.cas,
                }))
            }
            Status::KEY_NOT_FOUND | Status::KEY_EXISTS => Ok(None),
            _ => Err(fail(&response, Some(key))),
        }
    }

    /// Deletes a key; false when it does not exist or the CAS differs.
    pub async fn delete(&self, key: &str, cas: u64) -> Result<bool> {
        let key = Key::new(key)?;
        let response = self
            .connection
            .request(
                OutgoingPacket::new(Opcode::Delete)
                    .with_cas(cas)
                    .with_key(key.as_bytes()),
            )
            .await?;
        match response.status {
            Status::OK => Ok(true),
            Status::KEY_NOT_FOUND | Status::KEY_EXISTS => Ok(false),
            _ => Err(fail(&response, Some(key))),
        }
    }

    /// Invalidates all items, after `ttl` seconds when non-zero.
    pub async fn flush(&self, ttl: u32) -> Result<()> {
        let extras = ttl.to_be_bytes();
        let mut packet = OutgoingPacket::new(Opcode::Flush);
        if ttl > 0 {
            packet = packet.with_extras(&extras);
        }
        self.simple(packet).await
    }

    pub async fn noop(&self) -> Result<()> {
        self.simple(OutgoingPacket::new(Opcode::Noop)).await
    }

    /// Asks the server to close the connection after replying.
    pub async fn quit(&self) -> Result<()> {
        self.simple(OutgoingPacket::new(Opcode::Quit)).await
    }

    async fn simple(&self, packet: OutgoingPacket<'_>) -> Result<()> {
        let response = self.connection.request(packet).await?;
        match response.status {
            Status::OK => Ok(()),
            _ => Err(fail(&response, None)),
        }
    }

    pub async fn version(&self) -> Result<String> {
        let response = self
            .connection
            .request(OutgoingPacket::new(Opcode::Version))
            .await?;
        match response.status {
            Status::OK => Ok(String::from_utf8_lossy(response.value()).into_owned()),
            _ => Err(fail(&response, None)),
        }
    }

    /// Collects the server's general statistics.
    pub async fn stats(&self) -> Result<Stats> {
        let responses = self.connection.send(OutgoingPacket::new(Opcode::Stat)).await?;
        let mut stats = Stats::new();
        for packet in &responses {
            if packet.status != Status::OK {
                return Err(fail(packet, None));
            }
            if packet.key().is_empty() {
                continue;
            }
            let name = String::from_utf8_lossy(packet.key());
            let raw = String::from_utf8_lossy(packet.value());
            let value = typed_stat(&name, &raw);
            stats.insert(name.into_owned(), value);
        }
        debug!(server = %self.id, count = stats.len(), "stats collected");
        Ok(stats)
    }
}

impl fmt::Debug for ServerAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerAdapter")
            .field("id", &self.id)
            .field("ttl", &self.ttl)
            .field("connected", &self.connected())
            .finish()
    }
}

fn fetched(response: IncomingPacket, key: Key<'_>) -> Result<Option<GetResult>> {
    match response.status {
        Status::OK => {
            let flags = response
                .extras()
                .get(..4)
                .and_then(|bytes| <[u8; 4]>::try_from(bytes).ok())
                .map_or(0, u32::from_be_bytes);
            let cas = response.cas;
            Ok(Some(GetResult {
                packet: response,
                flags,
                cas,
            }))
        }
        Status::KEY_NOT_FOUND => Ok(None),
        _ => Err(fail(&response, Some(key))),
    }
}

/// Builds the error for an unexpected status.
///
/// The message is the response value, which is where the server puts its
/// error text.
fn fail(packet: &IncomingPacket, key: Option<Key<'_>>) -> Error {
    let message = String::from_utf8_lossy(packet.value());
    Error::Status {
        status: packet.status,
        message: if message.is_empty() {
            "Unknown Error".to_string()
        } else {
            message.into_owned()
        },
        key: key.map(|key| key.as_str().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_configuration() {
        let err = ServerAdapter::new(ServerConfig::new("", 11211)).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn exposes_connection_settings() {
        let config = ServerConfig::new("cache.local", 4242)
            .with_ttl(30)
            .with_timeout(Duration::from_millis(200));
        let adapter = ServerAdapter::new(config).expect("adapter");
        assert_eq!(adapter.id(), "cache.local:4242");
        assert_eq!(adapter.host(), "cache.local");
        assert_eq!(adapter.port(), 4242);
        assert_eq!(adapter.ttl(), 30);
        assert_eq!(adapter.timeout(), Duration::from_millis(200));
        assert!(!adapter.connected());
    }

    #[tokio::test]
    async fn long_keys_fail_before_connecting() {
        // Nothing listens on port 1; the key check must come first.
        let adapter = ServerAdapter::new(ServerConfig::new("127.0.0.1", 1)).expect("adapter");
        let key = "x".repeat(251);
        match adapter.get(&key).await {
            Err(Error::KeyTooLong { len }) => assert_eq!(len, 251),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert!(!adapter.connected());
    }
}
