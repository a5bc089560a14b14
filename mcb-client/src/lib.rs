//! # Memcached Binary Client
//!
//! Purpose: Talk to memcached servers over the binary protocol, pipelining
//! any number of concurrent requests on one persistent connection per server.
//!
//! ## Design Principles
//! 1. **Multiplexing**: Replies are matched to requests by sequence number, so
//!    callers never wait behind each other's round trips.
//! 2. **Buffer Reuse**: Response bodies live in pooled buffers that go back
//!    to the pool when the packet is dropped.
//! 3. **Layering**: Encoder and decoder know bytes, the connection knows
//!    sequences, the adapters know cache semantics.
//! 4. **Explicit Absence**: Misses come back as `None`/`false`, failures as
//!    [`Error`].
//!
//! ## Example
//!
//! ```no_run
//! use mcb_client::{ServerAdapter, ServerConfig, StoreOptions};
//!
//! # async fn demo() -> mcb_client::Result<()> {
//! let server = ServerAdapter::new(ServerConfig::new("127.0.0.1", 11211))?;
//! server.set("greeting", b"hello", StoreOptions::default()).await?;
//! if let Some(hit) = server.get("greeting").await? {
//!     assert_eq!(hit.value(), b"hello");
//! }
//! # Ok(())
//! # }
//! ```

pub mod buffers;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod decode;
pub mod encode;
pub mod server;
pub mod stats;

pub use buffers::{BufferPool, PooledBuf, BUFFER_SIZE, POOL_SIZE};
pub use cluster::{key_hash, ClusterAdapter};
pub use config::{parse_hosts, ClusterConfig, ConnectionConfig, HostSpec, ServerConfig};
pub use connection::Connection;
pub use decode::{Decoded, Decoder, IncomingPacket};
pub use encode::{Encoder, OutgoingPacket};
pub use server::{Counter, CounterOptions, GetResult, ServerAdapter, StoreOptions};
pub use stats::{StatValue, Stats};

pub use mcb_common::{Error, Key, Opcode, Result, Status};
