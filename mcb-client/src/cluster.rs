//! # Cluster Adapter
//!
//! Purpose: Spread keys over several servers and fan out the commands that
//! concern every server.
//!
//! ## Design Principles
//! 1. **Stable Placement**: A key always maps to the same server for a given
//!    server list (`hash = hash * 31 + byte`, modulo the server count).
//! 2. **Uniform TTL**: All servers must share one default TTL, so a write's
//!    lifetime does not depend on where its key lands.
//! 3. **Concurrent Fan-out**: `flush`, `noop`, `quit`, `version` and `stats`
//!    run on all servers at once and fail if any server fails.

use std::collections::BTreeMap;

use futures::future::try_join_all;

use mcb_common::{Error, Result};

use crate::config::ClusterConfig;
use crate::server::{Counter, CounterOptions, GetResult, ServerAdapter, StoreOptions};
use crate::stats::Stats;

/// Key-sharded view over a fixed list of servers.
#[derive(Debug)]
pub struct ClusterAdapter {
    servers: Vec<ServerAdapter>,
    ttl: u32,
}

impl ClusterAdapter {
    /// Wraps existing adapters.
    ///
    /// # Errors
    /// `InvalidConfig` when the list is empty or the TTLs differ.
    pub fn new(servers: Vec<ServerAdapter>) -> Result<Self> {
        let ttl = match servers.first() {
            Some(server) => server.ttl(),
            None => return Err(Error::InvalidConfig("No hosts configured".to_string())),
        };
        if let Some(server) = servers.iter().find(|server| server.ttl() != ttl) {
            return Err(Error::InvalidConfig(format!(
                "TTL Mismatch ({} != {})",
                server.ttl(),
                ttl
            )));
        }
        Ok(ClusterAdapter { servers, ttl })
    }

    pub fn from_config(config: &ClusterConfig) -> Result<Self> {
        let servers = config
            .servers()
            .into_iter()
            .map(ServerAdapter::new)
            .collect::<Result<Vec<_>>>()?;
        Self::new(servers)
    }

    /// Builds a cluster from the `MEMCACHED_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_config(&ClusterConfig::from_env()?)
    }

    pub fn servers(&self) -> &[ServerAdapter] {
        &self.servers
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    /// The server responsible for `key`.
    pub fn server(&self, key: &str) -> &ServerAdapter {
        if let [only] = self.servers.as_slice() {
            return only;
        }
        &self.servers[key_hash(key) as usize % self.servers.len()]
    }

    pub async fn get(&self, key: &str) -> Result<Option<GetResult>> {
        self.server(key).get(key).await
    }

    pub async fn gat(&self, key: &str, ttl: u32) -> Result<Option<GetResult>> {
        self.server(key).gat(key, ttl).await
    }

    pub async fn touch(&self, key: &str, ttl: Option<u32>) -> Result<bool> {
        self.server(key).touch(key, ttl).await
    }

    pub async fn set(&self, key: &str, value: &[u8], options: StoreOptions) -> Result<Option<u64>> {
        self.server(key).set(key, value, options).await
    }

    pub async fn add(&self, key: &str, value: &[u8], options: StoreOptions) -> Result<Option<u64>> {
        self.server(key).add(key, value, options).await
    }

    pub async fn replace(
        &self,
        key: &str,
        value: &[u8],
        options: StoreOptions,
    ) -> Result<Option<u64>> {
        self.server(key).replace(key, value, options).await
    }

    pub async fn append(&self, key: &str, value: &[u8], cas: u64) -> Result<bool> {
        self.server(key).append(key, value, cas).await
    }

    pub async fn prepend(&self, key: &str, value: &[u8], cas: u64) -> Result<bool> {
        self.server(key).prepend(key, value, cas).await
    }

    pub async fn increment(
        &self,
        key: &str,
        delta: u64,
        options: CounterOptions,
    ) -> Result<Option<Counter>> {
        self.server(key).increment(key, delta, options).await
    }

    pub async fn decrement(
        &self,
        key: &str,
        delta: u64,
        options: CounterOptions,
    ) -> Result<Option<Counter>> {
        self.server(key).decrement(key, delta, options).await
    }

    pub async fn delete(&self, key: &str, cas: u64) -> Result<bool> {
        self.server(key).delete(key, cas).await
    }

    pub async fn flush(&self, ttl: u32) -> Result<()> {
        try_join_all(self.servers.iter().map(|server| server.flush(ttl))).await?;
        Ok(())
    }

    pub async fn noop(&self) -> Result<()> {
        try_join_all(self.servers.iter().map(|server| server.noop())).await?;
        Ok(())
    }

    pub async fn quit(&self) -> Result<()> {
        try_join_all(self.servers.iter().map(|server| server.quit())).await?;
        Ok(())
    }

    /// Version string of every server, keyed by server id.
    pub async fn version(&self) -> Result<BTreeMap<String, String>> {
        let versions = try_join_all(self.servers.iter().map(|server| server.version())).await?;
        Ok(self.keyed(versions))
    }

    /// Stats of every server, keyed by server id.
    pub async fn stats(&self) -> Result<BTreeMap<String, Stats>> {
        let stats = try_join_all(self.servers.iter().map(|server| server.stats())).await?;
        Ok(self.keyed(stats))
    }

    fn keyed<T>(&self, values: Vec<T>) -> BTreeMap<String, T> {
        self.servers
            .iter()
            .map(|server| server.id().to_string())
            .zip(values)
            .collect()
    }
}

/// Java-style string hash over the key's UTF-8 bytes.
///
/// Wraps at `u32` and works on bytes rather than UTF-16 units, so placement
/// differs from clients that hash with unbounded floating-point arithmetic
/// (long or non-ASCII keys can land on another server).
pub fn key_hash(key: &str) -> u32 {
    key.bytes()
        .fold(0u32, |hash, byte| hash.wrapping_mul(31).wrapping_add(byte as u32))
}
