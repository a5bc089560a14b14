//! # Client Benchmark Harness
//!
//! Purpose: Drive a live memcached server through one multiplexed connection
//! and report request throughput and buffer-pool reuse.
//!
//! ## Design Principles
//! 1. **Deterministic Workload**: Keys are picked by a fixed-seed PRNG.
//! 2. **Allocation Control**: Keys and values are built before timing starts.
//! 3. **Pipelining**: `workers` tasks share one connection, so the numbers
//!    measure request multiplexing rather than connection setup.
//!
//! Usage: `mcb-bench [workers] [ops_per_worker] [key_count] [value_size]`.
//! The server comes from `MEMCACHED_HOSTS` (first entry), default
//! `127.0.0.1:11211`.

use std::env;
use std::hint::black_box;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mcb_client::{BufferPool, ClusterConfig, ServerAdapter, ServerConfig, StoreOptions};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_WORKERS: usize = 32;
const DEFAULT_OPS_PER_WORKER: usize = 10_000;
const DEFAULT_KEY_COUNT: usize = 1 << 10;
const DEFAULT_VALUE_SIZE: usize = 128;

struct BenchConfig {
    server: ServerConfig,
    workers: usize,
    ops_per_worker: usize,
    key_count: usize,
    key_mask: usize,
    value_size: usize,
}

impl BenchConfig {
    fn from_env_and_args() -> Result<Self> {
        let cluster = ClusterConfig::from_env().context("reading MEMCACHED_* variables")?;
        let server = match cluster.servers().into_iter().next() {
            Some(server) => server,
            None => ServerConfig::new("127.0.0.1", 11211).with_timeout(cluster.timeout),
        };

        let mut args = env::args().skip(1);
        let workers = parse_usize(args.next(), DEFAULT_WORKERS).max(1);
        let ops_per_worker = parse_usize(args.next(), DEFAULT_OPS_PER_WORKER);
        let key_count = parse_usize(args.next(), DEFAULT_KEY_COUNT)
            .max(1)
            .next_power_of_two();
        let value_size = parse_usize(args.next(), DEFAULT_VALUE_SIZE);

        Ok(BenchConfig {
            server,
            workers,
            ops_per_worker,
            key_count,
            key_mask: key_count - 1,
            value_size,
        })
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

/// XorShift keeps the key sequence reproducible between runs.
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    #[inline]
    fn next_index(&mut self, mask: usize) -> usize {
        (self.next_u64() as usize) & mask
    }
}

fn report(label: &str, ops: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let ops_per_sec = (ops as f64) / secs;
    let micros_per_op = (secs * 1e6) / (ops as f64);
    println!("{label}: {ops} ops in {secs:.3}s ({ops_per_sec:.0} ops/s, {micros_per_op:.1} us/op)");
}

#[derive(Clone, Copy)]
enum Workload {
    Set,
    Get,
}

async fn run_phase(
    server: &Arc<ServerAdapter>,
    keys: &Arc<Vec<String>>,
    value: &Arc<Vec<u8>>,
    config: &BenchConfig,
    workload: Workload,
) -> Result<usize> {
    let tasks = (0..config.workers).map(|worker| {
        let server = Arc::clone(server);
        let keys = Arc::clone(keys);
        let value = Arc::clone(value);
        let (ops, mask) = (config.ops_per_worker, config.key_mask);
        tokio::spawn(async move {
            let mut rng = XorShift64::new(0x1234_5678_9ABC_DEF0 ^ worker as u64);
            let mut hits = 0usize;
            for _ in 0..ops {
                let key = &keys[rng.next_index(mask)];
                match workload {
                    Workload::Set => {
                        server.set(key, &value, StoreOptions::default()).await?;
                    }
                    Workload::Get => {
                        if let Some(hit) = server.get(key).await? {
                            black_box(hit.value());
                            hits += 1;
                        }
                    }
                }
            }
            Ok::<usize, mcb_client::Error>(hits)
        })
    });

    let mut hits = 0;
    for outcome in futures::future::join_all(tasks).await {
        hits += outcome.context("worker panicked")??;
    }
    Ok(hits)
}

async fn run() -> Result<()> {
    let config = BenchConfig::from_env_and_args()?;
    let pool = BufferPool::new();
    let server = Arc::new(ServerAdapter::with_pool(config.server.clone(), Arc::clone(&pool))?);

    let keys: Arc<Vec<String>> =
        Arc::new((0..config.key_count).map(|idx| format!("bench:{idx:08x}")).collect());
    let value: Arc<Vec<u8>> = Arc::new((0..config.value_size).map(|idx| idx as u8).collect());

    let version = server
        .version()
        .await
        .with_context(|| format!("contacting {}", server.id()))?;
    info!(server = %server.id(), %version, "connected");

    println!(
        "server={} workers={} ops/worker={} keys={} value_size={}",
        server.id(),
        config.workers,
        config.ops_per_worker,
        config.key_count,
        config.value_size
    );

    for key in keys.iter() {
        server.set(key, &value, StoreOptions::default()).await?;
    }

    let total = config.workers * config.ops_per_worker;

    let start = Instant::now();
    run_phase(&server, &keys, &value, &config, Workload::Set).await?;
    report("SET", total, start.elapsed());

    let start = Instant::now();
    let hits = run_phase(&server, &keys, &value, &config, Workload::Get).await?;
    report("GET", total, start.elapsed());

    println!(
        "hits={}/{} pool: available={} recycles={}",
        hits,
        total,
        pool.available(),
        pool.recycles()
    );

    server.destroy().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    if let Err(err) = run().await {
        eprintln!("mcb-bench failed: {err:#}");
        std::process::exit(1);
    }
}
