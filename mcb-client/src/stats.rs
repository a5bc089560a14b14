//! # Server Statistics
//!
//! `STAT` replies are a list of string key/value pairs. Well-known counters
//! are turned into integers, flags into booleans and `rusage_*` times into
//! microseconds; everything else passes through as text.

use std::collections::BTreeMap;

use serde::Serialize;

/// Stats of one server, keyed by stat name.
pub type Stats = BTreeMap<String, StatValue>;

/// A typed stat value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum StatValue {
    /// Counters and gauges.
    Integer(u64),
    /// `0`/`1` flags.
    Bool(bool),
    /// `seconds.micros` times converted to microseconds.
    Micros(u64),
    /// Anything not known to be numeric, or that failed to parse.
    Text(String),
}

impl StatValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            StatValue::Integer(value) | StatValue::Micros(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StatValue::Text(text) => Some(text),
            _ => None,
        }
    }
}

const INTEGER_STATS: &[&str] = &[
    "auth_cmds", "auth_errors", "bytes", "bytes_read", "bytes_written", "cas_badval", "cas_hits",
    "cas_misses", "cmd_flush", "cmd_get", "cmd_set", "cmd_touch", "conn_yields",
    "connection_structures", "crawler_items_checked", "crawler_reclaimed", "curr_connections",
    "curr_items", "decr_hits", "decr_misses", "delete_hits", "delete_misses", "direct_reclaims",
    "evicted_active", "evicted_unfetched", "evictions", "expired_unfetched", "get_expired",
    "get_flushed", "get_hits", "get_misses", "hash_bytes", "hash_power_level", "idle_kicks",
    "incr_hits", "incr_misses", "limit_maxbytes", "listen_disabled_num", "log_watcher_sent",
    "log_watcher_skipped", "log_watchers", "log_worker_dropped", "log_worker_written",
    "lru_crawler_running", "lru_crawler_starts", "lru_maintainer_juggles", "lrutail_reflocked",
    "malloc_fails", "max_connections", "moves_to_cold", "moves_to_warm", "moves_within_lru", "pid",
    "pointer_size", "read_buf_bytes", "read_buf_bytes_free", "read_buf_count", "read_buf_oom",
    "reclaimed", "rejected_connections", "reserved_fds", "response_obj_bytes",
    "response_obj_count", "response_obj_oom", "round_robin_fallback", "slab_global_page_pool",
    "slab_reassign_busy_deletes", "slab_reassign_busy_items", "slab_reassign_chunk_rescues",
    "slab_reassign_evictions_nomem", "slab_reassign_inline_reclaim", "slab_reassign_rescues",
    "slabs_moved", "store_no_memory", "store_too_large", "threads", "time",
    "time_in_listen_disabled_us", "total_connections", "total_items", "touch_hits",
    "touch_misses", "unexpected_napi_ids", "uptime",
];

const BOOL_STATS: &[&str] = &["accepting_conns", "hash_is_expanding", "slab_reassign_running"];

const MICROS_STATS: &[&str] = &["rusage_system", "rusage_user"];

/// Types one raw stat according to its name.
pub fn typed_stat(name: &str, raw: &str) -> StatValue {
    let parsed = if INTEGER_STATS.contains(&name) {
        raw.parse().ok().map(StatValue::Integer)
    } else if BOOL_STATS.contains(&name) {
        raw.parse::<u64>().ok().map(|flag| StatValue::Bool(flag != 0))
    } else if MICROS_STATS.contains(&name) {
        parse_micros(raw).map(StatValue::Micros)
    } else {
        None
    };
    parsed.unwrap_or_else(|| StatValue::Text(raw.to_string()))
}

// "12.345" -> 12_345_000
fn parse_micros(raw: &str) -> Option<u64> {
    let (seconds, fraction) = raw.split_once('.').unwrap_or((raw, ""));
    if fraction.len() > 6 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let seconds: u64 = seconds.parse().ok()?;
    let mut micros = 0u64;
    for position in 0..6 {
        let digit = fraction.as_bytes().get(position).map_or(0, |b| (b - b'0') as u64);
        micros = micros * 10 + digit;
    }
    seconds.checked_mul(1_000_000)?.checked_add(micros)
}
