//! # Client Configuration
//!
//! Plain structs with defaults, loadable through serde or from the
//! `MEMCACHED_*` environment variables.
//!
//! Timeouts are serialized as whole milliseconds (`timeout_ms`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use mcb_common::{Error, Result};

/// Default memcached port.
pub const DEFAULT_PORT: u16 = 11211;

/// Default connect/response timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Where and how to reach a single server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Server host name or IP address.
    pub host: String,
    /// Server TCP port.
    pub port: u16,
    /// Applies to connection establishment and to each request's response.
    #[serde(rename = "timeout_ms", with = "millis")]
    pub timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ConnectionConfig {
    /// Config for `host:port` with the default timeout.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ConnectionConfig {
            host: host.into(),
            port,
            ..ConnectionConfig::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Rejects values that could never produce a working connection.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::InvalidConfig("No host name specified".to_string()));
        }
        if self.port == 0 {
            return Err(Error::InvalidConfig(format!("Invalid port {}", self.port)));
        }
        if self.timeout.is_zero() {
            return Err(Error::InvalidConfig("Timeout must be positive".to_string()));
        }
        Ok(())
    }

    /// `host:port`, also used as the server id.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Connection settings plus the default TTL applied by the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    #[serde(flatten)]
    pub connection: ConnectionConfig,
    /// Default time-to-live in seconds (0 = never expires).
    pub ttl: u32,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ServerConfig {
            connection: ConnectionConfig::new(host, port),
            ttl: 0,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connection.timeout = timeout;
        self
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }
}

/// One `host[:port]` entry of a cluster definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpec {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Settings for a set of servers sharing one timeout and one TTL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub hosts: Vec<HostSpec>,
    #[serde(rename = "timeout_ms", with = "millis")]
    pub timeout: Duration,
    pub ttl: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            hosts: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            ttl: 0,
        }
    }
}

impl ClusterConfig {
    /// Builds a config from a `host[:port],host[:port]` list.
    pub fn from_hosts(hosts: &str) -> Result<Self> {
        Ok(ClusterConfig {
            hosts: parse_hosts(hosts)?,
            ..ClusterConfig::default()
        })
    }

    /// Reads `MEMCACHED_HOSTS`, `MEMCACHED_TTL` and `MEMCACHED_TIMEOUT`
    /// (milliseconds) from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`ClusterConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = ClusterConfig::default();
        if let Some(hosts) = lookup("MEMCACHED_HOSTS") {
            config.hosts = parse_hosts(&hosts)?;
        }
        if let Some(ttl) = lookup("MEMCACHED_TTL") {
            config.ttl = parse_number("MEMCACHED_TTL", &ttl)?;
        }
        if let Some(timeout) = lookup("MEMCACHED_TIMEOUT") {
            config.timeout = Duration::from_millis(parse_number("MEMCACHED_TIMEOUT", &timeout)?);
        }
        Ok(config)
    }

    /// Expands to one `ServerConfig` per host.
    pub fn servers(&self) -> Vec<ServerConfig> {
        self.hosts
            .iter()
            .map(|spec| {
                ServerConfig::new(spec.host.clone(), spec.port)
                    .with_timeout(self.timeout)
                    .with_ttl(self.ttl)
            })
            .collect()
    }
}

/// Parses `host[:port],host[:port]`; the port defaults to 11211.
///
/// Blank entries are skipped.
pub fn parse_hosts(hosts: &str) -> Result<Vec<HostSpec>> {
    let mut result = Vec::new();
    for part in hosts.split(',').map(str::trim).filter(|part| !part.is_empty()) {
        let spec = match part.rsplit_once(':') {
            Some((host, port)) => HostSpec {
                host: host.to_string(),
                port: port
                    .parse()
                    .map_err(|_| Error::InvalidConfig(format!("Invalid port in \"{}\"", part)))?,
            },
            None => HostSpec {
                host: part.to_string(),
                port: DEFAULT_PORT,
            },
        };
        result.push(spec);
    }
    Ok(result)
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("Invalid {} value \"{}\"", name, value)))
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
