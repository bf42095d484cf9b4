//! Relay configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/f1-relay/relay.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `upstream.url`
//!
//! Everything else has a default.  TTL overrides live in `[cache.ttl]`
//! keyed by cache tag name; unknown tag names are rejected.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config types (deserialized from TOML)
// ---------------------------------------------------------------------------

/// Top-level relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub schema_version: u32,
    pub upstream: UpstreamConfig,
    pub cache: CacheConfig,
    pub hub: HubConfig,
    pub health: HealthConfig,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Base HTTP URL of the upstream hub, e.g. `https://livetiming.example.com/signalr`.
    pub url: String,
    /// Hub name used in the connection data JSON.
    pub hub_name: String,
    /// First reconnect delay; doubles per attempt, capped at 30 s.
    pub reconnect_base: Duration,
    /// Terminal failure after this many consecutive attempts.
    pub reconnect_max_attempts: u32,
    /// Bound on each negotiate/start HTTP call.
    pub connect_timeout: Duration,
    /// Overrides the keep-alive timeout the upstream advertises.
    pub keep_alive_override: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgo {
    Gzip,
    Lz4,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// L2 endpoint, e.g. `redis://127.0.0.1:6379`.  None = L1 only.
    pub l2_url: Option<String>,
    /// Cluster-mode endpoint list semantics for the L2 URL.
    pub cluster: bool,
    /// Bound on L1 entries before LRU eviction.
    pub l1_max_entries: usize,
    /// Serialized values above this many bytes are compressed for L2.
    pub compression_threshold: usize,
    pub compression_algo: CompressionAlgo,
    /// Prepended to every L2 key, e.g. `f1:`.
    pub global_prefix: String,
    /// Per-tag TTL overrides in seconds, keyed by tag name.
    pub ttl_overrides: HashMap<String, u64>,
    /// Cache operations slower than this log a warning.  None = disabled.
    pub slow_op_warn: Option<Duration>,
    /// Keep serving from L1 when L2 is down (failover mode).
    pub fallback_to_memory: bool,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Bind address for the push socket + health endpoints.
    pub bind: String,
    pub heartbeat_interval: Duration,
    pub max_connections_per_ip: usize,
    /// Per-connection inbound event budget per rolling minute.
    pub max_events_per_minute: u32,
    /// Origins accepted in the production profile.
    pub allowed_origins: Vec<String>,
    /// Enables origin and user-agent admission checks.
    pub production: bool,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Interval between L2 health-check pings.
    pub check_interval: Duration,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    upstream: Option<RawUpstreamConfig>,
    cache: Option<RawCacheConfig>,
    hub: Option<RawHubConfig>,
    health: Option<RawHealthConfig>,
}

#[derive(Debug, Deserialize)]
struct RawUpstreamConfig {
    url: Option<String>,
    hub_name: Option<String>,
    reconnect_base_ms: Option<u64>,
    reconnect_max_attempts: Option<u32>,
    connect_timeout_ms: Option<u64>,
    keep_alive_override_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawCacheConfig {
    l2_url: Option<String>,
    cluster: Option<bool>,
    l1_max_entries: Option<usize>,
    compression_threshold: Option<usize>,
    compression_algo: Option<String>,
    global_prefix: Option<String>,
    ttl: Option<HashMap<String, u64>>,
    slow_op_warn_ms: Option<u64>,
    fallback_to_memory: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawHubConfig {
    bind: Option<String>,
    heartbeat_interval_ms: Option<u64>,
    max_connections_per_ip: Option<usize>,
    max_events_per_minute: Option<u32>,
    allowed_origins: Option<Vec<String>>,
    production: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawHealthConfig {
    check_interval_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load relay config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<RelayConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load relay config from the default path `/etc/f1-relay/relay.toml`.
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/f1-relay/relay.toml"))
}

/// Load relay config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<RelayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let raw_upstream = raw
        .upstream
        .ok_or_else(|| ConfigError::MissingField("upstream".to_owned()))?;
    let url = raw_upstream
        .url
        .ok_or_else(|| ConfigError::MissingField("upstream.url".to_owned()))?;
    let upstream = UpstreamConfig {
        url,
        hub_name: raw_upstream.hub_name.unwrap_or_else(|| "Streaming".to_owned()),
        reconnect_base: Duration::from_millis(raw_upstream.reconnect_base_ms.unwrap_or(1_000)),
        reconnect_max_attempts: raw_upstream.reconnect_max_attempts.unwrap_or(10),
        connect_timeout: Duration::from_millis(raw_upstream.connect_timeout_ms.unwrap_or(10_000)),
        keep_alive_override: raw_upstream.keep_alive_override_ms.map(Duration::from_millis),
    };

    let cache = match raw.cache {
        Some(c) => {
            let algo = match c.compression_algo.as_deref() {
                None | Some("gzip") => CompressionAlgo::Gzip,
                Some("lz4") => CompressionAlgo::Lz4,
                Some(other) => {
                    return Err(ConfigError::InvalidValue(format!(
                        "cache.compression_algo must be \"gzip\" or \"lz4\", got \"{other}\""
                    )));
                }
            };
            let ttl_overrides = c.ttl.unwrap_or_default();
            for tag in ttl_overrides.keys() {
                if !KNOWN_TAGS.contains(&tag.as_str()) {
                    return Err(ConfigError::InvalidValue(format!(
                        "cache.ttl contains unknown tag \"{tag}\""
                    )));
                }
            }
            CacheConfig {
                l2_url: c.l2_url,
                cluster: c.cluster.unwrap_or(false),
                l1_max_entries: c.l1_max_entries.unwrap_or(10_000),
                compression_threshold: c.compression_threshold.unwrap_or(8 * 1024),
                compression_algo: algo,
                global_prefix: c.global_prefix.unwrap_or_else(|| "f1:".to_owned()),
                ttl_overrides,
                slow_op_warn: c.slow_op_warn_ms.map(Duration::from_millis),
                fallback_to_memory: c.fallback_to_memory.unwrap_or(true),
            }
        }
        None => CacheConfig {
            l2_url: None,
            cluster: false,
            l1_max_entries: 10_000,
            compression_threshold: 8 * 1024,
            compression_algo: CompressionAlgo::Gzip,
            global_prefix: "f1:".to_owned(),
            ttl_overrides: HashMap::new(),
            slow_op_warn: None,
            fallback_to_memory: true,
        },
    };

    let hub = match raw.hub {
        Some(h) => HubConfig {
            bind: h.bind.unwrap_or_else(|| "0.0.0.0:8090".to_owned()),
            heartbeat_interval: Duration::from_millis(h.heartbeat_interval_ms.unwrap_or(30_000)),
            max_connections_per_ip: h.max_connections_per_ip.unwrap_or(5),
            max_events_per_minute: h.max_events_per_minute.unwrap_or(120),
            allowed_origins: h.allowed_origins.unwrap_or_default(),
            production: h.production.unwrap_or(false),
        },
        None => HubConfig {
            bind: "0.0.0.0:8090".to_owned(),
            heartbeat_interval: Duration::from_millis(30_000),
            max_connections_per_ip: 5,
            max_events_per_minute: 120,
            allowed_origins: Vec::new(),
            production: false,
        },
    };

    let health = HealthConfig {
        check_interval: Duration::from_millis(
            raw.health.and_then(|h| h.check_interval_ms).unwrap_or(15_000),
        ),
    };

    Ok(RelayConfig {
        schema_version,
        upstream,
        cache,
        hub,
        health,
    })
}

/// Tag names accepted in `[cache.ttl]`.
const KNOWN_TAGS: [&str; 10] = [
    "session",
    "drivers",
    "timing",
    "weather",
    "track",
    "position",
    "telemetry",
    "rate_limit",
    "client_session",
    "recovery",
];

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
