//! Two-tier cache.
//!
//! [`CacheTier`] fronts an in-process L1 ([`l1::MemoryStore`]) and an
//! optional remote L2 ([`l2::L2Store`]).  Writes go through L1
//! unconditionally and to L2 best-effort; the first L2 fault raises the
//! failover flag and every later L2 call is short-circuited until a
//! health-check ping succeeds.  Get/Set never surface L2 faults to
//! callers; they degrade to memory-only and record the error.

pub mod l1;
pub mod l2;

use crate::config::{CacheConfig, CompressionAlgo};
use f1_protocol::Domain;
use l1::MemoryStore;
use l2::{L2Error, L2Store};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// CacheTag
// ---------------------------------------------------------------------------

/// The fixed set of key spaces.  Tag-prefixed keys make "flush tag"
/// proportional to the tag's size, not the whole store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTag {
    Session,
    Drivers,
    Timing,
    Weather,
    Track,
    Position,
    Telemetry,
    RateLimit,
    ClientSession,
    Recovery,
}

impl CacheTag {
    pub const ALL: [CacheTag; 10] = [
        CacheTag::Session,
        CacheTag::Drivers,
        CacheTag::Timing,
        CacheTag::Weather,
        CacheTag::Track,
        CacheTag::Position,
        CacheTag::Telemetry,
        CacheTag::RateLimit,
        CacheTag::ClientSession,
        CacheTag::Recovery,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CacheTag::Session => "session",
            CacheTag::Drivers => "drivers",
            CacheTag::Timing => "timing",
            CacheTag::Weather => "weather",
            CacheTag::Track => "track",
            CacheTag::Position => "position",
            CacheTag::Telemetry => "telemetry",
            CacheTag::RateLimit => "rate_limit",
            CacheTag::ClientSession => "client_session",
            CacheTag::Recovery => "recovery",
        }
    }

    /// Default TTL per tag, in seconds.
    pub fn default_ttl(self) -> Duration {
        let secs = match self {
            CacheTag::Session => 1800,
            CacheTag::Drivers => 600,
            CacheTag::Timing => 60,
            CacheTag::Weather => 120,
            CacheTag::Track => 30,
            CacheTag::Position => 10,
            CacheTag::Telemetry => 5,
            CacheTag::RateLimit => 60,
            CacheTag::ClientSession | CacheTag::Recovery => 3600,
        };
        Duration::from_secs(secs)
    }

    /// The tag holding a request/recovery domain's current view.
    pub fn for_domain(domain: Domain) -> CacheTag {
        match domain {
            Domain::Session => CacheTag::Session,
            Domain::Drivers => CacheTag::Drivers,
            Domain::Timing => CacheTag::Timing,
            Domain::Weather => CacheTag::Weather,
            Domain::Track => CacheTag::Track,
            Domain::Position => CacheTag::Position,
        }
    }
}

// ---------------------------------------------------------------------------
// Options and statistics
// ---------------------------------------------------------------------------

/// Per-write options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Skip L2 entirely (e.g. client-session records).
    pub memory_only: bool,
    /// Override the tag TTL for this entry.
    pub ttl: Option<Duration>,
}

#[derive(Debug, Default)]
struct Counters {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    errors: AtomicU64,
    failovers: AtomicU64,
    total_ops: AtomicU64,
}

/// Point-in-time statistics view.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub errors: u64,
    pub failovers: u64,
    pub total_ops: u64,
    /// `(l1_hits + l2_hits) / total_ops`; 0 when no operations ran.
    pub hit_rate: f64,
}

// ---------------------------------------------------------------------------
// CacheTier
// ---------------------------------------------------------------------------

pub struct CacheTier {
    l1: MemoryStore,
    l2: Option<Arc<dyn L2Store>>,
    failover: AtomicBool,
    fallback_to_memory: bool,
    global_prefix: String,
    ttls: HashMap<&'static str, Duration>,
    compression_threshold: usize,
    compression_algo: CompressionAlgo,
    slow_op_warn: Option<Duration>,
    counters: Counters,
}

impl CacheTier {
    /// Build the tier from config plus an optional connected L2 handle.
    pub fn new(cfg: &CacheConfig, l2: Option<Arc<dyn L2Store>>) -> Self {
        let mut ttls = HashMap::new();
        for tag in CacheTag::ALL {
            let ttl = cfg
                .ttl_overrides
                .get(tag.as_str())
                .map_or(tag.default_ttl(), |&secs| Duration::from_secs(secs));
            ttls.insert(tag.as_str(), ttl);
        }
        CacheTier {
            l1: MemoryStore::new(cfg.l1_max_entries),
            l2,
            failover: AtomicBool::new(false),
            fallback_to_memory: cfg.fallback_to_memory,
            global_prefix: cfg.global_prefix.clone(),
            ttls,
            compression_threshold: cfg.compression_threshold,
            compression_algo: cfg.compression_algo,
            slow_op_warn: cfg.slow_op_warn,
            counters: Counters::default(),
        }
    }

    /// L1 first; on miss, read L2 (when available) and back-fill L1 on hit.
    pub async fn get(&self, tag: CacheTag, key: &str) -> Option<Value> {
        let started = Instant::now();
        self.counters.total_ops.fetch_add(1, Ordering::Relaxed);

        if let Some(value) = self.l1.get(&l1_key(tag, key)) {
            self.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        if let Some(l2) = self.l2_if_active() {
            match l2.get(&self.l2_key(tag, key)).await {
                Ok(Some(stored)) => {
                    if let Some(value) = self.decode(&stored) {
                        self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
                        self.l1.set(l1_key(tag, key), value.clone(), self.ttl(tag));
                        self.note_slow("get", tag, key, started);
                        return Some(value);
                    }
                }
                Ok(None) => {}
                Err(e) => self.record_l2_fault("get", &e),
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.note_slow("get", tag, key, started);
        None
    }

    /// Write-through L1 (never fails); best-effort L2.
    pub async fn set(&self, tag: CacheTag, key: &str, value: Value, opts: SetOptions) {
        let started = Instant::now();
        self.counters.total_ops.fetch_add(1, Ordering::Relaxed);
        self.counters.sets.fetch_add(1, Ordering::Relaxed);

        let ttl = opts.ttl.unwrap_or_else(|| self.ttl(tag));
        self.l1.set(l1_key(tag, key), value.clone(), ttl);

        if opts.memory_only {
            return;
        }
        if let Some(l2) = self.l2_if_active() {
            match self.encode(&value) {
                Ok(encoded) => {
                    if let Err(e) = l2.set(&self.l2_key(tag, key), encoded, ttl).await {
                        self.record_l2_fault("set", &e);
                    }
                }
                Err(e) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, tag = tag.as_str(), "value encode failed; kept in L1 only");
                }
            }
        }
        self.note_slow("set", tag, key, started);
    }

    /// Delete from both tiers.
    pub async fn delete(&self, tag: CacheTag, key: &str) {
        self.counters.total_ops.fetch_add(1, Ordering::Relaxed);
        self.l1.remove(&l1_key(tag, key));
        if let Some(l2) = self.l2_if_active() {
            if let Err(e) = l2.delete(&self.l2_key(tag, key)).await {
                self.record_l2_fault("delete", &e);
            }
        }
    }

    /// Batched get: L1 first, then one L2 batch for the remaining keys.
    /// The result vector is positionally aligned with `keys`.
    pub async fn mget(&self, tag: CacheTag, keys: &[&str]) -> Vec<Option<Value>> {
        self.counters.total_ops.fetch_add(1, Ordering::Relaxed);
        let mut results: Vec<Option<Value>> = Vec::with_capacity(keys.len());
        let mut missing: Vec<(usize, String)> = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            match self.l1.get(&l1_key(tag, key)) {
                Some(value) => {
                    self.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
                    results.push(Some(value));
                }
                None => {
                    missing.push((i, self.l2_key(tag, key)));
                    results.push(None);
                }
            }
        }
        if missing.is_empty() {
            return results;
        }

        if let Some(l2) = self.l2_if_active() {
            let l2_keys: Vec<String> = missing.iter().map(|(_, k)| k.clone()).collect();
            match l2.mget(&l2_keys).await {
                Ok(stored) => {
                    for ((i, _), entry) in missing.iter().zip(stored) {
                        if let Some(value) = entry.as_deref().and_then(|s| self.decode(s)) {
                            self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
                            self.l1.set(l1_key(tag, keys[*i]), value.clone(), self.ttl(tag));
                            results[*i] = Some(value);
                        } else {
                            self.counters.misses.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                Err(e) => {
                    self.record_l2_fault("mget", &e);
                    self.counters
                        .misses
                        .fetch_add(missing.len() as u64, Ordering::Relaxed);
                }
            }
        } else {
            self.counters
                .misses
                .fetch_add(missing.len() as u64, Ordering::Relaxed);
        }
        results
    }

    /// Batched set with shared options.
    pub async fn mset(&self, tag: CacheTag, entries: &[(String, Value)], opts: SetOptions) {
        for (key, value) in entries {
            self.set(tag, key, value.clone(), opts).await;
        }
    }

    /// Remove every entry in a tag's key space, in both tiers.
    pub async fn flush_tag(&self, tag: CacheTag) {
        self.counters.total_ops.fetch_add(1, Ordering::Relaxed);
        let removed = self.l1.remove_prefix(&l1_key(tag, ""));
        debug!(tag = tag.as_str(), removed, "flushed tag from L1");
        if let Some(l2) = self.l2_if_active() {
            if let Err(e) = l2.delete_prefix(&self.l2_key(tag, "")).await {
                self.record_l2_fault("flush_tag", &e);
            }
        }
    }

    /// Remove everything.  Only an L1 failure would surface here, and the
    /// in-process store cannot fail.
    pub async fn flush_all(&self) {
        self.counters.total_ops.fetch_add(1, Ordering::Relaxed);
        self.l1.clear();
        if let Some(l2) = self.l2_if_active() {
            if let Err(e) = l2.delete_prefix(&self.global_prefix).await {
                self.record_l2_fault("flush_all", &e);
            }
        }
    }

    /// Ping L2.  A success while failover is raised clears the flag.
    /// Returns whether L2 is currently reachable.
    pub async fn health_check(&self) -> bool {
        let Some(l2) = &self.l2 else {
            return false;
        };
        match l2.ping().await {
            Ok(()) => {
                if self.failover.swap(false, Ordering::SeqCst) {
                    info!("L2 reachable again; leaving failover mode");
                }
                true
            }
            Err(e) => {
                self.raise_failover(&e);
                false
            }
        }
    }

    /// Run the periodic L1 expiry sweep and L2 health check until shutdown.
    pub async fn run_maintenance(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = tick.tick() => {
                    let swept = self.l1.sweep();
                    if swept > 0 {
                        debug!(swept, "L1 sweep removed expired entries");
                    }
                    if self.l2.is_some() {
                        let _ = self.health_check().await;
                    }
                }
            }
        }
    }

    pub fn failover_active(&self) -> bool {
        self.failover.load(Ordering::SeqCst)
    }

    pub fn l1_len(&self) -> usize {
        self.l1.len()
    }

    pub fn stats(&self) -> CacheStats {
        let l1_hits = self.counters.l1_hits.load(Ordering::Relaxed);
        let l2_hits = self.counters.l2_hits.load(Ordering::Relaxed);
        let total_ops = self.counters.total_ops.load(Ordering::Relaxed);
        let hit_rate = if total_ops == 0 {
            0.0
        } else {
            (l1_hits + l2_hits) as f64 / total_ops as f64
        };
        CacheStats {
            l1_hits,
            l2_hits,
            misses: self.counters.misses.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            failovers: self.counters.failovers.load(Ordering::Relaxed),
            total_ops,
            hit_rate,
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn l2_if_active(&self) -> Option<&Arc<dyn L2Store>> {
        if self.failover.load(Ordering::SeqCst) {
            return None;
        }
        self.l2.as_ref()
    }

    fn record_l2_fault(&self, op: &str, error: &L2Error) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        warn!(op, error = %error, "L2 fault");
        self.raise_failover(error);
    }

    fn raise_failover(&self, error: &L2Error) {
        if self.fallback_to_memory && !self.failover.swap(true, Ordering::SeqCst) {
            self.counters.failovers.fetch_add(1, Ordering::Relaxed);
            warn!(error = %error, "entering failover mode; L2 bypassed");
        }
    }

    fn ttl(&self, tag: CacheTag) -> Duration {
        self.ttls
            .get(tag.as_str())
            .copied()
            .unwrap_or_else(|| tag.default_ttl())
    }

    fn l2_key(&self, tag: CacheTag, key: &str) -> String {
        format!("{}{}:{}", self.global_prefix, tag.as_str(), key)
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, L2Error> {
        let body = serde_json::to_vec(value).map_err(|e| L2Error::Compression(e.to_string()))?;
        l2::encode_value(&body, self.compression_threshold, self.compression_algo)
    }

    fn decode(&self, stored: &[u8]) -> Option<Value> {
        match l2::decode_value(stored) {
            Ok(body) => match serde_json::from_slice(&body) {
                Ok(value) => Some(value),
                Err(e) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "L2 value is not valid JSON");
                    None
                }
            },
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "L2 value failed to decode");
                None
            }
        }
    }

    fn note_slow(&self, op: &str, tag: CacheTag, key: &str, started: Instant) {
        if let Some(threshold) = self.slow_op_warn {
            let elapsed = started.elapsed();
            if elapsed >= threshold {
                warn!(
                    op,
                    tag = tag.as_str(),
                    key,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "slow cache operation"
                );
            }
        }
    }
}

fn l1_key(tag: CacheTag, key: &str) -> String {
    format!("{}:{}", tag.as_str(), key)
}
