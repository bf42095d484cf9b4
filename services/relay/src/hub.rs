//! Subscriber hub.
//!
//! Owns every push-socket connection: admission, per-connection
//! subscriptions, inbound rate limiting, request serving, throttled
//! broadcasts, heartbeats, idle eviction, and recovery replay.
//!
//! # Locking
//! One guard protects both registries (connection map and feed-membership
//! index), so they can never disagree.  Broadcasts take a snapshot of the
//! member senders under the guard and emit without holding it.

use crate::cache::{CacheTag, CacheTier, SetOptions};
use crate::config::HubConfig;
use chrono::Utc;
use f1_core::RateLimiter;
use f1_protocol::{
    CachedPresence, ClientMessage, Domain, DomainCurrent, FeedEvent, FeedKind, ServerMessage,
};
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Admission and message-handling failures, surfaced to the offending
/// connection only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    #[error("Invalid feed name")]
    InvalidFeed,
    #[error("Rate limit exceeded")]
    RateLimited,
    #[error("Connection limit reached for this address")]
    ConnectionCap,
    #[error("Origin not allowed")]
    OriginDenied,
    #[error("Missing or invalid User-Agent")]
    UserAgentInvalid,
}

// ---------------------------------------------------------------------------
// Registry types
// ---------------------------------------------------------------------------

/// Pre-serialized outbound messages; one sender per connection.
pub type OutboundSender = mpsc::UnboundedSender<String>;

struct ConnectionEntry {
    remote_ip: IpAddr,
    sender: OutboundSender,
    subscribed: BTreeSet<FeedKind>,
    last_ping: Instant,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<String, ConnectionEntry>,
    feeds: HashMap<FeedKind, HashSet<String>>,
    per_ip: HashMap<IpAddr, usize>,
}

impl Registry {
    fn join_feed(&mut self, connection_id: &str, feed: FeedKind) {
        if let Some(entry) = self.connections.get_mut(connection_id) {
            entry.subscribed.insert(feed);
            self.feeds
                .entry(feed)
                .or_default()
                .insert(connection_id.to_owned());
        }
    }

    fn leave_feed(&mut self, connection_id: &str, feed: FeedKind) {
        if let Some(entry) = self.connections.get_mut(connection_id) {
            entry.subscribed.remove(&feed);
        }
        if let Some(members) = self.feeds.get_mut(&feed) {
            members.remove(connection_id);
        }
        if self.feeds.get(&feed).is_some_and(HashSet::is_empty) {
            self.feeds.remove(&feed);
        }
    }

    fn remove_connection(&mut self, connection_id: &str) -> Option<ConnectionEntry> {
        let entry = self.connections.remove(connection_id)?;
        for feed in &entry.subscribed {
            if let Some(members) = self.feeds.get_mut(feed) {
                members.remove(connection_id);
            }
            if self.feeds.get(feed).is_some_and(HashSet::is_empty) {
                self.feeds.remove(feed);
            }
        }
        let remaining = self
            .per_ip
            .get(&entry.remote_ip)
            .map(|count| count.saturating_sub(1));
        match remaining {
            Some(0) | None => {
                self.per_ip.remove(&entry.remote_ip);
            }
            Some(n) => {
                self.per_ip.insert(entry.remote_ip, n);
            }
        }
        Some(entry)
    }

    /// Membership index and per-connection sets must agree at all times.
    /// Violations are impossible through the public hub operations; this
    /// exists for the test suite.
    #[cfg(test)]
    fn consistent(&self) -> bool {
        for (id, entry) in &self.connections {
            for feed in &entry.subscribed {
                if !self.feeds.get(feed).is_some_and(|m| m.contains(id)) {
                    return false;
                }
            }
        }
        for (feed, members) in &self.feeds {
            for id in members {
                if !self
                    .connections
                    .get(id)
                    .is_some_and(|e| e.subscribed.contains(feed))
                {
                    return false;
                }
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// SubscriberHub
// ---------------------------------------------------------------------------

const RATE_WINDOW: Duration = Duration::from_secs(60);

pub struct SubscriberHub {
    cfg: HubConfig,
    registry: RwLock<Registry>,
    limiter: RateLimiter,
    cache: Arc<CacheTier>,
    /// Per-feed last emit instants for the throttled broadcast path.
    throttle: StdMutex<HashMap<FeedKind, Instant>>,
}

impl SubscriberHub {
    pub fn new(cfg: HubConfig, cache: Arc<CacheTier>) -> Self {
        SubscriberHub {
            cfg,
            registry: RwLock::new(Registry::default()),
            limiter: RateLimiter::new(),
            cache,
            throttle: StdMutex::new(HashMap::new()),
        }
    }

    // -----------------------------------------------------------------------
    // Admission and lifecycle
    // -----------------------------------------------------------------------

    /// Transport-layer admission check.  Runs before the WebSocket upgrade;
    /// a rejection closes the handshake with an error status.
    pub async fn check_admission(
        &self,
        remote_ip: IpAddr,
        origin: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<(), SubscriptionError> {
        if self.cfg.production {
            let allowed = origin
                .is_some_and(|o| self.cfg.allowed_origins.iter().any(|a| a == o));
            if !allowed {
                return Err(SubscriptionError::OriginDenied);
            }
            if user_agent.is_none_or(|ua| ua.len() < 8) {
                return Err(SubscriptionError::UserAgentInvalid);
            }
        }
        let registry = self.registry.read().await;
        if registry.per_ip.get(&remote_ip).copied().unwrap_or(0)
            >= self.cfg.max_connections_per_ip
        {
            return Err(SubscriptionError::ConnectionCap);
        }
        Ok(())
    }

    /// Register an admitted connection and send its hello snapshot.
    ///
    /// Returns the connection id and the receiver half of its outbound
    /// queue.  The per-IP count is re-checked under the write guard so
    /// concurrent upgrades cannot exceed the cap.
    pub async fn register(
        &self,
        remote_ip: IpAddr,
    ) -> Result<(String, mpsc::UnboundedReceiver<String>), SubscriptionError> {
        let connection_id = Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut registry = self.registry.write().await;
            let current = registry.per_ip.get(&remote_ip).copied().unwrap_or(0);
            if current >= self.cfg.max_connections_per_ip {
                return Err(SubscriptionError::ConnectionCap);
            }
            registry.per_ip.insert(remote_ip, current + 1);
            registry.connections.insert(connection_id.clone(), ConnectionEntry {
                remote_ip,
                sender: sender.clone(),
                subscribed: BTreeSet::new(),
                last_ping: Instant::now(),
            });
        }

        let cached_data = CachedPresence {
            session: self.cache.get(CacheTag::Session, "current").await.is_some(),
            timing: self.cache.get(CacheTag::Timing, "current").await.is_some(),
            drivers: self.cache.get(CacheTag::Drivers, "current").await.is_some(),
            weather: self.cache.get(CacheTag::Weather, "current").await.is_some(),
            track: self.cache.get(CacheTag::Track, "current").await.is_some(),
        };
        let hello = ServerMessage::ConnectionEstablished {
            client_id: connection_id.clone(),
            server_time: Utc::now().to_rfc3339(),
            available_feeds: FeedKind::ALL.iter().map(|f| f.as_str().to_owned()).collect(),
            cached_data,
        };
        send_to(&sender, &hello);

        self.cache
            .set(
                CacheTag::ClientSession,
                &connection_id,
                json!({
                    "connectionId": connection_id,
                    "remoteAddr": remote_ip.to_string(),
                    "subscribedFeeds": [],
                    "connectedAt": Utc::now().to_rfc3339(),
                }),
                SetOptions {
                    memory_only: true,
                    ttl: None,
                },
            )
            .await;

        info!(connection_id = %connection_id, ip = %remote_ip, "subscriber connected");
        Ok((connection_id, receiver))
    }

    /// Remove a connection: registry, feed index, per-IP count, rate
    /// window, and the cached session record.
    pub async fn unregister(&self, connection_id: &str) {
        let removed = self.registry.write().await.remove_connection(connection_id);
        if removed.is_some() {
            self.limiter.forget(connection_id);
            self.cache.delete(CacheTag::ClientSession, connection_id).await;
            info!(connection_id = %connection_id, "subscriber disconnected");
        }
    }

    // -----------------------------------------------------------------------
    // Inbound messages
    // -----------------------------------------------------------------------

    /// Handle one inbound message from a connection.  Every message counts
    /// against the rolling per-connection event budget; over-budget
    /// messages get a `rate_limit_exceeded` reply and are not processed.
    pub async fn handle_message(&self, connection_id: &str, message: ClientMessage) {
        let status = self.limiter.increment(connection_id, RATE_WINDOW);
        if status.count > self.cfg.max_events_per_minute {
            let remaining = status.reset_at.saturating_duration_since(Instant::now());
            let reset_time = (Utc::now()
                + chrono::Duration::from_std(remaining).unwrap_or_default())
            .to_rfc3339();
            self.send(connection_id, &ServerMessage::RateLimitExceeded {
                message: SubscriptionError::RateLimited.to_string(),
                reset_time,
            })
            .await;
            return;
        }

        match message {
            ClientMessage::Subscribe { feed } => self.subscribe(connection_id, &feed).await,
            ClientMessage::Unsubscribe { feed } => self.unsubscribe(connection_id, &feed).await,
            ClientMessage::Ping => self.ping(connection_id).await,
            other => {
                if let Some(domain) = other.requested_domain() {
                    self.serve_request(connection_id, domain).await;
                }
            }
        }
    }

    async fn subscribe(&self, connection_id: &str, feed_name: &str) {
        let Ok(feed) = feed_name.parse::<FeedKind>() else {
            self.send(connection_id, &ServerMessage::SubscriptionError {
                feed_name: feed_name.to_owned(),
                error: SubscriptionError::InvalidFeed.to_string(),
            })
            .await;
            return;
        };
        self.registry.write().await.join_feed(connection_id, feed);
        debug!(connection_id = %connection_id, feed = feed.as_str(), "subscribed");
        self.send(connection_id, &ServerMessage::SubscriptionConfirmed {
            feed_name: feed.as_str().to_owned(),
            subscribed_at: Utc::now().to_rfc3339(),
        })
        .await;
    }

    async fn unsubscribe(&self, connection_id: &str, feed_name: &str) {
        let Ok(feed) = feed_name.parse::<FeedKind>() else {
            self.send(connection_id, &ServerMessage::SubscriptionError {
                feed_name: feed_name.to_owned(),
                error: SubscriptionError::InvalidFeed.to_string(),
            })
            .await;
            return;
        };
        self.registry.write().await.leave_feed(connection_id, feed);
        self.send(connection_id, &ServerMessage::UnsubscriptionConfirmed {
            feed_name: feed.as_str().to_owned(),
        })
        .await;
    }

    async fn ping(&self, connection_id: &str) {
        if let Some(entry) = self
            .registry
            .write()
            .await
            .connections
            .get_mut(connection_id)
        {
            entry.last_ping = Instant::now();
        }
        self.send(connection_id, &ServerMessage::Pong {
            timestamp: Utc::now().to_rfc3339(),
        })
        .await;
    }

    async fn serve_request(&self, connection_id: &str, domain: Domain) {
        let body = match self.cache.get(CacheTag::for_domain(domain), "current").await {
            Some(value) => DomainCurrent::hit(value),
            None => DomainCurrent::miss(domain),
        };
        self.send(connection_id, &ServerMessage::domain_current(domain, body))
            .await;
    }

    // -----------------------------------------------------------------------
    // Outbound broadcast
    // -----------------------------------------------------------------------

    /// Send a `feed:<feedName>` event to every subscriber of `feed`.
    ///
    /// A feed with zero subscribers short-circuits before any message is
    /// built.
    pub async fn broadcast_to_feed(&self, feed: FeedKind, payload: &Value, timestamp: &str) {
        let senders = self.feed_senders(feed).await;
        if senders.is_empty() {
            return;
        }
        let event = FeedEvent {
            feed_name: feed.as_str().to_owned(),
            payload: payload.clone(),
            timestamp: timestamp.to_owned(),
        };
        let Ok(text) = serde_json::to_string(&event) else {
            return;
        };
        for sender in senders {
            let _ = sender.send(text.clone());
        }
    }

    /// Deliver at most one message per feed per `min_interval`; payloads
    /// inside the window are dropped.  A zero interval is equivalent to
    /// [`SubscriberHub::broadcast_to_feed`].
    pub async fn throttled_broadcast(
        &self,
        feed: FeedKind,
        payload: &Value,
        timestamp: &str,
        min_interval: Duration,
    ) {
        if !min_interval.is_zero() {
            let mut throttle = self.throttle.lock().unwrap();
            let now = Instant::now();
            match throttle.get(&feed) {
                Some(last) if now.duration_since(*last) < min_interval => return,
                _ => {
                    throttle.insert(feed, now);
                }
            }
        }
        self.broadcast_to_feed(feed, payload, timestamp).await;
    }

    /// Send a fixed-kind message to subscribers of the feeds backing a
    /// domain (e.g. `drivers:all` to DriverList subscribers).
    pub async fn broadcast_to_domain(&self, domain: Domain, message: &ServerMessage) {
        let Some(text) = to_json(message) else {
            return;
        };
        let mut recipients: Vec<OutboundSender> = Vec::new();
        {
            let registry = self.registry.read().await;
            let mut seen: HashSet<&str> = HashSet::new();
            for feed in domain_feeds(domain) {
                if let Some(members) = registry.feeds.get(feed) {
                    for id in members {
                        if seen.insert(id.as_str()) {
                            if let Some(entry) = registry.connections.get(id) {
                                recipients.push(entry.sender.clone());
                            }
                        }
                    }
                }
            }
        }
        for sender in recipients {
            let _ = sender.send(text.clone());
        }
    }

    /// Send a fixed-kind message to every connection.
    pub async fn broadcast_all(&self, message: &ServerMessage) {
        let Some(text) = to_json(message) else {
            return;
        };
        let senders: Vec<OutboundSender> = {
            let registry = self.registry.read().await;
            registry
                .connections
                .values()
                .map(|e| e.sender.clone())
                .collect()
        };
        for sender in senders {
            let _ = sender.send(text.clone());
        }
    }

    /// Recovery replay: per-domain update events with `cached: true` to
    /// every connection, then the `data:restored` summary.
    pub async fn replay_recovery(&self, restored: &[(Domain, Value)]) {
        for (domain, value) in restored {
            self.broadcast_all(&ServerMessage::domain_update(
                *domain,
                value.clone(),
                Some(true),
            ))
            .await;
        }
        let restored_types = restored
            .iter()
            .map(|(domain, _)| domain.as_str().to_owned())
            .collect();
        self.broadcast_all(&ServerMessage::DataRestored { restored_types })
            .await;
    }

    // -----------------------------------------------------------------------
    // Heartbeats and idle eviction
    // -----------------------------------------------------------------------

    /// Periodic heartbeat + idle eviction loop.  A connection with no ping
    /// for twice the heartbeat interval is closed.
    pub async fn run_heartbeat_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = self.cfg.heartbeat_interval;
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
                    let idle = self.evict_idle(interval * 2).await;
                    for connection_id in idle {
                        warn!(connection_id = %connection_id, "closing idle connection");
                        self.limiter.forget(&connection_id);
                        self.cache.delete(CacheTag::ClientSession, &connection_id).await;
                    }
                    let count = self.connection_count().await;
                    self.broadcast_all(&ServerMessage::Heartbeat {
                        timestamp: Utc::now().to_rfc3339(),
                        connected_clients: count,
                    })
                    .await;
                }
            }
        }
    }

    async fn evict_idle(&self, max_idle: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut registry = self.registry.write().await;
        let idle: Vec<String> = registry
            .connections
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_ping) >= max_idle)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &idle {
            // Dropping the entry drops its sender; the socket task sees the
            // closed queue and shuts the connection down.
            registry.remove_connection(id);
        }
        idle
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.connections.len()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn send(&self, connection_id: &str, message: &ServerMessage) {
        let Some(text) = to_json(message) else {
            return;
        };
        let registry = self.registry.read().await;
        if let Some(entry) = registry.connections.get(connection_id) {
            let _ = entry.sender.send(text);
        }
    }

    async fn feed_senders(&self, feed: FeedKind) -> Vec<OutboundSender> {
        let registry = self.registry.read().await;
        match registry.feeds.get(&feed) {
            Some(members) => members
                .iter()
                .filter_map(|id| registry.connections.get(id))
                .map(|e| e.sender.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    #[cfg(test)]
    async fn registry_consistent(&self) -> bool {
        self.registry.read().await.consistent()
    }
}

/// The upstream feeds whose updates refresh a domain view.
fn domain_feeds(domain: Domain) -> &'static [FeedKind] {
    match domain {
        Domain::Session => &[FeedKind::SessionInfo, FeedKind::SessionData],
        Domain::Drivers => &[FeedKind::DriverList],
        Domain::Timing => &[FeedKind::TimingData],
        Domain::Weather => &[FeedKind::Weather],
        Domain::Track => &[FeedKind::TrackStatus],
        Domain::Position => &[FeedKind::Position],
    }
}

fn to_json(message: &ServerMessage) -> Option<String> {
    serde_json::to_string(message).ok()
}

fn send_to(sender: &OutboundSender, message: &ServerMessage) {
    if let Some(text) = to_json(message) {
        let _ = sender.send(text);
    }
}
