//! Event coordinator.
//!
//! The sole cross-component wirer and the single writer of driver state
//! and of upstream-driven cache entries.  For each upstream frame: run the
//! normalizer, write the canonical payload through the cache, merge driver
//! state, and fan out to subscribers (throttled for the high-rate position
//! and car-data feeds).
//!
//! On upstream Reconnecting the coordinator snapshots the six domain views
//! into `recovery:last_state`; on Connected it replays the snapshot to
//! every subscriber before live frames resume, then resubscribes.

use crate::cache::{CacheTag, CacheTier, SetOptions};
use crate::hub::SubscriberHub;
use crate::upstream::{UpstreamHandle, UpstreamState};
use f1_core::{CanonicalEvent, DriverRecord, DriverTable, EventBody, Normalizer};
use f1_protocol::{Domain, FeedFrame, FeedKind, ServerMessage};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Broadcast floor for the high-rate feeds (position, car telemetry).
const HIGH_RATE_THROTTLE: Duration = Duration::from_millis(500);

/// TTL of the recovery snapshot.
const SNAPSHOT_TTL: Duration = Duration::from_secs(3600);

pub struct Coordinator {
    cache: Arc<CacheTier>,
    hub: Arc<SubscriberHub>,
    upstream: UpstreamHandle,
    drivers: RwLock<DriverTable>,
}

impl Coordinator {
    pub fn new(cache: Arc<CacheTier>, hub: Arc<SubscriberHub>, upstream: UpstreamHandle) -> Self {
        Coordinator {
            cache,
            hub,
            upstream,
            drivers: RwLock::new(DriverTable::new()),
        }
    }

    /// Like [`Coordinator::new`], with a pre-seeded driver-number → name
    /// lookup from the reference-data adapter.
    pub fn with_driver_names(
        cache: Arc<CacheTier>,
        hub: Arc<SubscriberHub>,
        upstream: UpstreamHandle,
        names: std::collections::HashMap<String, String>,
    ) -> Self {
        Coordinator {
            cache,
            hub,
            upstream,
            drivers: RwLock::new(DriverTable::with_names(names)),
        }
    }

    /// Drive the intake loop until shutdown or the upstream task ends.
    ///
    /// State transitions are handled before queued frames so a recovery
    /// replay always precedes the live frames of a fresh session.
    pub async fn run(
        self: Arc<Self>,
        mut frames: mpsc::UnboundedReceiver<FeedFrame>,
        mut states: watch::Receiver<UpstreamState>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut normalizer = Normalizer::new();
        if let Err(e) = self.upstream.subscribe(FeedKind::ALL.to_vec()).await {
            debug!(error = %e, "initial subscribe not delivered");
        }
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.upstream.stop();
                        return;
                    }
                }
                changed = states.changed() => {
                    if changed.is_err() {
                        // Upstream task ended (terminal failure or stop).
                        return;
                    }
                    let state = *states.borrow_and_update();
                    match state {
                        UpstreamState::Reconnecting => self.on_reconnecting().await,
                        UpstreamState::Connected => self.on_connected().await,
                        _ => {}
                    }
                }
                frame = frames.recv() => {
                    match frame {
                        Some(frame) => self.process_frame(&mut normalizer, &frame).await,
                        None => return,
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Frame processing
    // -----------------------------------------------------------------------

    async fn process_frame(&self, normalizer: &mut Normalizer, frame: &FeedFrame) {
        let Some(event) = normalizer.apply(frame) else {
            debug!(feed = %frame.feed_name, timestamp = %frame.timestamp, "duplicate frame dropped");
            return;
        };
        let payload = event.payload();

        if let Some((tag, key)) = cache_slot(&event) {
            self.cache.set(tag, key, payload.clone(), SetOptions::default()).await;
        }

        match &event.body {
            EventBody::Timing(update) => {
                let changed = {
                    let mut table = self.drivers.write().unwrap();
                    let before: Vec<(String, Option<u32>)> = update
                        .drivers
                        .keys()
                        .map(|n| (n.clone(), table.get(n).and_then(|r| r.position)))
                        .collect();
                    table.apply_timing(update, &event.timestamp);
                    before
                        .into_iter()
                        .filter(|(n, old)| table.get(n).and_then(|r| r.position) != *old)
                        .map(|(n, _)| n)
                        .collect::<Vec<String>>()
                };
                self.broadcast(&event, &payload).await;
                for number in changed {
                    let record = self.drivers.read().unwrap().get(&number).cloned();
                    if let Some(record) = record {
                        self.hub
                            .broadcast_to_domain(Domain::Drivers, &ServerMessage::DriverUpdate {
                                data: serde_json::to_value(&record).unwrap_or(Value::Null),
                            })
                            .await;
                    }
                }
                let standings = self.standings();
                self.hub
                    .broadcast_to_domain(Domain::Drivers, &ServerMessage::DriversAll {
                        drivers: serde_json::to_value(standings).unwrap_or(Value::Null),
                    })
                    .await;
            }
            EventBody::Drivers(data) => {
                self.drivers.write().unwrap().apply_driver_list(data);
                self.broadcast(&event, &payload).await;
                self.hub
                    .broadcast_to_domain(
                        Domain::Drivers,
                        &ServerMessage::domain_update(Domain::Drivers, payload.clone(), None),
                    )
                    .await;
            }
            _ => self.broadcast(&event, &payload).await,
        }
    }

    async fn broadcast(&self, event: &CanonicalEvent, payload: &Value) {
        let Some(feed) = event.feed_name.parse::<FeedKind>().ok() else {
            // Unknown feeds have no membership group to deliver to.
            return;
        };
        match feed {
            FeedKind::Position | FeedKind::CarData => {
                self.hub
                    .throttled_broadcast(feed, payload, &event.timestamp, HIGH_RATE_THROTTLE)
                    .await;
            }
            _ => {
                self.hub
                    .broadcast_to_feed(feed, payload, &event.timestamp)
                    .await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Request handlers (used by the hub's admin surfaces)
    // -----------------------------------------------------------------------

    /// The cached current view for a domain.
    pub async fn current(&self, domain: Domain) -> Option<Value> {
        self.cache.get(CacheTag::for_domain(domain), "current").await
    }

    /// Flush one domain's cache, or every upstream-derived tag.
    pub async fn clear(&self, domain: Option<Domain>) {
        match domain {
            Some(domain) => self.cache.flush_tag(CacheTag::for_domain(domain)).await,
            None => {
                for domain in Domain::ALL {
                    self.cache.flush_tag(CacheTag::for_domain(domain)).await;
                }
                self.cache.flush_tag(CacheTag::Telemetry).await;
                self.cache.flush_tag(CacheTag::Recovery).await;
            }
        }
    }

    /// Snapshot of the current standings ordering.
    pub fn standings(&self) -> Vec<DriverRecord> {
        self.drivers.read().unwrap().standings()
    }

    // -----------------------------------------------------------------------
    // Upstream state transitions
    // -----------------------------------------------------------------------

    async fn on_reconnecting(&self) {
        let mut snapshot = Map::new();
        for domain in Domain::ALL {
            if let Some(value) = self.current(domain).await {
                snapshot.insert(domain.as_str().to_owned(), value);
            }
        }
        info!(domains = snapshot.len(), "upstream lost; writing recovery snapshot");
        self.cache
            .set(
                CacheTag::Recovery,
                "last_state",
                Value::Object(snapshot),
                SetOptions {
                    memory_only: false,
                    ttl: Some(SNAPSHOT_TTL),
                },
            )
            .await;
        self.hub
            .broadcast_all(&ServerMessage::ConnectionStatus {
                connected: false,
                error: Some("upstream disconnected".to_owned()),
            })
            .await;
    }

    async fn on_connected(&self) {
        if let Some(Value::Object(snapshot)) =
            self.cache.get(CacheTag::Recovery, "last_state").await
        {
            let restored: Vec<(Domain, Value)> = Domain::ALL
                .into_iter()
                .filter_map(|domain| {
                    snapshot
                        .get(domain.as_str())
                        .map(|value| (domain, value.clone()))
                })
                .collect();
            if !restored.is_empty() {
                info!(domains = restored.len(), "replaying recovery snapshot");
                self.hub.replay_recovery(&restored).await;
            }
        }
        if let Err(e) = self.upstream.subscribe(FeedKind::ALL.to_vec()).await {
            debug!(error = %e, "resubscribe not delivered");
        }
        self.hub
            .broadcast_all(&ServerMessage::ConnectionStatus {
                connected: true,
                error: None,
            })
            .await;
    }
}

/// Where an event's payload is cached: `(tag, key)`.
///
/// Race control rulings live under the session tag; telemetry has its own
/// short-TTL tag; heartbeats and unknown feeds are broadcast-only.
fn cache_slot(event: &CanonicalEvent) -> Option<(CacheTag, &'static str)> {
    match &event.body {
        EventBody::Car(_) => Some((CacheTag::Telemetry, "current")),
        EventBody::RaceControl(_) => Some((CacheTag::Session, "race_control")),
        EventBody::Heartbeat(_) | EventBody::Generic(_) => None,
        _ => event.domain().map(|d| (CacheTag::for_domain(d), "current")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, CompressionAlgo, HubConfig, UpstreamConfig};
    use crate::upstream::UpstreamClient;
    use serde_json::json;
    use std::collections::HashMap;

    fn components() -> (Arc<CacheTier>, Arc<SubscriberHub>, UpstreamHandle) {
        let cache = Arc::new(CacheTier::new(
            &CacheConfig {
                l2_url: None,
                cluster: false,
                l1_max_entries: 256,
                compression_threshold: 8 * 1024,
                compression_algo: CompressionAlgo::Gzip,
                global_prefix: "f1:".to_owned(),
                ttl_overrides: HashMap::new(),
                slow_op_warn: None,
                fallback_to_memory: true,
            },
            None,
        ));
        let hub = Arc::new(SubscriberHub::new(
            HubConfig {
                bind: "127.0.0.1:0".to_owned(),
                heartbeat_interval: Duration::from_secs(30),
                max_connections_per_ip: 4,
                max_events_per_minute: 100,
                allowed_origins: Vec::new(),
                production: false,
            },
            cache.clone(),
        ));
        let (_client, handle, _frames, _states) = UpstreamClient::new(UpstreamConfig {
            url: "https://livetiming.example.com/signalr".to_owned(),
            hub_name: "Streaming".to_owned(),
            reconnect_base: Duration::from_millis(1),
            reconnect_max_attempts: 1,
            connect_timeout: Duration::from_millis(10),
            keep_alive_override: None,
        });
        (cache, hub, handle)
    }

    fn timing_frame(ts: &str) -> FeedFrame {
        FeedFrame {
            feed_name: "TimingData".to_owned(),
            payload: json!({
                "Lines": {
                    "1": {"Position": "1", "LastLapTime": {"Value": "1:23.456"}, "NumberOfLaps": 10},
                    "44": {"Position": "2", "LastLapTime": {"Value": "1:23.789"}, "NumberOfLaps": 10}
                }
            }),
            timestamp: ts.to_owned(),
        }
    }

    #[tokio::test]
    async fn timing_frame_caches_merges_and_fans_out() {
        let (cache, hub, upstream) = components();
        let coordinator = Coordinator::new(cache.clone(), hub.clone(), upstream);
        let (conn, mut rx) = hub.register("127.0.0.1".parse().unwrap()).await.unwrap();
        let _ = rx.try_recv().unwrap(); // hello
        hub.handle_message(&conn, f1_protocol::ClientMessage::Subscribe {
            feed: "TimingData".to_owned(),
        })
        .await;
        hub.handle_message(&conn, f1_protocol::ClientMessage::Subscribe {
            feed: "DriverList".to_owned(),
        })
        .await;
        let _ = rx.try_recv().unwrap();
        let _ = rx.try_recv().unwrap();

        let mut normalizer = Normalizer::new();
        coordinator
            .process_frame(&mut normalizer, &timing_frame("2024-01-01T10:00:00.000Z"))
            .await;

        // The cached current view is the canonical timing payload.
        let cached = cache.get(CacheTag::Timing, "current").await.unwrap();
        assert_eq!(cached["drivers"]["1"]["lastLap"], "1:23.456");

        // feed:TimingData reaches the subscriber with both drivers.
        let feed: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(feed["type"], "feed:TimingData");
        assert_eq!(feed["payload"]["drivers"]["44"]["position"], 2);

        // Position changes produce driver:update, then drivers:all, ordered
        // by position with driver "1" first.
        let mut saw_drivers_all = false;
        while let Ok(text) = rx.try_recv() {
            let msg: Value = serde_json::from_str(&text).unwrap();
            if msg["type"] == "drivers:all" {
                assert_eq!(msg["drivers"][0]["driverNumber"], "1");
                assert_eq!(msg["drivers"][0]["position"], 1);
                saw_drivers_all = true;
            }
        }
        assert!(saw_drivers_all);
        assert_eq!(coordinator.standings()[0].number, "1");
    }

    #[tokio::test]
    async fn duplicate_timestamps_produce_one_broadcast() {
        let (cache, hub, upstream) = components();
        let coordinator = Coordinator::new(cache, hub.clone(), upstream);
        let (conn, mut rx) = hub.register("127.0.0.1".parse().unwrap()).await.unwrap();
        let _ = rx.try_recv().unwrap();
        hub.handle_message(&conn, f1_protocol::ClientMessage::Subscribe {
            feed: "TimingData".to_owned(),
        })
        .await;
        let _ = rx.try_recv().unwrap();

        let mut normalizer = Normalizer::new();
        let frame = timing_frame("2024-01-01T10:00:00.000Z");
        coordinator.process_frame(&mut normalizer, &frame).await;
        let first_count = {
            let mut count = 0;
            while rx.try_recv().is_ok() {
                count += 1;
            }
            count
        };
        assert!(first_count >= 1);
        coordinator.process_frame(&mut normalizer, &frame).await;
        assert!(rx.try_recv().is_err(), "duplicate frame must not broadcast");
    }

    #[tokio::test]
    async fn current_and_clear_cover_the_domain_views() {
        let (cache, hub, upstream) = components();
        let coordinator = Coordinator::new(cache.clone(), hub, upstream);
        let mut normalizer = Normalizer::new();
        coordinator
            .process_frame(&mut normalizer, &FeedFrame {
                feed_name: "Weather".to_owned(),
                payload: json!({"AirTemp": "24.1"}),
                timestamp: "T1".to_owned(),
            })
            .await;
        assert_eq!(
            coordinator.current(Domain::Weather).await.unwrap()["airTemp"],
            "24.1"
        );
        coordinator.clear(Some(Domain::Weather)).await;
        assert!(coordinator.current(Domain::Weather).await.is_none());
    }

    #[tokio::test]
    async fn race_control_is_cached_under_the_session_tag() {
        let (cache, hub, upstream) = components();
        let coordinator = Coordinator::new(cache.clone(), hub, upstream);
        let mut normalizer = Normalizer::new();
        coordinator
            .process_frame(&mut normalizer, &FeedFrame {
                feed_name: "RaceControl".to_owned(),
                payload: json!({"Messages": [{"Message": "DRS ENABLED"}]}),
                timestamp: "T1".to_owned(),
            })
            .await;
        let cached = cache.get(CacheTag::Session, "race_control").await.unwrap();
        assert_eq!(cached["messages"][0]["message"], "DRS ENABLED");
        // The session current view is untouched.
        assert!(cache.get(CacheTag::Session, "current").await.is_none());
    }

    #[tokio::test]
    async fn reconnecting_snapshots_and_connected_replays() {
        let (cache, hub, upstream) = components();
        let coordinator = Coordinator::new(cache.clone(), hub.clone(), upstream);
        cache
            .set(CacheTag::Session, "current", json!({"sessionType": "Race"}), SetOptions::default())
            .await;
        cache
            .set(CacheTag::Drivers, "current", json!({"1": {"name": "VER"}}), SetOptions::default())
            .await;

        let (_conn, mut rx) = hub.register("127.0.0.1".parse().unwrap()).await.unwrap();
        let _ = rx.try_recv().unwrap();

        coordinator.on_reconnecting().await;
        let status: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(status["type"], "connection:status");
        assert_eq!(status["connected"], false);

        let snapshot = cache.get(CacheTag::Recovery, "last_state").await.unwrap();
        assert_eq!(snapshot["session"]["sessionType"], "Race");
        assert_eq!(snapshot["drivers"]["1"]["name"], "VER");

        coordinator.on_connected().await;
        let session: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(session["type"], "session:update");
        assert_eq!(session["sessionType"], "Race");
        assert_eq!(session["cached"], true);
        let drivers: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(drivers["type"], "drivers:update");
        assert_eq!(drivers["drivers"]["1"]["name"], "VER");
        let restored: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(restored["type"], "data:restored");
        assert_eq!(restored["restoredTypes"], json!(["session", "drivers"]));
        let status: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(status["type"], "connection:status");
        assert_eq!(status["connected"], true);
    }
}
