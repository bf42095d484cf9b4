//! End-to-end pipeline tests: frames in through the coordinator loop, wire
//! messages out through a registered subscriber, with the real cache and
//! hub in between (memory-only L2).

use relay::cache::{CacheTag, CacheTier, SetOptions};
use relay::config::{CacheConfig, CompressionAlgo, HubConfig, UpstreamConfig};
use relay::coordinator::Coordinator;
use relay::hub::SubscriberHub;
use relay::upstream::{UpstreamClient, UpstreamState};
use f1_protocol::{ClientMessage, FeedFrame};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

struct Harness {
    cache: Arc<CacheTier>,
    hub: Arc<SubscriberHub>,
    frames: mpsc::UnboundedSender<FeedFrame>,
    state: watch::Sender<UpstreamState>,
    _shutdown: watch::Sender<bool>,
}

fn cache_config() -> CacheConfig {
    CacheConfig {
        l2_url: None,
        cluster: false,
        l1_max_entries: 256,
        compression_threshold: 8 * 1024,
        compression_algo: CompressionAlgo::Gzip,
        global_prefix: "f1:".to_owned(),
        ttl_overrides: HashMap::new(),
        slow_op_warn: None,
        fallback_to_memory: true,
    }
}

fn start_pipeline() -> Harness {
    let cache = Arc::new(CacheTier::new(&cache_config(), None));
    let hub = Arc::new(SubscriberHub::new(
        HubConfig {
            bind: "127.0.0.1:0".to_owned(),
            heartbeat_interval: Duration::from_secs(30),
            max_connections_per_ip: 8,
            max_events_per_minute: 1000,
            allowed_origins: Vec::new(),
            production: false,
        },
        cache.clone(),
    ));
    // The client task never runs here; dropping it makes the handle's
    // subscribe calls fail fast instead of waiting on an ack.
    let (_, handle, _frames, _state) = UpstreamClient::new(UpstreamConfig {
        url: "https://livetiming.example.com/signalr".to_owned(),
        hub_name: "Streaming".to_owned(),
        reconnect_base: Duration::from_millis(1),
        reconnect_max_attempts: 1,
        connect_timeout: Duration::from_millis(10),
        keep_alive_override: None,
    });
    let coordinator = Arc::new(Coordinator::new(cache.clone(), hub.clone(), handle));

    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(UpstreamState::Disconnected);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(coordinator.run(frames_rx, state_rx, shutdown_rx));

    Harness {
        cache,
        hub,
        frames: frames_tx,
        state: state_tx,
        _shutdown: shutdown_tx,
    }
}

fn ip(last: u8) -> IpAddr {
    IpAddr::from([127, 0, 0, last])
}

async fn next_msg(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
    let text = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("connection queue closed");
    serde_json::from_str(&text).unwrap()
}

async fn subscribe(
    hub: &SubscriberHub,
    connection_id: &str,
    rx: &mut mpsc::UnboundedReceiver<String>,
    feed: &str,
) {
    hub.handle_message(connection_id, ClientMessage::Subscribe {
        feed: feed.to_owned(),
    })
    .await;
    let reply = next_msg(rx).await;
    assert_eq!(reply["type"], "subscription:confirmed", "subscribe failed: {reply}");
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
async fn timing_fanout_reaches_subscribers_in_order() {
    let harness = start_pipeline();
    let (conn, mut rx) = harness.hub.register(ip(1)).await.unwrap();
    let _hello = next_msg(&mut rx).await;
    subscribe(&harness.hub, &conn, &mut rx, "TimingData").await;
    subscribe(&harness.hub, &conn, &mut rx, "DriverList").await;

    harness
        .frames
        .send(timing_frame("2024-01-01T10:00:00.000Z"))
        .unwrap();

    let feed = next_msg(&mut rx).await;
    assert_eq!(feed["type"], "feed:TimingData");
    assert_eq!(feed["feedName"], "TimingData");
    let drivers = &feed["payload"]["drivers"];
    assert_eq!(drivers["1"]["position"], 1);
    assert_eq!(drivers["1"]["lastLap"], "1:23.456");
    assert_eq!(drivers["1"]["laps"], 10);
    assert_eq!(drivers["44"]["position"], 2);
    assert_eq!(drivers["44"]["lastLap"], "1:23.789");

    // The merged standings follow as drivers:all, driver "1" first.
    loop {
        let msg = next_msg(&mut rx).await;
        if msg["type"] == "drivers:all" {
            assert_eq!(msg["drivers"][0]["driverNumber"], "1");
            assert_eq!(msg["drivers"][0]["position"], 1);
            break;
        }
    }
}

#[tokio::test]
async fn equal_timestamp_frames_broadcast_exactly_once() {
    let harness = start_pipeline();
    let (conn, mut rx) = harness.hub.register(ip(1)).await.unwrap();
    let _hello = next_msg(&mut rx).await;
    subscribe(&harness.hub, &conn, &mut rx, "Weather").await;

    let frame = FeedFrame {
        feed_name: "Weather".to_owned(),
        payload: json!({"AirTemp": "24.1"}),
        timestamp: "2024-01-01T10:00:00.000Z".to_owned(),
    };
    harness.frames.send(frame.clone()).unwrap();
    harness.frames.send(frame).unwrap();
    // A distinct later frame closes the window.
    harness
        .frames
        .send(FeedFrame {
            feed_name: "Weather".to_owned(),
            payload: json!({"AirTemp": "25.0"}),
            timestamp: "2024-01-01T10:00:10.000Z".to_owned(),
        })
        .unwrap();

    let first = next_msg(&mut rx).await;
    assert_eq!(first["payload"]["airTemp"], "24.1");
    let second = next_msg(&mut rx).await;
    // The duplicate was dropped; the next message is the later frame.
    assert_eq!(second["payload"]["airTemp"], "25.0");
}

#[tokio::test]
async fn best_lap_survives_omission_and_overwrites_on_presence() {
    let harness = start_pipeline();
    let (conn, mut rx) = harness.hub.register(ip(1)).await.unwrap();
    let _hello = next_msg(&mut rx).await;
    subscribe(&harness.hub, &conn, &mut rx, "TimingData").await;

    let lap = |ts: &str, line: Value| FeedFrame {
        feed_name: "TimingData".to_owned(),
        payload: json!({"Lines": {"1": line}}),
        timestamp: ts.to_owned(),
    };
    harness
        .frames
        .send(lap("T1", json!({"BestLapTime": {"Value": "1:23.456"}})))
        .unwrap();
    harness.frames.send(lap("T2", json!({"NumberOfLaps": 5}))).unwrap();
    harness
        .frames
        .send(lap("T3", json!({"BestLapTime": {"Value": "1:24.000"}})))
        .unwrap();

    // Drain the three feed events to be sure all frames are processed.
    let mut timing_events = 0;
    while timing_events < 3 {
        let msg = next_msg(&mut rx).await;
        if msg["type"] == "feed:TimingData" {
            timing_events += 1;
        }
    }
    let cached = harness.cache.get(CacheTag::Timing, "current").await.unwrap();
    // Omission kept the held value; presence overwrote it even though
    // the new value is slower.
    assert_eq!(cached["drivers"]["1"]["bestLap"], "1:24.000");
}

#[tokio::test]
async fn reconnect_recovery_replays_snapshot_before_live_frames() {
    let harness = start_pipeline();
    harness
        .cache
        .set(
            CacheTag::Session,
            "current",
            json!({"sessionType": "Race"}),
            SetOptions::default(),
        )
        .await;
    harness
        .cache
        .set(
            CacheTag::Drivers,
            "current",
            json!({"1": {"name": "VER"}}),
            SetOptions::default(),
        )
        .await;

    let (conn, mut rx) = harness.hub.register(ip(1)).await.unwrap();
    let _hello = next_msg(&mut rx).await;
    subscribe(&harness.hub, &conn, &mut rx, "Weather").await;

    harness.state.send(UpstreamState::Reconnecting).unwrap();
    let status = next_msg(&mut rx).await;
    assert_eq!(status["type"], "connection:status");
    assert_eq!(status["connected"], false);

    harness.state.send(UpstreamState::Connected).unwrap();
    let session = next_msg(&mut rx).await;
    assert_eq!(session["type"], "session:update");
    assert_eq!(session["sessionType"], "Race");
    assert_eq!(session["cached"], true);
    let drivers = next_msg(&mut rx).await;
    assert_eq!(drivers["type"], "drivers:update");
    assert_eq!(drivers["drivers"]["1"]["name"], "VER");
    assert_eq!(drivers["cached"], true);
    let restored = next_msg(&mut rx).await;
    assert_eq!(restored["type"], "data:restored");
    assert_eq!(restored["restoredTypes"], json!(["session", "drivers"]));
    let status = next_msg(&mut rx).await;
    assert_eq!(status["type"], "connection:status");
    assert_eq!(status["connected"], true);

    // Live frames resume after the replay.
    harness
        .frames
        .send(FeedFrame {
            feed_name: "Weather".to_owned(),
            payload: json!({"AirTemp": "22.0"}),
            timestamp: "T9".to_owned(),
        })
        .unwrap();
    let live = next_msg(&mut rx).await;
    assert_eq!(live["type"], "feed:Weather");
}

#[tokio::test]
async fn request_flow_reads_what_the_pipeline_wrote() {
    let harness = start_pipeline();
    let (conn, mut rx) = harness.hub.register(ip(1)).await.unwrap();
    let _hello = next_msg(&mut rx).await;

    harness
        .frames
        .send(FeedFrame {
            feed_name: "TrackStatus".to_owned(),
            payload: json!({"Status": "2", "Message": "Yellow"}),
            timestamp: "T1".to_owned(),
        })
        .unwrap();

    // Poll until the pipeline has cached the track view.
    for _ in 0..50 {
        if harness.cache.get(CacheTag::Track, "current").await.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    harness
        .hub
        .handle_message(&conn, ClientMessage::RequestTrack)
        .await;
    let reply = next_msg(&mut rx).await;
    assert_eq!(reply["type"], "track:current");
    assert_eq!(reply["cached"], true);
    assert_eq!(reply["data"]["flag"], "Yellow");
    assert_eq!(reply["data"]["status"], "2");
}
