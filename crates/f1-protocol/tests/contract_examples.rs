/// Contract golden tests: each literal JSON example deserializes to the
/// expected wire type, serializes back, and re-parses to the same JSON value.
use f1_protocol::{ClientMessage, DomainCurrent, FeedEvent, ServerMessage};

/// Helper: assert a literal round-trips through the given type byte-for-byte
/// at the JSON-value level.
fn round_trip_server(json_text: &str) -> ServerMessage {
    let value: ServerMessage =
        serde_json::from_str(json_text).unwrap_or_else(|e| panic!("deserialize: {e}"));
    let serialized = serde_json::to_string(&value).expect("serialize");
    let original: serde_json::Value = serde_json::from_str(json_text).unwrap();
    let roundtripped: serde_json::Value = serde_json::from_str(&serialized).unwrap();
    assert_eq!(original, roundtripped, "round-trip mismatch");
    value
}

#[test]
fn connection_established_round_trip() {
    let msg = round_trip_server(
        r#"{"type":"connection:established","clientId":"c-1","serverTime":"2024-03-02T14:00:00Z","availableFeeds":["TimingData","Position"],"cachedData":{"session":true,"timing":false,"drivers":true,"weather":false,"track":false}}"#,
    );
    match msg {
        ServerMessage::ConnectionEstablished {
            client_id,
            cached_data,
            ..
        } => {
            assert_eq!(client_id, "c-1");
            assert!(cached_data.session);
            assert!(!cached_data.weather);
        }
        other => panic!("expected connection:established, got {other:?}"),
    }
}

#[test]
fn subscription_confirmed_round_trip() {
    let msg = round_trip_server(
        r#"{"type":"subscription:confirmed","feedName":"TimingData","subscribedAt":"2024-03-02T14:00:01Z"}"#,
    );
    match msg {
        ServerMessage::SubscriptionConfirmed { feed_name, .. } => {
            assert_eq!(feed_name, "TimingData");
        }
        other => panic!("expected subscription:confirmed, got {other:?}"),
    }
}

#[test]
fn subscription_error_echoes_hostile_feed_name_verbatim() {
    let hostile = "<script>alert('x')</script>";
    let msg = ServerMessage::SubscriptionError {
        feed_name: hostile.to_owned(),
        error: "Invalid feed name".to_owned(),
    };
    let json = serde_json::to_string(&msg).unwrap();
    let v: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(v["type"], "subscription:error");
    assert_eq!(v["feedName"], hostile);
    assert_eq!(v["error"], "Invalid feed name");
}

#[test]
fn domain_current_hit_and_miss_round_trip() {
    let hit = round_trip_server(
        r#"{"type":"session:current","data":{"sessionType":"Race"},"cached":true}"#,
    );
    match hit {
        ServerMessage::SessionCurrent(DomainCurrent {
            data: Some(d),
            cached: true,
            ..
        }) => assert_eq!(d["sessionType"], "Race"),
        other => panic!("expected cached session:current, got {other:?}"),
    }

    let miss = round_trip_server(
        r#"{"type":"position:current","message":"No position data available","cached":false}"#,
    );
    match miss {
        ServerMessage::PositionCurrent(DomainCurrent { cached: false, .. }) => {}
        other => panic!("expected uncached position:current, got {other:?}"),
    }
}

#[test]
fn rate_limit_exceeded_round_trip() {
    let msg = round_trip_server(
        r#"{"type":"rate_limit_exceeded","message":"Too many events","resetTime":"2024-03-02T14:01:00Z"}"#,
    );
    match msg {
        ServerMessage::RateLimitExceeded { reset_time, .. } => {
            assert_eq!(reset_time, "2024-03-02T14:01:00Z");
        }
        other => panic!("expected rate_limit_exceeded, got {other:?}"),
    }
}

#[test]
fn heartbeat_round_trip() {
    let msg = round_trip_server(
        r#"{"type":"heartbeat","timestamp":"2024-03-02T14:00:30Z","connectedClients":12}"#,
    );
    match msg {
        ServerMessage::Heartbeat {
            connected_clients, ..
        } => assert_eq!(connected_clients, 12),
        other => panic!("expected heartbeat, got {other:?}"),
    }
}

#[test]
fn data_restored_round_trip() {
    let msg =
        round_trip_server(r#"{"type":"data:restored","restoredTypes":["session","drivers"]}"#);
    match msg {
        ServerMessage::DataRestored { restored_types } => {
            assert_eq!(restored_types, vec!["session", "drivers"]);
        }
        other => panic!("expected data:restored, got {other:?}"),
    }
}

#[test]
fn connection_status_omits_error_when_absent() {
    let up = ServerMessage::ConnectionStatus {
        connected: true,
        error: None,
    };
    let v: serde_json::Value = serde_json::to_value(&up).unwrap();
    assert_eq!(v["type"], "connection:status");
    assert!(v.get("error").is_none());

    let down = round_trip_server(
        r#"{"type":"connection:status","connected":false,"error":"upstream unreachable"}"#,
    );
    match down {
        ServerMessage::ConnectionStatus {
            connected: false,
            error: Some(_),
        } => {}
        other => panic!("expected disconnected status, got {other:?}"),
    }
}

#[test]
fn client_message_kinds_parse() {
    for (text, expected) in [
        (
            r#"{"type":"subscribe","feed":"CarData"}"#,
            ClientMessage::Subscribe {
                feed: "CarData".to_owned(),
            },
        ),
        (
            r#"{"type":"unsubscribe","feed":"CarData"}"#,
            ClientMessage::Unsubscribe {
                feed: "CarData".to_owned(),
            },
        ),
        (r#"{"type":"ping"}"#, ClientMessage::Ping),
        (r#"{"type":"request:drivers"}"#, ClientMessage::RequestDrivers),
    ] {
        let parsed: ClientMessage = serde_json::from_str(text).unwrap();
        assert_eq!(parsed, expected);
    }
}

#[test]
fn unknown_client_message_kind_is_rejected() {
    assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"shutdown"}"#).is_err());
}

#[test]
fn feed_event_wire_shape() {
    let ev = FeedEvent {
        feed_name: "TrackStatus".to_owned(),
        payload: serde_json::json!({"status": "Yellow"}),
        timestamp: "2024-03-02T14:00:05.123Z".to_owned(),
    };
    let json = serde_json::to_string(&ev).unwrap();
    let v: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(v["type"], "feed:TrackStatus");
    let back: FeedEvent = serde_json::from_str(&json).unwrap();
    assert_eq!(back, ev);
}
