// f1-protocol: push-socket wire types and upstream feed identifiers.
//
// All push-socket messages use a top-level `type` field for discriminated
// deserialization.  The enum variants map 1:1 to the message kinds clients
// see on the wire.  The one dynamic kind, `feed:<feedName>`, is a dedicated
// struct with hand-written serde impls because its tag embeds the feed name.

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// FeedKind
// ---------------------------------------------------------------------------

/// The closed set of upstream feed names.
///
/// Anything outside this set is not a valid subscription target; the
/// normalizer routes unknown upstream names into a generic passthrough
/// event instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FeedKind {
    SessionInfo,
    DriverList,
    TimingData,
    CarData,
    Position,
    Weather,
    TrackStatus,
    SessionData,
    RaceControl,
    Heartbeat,
}

impl FeedKind {
    /// Every feed kind, in the order advertised to clients.
    pub const ALL: [FeedKind; 10] = [
        FeedKind::SessionInfo,
        FeedKind::DriverList,
        FeedKind::TimingData,
        FeedKind::CarData,
        FeedKind::Position,
        FeedKind::Weather,
        FeedKind::TrackStatus,
        FeedKind::SessionData,
        FeedKind::RaceControl,
        FeedKind::Heartbeat,
    ];

    /// The exact upstream feed name.
    pub fn as_str(self) -> &'static str {
        match self {
            FeedKind::SessionInfo => "SessionInfo",
            FeedKind::DriverList => "DriverList",
            FeedKind::TimingData => "TimingData",
            FeedKind::CarData => "CarData",
            FeedKind::Position => "Position",
            FeedKind::Weather => "Weather",
            FeedKind::TrackStatus => "TrackStatus",
            FeedKind::SessionData => "SessionData",
            FeedKind::RaceControl => "RaceControl",
            FeedKind::Heartbeat => "Heartbeat",
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedKind {
    type Err = UnknownFeed;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FeedKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownFeed(s.to_owned()))
    }
}

/// Error returned when a string names no feed in the closed set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownFeed(pub String);

impl fmt::Display for UnknownFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown feed name: {}", self.0)
    }
}

impl std::error::Error for UnknownFeed {}

impl Serialize for FeedKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FeedKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Domain
// ---------------------------------------------------------------------------

/// The six request/recovery domains.
///
/// These name the cached "current" views clients can request and the state
/// the relay snapshots on upstream disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Session,
    Drivers,
    Timing,
    Weather,
    Track,
    Position,
}

impl Domain {
    pub const ALL: [Domain; 6] = [
        Domain::Session,
        Domain::Drivers,
        Domain::Timing,
        Domain::Weather,
        Domain::Track,
        Domain::Position,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Domain::Session => "session",
            Domain::Drivers => "drivers",
            Domain::Timing => "timing",
            Domain::Weather => "weather",
            Domain::Track => "track",
            Domain::Position => "position",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// FeedFrame
// ---------------------------------------------------------------------------

/// One raw record from the upstream hub, as delivered by the `feed` hub
/// method: `A[0]` = feed name, `A[1]` = payload, `A[2]` = timestamp.
///
/// The timestamp is kept as the raw upstream string; deduplication compares
/// it with strict string equality, so no parsing or normalization happens
/// here.  Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedFrame {
    pub feed_name: String,
    pub payload: Value,
    pub timestamp: String,
}

impl FeedFrame {
    /// The parsed feed kind, if the name is in the closed set.
    pub fn kind(&self) -> Option<FeedKind> {
        self.feed_name.parse().ok()
    }
}

// ---------------------------------------------------------------------------
// Client -> Relay messages
// ---------------------------------------------------------------------------

/// Inbound push-socket messages.
///
/// `subscribe`/`unsubscribe` carry the raw feed name as a string so the
/// relay can echo invalid names back in the error reply without losing
/// information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "subscribe")]
    Subscribe { feed: String },
    #[serde(rename = "unsubscribe")]
    Unsubscribe { feed: String },
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "request:session")]
    RequestSession,
    #[serde(rename = "request:drivers")]
    RequestDrivers,
    #[serde(rename = "request:timing")]
    RequestTiming,
    #[serde(rename = "request:weather")]
    RequestWeather,
    #[serde(rename = "request:track")]
    RequestTrack,
    #[serde(rename = "request:position")]
    RequestPosition,
}

impl ClientMessage {
    /// The domain a `request:*` message targets, if any.
    pub fn requested_domain(&self) -> Option<Domain> {
        match self {
            ClientMessage::RequestSession => Some(Domain::Session),
            ClientMessage::RequestDrivers => Some(Domain::Drivers),
            ClientMessage::RequestTiming => Some(Domain::Timing),
            ClientMessage::RequestWeather => Some(Domain::Weather),
            ClientMessage::RequestTrack => Some(Domain::Track),
            ClientMessage::RequestPosition => Some(Domain::Position),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Relay -> Client messages
// ---------------------------------------------------------------------------

/// Which domains have cached data at connect time, sent in the hello.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedPresence {
    pub session: bool,
    pub timing: bool,
    pub drivers: bool,
    pub weather: bool,
    pub track: bool,
}

/// Reply body for `request:<domain>` and recovery replays.
///
/// Exactly one of `data` / `message` is present: `data` with `cached: true`
/// when the domain has a cached value, `message` with `cached: false`
/// otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainCurrent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub cached: bool,
}

impl DomainCurrent {
    pub fn hit(data: Value) -> Self {
        DomainCurrent {
            data: Some(data),
            message: None,
            cached: true,
        }
    }

    pub fn miss(domain: Domain) -> Self {
        DomainCurrent {
            data: None,
            message: Some(format!("No {domain} data available")),
            cached: false,
        }
    }
}

/// All fixed outbound push-socket message kinds.
///
/// The dynamic per-feed event (`feed:<feedName>`) is [`FeedEvent`], not a
/// variant here, because its tag embeds the feed name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "connection:established")]
    #[serde(rename_all = "camelCase")]
    ConnectionEstablished {
        client_id: String,
        server_time: String,
        available_feeds: Vec<String>,
        cached_data: CachedPresence,
    },
    #[serde(rename = "subscription:confirmed")]
    #[serde(rename_all = "camelCase")]
    SubscriptionConfirmed {
        feed_name: String,
        subscribed_at: String,
    },
    #[serde(rename = "subscription:error")]
    #[serde(rename_all = "camelCase")]
    SubscriptionError { feed_name: String, error: String },
    #[serde(rename = "unsubscription:confirmed")]
    #[serde(rename_all = "camelCase")]
    UnsubscriptionConfirmed { feed_name: String },
    #[serde(rename = "pong")]
    Pong { timestamp: String },
    #[serde(rename = "session:current")]
    SessionCurrent(DomainCurrent),
    #[serde(rename = "drivers:current")]
    DriversCurrent(DomainCurrent),
    #[serde(rename = "timing:current")]
    TimingCurrent(DomainCurrent),
    #[serde(rename = "weather:current")]
    WeatherCurrent(DomainCurrent),
    #[serde(rename = "track:current")]
    TrackCurrent(DomainCurrent),
    #[serde(rename = "position:current")]
    PositionCurrent(DomainCurrent),
    #[serde(rename = "rate_limit_exceeded")]
    #[serde(rename_all = "camelCase")]
    RateLimitExceeded { message: String, reset_time: String },
    #[serde(rename = "heartbeat")]
    #[serde(rename_all = "camelCase")]
    Heartbeat {
        timestamp: String,
        connected_clients: usize,
    },
    #[serde(rename = "connection:status")]
    ConnectionStatus {
        connected: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "data:restored")]
    #[serde(rename_all = "camelCase")]
    DataRestored { restored_types: Vec<String> },
    #[serde(rename = "session:update")]
    SessionUpdate {
        #[serde(flatten)]
        data: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        cached: Option<bool>,
    },
    #[serde(rename = "timing:update")]
    TimingUpdate {
        #[serde(flatten)]
        data: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        cached: Option<bool>,
    },
    #[serde(rename = "drivers:update")]
    DriversUpdate {
        drivers: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        cached: Option<bool>,
    },
    #[serde(rename = "driver:update")]
    DriverUpdate {
        #[serde(flatten)]
        data: Value,
    },
    #[serde(rename = "drivers:all")]
    DriversAll { drivers: Value },
    #[serde(rename = "weather:update")]
    WeatherUpdate {
        #[serde(flatten)]
        data: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        cached: Option<bool>,
    },
    #[serde(rename = "track:status")]
    TrackStatus {
        #[serde(flatten)]
        data: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        cached: Option<bool>,
    },
    #[serde(rename = "position:update")]
    PositionUpdate {
        #[serde(flatten)]
        data: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        cached: Option<bool>,
    },
}

impl ServerMessage {
    /// Build the `<domain>:current` variant for a domain.
    pub fn domain_current(domain: Domain, body: DomainCurrent) -> ServerMessage {
        match domain {
            Domain::Session => ServerMessage::SessionCurrent(body),
            Domain::Drivers => ServerMessage::DriversCurrent(body),
            Domain::Timing => ServerMessage::TimingCurrent(body),
            Domain::Weather => ServerMessage::WeatherCurrent(body),
            Domain::Track => ServerMessage::TrackCurrent(body),
            Domain::Position => ServerMessage::PositionCurrent(body),
        }
    }

    /// Build the `<domain>:update` variant for a domain.  Recovery replays
    /// pass `cached = Some(true)`; live refreshes pass `None`.
    pub fn domain_update(domain: Domain, data: Value, cached: Option<bool>) -> ServerMessage {
        match domain {
            Domain::Session => ServerMessage::SessionUpdate { data, cached },
            Domain::Drivers => ServerMessage::DriversUpdate {
                drivers: data,
                cached,
            },
            Domain::Timing => ServerMessage::TimingUpdate { data, cached },
            Domain::Weather => ServerMessage::WeatherUpdate { data, cached },
            Domain::Track => ServerMessage::TrackStatus { data, cached },
            Domain::Position => ServerMessage::PositionUpdate { data, cached },
        }
    }
}

// ---------------------------------------------------------------------------
// FeedEvent — the dynamic `feed:<feedName>` message
// ---------------------------------------------------------------------------

/// A per-feed broadcast event: `{"type": "feed:<feedName>", "feedName": …,
/// "payload": …, "timestamp": …}`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEvent {
    pub feed_name: String,
    pub payload: Value,
    pub timestamp: String,
}

impl Serialize for FeedEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(4))?;
        map.serialize_entry("type", &format!("feed:{}", self.feed_name))?;
        map.serialize_entry("feedName", &self.feed_name)?;
        map.serialize_entry("payload", &self.payload)?;
        map.serialize_entry("timestamp", &self.timestamp)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for FeedEvent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FeedEventVisitor;

        impl<'de> Visitor<'de> for FeedEventVisitor {
            type Value = FeedEvent;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a feed:<name> message object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<FeedEvent, A::Error> {
                let mut tag: Option<String> = None;
                let mut feed_name: Option<String> = None;
                let mut payload: Option<Value> = None;
                let mut timestamp: Option<String> = None;
                while let Some(key) = access.next_key::<String>()? {
                    match key.as_str() {
                        "type" => tag = Some(access.next_value()?),
                        "feedName" => feed_name = Some(access.next_value()?),
                        "payload" => payload = Some(access.next_value()?),
                        "timestamp" => timestamp = Some(access.next_value()?),
                        _ => {
                            let _: de::IgnoredAny = access.next_value()?;
                        }
                    }
                }
                let tag = tag.ok_or_else(|| de::Error::missing_field("type"))?;
                let feed_name = feed_name.ok_or_else(|| de::Error::missing_field("feedName"))?;
                if tag != format!("feed:{feed_name}") {
                    return Err(de::Error::custom(format!(
                        "type '{tag}' does not match feedName '{feed_name}'"
                    )));
                }
                Ok(FeedEvent {
                    feed_name,
                    payload: payload.ok_or_else(|| de::Error::missing_field("payload"))?,
                    timestamp: timestamp.ok_or_else(|| de::Error::missing_field("timestamp"))?,
                })
            }
        }

        deserializer.deserialize_map(FeedEventVisitor)
    }
}
