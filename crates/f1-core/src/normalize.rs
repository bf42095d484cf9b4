//! Frame normalization.
//!
//! Turns raw [`FeedFrame`]s into [`CanonicalEvent`]s: timestamp-based
//! deduplication, per-feed field remapping, and the running fastest board.
//!
//! # Dedup contract
//! One memo per feed name holds the last timestamp seen.  A frame whose
//! timestamp equals the memo (strict string equality) is dropped.  A frame
//! with an *earlier* timestamp is forwarded and the memo is not moved
//! backward.

use crate::event::{
    CanonicalEvent, CarTelemetry, CarUpdate, DriverPosition, DriverStatus, DriverTiming,
    EventBody, FastestBoard, PositionUpdate, TimingUpdate,
};
use f1_protocol::{FeedFrame, FeedKind};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

// ---------------------------------------------------------------------------
// Track-status flag table
// ---------------------------------------------------------------------------

/// Map the upstream numeric track-status string to its flag name.
pub fn flag_name(status: &str) -> &'static str {
    match status {
        "1" => "Green",
        "2" => "Yellow",
        "3" => "SafetyCar",
        "4" => "Red",
        "5" => "VirtualSafetyCar",
        "6" => "SafetyCarEnding",
        "7" => "VirtualSafetyCarEnding",
        _ => "Unknown",
    }
}

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

/// Stateful frame-to-event transformer.
///
/// Pure function of `(feed_name, payload, timestamp)` apart from two small
/// memos: the per-feed last-seen timestamp and the session fastest board.
#[derive(Debug, Default)]
pub struct Normalizer {
    last_seen: HashMap<String, String>,
    fastest: FastestBoard,
}

impl Normalizer {
    pub fn new() -> Self {
        Normalizer::default()
    }

    /// Transform one frame.  Returns `None` when the frame is a duplicate
    /// of the last timestamp seen for its feed.
    pub fn apply(&mut self, frame: &FeedFrame) -> Option<CanonicalEvent> {
        if let Some(last) = self.last_seen.get(&frame.feed_name) {
            if *last == frame.timestamp {
                return None;
            }
        }
        // ISO timestamps compare correctly as strings; never move backward.
        match self.last_seen.get(&frame.feed_name) {
            Some(last) if frame.timestamp < *last => {}
            _ => {
                self.last_seen
                    .insert(frame.feed_name.clone(), frame.timestamp.clone());
            }
        }

        let body = match frame.kind() {
            Some(FeedKind::TimingData) => EventBody::Timing(self.timing(&frame.payload)),
            Some(FeedKind::CarData) => EventBody::Car(car_data(&frame.payload)),
            Some(FeedKind::Position) => EventBody::Position(position(&frame.payload)),
            Some(FeedKind::SessionInfo) => EventBody::Session(rekey_camel(&frame.payload)),
            Some(FeedKind::SessionData) => EventBody::SessionData(rekey_camel(&frame.payload)),
            Some(FeedKind::DriverList) => EventBody::Drivers(rekey_camel(&frame.payload)),
            Some(FeedKind::Weather) => EventBody::Weather(rekey_camel(&frame.payload)),
            Some(FeedKind::TrackStatus) => EventBody::Track(track_status(&frame.payload)),
            Some(FeedKind::RaceControl) => EventBody::RaceControl(rekey_camel(&frame.payload)),
            Some(FeedKind::Heartbeat) => EventBody::Heartbeat(frame.payload.clone()),
            None => EventBody::Generic(frame.payload.clone()),
        };

        Some(CanonicalEvent {
            feed_name: frame.feed_name.clone(),
            timestamp: frame.timestamp.clone(),
            body,
        })
    }

    /// The current fastest board (shared across all timing events).
    pub fn fastest(&self) -> &FastestBoard {
        &self.fastest
    }

    fn timing(&mut self, payload: &Value) -> TimingUpdate {
        let mut drivers = BTreeMap::new();
        if let Some(lines) = payload.get("Lines").and_then(Value::as_object) {
            for (number, line) in lines {
                let timing = driver_timing(line);
                if let Some(lap) = timing.last_lap.as_deref() {
                    self.fastest.offer_overall(number, lap);
                }
                if let Some(best) = timing.best_lap.as_deref() {
                    self.fastest.offer_overall(number, best);
                }
                for (i, sector) in timing.sectors.iter().enumerate() {
                    if let Some(time) = sector.as_deref() {
                        self.fastest.offer_sector(i, number, time);
                    }
                }
                drivers.insert(number.clone(), timing);
            }
        }
        TimingUpdate {
            drivers,
            fastest: self.fastest.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-feed extraction
// ---------------------------------------------------------------------------

fn driver_timing(line: &Value) -> DriverTiming {
    let status = line.get("Stopped").and_then(as_flag).map(|stopped| {
        if stopped {
            DriverStatus::Stopped
        } else {
            DriverStatus::Running
        }
    });
    DriverTiming {
        position: line.get("Position").and_then(as_u32),
        last_lap: nested_str(line, "LastLapTime", "Value"),
        // Present-and-non-empty only; absence stays absent.
        best_lap: nested_str(line, "BestLapTime", "Value").filter(|v| !v.is_empty()),
        laps: line.get("NumberOfLaps").and_then(as_u32),
        sectors: (0..3).map(|i| sector_value(line, i)).collect(),
        gap: str_field(line, "TimeDiffToFastest"),
        interval: str_field(line, "TimeDiffToPositionAhead"),
        status,
        in_pit: line.get("InPit").and_then(as_flag),
        retired: line.get("Retired").and_then(as_flag),
    }
}

/// Sector `i` from either an array of `{Value}` objects or an
/// object keyed `"0".."2"`.
fn sector_value(line: &Value, i: usize) -> Option<String> {
    let sectors = line.get("Sectors")?;
    let entry = match sectors {
        Value::Array(items) => items.get(i),
        Value::Object(map) => map.get(&i.to_string()),
        _ => None,
    }?;
    match entry {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("Value").and_then(Value::as_str).map(str::to_owned),
        _ => None,
    }
    .filter(|s| !s.is_empty())
}

fn car_data(payload: &Value) -> CarUpdate {
    let mut cars = BTreeMap::new();
    if let Some(entries) = cars_object(payload) {
        for (number, car) in entries {
            let channels = car.get("Channels").unwrap_or(car);
            cars.insert(
                number.clone(),
                CarTelemetry {
                    speed: channel(channels, "0"),
                    rpm: channel(channels, "2"),
                    gear: channel(channels, "3"),
                    throttle: channel(channels, "4"),
                    brake: channel(channels, "5"),
                    drs: channel(channels, "45"),
                },
            );
        }
    }
    CarUpdate { cars }
}

fn channel(channels: &Value, index: &str) -> Option<f64> {
    channels.get(index).and_then(as_f64)
}

/// The per-car map of a CarData payload: the last element of `Entries`
/// (the most recent sample in the batch), or the payload's own `Cars` map.
fn cars_object(payload: &Value) -> Option<&Map<String, Value>> {
    let holder = match payload.get("Entries").and_then(Value::as_array) {
        Some(entries) => entries.last()?,
        None => payload,
    };
    holder.get("Cars").and_then(Value::as_object)
}

fn position(payload: &Value) -> PositionUpdate {
    let mut positions = BTreeMap::new();
    let holder = match payload.get("Position").and_then(Value::as_array) {
        Some(samples) => samples.last(),
        None => Some(payload),
    };
    if let Some(entries) = holder
        .and_then(|h| h.get("Entries"))
        .and_then(Value::as_object)
    {
        for (number, entry) in entries {
            positions.insert(
                number.clone(),
                DriverPosition {
                    x: entry.get("X").and_then(as_f64),
                    y: entry.get("Y").and_then(as_f64),
                    z: entry.get("Z").and_then(as_f64),
                    status: entry.get("Status").and_then(Value::as_str).map(str::to_owned),
                },
            );
        }
    }
    PositionUpdate { positions }
}

fn track_status(payload: &Value) -> Value {
    let mut rekeyed = rekey_camel(payload);
    if let Some(map) = rekeyed.as_object_mut() {
        let flag = map
            .get("status")
            .and_then(Value::as_str)
            .map_or("Unknown", flag_name);
        map.insert("flag".to_owned(), Value::String(flag.to_owned()));
    }
    rekeyed
}

// ---------------------------------------------------------------------------
// JSON helpers
// ---------------------------------------------------------------------------

/// Recursively lower-case the first character of every object key.
pub fn rekey_camel(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, inner) in map {
                out.insert(lower_first(key), rekey_camel(inner));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(rekey_camel).collect()),
        other => other.clone(),
    }
}

fn lower_first(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn nested_str(value: &Value, outer: &str, inner: &str) -> Option<String> {
    value
        .get(outer)?
        .get(inner)
        .and_then(Value::as_str)
        .map(str::to_owned)
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .filter(|s| !s.is_empty())
}

fn as_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Upstream booleans arrive as true/false or as 0/1.
fn as_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        _ => None,
    }
}
