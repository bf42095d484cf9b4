//! Canonical event model.
//!
//! A [`CanonicalEvent`] is the normalizer's output: the upstream feed name
//! and timestamp plus a kind-specific structured body, independent of the
//! upstream JSON quirks.  Events are immutable once produced.

use f1_protocol::Domain;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// CanonicalEvent
// ---------------------------------------------------------------------------

/// The normalizer's output for one accepted frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalEvent {
    /// The upstream feed name, verbatim (also for feeds outside the closed
    /// set, which carry a [`EventBody::Generic`] body).
    pub feed_name: String,
    /// Raw upstream timestamp string.
    pub timestamp: String,
    pub body: EventBody,
}

impl CanonicalEvent {
    /// The request/recovery domain this event updates, if any.
    ///
    /// Telemetry, race control, heartbeats and generic events are cached or
    /// broadcast but are not one of the six domain views.
    pub fn domain(&self) -> Option<Domain> {
        match self.body {
            EventBody::Session(_) | EventBody::SessionData(_) => Some(Domain::Session),
            EventBody::Drivers(_) => Some(Domain::Drivers),
            EventBody::Timing(_) => Some(Domain::Timing),
            EventBody::Weather(_) => Some(Domain::Weather),
            EventBody::Track(_) => Some(Domain::Track),
            EventBody::Position(_) => Some(Domain::Position),
            EventBody::Car(_)
            | EventBody::RaceControl(_)
            | EventBody::Heartbeat(_)
            | EventBody::Generic(_) => None,
        }
    }

    /// Serialize the body to the JSON payload broadcast to subscribers and
    /// written to the cache.
    pub fn payload(&self) -> Value {
        match &self.body {
            EventBody::Session(v)
            | EventBody::SessionData(v)
            | EventBody::Drivers(v)
            | EventBody::Weather(v)
            | EventBody::Track(v)
            | EventBody::RaceControl(v)
            | EventBody::Heartbeat(v)
            | EventBody::Generic(v) => v.clone(),
            EventBody::Timing(t) => serde_json::to_value(t).unwrap_or(Value::Null),
            EventBody::Car(c) => serde_json::to_value(c).unwrap_or(Value::Null),
            EventBody::Position(p) => serde_json::to_value(p).unwrap_or(Value::Null),
        }
    }
}

/// Kind-specific body of a canonical event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventBody {
    /// SessionInfo, re-keyed to lowerCamelCase.
    Session(Value),
    /// SessionData, re-keyed to lowerCamelCase.
    SessionData(Value),
    /// DriverList, re-keyed to lowerCamelCase.
    Drivers(Value),
    Timing(TimingUpdate),
    Car(CarUpdate),
    Position(PositionUpdate),
    /// Weather, re-keyed to lowerCamelCase.
    Weather(Value),
    /// TrackStatus, re-keyed, with the mapped `flag` name added.
    Track(Value),
    /// RaceControl, re-keyed to lowerCamelCase.
    RaceControl(Value),
    /// Upstream heartbeat payload, untouched.
    Heartbeat(Value),
    /// Unknown feed name: the raw payload, unchanged.
    Generic(Value),
}

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Whether a car is circulating.  Derived from the upstream `Stopped` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverStatus {
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "STOPPED")]
    Stopped,
}

/// Per-driver slice of a TimingData frame.
///
/// `best_lap` is `Some` only when the frame carried a non-empty
/// `BestLapTime.Value` — absence is distinct from null and drives the
/// overwrite-on-presence merge rule in the driver table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverTiming {
    pub position: Option<u32>,
    pub last_lap: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_lap: Option<String>,
    pub laps: Option<u32>,
    pub sectors: Vec<Option<String>>,
    pub gap: Option<String>,
    pub interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DriverStatus>,
    pub in_pit: Option<bool>,
    pub retired: Option<bool>,
}

/// Holder of a fastest time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FastestMark {
    pub driver_number: String,
    pub time: String,
}

/// Session-wide fastest overall lap and per-sector times.
///
/// Updated when a strictly smaller lexicographically-compared time string
/// is seen; correct for the fixed-width "M:SS.sss" format upstream uses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FastestBoard {
    pub overall: Option<FastestMark>,
    pub sectors: [Option<FastestMark>; 3],
}

impl FastestBoard {
    /// Offer a candidate overall lap time.
    pub fn offer_overall(&mut self, driver: &str, time: &str) {
        offer(&mut self.overall, driver, time);
    }

    /// Offer a candidate time for sector `i` (0..3).
    pub fn offer_sector(&mut self, i: usize, driver: &str, time: &str) {
        if let Some(slot) = self.sectors.get_mut(i) {
            offer(slot, driver, time);
        }
    }
}

fn offer(slot: &mut Option<FastestMark>, driver: &str, time: &str) {
    if time.is_empty() {
        return;
    }
    let faster = match slot {
        Some(held) => time < held.time.as_str(),
        None => true,
    };
    if faster {
        *slot = Some(FastestMark {
            driver_number: driver.to_owned(),
            time: time.to_owned(),
        });
    }
}

/// Canonical body of a TimingData frame: the per-driver map plus the
/// running fastest board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingUpdate {
    pub drivers: BTreeMap<String, DriverTiming>,
    pub fastest: FastestBoard,
}

// ---------------------------------------------------------------------------
// Car telemetry / position
// ---------------------------------------------------------------------------

/// Channel-extracted car telemetry (speed=0, rpm=2, gear=3, throttle=4,
/// brake=5, drs=45).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CarTelemetry {
    pub speed: Option<f64>,
    pub rpm: Option<f64>,
    pub gear: Option<f64>,
    pub throttle: Option<f64>,
    pub brake: Option<f64>,
    pub drs: Option<f64>,
}

/// Canonical body of a CarData frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarUpdate {
    pub cars: BTreeMap<String, CarTelemetry>,
}

/// One car's track position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverPosition {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub status: Option<String>,
}

/// Canonical body of a Position frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub positions: BTreeMap<String, DriverPosition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fastest_board_keeps_strictly_smaller_times_only() {
        let mut board = FastestBoard::default();
        board.offer_overall("44", "1:24.000");
        board.offer_overall("1", "1:23.456");
        // Equal time does not displace the holder.
        board.offer_overall("16", "1:23.456");
        let overall = board.overall.as_ref().unwrap();
        assert_eq!(overall.driver_number, "1");
        assert_eq!(overall.time, "1:23.456");
    }

    #[test]
    fn fastest_board_ignores_empty_times_and_bad_sector_index() {
        let mut board = FastestBoard::default();
        board.offer_overall("1", "");
        assert!(board.overall.is_none());
        board.offer_sector(7, "1", "28.000");
        assert_eq!(board.sectors, [None, None, None]);
        board.offer_sector(1, "1", "28.000");
        assert_eq!(board.sectors[1].as_ref().unwrap().time, "28.000");
    }

    #[test]
    fn timing_body_serializes_best_lap_only_when_present() {
        let mut drivers = BTreeMap::new();
        drivers.insert(
            "1".to_owned(),
            DriverTiming {
                position: Some(1),
                last_lap: Some("1:23.456".to_owned()),
                ..DriverTiming::default()
            },
        );
        let update = TimingUpdate {
            drivers,
            fastest: FastestBoard::default(),
        };
        let v = serde_json::to_value(&update).unwrap();
        assert_eq!(v["drivers"]["1"]["lastLap"], "1:23.456");
        assert!(v["drivers"]["1"].get("bestLap").is_none());
    }

    #[test]
    fn event_domains_cover_the_six_views() {
        let ev = |body| CanonicalEvent {
            feed_name: "x".to_owned(),
            timestamp: "t".to_owned(),
            body,
        };
        use f1_protocol::Domain;
        assert_eq!(
            ev(EventBody::Session(Value::Null)).domain(),
            Some(Domain::Session)
        );
        assert_eq!(
            ev(EventBody::SessionData(Value::Null)).domain(),
            Some(Domain::Session)
        );
        assert_eq!(ev(EventBody::Car(CarUpdate { cars: BTreeMap::new() })).domain(), None);
        assert_eq!(ev(EventBody::Generic(Value::Null)).domain(), None);
    }
}
