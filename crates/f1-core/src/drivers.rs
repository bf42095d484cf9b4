//! Driver-state accumulator.
//!
//! [`DriverTable`] merges partial timing updates into one record per driver
//! and produces the standings ordering on demand.
//!
//! # Merge rules
//! - Fields set to non-null in the event overwrite the prior value.
//! - `best_lap` overwrites only when the event carries the field (presence,
//!   not null).
//! - `completed_laps` takes `max(old, new)` and never decreases.

use crate::event::{DriverStatus, DriverTiming, TimingUpdate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// DriverRecord
// ---------------------------------------------------------------------------

/// Merged state for one driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverRecord {
    #[serde(rename = "driverNumber")]
    pub number: String,
    pub name: String,
    pub position: Option<u32>,
    pub last_lap: Option<String>,
    pub best_lap: Option<String>,
    pub completed_laps: u32,
    pub gap: Option<String>,
    pub interval: Option<String>,
    pub in_pit: bool,
    pub retired: bool,
    pub status: DriverStatus,
    pub updated_at: String,
}

impl DriverRecord {
    fn new(number: &str, name: String) -> Self {
        DriverRecord {
            number: number.to_owned(),
            name,
            position: None,
            last_lap: None,
            best_lap: None,
            completed_laps: 0,
            gap: None,
            interval: None,
            in_pit: false,
            retired: false,
            status: DriverStatus::Running,
            updated_at: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// DriverTable
// ---------------------------------------------------------------------------

/// Map from driver number to merged record, plus the configured name lookup.
///
/// Single-writer (the coordinator); readers take snapshots via
/// [`DriverTable::standings`].
#[derive(Debug, Default)]
pub struct DriverTable {
    records: HashMap<String, DriverRecord>,
    names: HashMap<String, String>,
}

impl DriverTable {
    pub fn new() -> Self {
        DriverTable::default()
    }

    /// Build a table with a pre-seeded driver-number → name lookup.
    pub fn with_names(names: HashMap<String, String>) -> Self {
        DriverTable {
            records: HashMap::new(),
            names,
        }
    }

    /// Merge one timing update.  Unknown drivers are inserted with a default
    /// record named from the lookup (fallback `#<number>`).
    pub fn apply_timing(&mut self, update: &TimingUpdate, timestamp: &str) {
        for (number, timing) in &update.drivers {
            let name = self.display_name(number);
            let record = self
                .records
                .entry(number.clone())
                .or_insert_with(|| DriverRecord::new(number, name));
            merge(record, timing);
            record.updated_at = timestamp.to_owned();
        }
    }

    /// Refresh driver names from a (re-keyed) DriverList payload.
    pub fn apply_driver_list(&mut self, data: &Value) {
        let Some(entries) = data.as_object() else {
            return;
        };
        for (number, entry) in entries {
            let Some(name) = entry
                .get("fullName")
                .or_else(|| entry.get("broadcastName"))
                .or_else(|| entry.get("lastName"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            self.names.insert(number.clone(), name.to_owned());
            if let Some(record) = self.records.get_mut(number) {
                record.name = name.to_owned();
            }
        }
    }

    pub fn get(&self, number: &str) -> Option<&DriverRecord> {
        self.records.get(number)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The totally ordered standings view: ascending by position, drivers
    /// without a position last, ties broken by numeric driver number.
    /// Produced on demand; callers own the returned copy.
    pub fn standings(&self) -> Vec<DriverRecord> {
        let mut rows: Vec<DriverRecord> = self.records.values().cloned().collect();
        rows.sort_by_key(|r| {
            (
                r.position.unwrap_or(u32::MAX),
                r.number.parse::<u32>().unwrap_or(u32::MAX),
                r.number.clone(),
            )
        });
        rows
    }

    fn display_name(&self, number: &str) -> String {
        self.names
            .get(number)
            .cloned()
            .unwrap_or_else(|| format!("#{number}"))
    }
}

fn merge(record: &mut DriverRecord, timing: &DriverTiming) {
    if let Some(position) = timing.position {
        record.position = Some(position);
    }
    if let Some(lap) = &timing.last_lap {
        record.last_lap = Some(lap.clone());
    }
    // Overwrite on presence, even when slower than the held value.
    if let Some(best) = &timing.best_lap {
        record.best_lap = Some(best.clone());
    }
    if let Some(laps) = timing.laps {
        record.completed_laps = record.completed_laps.max(laps);
    }
    if let Some(gap) = &timing.gap {
        record.gap = Some(gap.clone());
    }
    if let Some(interval) = &timing.interval {
        record.interval = Some(interval.clone());
    }
    if let Some(status) = timing.status {
        record.status = status;
    }
    if let Some(in_pit) = timing.in_pit {
        record.in_pit = in_pit;
    }
    if let Some(retired) = timing.retired {
        record.retired = retired;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::FastestBoard;
    use std::collections::BTreeMap;

    fn update_for(number: &str, timing: DriverTiming) -> TimingUpdate {
        let mut drivers = BTreeMap::new();
        drivers.insert(number.to_owned(), timing);
        TimingUpdate {
            drivers,
            fastest: FastestBoard::default(),
        }
    }

    #[test]
    fn unknown_driver_inserted_with_fallback_name() {
        let mut table = DriverTable::new();
        table.apply_timing(&update_for("81", DriverTiming::default()), "T1");
        assert_eq!(table.get("81").unwrap().name, "#81");
    }

    #[test]
    fn configured_name_lookup_wins_over_fallback() {
        let mut names = HashMap::new();
        names.insert("1".to_owned(), "Max Verstappen".to_owned());
        let mut table = DriverTable::with_names(names);
        table.apply_timing(&update_for("1", DriverTiming::default()), "T1");
        assert_eq!(table.get("1").unwrap().name, "Max Verstappen");
    }

    #[test]
    fn best_lap_survives_events_that_omit_the_field() {
        let mut table = DriverTable::new();
        table.apply_timing(
            &update_for("1", DriverTiming {
                best_lap: Some("1:23.456".to_owned()),
                ..DriverTiming::default()
            }),
            "T1",
        );
        table.apply_timing(&update_for("1", DriverTiming::default()), "T2");
        assert_eq!(table.get("1").unwrap().best_lap.as_deref(), Some("1:23.456"));
    }

    #[test]
    fn best_lap_overwrites_on_presence_even_when_slower() {
        let mut table = DriverTable::new();
        table.apply_timing(
            &update_for("1", DriverTiming {
                best_lap: Some("1:23.456".to_owned()),
                ..DriverTiming::default()
            }),
            "T1",
        );
        table.apply_timing(
            &update_for("1", DriverTiming {
                best_lap: Some("1:24.000".to_owned()),
                ..DriverTiming::default()
            }),
            "T2",
        );
        assert_eq!(table.get("1").unwrap().best_lap.as_deref(), Some("1:24.000"));
    }

    #[test]
    fn completed_laps_never_decrease() {
        let mut table = DriverTable::new();
        table.apply_timing(
            &update_for("1", DriverTiming {
                laps: Some(10),
                ..DriverTiming::default()
            }),
            "T1",
        );
        table.apply_timing(
            &update_for("1", DriverTiming {
                laps: Some(7),
                ..DriverTiming::default()
            }),
            "T2",
        );
        assert_eq!(table.get("1").unwrap().completed_laps, 10);
    }

    #[test]
    fn applying_the_same_event_twice_is_a_no_op() {
        let update = update_for("1", DriverTiming {
            position: Some(3),
            last_lap: Some("1:25.100".to_owned()),
            best_lap: Some("1:23.456".to_owned()),
            laps: Some(12),
            gap: Some("+4.2".to_owned()),
            interval: Some("+1.1".to_owned()),
            in_pit: Some(false),
            ..DriverTiming::default()
        });
        let mut table = DriverTable::new();
        table.apply_timing(&update, "T1");
        let first = table.get("1").unwrap().clone();
        table.apply_timing(&update, "T1");
        assert_eq!(*table.get("1").unwrap(), first);
    }

    #[test]
    fn standings_order_position_asc_nulls_last_numeric_tiebreak() {
        let mut table = DriverTable::new();
        for (number, position) in [("44", Some(2)), ("1", Some(1)), ("10", None), ("2", None)] {
            table.apply_timing(
                &update_for(number, DriverTiming {
                    position,
                    ..DriverTiming::default()
                }),
                "T1",
            );
        }
        let order: Vec<String> = table.standings().into_iter().map(|r| r.number).collect();
        assert_eq!(order, vec!["1", "44", "2", "10"]);
    }

    #[test]
    fn driver_list_updates_names_for_existing_records() {
        let mut table = DriverTable::new();
        table.apply_timing(&update_for("1", DriverTiming::default()), "T1");
        table.apply_driver_list(&serde_json::json!({
            "1": {"fullName": "Max VERSTAPPEN"},
            "44": {"broadcastName": "L HAMILTON"}
        }));
        assert_eq!(table.get("1").unwrap().name, "Max VERSTAPPEN");
        // Name is remembered for a later insert.
        table.apply_timing(&update_for("44", DriverTiming::default()), "T2");
        assert_eq!(table.get("44").unwrap().name, "L HAMILTON");
    }

    #[test]
    fn standings_serialize_with_driver_number_field() {
        let mut table = DriverTable::new();
        table.apply_timing(
            &update_for("1", DriverTiming {
                position: Some(1),
                ..DriverTiming::default()
            }),
            "T1",
        );
        let rows = serde_json::to_value(table.standings()).unwrap();
        assert_eq!(rows[0]["driverNumber"], "1");
        assert_eq!(rows[0]["position"], 1);
    }
}
