//! Data model shared by the counting engine and its persistence collaborator.
//!
//! `LaneRecord` and `ParkingLot` are owned by the store; the engine reads a
//! lane in, runs one transition and hands back a `LaneCompletion`, from which
//! the processor derives a `PersistIntent`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::algorithm::SensorSnapshot;

/// Raw counter value reported by firmware after a reboot or recalibration.
pub const RESET_SENTINEL: u8 = 128;

/// Debounce window used when a lane does not configure one.
pub const DEFAULT_TIMEOUT_SECS: f64 = 10.0;

/// Compare sensor identifiers the way the uplink network reports them.
pub fn same_sensor(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// A single observation of a sensor's counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterReading {
    /// Counter value, 0..=127 (a reset is stored as 0)
    pub count: u8,
    pub time: DateTime<Utc>,
    pub frame_count: u32,
    /// True when this reading came from a reset sentinel
    #[serde(default)]
    pub was_reset: bool,
}

/// Per-position counting state, persisted inside the lane record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorCounterState {
    #[serde(alias = "id", alias = "sensorId")]
    pub sensor_id: String,

    /// Reported since the last reconciliation
    #[serde(default)]
    pub seen: bool,

    #[serde(default)]
    pub current: Option<CounterReading>,

    #[serde(default)]
    pub previous: Option<CounterReading>,

    /// Consecutive cycles without counter movement
    #[serde(default)]
    pub inactive: u8,

    /// Adjusted delta credited last cycle
    #[serde(default, alias = "prevChange")]
    pub prev_change: u32,
}

impl SensorCounterState {
    /// Fresh state for a newly assigned sensor.
    pub fn initial(sensor_id: impl Into<String>) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            seen: false,
            current: None,
            previous: None,
            inactive: 0,
            prev_change: 0,
        }
    }

    pub fn belongs_to(&self, sensor_id: &str) -> bool {
        same_sensor(&self.sensor_id, sensor_id)
    }

    /// Shift `current` into `previous` and install the new reading.
    pub fn push(&mut self, reading: Option<CounterReading>) {
        self.previous = self.current.take();
        self.current = reading;
    }

    /// Treat the sensor as silent: its current reading is observed again.
    pub fn repeat_current(&mut self) {
        let current = self.current.clone();
        self.push(current);
    }

    pub fn snapshot(&self) -> SensorSnapshot {
        SensorSnapshot {
            current: self.current.as_ref().map_or(0, |r| r.count),
            previous: self.previous.as_ref().map_or(0, |r| r.count),
            inactive: self.inactive,
            prev_change: self.prev_change,
        }
    }
}

/// Counting state for both ends of a lane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneState {
    #[serde(default)]
    pub front: Option<SensorCounterState>,
    #[serde(default)]
    pub back: Option<SensorCounterState>,
}

/// A lane as persisted by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneRecord {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    pub front_id: String,
    pub back_id: String,

    /// Lot whose occupancy this lane feeds
    #[serde(default)]
    pub parking_lot_id: Option<String>,

    /// true = traversal enters the lot, false = exits it
    pub direction: bool,

    /// Debounce window in seconds; absent means the engine default, 0 disables it
    #[serde(default)]
    pub timeout_secs: Option<f64>,

    /// Running total of vehicles, never clamped
    #[serde(default)]
    pub count: i64,

    #[serde(default)]
    pub state: Option<LaneState>,
}

impl LaneRecord {
    pub fn new(
        id: impl Into<String>,
        front_id: impl Into<String>,
        back_id: impl Into<String>,
        direction: bool,
    ) -> Self {
        Self {
            id: id.into(),
            name: None,
            front_id: front_id.into(),
            back_id: back_id.into(),
            parking_lot_id: None,
            direction,
            timeout_secs: None,
            count: 0,
            state: None,
        }
    }

    pub fn with_timeout_secs(mut self, secs: f64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_parking_lot(mut self, parking_lot_id: impl Into<String>) -> Self {
        self.parking_lot_id = Some(parking_lot_id.into());
        self
    }

    /// Resolve the debounce window. `None` means single-sensor events wait
    /// for the counterpart indefinitely, which is also what a window too
    /// large for `Duration` amounts to.
    pub fn debounce_window(&self, default_secs: f64) -> Option<Duration> {
        let secs = self.timeout_secs.unwrap_or(default_secs);
        if secs > 0.0 {
            Duration::try_from_secs_f64(secs).ok()
        } else {
            None
        }
    }

    pub fn references_sensor(&self, sensor_id: &str) -> bool {
        same_sensor(&self.front_id, sensor_id) || same_sensor(&self.back_id, sensor_id)
    }

    /// Apply a completion to this record, as the store would.
    pub fn apply(&mut self, updates: &LaneUpdates) {
        self.count = updates.count;
        self.state = Some(updates.state.clone());
    }
}

/// Normalized counter-mode report from the uplink decoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountingEvent {
    #[serde(alias = "sensorId")]
    pub sensor_id: String,

    /// Raw firmware counter, 0..=127, or `RESET_SENTINEL`
    pub count: u8,

    pub time: DateTime<Utc>,

    #[serde(default, alias = "frameCount")]
    pub frame_count: u32,
}

impl CountingEvent {
    pub fn new(sensor_id: impl Into<String>, count: u8, time: DateTime<Utc>) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            count,
            time,
            frame_count: 0,
        }
    }

    pub fn with_frame_count(mut self, frame_count: u32) -> Self {
        self.frame_count = frame_count;
        self
    }

    pub fn is_reset(&self) -> bool {
        self.count == RESET_SENTINEL
    }

    /// Reading to store for this event. Resets are coerced to 0.
    pub fn reading(&self) -> CounterReading {
        let was_reset = self.is_reset();
        CounterReading {
            count: if was_reset { 0 } else { self.count },
            time: self.time,
            frame_count: self.frame_count,
            was_reset,
        }
    }
}

/// Field updates produced by one transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneUpdates {
    /// New running total for the lane
    pub count: i64,
    /// Vehicles credited by this transition
    pub change: u32,
    pub state: LaneState,
}

/// Result reported for every processed event or expired timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneCompletion {
    pub lane_id: String,
    pub updates: LaneUpdates,
}

/// A parking lot fed by one or more lanes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkingLot {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub total_spaces: i64,
    /// Raw occupancy counter; may drift outside `[0, total_spaces]`
    #[serde(default)]
    pub count: i64,
}

impl ParkingLot {
    pub fn new(id: impl Into<String>, total_spaces: i64) -> Self {
        Self {
            id: id.into(),
            name: None,
            total_spaces,
            count: 0,
        }
    }

    /// Occupancy as shown to users.
    pub fn display_count(&self) -> i64 {
        self.count.clamp(0, self.total_spaces.max(0))
    }
}

/// Write the store must perform on the lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneUpdateIntent {
    pub lane_id: String,
    pub count: i64,
    pub state: LaneState,
}

/// Signed increment of a lot's raw occupancy counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyIncrement {
    pub parking_lot_id: String,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistIntent {
    pub lane: LaneUpdateIntent,
    pub occupancy: Option<OccupancyIncrement>,
}

impl PersistIntent {
    pub fn from_completion(completion: &LaneCompletion, lane: &LaneRecord) -> Self {
        let updates = &completion.updates;
        let occupancy = match (&lane.parking_lot_id, updates.change) {
            (Some(parking_lot_id), change) if change > 0 => {
                let scale = if lane.direction { 1 } else { -1 };
                Some(OccupancyIncrement {
                    parking_lot_id: parking_lot_id.clone(),
                    amount: i64::from(change) * scale,
                })
            }
            _ => None,
        };

        Self {
            lane: LaneUpdateIntent {
                lane_id: completion.lane_id.clone(),
                count: updates.count,
                state: updates.state.clone(),
            },
            occupancy,
        }
    }
}
