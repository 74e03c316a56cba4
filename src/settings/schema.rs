//! Settings schema.
//!
//! All settings structs use `#[serde(default)]` so partial files load.

use serde::{Deserialize, Serialize};

use crate::counting::models::{LaneRecord, ParkingLot, DEFAULT_TIMEOUT_SECS};
use crate::counting::processor::ProcessorConfig;

/// Root settings structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanecountSettings {
    /// Schema version for migrations
    pub version: u32,

    pub engine: EngineSettings,

    pub logging: LoggingSettings,

    /// Lots seeded into the in-memory store
    pub parking_lots: Vec<ParkingLot>,

    /// Lanes seeded into the in-memory store
    pub lanes: Vec<LaneRecord>,
}

impl Default for LanecountSettings {
    fn default() -> Self {
        Self {
            version: 1,
            engine: EngineSettings::default(),
            logging: LoggingSettings::default(),
            parking_lots: Vec::new(),
            lanes: Vec::new(),
        }
    }
}

/// Counting engine tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Debounce window for lanes that do not set `timeout_secs`.
    /// Zero or negative waits for the counterpart sensor indefinitely.
    pub default_timeout_secs: f64,

    /// Events buffered before `submit` applies back-pressure
    pub queue_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            queue_capacity: 256,
        }
    }
}

impl EngineSettings {
    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            default_timeout_secs: self.default_timeout_secs,
            queue_capacity: self.queue_capacity,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `tracing` filter directive, e.g. "lanecount=debug"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}
