//! Lane vehicle counting from pairs of counter-mode sensors.
//!
//! See [`counting`] for the engine. [`settings`] loads the TOML
//! configuration and the `cli` feature adds the `lanecount-cli` replay tool.

pub mod counting;
pub mod error;
pub mod settings;

#[cfg(feature = "cli")]
pub mod cli;

pub use counting::{CountingEvent, CountingProcessor, LaneRecord, ParkingLot, ProcessorConfig};
pub use error::{CountingError, Result};
