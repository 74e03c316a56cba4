//! Dual-sensor lane counting engine
//!
//! Each lane carries two counter-mode sensors (front and back) that report a
//! wrapping 7-bit traffic counter. The engine turns their reports into a
//! running vehicle count per lane and a signed occupancy change per lot.
//!
//! ## Architecture
//!
//! ### Delta algorithm (`algorithm`)
//! - Pure arithmetic over the last two readings of both sensors
//! - Suppresses stalled sensors and credits one unit when both stall
//!
//! ### Lane state machine (`machine`)
//! - Classifies each event as reset, single, both, repeat or timeout
//! - Rebuilt from the persisted lane record for every event
//!
//! ### Active lane registry (`registry`)
//! - At most one debounce timer per lane
//! - Newer events cancel the pending timer before running
//!
//! ### Processor (`processor`)
//! - Single scheduler for events and timer expirations
//! - Persists through a [`LaneStore`]

pub mod algorithm;
pub mod machine;
pub mod models;
pub mod processor;
pub mod registry;
pub mod store;


pub use algorithm::{counter_difference, reconcile, Reconciliation, SensorSnapshot};
pub use machine::{LaneMachine, SensorPosition, Step, Transition};
pub use models::{
    CounterReading, CountingEvent, LaneCompletion, LaneRecord, LaneState, LaneUpdates,
    ParkingLot, PersistIntent, SensorCounterState, DEFAULT_TIMEOUT_SECS, RESET_SENTINEL,
};
pub use processor::{CountingProcessor, ProcessorConfig, ProcessorEvent};
pub use registry::{LaneRegistry, TimerExpired};
pub use store::{LaneStore, MemoryStore, StoreError};
