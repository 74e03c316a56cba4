use serde::Serialize;
use thiserror::Error;

use crate::counting::store::StoreError;

#[derive(Debug, Error)]
pub enum CountingError {
    #[error("Invalid counter value {count} from sensor {sensor_id} (expected 0..=128)")]
    InvalidCount { sensor_id: String, count: u8 },

    #[error("Sensor {sensor_id} is not assigned to lane {lane_id}")]
    UnknownSensor { lane_id: String, sensor_id: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Counting processor is not running")]
    ProcessorClosed,
}

// Errors travel inside JSON observer events
impl Serialize for CountingError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CountingError>;
