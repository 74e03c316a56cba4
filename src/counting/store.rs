//! Persistence collaborator for the counting engine.
//!
//! The engine never writes anything itself. The processor reads lanes through
//! [`LaneStore`] and applies the `PersistIntent` of each completion back
//! through it. [`MemoryStore`] is the in-process implementation used by the
//! CLI and tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

use super::models::{LaneRecord, LaneUpdateIntent, OccupancyIncrement, ParkingLot};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Lane not found: {0}")]
    LaneNotFound(String),

    #[error("Parking lot not found: {0}")]
    ParkingLotNotFound(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Lane and parking lot persistence used by the counting processor.
///
/// Implementations must make `increment_occupancy` an atomic increment:
/// several lanes may feed the same lot concurrently.
#[async_trait]
pub trait LaneStore: Send + Sync + 'static {
    /// All lanes that reference the sensor as front or back.
    async fn lanes_for_sensor(&self, sensor_id: &str) -> Result<Vec<LaneRecord>, StoreError>;

    /// Latest persisted record of a lane.
    async fn lane(&self, lane_id: &str) -> Result<Option<LaneRecord>, StoreError>;

    async fn update_lane(&self, update: &LaneUpdateIntent) -> Result<(), StoreError>;

    async fn increment_occupancy(&self, increment: &OccupancyIncrement) -> Result<(), StoreError>;
}

/// In-memory lane store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    lanes: RwLock<BTreeMap<String, LaneRecord>>,
    parking_lots: RwLock<BTreeMap<String, ParkingLot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with lanes and lots.
    pub fn with_records(
        lanes: impl IntoIterator<Item = LaneRecord>,
        parking_lots: impl IntoIterator<Item = ParkingLot>,
    ) -> Self {
        let store = Self::new();
        for lane in lanes {
            store.insert_lane(lane);
        }
        for lot in parking_lots {
            store.insert_parking_lot(lot);
        }
        store
    }

    pub fn insert_lane(&self, lane: LaneRecord) {
        self.lanes.write().insert(lane.id.clone(), lane);
    }

    pub fn insert_parking_lot(&self, lot: ParkingLot) {
        self.parking_lots.write().insert(lot.id.clone(), lot);
    }

    /// Snapshot of all lanes, ordered by id.
    pub fn lanes(&self) -> Vec<LaneRecord> {
        self.lanes.read().values().cloned().collect()
    }

    /// Snapshot of all parking lots, ordered by id.
    pub fn parking_lots(&self) -> Vec<ParkingLot> {
        self.parking_lots.read().values().cloned().collect()
    }

    pub fn parking_lot(&self, id: &str) -> Option<ParkingLot> {
        self.parking_lots.read().get(id).cloned()
    }
}

#[async_trait]
impl LaneStore for MemoryStore {
    async fn lanes_for_sensor(&self, sensor_id: &str) -> Result<Vec<LaneRecord>, StoreError> {
        Ok(self
            .lanes
            .read()
            .values()
            .filter(|lane| lane.references_sensor(sensor_id))
            .cloned()
            .collect())
    }

    async fn lane(&self, lane_id: &str) -> Result<Option<LaneRecord>, StoreError> {
        Ok(self.lanes.read().get(lane_id).cloned())
    }

    async fn update_lane(&self, update: &LaneUpdateIntent) -> Result<(), StoreError> {
        let mut lanes = self.lanes.write();
        let lane = lanes
            .get_mut(&update.lane_id)
            .ok_or_else(|| StoreError::LaneNotFound(update.lane_id.clone()))?;
        lane.count = update.count;
        lane.state = Some(update.state.clone());
        Ok(())
    }

    async fn increment_occupancy(&self, increment: &OccupancyIncrement) -> Result<(), StoreError> {
        let mut lots = self.parking_lots.write();
        let lot = lots
            .get_mut(&increment.parking_lot_id)
            .ok_or_else(|| StoreError::ParkingLotNotFound(increment.parking_lot_id.clone()))?;
        lot.count += increment.amount;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counting::models::LaneState;

    fn store() -> MemoryStore {
        MemoryStore::with_records(
            [
                LaneRecord::new("in", "A", "B", true).with_parking_lot("lot"),
                LaneRecord::new("out", "B", "C", false).with_parking_lot("lot"),
            ],
            [ParkingLot::new("lot", 2)],
        )
    }

    #[tokio::test]
    async fn test_lanes_for_sensor_fans_out() {
        let store = store();

        let ids: Vec<String> = store
            .lanes_for_sensor("b")
            .await
            .unwrap()
            .into_iter()
            .map(|lane| lane.id)
            .collect();
        assert_eq!(ids, vec!["in".to_string(), "out".to_string()]);

        assert_eq!(store.lanes_for_sensor("A").await.unwrap().len(), 1);
        assert!(store.lanes_for_sensor("Z").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_lane() {
        let store = store();
        let update = LaneUpdateIntent {
            lane_id: "in".to_string(),
            count: 7,
            state: LaneState::default(),
        };
        store.update_lane(&update).await.unwrap();

        let lane = store.lane("in").await.unwrap().unwrap();
        assert_eq!(lane.count, 7);
        assert_eq!(lane.state, Some(LaneState::default()));
    }

    #[tokio::test]
    async fn test_update_missing_lane_fails() {
        let store = store();
        let update = LaneUpdateIntent {
            lane_id: "ghost".to_string(),
            count: 1,
            state: LaneState::default(),
        };
        let err = store.update_lane(&update).await.unwrap_err();
        assert!(matches!(err, StoreError::LaneNotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_occupancy_is_stored_raw() {
        let store = store();
        for _ in 0..3 {
            store
                .increment_occupancy(&OccupancyIncrement {
                    parking_lot_id: "lot".to_string(),
                    amount: 1,
                })
                .await
                .unwrap();
        }

        let lot = store.parking_lot("lot").unwrap();
        assert_eq!(lot.count, 3);
        assert_eq!(lot.display_count(), 2);
    }
}
