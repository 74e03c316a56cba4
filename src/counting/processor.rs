//! Counting processor: the single logical scheduler of the engine.
//!
//! Events and timer expirations for every lane are handled one at a time by
//! a background task, updating through the [`LaneStore`]:
//! - lane `count` and `state` after every transition
//! - parking lot occupancy when a transition credited vehicles

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use super::machine::{Step, Transition};
use super::models::{
    CountingEvent, LaneCompletion, LaneRecord, PersistIntent, DEFAULT_TIMEOUT_SECS,
};
use super::registry::{LaneRegistry, TimerExpired};
use super::store::{LaneStore, StoreError};
use crate::error::{CountingError, Result};

/// Task sent to the processor
#[derive(Debug)]
pub enum ProcessorTask {
    /// Process a counting event
    Count(Box<CountingEvent>),
    /// Drop the pending timer of one lane
    EvictLane { lane_id: String },
    /// Drop every pending timer
    EvictAll,
    /// Signal once no debounce timer is pending
    Drain { done: oneshot::Sender<()> },
    /// Shutdown the processor
    Shutdown { done: oneshot::Sender<()> },
}

/// Observable outcome of processing.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessorEvent {
    /// A transition completed and was persisted
    Completed {
        transition: Transition,
        completion: LaneCompletion,
        intent: PersistIntent,
    },
    /// An event could not be applied to a lane
    Rejected {
        sensor_id: String,
        lane_id: Option<String>,
        error: String,
    },
    /// A completion could not be persisted; its delta is lost
    PersistFailed { lane_id: String, error: String },
}

/// Configuration for the processor
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Debounce window for lanes without their own
    pub default_timeout_secs: f64,
    /// Bound of the task queue
    pub queue_capacity: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            queue_capacity: 256,
        }
    }
}

/// Handle to a running counting processor
pub struct CountingProcessor {
    task_tx: mpsc::Sender<ProcessorTask>,
    registry: Arc<LaneRegistry>,
}

impl CountingProcessor {
    /// Create a new processor and spawn its background task
    pub fn spawn<S: LaneStore>(
        store: Arc<S>,
        config: ProcessorConfig,
        observer: Option<mpsc::UnboundedSender<ProcessorEvent>>,
    ) -> Self {
        let (task_tx, task_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (registry, expiry_rx) = LaneRegistry::new(config.default_timeout_secs);
        let registry = Arc::new(registry);

        let worker = Worker {
            store,
            registry: registry.clone(),
            observer,
        };
        tokio::spawn(async move {
            worker.run(task_rx, expiry_rx).await;
        });

        Self { task_tx, registry }
    }

    /// Queue an event, waiting for room if the queue is full
    pub async fn submit(&self, event: CountingEvent) -> Result<()> {
        self.send(ProcessorTask::Count(Box::new(event))).await
    }

    /// Drop the pending timer of a lane, e.g. after the lane was reassigned
    pub async fn evict_lane(&self, lane_id: impl Into<String>) -> Result<()> {
        self.send(ProcessorTask::EvictLane {
            lane_id: lane_id.into(),
        })
        .await
    }

    /// Drop every pending timer
    pub async fn evict_all(&self) -> Result<()> {
        self.send(ProcessorTask::EvictAll).await
    }

    /// Wait until every queued event is handled and no timer is pending
    pub async fn drain(&self) -> Result<()> {
        let (done, done_rx) = oneshot::channel();
        self.send(ProcessorTask::Drain { done }).await?;
        done_rx.await.map_err(|_| CountingError::ProcessorClosed)
    }

    /// Shutdown the processor, dropping pending timers
    pub async fn shutdown(&self) -> Result<()> {
        let (done, done_rx) = oneshot::channel();
        self.send(ProcessorTask::Shutdown { done }).await?;
        done_rx.await.map_err(|_| CountingError::ProcessorClosed)
    }

    /// The registry owned by this processor
    pub fn registry(&self) -> &LaneRegistry {
        &self.registry
    }

    async fn send(&self, task: ProcessorTask) -> Result<()> {
        self.task_tx
            .send(task)
            .await
            .map_err(|_| CountingError::ProcessorClosed)
    }
}

struct Worker<S> {
    store: Arc<S>,
    registry: Arc<LaneRegistry>,
    observer: Option<mpsc::UnboundedSender<ProcessorEvent>>,
}

impl<S: LaneStore> Worker<S> {
    /// Main processor loop
    async fn run(
        self,
        mut task_rx: mpsc::Receiver<ProcessorTask>,
        mut expiry_rx: mpsc::UnboundedReceiver<TimerExpired>,
    ) {
        tracing::info!("Lane counting processor started");

        let mut drain_waiters: Vec<oneshot::Sender<()>> = Vec::new();

        loop {
            tokio::select! {
                task = task_rx.recv() => {
                    let Some(task) = task else {
                        self.registry.evict_all();
                        tracing::info!("Lane counting processor stopped: all handles dropped");
                        break;
                    };
                    match task {
                        ProcessorTask::Count(event) => self.handle_event(&event).await,
                        ProcessorTask::EvictLane { lane_id } => {
                            self.registry.evict(&lane_id);
                        }
                        ProcessorTask::EvictAll => {
                            let evicted = self.registry.evict_all();
                            tracing::debug!("Evicted {} pending timeouts", evicted);
                        }
                        ProcessorTask::Drain { done } => drain_waiters.push(done),
                        ProcessorTask::Shutdown { done } => {
                            let evicted = self.registry.evict_all();
                            tracing::info!(
                                "Lane counting processor shutting down ({} pending timeouts dropped)",
                                evicted
                            );
                            let _ = done.send(());
                            break;
                        }
                    }
                }
                Some(expired) = expiry_rx.recv() => self.handle_expiry(&expired).await,
            }

            if !drain_waiters.is_empty() && self.registry.pending_count() == 0 {
                for waiter in drain_waiters.drain(..) {
                    let _ = waiter.send(());
                }
            }
        }
    }

    /// Apply an event to every lane that references its sensor
    async fn handle_event(&self, event: &CountingEvent) {
        let lanes = match self.store.lanes_for_sensor(&event.sensor_id).await {
            Ok(lanes) => lanes,
            Err(e) => {
                tracing::error!("Failed to look up lanes for sensor {}: {}", event.sensor_id, e);
                self.emit(ProcessorEvent::Rejected {
                    sensor_id: event.sensor_id.clone(),
                    lane_id: None,
                    error: e.to_string(),
                });
                return;
            }
        };

        if lanes.is_empty() {
            tracing::debug!("Sensor {} is not assigned to any lane", event.sensor_id);
            return;
        }

        for lane in lanes {
            match self.registry.handle_event(&lane, event) {
                Ok(step) => self.persist(&lane, step).await,
                Err(e) => {
                    tracing::warn!(
                        "Rejected event from {} for lane {}: {}",
                        event.sensor_id,
                        lane.id,
                        e
                    );
                    self.emit(ProcessorEvent::Rejected {
                        sensor_id: event.sensor_id.clone(),
                        lane_id: Some(lane.id.clone()),
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    /// Complete a lane whose debounce window elapsed
    async fn handle_expiry(&self, expired: &TimerExpired) {
        let Some(step) = self.registry.expire(expired) else {
            return;
        };

        match self.store.lane(&expired.lane_id).await {
            Ok(Some(lane)) => self.persist(&lane, step).await,
            Ok(None) => self.persist_failed(
                &expired.lane_id,
                StoreError::LaneNotFound(expired.lane_id.clone()),
            ),
            Err(e) => self.persist_failed(&expired.lane_id, e),
        }
    }

    async fn persist(&self, lane: &LaneRecord, step: Step) {
        let intent = PersistIntent::from_completion(&step.completion, lane);

        if let Err(e) = self.apply(&intent).await {
            self.persist_failed(&lane.id, e);
            return;
        }

        self.emit(ProcessorEvent::Completed {
            transition: step.transition,
            completion: step.completion,
            intent,
        });
    }

    async fn apply(&self, intent: &PersistIntent) -> std::result::Result<(), StoreError> {
        self.store.update_lane(&intent.lane).await?;
        if let Some(occupancy) = &intent.occupancy {
            self.store.increment_occupancy(occupancy).await?;
        }
        Ok(())
    }

    fn persist_failed(&self, lane_id: &str, error: StoreError) {
        tracing::error!("Failed to persist completion for lane {}: {}", lane_id, error);
        self.emit(ProcessorEvent::PersistFailed {
            lane_id: lane_id.to_string(),
            error: error.to_string(),
        });
    }

    fn emit(&self, event: ProcessorEvent) {
        if let Some(observer) = &self.observer {
            // A dropped observer only means nobody is watching
            let _ = observer.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counting::models::{LaneUpdateIntent, OccupancyIncrement, ParkingLot};
    use crate::counting::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;

    fn test_config() -> ProcessorConfig {
        ProcessorConfig {
            default_timeout_secs: 0.02,
            queue_capacity: 16,
        }
    }

    fn collect(rx: &mut mpsc::UnboundedReceiver<ProcessorEvent>) -> Vec<ProcessorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_processor_lifecycle() {
        let store = Arc::new(MemoryStore::new());
        let processor = CountingProcessor::spawn(store, test_config(), None);
        processor.shutdown().await.unwrap();

        let err = processor
            .submit(CountingEvent::new("A", 1, Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, CountingError::ProcessorClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exiting_lane_decrements_lot() {
        let store = Arc::new(MemoryStore::with_records(
            [LaneRecord::new("exit", "A", "B", false).with_parking_lot("lot")],
            [ParkingLot::new("lot", 50)],
        ));
        let processor = CountingProcessor::spawn(store.clone(), test_config(), None);

        processor
            .submit(CountingEvent::new("A", 1, Utc::now()))
            .await
            .unwrap();
        processor
            .submit(CountingEvent::new("B", 1, Utc::now()))
            .await
            .unwrap();
        processor.drain().await.unwrap();

        let lot = store.parking_lot("lot").unwrap();
        assert_eq!(lot.count, -1);
        assert_eq!(lot.display_count(), 0);
        assert_eq!(store.lane("exit").await.unwrap().unwrap().count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_fans_out_to_every_lane() {
        let store = Arc::new(MemoryStore::with_records(
            [
                LaneRecord::new("in", "A", "B", true).with_timeout_secs(0.0),
                LaneRecord::new("out", "B", "C", false).with_timeout_secs(0.0),
            ],
            [],
        ));
        let (observer, mut events) = mpsc::unbounded_channel();
        let processor = CountingProcessor::spawn(store.clone(), test_config(), Some(observer));

        processor
            .submit(CountingEvent::new("b", 3, Utc::now()))
            .await
            .unwrap();
        processor.drain().await.unwrap();

        let lanes: Vec<String> = collect(&mut events)
            .into_iter()
            .filter_map(|event| match event {
                ProcessorEvent::Completed { completion, .. } => Some(completion.lane_id),
                _ => None,
            })
            .collect();
        assert_eq!(lanes, vec!["in".to_string(), "out".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_event_is_reported() {
        let store = Arc::new(MemoryStore::with_records(
            [LaneRecord::new("lane", "A", "B", true)],
            [],
        ));
        let (observer, mut events) = mpsc::unbounded_channel();
        let processor = CountingProcessor::spawn(store.clone(), test_config(), Some(observer));

        processor
            .submit(CountingEvent::new("A", 200, Utc::now()))
            .await
            .unwrap();
        processor.drain().await.unwrap();

        let events = collect(&mut events);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ProcessorEvent::Rejected { lane_id: Some(id), .. } if id == "lane"
        ));
        assert!(store.lane("lane").await.unwrap().unwrap().state.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_lane_drops_pending_timeout() {
        let store = Arc::new(MemoryStore::with_records(
            [LaneRecord::new("lane", "A", "B", true)],
            [],
        ));
        let processor = CountingProcessor::spawn(store.clone(), test_config(), None);

        processor
            .submit(CountingEvent::new("A", 1, Utc::now()))
            .await
            .unwrap();
        processor.evict_lane("lane").await.unwrap();
        processor.drain().await.unwrap();

        assert_eq!(processor.registry().pending_count(), 0);
        assert_eq!(store.lane("lane").await.unwrap().unwrap().count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_timeout_keeps_processor_running() {
        let store = Arc::new(MemoryStore::with_records(
            [
                LaneRecord::new("slow", "A", "B", true).with_timeout_secs(1e20),
                LaneRecord::new("fast", "C", "D", true).with_timeout_secs(0.0),
            ],
            [],
        ));
        let processor = CountingProcessor::spawn(store.clone(), test_config(), None);

        processor
            .submit(CountingEvent::new("A", 1, Utc::now()))
            .await
            .unwrap();
        processor
            .submit(CountingEvent::new("C", 1, Utc::now()))
            .await
            .unwrap();
        processor.drain().await.unwrap();

        assert_eq!(processor.registry().pending_count(), 0);
        assert!(store.lane("slow").await.unwrap().unwrap().state.is_some());
        assert!(store.lane("fast").await.unwrap().unwrap().state.is_some());
    }

    /// Store whose writes always fail
    struct ReadOnlyStore(MemoryStore);

    #[async_trait]
    impl LaneStore for ReadOnlyStore {
        async fn lanes_for_sensor(
            &self,
            sensor_id: &str,
        ) -> std::result::Result<Vec<LaneRecord>, StoreError> {
            self.0.lanes_for_sensor(sensor_id).await
        }

        async fn lane(&self, lane_id: &str) -> std::result::Result<Option<LaneRecord>, StoreError> {
            self.0.lane(lane_id).await
        }

        async fn update_lane(
            &self,
            _update: &LaneUpdateIntent,
        ) -> std::result::Result<(), StoreError> {
            Err(StoreError::Backend("read-only".to_string()))
        }

        async fn increment_occupancy(
            &self,
            _increment: &OccupancyIncrement,
        ) -> std::result::Result<(), StoreError> {
            Err(StoreError::Backend("read-only".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_persist_failure_is_reported() {
        let store = Arc::new(ReadOnlyStore(MemoryStore::with_records(
            [LaneRecord::new("lane", "A", "B", true).with_timeout_secs(0.0)],
            [],
        )));
        let (observer, mut events) = mpsc::unbounded_channel();
        let processor = CountingProcessor::spawn(store, test_config(), Some(observer));

        processor
            .submit(CountingEvent::new("A", 1, Utc::now()))
            .await
            .unwrap();
        processor.drain().await.unwrap();

        let events = collect(&mut events);
        assert!(matches!(
            &events[..],
            [ProcessorEvent::PersistFailed { lane_id, .. }] if lane_id == "lane"
        ));
    }
}
