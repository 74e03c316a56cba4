//! Active lane registry.
//!
//! Tracks, per lane, the machine that still owns an unfired debounce timer.
//! Every new event for a lane cancels that timer before its own transition
//! runs, so a stale timeout can never complete a cycle that a newer event
//! already superseded.
//!
//! # Architecture
//!
//! ```text
//! +--------------------------------------------------+
//! |  LaneRegistry (DashMap, one shard lock per key)  |
//! |    +-- lane A: PendingTimer { generation, machine }
//! |    +-- lane B: PendingTimer { generation, machine }
//! +--------------------------------------------------+
//!            |  sleeper task per timer
//!            v
//!    TimerExpired { lane_id, generation }  --> scheduler --> expire()
//! ```
//!
//! Sleeper tasks never touch lane state. They only report expiry; the owner
//! of the receiver calls [`LaneRegistry::expire`], which runs the timeout
//! transition only if the generation is still the registered one.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::machine::{LaneMachine, PendingTimeout, SensorPosition, Step};
use super::models::{CountingEvent, LaneRecord};
use crate::error::Result;

/// Notification that a lane's debounce window elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerExpired {
    pub lane_id: String,
    pub generation: u64,
}

/// A registered debounce timer and the machine it will complete.
///
/// Note: Manual Debug impl because CancellationToken state is more useful than its internals
struct PendingTimer {
    generation: u64,
    origin: SensorPosition,
    armed_at: Instant,
    cancel_token: CancellationToken,
    machine: LaneMachine,
}

impl PendingTimer {
    fn cancel(&self) {
        self.cancel_token.cancel();
    }
}

impl std::fmt::Debug for PendingTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTimer")
            .field("generation", &self.generation)
            .field("origin", &self.origin)
            .field("armed_at", &self.armed_at)
            .field("is_cancelled", &self.cancel_token.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Registry of lanes waiting on a debounce timer.
///
/// Must be used from within a Tokio runtime: arming a timer spawns a task.
#[derive(Debug)]
pub struct LaneRegistry {
    pending: DashMap<String, PendingTimer>,
    next_generation: AtomicU64,
    expiry_tx: mpsc::UnboundedSender<TimerExpired>,
    default_timeout_secs: f64,
}

impl LaneRegistry {
    /// Create a registry and the receiver its timers report expiry on.
    pub fn new(default_timeout_secs: f64) -> (Self, mpsc::UnboundedReceiver<TimerExpired>) {
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        let registry = Self {
            pending: DashMap::new(),
            next_generation: AtomicU64::new(0),
            expiry_tx,
            default_timeout_secs,
        };
        (registry, expiry_rx)
    }

    /// Process an event for `lane`, whose record must be the latest persisted one.
    ///
    /// Any timer pending for the lane is cancelled first, even if the event is
    /// then rejected. A new timer is registered only when the transition asks
    /// for one.
    pub fn handle_event(&self, lane: &LaneRecord, event: &CountingEvent) -> Result<Step> {
        let mut machine = LaneMachine::new(lane, self.default_timeout_secs);

        // The entry holds the shard lock until the new timer is in place
        let entry = self.pending.entry(lane.id.clone());
        if let Entry::Occupied(stale) = &entry {
            stale.get().cancel();
            tracing::debug!(
                "Lane {}: cancelled pending {} timeout (generation {})",
                lane.id,
                stale.get().origin.name(),
                stale.get().generation
            );
        }

        let result = machine.handle(event);
        let armed = match &result {
            Ok(Step {
                timer: Some(timer), ..
            }) => Some(self.arm(&lane.id, machine, *timer)),
            _ => None,
        };

        match (entry, armed) {
            (Entry::Occupied(mut occupied), Some(timer)) => {
                occupied.insert(timer);
            }
            (Entry::Occupied(occupied), None) => {
                occupied.remove();
            }
            (Entry::Vacant(vacant), Some(timer)) => {
                vacant.insert(timer);
            }
            (Entry::Vacant(_), None) => {}
        }

        result
    }

    /// Run the timeout transition for an expired timer.
    ///
    /// Returns `None` when the timer was superseded or evicted after it
    /// fired; such expiries are dropped.
    pub fn expire(&self, expired: &TimerExpired) -> Option<Step> {
        let Some((_, mut timer)) = self
            .pending
            .remove_if(&expired.lane_id, |_, timer| {
                timer.generation == expired.generation
            })
        else {
            tracing::trace!(
                "Lane {}: dropping stale expiry (generation {})",
                expired.lane_id,
                expired.generation
            );
            return None;
        };

        tracing::trace!(
            "Lane {}: timer expired after {:?}",
            expired.lane_id,
            timer.armed_at.elapsed()
        );
        Some(timer.machine.expire(timer.origin))
    }

    /// Drop the pending timer of one lane.
    ///
    /// Returns true if a timer was pending.
    pub fn evict(&self, lane_id: &str) -> bool {
        match self.pending.remove(lane_id) {
            Some((_, timer)) => {
                timer.cancel();
                tracing::debug!("Lane {}: evicted pending timeout", lane_id);
                true
            }
            None => false,
        }
    }

    /// Drop every pending timer, returning how many were cancelled.
    pub fn evict_all(&self) -> usize {
        let mut evicted = 0;
        self.pending.retain(|_, timer| {
            timer.cancel();
            evicted += 1;
            false
        });
        evicted
    }

    /// Number of lanes waiting on a debounce timer.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, lane_id: &str) -> bool {
        self.pending.contains_key(lane_id)
    }

    fn arm(&self, lane_id: &str, machine: LaneMachine, timer: PendingTimeout) -> PendingTimer {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel_token = CancellationToken::new();

        let token = cancel_token.clone();
        let expiry_tx = self.expiry_tx.clone();
        let expired = TimerExpired {
            lane_id: lane_id.to_string(),
            generation,
        };
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timer.after) => {
                    // Receiver gone means the scheduler shut down
                    let _ = expiry_tx.send(expired);
                }
            }
        });

        tracing::trace!(
            "Lane {}: armed {} timeout for {:?} (generation {})",
            lane_id,
            timer.origin.name(),
            timer.after,
            generation
        );
        PendingTimer {
            generation,
            origin: timer.origin,
            armed_at: Instant::now(),
            cancel_token,
            machine,
        }
    }
}

impl Drop for LaneRegistry {
    fn drop(&mut self) {
        self.evict_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counting::machine::Transition;
    use crate::error::CountingError;
    use chrono::Utc;
    use std::time::Duration;

    const FRONT: &str = "front-sensor";
    const BACK: &str = "back-sensor";

    fn lane(id: &str) -> LaneRecord {
        LaneRecord::new(id, FRONT, BACK, true).with_timeout_secs(0.02)
    }

    fn event(sensor_id: &str, count: u8) -> CountingEvent {
        CountingEvent::new(sensor_id, count, Utc::now())
    }

    fn handle(registry: &LaneRegistry, lane: &mut LaneRecord, event: CountingEvent) -> Step {
        let step = registry.handle_event(lane, &event).unwrap();
        lane.apply(&step.completion.updates);
        step
    }

    async fn wait_past_timeout() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_registers_and_expires() {
        let (registry, mut expiry_rx) = LaneRegistry::new(10.0);
        let mut lane = lane("1");

        handle(&registry, &mut lane, event(FRONT, 1));
        assert!(registry.is_pending("1"));
        assert_eq!(registry.pending_count(), 1);

        let expired = expiry_rx.recv().await.unwrap();
        assert_eq!(expired.lane_id, "1");

        let step = registry.expire(&expired).unwrap();
        assert_eq!(step.transition, Transition::Timeout);
        assert_eq!(step.completion.updates.count, 1);
        assert!(!registry.is_pending("1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_event_supersedes_pending_timer() {
        let (registry, mut expiry_rx) = LaneRegistry::new(10.0);
        let mut lane = lane("1");

        handle(&registry, &mut lane, event(FRONT, 1));
        handle(&registry, &mut lane, event(FRONT, 2));
        assert_eq!(registry.pending_count(), 1);

        wait_past_timeout().await;

        let expired = expiry_rx.try_recv().unwrap();
        assert_eq!(expired.generation, 1);
        assert!(
            expiry_rx.try_recv().is_err(),
            "cancelled timer must not report expiry"
        );

        let step = registry.expire(&expired).unwrap();
        assert_eq!(step.completion.updates.count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_is_dropped() {
        let (registry, _expiry_rx) = LaneRegistry::new(10.0);
        let mut lane = lane("1");

        handle(&registry, &mut lane, event(FRONT, 1));
        handle(&registry, &mut lane, event(FRONT, 2));

        let stale = TimerExpired {
            lane_id: "1".to_string(),
            generation: 0,
        };
        assert!(registry.expire(&stale).is_none());
        assert!(registry.is_pending("1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_clears_registration() {
        let (registry, mut expiry_rx) = LaneRegistry::new(10.0);
        let mut lane = lane("1");

        handle(&registry, &mut lane, event(FRONT, 1));
        let step = handle(&registry, &mut lane, event(BACK, 1));
        assert_eq!(step.transition, Transition::Both);
        assert!(!registry.is_pending("1"));

        wait_past_timeout().await;
        assert!(expiry_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_never_registers() {
        let (registry, _expiry_rx) = LaneRegistry::new(10.0);
        let mut lane = lane("1").with_timeout_secs(0.0);

        handle(&registry, &mut lane, event(FRONT, 1));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_event_still_cancels_pending_timer() {
        let (registry, mut expiry_rx) = LaneRegistry::new(10.0);
        let mut lane = lane("1");

        handle(&registry, &mut lane, event(FRONT, 1));
        let err = registry
            .handle_event(&lane, &event("stranger", 1))
            .unwrap_err();
        assert!(matches!(err, CountingError::UnknownSensor { .. }));
        assert!(!registry.is_pending("1"));

        wait_past_timeout().await;
        assert!(expiry_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_single_lane() {
        let (registry, mut expiry_rx) = LaneRegistry::new(10.0);
        let mut first = lane("1");
        let mut second = lane("2");

        handle(&registry, &mut first, event(FRONT, 1));
        handle(&registry, &mut second, event(BACK, 1));

        assert!(registry.evict("1"));
        assert!(!registry.evict("1"), "eviction is idempotent");

        wait_past_timeout().await;
        let expired = expiry_rx.try_recv().unwrap();
        assert_eq!(expired.lane_id, "2");
        assert!(expiry_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_all() {
        let (registry, mut expiry_rx) = LaneRegistry::new(10.0);
        for id in ["1", "2", "3"] {
            let mut lane = lane(id);
            handle(&registry, &mut lane, event(FRONT, 1));
        }

        assert_eq!(registry.evict_all(), 3);
        assert_eq!(registry.pending_count(), 0);

        wait_past_timeout().await;
        assert!(expiry_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_events_leave_one_timer_per_lane() {
        let (registry, _expiry_rx) = LaneRegistry::new(10.0);
        let registry = std::sync::Arc::new(registry);

        let mut handles = Vec::new();
        for i in 0..20u8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let lane = lane(if i % 2 == 0 { "even" } else { "odd" });
                registry.handle_event(&lane, &event(FRONT, i)).unwrap();
            }));
        }
        for handle in handles {
            handle.await.expect("Task should complete");
        }

        assert_eq!(registry.pending_count(), 2);
    }
}
