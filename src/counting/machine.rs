//! Per-event lane state machine.
//!
//! A `LaneMachine` is rebuilt from the persisted `LaneRecord` for every
//! incoming event. The event is routed through one of the transitions below;
//! the resulting `Step` carries the completion to persist and, for `Single`
//! and `Repeat`, the debounce timer the caller must arm.
//!
//! ```text
//!   count == 128 ───────────────────────────────► Reset
//!   target seen ────────────────────────────────► Repeat  (reconcile, re-arm timer)
//!   target unseen, other seen ──────────────────► Both    (reconcile)
//!   target unseen, other unseen ────────────────► Single  (arm timer)
//!   timer fires ────────────────────────────────► Timeout (reconcile)
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::algorithm::reconcile;
use super::models::{
    CountingEvent, LaneCompletion, LaneRecord, LaneState, LaneUpdates, SensorCounterState,
    RESET_SENTINEL,
};
use crate::error::{CountingError, Result};

/// Which end of the lane a sensor is mounted at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorPosition {
    Front,
    Back,
}

impl SensorPosition {
    pub fn opposite(self) -> Self {
        match self {
            SensorPosition::Front => SensorPosition::Back,
            SensorPosition::Back => SensorPosition::Front,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SensorPosition::Front => "front",
            SensorPosition::Back => "back",
        }
    }
}

/// Transition taken by the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// Sensor rebooted; its history is discarded
    Reset,
    /// First sensor of a cycle; waits for the counterpart
    Single,
    /// Counterpart already reported; cycle reconciled
    Both,
    /// Same sensor reported twice; previous cycle closed with the counterpart unchanged
    Repeat,
    /// Debounce window elapsed without the counterpart
    Timeout,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Reset => "reset",
            Transition::Single => "single",
            Transition::Both => "both",
            Transition::Repeat => "repeat",
            Transition::Timeout => "timeout",
        }
    }
}

/// Debounce timer requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTimeout {
    /// Sensor whose lone report started the wait
    pub origin: SensorPosition,
    pub after: Duration,
}

/// Outcome of one transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub transition: Transition,
    pub completion: LaneCompletion,
    pub timer: Option<PendingTimeout>,
}

/// Lane state machine built from a persisted lane.
#[derive(Debug, Clone)]
pub struct LaneMachine {
    lane_id: String,
    total_count: i64,
    debounce: Option<Duration>,
    front: SensorCounterState,
    back: SensorCounterState,
}

impl LaneMachine {
    /// Build a machine from the lane's persisted state.
    ///
    /// A position whose persisted sensor id differs from the one currently
    /// assigned to the lane starts over from the initial state.
    pub fn new(lane: &LaneRecord, default_timeout_secs: f64) -> Self {
        let persisted = lane.state.clone().unwrap_or_default();
        let front = restore(&lane.id, SensorPosition::Front, persisted.front, &lane.front_id);
        let back = restore(&lane.id, SensorPosition::Back, persisted.back, &lane.back_id);

        Self {
            lane_id: lane.id.clone(),
            total_count: lane.count,
            debounce: lane.debounce_window(default_timeout_secs),
            front,
            back,
        }
    }

    pub fn lane_id(&self) -> &str {
        &self.lane_id
    }

    pub fn count(&self) -> i64 {
        self.total_count
    }

    pub fn debounce(&self) -> Option<Duration> {
        self.debounce
    }

    pub fn sensor(&self, position: SensorPosition) -> &SensorCounterState {
        match position {
            SensorPosition::Front => &self.front,
            SensorPosition::Back => &self.back,
        }
    }

    fn sensor_mut(&mut self, position: SensorPosition) -> &mut SensorCounterState {
        match position {
            SensorPosition::Front => &mut self.front,
            SensorPosition::Back => &mut self.back,
        }
    }

    /// Position of a sensor in this lane, if it is assigned to it.
    pub fn position_of(&self, sensor_id: &str) -> Option<SensorPosition> {
        if self.front.belongs_to(sensor_id) {
            Some(SensorPosition::Front)
        } else if self.back.belongs_to(sensor_id) {
            Some(SensorPosition::Back)
        } else {
            None
        }
    }

    /// Route an event through the transition logic.
    pub fn handle(&mut self, event: &CountingEvent) -> Result<Step> {
        if event.count > RESET_SENTINEL {
            return Err(CountingError::InvalidCount {
                sensor_id: event.sensor_id.clone(),
                count: event.count,
            });
        }

        let position =
            self.position_of(&event.sensor_id)
                .ok_or_else(|| CountingError::UnknownSensor {
                    lane_id: self.lane_id.clone(),
                    sensor_id: event.sensor_id.clone(),
                })?;

        let step = if event.is_reset() {
            self.reset(position, event)
        } else if self.sensor(position).seen {
            self.repeat(position, event)
        } else if self.sensor(position.opposite()).seen {
            self.both(position, event)
        } else {
            self.single(position, event)
        };

        tracing::debug!(
            "Lane {}: {} sensor count {} -> {} (lane count {}, change {})",
            self.lane_id,
            position.name(),
            event.count,
            step.transition.name(),
            step.completion.updates.count,
            step.completion.updates.change
        );
        Ok(step)
    }

    /// Close the cycle started by `origin` after its debounce window elapsed.
    pub fn expire(&mut self, origin: SensorPosition) -> Step {
        self.sensor_mut(origin.opposite()).repeat_current();
        let change = self.calculate();

        tracing::debug!(
            "Lane {}: {} debounce expired (lane count {}, change {})",
            self.lane_id,
            origin.name(),
            self.total_count,
            change
        );
        Step {
            transition: Transition::Timeout,
            completion: self.completion(change),
            timer: None,
        }
    }

    fn reset(&mut self, position: SensorPosition, event: &CountingEvent) -> Step {
        let sensor = self.sensor_mut(position);
        sensor.inactive = 0;
        sensor.prev_change = 0;
        sensor.seen = false;
        sensor.push(Some(event.reading()));

        Step {
            transition: Transition::Reset,
            completion: self.completion(0),
            timer: None,
        }
    }

    fn single(&mut self, position: SensorPosition, event: &CountingEvent) -> Step {
        let sensor = self.sensor_mut(position);
        sensor.seen = true;
        sensor.push(Some(event.reading()));

        Step {
            transition: Transition::Single,
            completion: self.completion(0),
            timer: self.timer_for(position),
        }
    }

    fn both(&mut self, position: SensorPosition, event: &CountingEvent) -> Step {
        self.sensor_mut(position).push(Some(event.reading()));
        let change = self.calculate();

        Step {
            transition: Transition::Both,
            completion: self.completion(change),
            timer: None,
        }
    }

    fn repeat(&mut self, position: SensorPosition, event: &CountingEvent) -> Step {
        // Close the pending cycle with the silent sensor unchanged
        self.sensor_mut(position.opposite()).repeat_current();
        let change = self.calculate();

        let sensor = self.sensor_mut(position);
        sensor.push(Some(event.reading()));
        sensor.seen = true;

        Step {
            transition: Transition::Repeat,
            completion: self.completion(change),
            timer: self.timer_for(position),
        }
    }

    fn calculate(&mut self) -> u32 {
        let result = reconcile(self.front.snapshot(), self.back.snapshot());

        self.total_count += i64::from(result.total_change);
        self.front.inactive = result.front_inactive;
        self.back.inactive = result.back_inactive;
        self.front.prev_change = result.front_prev_change;
        self.back.prev_change = result.back_prev_change;
        self.front.seen = false;
        self.back.seen = false;

        result.total_change
    }

    fn timer_for(&self, origin: SensorPosition) -> Option<PendingTimeout> {
        self.debounce.map(|after| PendingTimeout { origin, after })
    }

    fn completion(&self, change: u32) -> LaneCompletion {
        LaneCompletion {
            lane_id: self.lane_id.clone(),
            updates: LaneUpdates {
                count: self.total_count,
                change,
                state: LaneState {
                    front: Some(self.front.clone()),
                    back: Some(self.back.clone()),
                },
            },
        }
    }
}

fn restore(
    lane_id: &str,
    position: SensorPosition,
    persisted: Option<SensorCounterState>,
    assigned: &str,
) -> SensorCounterState {
    match persisted {
        Some(state) if state.belongs_to(assigned) => state,
        Some(stale) => {
            tracing::info!(
                "Lane {}: {} sensor changed from {} to {}, resetting its state",
                lane_id,
                position.name(),
                stale.sensor_id,
                assigned
            );
            SensorCounterState::initial(assigned)
        }
        None => SensorCounterState::initial(assigned),
    }
}
