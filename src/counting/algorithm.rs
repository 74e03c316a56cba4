//! Delta algorithm for a pair of counting sensors.
//!
//! Given the latest two observations of the front and back sensors of a lane,
//! computes how many vehicles passed and the bookkeeping fields carried into
//! the next reconciliation cycle:
//! - `inactive`: streak of cycles in which the raw counter did not move
//! - `prev_change`: the adjusted delta credited to the sensor last cycle
//!
//! The function is pure; the lane state machine owns all persistence of the
//! returned values.

use serde::{Deserialize, Serialize};

/// Firmware counters are 7-bit and wrap from 127 back to 0.
pub const COUNTER_MODULUS: u32 = 128;

/// Upper bound of the inactivity streak counter.
pub const INACTIVE_CAP: u8 = 127;

/// One sensor's input to a reconciliation cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub current: u8,
    pub previous: u8,
    pub inactive: u8,
    pub prev_change: u32,
}

impl SensorSnapshot {
    pub fn new(current: u8, previous: u8, inactive: u8, prev_change: u32) -> Self {
        Self {
            current,
            previous,
            inactive,
            prev_change,
        }
    }
}

/// Result of one reconciliation cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    /// Vehicles credited to the lane this cycle
    pub total_change: u32,
    pub front_inactive: u8,
    pub back_inactive: u8,
    pub front_prev_change: u32,
    pub back_prev_change: u32,
}

/// Forward distance between two readings of a wrapping 7-bit counter.
pub fn counter_difference(current: u8, previous: u8) -> u32 {
    let (current, previous) = (u32::from(current), u32::from(previous));
    if current >= previous {
        current - previous
    } else {
        (COUNTER_MODULUS + current) - previous
    }
}

fn bump_inactive(inactive: u8) -> u8 {
    inactive.saturating_add(1).min(INACTIVE_CAP)
}

/// Reconcile both sensors of a lane.
///
/// The lane delta is the larger of the two adjusted deltas, never their sum:
/// one vehicle may register on either or both sensors. A sensor that is on
/// an inactivity streak contributes nothing. When both adjusted deltas are
/// zero two cycles in a row, one unit is credited so a lane cannot stall.
pub fn reconcile(front: SensorSnapshot, back: SensorSnapshot) -> Reconciliation {
    let front_diff = counter_difference(front.current, front.previous);
    let back_diff = counter_difference(back.current, back.previous);

    let mut front_inactive = front.inactive;
    let mut back_inactive = back.inactive;
    if front_diff == 0 {
        front_inactive = bump_inactive(front_inactive);
    }
    if back_diff == 0 {
        back_inactive = bump_inactive(back_inactive);
    }

    let mut front_adjusted = if front_inactive > 0 { 0 } else { front_diff };
    let mut back_adjusted = if back_inactive > 0 { 0 } else { back_diff };

    if front_adjusted == 0 && back_adjusted == 0 && front.prev_change == 0 && back.prev_change == 0
    {
        front_adjusted = 1;
        back_adjusted = 1;
    }

    // A real movement ends the streak even if this cycle's delta was suppressed
    if front_diff != 0 {
        front_inactive = 0;
    }
    if back_diff != 0 {
        back_inactive = 0;
    }

    Reconciliation {
        total_change: front_adjusted.max(back_adjusted),
        front_inactive,
        back_inactive,
        front_prev_change: front_adjusted,
        back_prev_change: back_adjusted,
    }
}
