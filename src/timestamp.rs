//! Extended timestamps from the device's wrapping counter.
//!
//! The counter in slot 0 is a 32-bit tick count (one tick = [`DEFAULT_QUANTUM`]
//! seconds). Each time it wraps, the device toggles the time flag between `W`
//! and `w`. Counting flag changes therefore extends the counter past 32 bits.
//!
//! A flag change normally takes effect from the frame after it. When the
//! changed frame's counter is also below the previous one, the counter has
//! visibly wrapped on that very frame, and the change is applied before its
//! timestamp is computed so the sequence never steps back.
//!
//! Only changes between two *observed* frames are seen. If frames are lost
//! while the flag toggles twice, that wrap is missed and every later timestamp
//! is short by one period. Nothing here tries to detect that.

use std::time::{Duration, SystemTime};

use crate::frame::Label;

/// Seconds represented by one counter tick.
pub const DEFAULT_QUANTUM: f64 = 1e-4;

/// Added to the extended timestamp for every observed flag change.
pub const WRAP_PERIOD: i64 = (1i64 << 32) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimestampState {
    pub last_flag: Option<Label>,
    pub wrap_count: u64,
    pub base: u32,
    pub last_counter: u32,
}

#[derive(Debug, Clone)]
pub struct TimestampReconstructor {
    state: TimestampState,
    quantum: f64,
}

impl Default for TimestampReconstructor {
    fn default() -> Self {
        Self::new(DEFAULT_QUANTUM)
    }
}

impl TimestampReconstructor {
    pub fn new(quantum: f64) -> Self {
        Self {
            state: TimestampState::default(),
            quantum,
        }
    }

    /// Fold one frame's time slot into the state and return its extended
    /// timestamp in ticks since the first frame of the run.
    ///
    /// The timestamp is computed with the wrap count as it stood before this
    /// frame; a flag change is applied afterwards, so it shows up from the
    /// next frame on. The exception is a flag change on a frame whose counter
    /// went below the previous one: that wrap counts immediately.
    pub fn reconstruct(&mut self, raw_counter: u32, time_flag: Label) -> i64 {
        let state = &mut self.state;
        let flipped = match state.last_flag {
            Some(flag) => flag != time_flag,
            None => {
                state.base = raw_counter;
                state.last_counter = raw_counter;
                false
            }
        };
        let counter_wrapped = flipped && raw_counter < state.last_counter;

        if counter_wrapped {
            state.wrap_count += 1;
        }
        let extended = i64::from(raw_counter) - i64::from(state.base)
            + state.wrap_count as i64 * WRAP_PERIOD;
        if flipped && !counter_wrapped {
            state.wrap_count += 1;
        }

        state.last_flag = Some(time_flag);
        state.last_counter = raw_counter;
        extended
    }

    /// Ticks to seconds.
    pub fn seconds(&self, extended: i64) -> f64 {
        extended as f64 * self.quantum
    }

    /// Wall-clock instant of a sample, anchored on the run start.
    pub fn wall_clock(&self, extended: i64, run_start: SystemTime) -> SystemTime {
        let offset = self.seconds(extended);
        if offset >= 0.0 {
            run_start + Duration::from_secs_f64(offset)
        } else {
            run_start - Duration::from_secs_f64(-offset)
        }
    }

    pub fn state(&self) -> TimestampState {
        self.state
    }

    pub fn wrap_count(&self) -> u64 {
        self.state.wrap_count
    }
}
