//! Host timestamp reconstruction from the device tick counter.
//!
//! Devices stamp every message with a 32-bit counter that advances every 20 ns
//! and wraps roughly every 86 seconds. The host keeps one `(host_time, tick)`
//! pair per device and advances it by the tick delta of each message.
//!
//! A backwards step of the counter is normally a rollover. When the implied
//! rollover would span more than [`FALSE_ROLLOVER_THRESHOLD_SECONDS`], the step
//! is treated as jitter (an out-of-order or duplicated message) and time moves
//! backwards by the direct difference instead.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Duration of one device tick.
pub const TICK_PERIOD_SECONDS: f64 = 20e-9;

/// A rollover implying more elapsed time than this is not a rollover.
pub const FALSE_ROLLOVER_THRESHOLD_SECONDS: f64 = 10.0;

/// Elapsed time between two ticks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickDelta {
    /// Seconds elapsed; negative for a rejected rollover
    pub seconds: f64,
    /// Whether the counter wrapped
    pub rollover: bool,
}

/// Time elapsed from `previous` to `current`.
pub fn elapsed_between(previous: u32, current: u32) -> TickDelta {
    let rollover = previous > current;
    let cycles = if rollover {
        u64::from(u32::MAX - previous) + u64::from(current)
    } else {
        u64::from(current - previous)
    };
    let seconds = cycles as f64 * TICK_PERIOD_SECONDS;

    if rollover && seconds > FALSE_ROLLOVER_THRESHOLD_SECONDS {
        let cycles = previous - current;
        return TickDelta {
            seconds: -(f64::from(cycles) * TICK_PERIOD_SECONDS),
            rollover: false,
        };
    }

    TickDelta { seconds, rollover }
}

/// Timestamp assigned to one message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reconstructed {
    /// Host time of the message
    pub timestamp: DateTime<Utc>,
    /// Whether the tick counter wrapped since the previous message
    pub rollover: bool,
}

/// Previous `(host_time, tick)` pair of one device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceTimeState {
    /// Host time assigned to the previous message
    pub previous_host_time: DateTime<Utc>,
    /// Tick of the previous message
    pub previous_device_tick: u32,
}

impl DeviceTimeState {
    /// Baseline from the first message of a streaming session.
    pub fn new(host_time: DateTime<Utc>, tick: u32) -> Self {
        Self {
            previous_host_time: host_time,
            previous_device_tick: tick,
        }
    }

    /// Advance to `tick` and return the message's host time.
    pub fn advance(&mut self, tick: u32) -> Reconstructed {
        let delta = elapsed_between(self.previous_device_tick, tick);
        let nanos = (delta.seconds * 1e9).round() as i64;
        let timestamp = self.previous_host_time + Duration::nanoseconds(nanos);

        self.previous_host_time = timestamp;
        self.previous_device_tick = tick;

        Reconstructed {
            timestamp,
            rollover: delta.rollover,
        }
    }
}

/// Time states of several devices, keyed by serial number.
///
/// Every owner (a live device, one import run) holds its own tracker.
#[derive(Debug, Clone, Default)]
pub struct TimestampTracker {
    states: HashMap<String, DeviceTimeState>,
}

impl TimestampTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Timestamp a message from `key`. The first message of a device is
    /// stamped `now` and becomes the baseline.
    pub fn observe(&mut self, key: &str, tick: u32, now: DateTime<Utc>) -> Reconstructed {
        match self.states.get_mut(key) {
            Some(state) => state.advance(tick),
            None => {
                self.states
                    .insert(key.to_string(), DeviceTimeState::new(now, tick));
                Reconstructed {
                    timestamp: now,
                    rollover: false,
                }
            }
        }
    }

    /// Forget one device.
    pub fn remove(&mut self, key: &str) -> Option<DeviceTimeState> {
        self.states.remove(key)
    }

    /// Forget every device.
    pub fn reset(&mut self) {
        self.states.clear();
    }

    /// Whether `key` has a baseline.
    pub fn contains(&self, key: &str) -> bool {
        self.states.contains_key(key)
    }
}
