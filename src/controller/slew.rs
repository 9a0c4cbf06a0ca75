//! # Slew-rate limiting
//!
//! Bounds how far the aggregate setpoint may move in one control cycle, to
//! prevent:
//! - Oscillation between the meter reading and the fleet response
//! - Repeated, physically expensive charge/discharge mode flips
//! - Inverter stress from instant load changes
//!
//! Transitions into `Stop` are never limited.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::state::Setpoint;

/// Result of limiting one requested setpoint
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlewOutcome {
    pub setpoint: Setpoint,
    /// The requested power was clamped this cycle.
    pub rate_limited: bool,
}

/// Per-cycle power step limiter
#[derive(Debug, Clone, Copy)]
pub struct SlewLimiter {
    max_step_w: f64,
}

impl SlewLimiter {
    pub fn new(max_step_w: f64) -> Self {
        Self {
            max_step_w: max_step_w.max(0.0),
        }
    }

    pub fn max_step_w(&self) -> f64 {
        self.max_step_w
    }

    /// Limit the move from `current` to `target`.
    pub fn limit(&self, current: Setpoint, target: Setpoint) -> SlewOutcome {
        // Stopping is a safety action
        if target.is_stop() {
            return SlewOutcome {
                setpoint: Setpoint::STOP,
                rate_limited: false,
            };
        }

        // Starting from rest or reversing direction: ramp up from zero
        if current.mode != target.mode {
            let rate_limited = target.power_w > self.max_step_w;
            let power_w = target.power_w.min(self.max_step_w);
            return SlewOutcome {
                setpoint: Setpoint {
                    mode: target.mode,
                    power_w,
                },
                rate_limited,
            };
        }

        let delta = target.power_w - current.power_w;
        if delta.abs() <= self.max_step_w {
            return SlewOutcome {
                setpoint: target,
                rate_limited: false,
            };
        }

        let power_w = (current.power_w + self.max_step_w * delta.signum()).max(0.0);
        SlewOutcome {
            setpoint: Setpoint {
                mode: target.mode,
                power_w,
            },
            rate_limited: true,
        }
    }
}

impl fmt::Display for SlewLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlewLimiter(max_step={:.0}W/cycle)", self.max_step_w)
    }
}
