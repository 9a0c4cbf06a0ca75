use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::BatteryMode;

/// Aggregate fleet command: a mode plus a non-negative power magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Setpoint {
    pub mode: BatteryMode,
    pub power_w: f64,
}

impl Setpoint {
    pub const STOP: Setpoint = Setpoint {
        mode: BatteryMode::Stop,
        power_w: 0.0,
    };

    pub fn charge(power_w: f64) -> Self {
        Self {
            mode: BatteryMode::Charge,
            power_w,
        }
    }

    pub fn discharge(power_w: f64) -> Self {
        Self {
            mode: BatteryMode::Discharge,
            power_w,
        }
    }

    pub fn is_stop(&self) -> bool {
        self.mode == BatteryMode::Stop
    }
}

impl fmt::Display for Setpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            BatteryMode::Stop => write!(f, "stop"),
            mode => write!(f, "{} {:.0}W", mode, self.power_w),
        }
    }
}

/// Mutable controller state threaded through every cycle.
///
/// Invariant: `setpoint.mode == Stop` implies `setpoint.power_w == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControllerState {
    pub setpoint: Setpoint,
    pub meter_failure_streak: u32,
}

impl ControllerState {
    pub fn new() -> Self {
        Self {
            setpoint: Setpoint::STOP,
            meter_failure_streak: 0,
        }
    }

    pub fn mode(&self) -> BatteryMode {
        self.setpoint.mode
    }

    pub fn aggregate_power_w(&self) -> f64 {
        self.setpoint.power_w
    }

    pub(crate) fn transition(&mut self, setpoint: Setpoint) {
        self.setpoint = if setpoint.is_stop() {
            Setpoint::STOP
        } else {
            setpoint
        };
    }
}

impl Default for ControllerState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_transition_zeroes_power() {
        let mut state = ControllerState::new();
        state.transition(Setpoint::discharge(300.0));
        assert_eq!(state.aggregate_power_w(), 300.0);

        state.transition(Setpoint {
            mode: BatteryMode::Stop,
            power_w: 120.0,
        });
        assert_eq!(state.mode(), BatteryMode::Stop);
        assert_eq!(state.aggregate_power_w(), 0.0);
    }

    #[test]
    fn test_setpoint_display() {
        assert_eq!(Setpoint::charge(412.4).to_string(), "charge 412W");
        assert_eq!(Setpoint::STOP.to_string(), "stop");
    }
}
