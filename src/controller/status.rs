use chrono::{DateTime, Utc};
use serde::Serialize;

use super::dispatch::{ControllerStatus, DispatchController};
use super::events::EventEntry;
use super::fleet::Fleet;
use crate::domain::BatteryUnitStatus;
use crate::meter::{MeterSampler, MeterStatus};

/// A unit with more consecutive errors than this counts as faulty.
pub const UNIT_ERROR_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Ok,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthVerdict {
    pub status: HealthLevel,
    pub message: String,
}

impl HealthVerdict {
    fn new(status: HealthLevel, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Overall verdict, worst condition first.
    pub fn evaluate(
        meter: &MeterStatus,
        max_meter_failures: u32,
        batteries: &[BatteryUnitStatus],
    ) -> Self {
        if meter.consecutive_failures >= max_meter_failures {
            return Self::new(HealthLevel::Error, format!("{} offline", meter.kind));
        }
        if meter.consecutive_failures > 0 {
            return Self::new(
                HealthLevel::Warning,
                format!("{} failures: {}", meter.kind, meter.consecutive_failures),
            );
        }

        let faulty = batteries
            .iter()
            .filter(|b| b.consecutive_errors > UNIT_ERROR_THRESHOLD)
            .count();
        if faulty > 0 && faulty == batteries.len() {
            return Self::new(HealthLevel::Error, "all batteries faulty");
        }
        if faulty > 0 {
            return Self::new(
                HealthLevel::Warning,
                format!("{faulty}/{} batteries faulty", batteries.len()),
            );
        }
        Self::new(HealthLevel::Ok, "system normal")
    }
}

/// Immutable view of the whole system, published by the control loop.
#[derive(Debug, Clone, Serialize)]
pub struct SystemSnapshot {
    pub timestamp: DateTime<Utc>,
    pub enabled: bool,
    pub dispatch_suspended: bool,
    pub controller: ControllerStatus,
    pub meter: MeterStatus,
    pub grid_power_w: Option<f64>,
    pub batteries: Vec<BatteryUnitStatus>,
    pub average_soc: Option<f64>,
    /// Discharge positive
    pub battery_power_w: f64,
    /// Grid reading with the battery contribution taken out
    pub resulting_power_w: f64,
    pub health: HealthVerdict,
    pub events: Vec<EventEntry>,
}

impl SystemSnapshot {
    pub fn capture(
        controller: &DispatchController,
        meter: &MeterSampler,
        fleet: &Fleet,
        enabled: bool,
        dispatch_suspended: bool,
        max_meter_failures: u32,
    ) -> Self {
        let meter_status = meter.status();
        let batteries = fleet.snapshot();
        let grid_power_w = meter.latest().map(|s| s.power_w);
        let battery_power_w = fleet.net_power_w();
        let health = HealthVerdict::evaluate(&meter_status, max_meter_failures, &batteries);

        Self {
            timestamp: Utc::now(),
            enabled,
            dispatch_suspended,
            controller: controller.get_status(),
            meter: meter_status,
            grid_power_w,
            batteries,
            average_soc: fleet.average_soc(),
            battery_power_w,
            resulting_power_w: grid_power_w.unwrap_or(0.0) - battery_power_w,
            health,
            events: controller.events(),
        }
    }
}
