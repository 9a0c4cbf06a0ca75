//! # Dispatch controller
//!
//! One control cycle turns a smoothed grid reading and the fleet's average
//! SoC into an aggregate setpoint:
//!
//! 1. [`decide`] picks the target mode and power from the current state
//!    (hysteresis band, flexible target, low-SoC protection)
//! 2. [`SlewLimiter`] bounds the step from the current setpoint
//! 3. The fleet is only touched when the mode changes or the power moves by
//!    more than half of the minimum unit power
//!
//! Every failure is folded into a [`CycleOutcome`]; nothing is retried inside
//! a cycle.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use super::distributor::distribute;
use super::error::DispatchError;
use super::events::{EventEntry, EventLevel, EventLog};
use super::fleet::Fleet;
use super::slew::SlewLimiter;
use super::state::{ControllerState, Setpoint};
use crate::domain::BatteryMode;
use crate::meter::MeterSampler;

/// Control parameters. Built from validated configuration only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Grid power to aim for while charging (negative, feed-in)
    pub target_charge_w: f64,
    /// Grid power to aim for while discharging (positive, import)
    pub target_discharge_w: f64,
    pub min_unit_power_w: f64,
    pub max_unit_power_w: f64,
    pub min_soc_discharge: f64,
    pub max_soc_charge: f64,
    pub max_slew_per_cycle_w: f64,
    pub low_soc_threshold: f64,
    /// Grid power (negative) a low fleet needs to see before it starts charging
    pub low_soc_min_surplus_w: f64,
    pub start_threshold_w: f64,
}

/// Units currently allowed to move in each direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FleetCapacity {
    pub charge_units: usize,
    pub discharge_units: usize,
}

impl FleetCapacity {
    pub fn from_fleet(fleet: &Fleet, settings: &DispatchSettings) -> Self {
        Self {
            charge_units: fleet.count_eligible(
                BatteryMode::Charge,
                settings.min_soc_discharge,
                settings.max_soc_charge,
            ),
            discharge_units: fleet.count_eligible(
                BatteryMode::Discharge,
                settings.min_soc_discharge,
                settings.max_soc_charge,
            ),
        }
    }
}

/// Desired setpoint before slew limiting, with a readable reason
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub setpoint: Setpoint,
    pub reason: String,
}

impl Decision {
    fn stop(reason: impl Into<String>) -> Self {
        Self {
            setpoint: Setpoint::STOP,
            reason: reason.into(),
        }
    }

    fn run(setpoint: Setpoint, reason: impl Into<String>) -> Self {
        Self {
            setpoint,
            reason: reason.into(),
        }
    }
}

/// Pure mode/power decision for one cycle.
///
/// `grid_w` is positive for import, `avg_soc` is the fleet mean in percent.
pub fn decide(
    settings: &DispatchSettings,
    current: Setpoint,
    grid_w: f64,
    avg_soc: f64,
    capacity: FleetCapacity,
) -> Decision {
    let max_charge_w = capacity.charge_units as f64 * settings.max_unit_power_w;
    let max_discharge_w = capacity.discharge_units as f64 * settings.max_unit_power_w;

    match current.mode {
        BatteryMode::Discharge => {
            from_discharging(settings, current.power_w, grid_w, avg_soc, max_discharge_w)
        }
        BatteryMode::Charge => {
            from_charging(settings, current.power_w, grid_w, avg_soc, max_charge_w)
        }
        BatteryMode::Stop => from_stop(settings, grid_w, avg_soc, max_charge_w, max_discharge_w),
    }
}

fn from_discharging(
    s: &DispatchSettings,
    power_w: f64,
    grid_w: f64,
    avg_soc: f64,
    max_discharge_w: f64,
) -> Decision {
    if avg_soc <= s.min_soc_discharge {
        return Decision::stop(format!(
            "SoC {avg_soc:.0}% at discharge floor {:.0}%",
            s.min_soc_discharge
        ));
    }

    let consumption = grid_w + power_w;
    let (target, reason) = if consumption >= s.min_unit_power_w + s.target_discharge_w {
        (consumption - s.target_discharge_w, "covering load")
    } else if consumption >= s.min_unit_power_w {
        (consumption, "covering load (flexible target)")
    } else {
        return Decision::stop(format!("load {consumption:.0}W below minimum unit power"));
    };

    if max_discharge_w < s.min_unit_power_w {
        return Decision::stop("no unit can discharge");
    }
    let target = target.clamp(s.min_unit_power_w, max_discharge_w);
    Decision::run(Setpoint::discharge(target), reason)
}

fn from_charging(
    s: &DispatchSettings,
    power_w: f64,
    grid_w: f64,
    avg_soc: f64,
    max_charge_w: f64,
) -> Decision {
    if avg_soc >= s.max_soc_charge {
        return Decision::stop(format!(
            "SoC {avg_soc:.0}% at charge ceiling {:.0}%",
            s.max_soc_charge
        ));
    }

    let margin = s.target_charge_w.abs();
    let (target, reason) = if grid_w >= 0.0 {
        // Importing while charging: PV no longer covers the charge power
        let pv = power_w - grid_w;
        if pv <= 0.0 {
            return Decision::stop("no PV surplus left");
        }
        if pv >= s.min_unit_power_w + margin {
            (pv - margin, "following PV surplus")
        } else if pv >= s.min_unit_power_w {
            (pv, "following PV surplus (flexible target)")
        } else {
            return Decision::stop(format!("PV surplus {pv:.0}W below minimum unit power"));
        }
    } else {
        let pv = power_w + grid_w.abs();
        let target = pv - margin;
        if target < s.min_unit_power_w {
            return Decision::stop(format!("PV surplus {pv:.0}W too small"));
        }
        (target, "absorbing feed-in")
    };

    if max_charge_w < s.min_unit_power_w {
        return Decision::stop("no unit can charge");
    }
    Decision::run(Setpoint::charge(target.min(max_charge_w)), reason)
}

fn from_stop(
    s: &DispatchSettings,
    grid_w: f64,
    avg_soc: f64,
    max_charge_w: f64,
    max_discharge_w: f64,
) -> Decision {
    if grid_w < s.target_charge_w - s.start_threshold_w {
        if avg_soc >= s.max_soc_charge {
            return Decision::stop(format!("feed-in {:.0}W but fleet full", grid_w.abs()));
        }
        if avg_soc < s.low_soc_threshold && grid_w > s.low_soc_min_surplus_w {
            return Decision::stop(format!(
                "low SoC {avg_soc:.0}%: surplus {:.0}W below {:.0}W",
                grid_w.abs(),
                s.low_soc_min_surplus_w.abs()
            ));
        }
        let required = grid_w.abs() - s.target_charge_w.abs();
        if required < s.min_unit_power_w {
            return Decision::stop(format!("surplus {required:.0}W below minimum unit power"));
        }
        if max_charge_w < s.min_unit_power_w {
            return Decision::stop("no unit can charge");
        }
        return Decision::run(
            Setpoint::charge(required.min(max_charge_w)),
            format!("start charging on {:.0}W feed-in", grid_w.abs()),
        );
    }

    if grid_w > s.target_discharge_w + s.start_threshold_w {
        if avg_soc <= s.min_soc_discharge {
            return Decision::stop(format!("import {grid_w:.0}W but fleet empty"));
        }
        let required = grid_w - s.target_discharge_w;
        if required < s.min_unit_power_w {
            return Decision::stop(format!("deficit {required:.0}W below minimum unit power"));
        }
        if max_discharge_w < s.min_unit_power_w {
            return Decision::stop("no unit can discharge");
        }
        return Decision::run(
            Setpoint::discharge(required.min(max_discharge_w)),
            format!("start discharging on {grid_w:.0}W import"),
        );
    }

    Decision::stop("grid optimal")
}

/// Result of [`DispatchController::execute_control_cycle`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleOutcome {
    pub success: bool,
    pub status: String,
}

impl CycleOutcome {
    fn ok(status: String) -> Self {
        Self {
            success: true,
            status,
        }
    }

    fn failed(status: String) -> Self {
        Self {
            success: false,
            status,
        }
    }
}

/// Read-only controller view for logs and the status API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub mode: BatteryMode,
    pub aggregate_power_w: f64,
    pub last_grid_power_w: Option<f64>,
    pub mode_change_count: u64,
    pub rate_limited: bool,
    pub meter_failure_streak: u32,
    pub cycle_count: u64,
    pub failed_cycle_count: u64,
    pub last_status: Option<String>,
    pub target_charge_w: f64,
    pub target_discharge_w: f64,
    pub max_slew_per_cycle_w: f64,
}

#[derive(Debug, Clone, Default)]
struct Statistics {
    mode_change_count: u64,
    last_grid_power_w: Option<f64>,
    rate_limited: bool,
    cycle_count: u64,
    failed_cycle_count: u64,
    last_status: Option<String>,
}

pub struct DispatchController {
    settings: DispatchSettings,
    state: ControllerState,
    limiter: SlewLimiter,
    stats: Statistics,
    events: EventLog,
}

impl DispatchController {
    pub fn new(settings: DispatchSettings) -> Self {
        let limiter = SlewLimiter::new(settings.max_slew_per_cycle_w);
        info!(
            target_charge_w = settings.target_charge_w,
            target_discharge_w = settings.target_discharge_w,
            min_unit_power_w = settings.min_unit_power_w,
            max_unit_power_w = settings.max_unit_power_w,
            %limiter,
            "dispatch controller initialised"
        );
        Self {
            settings,
            state: ControllerState::new(),
            limiter,
            stats: Statistics::default(),
            events: EventLog::new(),
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    /// One decision and actuation step.
    #[instrument(skip_all, fields(mode = %self.state.mode(), power_w = self.state.aggregate_power_w()))]
    pub async fn execute_control_cycle(
        &mut self,
        meter: &mut MeterSampler,
        fleet: &mut Fleet,
    ) -> CycleOutcome {
        self.stats.cycle_count += 1;
        let outcome = self.run_cycle(meter, fleet).await;
        if !outcome.success {
            self.stats.failed_cycle_count += 1;
        }
        self.stats.last_status = Some(outcome.status.clone());
        outcome
    }

    async fn run_cycle(&mut self, meter: &mut MeterSampler, fleet: &mut Fleet) -> CycleOutcome {
        let grid = meter.smoothed().await;
        self.state.meter_failure_streak = meter.consecutive_failures();
        let Some(grid_w) = grid else {
            let e = DispatchError::MeterUnavailable {
                meter: meter.kind().to_string(),
            };
            warn!(kind = e.kind(), streak = self.state.meter_failure_streak, "{e}");
            return CycleOutcome::failed(e.to_string());
        };
        self.stats.last_grid_power_w = Some(grid_w);

        let Some(avg_soc) = fleet.average_soc() else {
            return self.fail_to_stop(fleet, DispatchError::NoValidSoc).await;
        };

        let capacity = FleetCapacity::from_fleet(fleet, &self.settings);
        let current = self.state.setpoint;
        let decision = decide(&self.settings, current, grid_w, avg_soc, capacity);
        let slewed = self.limiter.limit(current, decision.setpoint);
        let next = slewed.setpoint;
        self.stats.rate_limited = slewed.rate_limited;

        debug!(
            grid_w,
            avg_soc,
            target = %decision.setpoint,
            applied = %next,
            rate_limited = slewed.rate_limited,
            reason = %decision.reason,
            "decision"
        );

        let mode_changed = next.mode != current.mode;
        let power_moved =
            (next.power_w - current.power_w).abs() > self.settings.min_unit_power_w / 2.0;

        if mode_changed || power_moved {
            let mut message = if mode_changed {
                format!(
                    "{}: {grid_w:.0}W | mode {} -> {} | power {:.0}W -> {:.0}W",
                    meter.kind(),
                    current.mode,
                    next.mode,
                    current.power_w,
                    next.power_w
                )
            } else {
                format!(
                    "{}: {grid_w:.0}W | mode {} | power {:.0}W -> {:.0}W",
                    meter.kind(),
                    next.mode,
                    current.power_w,
                    next.power_w
                )
            };
            if slewed.rate_limited {
                message.push_str(" [rate-limited]");
            }
            info!("{message}");
            let level = if slewed.rate_limited {
                EventLevel::Warning
            } else {
                EventLevel::Info
            };
            self.events.push(level, message);

            if let Err(e) = self.actuate(fleet, next).await {
                return self.cycle_error(e);
            }
            if mode_changed {
                self.stats.mode_change_count += 1;
            }
        }

        let current = self.state.setpoint;
        let mut status = format!("{current} | SoC {avg_soc:.0}% | {}", decision.reason);
        if slewed.rate_limited {
            status.push_str(" [rate-limited]");
        }
        CycleOutcome::ok(status)
    }

    /// Drive the fleet to `next`; state only follows what the fleet accepted.
    async fn actuate(&mut self, fleet: &mut Fleet, next: Setpoint) -> Result<(), DispatchError> {
        if next.is_stop() {
            fleet.stop_all().await?;
            self.state.transition(Setpoint::STOP);
            return Ok(());
        }

        match distribute(
            fleet,
            next.power_w,
            next.mode,
            self.settings.min_soc_discharge,
            self.settings.max_soc_charge,
        )
        .await
        {
            Ok(report) => {
                if let Some(partial) = report.partial_failure() {
                    self.events.push(EventLevel::Warning, partial.to_string());
                }
                self.state.transition(next);
                Ok(())
            }
            Err(e @ (DispatchError::NoValidSoc | DispatchError::AllUnitsIneligible { .. })) => {
                // Every unit has been idled by the distributor
                self.state.transition(Setpoint::STOP);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn fail_to_stop(&mut self, fleet: &mut Fleet, cause: DispatchError) -> CycleOutcome {
        match fleet.stop_all().await {
            Ok(()) => self.state.transition(Setpoint::STOP),
            Err(e) => error!(kind = e.kind(), "fail-safe stop incomplete: {e}"),
        }
        self.cycle_error(cause)
    }

    fn cycle_error(&mut self, e: DispatchError) -> CycleOutcome {
        error!(kind = e.kind(), "control cycle failed: {e}");
        self.events.push(EventLevel::Error, e.to_string());
        CycleOutcome::failed(e.to_string())
    }

    /// Unconditional fleet stop, used for fail-safe, pause and shutdown.
    pub async fn force_stop(&mut self, fleet: &mut Fleet, reason: &str) -> Result<(), DispatchError> {
        let result = fleet.stop_all().await;
        match &result {
            Ok(()) => {
                if !self.state.setpoint.is_stop() {
                    self.stats.mode_change_count += 1;
                }
                self.state.transition(Setpoint::STOP);
                warn!(reason, "fleet force-stopped");
                self.events
                    .push(EventLevel::Warning, format!("Fleet stopped: {reason}"));
            }
            Err(e) => {
                error!(reason, kind = e.kind(), "force stop incomplete: {e}");
                self.events.push(
                    EventLevel::Error,
                    format!("Fleet stop incomplete ({reason}): {e}"),
                );
            }
        }
        result
    }

    pub fn get_status(&self) -> ControllerStatus {
        ControllerStatus {
            mode: self.state.mode(),
            aggregate_power_w: self.state.aggregate_power_w(),
            last_grid_power_w: self.stats.last_grid_power_w,
            mode_change_count: self.stats.mode_change_count,
            rate_limited: self.stats.rate_limited,
            meter_failure_streak: self.state.meter_failure_streak,
            cycle_count: self.stats.cycle_count,
            failed_cycle_count: self.stats.failed_cycle_count,
            last_status: self.stats.last_status.clone(),
            target_charge_w: self.settings.target_charge_w,
            target_discharge_w: self.settings.target_discharge_w,
            max_slew_per_cycle_w: self.settings.max_slew_per_cycle_w,
        }
    }

    pub fn reset_statistics(&mut self) {
        self.stats.mode_change_count = 0;
        self.stats.rate_limited = false;
        self.stats.cycle_count = 0;
        self.stats.failed_cycle_count = 0;
        info!("controller statistics reset");
        self.events.push(EventLevel::Info, "Statistics reset");
    }

    /// Append an operator-facing event (used by the control loop).
    pub fn record_event(&mut self, level: EventLevel, message: impl Into<String>) {
        self.events.push(level, message);
    }

    pub fn events(&self) -> Vec<EventEntry> {
        self.events.entries()
    }

    /// Mirror the meter's failure streak while dispatch is suspended.
    pub(crate) fn note_meter_streak(&mut self, streak: u32) {
        self.state.meter_failure_streak = streak;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::controller::testing::{fleet, meter};
    use proptest::prelude::*;
    use rstest::rstest;

    pub(crate) fn settings() -> DispatchSettings {
        DispatchSettings {
            target_charge_w: -20.0,
            target_discharge_w: 20.0,
            min_unit_power_w: 50.0,
            max_unit_power_w: 2500.0,
            min_soc_discharge: 11.0,
            max_soc_charge: 98.0,
            max_slew_per_cycle_w: 750.0,
            low_soc_threshold: 13.0,
            low_soc_min_surplus_w: -100.0,
            start_threshold_w: 50.0,
        }
    }

    const TWO_UNITS: FleetCapacity = FleetCapacity {
        charge_units: 2,
        discharge_units: 2,
    };

    #[rstest]
    // import 300W from rest
    #[case(Setpoint::STOP, 300.0, 50.0, Setpoint::discharge(280.0))]
    // already discharging 50W, load 350W
    #[case(Setpoint::discharge(50.0), 300.0, 50.0, Setpoint::discharge(330.0))]
    // low SoC, 80W feed-in is not enough to wake the fleet
    #[case(Setpoint::STOP, -80.0, 10.0, Setpoint::STOP)]
    // SoC drops under the discharge floor
    #[case(Setpoint::discharge(200.0), 150.0, 10.0, Setpoint::STOP)]
    // low SoC but 150W feed-in is enough
    #[case(Setpoint::STOP, -150.0, 10.0, Setpoint::charge(130.0))]
    // inside the dead band
    #[case(Setpoint::STOP, 60.0, 50.0, Setpoint::STOP)]
    #[case(Setpoint::STOP, -60.0, 50.0, Setpoint::STOP)]
    // full fleet ignores feed-in
    #[case(Setpoint::STOP, -900.0, 98.0, Setpoint::STOP)]
    // empty fleet ignores import
    #[case(Setpoint::STOP, 900.0, 11.0, Setpoint::STOP)]
    // flexible discharge target: load 60W sits between min and min + band
    #[case(Setpoint::discharge(100.0), -40.0, 50.0, Setpoint::discharge(60.0))]
    // load vanished
    #[case(Setpoint::discharge(100.0), -80.0, 50.0, Setpoint::STOP)]
    // charging, more feed-in
    #[case(Setpoint::charge(500.0), -300.0, 50.0, Setpoint::charge(780.0))]
    // charging, cloud: importing 100W
    #[case(Setpoint::charge(500.0), 100.0, 50.0, Setpoint::charge(380.0))]
    // charging, flexible PV target
    #[case(Setpoint::charge(100.0), 40.0, 50.0, Setpoint::charge(60.0))]
    // charging, PV gone
    #[case(Setpoint::charge(100.0), 120.0, 50.0, Setpoint::STOP)]
    // charging, fleet full
    #[case(Setpoint::charge(500.0), -300.0, 98.0, Setpoint::STOP)]
    fn test_decide(
        #[case] current: Setpoint,
        #[case] grid_w: f64,
        #[case] avg_soc: f64,
        #[case] expected: Setpoint,
    ) {
        let decision = decide(&settings(), current, grid_w, avg_soc, TWO_UNITS);
        assert_eq!(decision.setpoint, expected, "reason: {}", decision.reason);
    }

    #[test]
    fn test_decide_clamps_to_fleet_capacity() {
        let one = FleetCapacity {
            charge_units: 1,
            discharge_units: 1,
        };
        let d = decide(&settings(), Setpoint::STOP, 4000.0, 50.0, one);
        assert_eq!(d.setpoint, Setpoint::discharge(2500.0));

        let d = decide(&settings(), Setpoint::charge(2500.0), -3000.0, 50.0, one);
        assert_eq!(d.setpoint, Setpoint::charge(2500.0));
    }

    #[test]
    fn test_decide_without_capacity_stops() {
        let none = FleetCapacity {
            charge_units: 0,
            discharge_units: 0,
        };
        let d = decide(&settings(), Setpoint::STOP, 900.0, 50.0, none);
        assert_eq!(d.setpoint, Setpoint::STOP);
        let d = decide(&settings(), Setpoint::discharge(400.0), 100.0, 50.0, none);
        assert_eq!(d.setpoint, Setpoint::STOP);
    }

    #[test]
    fn test_discharge_never_below_min_unit_power() {
        // consumption 55W: flexible target 55W, not 35W
        let d = decide(&settings(), Setpoint::discharge(100.0), -45.0, 50.0, TWO_UNITS);
        assert_eq!(d.setpoint, Setpoint::discharge(55.0));
    }

    #[tokio::test]
    async fn test_cycle_starts_discharging_and_splits() {
        let mut controller = DispatchController::new(settings());
        let mut meter = meter(&[Some(300.0)]);
        let (mut fleet, logs) = fleet(&[Some(50.0), Some(60.0)], true).await;

        let outcome = controller.execute_control_cycle(&mut meter, &mut fleet).await;
        assert!(outcome.success, "{}", outcome.status);
        assert!(outcome.status.starts_with("discharge 280W | SoC 55%"));

        let status = controller.get_status();
        assert_eq!(status.mode, BatteryMode::Discharge);
        assert_eq!(status.aggregate_power_w, 280.0);
        assert_eq!(status.mode_change_count, 1);
        assert_eq!(status.last_grid_power_w, Some(300.0));
        for log in logs {
            assert_eq!(log.lock().unwrap().as_slice(), &[(140.0, BatteryMode::Discharge)]);
        }
    }

    #[tokio::test]
    async fn test_cycle_start_is_rate_limited() {
        let mut controller = DispatchController::new(settings());
        let mut meter = meter(&[Some(3000.0)]);
        let (mut fleet, _) = fleet(&[Some(50.0), Some(60.0)], true).await;

        let outcome = controller.execute_control_cycle(&mut meter, &mut fleet).await;
        assert!(outcome.status.ends_with("[rate-limited]"));
        assert_eq!(controller.get_status().aggregate_power_w, 750.0);
        assert!(controller.get_status().rate_limited);
        assert_eq!(controller.events().last().map(|e| e.level), Some(EventLevel::Warning));
    }

    #[tokio::test]
    async fn test_small_change_does_not_actuate() {
        let mut controller = DispatchController::new(settings());
        let mut sampler = meter(&[Some(300.0)]);
        let (mut fleet, logs) = fleet(&[Some(50.0)], true).await;
        controller.execute_control_cycle(&mut sampler, &mut fleet).await;

        // Battery now covers the load: grid sits at +20W, consumption stays 300W
        let mut sampler = meter(&[Some(20.0)]);
        let outcome = controller.execute_control_cycle(&mut sampler, &mut fleet).await;
        assert!(outcome.success);
        assert_eq!(logs[0].lock().unwrap().len(), 1);
        assert_eq!(controller.get_status().mode_change_count, 1);
    }

    #[tokio::test]
    async fn test_meter_unavailable_fails_without_actuation() {
        let mut controller = DispatchController::new(settings());
        let mut meter = meter(&[None]);
        let (mut fleet, logs) = fleet(&[Some(50.0)], true).await;

        let outcome = controller.execute_control_cycle(&mut meter, &mut fleet).await;
        assert!(!outcome.success);
        assert_eq!(outcome.status, "scripted reading unavailable");
        assert!(logs[0].lock().unwrap().is_empty());
        assert_eq!(controller.state().meter_failure_streak, 1);
    }

    #[tokio::test]
    async fn test_no_valid_soc_stops_fleet() {
        let mut controller = DispatchController::new(settings());
        let mut meter = meter(&[Some(500.0)]);
        let (mut fleet, logs) = fleet(&[None, None], true).await;

        let outcome = controller.execute_control_cycle(&mut meter, &mut fleet).await;
        assert!(!outcome.success);
        assert_eq!(outcome.status, DispatchError::NoValidSoc.to_string());
        for log in logs {
            assert_eq!(log.lock().unwrap().as_slice(), &[(0.0, BatteryMode::Stop)]);
        }
        assert_eq!(controller.get_status().mode, BatteryMode::Stop);
        assert_eq!(controller.get_status().failed_cycle_count, 1);
    }

    #[tokio::test]
    async fn test_full_dispatch_failure_keeps_state() {
        let mut controller = DispatchController::new(settings());
        let mut meter = meter(&[Some(500.0)]);
        let (mut fleet, _) = fleet(&[Some(50.0), Some(50.0)], false).await;

        let outcome = controller.execute_control_cycle(&mut meter, &mut fleet).await;
        assert!(!outcome.success);
        assert_eq!(controller.get_status().mode, BatteryMode::Stop);
        assert_eq!(controller.get_status().mode_change_count, 0);
        assert_eq!(controller.events().last().map(|e| e.level), Some(EventLevel::Error));
        assert!(
            outcome.status.contains("unit 1: Communication error: rejected")
                && outcome.status.contains("unit 2: Communication error: rejected"),
            "{}",
            outcome.status
        );
    }

    #[tokio::test]
    async fn test_reset_statistics() {
        let mut controller = DispatchController::new(settings());
        let mut meter = meter(&[Some(300.0)]);
        let (mut fleet, _) = fleet(&[Some(50.0)], true).await;
        controller.execute_control_cycle(&mut meter, &mut fleet).await;
        assert_eq!(controller.get_status().mode_change_count, 1);

        controller.reset_statistics();
        let status = controller.get_status();
        assert_eq!(status.mode_change_count, 0);
        assert_eq!(status.cycle_count, 0);
        assert_eq!(status.mode, BatteryMode::Discharge);
    }

    #[tokio::test]
    async fn test_force_stop() {
        let mut controller = DispatchController::new(settings());
        let mut meter = meter(&[Some(300.0)]);
        let (mut fleet, _) = fleet(&[Some(50.0)], true).await;
        controller.execute_control_cycle(&mut meter, &mut fleet).await;

        controller.force_stop(&mut fleet, "test").await.unwrap();
        assert_eq!(controller.get_status().aggregate_power_w, 0.0);
        assert_eq!(fleet.net_power_w(), 0.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_cycle_invariants(
            readings in proptest::collection::vec(-4000.0f64..4000.0, 1..25),
            soc in 0.0f64..=100.0,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let mut controller = DispatchController::new(settings());
                let (mut fleet, _) = fleet(&[Some(soc), Some(soc)], true).await;
                for grid in readings {
                    let before = controller.state().setpoint;
                    let mut sampler = meter(&[Some(grid)]);
                    controller.execute_control_cycle(&mut sampler, &mut fleet).await;
                    let after = controller.state().setpoint;

                    if after.mode == BatteryMode::Stop {
                        prop_assert_eq!(after.power_w, 0.0);
                    } else if before.mode == after.mode {
                        prop_assert!((after.power_w - before.power_w).abs() <= 750.0 + 1e-9);
                    } else {
                        prop_assert!(after.power_w <= 750.0);
                    }
                }
                Ok(())
            })?;
        }
    }
}
