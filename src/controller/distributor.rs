//! # Power distribution
//!
//! Splits an aggregate setpoint evenly across the units whose SoC allows the
//! requested direction. Units without a known SoC are never selected, and
//! units outside their SoC window are explicitly idled.

use tracing::{debug, info, warn};

use super::error::DispatchError;
use super::fleet::Fleet;
use crate::domain::{BatteryMode, UnitId};

/// What one `distribute` call did to the fleet
#[derive(Debug, Clone)]
pub struct DistributionReport {
    pub mode: BatteryMode,
    pub share_w: f64,
    /// Eligible units that accepted their share
    pub dispatched: Vec<UnitId>,
    /// One [`DispatchError::DeviceComm`] per eligible unit that rejected its share
    pub failures: Vec<DispatchError>,
    /// Ineligible units that were stopped
    pub idled: Vec<UnitId>,
}

impl DistributionReport {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }

    /// The partial failure carried by an otherwise successful dispatch.
    pub fn partial_failure(&self) -> Option<DispatchError> {
        self.is_partial().then(|| DispatchError::PartialDispatchFailure {
            failures: self.failures.clone(),
            succeeded: self.dispatched.len(),
        })
    }
}

/// Dispatch `total_power_w` in `mode` across the eligible part of `fleet`.
///
/// Succeeds when at least one eligible unit accepted its share. Device calls
/// are issued one unit at a time and never retried.
pub async fn distribute(
    fleet: &mut Fleet,
    total_power_w: f64,
    mode: BatteryMode,
    min_soc: f64,
    max_soc: f64,
) -> Result<DistributionReport, DispatchError> {
    let total_power_w = total_power_w.max(0.0);
    let (eligible, ineligible): (Vec<UnitId>, Vec<UnitId>) = fleet
        .ids()
        .into_iter()
        .partition(|id| {
            fleet
                .get(*id)
                .is_some_and(|u| u.is_eligible(mode, min_soc, max_soc))
        });

    let mut idled = Vec::with_capacity(ineligible.len());
    for id in &ineligible {
        if let Some(unit) = fleet.get_mut(*id) {
            match unit.stop().await {
                Ok(()) => idled.push(*id),
                Err(e) => warn!(unit = id, error = %e, "failed to idle ineligible unit"),
            }
        }
    }

    if eligible.is_empty() {
        if fleet.all_soc_unknown() {
            warn!(units = fleet.len(), "no unit reports a state of charge, fleet stopped");
            return Err(DispatchError::NoValidSoc);
        }
        info!(%mode, min_soc, max_soc, "no unit eligible");
        return Err(DispatchError::AllUnitsIneligible {
            mode,
            min_soc,
            max_soc,
        });
    }

    let share_w = total_power_w / eligible.len() as f64;
    let mut dispatched = Vec::with_capacity(eligible.len());
    let mut failures = Vec::new();
    for id in &eligible {
        let Some(unit) = fleet.get_mut(*id) else {
            continue;
        };
        match unit.apply(share_w, mode).await {
            Ok(()) => dispatched.push(*id),
            Err(e) => {
                warn!(unit = id, error = %e, %mode, share_w, "unit rejected its share");
                failures.push(DispatchError::device(*id, e));
            }
        }
    }

    if dispatched.is_empty() {
        return Err(DispatchError::FullDispatchFailure { failures });
    }

    if failures.is_empty() {
        debug!(%mode, share_w, units = dispatched.len(), "power distributed");
    } else {
        let failed: Vec<UnitId> = failures.iter().flat_map(DispatchError::failed_units).collect();
        warn!(%mode, share_w, ?failed, succeeded = dispatched.len(), "partial dispatch");
    }

    Ok(DistributionReport {
        mode,
        share_w,
        dispatched,
        failures,
        idled,
    })
}
