use thiserror::Error;

use crate::domain::{BatteryError, BatteryMode, UnitId};

/// Everything that can stop a control cycle from reaching its setpoint.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("{meter} reading unavailable")]
    MeterUnavailable { meter: String },

    #[error("no battery reports a valid state of charge")]
    NoValidSoc,

    #[error("no battery eligible to {mode} (SoC window {min_soc:.0}%..{max_soc:.0}%)")]
    AllUnitsIneligible {
        mode: BatteryMode,
        min_soc: f64,
        max_soc: f64,
    },

    /// `failures` holds one [`DispatchError::DeviceComm`] per rejecting unit.
    #[error(
        "{} units rejected the command ({succeeded} succeeded): {}",
        .failures.len(),
        join(.failures)
    )]
    PartialDispatchFailure {
        failures: Vec<DispatchError>,
        succeeded: usize,
    },

    #[error("all {} units rejected the command: {}", .failures.len(), join(.failures))]
    FullDispatchFailure { failures: Vec<DispatchError> },

    #[error("unit {unit}: {source}")]
    DeviceComm {
        unit: UnitId,
        #[source]
        source: BatteryError,
    },
}

impl DispatchError {
    pub fn device(unit: UnitId, source: BatteryError) -> Self {
        DispatchError::DeviceComm { unit, source }
    }

    /// Units named by this error, in the order they failed.
    pub fn failed_units(&self) -> Vec<UnitId> {
        match self {
            DispatchError::DeviceComm { unit, .. } => vec![*unit],
            DispatchError::PartialDispatchFailure { failures, .. }
            | DispatchError::FullDispatchFailure { failures } => {
                failures.iter().flat_map(DispatchError::failed_units).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Short machine-friendly tag, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::MeterUnavailable { .. } => "meter_unavailable",
            DispatchError::NoValidSoc => "no_valid_soc",
            DispatchError::AllUnitsIneligible { .. } => "all_units_ineligible",
            DispatchError::PartialDispatchFailure { .. } => "partial_dispatch_failure",
            DispatchError::FullDispatchFailure { .. } => "full_dispatch_failure",
            DispatchError::DeviceComm { .. } => "device_comm",
        }
    }
}

fn join(errors: &[DispatchError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
