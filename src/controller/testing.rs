//! Scripted doubles shared by the controller unit tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::fleet::Fleet;
use crate::domain::{BatteryDevice, BatteryError, BatteryMode, BatteryUnit, UnitId};
use crate::meter::{MeterError, MeterSampler, PowerMeter};

pub(crate) type CommandLog = Arc<Mutex<Vec<(f64, BatteryMode)>>>;

/// Plays its script front to back, then keeps repeating the last entry.
/// `None` entries fail the read.
#[derive(Clone, Default)]
pub(crate) struct ScriptedMeter {
    readings: Arc<Mutex<VecDeque<Option<f64>>>>,
}

impl ScriptedMeter {
    pub(crate) fn new(readings: &[Option<f64>]) -> Self {
        Self {
            readings: Arc::new(Mutex::new(readings.iter().copied().collect())),
        }
    }

    /// Replace the script.
    pub(crate) fn set(&self, readings: &[Option<f64>]) {
        *self.readings.lock().unwrap() = readings.iter().copied().collect();
    }

    pub(crate) fn sampler(&self) -> MeterSampler {
        MeterSampler::new(Box::new(self.clone()))
    }
}

#[async_trait]
impl PowerMeter for ScriptedMeter {
    async fn read_power(&self) -> Result<f64, MeterError> {
        let mut readings = self.readings.lock().unwrap();
        let next = if readings.len() > 1 {
            readings.pop_front().flatten()
        } else {
            readings.front().copied().flatten()
        };
        next.ok_or_else(|| MeterError::Unavailable("scripted".into()))
    }

    fn kind(&self) -> &'static str {
        "scripted"
    }
}

pub(crate) fn meter(readings: &[Option<f64>]) -> MeterSampler {
    ScriptedMeter::new(readings).sampler()
}

pub(crate) struct FakeBattery {
    soc: Option<f64>,
    accept: bool,
    commands: CommandLog,
}

#[async_trait]
impl BatteryDevice for FakeBattery {
    async fn read_soc(&self) -> Result<f64, BatteryError> {
        self.soc.ok_or(BatteryError::Timeout(10))
    }

    async fn set_power(&self, watts: f64, mode: BatteryMode) -> Result<(), BatteryError> {
        self.commands.lock().unwrap().push((watts, mode));
        if self.accept {
            Ok(())
        } else {
            Err(BatteryError::Communication("rejected".into()))
        }
    }
}

/// Fleet with ids 1..=n whose SoC has already been read once.
pub(crate) async fn fleet(socs: &[Option<f64>], accept: bool) -> (Fleet, Vec<CommandLog>) {
    let units: Vec<_> = socs.iter().map(|&soc| (soc, accept)).collect();
    fleet_with(&units).await
}

/// Like [`fleet`], with a per-unit `(soc, accept)` pair.
pub(crate) async fn fleet_with(units: &[(Option<f64>, bool)]) -> (Fleet, Vec<CommandLog>) {
    let mut fleet = Fleet::default();
    let mut logs = Vec::new();
    for (i, &(soc, accept)) in units.iter().enumerate() {
        let commands = CommandLog::default();
        logs.push(commands.clone());
        let device = FakeBattery {
            soc,
            accept,
            commands,
        };
        fleet.insert(BatteryUnit::new(i as UnitId + 1, Arc::new(device)));
    }
    fleet.refresh_soc().await;
    (fleet, logs)
}
