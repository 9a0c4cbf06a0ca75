#![allow(dead_code)]
//! Doubles built on the public device traits, shared by the integration tests.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use zero_feed_controller::controller::{DispatchSettings, Fleet};
use zero_feed_controller::domain::{BatteryDevice, BatteryError, BatteryMode, BatteryUnit, UnitId};
use zero_feed_controller::meter::{MeterError, MeterSampler, PowerMeter};

pub fn settings() -> DispatchSettings {
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

/// Meter whose next answer is set by the test. `None` fails the read.
#[derive(Clone, Default)]
pub struct FixedMeter {
    reading: Arc<Mutex<Option<f64>>>,
}

impl FixedMeter {
    pub fn new(reading: Option<f64>) -> Self {
        Self {
            reading: Arc::new(Mutex::new(reading)),
        }
    }

    pub fn set(&self, reading: Option<f64>) {
        *self.reading.lock().unwrap() = reading;
    }

    pub fn sampler(&self) -> MeterSampler {
        MeterSampler::new(Box::new(self.clone()))
    }
}

#[async_trait]
impl PowerMeter for FixedMeter {
    async fn read_power(&self) -> Result<f64, MeterError> {
        (*self.reading.lock().unwrap()).ok_or_else(|| MeterError::Unavailable("fixed".into()))
    }

    fn kind(&self) -> &'static str {
        "fixed"
    }
}

/// A sampler with an empty window: its smoothed value is exactly `grid_w`.
pub fn reading(grid_w: f64) -> MeterSampler {
    FixedMeter::new(Some(grid_w)).sampler()
}

/// Battery with an adjustable SoC that records every command it gets.
#[derive(Clone, Default)]
pub struct FakeBattery {
    soc: Arc<Mutex<Option<f64>>>,
    reject: Arc<Mutex<bool>>,
    commands: Arc<Mutex<Vec<(f64, BatteryMode)>>>,
}

impl FakeBattery {
    pub fn with_soc(soc: Option<f64>) -> Self {
        let battery = Self::default();
        battery.set_soc(soc);
        battery
    }

    pub fn set_soc(&self, soc: Option<f64>) {
        *self.soc.lock().unwrap() = soc;
    }

    pub fn set_reject(&self, reject: bool) {
        *self.reject.lock().unwrap() = reject;
    }

    pub fn commands(&self) -> Vec<(f64, BatteryMode)> {
        self.commands.lock().unwrap().clone()
    }

    pub fn last_command(&self) -> Option<(f64, BatteryMode)> {
        self.commands.lock().unwrap().last().copied()
    }
}

#[async_trait]
impl BatteryDevice for FakeBattery {
    async fn read_soc(&self) -> Result<f64, BatteryError> {
        (*self.soc.lock().unwrap()).ok_or(BatteryError::Timeout(100))
    }

    async fn set_power(&self, watts: f64, mode: BatteryMode) -> Result<(), BatteryError> {
        self.commands.lock().unwrap().push((watts, mode));
        if *self.reject.lock().unwrap() {
            Err(BatteryError::Communication("rejected".into()))
        } else {
            Ok(())
        }
    }
}

/// Fleet with ids 1..=n after one SoC refresh.
pub async fn fleet(socs: &[Option<f64>]) -> (Fleet, Vec<FakeBattery>) {
    let batteries: Vec<FakeBattery> = socs.iter().map(|soc| FakeBattery::with_soc(*soc)).collect();
    let mut fleet = Fleet::new(batteries.iter().enumerate().map(|(i, battery)| {
        BatteryUnit::new(i as UnitId + 1, Arc::new(battery.clone()))
    }));
    fleet.refresh_soc().await;
    (fleet, batteries)
}
