//! In-process site model: household load, PV production and a set of
//! simulated batteries. The grid reading reflects what the batteries were
//! commanded to do, so the control loop sees its own effect.

use async_trait::async_trait;
use chrono::{Local, Timelike};
use std::f64::consts::PI;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::debug;

use crate::config::SimulationConfig;
use crate::domain::SimulatedBattery;
use crate::meter::{MeterError, PowerMeter};

/// Spread of the initial SoC between neighbouring simulated units, in percent.
const SOC_SPREAD: f64 = 2.0;

pub struct SimulatedSite {
    params: SimulationConfig,
    batteries: Vec<Arc<SimulatedBattery>>,
    last_step: Mutex<Instant>,
}

impl SimulatedSite {
    pub fn new(params: SimulationConfig, units: usize) -> Self {
        let centre = units.saturating_sub(1) as f64 / 2.0;
        let batteries = (0..units)
            .map(|i| {
                let soc = params.initial_soc_percent + (i as f64 - centre) * SOC_SPREAD;
                Arc::new(SimulatedBattery::new(
                    soc,
                    params.capacity_wh,
                    params.efficiency,
                ))
            })
            .collect();
        Self {
            params,
            batteries,
            last_step: Mutex::new(Instant::now()),
        }
    }

    pub fn batteries(&self) -> &[Arc<SimulatedBattery>] {
        &self.batteries
    }

    /// PV output for a given local hour: a half sine between 06:00 and 18:00.
    pub fn pv_w(&self, hour: f64) -> f64 {
        if !(6.0..=18.0).contains(&hour) {
            return 0.0;
        }
        self.params.pv_peak_w * (PI * (hour - 6.0) / 12.0).sin()
    }

    /// Advance the batteries to now and return the net grid power (+ import).
    pub async fn grid_power_w(&self) -> f64 {
        let dt_s = {
            let mut last = self
                .last_step
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let now = Instant::now();
            let dt = now.duration_since(*last).as_secs_f64();
            *last = now;
            dt
        };

        let mut batteries_w = 0.0;
        for battery in &self.batteries {
            battery.advance(dt_s).await;
            batteries_w += battery.grid_contribution_w().await;
        }

        let now = Local::now();
        let hour = f64::from(now.hour()) + f64::from(now.minute()) / 60.0;
        let pv_w = self.pv_w(hour);
        let noise_w = (rand::random::<f64>() * 2.0 - 1.0) * self.params.noise_w;
        let grid_w = self.params.base_load_w + noise_w - pv_w + batteries_w;

        debug!(pv_w, batteries_w, grid_w, "simulated site step");
        grid_w
    }
}

/// [`PowerMeter`] view of a shared [`SimulatedSite`]
#[derive(Clone)]
pub struct SiteMeter {
    site: Arc<SimulatedSite>,
}

impl SiteMeter {
    pub fn new(site: Arc<SimulatedSite>) -> Self {
        Self { site }
    }
}

#[async_trait]
impl PowerMeter for SiteMeter {
    async fn read_power(&self) -> Result<f64, MeterError> {
        Ok(self.site.grid_power_w().await)
    }

    fn kind(&self) -> &'static str {
        "simulated"
    }
}
