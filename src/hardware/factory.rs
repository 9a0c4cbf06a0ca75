use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{Config, HardwareMode, MeterKind};
use crate::controller::Fleet;
use crate::domain::{BatteryDevice, BatteryUnit, UnitId};
use crate::meter::{EcoTrackerMeter, MeterSampler, PowerMeter, ShellyMeter};

#[cfg(feature = "sim")]
use super::simulated::{SimulatedSite, SiteMeter};

/// Everything the control loop drives.
pub struct Devices {
    pub meter: MeterSampler,
    pub fleet: Fleet,
}

/// Builds the meter and battery backends selected in the configuration.
///
/// Modbus batteries exist only with the `modbus` feature and the simulated
/// site only with `sim`, so a build can never actuate hardware by accident.
pub struct DeviceFactory {
    config: Config,
}

impl DeviceFactory {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
        }
    }

    pub fn build(&self) -> Result<Devices> {
        #[cfg(feature = "sim")]
        let site = self.simulated_site();

        let meter: Box<dyn PowerMeter> = match self.config.meter.kind {
            MeterKind::Shelly => Box::new(ShellyMeter::new(
                self.meter_url()?,
                self.config.meter.timeout(),
            )?),
            MeterKind::Ecotracker => Box::new(EcoTrackerMeter::new(
                self.meter_url()?,
                self.config.meter.timeout(),
            )?),
            #[cfg(feature = "sim")]
            MeterKind::Simulated => Box::new(SiteMeter::new(
                site.clone().context("simulated site was not created")?,
            )),
            #[cfg(not(feature = "sim"))]
            MeterKind::Simulated => bail!("simulated meter requires the `sim` feature"),
        };

        let devices: Vec<Arc<dyn BatteryDevice>> = match self.config.battery.hardware {
            HardwareMode::Modbus => self.modbus_batteries()?,
            #[cfg(feature = "sim")]
            HardwareMode::Simulated => site
                .as_ref()
                .context("simulated site was not created")?
                .batteries()
                .iter()
                .map(|battery| Arc::clone(battery) as Arc<dyn BatteryDevice>)
                .collect(),
            #[cfg(not(feature = "sim"))]
            HardwareMode::Simulated => bail!("simulated batteries require the `sim` feature"),
        };

        let unit_ids: &[UnitId] = &self.config.battery.unit_ids;
        let fleet = Fleet::new(
            unit_ids
                .iter()
                .zip(devices)
                .map(|(&id, device)| BatteryUnit::new(id, device)),
        );

        info!(
            meter = meter.kind(),
            hardware = ?self.config.battery.hardware,
            units = ?fleet.ids(),
            "devices ready"
        );

        Ok(Devices {
            meter: MeterSampler::new(meter),
            fleet,
        })
    }

    fn meter_url(&self) -> Result<&str> {
        self.config
            .meter
            .url
            .as_deref()
            .context("meter.url is not set")
    }

    /// One shared site whenever anything simulated is configured. It only
    /// carries batteries when the fleet itself is simulated.
    #[cfg(feature = "sim")]
    fn simulated_site(&self) -> Option<Arc<SimulatedSite>> {
        let meter_simulated = self.config.meter.kind == MeterKind::Simulated;
        let fleet_simulated = self.config.battery.hardware == HardwareMode::Simulated;
        if !meter_simulated && !fleet_simulated {
            return None;
        }
        if meter_simulated && !fleet_simulated {
            warn!("simulated meter with real batteries: the grid reading ignores the fleet");
        }

        let units = if fleet_simulated {
            self.config.battery.unit_ids.len()
        } else {
            0
        };
        let params = self.config.simulation.clone().unwrap_or_default();
        Some(Arc::new(SimulatedSite::new(params, units)))
    }

    #[cfg(feature = "modbus")]
    fn modbus_batteries(&self) -> Result<Vec<Arc<dyn BatteryDevice>>> {
        use super::modbus::{MarstekBattery, MarstekSettings};
        use std::net::ToSocketAddrs;

        let battery = &self.config.battery;
        let host = battery.host.as_deref().context("battery.host is not set")?;
        let addr = (host, battery.port)
            .to_socket_addrs()
            .with_context(|| format!("cannot resolve battery gateway {host}:{}", battery.port))?
            .next()
            .with_context(|| format!("no address for battery gateway {host}"))?;

        let settings = MarstekSettings {
            addr,
            timeout: battery.timeout(),
            mode_settle: battery.mode_settle(),
            min_power_w: battery.min_unit_power_w,
            max_power_w: battery.max_unit_power_w,
        };
        info!(%addr, units = ?battery.unit_ids, "using Marstek batteries over Modbus TCP");

        Ok(battery
            .unit_ids
            .iter()
            .map(|&unit| Arc::new(MarstekBattery::new(unit, settings.clone())) as Arc<dyn BatteryDevice>)
            .collect())
    }

    #[cfg(not(feature = "modbus"))]
    fn modbus_batteries(&self) -> Result<Vec<Arc<dyn BatteryDevice>>> {
        bail!("battery.hardware = \"modbus\" requires building with the `modbus` feature")
    }
}
