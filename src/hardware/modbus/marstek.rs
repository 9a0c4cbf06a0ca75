use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::session::ModbusSession;
use crate::domain::{BatteryDevice, BatteryError, BatteryMode, UnitId};

/// Holding registers of the Marstek Venus RS485 interface
pub mod registers {
    pub const SOC: u16 = 32104;
    pub const RS485_CONTROL: u16 = 42000;
    pub const FORCE_MODE: u16 = 42010;
    pub const CHARGE_POWER: u16 = 42020;
    pub const DISCHARGE_POWER: u16 = 42021;

    /// Magic value that hands control to the RS485 master
    pub const RS485_ENABLE: u16 = 21930;

    pub const FORCE_STOP: u16 = 0;
    pub const FORCE_CHARGE: u16 = 1;
    pub const FORCE_DISCHARGE: u16 = 2;
}

#[derive(Debug, Clone)]
pub struct MarstekSettings {
    pub addr: SocketAddr,
    pub timeout: Duration,
    pub mode_settle: Duration,
    pub min_power_w: f64,
    pub max_power_w: f64,
}

/// A Marstek inverter behind a shared Modbus TCP gateway.
pub struct MarstekBattery {
    unit: UnitId,
    settings: MarstekSettings,
    /// Last mode the device confirmed; `None` when unknown.
    ///
    /// Held for the whole call, so sessions to the same unit never overlap.
    mode: Mutex<Option<BatteryMode>>,
}

impl MarstekBattery {
    pub fn new(unit: UnitId, settings: MarstekSettings) -> Self {
        Self {
            unit,
            settings,
            mode: Mutex::new(None),
        }
    }

    pub fn unit(&self) -> UnitId {
        self.unit
    }

    async fn session(&self) -> Result<ModbusSession, BatteryError> {
        ModbusSession::open(self.settings.addr, self.unit, self.settings.timeout).await
    }

    async fn write_setpoint(
        &self,
        session: &mut ModbusSession,
        power: u16,
        mode: BatteryMode,
        mode_changed: bool,
    ) -> Result<(), BatteryError> {
        use registers::*;

        session.write(RS485_CONTROL, RS485_ENABLE).await?;
        match mode {
            BatteryMode::Charge => {
                if mode_changed {
                    session.write(DISCHARGE_POWER, 0).await?;
                    session.write(FORCE_MODE, FORCE_CHARGE).await?;
                    tokio::time::sleep(self.settings.mode_settle).await;
                }
                session.write(CHARGE_POWER, power).await
            }
            BatteryMode::Discharge => {
                if mode_changed {
                    session.write(CHARGE_POWER, 0).await?;
                    session.write(FORCE_MODE, FORCE_DISCHARGE).await?;
                    tokio::time::sleep(self.settings.mode_settle).await;
                }
                session.write(DISCHARGE_POWER, power).await
            }
            BatteryMode::Stop => {
                session.write(CHARGE_POWER, 0).await?;
                session.write(DISCHARGE_POWER, 0).await?;
                session.write(FORCE_MODE, FORCE_STOP).await
            }
        }
    }
}

/// Register value for a power command: zero stays zero, anything else is
/// clamped into the unit's operating range.
pub fn register_power(watts: f64, min_w: f64, max_w: f64) -> u16 {
    if watts <= 0.0 {
        return 0;
    }
    watts.clamp(min_w, max_w).round().clamp(0.0, f64::from(u16::MAX)) as u16
}

#[async_trait]
impl BatteryDevice for MarstekBattery {
    #[instrument(skip(self), fields(unit = self.unit))]
    async fn read_soc(&self) -> Result<f64, BatteryError> {
        let _guard = self.mode.lock().await;
        let mut session = self.session().await?;
        let raw = session.read_holding(registers::SOC).await?;
        debug!(soc_percent = raw, "soc read");
        Ok(f64::from(raw))
    }

    #[instrument(skip(self), fields(unit = self.unit))]
    async fn set_power(&self, watts: f64, mode: BatteryMode) -> Result<(), BatteryError> {
        let mut last_mode = self.mode.lock().await;
        let power = match mode {
            BatteryMode::Stop => 0,
            _ => register_power(watts, self.settings.min_power_w, self.settings.max_power_w),
        };
        let mode_changed = *last_mode != Some(mode);

        let mut session = self.session().await?;
        match self
            .write_setpoint(&mut session, power, mode, mode_changed)
            .await
        {
            Ok(()) => {
                *last_mode = Some(mode);
                debug!(power_w = power, %mode, mode_changed, "setpoint written");
                Ok(())
            }
            Err(e) => {
                // Partially applied: force the full sequence next time
                *last_mode = None;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0.0, 0)]
    #[case(-10.0, 0)]
    #[case(20.0, 50)]
    #[case(140.4, 140)]
    #[case(140.6, 141)]
    #[case(9000.0, 2500)]
    fn test_register_power(#[case] watts: f64, #[case] expected: u16) {
        assert_eq!(register_power(watts, 50.0, 2500.0), expected);
    }
}
