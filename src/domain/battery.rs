use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum::{Display, EnumString};
use thiserror::Error;
use tracing::{debug, warn};

/// Modbus slave id of a battery inverter; doubles as the fleet key.
pub type UnitId = u8;

/// Battery-specific errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BatteryError {
    #[error("Communication error: {0}")]
    Communication(String),
    #[error("Device did not answer within {0} ms")]
    Timeout(u64),
    #[error("Implausible state of charge reading: {0}%")]
    SocOutOfBounds(f64),
    #[error("Invalid power command: {0}W")]
    InvalidPower(f64),
}

/// Operating mode of a single inverter (and of the fleet as a whole)
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BatteryMode {
    #[default]
    Stop,
    Charge,
    Discharge,
}

/// Wire-level handle of one battery inverter.
///
/// Every call is a single device session: no retries and no cached fallback.
/// `watts` is always a magnitude, the direction is carried by `mode`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BatteryDevice: Send + Sync {
    async fn read_soc(&self) -> Result<f64, BatteryError>;
    async fn set_power(&self, watts: f64, mode: BatteryMode) -> Result<(), BatteryError>;
}

/// Fleet-side bookkeeping for one device.
pub struct BatteryUnit {
    id: UnitId,
    device: Arc<dyn BatteryDevice>,
    last_known_soc: Option<f64>,
    last_soc_update: Option<DateTime<Utc>>,
    current_power_w: f64,
    current_mode: BatteryMode,
    consecutive_errors: u32,
}

/// Serializable view of a [`BatteryUnit`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryUnitStatus {
    pub id: UnitId,
    pub soc_percent: Option<f64>,
    pub soc_age_seconds: Option<i64>,
    pub power_w: f64,
    pub mode: BatteryMode,
    pub consecutive_errors: u32,
}

impl BatteryUnit {
    pub fn new(id: UnitId, device: Arc<dyn BatteryDevice>) -> Self {
        Self {
            id,
            device,
            last_known_soc: None,
            last_soc_update: None,
            current_power_w: 0.0,
            current_mode: BatteryMode::Stop,
            consecutive_errors: 0,
        }
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    /// `None` until the first successful read; never defaulted.
    pub fn last_known_soc(&self) -> Option<f64> {
        self.last_known_soc
    }

    pub fn current_power_w(&self) -> f64 {
        self.current_power_w
    }

    pub fn current_mode(&self) -> BatteryMode {
        self.current_mode
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Whether this unit may take part in a dispatch in `mode`.
    ///
    /// Unknown SoC is never eligible, and `Stop` has no eligible units.
    pub fn is_eligible(&self, mode: BatteryMode, min_soc: f64, max_soc: f64) -> bool {
        match (mode, self.last_known_soc) {
            (BatteryMode::Charge, Some(soc)) => soc < max_soc,
            (BatteryMode::Discharge, Some(soc)) => soc > min_soc,
            _ => false,
        }
    }

    /// Read the SoC once. A failed or implausible read keeps the previous value.
    pub async fn refresh_soc(&mut self) -> Result<f64, BatteryError> {
        match self.device.read_soc().await {
            Ok(soc) if (0.0..=100.0).contains(&soc) => {
                self.last_known_soc = Some(soc);
                self.last_soc_update = Some(Utc::now());
                self.consecutive_errors = 0;
                debug!(unit = self.id, soc_percent = soc, "soc refreshed");
                Ok(soc)
            }
            Ok(soc) => {
                self.consecutive_errors += 1;
                warn!(unit = self.id, soc_percent = soc, "implausible soc reading ignored");
                Err(BatteryError::SocOutOfBounds(soc))
            }
            Err(e) => {
                self.consecutive_errors += 1;
                warn!(unit = self.id, error = %e, errors = self.consecutive_errors, "soc read failed");
                Err(e)
            }
        }
    }

    /// Command the device. Local state only changes when the device accepted it.
    pub async fn apply(&mut self, watts: f64, mode: BatteryMode) -> Result<(), BatteryError> {
        if !watts.is_finite() || watts < 0.0 {
            return Err(BatteryError::InvalidPower(watts));
        }
        let watts = if mode == BatteryMode::Stop { 0.0 } else { watts };

        match self.device.set_power(watts, mode).await {
            Ok(()) => {
                self.current_power_w = watts;
                self.current_mode = mode;
                self.consecutive_errors = 0;
                debug!(unit = self.id, power_w = watts, %mode, "setpoint applied");
                Ok(())
            }
            Err(e) => {
                self.consecutive_errors += 1;
                warn!(unit = self.id, error = %e, errors = self.consecutive_errors, "setpoint rejected");
                Err(e)
            }
        }
    }

    pub async fn stop(&mut self) -> Result<(), BatteryError> {
        self.apply(0.0, BatteryMode::Stop).await
    }

    pub fn status(&self) -> BatteryUnitStatus {
        BatteryUnitStatus {
            id: self.id,
            soc_percent: self.last_known_soc,
            soc_age_seconds: self
                .last_soc_update
                .map(|at| (Utc::now() - at).num_seconds()),
            power_w: self.current_power_w,
            mode: self.current_mode,
            consecutive_errors: self.consecutive_errors,
        }
    }
}

impl std::fmt::Debug for BatteryUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatteryUnit")
            .field("id", &self.id)
            .field("last_known_soc", &self.last_known_soc)
            .field("current_power_w", &self.current_power_w)
            .field("current_mode", &self.current_mode)
            .field("consecutive_errors", &self.consecutive_errors)
            .finish()
    }
}

/// In-process battery used by the simulated site.
#[cfg(feature = "sim")]
#[derive(Debug)]
pub struct SimulatedBattery {
    state: tokio::sync::RwLock<SimulatedBatteryState>,
    capacity_wh: f64,
    efficiency: f64,
}

#[cfg(feature = "sim")]
#[derive(Debug, Clone, Copy)]
struct SimulatedBatteryState {
    soc_percent: f64,
    power_w: f64,
    mode: BatteryMode,
}

#[cfg(feature = "sim")]
impl SimulatedBattery {
    pub fn new(initial_soc_percent: f64, capacity_wh: f64, efficiency: f64) -> Self {
        Self {
            state: tokio::sync::RwLock::new(SimulatedBatteryState {
                soc_percent: initial_soc_percent.clamp(0.0, 100.0),
                power_w: 0.0,
                mode: BatteryMode::Stop,
            }),
            capacity_wh: capacity_wh.max(1.0),
            efficiency,
        }
    }

    /// Signed AC power as seen by the grid meter: charging draws (+), discharging feeds (-).
    pub async fn grid_contribution_w(&self) -> f64 {
        let st = self.state.read().await;
        match st.mode {
            BatteryMode::Charge => st.power_w,
            BatteryMode::Discharge => -st.power_w,
            BatteryMode::Stop => 0.0,
        }
    }

    /// Integrate SoC over `dt_s` seconds at the current setpoint.
    pub async fn advance(&self, dt_s: f64) {
        let mut st = self.state.write().await;
        let energy_wh = st.power_w * dt_s / 3600.0;
        let delta_wh = match st.mode {
            // AC in * efficiency = DC stored
            BatteryMode::Charge => energy_wh * self.efficiency,
            // DC out / efficiency = AC delivered
            BatteryMode::Discharge => -energy_wh / self.efficiency,
            BatteryMode::Stop => 0.0,
        };
        st.soc_percent = (st.soc_percent + delta_wh / self.capacity_wh * 100.0).clamp(0.0, 100.0);
        let at_limit = (st.mode == BatteryMode::Charge && st.soc_percent >= 100.0)
            || (st.mode == BatteryMode::Discharge && st.soc_percent <= 0.0);
        if at_limit {
            st.power_w = 0.0;
        }
    }
}

#[cfg(feature = "sim")]
#[async_trait]
impl BatteryDevice for SimulatedBattery {
    async fn read_soc(&self) -> Result<f64, BatteryError> {
        Ok(self.state.read().await.soc_percent.round())
    }

    async fn set_power(&self, watts: f64, mode: BatteryMode) -> Result<(), BatteryError> {
        let mut st = self.state.write().await;
        st.mode = mode;
        st.power_w = if mode == BatteryMode::Stop { 0.0 } else { watts };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_soc_unknown_until_first_read() {
        let mut device = MockBatteryDevice::new();
        device.expect_read_soc().times(1).returning(|| Ok(42.0));
        let mut unit = BatteryUnit::new(3, Arc::new(device));

        assert_eq!(unit.last_known_soc(), None);
        assert!(!unit.is_eligible(BatteryMode::Charge, 10.0, 90.0));

        unit.refresh_soc().await.unwrap();
        assert_eq!(unit.last_known_soc(), Some(42.0));
        assert!(unit.is_eligible(BatteryMode::Charge, 10.0, 90.0));
        assert!(unit.is_eligible(BatteryMode::Discharge, 10.0, 90.0));
        assert!(!unit.is_eligible(BatteryMode::Stop, 10.0, 90.0));
    }

    #[tokio::test]
    async fn test_failed_read_keeps_previous_soc() {
        let mut device = MockBatteryDevice::new();
        let mut seq = mockall::Sequence::new();
        device
            .expect_read_soc()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(60.0));
        device
            .expect_read_soc()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(BatteryError::Timeout(3000)));
        device
            .expect_read_soc()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(250.0));
        let mut unit = BatteryUnit::new(1, Arc::new(device));

        unit.refresh_soc().await.unwrap();
        assert!(unit.refresh_soc().await.is_err());
        assert!(matches!(
            unit.refresh_soc().await,
            Err(BatteryError::SocOutOfBounds(_))
        ));
        assert_eq!(unit.last_known_soc(), Some(60.0));
        assert_eq!(unit.consecutive_errors(), 2);
    }

    #[tokio::test]
    async fn test_apply_updates_state_only_on_success() {
        let mut device = MockBatteryDevice::new();
        device
            .expect_set_power()
            .withf(|w, m| *w == 400.0 && *m == BatteryMode::Discharge)
            .times(1)
            .returning(|_, _| Ok(()));
        device
            .expect_set_power()
            .withf(|_, m| *m == BatteryMode::Charge)
            .times(1)
            .returning(|_, _| Err(BatteryError::Communication("refused".into())));
        let mut unit = BatteryUnit::new(2, Arc::new(device));

        unit.apply(400.0, BatteryMode::Discharge).await.unwrap();
        assert!(unit.apply(300.0, BatteryMode::Charge).await.is_err());

        assert_eq!(unit.current_mode(), BatteryMode::Discharge);
        assert_eq!(unit.current_power_w(), 400.0);
        assert_eq!(unit.consecutive_errors(), 1);
    }

    #[tokio::test]
    async fn test_stop_always_sends_zero() {
        let mut device = MockBatteryDevice::new();
        device
            .expect_set_power()
            .withf(|w, m| *w == 0.0 && *m == BatteryMode::Stop)
            .times(1)
            .returning(|_, _| Ok(()));
        let mut unit = BatteryUnit::new(2, Arc::new(device));
        unit.stop().await.unwrap();
        assert_eq!(unit.current_power_w(), 0.0);
    }

    #[tokio::test]
    async fn test_negative_power_is_rejected_before_io() {
        let device = MockBatteryDevice::new();
        let mut unit = BatteryUnit::new(2, Arc::new(device));
        assert!(matches!(
            unit.apply(-5.0, BatteryMode::Charge).await,
            Err(BatteryError::InvalidPower(_))
        ));
    }

    #[test]
    fn test_mode_display_roundtrip() {
        assert_eq!(BatteryMode::Discharge.to_string(), "discharge");
        assert_eq!("charge".parse::<BatteryMode>().unwrap(), BatteryMode::Charge);
    }

    #[cfg(feature = "sim")]
    #[tokio::test]
    async fn test_simulated_battery_integrates_soc() {
        let battery = SimulatedBattery::new(50.0, 1000.0, 1.0);
        battery.set_power(500.0, BatteryMode::Charge).await.unwrap();
        assert_eq!(battery.grid_contribution_w().await, 500.0);

        // 500 W for one hour into 1 kWh = +50 %
        battery.advance(3600.0).await;
        assert_eq!(battery.read_soc().await.unwrap(), 100.0);
        // full battery stops absorbing
        assert_eq!(battery.grid_contribution_w().await, 0.0);
    }
}
