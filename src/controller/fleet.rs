use futures::future::join_all;
use std::collections::BTreeMap;
use tracing::{info, warn};

use super::error::DispatchError;
use crate::domain::{BatteryMode, BatteryUnit, BatteryUnitStatus, UnitId};

/// Ordered registry of battery units, keyed by id.
///
/// Iteration is always ascending by id so even splits are reproducible.
#[derive(Debug, Default)]
pub struct Fleet {
    units: BTreeMap<UnitId, BatteryUnit>,
}

impl Fleet {
    pub fn new(units: impl IntoIterator<Item = BatteryUnit>) -> Self {
        Self {
            units: units.into_iter().map(|u| (u.id(), u)).collect(),
        }
    }

    pub fn insert(&mut self, unit: BatteryUnit) -> Option<BatteryUnit> {
        self.units.insert(unit.id(), unit)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn ids(&self) -> Vec<UnitId> {
        self.units.keys().copied().collect()
    }

    pub fn get(&self, id: UnitId) -> Option<&BatteryUnit> {
        self.units.get(&id)
    }

    pub fn get_mut(&mut self, id: UnitId) -> Option<&mut BatteryUnit> {
        self.units.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BatteryUnit> {
        self.units.values()
    }

    /// Read every unit's SoC once, concurrently. Returns the fresh reading per unit.
    pub async fn refresh_soc(&mut self) -> BTreeMap<UnitId, Option<f64>> {
        let reads = self.units.values_mut().map(|unit| async move {
            let soc = unit.refresh_soc().await.ok();
            (unit.id(), soc)
        });
        let results: BTreeMap<_, _> = join_all(reads).await.into_iter().collect();

        let failed = results.values().filter(|soc| soc.is_none()).count();
        if failed > 0 {
            warn!(failed, total = results.len(), "soc refresh incomplete");
        }
        results
    }

    /// Mean over units with a known SoC; `None` if no unit has one.
    pub fn average_soc(&self) -> Option<f64> {
        let known: Vec<f64> = self.iter().filter_map(|u| u.last_known_soc()).collect();
        if known.is_empty() {
            None
        } else {
            Some(known.iter().sum::<f64>() / known.len() as f64)
        }
    }

    pub fn min_max_soc(&self) -> Option<(f64, f64)> {
        self.iter()
            .filter_map(|u| u.last_known_soc())
            .fold(None, |acc, soc| match acc {
                None => Some((soc, soc)),
                Some((lo, hi)) => Some((lo.min(soc), hi.max(soc))),
            })
    }

    pub fn all_soc_unknown(&self) -> bool {
        self.iter().all(|u| u.last_known_soc().is_none())
    }

    pub fn count_eligible(&self, mode: BatteryMode, min_soc: f64, max_soc: f64) -> usize {
        self.iter()
            .filter(|u| u.is_eligible(mode, min_soc, max_soc))
            .count()
    }

    /// Unconditional fleet-wide stop. Every unit is attempted.
    pub async fn stop_all(&mut self) -> Result<(), DispatchError> {
        if self.units.is_empty() {
            return Ok(());
        }
        let stops = self.units.values_mut().map(|unit| async move {
            let result = unit.stop().await;
            (unit.id(), result)
        });
        let results = join_all(stops).await;

        let attempted = results.len();
        let failures: Vec<DispatchError> = results
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| DispatchError::device(id, e)))
            .collect();

        match failures.len() {
            0 => {
                info!(units = attempted, "fleet stopped");
                Ok(())
            }
            n if n == attempted => Err(DispatchError::FullDispatchFailure { failures }),
            n => Err(DispatchError::PartialDispatchFailure {
                succeeded: attempted - n,
                failures,
            }),
        }
    }

    /// Battery AC power seen from the grid side: discharge positive, charge negative.
    pub fn net_power_w(&self) -> f64 {
        self.iter()
            .map(|u| match u.current_mode() {
                BatteryMode::Discharge => u.current_power_w(),
                BatteryMode::Charge => -u.current_power_w(),
                BatteryMode::Stop => 0.0,
            })
            .sum()
    }

    pub fn snapshot(&self) -> Vec<BatteryUnitStatus> {
        self.iter().map(BatteryUnit::status).collect()
    }
}
