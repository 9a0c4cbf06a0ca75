//! # Grid meter sampling
//!
//! The sampler keeps a short history of grid readings and hands the dispatch
//! controller a recency-weighted average, so a single spiky reading does not
//! flip the fleet. It never retries and never invents a reading: a failed poll
//! only bumps the failure streak the control loop uses for its fail-safe.

pub mod ecotracker;
pub mod shelly;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::GridSample;

pub use ecotracker::EcoTrackerMeter;
pub use shelly::ShellyMeter;

/// Number of readings averaged by [`MeterSampler::smoothed`].
pub const SMOOTHING_WINDOW: usize = 3;

#[derive(Debug, Error)]
pub enum MeterError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Unexpected meter payload: {0}")]
    Payload(String),
    #[error("Meter unavailable: {0}")]
    Unavailable(String),
}

/// A grid power meter. One call is exactly one roundtrip.
#[async_trait]
pub trait PowerMeter: Send + Sync {
    /// Net grid power in watts, positive = import.
    async fn read_power(&self) -> Result<f64, MeterError>;

    /// Short label used in logs and status ("shelly", "ecotracker", ...).
    fn kind(&self) -> &'static str;
}

/// Serializable meter view for the status surface
#[derive(Debug, Clone, Serialize)]
pub struct MeterStatus {
    pub kind: String,
    pub consecutive_failures: u32,
    pub history: Vec<GridSample>,
    pub smoothed_w: Option<f64>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

pub struct MeterSampler {
    meter: Box<dyn PowerMeter>,
    history: VecDeque<GridSample>,
    consecutive_failures: u32,
    last_success: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl MeterSampler {
    pub fn new(meter: Box<dyn PowerMeter>) -> Self {
        Self {
            meter,
            history: VecDeque::with_capacity(SMOOTHING_WINDOW),
            consecutive_failures: 0,
            last_success: None,
            last_error: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.meter.kind()
    }

    /// Take one fresh reading and push it into the window.
    pub async fn sample(&mut self) -> Option<f64> {
        match self.meter.read_power().await {
            Ok(power_w) => {
                if self.history.len() == SMOOTHING_WINDOW {
                    self.history.pop_front();
                }
                let sample = GridSample::now(power_w);
                self.history.push_back(sample);

                if self.consecutive_failures > 0 {
                    info!(
                        meter = self.kind(),
                        failures = self.consecutive_failures,
                        "meter reachable again"
                    );
                }
                self.consecutive_failures = 0;
                self.last_success = Some(sample.timestamp);
                self.last_error = None;
                Some(power_w)
            }
            Err(e) => {
                self.consecutive_failures += 1;
                warn!(
                    meter = self.kind(),
                    error = %e,
                    failures = self.consecutive_failures,
                    "meter poll failed"
                );
                self.last_error = Some(e.to_string());
                None
            }
        }
    }

    /// Recency-weighted average of the window, sampling once if it is empty.
    pub async fn smoothed(&mut self) -> Option<f64> {
        if self.history.is_empty() {
            return self.sample().await;
        }
        let average = weighted_average(&self.history);
        if let Some(avg) = average {
            debug!(meter = self.kind(), average_w = avg, samples = self.history.len(), "smoothed grid power");
        }
        average
    }

    /// The current window without touching the meter.
    pub fn peek_smoothed(&self) -> Option<f64> {
        weighted_average(&self.history)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn latest(&self) -> Option<GridSample> {
        self.history.back().copied()
    }

    pub fn history(&self) -> impl Iterator<Item = &GridSample> {
        self.history.iter()
    }

    pub fn status(&self) -> MeterStatus {
        MeterStatus {
            kind: self.kind().to_string(),
            consecutive_failures: self.consecutive_failures,
            history: self.history.iter().copied().collect(),
            smoothed_w: self.peek_smoothed(),
            last_success: self.last_success,
            last_error: self.last_error.clone(),
        }
    }
}

/// Weights are the recency rank: oldest = 1 ... newest = N.
fn weighted_average(samples: &VecDeque<GridSample>) -> Option<f64> {
    match samples.len() {
        0 => None,
        1 => Some(samples[0].power_w),
        _ => {
            let (weighted_sum, total_weight) = samples
                .iter()
                .zip(1..)
                .fold((0.0, 0.0), |(sum, weights), (sample, rank)| {
                    let weight = f64::from(rank);
                    (sum + sample.power_w * weight, weights + weight)
                });
            Some(weighted_sum / total_weight)
        }
    }
}
