use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

use super::{MeterError, PowerMeter};

/// EcoTracker IR reader on the utility meter, local JSON endpoint.
pub struct EcoTrackerMeter {
    client: reqwest::Client,
    json_url: String,
}

impl EcoTrackerMeter {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, MeterError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            json_url: format!("{}/v1/json", base_url.trim_end_matches('/')),
        })
    }
}

#[derive(Debug, Deserialize)]
struct EcoTrackerReading {
    /// Already signed: positive = import, negative = feed-in.
    power: f64,
}

#[async_trait]
impl PowerMeter for EcoTrackerMeter {
    #[instrument(skip_all, fields(url = %self.json_url))]
    async fn read_power(&self) -> Result<f64, MeterError> {
        let reading: EcoTrackerReading = self
            .client
            .get(&self.json_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!(power_w = reading.power, "ecotracker reading");
        Ok(reading.power)
    }

    fn kind(&self) -> &'static str {
        "ecotracker"
    }
}
