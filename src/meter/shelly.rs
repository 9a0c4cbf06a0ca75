use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

use super::{MeterError, PowerMeter};

/// Shelly Pro 3EM read through its local RPC API.
pub struct ShellyMeter {
    client: reqwest::Client,
    status_url: String,
}

impl ShellyMeter {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, MeterError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            status_url: format!("{}/rpc/Shelly.GetStatus", base_url.trim_end_matches('/')),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ShellyStatus {
    #[serde(rename = "em:0")]
    em: Option<EnergyMeterStatus>,
}

/// Active power per phase; a phase that is not wired is reported as absent.
#[derive(Debug, Deserialize)]
struct EnergyMeterStatus {
    #[serde(default)]
    a_act_power: f64,
    #[serde(default)]
    b_act_power: f64,
    #[serde(default)]
    c_act_power: f64,
}

impl EnergyMeterStatus {
    fn total_w(&self) -> f64 {
        self.a_act_power + self.b_act_power + self.c_act_power
    }
}

fn parse_status(status: ShellyStatus) -> Result<f64, MeterError> {
    status
        .em
        .map(|em| em.total_w())
        .ok_or_else(|| MeterError::Payload("missing `em:0` component".to_string()))
}

#[async_trait]
impl PowerMeter for ShellyMeter {
    #[instrument(skip_all, fields(url = %self.status_url))]
    async fn read_power(&self) -> Result<f64, MeterError> {
        let status: ShellyStatus = self
            .client
            .get(&self.status_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let power_w = parse_status(status)?;
        debug!(power_w, "shelly reading");
        Ok(power_w)
    }

    fn kind(&self) -> &'static str {
        "shelly"
    }
}
