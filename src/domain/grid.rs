use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One grid-meter reading.
///
/// Sign convention: positive = import from the grid, negative = export/feed-in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSample {
    pub power_w: f64,
    pub timestamp: DateTime<Utc>,
}

impl GridSample {
    pub fn now(power_w: f64) -> Self {
        Self {
            power_w,
            timestamp: Utc::now(),
        }
    }

    pub fn is_import(&self) -> bool {
        self.power_w > 0.0
    }
}
