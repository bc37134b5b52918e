use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::Price;

/// One tariff slot as delivered by the price feed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceSample {
    pub timestamp: DateTime<Utc>,
    pub final_price: Price,
    pub is_super_low: bool,
}

impl PriceSample {
    pub fn new(timestamp: DateTime<Utc>, final_price: Price) -> Self {
        Self {
            timestamp,
            final_price,
            is_super_low: false,
        }
    }

    pub fn super_low(mut self) -> Self {
        self.is_super_low = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PvTrend {
    Rising,
    Stable,
    Falling,
}

/// Short-range PV outlook.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PvForecast {
    pub current_power_w: f64,
    pub power_in_30min_w: f64,
    pub trend: PvTrend,
}

impl PvForecast {
    pub fn none() -> Self {
        Self {
            current_power_w: 0.0,
            power_in_30min_w: 0.0,
            trend: PvTrend::Stable,
        }
    }

    /// Mean of the current and the 30-minute-ahead production.
    pub fn expected_power_w(&self) -> f64 {
        ((self.current_power_w + self.power_in_30min_w) / 2.0).max(0.0)
    }
}

/// Household load, current and recent average.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionEstimate {
    pub current_w: f64,
    pub recent_avg_w: f64,
}
