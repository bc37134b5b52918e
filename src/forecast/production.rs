use async_trait::async_trait;
use chrono::{DateTime, Duration, Timelike, Utc};

use super::{CollaboratorError, PvForecastService};
use crate::domain::{PvForecast, PvTrend};

/// Relative change (of peak power) below which the trend counts as stable.
const STABLE_BAND: f64 = 0.02;

/// Clear-sky sine model between sunrise and sunset (UTC hours).
#[derive(Debug, Clone)]
pub struct DaylightPvForecast {
    pub peak_kw: f64,
    pub sunrise: f64,
    pub sunset: f64,
    pub cloud_factor: f64,
}

impl Default for DaylightPvForecast {
    fn default() -> Self {
        Self {
            peak_kw: 3.5,
            sunrise: 6.0,
            sunset: 18.0,
            cloud_factor: 0.75,
        }
    }
}

impl DaylightPvForecast {
    pub fn power_w_at(&self, t: DateTime<Utc>) -> f64 {
        let hh = t.hour() as f64 + t.minute() as f64 / 60.0;
        if hh <= self.sunrise || hh >= self.sunset {
            return 0.0;
        }
        let day_len = (self.sunset - self.sunrise).max(0.01);
        let x = (hh - self.sunrise) / day_len;
        (std::f64::consts::PI * x).sin().max(0.0) * self.peak_kw * self.cloud_factor * 1000.0
    }

    pub fn forecast_at(&self, now: DateTime<Utc>) -> PvForecast {
        let current = self.power_w_at(now);
        let ahead = self.power_w_at(now + Duration::minutes(30));
        let band = self.peak_kw * 1000.0 * STABLE_BAND;
        let trend = if ahead - current > band {
            PvTrend::Rising
        } else if current - ahead > band {
            PvTrend::Falling
        } else {
            PvTrend::Stable
        };
        PvForecast {
            current_power_w: current,
            power_in_30min_w: ahead,
            trend,
        }
    }
}

#[async_trait]
impl PvForecastService for DaylightPvForecast {
    async fn get(&self, _horizon: Duration) -> Result<PvForecast, CollaboratorError> {
        Ok(self.forecast_at(Utc::now()))
    }
}
