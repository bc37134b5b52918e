use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Timelike, Utc};
use std::sync::Arc;

use super::{CollaboratorError, PriceFeed};
use crate::domain::{Price, PriceSample};

type PriceFn = dyn Fn(DateTime<Utc>) -> Option<Price> + Send + Sync;

/// Price feed backed by a pure tariff lookup.
///
/// Slots are aligned to `slot`; a slot whose lookup yields `None` is left
/// out of the forecast, and a missing current slot is reported as `None`.
#[derive(Clone)]
pub struct TariffPriceFeed {
    price_at: Arc<PriceFn>,
    slot: Duration,
    super_low: Option<Price>,
}

impl TariffPriceFeed {
    pub fn new<F>(price_at: F) -> Self
    where
        F: Fn(DateTime<Utc>) -> Option<Price> + Send + Sync + 'static,
    {
        Self {
            price_at: Arc::new(price_at),
            slot: Duration::hours(1),
            super_low: None,
        }
    }

    /// Two-rate tariff with the peak rate applied in `[peak_start_hour, peak_end_hour)` UTC.
    pub fn time_of_use(offpeak: Price, peak: Price, peak_start_hour: u32, peak_end_hour: u32) -> Self {
        Self::new(move |t| {
            let h = t.hour();
            Some(if h >= peak_start_hour && h < peak_end_hour {
                peak
            } else {
                offpeak
            })
        })
    }

    pub fn with_slot(mut self, slot: Duration) -> Self {
        if slot > Duration::zero() {
            self.slot = slot;
        }
        self
    }

    /// Flag samples at or below `threshold` as super low.
    pub fn with_super_low_flag(mut self, threshold: Price) -> Self {
        self.super_low = Some(threshold);
        self
    }

    fn sample(&self, slot_start: DateTime<Utc>) -> Option<PriceSample> {
        let price = (self.price_at)(slot_start)?;
        let sample = PriceSample::new(slot_start, price);
        Some(match self.super_low {
            Some(threshold) if price <= threshold => sample.super_low(),
            _ => sample,
        })
    }

    /// Samples for the slot containing `now` and every later slot starting within `horizon`.
    pub fn snapshot_at(
        &self,
        now: DateTime<Utc>,
        horizon: Duration,
    ) -> Result<(Option<PriceSample>, Vec<PriceSample>), CollaboratorError> {
        let current_slot = now
            .duration_trunc(self.slot)
            .map_err(|e| CollaboratorError::DataUnavailable(format!("slot alignment: {e}")))?;
        let current = self.sample(current_slot);

        let end = now + horizon;
        let forecast = std::iter::successors(Some(current_slot + self.slot), |t| Some(*t + self.slot))
            .take_while(|t| *t <= end)
            .filter_map(|t| self.sample(t))
            .collect();
        Ok((current, forecast))
    }
}

#[async_trait]
impl PriceFeed for TariffPriceFeed {
    async fn get_current_and_forecast(
        &self,
        horizon: Duration,
    ) -> Result<(Option<PriceSample>, Vec<PriceSample>), CollaboratorError> {
        self.snapshot_at(Utc::now(), horizon)
    }
}
