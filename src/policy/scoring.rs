//! Sub-scores for the weighted charging decision.
//!
//! Every score is normalized to `[0, 100]`; higher means "more reason to
//! charge from the grid now".

use serde::{Deserialize, Serialize};

use crate::config::{ScoringConfig, SocThresholds};
use crate::domain::{ConsumptionEstimate, Price, PvForecast};

/// Price ratio (price / reference) at or below which the price score saturates at 100.
const CHEAP_RATIO: f64 = 0.5;
/// Price ratio at or above which the price score drops to 0.
const EXPENSIVE_RATIO: f64 = 2.0;
/// Load ratio (current / baseline) below which consumption adds no urgency.
const QUIET_LOAD_RATIO: f64 = 0.5;
/// Load ratio at which consumption urgency saturates.
const HEAVY_LOAD_RATIO: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub price: f64,
    pub battery: f64,
    pub pv: f64,
    pub consumption: f64,
    pub total: f64,
}

impl ScoreBreakdown {
    pub fn compute(
        price: Price,
        reference: Price,
        soc_percent: f64,
        pv: &PvForecast,
        consumption: &ConsumptionEstimate,
        thresholds: &SocThresholds,
        weights: &ScoringConfig,
    ) -> Self {
        let price_s = price_score(price, reference);
        let battery_s = battery_score(soc_percent, thresholds);
        let pv_s = pv_score(pv, consumption);
        let consumption_s = consumption_score(consumption);
        let total = weights.price_weight * price_s
            + weights.battery_weight * battery_s
            + weights.pv_weight * pv_s
            + weights.consumption_weight * consumption_s;

        Self {
            price: price_s,
            battery: battery_s,
            pv: pv_s,
            consumption: consumption_s,
            total: total.clamp(0.0, 100.0),
        }
    }
}

/// Linear interpolation of `x` between `(x0, y0)` and `(x1, y1)`, clamped to the segment.
fn lerp_clamped(x: f64, x0: f64, y0: f64, x1: f64, y1: f64) -> f64 {
    if x1 <= x0 {
        return y1;
    }
    let t = ((x - x0) / (x1 - x0)).clamp(0.0, 1.0);
    y0 + (y1 - y0) * t
}

/// Inverse-monotonic in price relative to the rolling reference.
pub fn price_score(price: Price, reference: Price) -> f64 {
    let p = price.as_per_kwh();
    let r = reference.as_per_kwh();
    if p <= 0.0 {
        return 100.0;
    }
    if r <= 0.0 {
        return 0.0;
    }
    lerp_clamped(p / r, CHEAP_RATIO, 100.0, EXPENSIVE_RATIO, 0.0)
}

/// Decreasing in SOC, shaped by the SOC tiers.
pub fn battery_score(soc_percent: f64, t: &SocThresholds) -> f64 {
    let points = [
        (t.critical, 100.0),
        (t.low, 80.0),
        (t.medium, 50.0),
        (t.high, 15.0),
        (100.0, 0.0),
    ];
    if soc_percent <= points[0].0 {
        return 100.0;
    }
    points
        .windows(2)
        .find(|w| soc_percent <= w[1].0)
        .map(|w| lerp_clamped(soc_percent, w[0].0, w[0].1, w[1].0, w[1].1))
        .unwrap_or(0.0)
}

/// Decreasing in PV surplus over household load.
pub fn pv_score(pv: &PvForecast, consumption: &ConsumptionEstimate) -> f64 {
    let load = consumption.current_w.max(1.0);
    let surplus = pv.expected_power_w() - consumption.current_w.max(0.0);
    if surplus <= 0.0 {
        return 100.0;
    }
    lerp_clamped(surplus / load, 0.0, 100.0, 1.0, 0.0)
}

/// Increasing in current load relative to the recent baseline.
pub fn consumption_score(consumption: &ConsumptionEstimate) -> f64 {
    if consumption.recent_avg_w <= 0.0 {
        return 50.0;
    }
    let ratio = consumption.current_w.max(0.0) / consumption.recent_avg_w;
    lerp_clamped(ratio, QUIET_LOAD_RATIO, 0.0, HEAVY_LOAD_RATIO, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PvTrend;
    use rstest::rstest;

    fn pv(w: f64) -> PvForecast {
        PvForecast {
            current_power_w: w,
            power_in_30min_w: w,
            trend: PvTrend::Stable,
        }
    }

    fn load(current_w: f64, recent_avg_w: f64) -> ConsumptionEstimate {
        ConsumptionEstimate {
            current_w,
            recent_avg_w,
        }
    }

    #[rstest]
    #[case(0.4, 100.0)]
    #[case(0.5, 100.0)]
    #[case(2.0, 0.0)]
    #[case(3.0, 0.0)]
    #[case(-0.1, 100.0)]
    fn test_price_score_bounds(#[case] price: f64, #[case] expected: f64) {
        let s = price_score(Price::per_kwh(price), Price::per_kwh(1.0));
        assert!((s - expected).abs() < 1e-9, "price {price} -> {s}");
    }

    #[test]
    fn test_price_score_is_inverse_monotonic() {
        let reference = Price::per_kwh(1.0);
        let mut last = f64::INFINITY;
        for cents in (40..=220).step_by(10) {
            let s = price_score(Price::per_kwh(cents as f64 / 100.0), reference);
            assert!(s <= last);
            last = s;
        }
    }

    #[test]
    fn test_battery_score_is_decreasing() {
        let t = SocThresholds::default();
        let mut last = f64::INFINITY;
        for soc in 0..=100 {
            let s = battery_score(soc as f64, &t);
            assert!((0.0..=100.0).contains(&s));
            assert!(s <= last, "soc {soc} -> {s} > {last}");
            last = s;
        }
        assert_eq!(battery_score(100.0, &t), 0.0);
        assert_eq!(battery_score(t.low, &t), 80.0);
    }

    #[test]
    fn test_pv_score_drops_with_surplus() {
        let house = load(1000.0, 1000.0);
        assert_eq!(pv_score(&pv(0.0), &house), 100.0);
        assert_eq!(pv_score(&pv(1000.0), &house), 100.0);
        assert!((pv_score(&pv(1500.0), &house) - 50.0).abs() < 1e-9);
        assert_eq!(pv_score(&pv(5000.0), &house), 0.0);
    }

    #[test]
    fn test_consumption_score_tracks_baseline() {
        assert_eq!(consumption_score(&load(200.0, 1000.0)), 0.0);
        assert_eq!(consumption_score(&load(2500.0, 1000.0)), 100.0);
        assert_eq!(consumption_score(&load(500.0, 0.0)), 50.0);
        assert!(consumption_score(&load(1200.0, 1000.0)) > consumption_score(&load(900.0, 1000.0)));
    }

    #[test]
    fn test_total_uses_configured_weights() {
        let b = ScoreBreakdown::compute(
            Price::per_kwh(0.5),
            Price::per_kwh(1.0),
            0.0,
            &pv(0.0),
            &load(2000.0, 1000.0),
            &SocThresholds::default(),
            &ScoringConfig::default(),
        );
        // Every sub-score saturates at 100 here
        assert!((b.total - 100.0).abs() < 1e-9);
    }
}
