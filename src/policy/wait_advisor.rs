//! Charge-now versus wait decision for the critical SOC band.
//!
//! Bounded: the advisor only ever recommends waiting for a cheaper slot that
//! lies inside a wait budget derived from the achievable savings and shrunk
//! as SOC approaches the emergency threshold. Any doubt about the forecast
//! resolves to charging now.

use chrono::{DateTime, Duration, Timelike, Utc};
use itertools::Itertools;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::config::PolicyConfig;
use crate::domain::{Price, PriceSample, PvForecast, PvTrend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum WaitVerdict {
    ChargeNow,
    Wait,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitAdvice {
    pub verdict: WaitVerdict,
    pub confidence: f64,
    pub reasons: Vec<String>,
}

impl WaitAdvice {
    fn charge_now(confidence: f64, reason: String) -> Self {
        Self {
            verdict: WaitVerdict::ChargeNow,
            confidence,
            reasons: vec![reason],
        }
    }

    fn wait(confidence: f64, reason: String) -> Self {
        Self {
            verdict: WaitVerdict::Wait,
            confidence,
            reasons: vec![reason],
        }
    }

    fn because(mut self, reason: String) -> Self {
        self.reasons.push(reason);
        self
    }
}

/// Cheapest upcoming slot and what waiting for it would save.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Opportunity {
    best: Price,
    time_to_best_h: f64,
    savings_percent: f64,
}

impl Opportunity {
    fn of(current: Price, sample: &PriceSample, now: DateTime<Utc>) -> Self {
        let c = current.as_per_kwh();
        Self {
            best: sample.final_price,
            time_to_best_h: (sample.timestamp - now).num_seconds() as f64 / 3600.0,
            savings_percent: (c - sample.final_price.as_per_kwh()) / c * 100.0,
        }
    }
}

/// Best slot inside the maximum wait window, and the best one after it.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Opportunities {
    within: Option<Opportunity>,
    beyond: Option<Opportunity>,
}

/// Why a forecast cannot be trusted.
fn forecast_defect(forecast: &[PriceSample]) -> Option<&'static str> {
    if forecast.is_empty() {
        return Some("no price forecast available");
    }
    if forecast.iter().any(|s| !s.final_price.is_finite()) {
        return Some("price forecast contains non-finite prices");
    }
    if forecast
        .iter()
        .tuple_windows()
        .any(|(a, b)| a.timestamp >= b.timestamp)
    {
        return Some("price forecast is not strictly ordered by time");
    }
    None
}

fn find_opportunities(
    current: Price,
    forecast: &[PriceSample],
    now: DateTime<Utc>,
    max_wait_hours: f64,
) -> Option<Opportunities> {
    let limit = now + Duration::seconds((max_wait_hours * 3600.0) as i64);
    let (within, beyond): (Vec<&PriceSample>, Vec<&PriceSample>) = forecast
        .iter()
        .filter(|s| s.timestamp > now)
        .partition(|s| s.timestamp <= limit);
    if within.is_empty() && beyond.is_empty() {
        return None;
    }
    let cheapest = |slots: Vec<&PriceSample>| {
        slots
            .into_iter()
            .min_by_key(|s| OrderedFloat(s.final_price.as_per_kwh()))
            .map(|s| Opportunity::of(current, s, now))
    };
    Some(Opportunities {
        within: cheapest(within),
        beyond: cheapest(beyond),
    })
}

/// Hours the battery may safely wait, given savings and SOC headroom.
pub fn wait_budget_hours(savings_percent: f64, soc_percent: f64, config: &PolicyConfig) -> f64 {
    let wait = &config.wait;
    let tier = wait.savings_multiplier(savings_percent);
    let margin = soc_percent - config.thresholds.emergency;
    let soc_factor = wait.soc_multiplier(margin);
    (wait.base_wait_hours * tier * soc_factor).min(wait.max_wait_hours).max(0.0)
}

fn price_improving_soon(
    current: Price,
    forecast: &[PriceSample],
    now: DateTime<Utc>,
    config: &PolicyConfig,
) -> bool {
    let horizon = now + Duration::minutes(i64::from(config.wait.near_horizon_minutes));
    let bar = current.as_per_kwh() * (1.0 - config.wait.near_price_improvement_percent / 100.0);
    forecast
        .iter()
        .filter(|s| s.timestamp > now && s.timestamp <= horizon)
        .any(|s| s.final_price.as_per_kwh() <= bar)
}

fn is_daylight(now: DateTime<Utc>, config: &PolicyConfig) -> bool {
    let hour = now.hour();
    hour >= config.wait.daylight_start_hour && hour < config.wait.daylight_end_hour
}

fn pv_improving_soon(pv: &PvForecast, now: DateTime<Utc>, config: &PolicyConfig) -> bool {
    is_daylight(now, config)
        && pv.trend != PvTrend::Falling
        && pv.power_in_30min_w - pv.current_power_w >= config.wait.pv_improvement_min_w
}

/// Decide whether to charge now or hold out for a cheaper slot.
///
/// `price_forecast` must be ordered by timestamp; anything else is treated
/// as missing data and yields `ChargeNow`.
pub fn advise(
    current_price: Price,
    price_forecast: &[PriceSample],
    pv_forecast: &PvForecast,
    soc_percent: f64,
    now: DateTime<Utc>,
    config: &PolicyConfig,
) -> WaitAdvice {
    let max_critical = config.wait.max_critical_price();

    if !current_price.is_finite() {
        return WaitAdvice::charge_now(
            0.8,
            "current price unusable, charging now rather than waiting blind".to_string(),
        );
    }

    if current_price <= max_critical {
        return WaitAdvice::charge_now(
            0.9,
            format!("acceptable price: current {current_price} <= max critical {max_critical}"),
        );
    }

    if let Some(defect) = forecast_defect(price_forecast) {
        return WaitAdvice::charge_now(
            0.8,
            format!("{defect}, charging now at current {current_price} instead of waiting"),
        );
    }

    let max_wait = config.wait.max_wait_hours;
    let Some(found) = find_opportunities(current_price, price_forecast, now, max_wait) else {
        return WaitAdvice::charge_now(
            0.8,
            format!("price forecast has no future slots, charging now at current {current_price}"),
        );
    };
    let later = found.beyond.filter(|b| b.savings_percent > 0.0).filter(|b| {
        found
            .within
            .map_or(true, |w| b.savings_percent > w.savings_percent)
    });
    let later_reason = later.map(|b| {
        format!(
            "cheaper {} in {:.1}h lies beyond max wait {max_wait:.1}h",
            b.best, b.time_to_best_h
        )
    });

    let opp = match found.within {
        Some(opp) if opp.savings_percent > 0.0 => opp,
        within => {
            if let Some(reason) = later_reason {
                return WaitAdvice::charge_now(
                    0.75,
                    "savings not reachable within safe wait window".to_string(),
                )
                .because(format!("current {current_price}; {reason}"));
            }
            let best = within.or(found.beyond).map(|o| o.best).unwrap_or(current_price);
            return WaitAdvice::charge_now(
                0.85,
                format!("no cheaper price ahead: current {current_price}, best forecast {best}"),
            );
        }
    };

    let budget = wait_budget_hours(opp.savings_percent, soc_percent, config);
    let summary = format!(
        "current {current_price}, best {} in {:.1}h, savings {:.1}%, wait budget {:.1}h at SOC {:.1}%",
        opp.best, opp.time_to_best_h, opp.savings_percent, budget, soc_percent
    );

    let summary = match &later_reason {
        Some(reason) => format!("{summary}; {reason}"),
        None => summary,
    };

    if opp.time_to_best_h > budget {
        return WaitAdvice::charge_now(
            0.75,
            "savings not reachable within safe wait window".to_string(),
        )
        .because(summary);
    }

    let price_soon = price_improving_soon(current_price, price_forecast, now, config);
    let pv_soon = pv_improving_soon(pv_forecast, now, config);
    let near = config.wait.near_horizon_minutes;
    let wait_confidence = (0.5 + opp.savings_percent / 200.0).min(0.95);

    let (bar, signal) = match (price_soon, pv_soon) {
        (true, true) => {
            return WaitAdvice::wait(
                wait_confidence,
                format!("price and PV both improving within {near} min"),
            )
            .because(summary);
        }
        (true, false) => (
            config.wait.single_signal_min_savings_percent,
            format!("price improving within {near} min"),
        ),
        (false, true) => (
            config.wait.single_signal_min_savings_percent,
            format!("PV improving within {near} min"),
        ),
        (false, false) => (
            config.wait.no_signal_min_savings_percent,
            format!("neither price nor PV improving within {near} min"),
        ),
    };

    if opp.savings_percent >= bar {
        WaitAdvice::wait(
            wait_confidence,
            format!("{signal}; savings {:.1}% >= {bar:.1}% justify waiting", opp.savings_percent),
        )
        .because(summary)
    } else {
        WaitAdvice::charge_now(
            0.7,
            format!("{signal}; savings {:.1}% < {bar:.1}% do not justify waiting", opp.savings_percent),
        )
        .because(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 2, 0, 0).unwrap()
    }

    fn config() -> PolicyConfig {
        let mut cfg = PolicyConfig::default();
        cfg.wait.base_wait_hours = 6.0;
        cfg.wait.max_wait_hours = 6.0;
        cfg
    }

    fn sample(hours: i64, price: f64) -> PriceSample {
        PriceSample::new(now() + Duration::hours(hours), Price::per_kwh(price))
    }

    fn sample_min(minutes: i64, price: f64) -> PriceSample {
        PriceSample::new(now() + Duration::minutes(minutes), Price::per_kwh(price))
    }

    fn dark() -> PvForecast {
        PvForecast::none()
    }

    #[test]
    fn test_wait_when_large_saving_is_within_budget() {
        let forecast = vec![sample(1, 1.4), sample(2, 0.4), sample(3, 1.2)];
        let advice = advise(Price::per_kwh(1.5), &forecast, &dark(), 8.0, now(), &config());

        assert_eq!(advice.verdict, WaitVerdict::Wait);
        let all = advice.reasons.join(" | ");
        assert!(all.contains("savings 73.3%"), "{all}");
        assert!(all.contains("wait budget 6.0h"), "{all}");
        assert!(all.contains("best 0.400/kWh in 2.0h"), "{all}");
    }

    #[test]
    fn test_charge_now_when_best_is_beyond_budget() {
        let forecast = vec![sample(8, 0.4)];
        let advice = advise(Price::per_kwh(1.5), &forecast, &dark(), 8.0, now(), &config());

        assert_eq!(advice.verdict, WaitVerdict::ChargeNow);
        assert_eq!(advice.reasons[0], "savings not reachable within safe wait window");
        assert!(advice.reasons[1].contains("in 8.0h"), "{}", advice.reasons[1]);
        assert!(advice.reasons[1].contains("beyond max wait 6.0h"));
    }

    #[test]
    fn test_cheaper_slot_past_max_wait_does_not_hide_reachable_saving() {
        let forecast = vec![sample(2, 0.5), sample(8, 0.3)];
        let advice = advise(
            Price::per_kwh(1.5),
            &forecast,
            &dark(),
            8.0,
            now(),
            &PolicyConfig::default(),
        );

        assert_eq!(advice.verdict, WaitVerdict::Wait);
        let all = advice.reasons.join(" | ");
        assert!(all.contains("best 0.500/kWh in 2.0h"), "{all}");
        assert!(all.contains("savings 66.7%"), "{all}");
        // 66.7% sits in the 1.0x tier: 4h base budget, not the 1.5x tier of the later slot
        assert!(all.contains("wait budget 4.0h"), "{all}");
        assert!(all.contains("cheaper 0.300/kWh in 8.0h lies beyond max wait 6.0h"), "{all}");
    }

    #[test]
    fn test_acceptable_price_charges_immediately() {
        let forecast = vec![sample(2, 0.1)];
        let advice = advise(Price::per_kwh(0.5), &forecast, &dark(), 8.0, now(), &config());
        assert_eq!(advice.verdict, WaitVerdict::ChargeNow);
        assert!(advice.reasons[0].starts_with("acceptable price"));
    }

    #[test]
    fn test_missing_forecast_charges_now() {
        let advice = advise(Price::per_kwh(1.5), &[], &dark(), 8.0, now(), &config());
        assert_eq!(advice.verdict, WaitVerdict::ChargeNow);
        assert!(advice.reasons[0].contains("no price forecast"));
    }

    #[test]
    fn test_unordered_forecast_charges_now() {
        let forecast = vec![sample(3, 0.4), sample(1, 0.3)];
        let advice = advise(Price::per_kwh(1.5), &forecast, &dark(), 8.0, now(), &config());
        assert_eq!(advice.verdict, WaitVerdict::ChargeNow);
        assert!(advice.reasons[0].contains("not strictly ordered"));
    }

    #[test]
    fn test_non_finite_forecast_charges_now() {
        let forecast = vec![sample(1, f64::NAN)];
        let advice = advise(Price::per_kwh(1.5), &forecast, &dark(), 8.0, now(), &config());
        assert_eq!(advice.verdict, WaitVerdict::ChargeNow);
    }

    #[test]
    fn test_stale_forecast_charges_now() {
        let forecast = vec![sample(-2, 0.2), sample(-1, 0.3)];
        let advice = advise(Price::per_kwh(1.5), &forecast, &dark(), 8.0, now(), &config());
        assert_eq!(advice.verdict, WaitVerdict::ChargeNow);
        assert!(advice.reasons[0].contains("no future slots"));
    }

    #[test]
    fn test_budget_shrinks_near_emergency() {
        let cfg = config();
        let roomy = wait_budget_hours(73.3, 8.0, &cfg);
        let tight = wait_budget_hours(73.3, 5.5, &cfg);
        assert_eq!(roomy, 6.0);
        assert_eq!(tight, 3.0);

        // 33% saving 3h out: budget is 6h * 0.7 * 0.5 = 2.1h at SOC 5.2%
        let forecast = vec![sample(3, 1.0)];
        let advice = advise(Price::per_kwh(1.5), &forecast, &dark(), 5.2, now(), &cfg);
        assert_eq!(advice.verdict, WaitVerdict::ChargeNow);
    }

    #[test]
    fn test_savings_tiers_scale_budget() {
        let cfg = config();
        assert_eq!(wait_budget_hours(85.0, 9.0, &cfg), 6.0); // 9h capped at max_wait
        assert_eq!(wait_budget_hours(50.0, 9.0, &cfg), 6.0);
        assert!((wait_budget_hours(20.0, 9.0, &cfg) - 4.2).abs() < 1e-9);
    }

    #[test]
    fn test_small_saving_without_signals_charges_now() {
        // 20% saving at +2h: inside budget but below the no-signal bar
        let forecast = vec![sample(2, 1.2)];
        let advice = advise(Price::per_kwh(1.5), &forecast, &dark(), 8.0, now(), &config());
        assert_eq!(advice.verdict, WaitVerdict::ChargeNow);
        assert!(advice.reasons[0].contains("neither price nor PV improving"));
    }

    #[test]
    fn test_price_signal_lowers_the_bar() {
        // 20% cheaper slot 30 minutes out counts as "improving soon"
        let forecast = vec![sample_min(30, 1.2)];
        let advice = advise(Price::per_kwh(1.5), &forecast, &dark(), 8.0, now(), &config());
        assert_eq!(advice.verdict, WaitVerdict::Wait);
        assert!(advice.reasons[0].starts_with("price improving"));
    }

    #[test]
    fn test_pv_ignored_at_night() {
        let rising = PvForecast {
            current_power_w: 0.0,
            power_in_30min_w: 2000.0,
            trend: PvTrend::Rising,
        };
        // 02:00 UTC is outside the default daylight window
        let forecast = vec![sample(2, 1.2)];
        let advice = advise(Price::per_kwh(1.5), &forecast, &rising, 8.0, now(), &config());
        assert_eq!(advice.verdict, WaitVerdict::ChargeNow);
    }

    #[test]
    fn test_pv_signal_in_daylight_never_extends_budget() {
        let noon = Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap();
        let rising = PvForecast {
            current_power_w: 500.0,
            power_in_30min_w: 2500.0,
            trend: PvTrend::Rising,
        };
        let cfg = config();

        let near = vec![PriceSample::new(noon + Duration::hours(2), Price::per_kwh(1.2))];
        let advice = advise(Price::per_kwh(1.5), &near, &rising, 8.0, noon, &cfg);
        assert_eq!(advice.verdict, WaitVerdict::Wait);
        assert!(advice.reasons[0].starts_with("PV improving"));

        // A cheap slot past the budget stays out of reach even with strong PV
        let far = vec![PriceSample::new(noon + Duration::hours(7), Price::per_kwh(0.2))];
        let advice = advise(Price::per_kwh(1.5), &far, &rising, 8.0, noon, &cfg);
        assert_eq!(advice.verdict, WaitVerdict::ChargeNow);
    }

    #[test]
    fn test_every_branch_reports_a_reason() {
        let cases: Vec<Vec<PriceSample>> = vec![
            vec![],
            vec![sample(1, 2.0)],
            vec![sample(2, 0.4)],
            vec![sample(9, 0.4)],
        ];
        for forecast in cases {
            let advice = advise(Price::per_kwh(1.5), &forecast, &dark(), 7.0, now(), &config());
            assert!(!advice.reasons.is_empty());
        }
    }
}
