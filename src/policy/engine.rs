//! Priority chain turning one tick's inputs into a [`Decision`].
//!
//! Rules are evaluated top to bottom and the first match wins:
//!
//! 1. emergency SOC: charge unconditionally
//! 2. missing price: deterministic fallback
//! 3. super-low price: fill to 100%
//! 4. critical SOC: ask the wait advisor
//! 5. weighted score with start/stop hysteresis
//!
//! Nothing here reads the clock or performs I/O; `input.timestamp` is "now".

use crate::config::PolicyConfig;
use crate::domain::{
    ChargeAction, ChargingSession, Decision, DecisionInput, Price, PriceSample, TriggeringPolicy,
};

use super::scoring::ScoreBreakdown;
use super::wait_advisor::{advise, WaitVerdict};

/// Fill target for super-low price charging.
const FULL_SOC: f64 = 100.0;

pub fn decide(
    input: &DecisionInput,
    active: Option<&ChargingSession>,
    config: &PolicyConfig,
) -> Decision {
    let soc = input.battery.soc_percent;
    let t = &config.thresholds;
    let now = input.timestamp;

    let price = input.price.filter(|s| s.final_price.is_finite());

    if soc <= t.emergency {
        let decision = Decision::new(
            now,
            ChargeAction::Start,
            TriggeringPolicy::EmergencyOverride,
            1.0,
            "emergency override",
        )
        .with_reason(format!("SOC {soc:.1}% <= emergency {:.1}%", t.emergency));
        // A super-low price still fills to 100% under emergency.
        return match price.filter(|s| is_super_low(s, config)) {
            Some(sample) => decision
                .with_reason("super low price arbitrage")
                .with_reason(super_low_reason(&sample, config))
                .with_target_soc(FULL_SOC),
            None => decision.with_target_soc(config.default_target_soc),
        };
    }

    let Some(sample) = price else {
        return missing_price(input, config);
    };

    if let Some(decision) = super_low(&sample, soc, input, config) {
        return decision;
    }

    if soc <= t.critical {
        return critical(&sample, input, active, config);
    }

    weighted(&sample, input, active, config)
}

fn missing_price(input: &DecisionInput, config: &PolicyConfig) -> Decision {
    let soc = input.battery.soc_percent;
    let critical = config.thresholds.critical;

    if soc <= critical {
        Decision::new(
            input.timestamp,
            ChargeAction::Start,
            TriggeringPolicy::MissingPriceFallback,
            0.9,
            "no price data, charging to protect the battery",
        )
        .with_reason(format!("SOC {soc:.1}% <= critical {critical:.1}%"))
        .with_target_soc(config.default_target_soc)
    } else {
        Decision::new(
            input.timestamp,
            ChargeAction::None,
            TriggeringPolicy::MissingPriceFallback,
            0.5,
            "no price data — holding position",
        )
        .with_reason(format!("SOC {soc:.1}% above critical {critical:.1}%"))
    }
}

fn super_low(
    sample: &PriceSample,
    soc: f64,
    input: &DecisionInput,
    config: &PolicyConfig,
) -> Option<Decision> {
    if !is_super_low(sample, config) || soc >= FULL_SOC {
        return None;
    }

    let mut decision = Decision::new(
        input.timestamp,
        ChargeAction::Start,
        TriggeringPolicy::SuperLowPrice,
        0.95,
        "super low price arbitrage",
    )
    .with_reason(super_low_reason(sample, config))
    .with_target_soc(FULL_SOC);

    let surplus = input.pv.expected_power_w() - input.consumption.current_w;
    if surplus > 0.0 {
        decision = decision.with_reason(format!(
            "grid charging despite {surplus:.0} W PV surplus"
        ));
    }
    Some(decision)
}

fn is_super_low(sample: &PriceSample, config: &PolicyConfig) -> bool {
    sample.is_super_low || sample.final_price <= config.super_low_threshold()
}

fn super_low_reason(sample: &PriceSample, config: &PolicyConfig) -> String {
    format!(
        "price {} <= super low threshold {} (flagged: {})",
        sample.final_price,
        config.super_low_threshold(),
        sample.is_super_low
    )
}

fn critical(
    sample: &PriceSample,
    input: &DecisionInput,
    active: Option<&ChargingSession>,
    config: &PolicyConfig,
) -> Decision {
    let soc = input.battery.soc_percent;
    let band = format!(
        "SOC {soc:.1}% in critical band ({:.1}%, {:.1}%]",
        config.thresholds.emergency, config.thresholds.critical
    );

    if let Some(session) = active {
        return Decision::new(
            input.timestamp,
            ChargeAction::Continue,
            TriggeringPolicy::CriticalSocAdvisor,
            0.9,
            format!("keep charging session {} at critical SOC", session.id),
        )
        .with_reason(band);
    }

    let advice = advise(
        sample.final_price,
        &input.price_forecast,
        &input.pv,
        soc,
        input.timestamp,
        config,
    );
    let (action, lead) = match advice.verdict {
        WaitVerdict::ChargeNow => (ChargeAction::Start, "critical SOC, charging now"),
        WaitVerdict::Wait => (ChargeAction::Wait, "critical SOC, waiting for a better slot"),
    };

    let decision = Decision::new(
        input.timestamp,
        action,
        TriggeringPolicy::CriticalSocAdvisor,
        advice.confidence,
        lead,
    )
    .with_reason(band)
    .with_reasons(advice.reasons);

    match action {
        ChargeAction::Start => decision.with_target_soc(config.default_target_soc),
        _ => decision,
    }
}

/// Rolling observed mean, then forecast mean, then the configured default.
fn reference_price(input: &DecisionInput, config: &PolicyConfig) -> Price {
    input
        .reference_price
        .filter(|p| p.is_finite() && p.as_per_kwh() > 0.0)
        .or_else(|| {
            Price::mean(
                input
                    .price_forecast
                    .iter()
                    .map(|s| s.final_price)
                    .filter(Price::is_finite),
            )
            .filter(|p| p.as_per_kwh() > 0.0)
        })
        .unwrap_or_else(|| config.default_reference_price())
}

/// Distance from the deciding threshold mapped onto `[0.5, 1.0]`.
fn margin_confidence(total: f64, threshold: f64) -> f64 {
    (0.5 + (total - threshold).abs() / 100.0).clamp(0.5, 1.0)
}

fn weighted(
    sample: &PriceSample,
    input: &DecisionInput,
    active: Option<&ChargingSession>,
    config: &PolicyConfig,
) -> Decision {
    let reference = reference_price(input, config);
    let score = ScoreBreakdown::compute(
        sample.final_price,
        reference,
        input.battery.soc_percent,
        &input.pv,
        &input.consumption,
        &config.thresholds,
        &config.scoring,
    );
    let start = config.scoring.start_threshold;
    let stop = config.scoring.stop_threshold;
    let total = score.total;

    let detail = format!(
        "score {total:.1} (price {:.1}, battery {:.1}, pv {:.1}, consumption {:.1}); price {} vs reference {reference}",
        score.price, score.battery, score.pv, score.consumption, sample.final_price
    );

    let (action, reason, threshold) = match active {
        Some(_) if total > stop => (
            ChargeAction::Continue,
            format!("score {total:.1} above stop threshold {stop:.1}"),
            stop,
        ),
        Some(_) => (
            ChargeAction::Stop,
            format!("score {total:.1} fell to stop threshold {stop:.1}"),
            stop,
        ),
        None if total >= start => (
            ChargeAction::Start,
            format!("score {total:.1} reached start threshold {start:.1}"),
            start,
        ),
        None if total >= stop => (
            ChargeAction::Wait,
            format!("score {total:.1} between stop {stop:.1} and start {start:.1}"),
            start,
        ),
        None => (
            ChargeAction::None,
            format!("score {total:.1} below stop threshold {stop:.1}"),
            stop,
        ),
    };

    let decision = Decision::new(
        input.timestamp,
        action,
        TriggeringPolicy::WeightedScore,
        margin_confidence(total, threshold),
        reason,
    )
    .with_reason(detail);

    match action {
        ChargeAction::Start => decision.with_target_soc(config.default_target_soc),
        _ => decision,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        BatteryState, ChargeWindow, ConsumptionEstimate, PvForecast, PvTrend, SessionId,
        SessionPlan, Energy,
    };
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use proptest::prelude::*;
    use rstest::rstest;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 2, 0, 0).unwrap()
    }

    fn input(soc: f64, price: Option<f64>) -> DecisionInput {
        DecisionInput {
            timestamp: now(),
            price: price.map(|p| PriceSample::new(now(), Price::per_kwh(p))),
            price_forecast: Vec::new(),
            reference_price: Some(Price::per_kwh(1.0)),
            battery: BatteryState {
                soc_percent: soc,
                voltage_v: 52.0,
                temperature_c: 20.0,
                capacity_kwh: 10.0,
            },
            pv: PvForecast::none(),
            consumption: ConsumptionEstimate {
                current_w: 800.0,
                recent_avg_w: 800.0,
            },
        }
    }

    fn active_session() -> ChargingSession {
        let window = ChargeWindow::new(now(), now() + Duration::hours(2)).unwrap();
        let mut s = ChargingSession::planned(
            SessionId::new(),
            SessionPlan {
                window,
                target_soc: 90.0,
                required_energy: Energy::kilowatt_hours(4.0),
                soc_at_start: 50.0,
                price_at_start: Some(Price::per_kwh(0.8)),
            },
        );
        s.state = crate::domain::SessionState::Active;
        s
    }

    fn config() -> PolicyConfig {
        PolicyConfig::default()
    }

    #[rstest]
    #[case(Some(5.0))]
    #[case(Some(0.01))]
    #[case(None)]
    #[case(Some(f64::NAN))]
    fn test_emergency_always_starts(#[case] price: Option<f64>) {
        let d = decide(&input(4.0, price), None, &config());
        assert_eq!(d.action, ChargeAction::Start);
        assert_eq!(d.triggering_policy, TriggeringPolicy::EmergencyOverride);
        assert_eq!(d.confidence, 1.0);
        assert_eq!(d.reasons()[0], "emergency override");
    }

    #[test]
    fn test_emergency_with_super_low_price_fills_to_full() {
        let d = decide(&input(3.0, Some(0.01)), None, &config());
        assert_eq!(d.action, ChargeAction::Start);
        assert_eq!(d.triggering_policy, TriggeringPolicy::EmergencyOverride);
        assert_eq!(d.confidence, 1.0);
        assert_eq!(d.reasons()[0], "emergency override");
        assert_eq!(d.target_soc, Some(100.0));
        assert!(d.reasons().iter().any(|r| r == "super low price arbitrage"));

        let d = decide(&input(3.0, Some(1.2)), None, &config());
        assert_eq!(d.target_soc, Some(config().default_target_soc));
    }

    #[test]
    fn test_emergency_ignores_pv_surplus() {
        let mut i = input(5.0, Some(3.0));
        i.pv = PvForecast {
            current_power_w: 6000.0,
            power_in_30min_w: 6000.0,
            trend: PvTrend::Rising,
        };
        assert_eq!(decide(&i, None, &config()).action, ChargeAction::Start);
    }

    #[test]
    fn test_missing_price_at_critical_starts() {
        let d = decide(&input(9.0, None), None, &config());
        assert_eq!(d.action, ChargeAction::Start);
        assert_eq!(d.triggering_policy, TriggeringPolicy::MissingPriceFallback);
    }

    #[test]
    fn test_missing_price_above_critical_holds() {
        let d = decide(&input(40.0, None), None, &config());
        assert_eq!(d.action, ChargeAction::None);
        assert_eq!(d.reasons()[0], "no price data — holding position");
    }

    #[test]
    fn test_missing_price_is_deterministic() {
        let a = decide(&input(40.0, None), None, &config());
        let b = decide(&input(40.0, None), None, &config());
        assert_eq!(a, b);
    }

    #[test]
    fn test_super_low_fills_to_full_despite_pv_surplus() {
        let mut i = input(60.0, Some(0.02));
        i.pv = PvForecast {
            current_power_w: 4000.0,
            power_in_30min_w: 4000.0,
            trend: PvTrend::Stable,
        };
        let d = decide(&i, None, &config());
        assert_eq!(d.action, ChargeAction::Start);
        assert_eq!(d.target_soc, Some(100.0));
        assert_eq!(d.reasons()[0], "super low price arbitrage");
        assert!(d.reasons().iter().any(|r| r.contains("PV surplus")));
    }

    #[test]
    fn test_super_low_flag_is_honoured() {
        let mut i = input(60.0, Some(0.3));
        i.price = i.price.map(PriceSample::super_low);
        let d = decide(&i, None, &config());
        assert_eq!(d.triggering_policy, TriggeringPolicy::SuperLowPrice);
    }

    #[test]
    fn test_super_low_skipped_when_full() {
        let d = decide(&input(100.0, Some(0.01)), None, &config());
        assert_ne!(d.triggering_policy, TriggeringPolicy::SuperLowPrice);
    }

    #[test]
    fn test_critical_band_consults_advisor() {
        let mut cfg = config();
        cfg.wait.base_wait_hours = 6.0;
        cfg.wait.max_wait_hours = 6.0;

        let mut i = input(8.0, Some(1.5));
        i.price_forecast = vec![
            PriceSample::new(now() + Duration::hours(1), Price::per_kwh(1.4)),
            PriceSample::new(now() + Duration::hours(2), Price::per_kwh(0.4)),
        ];
        let d = decide(&i, None, &cfg);
        assert_eq!(d.action, ChargeAction::Wait);
        assert_eq!(d.triggering_policy, TriggeringPolicy::CriticalSocAdvisor);
        assert!(d.reasons().iter().any(|r| r.contains("savings 73.3%")));

        i.price_forecast = vec![PriceSample::new(now() + Duration::hours(8), Price::per_kwh(0.4))];
        let d = decide(&i, None, &cfg);
        assert_eq!(d.action, ChargeAction::Start);
        assert_eq!(d.target_soc, Some(cfg.default_target_soc));
    }

    #[test]
    fn test_critical_band_keeps_active_session() {
        let session = active_session();
        let d = decide(&input(8.0, Some(1.5)), Some(&session), &config());
        assert_eq!(d.action, ChargeAction::Continue);
    }

    #[test]
    fn test_weighted_start_on_cheap_price_and_low_soc() {
        let d = decide(&input(25.0, Some(0.4)), None, &config());
        assert_eq!(d.action, ChargeAction::Start);
        assert_eq!(d.triggering_policy, TriggeringPolicy::WeightedScore);
    }

    #[test]
    fn test_weighted_none_on_expensive_price_and_full_battery() {
        let d = decide(&input(95.0, Some(2.5)), None, &config());
        assert_eq!(d.action, ChargeAction::None);
    }

    #[test]
    fn test_weighted_stop_for_active_session() {
        let session = active_session();
        let d = decide(&input(95.0, Some(2.5)), Some(&session), &config());
        assert_eq!(d.action, ChargeAction::Stop);
        let d = decide(&input(25.0, Some(0.4)), Some(&session), &config());
        assert_eq!(d.action, ChargeAction::Continue);
    }

    #[test]
    fn test_reference_falls_back_to_forecast_mean() {
        let mut i = input(50.0, Some(1.0));
        i.reference_price = None;
        i.price_forecast = vec![
            PriceSample::new(now() + Duration::hours(1), Price::per_kwh(1.5)),
            PriceSample::new(now() + Duration::hours(2), Price::per_kwh(2.5)),
        ];
        assert_eq!(reference_price(&i, &config()).as_per_kwh(), 2.0);

        i.price_forecast.clear();
        assert_eq!(reference_price(&i, &config()).as_per_kwh(), 1.0);
    }

    proptest! {
        #[test]
        fn prop_reasons_never_empty_and_confidence_bounded(
            soc in 0.0f64..=100.0,
            price in proptest::option::of(-0.5f64..5.0),
            pv in 0.0f64..8000.0,
            load in 0.0f64..5000.0,
            has_active in any::<bool>(),
        ) {
            let mut i = input(soc, price);
            i.pv.current_power_w = pv;
            i.pv.power_in_30min_w = pv;
            i.consumption.current_w = load;
            let session = active_session();
            let d = decide(&i, has_active.then_some(&session), &config());
            prop_assert!(!d.reasons().is_empty());
            prop_assert!((0.0..=1.0).contains(&d.confidence));
            if soc <= config().thresholds.emergency {
                prop_assert_eq!(d.action, ChargeAction::Start);
            }
            let threshold = config().super_low_price_per_kwh;
            if price.is_some_and(|p| p <= threshold) && soc < 100.0 {
                prop_assert_eq!(d.action, ChargeAction::Start);
                prop_assert_eq!(d.target_soc, Some(100.0));
            }
        }
    }
}
