use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tracing::{error, info, warn};

use crate::config::SafetyConfig;
use crate::domain::BatteryState;

/// Safety event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SafetyEvent {
    /// Pack voltage outside the envelope
    VoltageOutOfRange { voltage_v: f64, min_v: f64, max_v: f64 },
    /// Battery temperature exceeded safe charging limits
    OverTemperature { temperature_c: f64, limit_c: f64 },
    /// Battery temperature below safe charging range
    UnderTemperature { temperature_c: f64, limit_c: f64 },
    /// SOC reading outside plausible bounds
    SocOutOfRange { soc_percent: f64, min_percent: f64, max_percent: f64 },
    /// A reading was NaN or infinite
    NonFiniteReading { field: String },
    /// No telemetry could be read this tick
    TelemetryUnavailable { detail: String },
}

impl fmt::Display for SafetyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VoltageOutOfRange { voltage_v, min_v, max_v } => write!(
                f,
                "voltage {voltage_v:.1}V outside {min_v:.1}-{max_v:.1}V"
            ),
            Self::OverTemperature { temperature_c, limit_c } => write!(
                f,
                "temperature {temperature_c:.1}°C exceeds maximum {limit_c:.1}°C"
            ),
            Self::UnderTemperature { temperature_c, limit_c } => write!(
                f,
                "temperature {temperature_c:.1}°C below minimum {limit_c:.1}°C"
            ),
            Self::SocOutOfRange { soc_percent, min_percent, max_percent } => write!(
                f,
                "SOC {soc_percent:.1}% outside {min_percent:.1}-{max_percent:.1}%"
            ),
            Self::NonFiniteReading { field } => write!(f, "non-finite {field} reading"),
            Self::TelemetryUnavailable { detail } => write!(f, "telemetry unavailable: {detail}"),
        }
    }
}

/// Result of one safety check.
///
/// `ok` is false while a violation is present and stays false afterwards
/// until `clean_checks` reaches the configured requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub ok: bool,
    pub violation_reason: Option<String>,
    pub consecutive_violations: u32,
    pub clean_checks: u32,
    pub reading_clean: bool,
    pub checked_at: DateTime<Utc>,
}

impl SafetyVerdict {
    /// Verdict before any reading has been taken.
    pub fn initial(at: DateTime<Utc>) -> Self {
        Self {
            ok: false,
            violation_reason: Some("no safety check performed yet".to_string()),
            consecutive_violations: 0,
            clean_checks: 0,
            reading_clean: false,
            checked_at: at,
        }
    }

    /// True when this check itself found a violation (not merely lockout).
    pub fn is_violation(&self) -> bool {
        !self.reading_clean
    }
}

/// Envelope check with hysteresis for battery charging.
pub struct SafetyMonitor {
    config: SafetyConfig,
    last_events: VecDeque<(DateTime<Utc>, SafetyEvent)>,
    consecutive_violations: u32,
    clean_checks: u32,
}

impl SafetyMonitor {
    /// Starts satisfied: a fresh monitor does not force a lockout at boot.
    pub fn new(config: SafetyConfig) -> Self {
        let clean_checks = config.clean_checks_required;
        Self {
            last_events: VecDeque::with_capacity(config.event_history),
            config,
            consecutive_violations: 0,
            clean_checks,
        }
    }

    pub fn check(&mut self, state: &BatteryState) -> SafetyVerdict {
        self.check_at(state, Utc::now())
    }

    /// Evaluate a reading taken at `now`.
    pub fn check_at(&mut self, state: &BatteryState, now: DateTime<Utc>) -> SafetyVerdict {
        let events = self.violations(state);
        if events.is_empty() {
            return self.record_clean(now);
        }
        self.record_violations(now, events)
    }

    /// Missing telemetry counts as a violation: charging blind is never allowed.
    pub fn record_unavailable(&mut self, detail: &str, now: DateTime<Utc>) -> SafetyVerdict {
        self.record_violations(
            now,
            vec![SafetyEvent::TelemetryUnavailable {
                detail: detail.to_string(),
            }],
        )
    }

    fn violations(&self, state: &BatteryState) -> Vec<SafetyEvent> {
        let c = &self.config;
        let mut events = Vec::new();

        for (field, value) in [
            ("voltage", state.voltage_v),
            ("temperature", state.temperature_c),
            ("soc", state.soc_percent),
        ] {
            if !value.is_finite() {
                events.push(SafetyEvent::NonFiniteReading {
                    field: field.to_string(),
                });
            }
        }
        if !events.is_empty() {
            return events;
        }

        if state.voltage_v < c.min_voltage_v || state.voltage_v > c.max_voltage_v {
            events.push(SafetyEvent::VoltageOutOfRange {
                voltage_v: state.voltage_v,
                min_v: c.min_voltage_v,
                max_v: c.max_voltage_v,
            });
        }
        if state.temperature_c > c.max_temperature_c {
            events.push(SafetyEvent::OverTemperature {
                temperature_c: state.temperature_c,
                limit_c: c.max_temperature_c,
            });
        }
        if state.temperature_c < c.min_temperature_c {
            events.push(SafetyEvent::UnderTemperature {
                temperature_c: state.temperature_c,
                limit_c: c.min_temperature_c,
            });
        }
        if state.soc_percent < c.min_soc_percent || state.soc_percent > c.max_soc_percent {
            events.push(SafetyEvent::SocOutOfRange {
                soc_percent: state.soc_percent,
                min_percent: c.min_soc_percent,
                max_percent: c.max_soc_percent,
            });
        }
        events
    }

    fn record_clean(&mut self, now: DateTime<Utc>) -> SafetyVerdict {
        let required = self.config.clean_checks_required;
        let was_locked = self.clean_checks < required;
        self.clean_checks = self.clean_checks.saturating_add(1);
        self.consecutive_violations = 0;
        let ok = self.clean_checks >= required;

        if was_locked && ok {
            info!(
                clean_checks = self.clean_checks,
                "Safety lockout cleared after consecutive clean readings"
            );
        }

        SafetyVerdict {
            ok,
            violation_reason: (!ok).then(|| {
                format!(
                    "safety lockout: {} of {} clean checks",
                    self.clean_checks, required
                )
            }),
            consecutive_violations: 0,
            clean_checks: self.clean_checks,
            reading_clean: true,
            checked_at: now,
        }
    }

    fn record_violations(&mut self, now: DateTime<Utc>, events: Vec<SafetyEvent>) -> SafetyVerdict {
        self.clean_checks = 0;
        self.consecutive_violations = self.consecutive_violations.saturating_add(1);

        let reason = events
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");

        if self.consecutive_violations == 1 {
            error!(
                reason = %reason,
                "SAFETY VIOLATION: charging forbidden until readings recover"
            );
        } else {
            warn!(
                reason = %reason,
                consecutive_violations = self.consecutive_violations,
                "Safety violation persists"
            );
        }

        for event in events {
            self.record_event(now, event);
        }

        SafetyVerdict {
            ok: false,
            violation_reason: Some(reason),
            consecutive_violations: self.consecutive_violations,
            clean_checks: 0,
            reading_clean: false,
            checked_at: now,
        }
    }

    /// Record a safety event
    fn record_event(&mut self, timestamp: DateTime<Utc>, event: SafetyEvent) {
        self.last_events.push_back((timestamp, event));

        if self.last_events.len() > self.config.event_history {
            self.last_events.pop_front();
        }
    }

    /// Get recent safety events, oldest first
    pub fn get_recent_events(&self, count: usize) -> Vec<(DateTime<Utc>, SafetyEvent)> {
        let start = self.last_events.len().saturating_sub(count);
        self.last_events.iter().skip(start).cloned().collect()
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn safe_state() -> BatteryState {
        BatteryState {
            soc_percent: 50.0,
            voltage_v: 52.0,
            temperature_c: 25.0,
            capacity_kwh: 10.0,
        }
    }

    fn monitor() -> SafetyMonitor {
        SafetyMonitor::new(SafetyConfig::default())
    }

    #[test]
    fn test_safe_battery_state() {
        let mut m = monitor();
        let v = m.check(&safe_state());
        assert!(v.ok);
        assert!(v.reading_clean);
        assert_eq!(v.violation_reason, None);
    }

    #[rstest]
    #[case::over_temperature(|s: &mut BatteryState| s.temperature_c = 55.0, "exceeds maximum")]
    #[case::under_temperature(|s: &mut BatteryState| s.temperature_c = -5.0, "below minimum")]
    #[case::over_voltage(|s: &mut BatteryState| s.voltage_v = 60.0, "voltage")]
    #[case::under_voltage(|s: &mut BatteryState| s.voltage_v = 40.0, "voltage")]
    #[case::soc(|s: &mut BatteryState| s.soc_percent = 104.0, "SOC")]
    #[case::nan(|s: &mut BatteryState| s.temperature_c = f64::NAN, "non-finite temperature")]
    fn test_violations(#[case] mutate: fn(&mut BatteryState), #[case] expected: &str) {
        let mut m = monitor();
        let mut state = safe_state();
        mutate(&mut state);
        let v = m.check(&state);
        assert!(!v.ok);
        assert!(v.is_violation());
        let reason = v.violation_reason.unwrap();
        assert!(reason.contains(expected), "{reason}");
        assert_eq!(m.get_recent_events(10).len(), 1);
    }

    #[test]
    fn test_hysteresis_requires_consecutive_clean_checks() {
        let mut m = monitor();
        let mut hot = safe_state();
        hot.temperature_c = 50.0;

        assert!(!m.check(&hot).ok);
        assert!(!m.check(&hot).ok);

        let first = m.check(&safe_state());
        assert!(!first.ok);
        assert!(first.reading_clean);
        assert_eq!(first.clean_checks, 1);
        assert!(first.violation_reason.unwrap().contains("1 of 3"));

        assert!(!m.check(&safe_state()).ok);
        let third = m.check(&safe_state());
        assert!(third.ok);
        assert_eq!(third.clean_checks, 3);
    }

    #[test]
    fn test_violation_resets_clean_streak() {
        let mut m = monitor();
        let mut hot = safe_state();
        hot.temperature_c = 50.0;

        m.check(&hot);
        m.check(&safe_state());
        m.check(&safe_state());
        let v = m.check(&hot);
        assert_eq!(v.clean_checks, 0);
        assert_eq!(v.consecutive_violations, 1);
        assert!(!m.check(&safe_state()).ok);
    }

    #[test]
    fn test_unavailable_telemetry_is_a_violation() {
        let mut m = monitor();
        let v = m.record_unavailable("timeout", Utc::now());
        assert!(!v.ok);
        assert!(v.violation_reason.unwrap().contains("telemetry unavailable"));
    }

    #[test]
    fn test_event_history_is_bounded() {
        let config = SafetyConfig {
            event_history: 3,
            ..SafetyConfig::default()
        };
        let mut m = SafetyMonitor::new(config);
        for i in 0..5 {
            let mut s = safe_state();
            s.temperature_c = 50.0 + i as f64;
            m.check(&s);
        }
        let events = m.get_recent_events(10);
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[2].1,
            SafetyEvent::OverTemperature {
                temperature_c: 54.0,
                limit_c: 45.0
            }
        );
    }
}
