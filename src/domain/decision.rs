use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use strum::{Display, EnumString};

use super::{BatteryState, ConsumptionEstimate, Price, PriceSample, PvForecast};

/// What the coordinator should do with the charger this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChargeAction {
    Start,
    Stop,
    Continue,
    Wait,
    None,
}

/// Which rule produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TriggeringPolicy {
    EmergencyOverride,
    MissingPriceFallback,
    SuperLowPrice,
    CriticalSocAdvisor,
    WeightedScore,
    SafetyInterlock,
    HardwareDegraded,
    TelemetryUnavailable,
}

/// Immutable decision log entry. Always carries at least one reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub timestamp: DateTime<Utc>,
    pub action: ChargeAction,
    pub confidence: f64,
    #[serde(deserialize_with = "deserialize_reasons")]
    reasons: Vec<String>,
    pub triggering_policy: TriggeringPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_soc: Option<f64>,
}

impl Decision {
    pub fn new(
        timestamp: DateTime<Utc>,
        action: ChargeAction,
        triggering_policy: TriggeringPolicy,
        confidence: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            action,
            confidence: confidence.clamp(0.0, 1.0),
            reasons: vec![reason.into()],
            triggering_policy,
            target_soc: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reasons.push(reason.into());
        self
    }

    pub fn with_reasons<I, S>(mut self, reasons: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reasons.extend(reasons.into_iter().map(Into::into));
        self
    }

    pub fn with_target_soc(mut self, target_soc: f64) -> Self {
        self.target_soc = Some(target_soc.clamp(0.0, 100.0));
        self
    }

    /// Replace the action of an existing decision, keeping its reasons after
    /// the override reason so the audit trail shows what was overridden.
    pub fn overridden(
        self,
        action: ChargeAction,
        triggering_policy: TriggeringPolicy,
        reason: impl Into<String>,
    ) -> Self {
        let mut reasons = vec![reason.into()];
        reasons.push(format!(
            "overrode {} from {}",
            self.action, self.triggering_policy
        ));
        reasons.extend(self.reasons);
        Self {
            timestamp: self.timestamp,
            action,
            confidence: 1.0,
            reasons,
            triggering_policy,
            target_soc: None,
        }
    }

    pub fn reasons(&self) -> &[String] {
        &self.reasons
    }

    pub fn is_start(&self) -> bool {
        self.action == ChargeAction::Start
    }
}

fn deserialize_reasons<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let reasons = Vec::<String>::deserialize(deserializer)?;
    if reasons.is_empty() {
        return Err(de::Error::custom("decision must carry at least one reason"));
    }
    Ok(reasons)
}

/// Everything the policy engine sees for one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionInput {
    pub timestamp: DateTime<Utc>,
    pub price: Option<PriceSample>,
    pub price_forecast: Vec<PriceSample>,
    pub reference_price: Option<Price>,
    pub battery: BatteryState,
    pub pv: PvForecast,
    pub consumption: ConsumptionEstimate,
}
