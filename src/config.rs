use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::Validate;

use crate::domain::{Power, Price};

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
pub const ENV_PREFIX: &str = "CHARGECTL__";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(#[from] validator::ValidationErrors),
    #[error("SOC thresholds must satisfy emergency < critical < low < medium < high (got {0})")]
    ThresholdOrder(String),
    #[error("score weights must sum to 1.0 (got {0:.3})")]
    Weights(f64),
    #[error("stop threshold {stop} must be below start threshold {start}")]
    ScoreHysteresis { start: f64, stop: f64 },
    #[error("invalid wait table: {0}")]
    WaitTable(String),
    #[error("invalid safety envelope: {0}")]
    SafetyEnvelope(String),
    #[error("invalid server address: {0}")]
    Address(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub server: ServerConfig,
    #[validate(nested)]
    pub controller: ControllerConfig,
    #[validate(nested)]
    pub battery: BatteryConfig,
    #[validate(nested)]
    pub policy: PolicyConfig,
    #[validate(nested)]
    pub safety: SafetyConfig,
    #[validate(nested)]
    pub hardware: HardwareConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[validate(range(min = 1, max = 300))]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::Address(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ControllerConfig {
    /// Control loop interval (seconds)
    #[validate(range(min = 1))]
    pub tick_seconds: u64,
    /// Upper bound for every collaborator call (milliseconds)
    #[validate(range(min = 1))]
    pub collaborator_timeout_ms: u64,
    /// How far ahead prices and PV are requested (hours)
    #[validate(range(min = 1, max = 72))]
    pub forecast_horizon_hours: u32,
    /// Number of observed prices kept for the rolling reference price
    #[validate(range(min = 1))]
    pub reference_window: usize,
    /// Ticks spent in degraded mode after a fatal hardware alert
    #[validate(range(min = 1))]
    pub degraded_cooldown_ticks: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_seconds: 900,
            collaborator_timeout_ms: 5_000,
            forecast_horizon_hours: 24,
            reference_window: 96,
            degraded_cooldown_ticks: 4,
        }
    }
}

impl ControllerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_seconds.max(1))
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.collaborator_timeout_ms.max(1))
    }

    pub fn forecast_horizon(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.forecast_horizon_hours))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BatteryConfig {
    #[validate(range(min = 0.1))]
    pub capacity_kwh: f64,
    #[validate(range(min = 0.1))]
    pub max_charge_kw: f64,
    /// Slack (SOC points) allowed around the expected trajectory when reconciling
    #[validate(range(min = 0.0, max = 50.0))]
    pub reconciliation_tolerance_percent: f64,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            capacity_kwh: 10.0,
            max_charge_kw: 3.0,
            reconciliation_tolerance_percent: 5.0,
        }
    }
}

impl BatteryConfig {
    pub fn max_charge_power(&self) -> Power {
        Power::kilowatts(self.max_charge_kw)
    }
}

/// SOC tiers, strictly ordered.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SocThresholds {
    #[validate(range(min = 0.0, max = 100.0))]
    pub emergency: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub critical: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub low: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub medium: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub high: f64,
}

impl Default for SocThresholds {
    fn default() -> Self {
        Self {
            emergency: 5.0,
            critical: 10.0,
            low: 20.0,
            medium: 50.0,
            high: 80.0,
        }
    }
}

impl SocThresholds {
    pub fn is_ordered(&self) -> bool {
        self.emergency < self.critical
            && self.critical < self.low
            && self.low < self.medium
            && self.medium < self.high
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ScoringConfig {
    #[validate(range(min = 0.0, max = 1.0))]
    pub price_weight: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub battery_weight: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub pv_weight: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub consumption_weight: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub start_threshold: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub stop_threshold: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            price_weight: 0.40,
            battery_weight: 0.25,
            pv_weight: 0.20,
            consumption_weight: 0.15,
            start_threshold: 60.0,
            stop_threshold: 40.0,
        }
    }
}

impl ScoringConfig {
    pub fn weight_sum(&self) -> f64 {
        self.price_weight + self.battery_weight + self.pv_weight + self.consumption_weight
    }
}

/// Wait budget multiplier applied when savings reach `min_savings_percent`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SavingsTier {
    pub min_savings_percent: f64,
    pub multiplier: f64,
}

/// Wait budget multiplier applied when SOC sits at least `min_margin_percent`
/// above the emergency threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SocWaitFactor {
    pub min_margin_percent: f64,
    pub multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct WaitAdvisorConfig {
    /// Prices at or below this are accepted immediately at critical SOC
    #[validate(range(min = 0.0))]
    pub max_critical_price_per_kwh: f64,
    #[validate(range(min = 0.0, max = 48.0))]
    pub base_wait_hours: f64,
    /// Hard ceiling on any wait budget
    #[validate(range(min = 0.0, max = 48.0))]
    pub max_wait_hours: f64,
    pub savings_tiers: Vec<SavingsTier>,
    pub soc_wait_factors: Vec<SocWaitFactor>,
    /// Look-ahead for "improving soon" signals
    #[validate(range(min = 1, max = 240))]
    pub near_horizon_minutes: u32,
    #[validate(range(min = 0.0, max = 100.0))]
    pub near_price_improvement_percent: f64,
    #[validate(range(min = 0.0))]
    pub pv_improvement_min_w: f64,
    #[validate(range(max = 23))]
    pub daylight_start_hour: u32,
    #[validate(range(max = 24))]
    pub daylight_end_hour: u32,
    #[validate(range(min = 0.0, max = 100.0))]
    pub single_signal_min_savings_percent: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub no_signal_min_savings_percent: f64,
}

impl Default for WaitAdvisorConfig {
    fn default() -> Self {
        Self {
            max_critical_price_per_kwh: 0.6,
            base_wait_hours: 4.0,
            max_wait_hours: 6.0,
            savings_tiers: vec![
                SavingsTier { min_savings_percent: 80.0, multiplier: 1.5 },
                SavingsTier { min_savings_percent: 40.0, multiplier: 1.0 },
                SavingsTier { min_savings_percent: 0.0, multiplier: 0.7 },
            ],
            soc_wait_factors: vec![
                SocWaitFactor { min_margin_percent: 2.0, multiplier: 1.0 },
                SocWaitFactor { min_margin_percent: 1.0, multiplier: 0.75 },
                SocWaitFactor { min_margin_percent: 0.0, multiplier: 0.5 },
            ],
            near_horizon_minutes: 60,
            near_price_improvement_percent: 10.0,
            pv_improvement_min_w: 300.0,
            daylight_start_hour: 6,
            daylight_end_hour: 20,
            single_signal_min_savings_percent: 10.0,
            no_signal_min_savings_percent: 40.0,
        }
    }
}

impl WaitAdvisorConfig {
    pub fn max_critical_price(&self) -> Price {
        Price::per_kwh(self.max_critical_price_per_kwh)
    }

    /// Multiplier of the first tier (highest first) whose floor `savings_percent` reaches.
    pub fn savings_multiplier(&self, savings_percent: f64) -> f64 {
        self.savings_tiers
            .iter()
            .find(|t| savings_percent >= t.min_savings_percent)
            .map(|t| t.multiplier)
            .unwrap_or(0.0)
    }

    /// Multiplier for the given SOC margin above emergency; the smallest
    /// configured factor applies below every floor.
    pub fn soc_multiplier(&self, margin_percent: f64) -> f64 {
        self.soc_wait_factors
            .iter()
            .find(|f| margin_percent >= f.min_margin_percent)
            .or_else(|| self.soc_wait_factors.last())
            .map(|f| f.multiplier)
            .unwrap_or(0.0)
    }

    fn check_tables(&self) -> Result<(), ConfigError> {
        fn descending(floors: &[f64]) -> bool {
            floors.windows(2).all(|w| w[0] > w[1])
        }

        if self.savings_tiers.is_empty() || self.soc_wait_factors.is_empty() {
            return Err(ConfigError::WaitTable(
                "savings_tiers and soc_wait_factors must not be empty".into(),
            ));
        }
        let savings: Vec<f64> = self.savings_tiers.iter().map(|t| t.min_savings_percent).collect();
        let margins: Vec<f64> = self.soc_wait_factors.iter().map(|f| f.min_margin_percent).collect();
        if !descending(&savings) || !descending(&margins) {
            return Err(ConfigError::WaitTable(
                "tiers must be listed with strictly descending floors".into(),
            ));
        }
        if self.soc_wait_factors.windows(2).any(|w| w[0].multiplier < w[1].multiplier) {
            return Err(ConfigError::WaitTable(
                "soc_wait_factors must shrink as SOC approaches emergency".into(),
            ));
        }
        let all_multipliers = self
            .savings_tiers
            .iter()
            .map(|t| t.multiplier)
            .chain(self.soc_wait_factors.iter().map(|f| f.multiplier));
        for m in all_multipliers {
            if !(0.0..=5.0).contains(&m) {
                return Err(ConfigError::WaitTable(format!("multiplier {m} out of range 0..=5")));
            }
        }
        if self.daylight_start_hour >= self.daylight_end_hour {
            return Err(ConfigError::WaitTable(format!(
                "daylight window {}..{} is empty",
                self.daylight_start_hour, self.daylight_end_hour
            )));
        }
        Ok(())
    }
}

/// Everything the pure decision functions read.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PolicyConfig {
    #[validate(nested)]
    pub thresholds: SocThresholds,
    #[validate(nested)]
    pub scoring: ScoringConfig,
    #[validate(nested)]
    pub wait: WaitAdvisorConfig,
    #[validate(range(max = 10.0))]
    pub super_low_price_per_kwh: f64,
    /// Target for score-driven and critical starts
    #[validate(range(min = 1.0, max = 100.0))]
    pub default_target_soc: f64,
    /// Used when neither observed nor forecast prices exist
    #[validate(range(min = 0.0))]
    pub default_reference_price_per_kwh: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            thresholds: SocThresholds::default(),
            scoring: ScoringConfig::default(),
            wait: WaitAdvisorConfig::default(),
            super_low_price_per_kwh: 0.05,
            default_target_soc: 90.0,
            default_reference_price_per_kwh: 1.0,
        }
    }
}

impl PolicyConfig {
    pub fn super_low_threshold(&self) -> Price {
        Price::per_kwh(self.super_low_price_per_kwh)
    }

    pub fn default_reference_price(&self) -> Price {
        Price::per_kwh(self.default_reference_price_per_kwh)
    }

    fn check(&self) -> Result<(), ConfigError> {
        let t = &self.thresholds;
        if !t.is_ordered() {
            return Err(ConfigError::ThresholdOrder(format!(
                "{} / {} / {} / {} / {}",
                t.emergency, t.critical, t.low, t.medium, t.high
            )));
        }
        let sum = self.scoring.weight_sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(ConfigError::Weights(sum));
        }
        if self.scoring.stop_threshold >= self.scoring.start_threshold {
            return Err(ConfigError::ScoreHysteresis {
                start: self.scoring.start_threshold,
                stop: self.scoring.stop_threshold,
            });
        }
        self.wait.check_tables()
    }
}

/// Envelope the battery must stay inside for charging to be allowed.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SafetyConfig {
    pub min_voltage_v: f64,
    pub max_voltage_v: f64,
    pub min_temperature_c: f64,
    pub max_temperature_c: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub min_soc_percent: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub max_soc_percent: f64,
    /// Consecutive clean checks required before Start is allowed again
    #[validate(range(min = 1, max = 100))]
    pub clean_checks_required: u32,
    #[validate(range(min = 1))]
    pub event_history: usize,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            min_voltage_v: 44.0,
            max_voltage_v: 58.4,
            min_temperature_c: 0.0,
            max_temperature_c: 45.0, // Conservative for LiFePO4 charging
            min_soc_percent: 0.0,
            max_soc_percent: 100.0,
            clean_checks_required: 3,
            event_history: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HardwareConfig {
    /// Attempts after the first failed command
    #[validate(range(max = 10))]
    pub max_retries: u32,
    #[validate(range(min = 1))]
    pub backoff_initial_ms: u64,
    #[validate(range(min = 1))]
    pub backoff_max_ms: u64,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_initial_ms: 500,
            backoff_max_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceBackend {
    Memory,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: PersistenceBackend,
    pub data_dir: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::Json,
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl Config {
    /// Defaults, then `config/default.toml`, then `CHARGECTL__*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let cfg: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;
        cfg.validated()
    }

    /// Field ranges and cross-field rules. Runs once, at load time.
    pub fn validated(self) -> Result<Self, ConfigError> {
        Validate::validate(&self)?;
        self.policy.check()?;
        if self.safety.min_voltage_v >= self.safety.max_voltage_v
            || self.safety.min_temperature_c >= self.safety.max_temperature_c
            || self.safety.min_soc_percent >= self.safety.max_soc_percent
        {
            return Err(ConfigError::SafetyEnvelope(
                "minimums must be below maximums".into(),
            ));
        }
        Ok(self)
    }
}
