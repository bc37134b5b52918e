//! Charger / inverter seam.
//!
//! The coordinator only ever talks to hardware through [`HardwareAdapter`]
//! (commands) and [`TelemetryReader`] (readings). How commands reach the
//! device is the adapter's business.

#[cfg(feature = "sim")]
pub mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{BatteryState, ConsumptionEstimate, Power};
use crate::forecast::CollaboratorError;

#[cfg(feature = "sim")]
pub use simulated::SimulatedHardware;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum HardwareError {
    #[error("device did not respond: {0}")]
    Communication(String),
    #[error("command rejected by device: {0}")]
    Rejected(String),
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

/// What the device itself reports, independent of any session bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LiveHardwareState {
    pub charging: bool,
    pub soc_percent: f64,
    pub charge_power: Power,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HardwareAdapter: Send + Sync {
    async fn start_charging(&self, power: Power, target_soc: f64) -> Result<(), HardwareError>;
    async fn stop_charging(&self) -> Result<(), HardwareError>;
    async fn live_state(&self) -> Result<LiveHardwareState, HardwareError>;
}

#[async_trait]
pub trait TelemetryReader: Send + Sync {
    async fn read_battery(&self) -> Result<BatteryState, CollaboratorError>;
    async fn read_consumption(&self) -> Result<ConsumptionEstimate, CollaboratorError>;
}

/// Reject commands no device should accept.
pub fn validate_charge_command(power: Power, target_soc: f64) -> Result<(), HardwareError> {
    if !power.as_watts().is_finite() || power.as_watts() <= 0.0 {
        return Err(HardwareError::InvalidCommand(format!(
            "charge power must be positive, got {power}"
        )));
    }
    if !(0.0..=100.0).contains(&target_soc) {
        return Err(HardwareError::InvalidCommand(format!(
            "target SOC {target_soc}% outside 0-100%"
        )));
    }
    Ok(())
}
