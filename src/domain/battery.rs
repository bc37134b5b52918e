use serde::{Deserialize, Serialize};

use super::Energy;

/// Battery telemetry snapshot, read once per tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryState {
    pub soc_percent: f64,
    pub voltage_v: f64,
    pub temperature_c: f64,
    pub capacity_kwh: f64,
}

impl BatteryState {
    /// Energy required to lift the pack from its current SOC to `target_soc`.
    pub fn energy_to(&self, target_soc: f64) -> Energy {
        let delta = (target_soc.clamp(0.0, 100.0) - self.soc_percent).max(0.0);
        Energy::from_soc_delta(delta, self.capacity_kwh)
    }

    pub fn is_full(&self) -> bool {
        self.soc_percent >= 100.0
    }
}
