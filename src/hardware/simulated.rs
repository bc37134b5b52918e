use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{
    validate_charge_command, HardwareAdapter, HardwareError, LiveHardwareState, TelemetryReader,
};
use crate::config::BatteryConfig;
use crate::domain::{BatteryState, ConsumptionEstimate, Power};
use crate::forecast::CollaboratorError;

const CHARGE_EFFICIENCY: f64 = 0.95;
const TEMP_RISE_PER_KW: f64 = 2.0;
const NOMINAL_MIN_VOLTAGE: f64 = 48.0;
const NOMINAL_VOLTAGE_SPAN: f64 = 8.0;
/// Weight of the newest sample in the consumption baseline.
const LOAD_SMOOTHING: f64 = 0.1;

#[derive(Debug)]
struct SimState {
    soc_percent: f64,
    temperature_c: f64,
    charging: Option<(Power, f64)>,
    load_w: f64,
    load_avg_w: f64,
    last_update: Instant,
    temperature_override: Option<f64>,
    failures_pending: u32,
    telemetry_down: bool,
}

/// Battery + charger model for development and tests.
///
/// SOC integrates charge power over (tokio) wall time, so paused-clock tests
/// can drive it with `tokio::time::advance`.
#[derive(Debug)]
pub struct SimulatedHardware {
    capacity_kwh: f64,
    ambient_temp_c: f64,
    state: Mutex<SimState>,
}

impl SimulatedHardware {
    pub fn new(battery: &BatteryConfig, initial_soc: f64) -> Self {
        Self::with_ambient(battery, initial_soc, 20.0)
    }

    pub fn with_ambient(battery: &BatteryConfig, initial_soc: f64, ambient_temp_c: f64) -> Self {
        Self {
            capacity_kwh: battery.capacity_kwh.max(0.1),
            ambient_temp_c,
            state: Mutex::new(SimState {
                soc_percent: initial_soc.clamp(0.0, 100.0),
                temperature_c: ambient_temp_c,
                charging: None,
                load_w: 600.0,
                load_avg_w: 600.0,
                last_update: Instant::now(),
                temperature_override: None,
                failures_pending: 0,
                telemetry_down: false,
            }),
        }
    }

    /// Pin the reported temperature (fault injection). `None` restores the model.
    pub fn set_temperature_override(&self, temperature_c: Option<f64>) {
        self.state.lock().temperature_override = temperature_c;
    }

    /// The next `count` commands fail with a communication error.
    pub fn fail_next_commands(&self, count: u32) {
        self.state.lock().failures_pending = count;
    }

    pub fn set_telemetry_available(&self, available: bool) {
        self.state.lock().telemetry_down = !available;
    }

    pub fn set_household_load(&self, watts: f64) {
        self.state.lock().load_w = watts.max(0.0);
    }

    pub fn set_soc(&self, soc_percent: f64) {
        let mut st = self.state.lock();
        self.integrate(&mut st);
        st.soc_percent = soc_percent.clamp(0.0, 100.0);
    }

    pub fn is_charging(&self) -> bool {
        let mut st = self.state.lock();
        self.integrate(&mut st);
        st.charging.is_some()
    }

    fn integrate(&self, st: &mut SimState) {
        let now = Instant::now();
        let dt_h = now.duration_since(st.last_update).as_secs_f64() / 3600.0;
        st.last_update = now;

        let power_kw = match st.charging {
            Some((power, target)) => {
                let delta_pct = power.as_kilowatts() * dt_h * CHARGE_EFFICIENCY / self.capacity_kwh
                    * 100.0;
                st.soc_percent = (st.soc_percent + delta_pct)
                    .min(target.max(st.soc_percent))
                    .min(100.0);
                if st.soc_percent >= target {
                    debug!(soc_percent = st.soc_percent, "Simulated charger reached target");
                    st.charging = None;
                }
                power.as_kilowatts()
            }
            None => 0.0,
        };
        st.temperature_c = self.ambient_temp_c + power_kw * TEMP_RISE_PER_KW;
    }

    fn take_failure(st: &mut SimState) -> Result<(), HardwareError> {
        if st.failures_pending > 0 {
            st.failures_pending -= 1;
            return Err(HardwareError::Communication(
                "simulated communication failure".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl HardwareAdapter for SimulatedHardware {
    async fn start_charging(&self, power: Power, target_soc: f64) -> Result<(), HardwareError> {
        validate_charge_command(power, target_soc)?;
        let mut st = self.state.lock();
        Self::take_failure(&mut st)?;
        self.integrate(&mut st);
        st.charging = (st.soc_percent < target_soc).then_some((power, target_soc));
        Ok(())
    }

    async fn stop_charging(&self) -> Result<(), HardwareError> {
        let mut st = self.state.lock();
        Self::take_failure(&mut st)?;
        self.integrate(&mut st);
        st.charging = None;
        Ok(())
    }

    async fn live_state(&self) -> Result<LiveHardwareState, HardwareError> {
        let mut st = self.state.lock();
        self.integrate(&mut st);
        Ok(LiveHardwareState {
            charging: st.charging.is_some(),
            soc_percent: st.soc_percent,
            charge_power: st.charging.map(|(p, _)| p).unwrap_or_default(),
        })
    }
}

#[async_trait]
impl TelemetryReader for SimulatedHardware {
    async fn read_battery(&self) -> Result<BatteryState, CollaboratorError> {
        let mut st = self.state.lock();
        if st.telemetry_down {
            return Err(CollaboratorError::DataUnavailable(
                "simulated telemetry outage".to_string(),
            ));
        }
        self.integrate(&mut st);
        Ok(BatteryState {
            soc_percent: st.soc_percent,
            voltage_v: NOMINAL_MIN_VOLTAGE + NOMINAL_VOLTAGE_SPAN * st.soc_percent / 100.0,
            temperature_c: st.temperature_override.unwrap_or(st.temperature_c),
            capacity_kwh: self.capacity_kwh,
        })
    }

    async fn read_consumption(&self) -> Result<ConsumptionEstimate, CollaboratorError> {
        let mut st = self.state.lock();
        if st.telemetry_down {
            return Err(CollaboratorError::DataUnavailable(
                "simulated telemetry outage".to_string(),
            ));
        }
        st.load_avg_w = st.load_avg_w * (1.0 - LOAD_SMOOTHING) + st.load_w * LOAD_SMOOTHING;
        Ok(ConsumptionEstimate {
            current_w: st.load_w,
            recent_avg_w: st.load_avg_w,
        })
    }
}
