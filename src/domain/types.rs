use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Mul, Sub};

// ============================================================================
// Physical Unit Newtypes
// ============================================================================

/// Power in Watts (W)
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, PartialOrd)]
pub struct Power(f64);

impl Power {
    pub fn watts(w: f64) -> Self {
        Self(w)
    }

    pub fn kilowatts(kw: f64) -> Self {
        Self(kw * 1000.0)
    }

    pub fn as_watts(&self) -> f64 {
        self.0
    }

    pub fn as_kilowatts(&self) -> f64 {
        self.0 / 1000.0
    }
}

impl fmt::Display for Power {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.abs() >= 1000.0 {
            write!(f, "{:.2} kW", self.as_kilowatts())
        } else {
            write!(f, "{:.1} W", self.0)
        }
    }
}

/// Energy in kilowatt-hours (kWh)
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, PartialOrd)]
pub struct Energy(f64);

impl Energy {
    pub fn kilowatt_hours(kwh: f64) -> Self {
        Self(kwh)
    }

    pub fn watt_hours(wh: f64) -> Self {
        Self(wh / 1000.0)
    }

    /// Energy corresponding to a SOC delta on a pack of the given capacity.
    pub fn from_soc_delta(delta_percent: f64, capacity_kwh: f64) -> Self {
        Self(delta_percent / 100.0 * capacity_kwh)
    }

    pub fn as_kilowatt_hours(&self) -> f64 {
        self.0
    }

    pub fn as_watt_hours(&self) -> f64 {
        self.0 * 1000.0
    }

    /// Hours needed to move this much energy at `power`. `None` for non-positive power.
    pub fn hours_at(&self, power: Power) -> Option<f64> {
        let kw = power.as_kilowatts();
        (kw > 0.0).then(|| self.0 / kw)
    }
}

impl fmt::Display for Energy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.abs() >= 1.0 {
            write!(f, "{:.2} kWh", self.0)
        } else {
            write!(f, "{:.0} Wh", self.as_watt_hours())
        }
    }
}

impl Add for Energy {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for Energy {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Energy {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

// ============================================================================
// Money
// ============================================================================

/// Energy price, stored per kilowatt-hour.
///
/// The inner value is private: a price can only be built from an explicitly
/// named unit and read back the same way, so a per-MWh market quote can never
/// be mistaken for a per-kWh tariff (or divided by 1000 twice).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, PartialOrd)]
#[serde(transparent)]
pub struct Price(f64);

impl Price {
    pub fn per_kwh(value: f64) -> Self {
        Self(value)
    }

    pub fn per_mwh(value: f64) -> Self {
        Self(value / 1000.0)
    }

    pub fn as_per_kwh(&self) -> f64 {
        self.0
    }

    pub fn as_per_mwh(&self) -> f64 {
        self.0 * 1000.0
    }

    pub fn is_finite(&self) -> bool {
        self.0.is_finite()
    }

    /// Arithmetic mean of a set of prices, `None` when empty.
    pub fn mean<I: IntoIterator<Item = Price>>(prices: I) -> Option<Price> {
        let (sum, n) = prices
            .into_iter()
            .fold((0.0, 0usize), |(s, n), p| (s + p.0, n + 1));
        (n > 0).then(|| Price(sum / n as f64))
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}/kWh", self.0)
    }
}

impl Mul<Energy> for Price {
    type Output = Cost;
    fn mul(self, energy: Energy) -> Self::Output {
        Cost(self.0 * energy.as_kilowatt_hours())
    }
}

/// Amount of money in the tariff currency.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, PartialOrd)]
#[serde(transparent)]
pub struct Cost(f64);

impl Cost {
    pub fn new(amount: f64) -> Self {
        Self(amount)
    }

    pub fn amount(&self) -> f64 {
        self.0
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

impl Add for Cost {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for Cost {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
