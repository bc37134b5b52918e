use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, EnumString};
use uuid::Uuid;

use super::{Cost, Energy, Price};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Planned,
    Active,
    Completed,
    Aborted,
    Blocked,
}

impl SessionState {
    /// Completed and Aborted never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    /// States that reserve their time window.
    pub fn reserves_window(&self) -> bool {
        matches!(self, Self::Planned | Self::Active)
    }
}

/// Half-open time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ChargeWindow {
    /// `None` unless `start < end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn overlaps(&self, other: &ChargeWindow) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }
}

impl fmt::Display for ChargeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}..{}",
            self.start.format("%Y-%m-%d %H:%M"),
            self.end.format("%H:%M")
        )
    }
}

/// Parameters for a new planned session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionPlan {
    pub window: ChargeWindow,
    pub target_soc: f64,
    pub required_energy: Energy,
    pub soc_at_start: f64,
    pub price_at_start: Option<Price>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargingSession {
    pub id: SessionId,
    pub state: SessionState,
    pub window: ChargeWindow,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub target_soc: f64,
    pub required_energy_kwh: Energy,
    pub price_at_start: Option<Price>,
    pub soc_at_start: f64,
    pub actual_energy_kwh: Option<Energy>,
    pub actual_cost: Option<Cost>,
    pub status_reason: Option<String>,
}

impl ChargingSession {
    pub fn planned(id: SessionId, plan: SessionPlan) -> Self {
        Self {
            id,
            state: SessionState::Planned,
            window: plan.window,
            start_time: plan.window.start,
            end_time: None,
            target_soc: plan.target_soc,
            required_energy_kwh: plan.required_energy,
            price_at_start: plan.price_at_start,
            soc_at_start: plan.soc_at_start,
            actual_energy_kwh: None,
            actual_cost: None,
            status_reason: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }
}
