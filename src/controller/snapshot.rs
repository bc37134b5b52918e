use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

use super::safety::{SafetyEvent, SafetyVerdict};
use crate::domain::{ChargingSession, Cost, Decision, Energy};

/// Read-only view of the coordinator after its latest tick.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorSnapshot {
    pub latest_decision: Option<Decision>,
    pub active_session: Option<ChargingSession>,
    pub safety_verdict: SafetyVerdict,
    pub recent_safety_events: Vec<(DateTime<Utc>, SafetyEvent)>,
    pub last_tick_time: Option<DateTime<Utc>>,
    pub degraded: bool,
    pub tick_count: u64,
    pub skipped_ticks: u64,
    /// Energy and cost accumulated by the active session so far
    pub session_energy: Energy,
    pub session_cost: Cost,
}

impl CoordinatorSnapshot {
    pub fn initial(now: DateTime<Utc>) -> Self {
        Self {
            latest_decision: None,
            active_session: None,
            safety_verdict: SafetyVerdict::initial(now),
            recent_safety_events: Vec::new(),
            last_tick_time: None,
            degraded: false,
            tick_count: 0,
            skipped_ticks: 0,
            session_energy: Energy::default(),
            session_cost: Cost::default(),
        }
    }
}

/// Single-writer, many-reader handle to the latest snapshot.
///
/// Readers clone an `Arc` under a short read lock; the coordinator swaps in a
/// fresh snapshot once per tick.
#[derive(Debug, Clone)]
pub struct SnapshotPublisher {
    current: Arc<RwLock<Arc<CoordinatorSnapshot>>>,
}

impl SnapshotPublisher {
    pub fn new(initial: CoordinatorSnapshot) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(initial))),
        }
    }

    pub fn publish(&self, snapshot: CoordinatorSnapshot) {
        *self.current.write() = Arc::new(snapshot);
    }

    pub fn latest(&self) -> Arc<CoordinatorSnapshot> {
        Arc::clone(&self.current.read())
    }
}
