//! Charging session bookkeeping.
//!
//! The scheduler owns every [`ChargingSession`] the process knows about and is
//! the only place session state changes. All check-and-set operations happen
//! under a single write lock so dashboard readers never observe a half-applied
//! transition.

use chrono::{DateTime, Utc};
use itertools::Itertools;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::BatteryConfig;
use crate::domain::{
    ChargeWindow, ChargingSession, Cost, Energy, SessionId, SessionPlan, SessionState,
};
use crate::hardware::LiveHardwareState;

pub const RECONCILIATION_MISMATCH: &str = "stale session — reconciliation mismatch";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedulerError {
    #[error("window {window} overlaps session {existing}")]
    Overlap {
        window: ChargeWindow,
        existing: SessionId,
    },
    #[error("cannot activate session {id}: session {active} is already active")]
    Conflict { id: SessionId, active: SessionId },
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("session {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: SessionId,
        from: SessionState,
        to: SessionState,
    },
}

/// What startup reconciliation did with one persisted session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Resumed { id: SessionId },
    Aborted { id: SessionId, reason: String },
    Kept { id: SessionId, state: SessionState },
}

#[derive(Debug, Default)]
struct Inner {
    sessions: Vec<ChargingSession>,
}

impl Inner {
    fn find_mut(&mut self, id: SessionId) -> Result<&mut ChargingSession, SchedulerError> {
        self.sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(SchedulerError::UnknownSession(id))
    }

    fn active_id(&self) -> Option<SessionId> {
        self.sessions.iter().find(|s| s.is_active()).map(|s| s.id)
    }

    fn overlapping(&self, window: &ChargeWindow, except: Option<SessionId>) -> Option<SessionId> {
        self.sessions
            .iter()
            .filter(|s| Some(s.id) != except)
            .filter(|s| s.state.reserves_window())
            .find(|s| s.window.overlaps(window))
            .map(|s| s.id)
    }

    fn assert_single_active(&self) {
        let active = self.sessions.iter().filter(|s| s.is_active()).count();
        assert!(active <= 1, "scheduler holds {active} active sessions");
    }
}

pub struct SessionScheduler {
    inner: RwLock<Inner>,
}

impl Default for SessionScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionScheduler {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Reserve a window. Rejected when it intersects a planned or active session.
    pub fn plan(&self, plan: SessionPlan) -> Result<SessionId, SchedulerError> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.overlapping(&plan.window, None) {
            return Err(SchedulerError::Overlap {
                window: plan.window,
                existing,
            });
        }
        let id = SessionId::new();
        inner.sessions.push(ChargingSession::planned(id, plan));
        info!(session_id = %id, window = %plan.window, target_soc = plan.target_soc, "Session planned");
        Ok(id)
    }

    pub fn activate(&self, id: SessionId, at: DateTime<Utc>) -> Result<ChargingSession, SchedulerError> {
        let mut inner = self.inner.write();
        if let Some(active) = inner.active_id().filter(|a| *a != id) {
            return Err(SchedulerError::Conflict { id, active });
        }
        let session = inner.find_mut(id)?;
        transition(session, SessionState::Planned, SessionState::Active)?;
        session.start_time = at;
        let updated = session.clone();
        inner.assert_single_active();
        info!(session_id = %id, "Session activated");
        Ok(updated)
    }

    pub fn complete(
        &self,
        id: SessionId,
        actual_energy: Energy,
        actual_cost: Cost,
        at: DateTime<Utc>,
    ) -> Result<ChargingSession, SchedulerError> {
        let mut inner = self.inner.write();
        let session = inner.find_mut(id)?;
        transition(session, SessionState::Active, SessionState::Completed)?;
        session.end_time = Some(at);
        session.actual_energy_kwh = Some(actual_energy);
        session.actual_cost = Some(actual_cost);
        info!(
            session_id = %id,
            energy = %actual_energy,
            cost = %actual_cost,
            "Session completed"
        );
        Ok(session.clone())
    }

    /// Abort from any non-terminal state. Terminal sessions are returned unchanged.
    pub fn abort(
        &self,
        id: SessionId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<ChargingSession, SchedulerError> {
        let mut inner = self.inner.write();
        let session = inner.find_mut(id)?;
        if session.state.is_terminal() {
            return Ok(session.clone());
        }
        session.state = SessionState::Aborted;
        session.end_time = Some(at);
        session.status_reason = Some(reason.to_string());
        warn!(session_id = %id, reason, "Session aborted");
        Ok(session.clone())
    }

    /// Raise the target of the running session. Only an active session can be retargeted.
    pub fn retarget(
        &self,
        id: SessionId,
        target_soc: f64,
        required_energy: Energy,
    ) -> Result<ChargingSession, SchedulerError> {
        let mut inner = self.inner.write();
        let session = inner.find_mut(id)?;
        if session.state != SessionState::Active {
            return Err(SchedulerError::InvalidTransition {
                id,
                from: session.state,
                to: SessionState::Active,
            });
        }
        let previous = session.target_soc;
        session.target_soc = target_soc;
        session.required_energy_kwh = required_energy;
        info!(session_id = %id, from = previous, target_soc, "Session retargeted");
        Ok(session.clone())
    }

    pub fn block(&self, id: SessionId, reason: &str) -> Result<ChargingSession, SchedulerError> {
        let mut inner = self.inner.write();
        let session = inner.find_mut(id)?;
        transition(session, SessionState::Planned, SessionState::Blocked)?;
        session.status_reason = Some(reason.to_string());
        info!(session_id = %id, reason, "Session blocked");
        Ok(session.clone())
    }

    /// Move a blocked session back to planned in a new window.
    pub fn replan(
        &self,
        id: SessionId,
        window: ChargeWindow,
    ) -> Result<ChargingSession, SchedulerError> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.overlapping(&window, Some(id)) {
            return Err(SchedulerError::Overlap { window, existing });
        }
        let session = inner.find_mut(id)?;
        transition(session, SessionState::Blocked, SessionState::Planned)?;
        session.window = window;
        session.start_time = window.start;
        session.status_reason = None;
        Ok(session.clone())
    }

    /// Adopt persisted sessions and settle any that disagree with the hardware.
    ///
    /// A persisted `Active` session survives only when the hardware still
    /// charges and live SOC lies on the trajectory expected since its start.
    /// The outcome depends only on the arguments, so repeated calls with the
    /// same inputs leave identical state behind.
    pub fn reconcile_on_startup(
        &self,
        persisted: Vec<ChargingSession>,
        live: &LiveHardwareState,
        now: DateTime<Utc>,
        battery: &BatteryConfig,
    ) -> Vec<ReconcileOutcome> {
        // A repeated id keeps the copy persisted last.
        let mut sessions: Vec<ChargingSession> =
            persisted.into_iter().rev().unique_by(|s| s.id).collect();
        sessions.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));

        // Latest consistent active session wins; any earlier one is stale.
        let keeper = sessions
            .iter()
            .rev()
            .find(|s| s.is_active() && trajectory_matches(s, live, now, battery))
            .map(|s| s.id);

        let mut outcomes = Vec::with_capacity(sessions.len());
        for session in sessions.iter_mut() {
            let outcome = match session.state {
                SessionState::Active if Some(session.id) == keeper => {
                    info!(session_id = %session.id, "Resuming persisted active session");
                    ReconcileOutcome::Resumed { id: session.id }
                }
                SessionState::Active => {
                    warn!(
                        session_id = %session.id,
                        live_soc = live.soc_percent,
                        live_charging = live.charging,
                        "Persisted active session disagrees with hardware"
                    );
                    settle(session, RECONCILIATION_MISMATCH, now)
                }
                SessionState::Planned if session.window.end <= now => {
                    settle(session, "planned window expired before restart", now)
                }
                state => ReconcileOutcome::Kept {
                    id: session.id,
                    state,
                },
            };
            outcomes.push(outcome);
        }

        let mut inner = self.inner.write();
        inner.sessions = sessions;
        inner.assert_single_active();
        outcomes
    }

    pub fn active(&self) -> Option<ChargingSession> {
        self.inner.read().sessions.iter().find(|s| s.is_active()).cloned()
    }

    pub fn get(&self, id: SessionId) -> Option<ChargingSession> {
        self.inner.read().sessions.iter().find(|s| s.id == id).cloned()
    }

    /// All known sessions, oldest first.
    pub fn sessions(&self) -> Vec<ChargingSession> {
        self.inner.read().sessions.clone()
    }
}

fn transition(
    session: &mut ChargingSession,
    from: SessionState,
    to: SessionState,
) -> Result<(), SchedulerError> {
    if session.state != from {
        return Err(SchedulerError::InvalidTransition {
            id: session.id,
            from: session.state,
            to,
        });
    }
    session.state = to;
    Ok(())
}

fn settle(session: &mut ChargingSession, reason: &str, now: DateTime<Utc>) -> ReconcileOutcome {
    session.state = SessionState::Aborted;
    session.end_time = Some(now);
    session.status_reason = Some(reason.to_string());
    ReconcileOutcome::Aborted {
        id: session.id,
        reason: reason.to_string(),
    }
}

/// Live SOC must sit between the SOC at start and the most the charger could
/// have added since, widened by the configured tolerance.
fn trajectory_matches(
    session: &ChargingSession,
    live: &LiveHardwareState,
    now: DateTime<Utc>,
    battery: &BatteryConfig,
) -> bool {
    if !live.charging || !live.soc_percent.is_finite() {
        return false;
    }
    let tolerance = battery.reconciliation_tolerance_percent;
    let elapsed_h = ((now - session.start_time).num_seconds().max(0)) as f64 / 3600.0;
    let rate_percent_per_h = battery.max_charge_kw / battery.capacity_kwh * 100.0;
    let ceiling = (session.soc_at_start + rate_percent_per_h * elapsed_h).min(session.target_soc);
    let floor = session.soc_at_start - tolerance;
    live.soc_percent >= floor && live.soc_percent <= ceiling + tolerance
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Power, Price};
    use chrono::{Duration, TimeZone};

    fn at(h: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap() + Duration::hours(h)
    }

    fn plan(start: i64, end: i64) -> SessionPlan {
        SessionPlan {
            window: ChargeWindow::new(at(start), at(end)).unwrap(),
            target_soc: 90.0,
            required_energy: Energy::kilowatt_hours(4.0),
            soc_at_start: 50.0,
            price_at_start: Some(Price::per_kwh(0.8)),
        }
    }

    fn live(charging: bool, soc: f64) -> LiveHardwareState {
        LiveHardwareState {
            charging,
            soc_percent: soc,
            charge_power: if charging { Power::kilowatts(3.0) } else { Power::watts(0.0) },
        }
    }

    #[test]
    fn test_plan_rejects_overlap() {
        let s = SessionScheduler::new();
        let first = s.plan(plan(1, 3)).unwrap();
        let err = s.plan(plan(2, 4)).unwrap_err();
        assert!(matches!(err, SchedulerError::Overlap { existing, .. } if existing == first));
        // Adjacent windows are fine
        assert!(s.plan(plan(3, 4)).is_ok());
    }

    #[test]
    fn test_terminal_sessions_free_their_window() {
        let s = SessionScheduler::new();
        let id = s.plan(plan(1, 3)).unwrap();
        s.abort(id, "operator", at(1)).unwrap();
        assert!(s.plan(plan(1, 3)).is_ok());
    }

    #[test]
    fn test_lifecycle_planned_active_completed() {
        let s = SessionScheduler::new();
        let id = s.plan(plan(1, 3)).unwrap();
        let active = s.activate(id, at(1)).unwrap();
        assert_eq!(active.state, SessionState::Active);
        assert_eq!(s.active().map(|a| a.id), Some(id));

        let done = s
            .complete(id, Energy::kilowatt_hours(3.5), Cost::new(2.8), at(2))
            .unwrap();
        assert_eq!(done.state, SessionState::Completed);
        assert_eq!(done.end_time, Some(at(2)));
        assert!(s.active().is_none());
    }

    #[test]
    fn test_second_activation_conflicts() {
        let s = SessionScheduler::new();
        let a = s.plan(plan(1, 2)).unwrap();
        let b = s.plan(plan(2, 3)).unwrap();
        s.activate(a, at(1)).unwrap();
        assert_eq!(
            s.activate(b, at(2)).unwrap_err(),
            SchedulerError::Conflict { id: b, active: a }
        );
    }

    #[test]
    fn test_invalid_transitions() {
        let s = SessionScheduler::new();
        let id = s.plan(plan(1, 2)).unwrap();
        assert!(matches!(
            s.complete(id, Energy::default(), Cost::default(), at(2)),
            Err(SchedulerError::InvalidTransition { .. })
        ));
        s.activate(id, at(1)).unwrap();
        assert!(matches!(
            s.block(id, "late"),
            Err(SchedulerError::InvalidTransition { .. })
        ));
        assert!(matches!(
            s.activate(SessionId::new(), at(1)),
            Err(SchedulerError::UnknownSession(_))
        ));
    }

    #[test]
    fn test_abort_is_idempotent_on_terminal_sessions() {
        let s = SessionScheduler::new();
        let id = s.plan(plan(1, 2)).unwrap();
        let first = s.abort(id, "safety", at(1)).unwrap();
        let second = s.abort(id, "again", at(2)).unwrap();
        assert_eq!(first, second);
        assert_eq!(second.status_reason.as_deref(), Some("safety"));
    }

    #[test]
    fn test_block_and_replan() {
        let s = SessionScheduler::new();
        let id = s.plan(plan(1, 2)).unwrap();
        s.block(id, "already at target").unwrap();
        let other = s.plan(plan(1, 2)).unwrap();

        let window = ChargeWindow::new(at(1), at(2)).unwrap();
        assert!(matches!(s.replan(id, window), Err(SchedulerError::Overlap { existing, .. }) if existing == other));

        let later = ChargeWindow::new(at(5), at(6)).unwrap();
        let replanned = s.replan(id, later).unwrap();
        assert_eq!(replanned.state, SessionState::Planned);
        assert_eq!(replanned.status_reason, None);
    }

    fn persisted_active(start_h: i64, soc_at_start: f64) -> ChargingSession {
        let mut session = ChargingSession::planned(SessionId::new(), plan(start_h, start_h + 3));
        session.soc_at_start = soc_at_start;
        session.state = SessionState::Active;
        session
    }

    #[test]
    fn test_reconcile_resumes_consistent_session() {
        let s = SessionScheduler::new();
        let session = persisted_active(0, 50.0);
        // 1h at 3 kW into 10 kWh adds at most 30 points
        let outcomes = s.reconcile_on_startup(
            vec![session.clone()],
            &live(true, 70.0),
            at(1),
            &BatteryConfig::default(),
        );
        assert_eq!(outcomes, vec![ReconcileOutcome::Resumed { id: session.id }]);
        assert!(s.active().is_some());
    }

    #[test]
    fn test_reconcile_aborts_when_hardware_idle() {
        let s = SessionScheduler::new();
        let session = persisted_active(0, 50.0);
        let outcomes = s.reconcile_on_startup(
            vec![session.clone()],
            &live(false, 60.0),
            at(1),
            &BatteryConfig::default(),
        );
        assert_eq!(
            outcomes,
            vec![ReconcileOutcome::Aborted {
                id: session.id,
                reason: RECONCILIATION_MISMATCH.to_string()
            }]
        );
        assert!(s.active().is_none());
    }

    #[test]
    fn test_reconcile_aborts_when_soc_off_trajectory() {
        let s = SessionScheduler::new();
        let session = persisted_active(0, 50.0);
        // Above the 30-point ceiling plus 5 points tolerance
        let outcomes = s.reconcile_on_startup(
            vec![session],
            &live(true, 89.0),
            at(1),
            &BatteryConfig::default(),
        );
        assert!(matches!(outcomes[0], ReconcileOutcome::Aborted { .. }));
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let session = persisted_active(0, 50.0);
        let s = SessionScheduler::new();
        let hw = live(false, 50.0);
        let cfg = BatteryConfig::default();

        let first = s.reconcile_on_startup(vec![session.clone()], &hw, at(2), &cfg);
        let after_first = s.sessions();
        let second = s.reconcile_on_startup(vec![session], &hw, at(2), &cfg);
        assert_eq!(first, second);
        assert_eq!(after_first, s.sessions());

        // Feeding back the reconciled state changes nothing either
        let third = s.reconcile_on_startup(after_first.clone(), &hw, at(2), &cfg);
        assert_eq!(s.sessions(), after_first);
        assert!(matches!(third[0], ReconcileOutcome::Kept { state: SessionState::Aborted, .. }));
    }

    #[test]
    fn test_reconcile_keeps_only_one_active() {
        let s = SessionScheduler::new();
        let older = persisted_active(0, 50.0);
        let newer = persisted_active(1, 50.0);
        let outcomes = s.reconcile_on_startup(
            vec![older.clone(), newer.clone()],
            &live(true, 60.0),
            at(2),
            &BatteryConfig::default(),
        );
        assert!(outcomes.contains(&ReconcileOutcome::Resumed { id: newer.id }));
        assert!(matches!(
            outcomes.iter().find(|o| matches!(o, ReconcileOutcome::Aborted { id, .. } if *id == older.id)),
            Some(_)
        ));
    }

    #[test]
    fn test_reconcile_keeps_last_copy_of_repeated_id() {
        let s = SessionScheduler::new();
        let stale = persisted_active(0, 50.0);
        let mut finished = stale.clone();
        finished.start_time = at(1);
        finished.state = SessionState::Completed;
        finished.end_time = Some(at(2));

        let outcomes = s.reconcile_on_startup(
            vec![stale.clone(), finished.clone()],
            &live(false, 80.0),
            at(3),
            &BatteryConfig::default(),
        );
        assert_eq!(
            outcomes,
            vec![ReconcileOutcome::Kept {
                id: stale.id,
                state: SessionState::Completed,
            }]
        );
        assert_eq!(s.sessions(), vec![finished]);
    }

    #[test]
    fn test_retarget_only_active_session() {
        let s = SessionScheduler::new();
        let id = s.plan(plan(0, 2)).unwrap();
        assert!(matches!(
            s.retarget(id, 100.0, Energy::kilowatt_hours(5.0)),
            Err(SchedulerError::InvalidTransition { from: SessionState::Planned, .. })
        ));

        s.activate(id, at(0)).unwrap();
        let session = s.retarget(id, 100.0, Energy::kilowatt_hours(5.0)).unwrap();
        assert_eq!(session.target_soc, 100.0);
        assert_eq!(session.required_energy_kwh, Energy::kilowatt_hours(5.0));
        assert_eq!(s.active().unwrap(), session);
    }
}
