pub mod retry;
pub mod safety;
pub mod scheduler;
pub mod snapshot;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::domain::{
    BatteryState, ChargeAction, ChargeWindow, ChargingSession, ConsumptionEstimate, Cost, Decision,
    DecisionInput, Energy, Price, PriceSample, PvForecast, SessionId, SessionPlan,
    TriggeringPolicy,
};
use crate::forecast::{with_timeout, CollaboratorError, PriceFeed, PvForecastService};
use crate::hardware::{HardwareAdapter, HardwareError, LiveHardwareState, TelemetryReader};
use crate::policy::decide;
use crate::repo::PersistenceStore;

pub use retry::RetryPolicy;
pub use safety::{SafetyEvent, SafetyMonitor, SafetyVerdict};
pub use scheduler::{ReconcileOutcome, SchedulerError, SessionScheduler, RECONCILIATION_MISMATCH};
pub use snapshot::{CoordinatorSnapshot, SnapshotPublisher};

/// Safety events carried in each published snapshot.
const SNAPSHOT_EVENT_COUNT: usize = 10;

/// Everything the coordinator talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub prices: Arc<dyn PriceFeed>,
    pub pv: Arc<dyn PvForecastService>,
    pub telemetry: Arc<dyn TelemetryReader>,
    pub hardware: Arc<dyn HardwareAdapter>,
    pub store: Arc<dyn PersistenceStore>,
}

#[derive(Clone)]
pub struct AppState {
    pub cfg: Config,
    pub scheduler: Arc<SessionScheduler>,
    pub snapshots: SnapshotPublisher,
    pub collaborators: Collaborators,
}

impl AppState {
    #[cfg(feature = "sim")]
    pub async fn new(cfg: Config) -> Result<Self> {
        let store = crate::repo::open_store(&cfg.persistence).await?;
        let collaborators = simulated_collaborators(&cfg, store);
        Self::with_collaborators(cfg, collaborators).await
    }

    #[cfg(not(feature = "sim"))]
    pub async fn new(_cfg: Config) -> Result<Self> {
        anyhow::bail!("no hardware adapter available: build with the `sim` feature or supply collaborators")
    }

    /// Build state around explicit collaborators and reconcile persisted sessions.
    pub async fn with_collaborators(cfg: Config, collaborators: Collaborators) -> Result<Self> {
        let scheduler = Arc::new(SessionScheduler::new());
        let outcomes = reconcile_sessions(&scheduler, &collaborators, &cfg, Utc::now()).await?;
        info!(sessions = outcomes.len(), "Startup reconciliation finished");

        Ok(Self {
            cfg,
            scheduler,
            snapshots: SnapshotPublisher::new(CoordinatorSnapshot::initial(Utc::now())),
            collaborators,
        })
    }

    pub fn coordinator(&self) -> Coordinator {
        Coordinator::new(
            self.cfg.clone(),
            self.collaborators.clone(),
            Arc::clone(&self.scheduler),
            self.snapshots.clone(),
        )
    }
}

/// Simulated battery, time-of-use tariff and clear-sky PV around `store`.
#[cfg(feature = "sim")]
pub fn simulated_collaborators(cfg: &Config, store: Arc<dyn PersistenceStore>) -> Collaborators {
    use crate::forecast::{DaylightPvForecast, TariffPriceFeed};
    use crate::hardware::SimulatedHardware;

    let hardware = Arc::new(SimulatedHardware::new(&cfg.battery, 50.0));
    let prices = TariffPriceFeed::time_of_use(Price::per_kwh(0.45), Price::per_kwh(1.80), 17, 21)
        .with_super_low_flag(cfg.policy.super_low_threshold());

    Collaborators {
        prices: Arc::new(prices),
        pv: Arc::new(DaylightPvForecast::default()),
        telemetry: hardware.clone(),
        hardware,
        store,
    }
}

/// Load persisted sessions into the scheduler, settling stale ones.
pub async fn reconcile_sessions(
    scheduler: &SessionScheduler,
    deps: &Collaborators,
    cfg: &Config,
    now: DateTime<Utc>,
) -> Result<Vec<ReconcileOutcome>> {
    let persisted = deps
        .store
        .load_sessions()
        .await
        .context("loading persisted sessions")?;
    if persisted.is_empty() {
        return Ok(Vec::new());
    }

    let live = match deps.hardware.live_state().await {
        Ok(live) => live,
        Err(e) => {
            warn!(error = %e, "Live hardware state unavailable, treating charger as idle");
            LiveHardwareState {
                charging: false,
                soc_percent: f64::NAN,
                charge_power: Default::default(),
            }
        }
    };

    let outcomes = scheduler.reconcile_on_startup(persisted, &live, now, &cfg.battery);
    for outcome in &outcomes {
        if let ReconcileOutcome::Aborted { id, reason } = outcome {
            warn!(session_id = %id, reason = %reason, "Persisted session aborted at startup");
            if let Some(session) = scheduler.get(*id) {
                deps.store
                    .save_session(&session)
                    .await
                    .context("persisting reconciled session")?;
            }
        }
    }

    let resumed = outcomes
        .iter()
        .any(|o| matches!(o, ReconcileOutcome::Resumed { .. }));
    if live.charging && !resumed {
        warn!("Charger is running without a valid session, stopping it");
        let policy = RetryPolicy::from_config(&cfg.hardware);
        let hw = Arc::clone(&deps.hardware);
        if let Err(e) = policy.run("stop_charging", || hw.stop_charging()).await {
            error!(error = %e, "Failed to stop orphaned charging at startup");
        }
    }
    Ok(outcomes)
}

pub fn spawn_controller_tasks<S>(state: AppState, shutdown: S) -> JoinHandle<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let coordinator = state.coordinator();
    tokio::spawn(async move {
        coordinator.run(shutdown).await;
    })
}

/// Downgrade a decision the current safety or hardware state does not allow.
pub fn gate(decision: Decision, verdict: &SafetyVerdict, degraded: bool) -> Decision {
    if !decision.is_start() {
        return decision;
    }
    if !verdict.ok {
        let why = verdict
            .violation_reason
            .clone()
            .unwrap_or_else(|| "safety check failed".to_string());
        return decision.overridden(
            ChargeAction::Wait,
            TriggeringPolicy::SafetyInterlock,
            format!("start blocked by safety interlock: {why}"),
        );
    }
    if degraded {
        return decision.overridden(
            ChargeAction::Wait,
            TriggeringPolicy::HardwareDegraded,
            "start blocked: hardware degraded after repeated command failures",
        );
    }
    decision
}

/// The control loop: gathers inputs, decides, applies and publishes once per tick.
pub struct Coordinator {
    cfg: Config,
    deps: Collaborators,
    scheduler: Arc<SessionScheduler>,
    snapshots: SnapshotPublisher,
    safety: SafetyMonitor,
    retry: RetryPolicy,
    verdict: SafetyVerdict,
    observed_prices: VecDeque<Price>,
    latest_decision: Option<Decision>,
    last_tick_time: Option<DateTime<Utc>>,
    degraded_ticks_left: u32,
    tick_count: u64,
    skipped_ticks: u64,
    last_soc: Option<f64>,
    last_price: Option<Price>,
    session_energy: Energy,
    session_cost: Cost,
}

impl Coordinator {
    pub fn new(
        cfg: Config,
        deps: Collaborators,
        scheduler: Arc<SessionScheduler>,
        snapshots: SnapshotPublisher,
    ) -> Self {
        Self {
            safety: SafetyMonitor::new(cfg.safety.clone()),
            retry: RetryPolicy::from_config(&cfg.hardware),
            verdict: SafetyVerdict::initial(Utc::now()),
            observed_prices: VecDeque::with_capacity(cfg.controller.reference_window),
            latest_decision: None,
            last_tick_time: None,
            degraded_ticks_left: 0,
            tick_count: 0,
            skipped_ticks: 0,
            last_soc: None,
            last_price: None,
            session_energy: Energy::default(),
            session_cost: Cost::default(),
            cfg,
            deps,
            scheduler,
            snapshots,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded_ticks_left > 0
    }

    /// Tick on the configured interval until `shutdown` resolves.
    ///
    /// A tick that overruns the interval causes the next tick to be skipped.
    pub async fn run<S>(mut self, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        let period = self.cfg.controller.tick_interval();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);
        info!(tick_seconds = period.as_secs(), "Coordinator started");

        let mut overran = false;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {}
            }

            if overran {
                overran = false;
                self.skipped_ticks += 1;
                warn!(skipped_ticks = self.skipped_ticks, "Previous tick overran the interval, skipping tick");
                self.publish();
                continue;
            }

            let started = Instant::now();
            self.tick(Utc::now()).await;
            let elapsed = started.elapsed();
            if elapsed > period {
                overran = true;
                warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    period_ms = period.as_millis() as u64,
                    "Tick overran the interval"
                );
            }
        }
        info!(ticks = self.tick_count, "Coordinator stopped");
    }

    /// One full control cycle evaluated at `now`. Returns the decision taken.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Decision {
        self.tick_count += 1;
        let degraded = self.degraded_ticks_left > 0;
        if degraded {
            self.degraded_ticks_left -= 1;
            if self.degraded_ticks_left == 0 {
                info!("Degraded cooldown elapsed, hardware commands resume next tick");
            }
        }

        let limit = self.cfg.controller.collaborator_timeout();
        let battery = with_timeout(limit, self.deps.telemetry.read_battery()).await;

        let decision = match battery {
            Ok(battery) => self.decide_and_apply(now, battery, degraded).await,
            Err(e) => self.telemetry_lost(now, e).await,
        };

        if let Err(e) = self.deps.store.save_decision(&decision).await {
            warn!(error = %e, "Failed to persist decision");
        }
        info!(
            tick = self.tick_count,
            action = %decision.action,
            policy = %decision.triggering_policy,
            confidence = decision.confidence,
            reason = %decision.reasons()[0],
            degraded = self.is_degraded(),
            "Control tick"
        );
        self.latest_decision = Some(decision.clone());
        self.last_tick_time = Some(now);
        self.publish();
        decision
    }

    async fn gather(&self) -> (ConsumptionEstimate, Option<PriceSample>, Vec<PriceSample>, PvForecast) {
        let limit = self.cfg.controller.collaborator_timeout();
        let horizon = self.cfg.controller.forecast_horizon();

        let consumption = with_timeout(limit, self.deps.telemetry.read_consumption())
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Consumption unavailable, using neutral estimate");
                ConsumptionEstimate {
                    current_w: 0.0,
                    recent_avg_w: 0.0,
                }
            });

        let (price, forecast) =
            with_timeout(limit, self.deps.prices.get_current_and_forecast(horizon))
                .await
                .unwrap_or_else(|e| {
                    warn!(error = %e, "Prices unavailable, falling back");
                    (None, Vec::new())
                });

        let pv = with_timeout(limit, self.deps.pv.get(horizon))
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "PV forecast unavailable, assuming no production");
                PvForecast::none()
            });

        (
            consumption,
            price.filter(|s| s.final_price.is_finite()),
            forecast,
            pv,
        )
    }

    async fn decide_and_apply(
        &mut self,
        now: DateTime<Utc>,
        battery: BatteryState,
        degraded: bool,
    ) -> Decision {
        let (consumption, price, forecast, pv) = self.gather().await;
        self.accumulate(&battery, price.map(|s| s.final_price));

        let verdict = self.safety.check_at(&battery, now);
        if verdict.is_violation() {
            self.safety_abort(now, &verdict).await;
        }
        self.verdict = verdict.clone();

        self.complete_if_target_reached(now, &battery).await;

        let active = self.scheduler.active();
        let input = DecisionInput {
            timestamp: now,
            price,
            price_forecast: forecast,
            reference_price: Price::mean(self.observed_prices.iter().copied()),
            battery,
            pv,
            consumption,
        };
        let mut decision = gate(
            decide(&input, active.as_ref(), &self.cfg.policy),
            &verdict,
            degraded,
        );

        let action = decision.action;
        match action {
            ChargeAction::Start => match active {
                None => self.start_session(now, &decision, &battery, price).await,
                Some(session) => {
                    decision = self.extend_session(now, decision, &session, &battery).await;
                }
            },
            ChargeAction::Stop => {
                if let Some(session) = active {
                    self.stop_session(now, session.id).await;
                }
            }
            _ => {}
        }

        self.observe(price.map(|s| s.final_price));
        decision
    }

    async fn telemetry_lost(&mut self, now: DateTime<Utc>, err: CollaboratorError) -> Decision {
        let had_active = self.scheduler.active().is_some();
        let verdict = self.safety.record_unavailable(&err.to_string(), now);
        self.safety_abort(now, &verdict).await;
        self.verdict = verdict;
        self.last_soc = None;

        let action = if had_active {
            ChargeAction::Stop
        } else {
            ChargeAction::None
        };
        Decision::new(
            now,
            action,
            TriggeringPolicy::TelemetryUnavailable,
            1.0,
            format!("battery telemetry unavailable: {err}"),
        )
    }

    /// Abort any active session and command the charger off.
    async fn safety_abort(&mut self, now: DateTime<Utc>, verdict: &SafetyVerdict) {
        let reason = format!(
            "safety violation: {}",
            verdict.violation_reason.as_deref().unwrap_or("unknown")
        );
        let had_active = match self.scheduler.active() {
            Some(session) => {
                self.abort_session(session.id, &reason, now).await;
                true
            }
            None => false,
        };
        if had_active || verdict.consecutive_violations == 1 {
            let _ = self.command_stop(now).await;
        }
    }

    async fn complete_if_target_reached(&mut self, now: DateTime<Utc>, battery: &BatteryState) {
        let Some(session) = self.scheduler.active() else {
            return;
        };
        if battery.soc_percent + f64::EPSILON < session.target_soc {
            return;
        }
        info!(
            session_id = %session.id,
            soc_percent = battery.soc_percent,
            target_soc = session.target_soc,
            "Target SOC reached"
        );
        self.stop_session(now, session.id).await;
    }

    async fn start_session(
        &mut self,
        now: DateTime<Utc>,
        decision: &Decision,
        battery: &BatteryState,
        price: Option<PriceSample>,
    ) {
        let target = decision.target_soc.unwrap_or(self.cfg.policy.default_target_soc);
        let power = self.cfg.battery.max_charge_power();
        let required = battery.energy_to(target);

        let min_len = chrono::Duration::from_std(self.cfg.controller.tick_interval())
            .unwrap_or_else(|_| chrono::Duration::minutes(15));
        let est_secs = required.hours_at(power).unwrap_or(0.0) * 3600.0;
        let length = chrono::Duration::seconds(est_secs.ceil() as i64).max(min_len);
        let Some(window) = ChargeWindow::new(now, now + length) else {
            return;
        };

        let plan = SessionPlan {
            window,
            target_soc: target,
            required_energy: required,
            soc_at_start: battery.soc_percent,
            price_at_start: price.map(|s| s.final_price),
        };
        let id = match self.scheduler.plan(plan) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Start rejected by scheduler");
                return;
            }
        };

        if required.as_kilowatt_hours() <= 0.0 {
            if let Ok(session) = self.scheduler.block(id, "battery already at target SOC") {
                self.persist_session(&session).await;
            }
            return;
        }

        match self.scheduler.activate(id, now) {
            Ok(session) => self.persist_session(&session).await,
            Err(e) => {
                warn!(error = %e, "Activation rejected");
                self.abort_session(id, &format!("activation rejected: {e}"), now)
                    .await;
                return;
            }
        }

        self.session_energy = Energy::default();
        self.session_cost = Cost::default();
        self.last_soc = Some(battery.soc_percent);

        let hw = Arc::clone(&self.deps.hardware);
        let result = self
            .retry
            .run("start_charging", || hw.start_charging(power, target))
            .await;
        match result {
            Ok(()) => info!(
                session_id = %id,
                power = %power,
                target_soc = target,
                required = %required,
                "Charging started"
            ),
            Err(e) => self.raise_fatal("start_charging", &e, now).await,
        }
    }

    /// A start while a session runs raises that session's target instead of
    /// opening a second one. Otherwise the decision becomes a continue.
    async fn extend_session(
        &mut self,
        now: DateTime<Utc>,
        decision: Decision,
        session: &ChargingSession,
        battery: &BatteryState,
    ) -> Decision {
        let policy = decision.triggering_policy;
        let target = decision.target_soc.unwrap_or(self.cfg.policy.default_target_soc);
        if target <= session.target_soc {
            return decision.overridden(
                ChargeAction::Continue,
                policy,
                format!(
                    "session {} already charging toward {:.1}%",
                    session.id, session.target_soc
                ),
            );
        }

        let extra = Energy::from_soc_delta(target - session.target_soc, battery.capacity_kwh);
        match self
            .scheduler
            .retarget(session.id, target, session.required_energy_kwh + extra)
        {
            Ok(updated) => self.persist_session(&updated).await,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "Retarget rejected");
                return decision.overridden(
                    ChargeAction::Continue,
                    policy,
                    format!("could not retarget session {}: {e}", session.id),
                );
            }
        }

        let power = self.cfg.battery.max_charge_power();
        let hw = Arc::clone(&self.deps.hardware);
        let result = self
            .retry
            .run("start_charging", || hw.start_charging(power, target))
            .await;
        match result {
            Ok(()) => info!(
                session_id = %session.id,
                from = session.target_soc,
                target_soc = target,
                "Charging target raised"
            ),
            Err(e) => self.raise_fatal("start_charging", &e, now).await,
        }
        decision
    }

    async fn stop_session(&mut self, now: DateTime<Utc>, id: SessionId) {
        if let Err(e) = self.command_stop(now).await {
            warn!(session_id = %id, error = %e, "Stop failed, session aborted instead of completed");
            return;
        }
        match self
            .scheduler
            .complete(id, self.session_energy, self.session_cost, now)
        {
            Ok(session) => self.persist_session(&session).await,
            Err(e) => warn!(session_id = %id, error = %e, "Could not complete session"),
        }
        self.reset_accounting();
    }

    async fn abort_session(&mut self, id: SessionId, reason: &str, now: DateTime<Utc>) {
        match self.scheduler.abort(id, reason, now) {
            Ok(session) => self.persist_session(&session).await,
            Err(e) => warn!(session_id = %id, error = %e, "Could not abort session"),
        }
        self.reset_accounting();
    }

    async fn command_stop(&mut self, now: DateTime<Utc>) -> Result<(), HardwareError> {
        let hw = Arc::clone(&self.deps.hardware);
        let result = self.retry.run("stop_charging", || hw.stop_charging()).await;
        if let Err(e) = &result {
            self.raise_fatal("stop_charging", e, now).await;
        }
        result
    }

    /// Retries are exhausted: alert, abort whatever was running, go degraded.
    async fn raise_fatal(&mut self, command: &str, err: &HardwareError, now: DateTime<Utc>) {
        error!(
            command,
            error = %err,
            cooldown_ticks = self.cfg.controller.degraded_cooldown_ticks,
            "FATAL: hardware command failed after retries, entering degraded mode"
        );
        self.degraded_ticks_left = self.cfg.controller.degraded_cooldown_ticks;
        if let Some(session) = self.scheduler.active() {
            let reason = format!("hardware command {command} failed: {err}");
            self.abort_session(session.id, &reason, now).await;
        }
    }

    async fn persist_session(&self, session: &ChargingSession) {
        if let Err(e) = self.deps.store.save_session(session).await {
            warn!(session_id = %session.id, error = %e, "Failed to persist session");
        }
    }

    /// Add the energy delivered since the previous reading to the active session.
    fn accumulate(&mut self, battery: &BatteryState, current_price: Option<Price>) {
        let soc = battery.soc_percent;
        if self.scheduler.active().is_some() {
            if let Some(prev) = self.last_soc.filter(|_| soc.is_finite()) {
                let delta = soc - prev;
                if delta > 0.0 {
                    let energy = Energy::from_soc_delta(delta, battery.capacity_kwh);
                    self.session_energy += energy;
                    if let Some(price) = self.last_price.or(current_price) {
                        self.session_cost += price * energy;
                    }
                }
            }
        }
        self.last_soc = soc.is_finite().then_some(soc);
    }

    fn observe(&mut self, price: Option<Price>) {
        self.last_price = price;
        if let Some(p) = price {
            self.observed_prices.push_back(p);
            while self.observed_prices.len() > self.cfg.controller.reference_window {
                self.observed_prices.pop_front();
            }
        }
    }

    fn reset_accounting(&mut self) {
        self.session_energy = Energy::default();
        self.session_cost = Cost::default();
    }

    fn publish(&self) {
        self.snapshots.publish(CoordinatorSnapshot {
            latest_decision: self.latest_decision.clone(),
            active_session: self.scheduler.active(),
            safety_verdict: self.verdict.clone(),
            recent_safety_events: self.safety.get_recent_events(SNAPSHOT_EVENT_COUNT),
            last_tick_time: self.last_tick_time,
            degraded: self.is_degraded(),
            tick_count: self.tick_count,
            skipped_ticks: self.skipped_ticks,
            session_energy: self.session_energy,
            session_cost: self.session_cost,
        });
    }
}
