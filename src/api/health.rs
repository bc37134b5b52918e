use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::controller::{AppState, CoordinatorSnapshot};

/// Ticks without progress before the loop counts as stalled.
const STALL_TICKS: i32 = 3;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    timestamp: DateTime<Utc>,
    checks: HealthChecks,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    control_loop: ComponentHealth,
    hardware: ComponentHealth,
    safety: ComponentHealth,
}

#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ComponentHealth {
    fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            error: None,
        }
    }

    fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            status: "unhealthy".to_string(),
            error: Some(error.into()),
        }
    }

    fn is_healthy(&self) -> bool {
        self.error.is_none()
    }
}

fn assess(snapshot: &CoordinatorSnapshot, tick: Duration, now: DateTime<Utc>) -> HealthChecks {
    let control_loop = match snapshot.last_tick_time {
        None => ComponentHealth::healthy(),
        Some(last) if now - last > tick * STALL_TICKS => {
            ComponentHealth::unhealthy(format!("no tick since {}", last.to_rfc3339()))
        }
        Some(_) => ComponentHealth::healthy(),
    };
    let hardware = if snapshot.degraded {
        ComponentHealth::unhealthy("degraded after repeated command failures")
    } else {
        ComponentHealth::healthy()
    };
    let safety = match &snapshot.safety_verdict.violation_reason {
        Some(reason) if !snapshot.safety_verdict.ok => ComponentHealth::unhealthy(reason.clone()),
        _ => ComponentHealth::healthy(),
    };
    HealthChecks {
        control_loop,
        hardware,
        safety,
    }
}

/// GET /health
///
/// 503 when the control loop stalled or hardware is degraded. A safety lockout is
/// reported but keeps the service healthy, since blocking starts is the intended
/// reaction.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let now = Utc::now();
    let tick = Duration::seconds(state.cfg.controller.tick_seconds as i64);
    let checks = assess(&state.snapshots.latest(), tick, now);

    let healthy = checks.control_loop.is_healthy() && checks.hardware.is_healthy();
    let (status, label) = if healthy {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };

    (
        status,
        Json(HealthResponse {
            status: label.to_string(),
            timestamp: now,
            checks,
        }),
    )
}
