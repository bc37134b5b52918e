use axum::extract::{Path, Query, State};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    api::{error::ApiError, response::ApiResponse},
    controller::AppState,
    domain::{ChargingSession, SessionId, SessionState},
};

#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    pub state: Option<SessionState>,
}

/// GET /sessions - every known session, optionally filtered by `?state=`
pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> ApiResponse<Vec<ChargingSession>> {
    let sessions: Vec<_> = state
        .scheduler
        .sessions()
        .into_iter()
        .filter(|s| query.state.map_or(true, |wanted| s.state == wanted))
        .collect();
    let count = sessions.len();
    ApiResponse::success(sessions).with_count(count)
}

/// GET /sessions/:id
pub async fn get_session(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<ApiResponse<ChargingSession>, ApiError> {
    let id = Uuid::parse_str(&raw)
        .map_err(|e| ApiError::BadRequest(format!("invalid session id {raw:?}: {e}")))?;
    state
        .scheduler
        .get(SessionId::from_uuid(id))
        .map(ApiResponse::success)
        .ok_or_else(|| ApiError::NotFound(format!("session {id}")))
}
