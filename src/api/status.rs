use axum::extract::State;

use crate::{
    api::response::ApiResponse,
    controller::{AppState, CoordinatorSnapshot},
};

/// GET /status - latest coordinator snapshot
pub async fn get_status(State(state): State<AppState>) -> ApiResponse<CoordinatorSnapshot> {
    let snapshot = state.snapshots.latest();
    let tick = snapshot.tick_count;
    ApiResponse::success(CoordinatorSnapshot::clone(&snapshot)).with_tick(tick)
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use super::*;
    use crate::api::test_state;

    #[tokio::test]
    async fn test_status_reflects_published_snapshot() {
        let state = test_state().await;
        let mut snapshot = CoordinatorSnapshot::initial(chrono::Utc::now());
        snapshot.tick_count = 4;
        snapshot.degraded = true;
        state.snapshots.publish(snapshot);

        let response = get_status(State(state)).await;
        assert!(response.success);
        let data = response.data.unwrap();
        assert_eq!(data.tick_count, 4);
        assert!(data.degraded);
        assert_eq!(response.metadata.unwrap().tick, Some(4));
    }
}
