pub mod error;
pub mod health;
pub mod response;
pub mod sessions;
pub mod status;

use axum::{routing::get, Router};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::{config::Config, controller::AppState};

pub fn router(state: AppState, cfg: &Config) -> Router {
    let v1 = Router::new()
        .route("/health", get(health::health_check))
        .route("/status", get(status::get_status))
        .route("/sessions", get(sessions::list_sessions))
        .route("/sessions/:id", get(sessions::get_session))
        .with_state(state);

    Router::new()
        .nest("/api/v1", v1)
        .layer(
            ServiceBuilder::new()
                .layer(TimeoutLayer::new(Duration::from_secs(cfg.server.request_timeout_secs))),
        )
        .layer(TraceLayer::new_for_http())
}

#[cfg(all(test, feature = "sim"))]
pub(crate) async fn test_state() -> AppState {
    use crate::controller::simulated_collaborators;
    use crate::repo::MemoryStore;
    use std::sync::Arc;

    let cfg = Config::default();
    let deps = simulated_collaborators(&cfg, Arc::new(MemoryStore::new()));
    AppState::with_collaborators(cfg, deps).await.unwrap()
}
