use anyhow::Result;
use grid_charge_controller::{api, config::Config, controller, telemetry};
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let cfg = Config::load()?;
    let app_state = controller::AppState::new(cfg.clone()).await?;
    let app = api::router(app_state.clone(), &cfg);

    let addr = cfg.server.socket_addr()?;
    if cfg.server.host == "0.0.0.0" {
        warn!("Server binding to 0.0.0.0 - status API will be reachable from the network");
    }
    info!(%addr, tick_seconds = cfg.controller.tick_seconds, "starting grid charge controller");

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let controller_task = controller::spawn_controller_tasks(app_state, async move {
        let _ = stop_rx.changed().await;
    });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await?;

    let _ = stop_tx.send(true);
    if let Err(e) = controller_task.await {
        warn!(error = %e, "controller task ended abnormally");
    }

    warn!("shutdown complete");
    Ok(())
}
