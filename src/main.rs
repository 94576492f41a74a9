use anyhow::Result;
use solar_attest::{api, config::Config, controller, logging};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing();

    let cfg = Config::load()?;
    if cfg.sites.is_empty() {
        warn!("no sites configured; only health endpoints will be useful");
    }
    if cfg.anchor.enabled && cfg.anchor.shared_secret.is_none() {
        warn!("anchoring enabled without SOLAR__ANCHOR__SHARED_SECRET; requests will be unsigned");
    }

    let state = controller::AppState::new(cfg.clone()).await?;
    let app = api::router(state.clone());
    let job = controller::spawn_controller_tasks(&state);

    let addr = cfg.server.socket_addr()?;
    info!(%addr, sites = cfg.sites.len(), anchoring = cfg.anchor.enabled, "starting solar-attest");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(logging::shutdown_signal())
        .await?;

    state.shutdown.cancel();
    if let Some(job) = job {
        if let Err(e) = job.await {
            warn!(error = %e, "daily job ended abnormally");
        }
    }
    warn!("shutdown complete");
    Ok(())
}
