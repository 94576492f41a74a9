pub mod job;
pub mod pipeline;

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::anchor::{AnchorCoordinator, HttpAnchorClient};
use crate::config::Config;
use crate::repo::{open_store, TelemetryStore};

pub use job::{previous_utc_day, spawn_daily_job};
pub use pipeline::{
    BatchReport, DayFailure, DayOutcome, DigestPipeline, ExportPaths, GenerationSummary,
    PendingAnchorReport, SiteFailure,
};

/// Explicit application context handed to the API and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub pipeline: Arc<DigestPipeline>,
    pub shutdown: CancellationToken,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub async fn new(cfg: Config) -> Result<Self> {
        let store = open_store(&cfg).await?;

        let anchor = if cfg.anchor.enabled {
            let client = HttpAnchorClient::new(cfg.anchor.base_url.clone(), cfg.anchor.timeout())?
                .with_api_key(cfg.anchor.api_key.clone())
                .with_shared_secret(cfg.anchor.shared_secret.clone());
            info!(
                base_url = %client.base_url(),
                signed = cfg.anchor.shared_secret.is_some(),
                "anchoring enabled"
            );
            Some(
                AnchorCoordinator::new(Arc::new(client), cfg.anchor.retry_policy())
                    .with_uri_base(cfg.anchor.uri_base.clone()),
            )
        } else {
            None
        };

        Ok(Self::from_parts(cfg, store, anchor))
    }

    pub fn from_parts(
        cfg: Config,
        store: Arc<dyn TelemetryStore>,
        anchor: Option<AnchorCoordinator>,
    ) -> Self {
        let pipeline = DigestPipeline::new(cfg.sites.clone(), cfg.simulation_settings(), store)
            .with_anchor(anchor)
            .with_export_dir(Some(cfg.export.dir.clone()));
        Self {
            cfg: Arc::new(cfg),
            pipeline: Arc::new(pipeline),
            shutdown: CancellationToken::new(),
            started_at: Utc::now(),
        }
    }
}

/// Starts the daily job when enabled. It stops when `state.shutdown` is
/// cancelled.
pub fn spawn_controller_tasks(state: &AppState) -> Option<JoinHandle<()>> {
    if !state.cfg.job.enabled {
        return None;
    }
    Some(spawn_daily_job(
        state.pipeline.clone(),
        state.cfg.job.clone(),
        state.shutdown.clone(),
    ))
}
