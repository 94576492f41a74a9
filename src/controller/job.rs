//! Background job: once per `job.interval_minutes`, process the previous
//! UTC day for every site, then retry anchors that failed earlier.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, NaiveDate, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::pipeline::DigestPipeline;
use crate::config::JobConfig;

/// Retried per tick, oldest first.
const PENDING_ANCHOR_LIMIT: usize = 32;

/// The last complete UTC day before `now`.
pub fn previous_utc_day(now: DateTime<Utc>) -> NaiveDate {
    let today = now.date_naive();
    today.checked_sub_days(Days::new(1)).unwrap_or(today)
}

pub fn spawn_daily_job(
    pipeline: Arc<DigestPipeline>,
    job: JobConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(job.interval_minutes.max(1) * 60));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_minutes = job.interval_minutes, anchor = job.anchor, "daily digest job started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let day = previous_utc_day(Utc::now());
            let report = pipeline.run_day(day, job.anchor, &shutdown).await;
            if !report.is_clean() {
                warn!(%day, failed = report.failed.len(), "daily job finished with failures");
            }

            if job.anchor && !shutdown.is_cancelled() {
                match pipeline.anchor_pending(PENDING_ANCHOR_LIMIT, &shutdown).await {
                    Ok(pending) if !pending.is_empty() => {
                        info!(
                            retried = pending.reports.len(),
                            anchored = pending.anchored(),
                            failed = pending.failed.len(),
                            "pending anchors retried"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "pending anchor retry failed"),
                }
            }
        }
        info!("daily digest job stopped");
    })
}
