//! # Digest pipeline
//!
//! generate -> aggregate -> digest -> export -> (anchor), per site-day.
//!
//! Each step reads its input back from the store, so any step can be re-run
//! on its own. Within one site-day everything is sequential; separate sites
//! run in parallel in [`DigestPipeline::run_day`]. Steps that write rows,
//! digests or receipts for a site-day hold that day's lock, so concurrent
//! callers (API, daily job) cannot interleave on the same day.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::anchor::{AnchorCoordinator, AnchorReport, AnchorServiceStatus};
use crate::digest::{
    merkle_root, records_to_csv, verify_records, AggregationEngine, DigestArtifact,
    MerkleDigestBuilder, VerificationReport,
};
use crate::domain::{DailyDigest, HourlySummary, SiteConfig, TelemetryRecord};
use crate::error::{DigestError, PipelineError};
use crate::repo::TelemetryStore;
use crate::simulation::{SimulationSettings, SiteSimulator};

type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationSummary {
    pub site_id: String,
    pub day: NaiveDate,
    pub rows: usize,
    pub energy_kwh: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportPaths {
    pub json: PathBuf,
    pub csv: PathBuf,
}

/// Result of [`DigestPipeline::process_day`] for one site.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayOutcome {
    pub site_id: String,
    pub day: NaiveDate,
    pub rows: usize,
    pub energy_kwh: f64,
    pub avoided_tco2e: f64,
    pub merkle_root: String,
    pub export: Option<ExportPaths>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor: Option<AnchorReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiteFailure {
    pub site_id: String,
    pub error: String,
}

/// Per-site results of a batch; one site's failure never hides another's.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub succeeded: Vec<DayOutcome>,
    pub failed: Vec<SiteFailure>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayFailure {
    pub site_id: String,
    pub day: NaiveDate,
    pub error: String,
}

/// Result of [`DigestPipeline::anchor_pending`]. A digest that errors is
/// listed in `failed` and the rest are still tried.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PendingAnchorReport {
    pub reports: Vec<AnchorReport>,
    pub failed: Vec<DayFailure>,
}

impl PendingAnchorReport {
    pub fn anchored(&self) -> usize {
        self.reports.iter().filter(|r| r.is_success()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty() && self.failed.is_empty()
    }
}

type DayKey = (String, NaiveDate);

pub struct DigestPipeline {
    sites: BTreeMap<String, SiteConfig>,
    settings: SimulationSettings,
    store: Arc<dyn TelemetryStore>,
    anchor: Option<AnchorCoordinator>,
    export_dir: Option<PathBuf>,
    day_locks: Mutex<HashMap<DayKey, Arc<AsyncMutex<()>>>>,
}

impl DigestPipeline {
    pub fn new(
        sites: Vec<SiteConfig>,
        settings: SimulationSettings,
        store: Arc<dyn TelemetryStore>,
    ) -> Self {
        Self {
            sites: sites.into_iter().map(|s| (s.id.clone(), s)).collect(),
            settings,
            store,
            anchor: None,
            export_dir: None,
            day_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_anchor(mut self, anchor: Option<AnchorCoordinator>) -> Self {
        self.anchor = anchor;
        self
    }

    pub fn with_export_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.export_dir = dir;
        self
    }

    pub fn store(&self) -> &Arc<dyn TelemetryStore> {
        &self.store
    }

    pub fn settings(&self) -> SimulationSettings {
        self.settings
    }

    pub fn sites(&self) -> impl Iterator<Item = &SiteConfig> {
        self.sites.values()
    }

    pub fn site(&self, site_id: &str) -> Result<&SiteConfig> {
        self.sites
            .get(site_id)
            .ok_or_else(|| PipelineError::UnknownSite(site_id.to_string()))
    }

    pub fn anchoring_enabled(&self) -> bool {
        self.anchor.is_some()
    }

    /// Exclusive access to one site-day. Idle entries are dropped on the way.
    async fn lock_day(&self, site_id: &str, day: NaiveDate) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.day_locks.lock();
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry((site_id.to_string(), day)).or_default())
        };
        lock.lock_owned().await
    }

    fn integrity_mismatch(site_id: &str, day: NaiveDate, stored: String, computed: String) -> PipelineError {
        error!(site_id, %day, %stored, %computed, "recomputed root differs from anchored root");
        PipelineError::IntegrityMismatch { stored, computed }
    }

    /// Fails when `records` would replace the rows behind an anchored root.
    async fn check_anchored_rows(
        &self,
        site_id: &str,
        day: NaiveDate,
        records: &[TelemetryRecord],
    ) -> Result<()> {
        let Some(existing) = self.store.digest(site_id, day).await? else {
            return Ok(());
        };
        if !existing.is_anchored() {
            return Ok(());
        }
        let hashes: Vec<&str> = records.iter().map(|r| r.row_hash.as_str()).collect();
        let computed = merkle_root(&hashes)?;
        if computed != existing.merkle_root {
            return Err(Self::integrity_mismatch(site_id, day, existing.merkle_root, computed));
        }
        Ok(())
    }

    /// Simulate and upsert one site-day. Safe to repeat: the same seed
    /// rewrites identical rows. Rows of an anchored day are only rewritten
    /// when they reproduce the anchored root; otherwise this is an
    /// [`PipelineError::IntegrityMismatch`] and nothing is written.
    pub async fn generate_day(&self, site_id: &str, day: NaiveDate) -> Result<GenerationSummary> {
        let site = self.site(site_id)?.clone();
        let records = SiteSimulator::new(site, self.settings).generate_day(day);
        let _guard = self.lock_day(site_id, day).await;
        self.check_anchored_rows(site_id, day, &records).await?;
        let rows = self.store.upsert_records(&records).await?;
        let energy_kwh = AggregationEngine::daily_totals(&records, 0.0).energy_kwh;
        info!(site_id, %day, rows, energy_kwh, "telemetry generated");
        Ok(GenerationSummary {
            site_id: site_id.to_string(),
            day,
            rows,
            energy_kwh,
        })
    }

    /// Recompute and upsert the hourly rollups of one site-day.
    pub async fn aggregate_day(&self, site_id: &str, day: NaiveDate) -> Result<Vec<HourlySummary>> {
        self.site(site_id)?;
        let records = self.store.records_for_day(site_id, day).await?;
        if records.is_empty() {
            return Err(DigestError::DataAbsent {
                site_id: site_id.to_string(),
                day,
            }
            .into());
        }
        let hourly = AggregationEngine::hourly(&records);
        self.store.upsert_hourly(&hourly).await?;
        Ok(hourly)
    }

    pub async fn hourly(&self, site_id: &str, day: NaiveDate) -> Result<Vec<HourlySummary>> {
        self.site(site_id)?;
        Ok(self.store.hourly_for_day(site_id, day).await?)
    }

    /// Build the digest from stored rows and upsert it.
    ///
    /// An existing anchor receipt survives the rebuild when the root is
    /// unchanged. A different root for an anchored day is an
    /// [`PipelineError::IntegrityMismatch`] and nothing is written.
    pub async fn build_digest(&self, site_id: &str, day: NaiveDate) -> Result<DailyDigest> {
        let site = self.site(site_id)?;
        let _guard = self.lock_day(site_id, day).await;
        let records = self.store.records_for_day(site_id, day).await?;
        let mut digest = MerkleDigestBuilder::new(self.settings.interval_minutes).build(
            site,
            day,
            &records,
            Utc::now(),
        )?;

        if let Some(existing) = self.store.digest(site_id, day).await? {
            if let Some(receipt) = existing.anchor {
                if existing.merkle_root != digest.merkle_root {
                    return Err(Self::integrity_mismatch(
                        site_id,
                        day,
                        existing.merkle_root,
                        digest.merkle_root,
                    ));
                }
                digest.attach_anchor(receipt)?;
            }
        }

        self.store.upsert_digest(&digest).await?;
        Ok(digest)
    }

    /// The stored digest, or `DataAbsent`.
    pub async fn digest(&self, site_id: &str, day: NaiveDate) -> Result<DailyDigest> {
        self.site(site_id)?;
        self.store.digest(site_id, day).await?.ok_or_else(|| {
            DigestError::DataAbsent {
                site_id: site_id.to_string(),
                day,
            }
            .into()
        })
    }

    pub async fn artifact(&self, site_id: &str, day: NaiveDate) -> Result<DigestArtifact> {
        Ok(DigestArtifact::from(&self.digest(site_id, day).await?))
    }

    pub async fn csv(&self, site_id: &str, day: NaiveDate) -> Result<String> {
        self.site(site_id)?;
        let records = self.store.records_for_day(site_id, day).await?;
        if records.is_empty() {
            return Err(DigestError::DataAbsent {
                site_id: site_id.to_string(),
                day,
            }
            .into());
        }
        Ok(records_to_csv(&records)?)
    }

    /// Write `{site}_{day}.json` and `{site}_{day}.csv` into the export
    /// directory. `None` when no directory is configured.
    pub async fn export_day(&self, site_id: &str, day: NaiveDate) -> Result<Option<ExportPaths>> {
        let Some(dir) = &self.export_dir else {
            return Ok(None);
        };
        let artifact = self.artifact(site_id, day).await?;
        let csv = self.csv(site_id, day).await?;
        let json = artifact
            .to_json_pretty()
            .map_err(|e| PipelineError::Export(e.into()))?;

        tokio::fs::create_dir_all(dir).await?;
        let paths = ExportPaths {
            json: dir.join(format!("{site_id}_{day}.json")),
            csv: dir.join(format!("{site_id}_{day}.csv")),
        };
        tokio::fs::write(&paths.json, json).await?;
        tokio::fs::write(&paths.csv, csv).await?;
        info!(site_id, %day, json = %paths.json.display(), "digest exported");
        Ok(Some(paths))
    }

    /// Anchor the stored digest with retry and attach the receipt on
    /// success. A failed anchor leaves rows and digest untouched.
    ///
    /// Holds the day's lock for the whole retry loop, so a second caller
    /// for the same day waits and then sees `AlreadyAnchored`.
    pub async fn anchor_day(
        &self,
        site_id: &str,
        day: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<AnchorReport> {
        let coordinator = self.anchor.as_ref().ok_or(PipelineError::AnchorUnavailable)?;
        self.site(site_id)?;
        let _guard = self.lock_day(site_id, day).await;
        let digest = self.digest(site_id, day).await?;
        if digest.is_anchored() {
            return Err(DigestError::AlreadyAnchored {
                site_id: site_id.to_string(),
                day,
            }
            .into());
        }

        let report = coordinator
            .anchor_with_retry(site_id, day, &digest.merkle_root, cancel)
            .await;
        match report.result.receipt() {
            Some(receipt) => {
                let stored = self
                    .store
                    .attach_anchor(site_id, day, &digest.merkle_root, &receipt)
                    .await?;
                if !stored {
                    error!(site_id, %day, tx_id = %receipt.tx_id, "receipt not stored, digest changed while anchoring");
                    let current = self.digest(site_id, day).await?;
                    if current.is_anchored() {
                        return Err(DigestError::AlreadyAnchored {
                            site_id: site_id.to_string(),
                            day,
                        }
                        .into());
                    }
                    return Err(PipelineError::IntegrityMismatch {
                        stored: current.merkle_root,
                        computed: digest.merkle_root,
                    });
                }
            }
            None => warn!(
                site_id,
                %day,
                attempts = report.attempts,
                error = report.result.error.as_deref().unwrap_or_default(),
                "digest left unanchored"
            ),
        }
        Ok(report)
    }

    /// Recompute row hashes and the root for a stored site-day.
    pub async fn verify_day(&self, site_id: &str, day: NaiveDate) -> Result<VerificationReport> {
        let digest = self.digest(site_id, day).await?;
        let records = self.store.records_for_day(site_id, day).await?;
        Ok(verify_records(site_id, day, &digest.merkle_root, &records)?)
    }

    /// Full pipeline for one site-day. Anchoring only runs when requested,
    /// configured, and the digest is not anchored yet.
    pub async fn process_day(
        &self,
        site_id: &str,
        day: NaiveDate,
        anchor: bool,
        cancel: &CancellationToken,
    ) -> Result<DayOutcome> {
        self.generate_day(site_id, day).await?;
        self.aggregate_day(site_id, day).await?;
        let digest = self.build_digest(site_id, day).await?;
        let export = self.export_day(site_id, day).await?;

        let anchor_report = if anchor && self.anchoring_enabled() && !digest.is_anchored() {
            match self.anchor_day(site_id, day, cancel).await {
                Ok(report) => Some(report),
                Err(PipelineError::Digest(DigestError::AlreadyAnchored { .. })) => None,
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        Ok(DayOutcome {
            site_id: site_id.to_string(),
            day,
            rows: digest.rows,
            energy_kwh: digest.energy_kwh,
            avoided_tco2e: digest.avoided_tco2e,
            merkle_root: digest.merkle_root,
            export,
            anchor: anchor_report,
        })
    }

    /// [`Self::process_day`] for every site, in parallel.
    pub async fn run_day(
        self: &Arc<Self>,
        day: NaiveDate,
        anchor: bool,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let mut tasks = JoinSet::new();
        for site_id in self.sites.keys().cloned() {
            let pipeline = Arc::clone(self);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = pipeline.process_day(&site_id, day, anchor, &cancel).await;
                (site_id, result)
            });
        }

        let mut report = BatchReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => report.succeeded.push(outcome),
                Ok((site_id, Err(e))) => {
                    warn!(site_id = %site_id, %day, error = %e, "site failed in batch");
                    report.failed.push(SiteFailure {
                        site_id,
                        error: e.to_string(),
                    });
                }
                Err(e) => {
                    error!(%day, error = %e, "batch task panicked");
                    report.failed.push(SiteFailure {
                        site_id: "<unknown>".to_string(),
                        error: PipelineError::Task(e.to_string()).to_string(),
                    });
                }
            }
        }
        report.succeeded.sort_by(|a, b| a.site_id.cmp(&b.site_id));
        report.failed.sort_by(|a, b| a.site_id.cmp(&b.site_id));
        info!(
            %day,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "batch finished"
        );
        report
    }

    /// Regenerate and re-digest an inclusive day range for one site,
    /// without anchoring. Stops between days when cancelled.
    pub async fn backfill(
        &self,
        site_id: &str,
        from: NaiveDate,
        to: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<Vec<DayOutcome>> {
        if from > to {
            return Err(PipelineError::InvalidRange { from, to });
        }
        self.site(site_id)?;

        let mut outcomes = Vec::new();
        for day in from.iter_days().take_while(|d| *d <= to) {
            if cancel.is_cancelled() {
                warn!(site_id, %day, done = outcomes.len(), "backfill cancelled");
                return Err(PipelineError::Cancelled);
            }
            outcomes.push(self.process_day(site_id, day, false, cancel).await?);
        }
        info!(site_id, %from, %to, days = outcomes.len(), "backfill finished");
        Ok(outcomes)
    }

    /// Retry anchoring for stored digests that are still unanchored.
    ///
    /// Digests anchored by someone else in the meantime are skipped. Any
    /// other error is recorded for that digest and the next one is tried.
    pub async fn anchor_pending(
        &self,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<PendingAnchorReport> {
        let mut report = PendingAnchorReport::default();
        if !self.anchoring_enabled() {
            return Ok(report);
        }
        for digest in self.store.unanchored_digests(limit).await? {
            if cancel.is_cancelled() {
                break;
            }
            if !self.sites.contains_key(&digest.site_id) {
                continue;
            }
            match self.anchor_day(&digest.site_id, digest.day, cancel).await {
                Ok(anchor) => report.reports.push(anchor),
                Err(PipelineError::Digest(DigestError::AlreadyAnchored { .. })) => {
                    debug!(site_id = %digest.site_id, day = %digest.day, "already anchored, skipped");
                }
                Err(e) => {
                    warn!(site_id = %digest.site_id, day = %digest.day, error = %e, "pending anchor failed");
                    report.failed.push(DayFailure {
                        site_id: digest.site_id,
                        day: digest.day,
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    pub async fn anchor_status(&self) -> Option<AnchorServiceStatus> {
        match &self.anchor {
            Some(coordinator) => Some(coordinator.status().await),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::client::MockAnchorClient;
    use crate::anchor::{AnchorClient, AnchorRequest, AnchorResponse, AnchorState, RetryPolicy};
    use crate::domain::site::tests::sample_site;
    use crate::domain::AnchorReceipt;
    use crate::error::AnchorError;
    use crate::repo::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 21).unwrap()
    }

    fn settings() -> SimulationSettings {
        SimulationSettings {
            interval_minutes: 15,
            ..Default::default()
        }
    }

    fn coordinator(mock: MockAnchorClient) -> AnchorCoordinator {
        AnchorCoordinator::new(
            Arc::new(mock),
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
            },
        )
    }

    fn anchoring_mock() -> MockAnchorClient {
        let mut mock = MockAnchorClient::new();
        mock.expect_submit().returning(|req| {
            Ok(AnchorResponse {
                adapter_tx_id: format!("tx-{}", req.topic),
                tx_hash: Some("0xabc".into()),
                block_number: Some(7),
            })
        });
        mock
    }

    fn pipeline(store: Arc<MemoryStore>, anchor: Option<AnchorCoordinator>) -> DigestPipeline {
        DigestPipeline::new(vec![sample_site()], settings(), store).with_anchor(anchor)
    }

    #[tokio::test]
    async fn test_unknown_site() {
        let p = pipeline(Arc::new(MemoryStore::new()), None);
        assert!(matches!(
            p.generate_day("nope", day()).await,
            Err(PipelineError::UnknownSite(_))
        ));
    }

    #[tokio::test]
    async fn test_digest_without_rows_is_data_absent() {
        let p = pipeline(Arc::new(MemoryStore::new()), None);
        let err = p.build_digest("site-alpha", day()).await.unwrap_err();
        assert!(err.is_data_absent());
        assert!(p.digest("site-alpha", day()).await.unwrap_err().is_data_absent());
    }

    #[tokio::test]
    async fn test_regeneration_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let p = pipeline(store.clone(), None);
        let first = p.process_day("site-alpha", day(), false, &CancellationToken::new()).await.unwrap();
        let second = p.process_day("site-alpha", day(), false, &CancellationToken::new()).await.unwrap();
        assert_eq!(first.merkle_root, second.merkle_root);
        assert_eq!(store.record_count(), 96);
        assert_eq!(p.hourly("site-alpha", day()).await.unwrap().len(), 24);
    }

    #[tokio::test]
    async fn test_anchor_attaches_receipt_and_survives_rebuild() {
        let store = Arc::new(MemoryStore::new());
        let p = pipeline(store.clone(), Some(coordinator(anchoring_mock())));
        let cancel = CancellationToken::new();

        let outcome = p.process_day("site-alpha", day(), true, &cancel).await.unwrap();
        assert!(outcome.anchor.as_ref().unwrap().is_success());

        let digest = p.digest("site-alpha", day()).await.unwrap();
        let receipt = digest.anchor.clone().unwrap();
        assert_eq!(receipt.tx_id, "tx-IOT:site-alpha:2024-06-21");
        assert_eq!(receipt.block_number, Some(7));

        // Same rows, same root: the receipt is kept and no second anchor runs.
        let again = p.process_day("site-alpha", day(), true, &cancel).await.unwrap();
        assert!(again.anchor.is_none());
        assert_eq!(p.digest("site-alpha", day()).await.unwrap().anchor, Some(receipt));

        assert!(matches!(
            p.anchor_day("site-alpha", day(), &cancel).await,
            Err(PipelineError::Digest(DigestError::AlreadyAnchored { .. }))
        ));
    }

    #[tokio::test]
    async fn test_changed_root_on_anchored_day_is_integrity_mismatch() {
        let store = Arc::new(MemoryStore::new());
        let p = pipeline(store.clone(), Some(coordinator(anchoring_mock())));
        p.process_day("site-alpha", day(), true, &CancellationToken::new()).await.unwrap();
        let anchored = p.digest("site-alpha", day()).await.unwrap();

        let noon = crate::domain::utc_day_start(day()) + chrono::Duration::hours(12);
        assert!(store.remove_record("site-alpha", noon));

        match p.build_digest("site-alpha", day()).await {
            Err(PipelineError::IntegrityMismatch { stored, computed }) => {
                assert_eq!(stored, anchored.merkle_root);
                assert_ne!(computed, stored);
            }
            other => panic!("expected IntegrityMismatch, got {other:?}"),
        }
        // Nothing was overwritten.
        assert_eq!(p.digest("site-alpha", day()).await.unwrap(), anchored);

        let report = p.verify_day("site-alpha", day()).await.unwrap();
        assert!(!report.root_matches);
    }

    #[tokio::test]
    async fn test_failed_anchor_keeps_digest() {
        let mut mock = MockAnchorClient::new();
        mock.expect_submit()
            .times(2)
            .returning(|_| Err(AnchorError::Transport("unreachable".into())));
        let p = pipeline(Arc::new(MemoryStore::new()), Some(coordinator(mock)));

        let outcome = p
            .process_day("site-alpha", day(), true, &CancellationToken::new())
            .await
            .unwrap();
        let report = outcome.anchor.unwrap();
        assert_eq!(report.state, AnchorState::Failed);
        assert_eq!(report.attempts, 2);

        let digest = p.digest("site-alpha", day()).await.unwrap();
        assert!(!digest.is_anchored());
        assert_eq!(digest.merkle_root, outcome.merkle_root);
        assert_eq!(p.store().unanchored_digests(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_anchor_without_configuration() {
        let p = pipeline(Arc::new(MemoryStore::new()), None);
        p.process_day("site-alpha", day(), true, &CancellationToken::new()).await.unwrap();
        assert!(matches!(
            p.anchor_day("site-alpha", day(), &CancellationToken::new()).await,
            Err(PipelineError::AnchorUnavailable)
        ));
        assert!(p.anchor_status().await.is_none());
    }

    /// Rejects row writes or receipt writes for one site id.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        broken_rows: Option<String>,
        broken_receipts: Option<String>,
    }

    #[async_trait]
    impl TelemetryStore for FlakyStore {
        async fn upsert_records(&self, records: &[TelemetryRecord]) -> anyhow::Result<usize> {
            if records.iter().any(|r| Some(&r.site_id) == self.broken_rows.as_ref()) {
                anyhow::bail!("disk full");
            }
            self.inner.upsert_records(records).await
        }
        async fn records_for_day(&self, site_id: &str, day: NaiveDate) -> anyhow::Result<Vec<TelemetryRecord>> {
            self.inner.records_for_day(site_id, day).await
        }
        async fn upsert_hourly(&self, summaries: &[HourlySummary]) -> anyhow::Result<usize> {
            self.inner.upsert_hourly(summaries).await
        }
        async fn hourly_for_day(&self, site_id: &str, day: NaiveDate) -> anyhow::Result<Vec<HourlySummary>> {
            self.inner.hourly_for_day(site_id, day).await
        }
        async fn upsert_digest(&self, digest: &DailyDigest) -> anyhow::Result<()> {
            self.inner.upsert_digest(digest).await
        }
        async fn attach_anchor(
            &self,
            site_id: &str,
            day: NaiveDate,
            merkle_root: &str,
            receipt: &AnchorReceipt,
        ) -> anyhow::Result<bool> {
            if Some(site_id) == self.broken_receipts.as_deref() {
                anyhow::bail!("receipt write refused");
            }
            self.inner.attach_anchor(site_id, day, merkle_root, receipt).await
        }
        async fn digest(&self, site_id: &str, day: NaiveDate) -> anyhow::Result<Option<DailyDigest>> {
            self.inner.digest(site_id, day).await
        }
        async fn unanchored_digests(&self, limit: usize) -> anyhow::Result<Vec<DailyDigest>> {
            self.inner.unanchored_digests(limit).await
        }
        async fn ping(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn three_sites() -> Vec<SiteConfig> {
        let mut beta = sample_site();
        beta.id = "site-beta".into();
        let mut gamma = sample_site();
        gamma.id = "site-gamma".into();
        vec![sample_site(), beta, gamma]
    }

    #[tokio::test]
    async fn test_batch_isolates_site_failures() {
        let store = Arc::new(FlakyStore {
            broken_rows: Some("site-beta".into()),
            ..Default::default()
        });
        let p = Arc::new(DigestPipeline::new(three_sites(), settings(), store));

        let report = p.run_day(day(), false, &CancellationToken::new()).await;
        assert!(!report.is_clean());
        let ok: Vec<&str> = report.succeeded.iter().map(|o| o.site_id.as_str()).collect();
        assert_eq!(ok, vec!["site-alpha", "site-gamma"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].site_id, "site-beta");
        assert!(report.failed[0].error.contains("disk full"));
        assert_ne!(report.succeeded[0].merkle_root, report.succeeded[1].merkle_root);
    }

    #[tokio::test]
    async fn test_pending_anchors_continue_past_a_failing_digest() {
        let store = Arc::new(FlakyStore {
            broken_receipts: Some("site-beta".into()),
            ..Default::default()
        });
        let p = Arc::new(
            DigestPipeline::new(three_sites(), settings(), store.clone())
                .with_anchor(Some(coordinator(anchoring_mock()))),
        );
        let cancel = CancellationToken::new();
        assert!(p.run_day(day(), false, &cancel).await.is_clean());

        let pending = p.anchor_pending(10, &cancel).await.unwrap();
        assert_eq!(pending.reports.len(), 2);
        assert_eq!(pending.anchored(), 2);
        assert_eq!(pending.failed.len(), 1);
        assert_eq!(pending.failed[0].site_id, "site-beta");
        assert_eq!(pending.failed[0].day, day());
        assert!(pending.failed[0].error.contains("receipt write refused"));

        let left = store.unanchored_digests(10).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].site_id, "site-beta");
        assert!(p.digest("site-gamma", day()).await.unwrap().is_anchored());
    }

    /// Counts submits and answers each one after a delay.
    #[derive(Default)]
    struct SlowClient {
        calls: AtomicU32,
    }

    #[async_trait]
    impl AnchorClient for SlowClient {
        async fn submit(&self, _request: &AnchorRequest) -> Result<AnchorResponse, AnchorError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(AnchorResponse {
                adapter_tx_id: format!("tx-{n}"),
                tx_hash: None,
                block_number: None,
            })
        }

        async fn health(&self) -> Result<(), AnchorError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_concurrent_anchoring_submits_once() {
        let client = Arc::new(SlowClient::default());
        let coordinator = AnchorCoordinator::new(
            client.clone(),
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
            },
        );
        let p = pipeline(Arc::new(MemoryStore::new()), Some(coordinator));
        let cancel = CancellationToken::new();
        p.process_day("site-alpha", day(), false, &cancel).await.unwrap();

        let (direct, pending) = tokio::join!(
            p.anchor_day("site-alpha", day(), &cancel),
            p.anchor_pending(10, &cancel)
        );
        let pending = pending.unwrap();

        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        let direct_anchored = match &direct {
            Ok(report) => report.is_success(),
            Err(PipelineError::Digest(DigestError::AlreadyAnchored { .. })) => false,
            Err(e) => panic!("unexpected error: {e}"),
        };
        assert_eq!(usize::from(direct_anchored) + pending.anchored(), 1);
        assert!(pending.failed.is_empty());
        let receipt = p.digest("site-alpha", day()).await.unwrap().anchor.unwrap();
        assert_eq!(receipt.tx_id, "tx-1");
    }

    #[tokio::test]
    async fn test_regenerating_anchored_day_with_other_seed_keeps_rows() {
        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();
        let original = pipeline(store.clone(), Some(coordinator(anchoring_mock())));
        let outcome = original.process_day("site-alpha", day(), true, &cancel).await.unwrap();
        assert!(outcome.anchor.unwrap().is_success());
        let rows_before = store.records_for_day("site-alpha", day()).await.unwrap();

        let reseeded = DigestPipeline::new(
            vec![sample_site()],
            SimulationSettings {
                seed: 43,
                ..settings()
            },
            store.clone(),
        );
        match reseeded.process_day("site-alpha", day(), false, &cancel).await {
            Err(PipelineError::IntegrityMismatch { stored, computed }) => {
                assert_eq!(stored, outcome.merkle_root);
                assert_ne!(computed, stored);
            }
            other => panic!("expected IntegrityMismatch, got {other:?}"),
        }

        assert_eq!(store.records_for_day("site-alpha", day()).await.unwrap(), rows_before);
        let report = original.verify_day("site-alpha", day()).await.unwrap();
        assert!(report.root_matches);
        assert!(original.digest("site-alpha", day()).await.unwrap().is_anchored());
    }

    #[tokio::test]
    async fn test_backfill_range() {
        let store = Arc::new(MemoryStore::new());
        let p = pipeline(store.clone(), None);
        let from = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();

        let outcomes = p.backfill("site-alpha", from, to, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[2].day, to);
        assert_eq!(store.record_count(), 3 * 96);

        assert!(matches!(
            p.backfill("site-alpha", to, from, &CancellationToken::new()).await,
            Err(PipelineError::InvalidRange { .. })
        ));

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assert!(matches!(
            p.backfill("site-alpha", from, to, &cancelled).await,
            Err(PipelineError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_export_writes_both_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(Arc::new(MemoryStore::new()), None)
            .with_export_dir(Some(dir.path().join("out")));

        let outcome = p
            .process_day("site-alpha", day(), false, &CancellationToken::new())
            .await
            .unwrap();
        let paths = outcome.export.unwrap();
        assert!(paths.json.ends_with("site-alpha_2024-06-21.json"));

        let json: DigestArtifact =
            serde_json::from_str(&std::fs::read_to_string(&paths.json).unwrap()).unwrap();
        assert_eq!(json.bare_root(), outcome.merkle_root);
        let csv = std::fs::read_to_string(&paths.csv).unwrap();
        assert_eq!(csv.lines().count(), 97);
        assert!(csv.lines().skip(1).all(|l| l.contains(",OK,")));
    }
}
