use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;

use crate::config::Config;
use crate::domain::{AnchorReceipt, DailyDigest, HourlySummary, TelemetryRecord};

pub mod memory;
#[cfg(feature = "db")]
pub mod pg;

pub use memory::MemoryStore;

/// Keyed persistence for rows, hourly rollups and digests.
///
/// All writes are upserts: rows by `(site_id, timestamp)`, hourly
/// summaries by `(site_id, hour_start)`, digests by `(site_id, day)`.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Returns the number of rows written.
    async fn upsert_records(&self, records: &[TelemetryRecord]) -> Result<usize>;

    /// Rows of one UTC day, ordered by timestamp.
    async fn records_for_day(&self, site_id: &str, day: NaiveDate) -> Result<Vec<TelemetryRecord>>;

    async fn upsert_hourly(&self, summaries: &[HourlySummary]) -> Result<usize>;

    async fn hourly_for_day(&self, site_id: &str, day: NaiveDate) -> Result<Vec<HourlySummary>>;

    /// A receipt already stored for the day always wins over the one in
    /// `digest`.
    async fn upsert_digest(&self, digest: &DailyDigest) -> Result<()>;

    /// Store `receipt` only if the digest exists, is unanchored and still
    /// has `merkle_root`. Returns whether it was written.
    async fn attach_anchor(
        &self,
        site_id: &str,
        day: NaiveDate,
        merkle_root: &str,
        receipt: &AnchorReceipt,
    ) -> Result<bool>;

    async fn digest(&self, site_id: &str, day: NaiveDate) -> Result<Option<DailyDigest>>;

    /// Digests without an anchor receipt, oldest day first.
    async fn unanchored_digests(&self, limit: usize) -> Result<Vec<DailyDigest>>;

    async fn ping(&self) -> Result<()>;
}

/// The configured store: Postgres when built with `db` and a URL is set,
/// otherwise in-memory.
pub async fn open_store(cfg: &Config) -> Result<Arc<dyn TelemetryStore>> {
    #[cfg(feature = "db")]
    {
        if let Some(url) = cfg.db.url.as_deref() {
            let store = pg::PgStore::connect(url).await?;
            return Ok(Arc::new(store));
        }
    }

    let _ = cfg;
    Ok(Arc::new(MemoryStore::new()))
}
