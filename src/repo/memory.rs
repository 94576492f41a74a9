//! In-process store used by tests and by the service when no database is
//! configured.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::RwLock;

use super::TelemetryStore;
use crate::domain::{utc_day_start, AnchorReceipt, DailyDigest, HourlySummary, TelemetryRecord};

type TimeKey = (String, DateTime<Utc>);

#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<TimeKey, TelemetryRecord>>,
    hourly: RwLock<BTreeMap<TimeKey, HourlySummary>>,
    digests: RwLock<BTreeMap<(String, NaiveDate), DailyDigest>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn day_range(site_id: &str, day: NaiveDate) -> std::ops::Range<TimeKey> {
        let start = utc_day_start(day);
        (site_id.to_string(), start)..(site_id.to_string(), start + Duration::days(1))
    }

    /// Overwrite a stored row without touching its hash. Test hook for
    /// tamper detection.
    pub fn tamper<F>(&self, site_id: &str, timestamp: DateTime<Utc>, edit: F) -> bool
    where
        F: FnOnce(&mut TelemetryRecord),
    {
        match self
            .records
            .write()
            .get_mut(&(site_id.to_string(), timestamp))
        {
            Some(record) => {
                edit(record);
                true
            }
            None => false,
        }
    }

    /// Drop a stored row.
    pub fn remove_record(&self, site_id: &str, timestamp: DateTime<Utc>) -> bool {
        self.records
            .write()
            .remove(&(site_id.to_string(), timestamp))
            .is_some()
    }

    pub fn record_count(&self) -> usize {
        self.records.read().len()
    }
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    async fn upsert_records(&self, records: &[TelemetryRecord]) -> Result<usize> {
        let mut map = self.records.write();
        for record in records {
            map.insert((record.site_id.clone(), record.timestamp), record.clone());
        }
        Ok(records.len())
    }

    async fn records_for_day(&self, site_id: &str, day: NaiveDate) -> Result<Vec<TelemetryRecord>> {
        Ok(self
            .records
            .read()
            .range(Self::day_range(site_id, day))
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn upsert_hourly(&self, summaries: &[HourlySummary]) -> Result<usize> {
        let mut map = self.hourly.write();
        for summary in summaries {
            map.insert((summary.site_id.clone(), summary.hour_start), summary.clone());
        }
        Ok(summaries.len())
    }

    async fn hourly_for_day(&self, site_id: &str, day: NaiveDate) -> Result<Vec<HourlySummary>> {
        Ok(self
            .hourly
            .read()
            .range(Self::day_range(site_id, day))
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn upsert_digest(&self, digest: &DailyDigest) -> Result<()> {
        let mut map = self.digests.write();
        let key = (digest.site_id.clone(), digest.day);
        let mut digest = digest.clone();
        if let Some(receipt) = map.get(&key).and_then(|d| d.anchor.clone()) {
            digest.anchor = Some(receipt);
        }
        map.insert(key, digest);
        Ok(())
    }

    async fn attach_anchor(
        &self,
        site_id: &str,
        day: NaiveDate,
        merkle_root: &str,
        receipt: &AnchorReceipt,
    ) -> Result<bool> {
        let mut map = self.digests.write();
        match map.get_mut(&(site_id.to_string(), day)) {
            Some(digest) if !digest.is_anchored() && digest.merkle_root == merkle_root => {
                digest.anchor = Some(receipt.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn digest(&self, site_id: &str, day: NaiveDate) -> Result<Option<DailyDigest>> {
        Ok(self.digests.read().get(&(site_id.to_string(), day)).cloned())
    }

    async fn unanchored_digests(&self, limit: usize) -> Result<Vec<DailyDigest>> {
        let mut pending: Vec<DailyDigest> = self
            .digests
            .read()
            .values()
            .filter(|d| !d.is_anchored())
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.day.cmp(&b.day).then_with(|| a.site_id.cmp(&b.site_id)));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
