//! # Merkle digest
//!
//! Reduces one site-day of row hashes to a single root. Leaves are sorted
//! before pairing, so the root does not depend on retrieval order; the price
//! is that a leaf's position in the tree says nothing about its timestamp.

use chrono::{DateTime, NaiveDate, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::aggregation::AggregationEngine;
use crate::domain::{DailyDigest, SiteConfig, TelemetryRecord};
use crate::error::DigestError;

fn hash_pair(left: &str, right: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Merkle root over lowercase hex leaf hashes.
///
/// * zero leaves is an error, not a degenerate root
/// * a single leaf is its own root
/// * otherwise leaves are sorted, adjacent pairs are hashed as the
///   concatenation of their hex strings, and the last entry of an odd level
///   is paired with itself
pub fn merkle_root<S: AsRef<str>>(leaves: &[S]) -> Result<String, DigestError> {
    let mut level: Vec<String> = leaves.iter().map(|h| h.as_ref().to_string()).collect();
    match level.len() {
        0 => return Err(DigestError::EmptyLeafSet),
        1 => return Ok(level.remove(0)),
        _ => {}
    }

    level.sort_unstable();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => hash_pair(left, right),
                [last] => hash_pair(last, last),
                _ => unreachable!("chunks(2) yields one or two items"),
            })
            .collect();
    }
    Ok(level.remove(0))
}

/// Assembles [`DailyDigest`]s from a day of stored rows.
#[derive(Debug, Clone, Copy)]
pub struct MerkleDigestBuilder {
    interval_minutes: u32,
}

impl MerkleDigestBuilder {
    pub fn new(interval_minutes: u32) -> Self {
        Self { interval_minutes }
    }

    /// Digest for `site` on `day`. Only rows whose UTC date is `day` count.
    ///
    /// Fails with [`DigestError::DataAbsent`] when the day has no rows.
    pub fn build(
        &self,
        site: &SiteConfig,
        day: NaiveDate,
        records: &[TelemetryRecord],
        created_at: DateTime<Utc>,
    ) -> Result<DailyDigest, DigestError> {
        let day_records: Vec<&TelemetryRecord> = records
            .iter()
            .filter(|r| r.site_id == site.id && r.day() == day)
            .collect();
        if day_records.is_empty() {
            return Err(DigestError::DataAbsent {
                site_id: site.id.clone(),
                day,
            });
        }

        let hashes: Vec<&str> = day_records.iter().map(|r| r.row_hash.as_str()).collect();
        let merkle_root = merkle_root(&hashes)?;
        let totals = AggregationEngine::daily_totals(
            day_records.iter().copied(),
            site.emission_factor_kg_per_kwh,
        );

        debug!(site_id = %site.id, %day, rows = totals.rows, root = %merkle_root, "built daily digest");

        Ok(DailyDigest {
            site_id: site.id.clone(),
            day,
            rows: totals.rows,
            energy_kwh: totals.energy_kwh,
            avoided_tco2e: totals.avoided_tco2e,
            merkle_root,
            emission_factor_kg_per_kwh: site.emission_factor_kg_per_kwh,
            interval_minutes: self.interval_minutes,
            created_at,
            anchor: None,
        })
    }
}
