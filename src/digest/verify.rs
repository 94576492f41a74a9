//! Integrity checks: recompute row hashes and the Merkle root and compare
//! against what was stored or exported. Mismatches are reported, never
//! repaired.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::artifact::{CsvRow, DigestArtifact};
use super::merkle::merkle_root;
use crate::domain::TelemetryRecord;
use crate::error::DigestError;
use crate::simulation::{recompute_hash, row_hash};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub site_id: String,
    pub day: NaiveDate,
    pub rows: usize,
    pub stored_root: String,
    pub computed_root: String,
    pub root_matches: bool,
    /// Rows whose stored hash no longer matches their fields.
    pub tampered_rows: Vec<DateTime<Utc>>,
}

impl VerificationReport {
    pub fn is_valid(&self) -> bool {
        self.root_matches && self.tampered_rows.is_empty()
    }

    fn log_outcome(&self) {
        if !self.root_matches {
            warn!(
                site_id = %self.site_id,
                day = %self.day,
                stored = %self.stored_root,
                computed = %self.computed_root,
                "merkle root mismatch"
            );
        }
        if !self.tampered_rows.is_empty() {
            warn!(
                site_id = %self.site_id,
                day = %self.day,
                count = self.tampered_rows.len(),
                first = %self.tampered_rows[0],
                "row hashes do not match row contents"
            );
        }
    }
}

/// Check stored rows of one site-day against a stored root (bare hex).
pub fn verify_records(
    site_id: &str,
    day: NaiveDate,
    stored_root: &str,
    records: &[TelemetryRecord],
) -> Result<VerificationReport, DigestError> {
    if records.is_empty() {
        return Err(DigestError::DataAbsent {
            site_id: site_id.to_string(),
            day,
        });
    }

    let tampered_rows = records
        .iter()
        .filter(|r| recompute_hash(r) != r.row_hash)
        .map(|r| r.timestamp)
        .collect();
    let hashes: Vec<&str> = records.iter().map(|r| r.row_hash.as_str()).collect();
    let computed_root = merkle_root(&hashes)?;

    let report = VerificationReport {
        site_id: site_id.to_string(),
        day,
        rows: records.len(),
        root_matches: computed_root == stored_root,
        stored_root: stored_root.to_string(),
        computed_root,
        tampered_rows,
    };
    report.log_outcome();
    Ok(report)
}

/// Re-verify an exported JSON artifact against its CSV, without the store.
pub fn verify_export(
    artifact: &DigestArtifact,
    rows: &[CsvRow],
) -> Result<VerificationReport, DigestError> {
    if rows.is_empty() {
        return Err(DigestError::DataAbsent {
            site_id: artifact.site_id.clone(),
            day: artifact.day,
        });
    }

    let tampered_rows = rows
        .iter()
        .filter(|r| {
            row_hash(
                &artifact.site_id,
                r.timestamp_utc,
                r.ac_energy_kwh,
                r.ac_power_kw,
                r.poa_irradiance_wm2,
                r.temperature_c,
                r.status,
            ) != r.row_hash
        })
        .map(|r| r.timestamp_utc)
        .collect();
    let hashes: Vec<&str> = rows.iter().map(|r| r.row_hash.as_str()).collect();
    let computed_root = merkle_root(&hashes)?;
    let stored_root = artifact.bare_root().to_string();

    let report = VerificationReport {
        site_id: artifact.site_id.clone(),
        day: artifact.day,
        rows: rows.len(),
        root_matches: computed_root == stored_root && rows.len() == artifact.rows,
        stored_root,
        computed_root,
        tampered_rows,
    };
    report.log_outcome();
    Ok(report)
}
