//! Exportable digest artifacts: a JSON summary and a CSV of the day's rows.
//!
//! Together they carry everything needed to re-verify a day without access
//! to the store (see [`super::verify::verify_export`]).

use std::io;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{fixed, interval_label, DailyDigest, RecordStatus, TelemetryRecord};
use crate::simulation::canonical_timestamp;

pub const HASH_ALGO: &str = "sha256";
pub const ARTIFACT_VERSION: &str = "1.0";

pub const CSV_HEADER: [&str; 8] = [
    "timestamp_utc",
    "ac_power_kw",
    "ac_energy_kwh",
    "poa_irradiance_wm2",
    "temperature_c",
    "wind_speed_mps",
    "status",
    "row_hash",
];

/// JSON form of a [`DailyDigest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestArtifact {
    pub site_id: String,
    pub day: NaiveDate,
    pub rows: usize,
    #[serde(rename = "energyKWh")]
    pub energy_kwh: f64,
    #[serde(rename = "avoidedTCO2e")]
    pub avoided_tco2e: f64,
    /// `0x`-prefixed.
    pub merkle_root: String,
    pub hash_algo: String,
    pub interval: String,
    #[serde(rename = "factorKgPerKWh")]
    pub factor_kg_per_kwh: f64,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor_tx_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor_tx_hash: Option<String>,
}

impl From<&DailyDigest> for DigestArtifact {
    fn from(digest: &DailyDigest) -> Self {
        Self {
            site_id: digest.site_id.clone(),
            day: digest.day,
            rows: digest.rows,
            energy_kwh: digest.energy_kwh,
            avoided_tco2e: digest.avoided_tco2e,
            merkle_root: digest.prefixed_root(),
            hash_algo: HASH_ALGO.to_string(),
            interval: interval_label(digest.interval_minutes),
            factor_kg_per_kwh: digest.emission_factor_kg_per_kwh,
            version: ARTIFACT_VERSION.to_string(),
            anchor_tx_id: digest.anchor.as_ref().map(|a| a.tx_id.clone()),
            anchor_tx_hash: digest.anchor.as_ref().and_then(|a| a.tx_hash.clone()),
        }
    }
}

impl DigestArtifact {
    /// Root without the `0x` prefix.
    pub fn bare_root(&self) -> &str {
        self.merkle_root.strip_prefix("0x").unwrap_or(&self.merkle_root)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// One CSV line as read back from an export.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CsvRow {
    pub timestamp_utc: DateTime<Utc>,
    pub ac_power_kw: f64,
    pub ac_energy_kwh: f64,
    pub poa_irradiance_wm2: f64,
    pub temperature_c: f64,
    pub wind_speed_mps: f64,
    pub status: RecordStatus,
    pub row_hash: String,
}

/// Rows as CSV, in timestamp order, numbers at hash-input precision.
pub fn records_to_csv(records: &[TelemetryRecord]) -> io::Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CSV_HEADER)?;

    let mut ordered: Vec<&TelemetryRecord> = records.iter().collect();
    ordered.sort_by_key(|r| r.timestamp);
    for r in ordered {
        writer.write_record([
            canonical_timestamp(r.timestamp),
            fixed(r.ac_power_kw, 3),
            fixed(r.ac_energy_kwh, 3),
            fixed(r.poa_irradiance_wm2, 1),
            fixed(r.temperature_c, 1),
            fixed(r.wind_speed_mps, 1),
            r.status.to_string(),
            r.row_hash.clone(),
        ])?;
    }

    let bytes = writer.into_inner().map_err(|e| e.into_error())?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Parse an exported CSV back into rows.
pub fn parse_csv(data: &str) -> Result<Vec<CsvRow>, csv::Error> {
    csv::Reader::from_reader(data.as_bytes())
        .deserialize()
        .collect()
}
