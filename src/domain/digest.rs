use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DigestError;

/// Per site-hour rollup, recomputable at any time from the raw rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlySummary {
    pub site_id: String,
    pub hour_start: DateTime<Utc>,
    pub samples: usize,
    pub energy_kwh: f64,
    pub max_power_kw: f64,
    pub mean_temperature_c: f64,
    pub mean_irradiance_wm2: f64,
}

/// Receipt copied from a successful attestation call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorReceipt {
    pub tx_id: String,
    pub tx_hash: Option<String>,
    pub block_number: Option<u64>,
    pub anchored_at: DateTime<Utc>,
}

/// Per site-day digest.
///
/// Everything but `anchor` is derived from that day's rows. The anchor
/// receipt is attached once, after a successful attestation, and never
/// replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyDigest {
    pub site_id: String,
    pub day: NaiveDate,
    pub rows: usize,
    pub energy_kwh: f64,
    pub avoided_tco2e: f64,
    /// Lowercase hex SHA-256, without the `0x` prefix.
    pub merkle_root: String,
    pub emission_factor_kg_per_kwh: f64,
    pub interval_minutes: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub anchor: Option<AnchorReceipt>,
}

impl DailyDigest {
    pub fn is_anchored(&self) -> bool {
        self.anchor.is_some()
    }

    /// `0x`-prefixed root, as published to the attestation service.
    pub fn prefixed_root(&self) -> String {
        format!("0x{}", self.merkle_root)
    }

    pub fn attach_anchor(&mut self, receipt: AnchorReceipt) -> Result<(), DigestError> {
        if self.anchor.is_some() {
            return Err(DigestError::AlreadyAnchored {
                site_id: self.site_id.clone(),
                day: self.day,
            });
        }
        self.anchor = Some(receipt);
        Ok(())
    }
}
