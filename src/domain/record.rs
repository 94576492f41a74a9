use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Outcome of one simulated interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Ok,
    Outage,
    Curtailed,
}

/// One canonical telemetry row, unique per `(site_id, timestamp)`.
///
/// Values are stored already rounded to the precision that enters the row
/// hash; `row_hash` is the SHA-256 of the canonical string built by
/// [`crate::simulation::row_hash`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub site_id: String,
    pub timestamp: DateTime<Utc>,
    pub poa_irradiance_wm2: f64,
    pub temperature_c: f64,
    pub wind_speed_mps: f64,
    pub ac_power_kw: f64,
    pub ac_energy_kwh: f64,
    pub status: RecordStatus,
    pub row_hash: String,
}

impl TelemetryRecord {
    pub fn day(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }

    pub fn key(&self) -> (&str, DateTime<Utc>) {
        (&self.site_id, self.timestamp)
    }
}
