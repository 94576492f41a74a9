//! Canonical telemetry rows and their content hash.

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

use super::power::PowerOutput;
use super::solar::WeatherSample;
use crate::domain::{fixed, round_to, RecordStatus, TelemetryRecord};

pub const ROW_HASH_DELIMITER: char = '|';

/// ISO-8601 UTC with millisecond precision, e.g. `2024-06-21T12:05:00.000Z`.
pub fn canonical_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// SHA-256 (lowercase hex) over
/// `site|timestamp|energy.3|power.3|irradiance.1|temperature.1|status`.
///
/// Values are formatted at fixed precision first, so `1.5` and `1.500`
/// produce the same hash.
pub fn row_hash(
    site_id: &str,
    timestamp: DateTime<Utc>,
    energy_kwh: f64,
    power_kw: f64,
    irradiance_wm2: f64,
    temperature_c: f64,
    status: RecordStatus,
) -> String {
    let canonical = [
        site_id.to_string(),
        canonical_timestamp(timestamp),
        fixed(energy_kwh, 3),
        fixed(power_kw, 3),
        fixed(irradiance_wm2, 1),
        fixed(temperature_c, 1),
        status.to_string(),
    ]
    .join(&ROW_HASH_DELIMITER.to_string());

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Hash a stored record from its own fields.
pub fn recompute_hash(record: &TelemetryRecord) -> String {
    row_hash(
        &record.site_id,
        record.timestamp,
        record.ac_energy_kwh,
        record.ac_power_kw,
        record.poa_irradiance_wm2,
        record.temperature_c,
        record.status,
    )
}

/// Assembles records for one site.
#[derive(Debug, Clone)]
pub struct TelemetryRowBuilder {
    site_id: String,
}

impl TelemetryRowBuilder {
    pub fn new(site_id: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
        }
    }

    /// Compose the record for one interval. Non-`Ok` statuses force power and
    /// energy to zero regardless of `power`.
    pub fn build(
        &self,
        timestamp: DateTime<Utc>,
        weather: &WeatherSample,
        status: RecordStatus,
        power: PowerOutput,
    ) -> TelemetryRecord {
        let power = match status {
            RecordStatus::Ok => power,
            RecordStatus::Outage | RecordStatus::Curtailed => PowerOutput::ZERO,
        };
        let poa = round_to(weather.poa_irradiance_wm2, 1);
        let temperature = round_to(weather.temperature_c, 1);
        let ac_power = round_to(power.ac_power_kw, 3);
        let ac_energy = round_to(power.ac_energy_kwh, 3);

        TelemetryRecord {
            row_hash: row_hash(
                &self.site_id,
                timestamp,
                ac_energy,
                ac_power,
                poa,
                temperature,
                status,
            ),
            site_id: self.site_id.clone(),
            timestamp,
            poa_irradiance_wm2: poa,
            temperature_c: temperature,
            wind_speed_mps: round_to(weather.wind_speed_mps, 1),
            ac_power_kw: ac_power,
            ac_energy_kwh: ac_energy,
            status,
        }
    }
}
