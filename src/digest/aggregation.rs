//! Hourly and daily rollups of raw telemetry.

use chrono::{DateTime, Duration, Timelike, Utc};
use itertools::Itertools;

use crate::domain::{round_to, to_tco2e, utc_day_start, HourlySummary, TelemetryRecord};

/// Day-level sums that feed a [`crate::domain::DailyDigest`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DailyTotals {
    pub rows: usize,
    pub energy_kwh: f64,
    pub avoided_tco2e: f64,
}

/// Start of the UTC hour containing `timestamp`.
pub fn hour_start(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    utc_day_start(timestamp.date_naive()) + Duration::hours(timestamp.hour() as i64)
}

pub struct AggregationEngine;

impl AggregationEngine {
    /// One summary per `(site, UTC hour)` present in `records`, ordered by
    /// site then hour. Input order does not matter and the same input always
    /// yields the same output.
    pub fn hourly(records: &[TelemetryRecord]) -> Vec<HourlySummary> {
        let sorted = records
            .iter()
            .sorted_by(|a, b| a.site_id.cmp(&b.site_id).then(a.timestamp.cmp(&b.timestamp)));

        let groups = sorted.chunk_by(|r| (r.site_id.clone(), hour_start(r.timestamp)));
        groups
            .into_iter()
            .map(|((site_id, hour_start), group)| {
                let rows: Vec<&TelemetryRecord> = group.collect();
                Self::summarize(site_id, hour_start, &rows)
            })
            .collect()
    }

    fn summarize(
        site_id: String,
        hour_start: DateTime<Utc>,
        rows: &[&TelemetryRecord],
    ) -> HourlySummary {
        let n = rows.len() as f64;
        let energy: f64 = rows.iter().map(|r| r.ac_energy_kwh).sum();
        let max_power = rows.iter().map(|r| r.ac_power_kw).fold(0.0, f64::max);
        let mean_temperature = rows.iter().map(|r| r.temperature_c).sum::<f64>() / n;
        let mean_irradiance = rows.iter().map(|r| r.poa_irradiance_wm2).sum::<f64>() / n;

        HourlySummary {
            site_id,
            hour_start,
            samples: rows.len(),
            energy_kwh: round_to(energy, 3),
            max_power_kw: round_to(max_power, 3),
            mean_temperature_c: round_to(mean_temperature, 1),
            mean_irradiance_wm2: round_to(mean_irradiance, 1),
        }
    }

    /// Row count, total energy and avoided emissions for a set of rows.
    pub fn daily_totals<'a>(
        records: impl IntoIterator<Item = &'a TelemetryRecord>,
        emission_factor_kg_per_kwh: f64,
    ) -> DailyTotals {
        let (rows, energy) = records
            .into_iter()
            .fold((0usize, 0.0f64), |(n, e), r| (n + 1, e + r.ac_energy_kwh));
        let energy_kwh = round_to(energy, 3);
        DailyTotals {
            rows,
            energy_kwh,
            avoided_tco2e: round_to(to_tco2e(energy_kwh, emission_factor_kg_per_kwh), 3),
        }
    }
}
