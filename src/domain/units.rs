use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};

// ============================================================================
// Numeric helpers shared by the model, the row hash and the artifacts
// ============================================================================

/// Round to a fixed number of decimals, half away from zero.
///
/// The result never carries a negative zero, so `fixed(round_to(-0.0001, 3), 3)`
/// renders as `0.000`.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor + 0.0
}

/// Fixed-precision rendering used by the row hash and the CSV export.
pub fn fixed(value: f64, decimals: u32) -> String {
    format!("{:.*}", decimals as usize, round_to(value, decimals))
}

/// Convert energy in kWh to tonnes CO2e for an emission factor in kg/kWh.
pub fn to_tco2e(energy_kwh: f64, factor_kg_per_kwh: f64) -> f64 {
    energy_kwh * factor_kg_per_kwh / 1000.0
}

/// Energy produced over one interval at constant power.
pub fn interval_energy_kwh(power_kw: f64, interval_minutes: u32) -> f64 {
    power_kw * (interval_minutes as f64 / 60.0)
}

/// Short label for a sampling interval: `5m`, `15m`, `1h`.
pub fn interval_label(interval_minutes: u32) -> String {
    if interval_minutes % 60 == 0 {
        format!("{}h", interval_minutes / 60)
    } else {
        format!("{}m", interval_minutes)
    }
}

/// Midnight UTC at the start of `day`.
pub fn utc_day_start(day: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&day.and_time(NaiveTime::default()))
}
