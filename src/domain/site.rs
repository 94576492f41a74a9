use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, Weekday};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use validator::{Validate, ValidationError};

/// A solar plant as configured for simulation.
///
/// Constructed once at the configuration boundary, validated, and then passed
/// by value into the model for the whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_site"))]
pub struct SiteConfig {
    #[validate(length(min = 1, max = 64))]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[validate(range(min = -90.0, max = 90.0))]
    pub latitude: f64,
    #[validate(range(min = -180.0, max = 180.0))]
    pub longitude: f64,
    pub capacity_dc_kw: f64,
    pub capacity_ac_kw: f64,
    /// Panel tilt from horizontal, degrees.
    #[validate(range(min = 0.0, max = 90.0))]
    pub tilt_deg: f64,
    /// Panel azimuth, degrees clockwise from north (180 = south facing).
    #[validate(range(min = 0.0, max = 360.0))]
    pub azimuth_deg: f64,
    #[validate(range(min = 1))]
    pub module_count: u32,
    #[validate(range(min = 0.01, max = 1.0))]
    pub inverter_efficiency: f64,
    /// Fractional output loss per year of operation.
    #[serde(default)]
    #[validate(range(min = 0.0, max = 0.5))]
    pub degradation_rate: f64,
    /// Grid baseline emission factor, kg CO2e per kWh.
    #[validate(range(min = 0.0, max = 5.0))]
    pub emission_factor_kg_per_kwh: f64,
    #[serde(default)]
    pub outage_windows: Vec<OutageWindow>,
    #[serde(default)]
    #[validate(range(min = 0.0, max = 1.0))]
    pub curtailment_probability: f64,
    #[serde(default)]
    pub commissioned_on: Option<NaiveDate>,
}

impl SiteConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn dc_ac_ratio(&self) -> f64 {
        self.capacity_dc_kw / self.capacity_ac_kw
    }

    /// Multiplicative output factor for module ageing on `day`.
    pub fn degradation_factor(&self, day: NaiveDate) -> f64 {
        match self.commissioned_on {
            Some(start) if day > start => {
                let years = (day - start).num_days() as f64 / 365.25;
                (1.0 - self.degradation_rate).powf(years)
            }
            _ => 1.0,
        }
    }
}

fn invalid(code: &'static str, message: String) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(Cow::Owned(message));
    err
}

fn validate_site(site: &SiteConfig) -> Result<(), ValidationError> {
    if !(site.capacity_ac_kw.is_finite() && site.capacity_ac_kw > 0.0) {
        return Err(invalid(
            "capacity_ac_kw",
            format!("AC capacity must be positive, got {}", site.capacity_ac_kw),
        ));
    }
    if !(site.capacity_dc_kw.is_finite() && site.capacity_dc_kw > 0.0) {
        return Err(invalid(
            "capacity_dc_kw",
            format!("DC capacity must be positive, got {}", site.capacity_dc_kw),
        ));
    }
    for (i, window) in site.outage_windows.iter().enumerate() {
        if window.start > window.end {
            return Err(invalid(
                "outage_window",
                format!(
                    "outage window #{i} starts at {} after it ends at {}",
                    window.start, window.end
                ),
            ));
        }
        if let DayPattern::Days(days) = &window.days {
            if days.is_empty() {
                return Err(invalid(
                    "outage_window",
                    format!("outage window #{i} has an empty day list"),
                ));
            }
        }
    }
    Ok(())
}

// ============================================================================
// Outage windows
// ============================================================================

/// Scheduled outage, same-day only (no overnight wraparound).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutageWindow {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    #[serde(default)]
    pub days: DayPattern,
}

impl OutageWindow {
    /// Inclusive on both ends.
    pub fn contains(&self, hour_of_day: f64, weekday: Weekday) -> bool {
        hour_of_day >= self.start.hours()
            && hour_of_day <= self.end.hours()
            && self.days.matches(weekday)
    }
}

/// Time of day as fractional hours in `[0, 24]`, written `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct TimeOfDay(f64);

impl TimeOfDay {
    pub fn from_hm(hour: u32, minute: u32) -> Option<Self> {
        if minute >= 60 || hour > 24 || (hour == 24 && minute != 0) {
            return None;
        }
        Some(Self(hour as f64 + minute as f64 / 60.0))
    }

    pub fn hours(&self) -> f64 {
        self.0
    }
}

impl FromStr for TimeOfDay {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (h, m) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("expected HH:MM, got '{s}'"))?;
        let hour: u32 = h.parse().map_err(|_| format!("bad hour in '{s}'"))?;
        let minute: u32 = m.parse().map_err(|_| format!("bad minute in '{s}'"))?;
        TimeOfDay::from_hm(hour, minute).ok_or_else(|| format!("time of day out of range: '{s}'"))
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total_minutes = (self.0 * 60.0).round() as u32;
        write!(f, "{:02}:{:02}", total_minutes / 60, total_minutes % 60)
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Days an outage window applies to: `"*"` or a list such as `["MON", "SAT"]`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DayPattern {
    #[default]
    Every,
    Days(Vec<Weekday>),
}

impl DayPattern {
    pub fn matches(&self, weekday: Weekday) -> bool {
        match self {
            DayPattern::Every => true,
            DayPattern::Days(days) => days.contains(&weekday),
        }
    }
}

fn weekday_code(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "MON",
        Weekday::Tue => "TUE",
        Weekday::Wed => "WED",
        Weekday::Thu => "THU",
        Weekday::Fri => "FRI",
        Weekday::Sat => "SAT",
        Weekday::Sun => "SUN",
    }
}

fn parse_weekday_code(code: &str) -> Option<Weekday> {
    match code.trim().to_ascii_uppercase().as_str() {
        "MON" | "MONDAY" => Some(Weekday::Mon),
        "TUE" | "TUESDAY" => Some(Weekday::Tue),
        "WED" | "WEDNESDAY" => Some(Weekday::Wed),
        "THU" | "THURSDAY" => Some(Weekday::Thu),
        "FRI" | "FRIDAY" => Some(Weekday::Fri),
        "SAT" | "SATURDAY" => Some(Weekday::Sat),
        "SUN" | "SUNDAY" => Some(Weekday::Sun),
        _ => None,
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum DayPatternRepr {
    Wildcard(String),
    Days(Vec<String>),
}

impl Serialize for DayPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let repr = match self {
            DayPattern::Every => DayPatternRepr::Wildcard("*".to_string()),
            DayPattern::Days(days) => {
                DayPatternRepr::Days(days.iter().map(|d| weekday_code(*d).to_string()).collect())
            }
        };
        repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DayPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match DayPatternRepr::deserialize(deserializer)? {
            DayPatternRepr::Wildcard(s) if s.trim() == "*" => Ok(DayPattern::Every),
            DayPatternRepr::Wildcard(s) => parse_weekday_code(&s)
                .map(|d| DayPattern::Days(vec![d]))
                .ok_or_else(|| serde::de::Error::custom(format!("unknown day code '{s}'"))),
            DayPatternRepr::Days(codes) if codes.iter().any(|c| c.trim() == "*") => {
                Ok(DayPattern::Every)
            }
            DayPatternRepr::Days(codes) => codes
                .iter()
                .map(|c| {
                    parse_weekday_code(c)
                        .ok_or_else(|| serde::de::Error::custom(format!("unknown day code '{c}'")))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(DayPattern::Days),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rstest::rstest;

    pub(crate) fn sample_site() -> SiteConfig {
        SiteConfig {
            id: "site-alpha".to_string(),
            name: Some("Alpha Solar Park".to_string()),
            latitude: 45.07,
            longitude: 7.69,
            capacity_dc_kw: 1200.0,
            capacity_ac_kw: 1000.0,
            tilt_deg: 30.0,
            azimuth_deg: 180.0,
            module_count: 3000,
            inverter_efficiency: 0.97,
            degradation_rate: 0.005,
            emission_factor_kg_per_kwh: 0.4,
            outage_windows: Vec::new(),
            curtailment_probability: 0.0,
            commissioned_on: None,
        }
    }

    #[test]
    fn test_sample_site_is_valid() {
        assert!(sample_site().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_coordinates_and_capacity() {
        let mut site = sample_site();
        site.latitude = 123.0;
        assert!(site.validate().is_err());

        let mut site = sample_site();
        site.capacity_ac_kw = 0.0;
        assert!(site.validate().is_err());

        let mut site = sample_site();
        site.curtailment_probability = 1.5;
        assert!(site.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_outage_window() {
        let mut site = sample_site();
        site.outage_windows.push(OutageWindow {
            start: "14:00".parse().unwrap(),
            end: "13:00".parse().unwrap(),
            days: DayPattern::Every,
        });
        assert!(site.validate().is_err());
    }

    #[rstest]
    #[case("00:00", 0.0)]
    #[case("13:30", 13.5)]
    #[case("24:00", 24.0)]
    fn test_time_of_day_parse(#[case] raw: &str, #[case] hours: f64) {
        let t: TimeOfDay = raw.parse().unwrap();
        assert_eq!(t.hours(), hours);
        assert_eq!(t.to_string(), raw);
    }

    #[rstest]
    #[case("25:00")]
    #[case("24:30")]
    #[case("12:60")]
    #[case("noon")]
    fn test_time_of_day_rejects(#[case] raw: &str) {
        assert!(raw.parse::<TimeOfDay>().is_err());
    }

    #[test]
    fn test_day_pattern_deserialize() {
        let every: DayPattern = serde_json::from_str("\"*\"").unwrap();
        assert_eq!(every, DayPattern::Every);

        let some: DayPattern = serde_json::from_str("[\"MON\", \"sat\"]").unwrap();
        assert_eq!(some, DayPattern::Days(vec![Weekday::Mon, Weekday::Sat]));
        assert!(some.matches(Weekday::Sat));
        assert!(!some.matches(Weekday::Sun));

        assert!(serde_json::from_str::<DayPattern>("[\"XYZ\"]").is_err());
    }

    #[test]
    fn test_window_contains_is_inclusive() {
        let window = OutageWindow {
            start: "10:00".parse().unwrap(),
            end: "11:00".parse().unwrap(),
            days: DayPattern::Days(vec![Weekday::Tue]),
        };
        assert!(window.contains(10.0, Weekday::Tue));
        assert!(window.contains(11.0, Weekday::Tue));
        assert!(!window.contains(11.01, Weekday::Tue));
        assert!(!window.contains(10.5, Weekday::Wed));
    }

    #[test]
    fn test_degradation_factor() {
        let mut site = sample_site();
        let day = NaiveDate::from_ymd_opt(2024, 6, 21).unwrap();
        assert_eq!(site.degradation_factor(day), 1.0);

        site.commissioned_on = NaiveDate::from_ymd_opt(2014, 6, 21);
        let factor = site.degradation_factor(day);
        assert!(factor < 0.96 && factor > 0.94, "factor {factor}");
    }
}
