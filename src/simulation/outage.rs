//! # Outage and curtailment
//!
//! Precedence per interval: scheduled outage, then stochastic curtailment,
//! then normal generation. The curtailment draw is only taken when no outage
//! applies, and there is one independent draw per interval (no episodes).

use chrono::{DateTime, Datelike, Timelike, Utc};

use super::rng::SeededRandom;
use crate::domain::{OutageWindow, RecordStatus, SiteConfig};

#[derive(Debug, Clone, PartialEq)]
pub struct OutageCurtailmentPolicy {
    windows: Vec<OutageWindow>,
    curtailment_probability: f64,
}

impl OutageCurtailmentPolicy {
    pub fn new(windows: Vec<OutageWindow>, curtailment_probability: f64) -> Self {
        Self {
            windows,
            curtailment_probability,
        }
    }

    pub fn for_site(site: &SiteConfig) -> Self {
        Self::new(site.outage_windows.clone(), site.curtailment_probability)
    }

    /// Whether `time` falls inside any scheduled outage window (UTC).
    pub fn in_outage(&self, time: DateTime<Utc>) -> bool {
        let hour = time.hour() as f64 + time.minute() as f64 / 60.0 + time.second() as f64 / 3600.0;
        let weekday = time.weekday();
        self.windows.iter().any(|w| w.contains(hour, weekday))
    }

    /// Status for one interval. Consumes one RNG draw unless an outage is
    /// active.
    pub fn evaluate(&self, time: DateTime<Utc>, rng: &mut SeededRandom) -> RecordStatus {
        if self.in_outage(time) {
            return RecordStatus::Outage;
        }
        if rng.next() < self.curtailment_probability {
            RecordStatus::Curtailed
        } else {
            RecordStatus::Ok
        }
    }
}
