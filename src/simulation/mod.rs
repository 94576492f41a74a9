//! # Telemetry Simulation Module
//!
//! Deterministic synthetic generation of inverter telemetry for configured sites.
//!
//! ## Components
//!
//! - **Rng**: SFC32 generator seeded from SHA-256 of the seed material
//! - **Solar**: Sun position, clear-sky plane-of-array irradiance, clouds, temperature and wind
//! - **Power**: DC/AC conversion with temperature derate and AC clipping
//! - **Outage**: Scheduled outage windows and stochastic curtailment
//! - **Row**: Canonical row assembly and row hashing
//! - **Generator**: Runs the chain over every interval of a UTC day
//!
//! ## Usage
//!
//! ```rust
//! use chrono::NaiveDate;
//! use solar_attest::domain::SiteConfig;
//! use solar_attest::simulation::{SimulationSettings, SiteSimulator};
//!
//! let site: SiteConfig = serde_json::from_value(serde_json::json!({
//!     "id": "site-alpha",
//!     "latitude": 45.07,
//!     "longitude": 7.69,
//!     "capacity_dc_kw": 1200.0,
//!     "capacity_ac_kw": 1000.0,
//!     "tilt_deg": 30.0,
//!     "azimuth_deg": 180.0,
//!     "module_count": 3000,
//!     "inverter_efficiency": 0.97,
//!     "emission_factor_kg_per_kwh": 0.4
//! }))
//! .unwrap();
//!
//! let simulator = SiteSimulator::new(site, SimulationSettings::default());
//! let day = NaiveDate::from_ymd_opt(2024, 6, 21).unwrap();
//! let records = simulator.generate_day(day);
//! assert_eq!(records.len(), 288);
//! ```

pub mod generator;
pub mod outage;
pub mod power;
pub mod rng;
pub mod row;
pub mod solar;

pub use generator::{day_timestamps, SimulationSettings, SiteSimulator};
pub use outage::OutageCurtailmentPolicy;
pub use power::{PowerConversionModel, PowerModelParams, PowerOutput};
pub use rng::SeededRandom;
pub use row::{canonical_timestamp, recompute_hash, row_hash, TelemetryRowBuilder};
pub use solar::{SolarGeometryModel, SolarPosition, WeatherSample};
