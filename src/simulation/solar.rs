//! # Solar geometry and weather
//!
//! Clear-sky plane-of-array irradiance for a fixed-tilt array, with a
//! seeded cloud multiplier, plus synthetic ambient temperature and wind.
//!
//! All three weather draws go through the caller's [`SeededRandom`]; the
//! order of calls inside [`SolarGeometryModel::sample`] is part of the
//! determinism contract and must not change.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use super::rng::SeededRandom;
use crate::domain::{round_to, SiteConfig};

const SOLAR_CONSTANT_WM2: f64 = 1367.0;
const DEG: f64 = PI / 180.0;

/// Sun position for one instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolarPosition {
    pub declination_deg: f64,
    pub hour_angle_deg: f64,
    /// Angle above the horizon.
    pub elevation_deg: f64,
    /// Degrees clockwise from north.
    pub azimuth_deg: f64,
    /// Local apparent solar time in hours.
    pub solar_hour: f64,
}

/// Weather and irradiance for one interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeatherSample {
    pub poa_irradiance_wm2: f64,
    pub temperature_c: f64,
    pub wind_speed_mps: f64,
    pub solar_elevation_deg: f64,
    /// Cloud multiplier actually applied; 0 at night (no draw made).
    pub cloud_factor: f64,
}

/// Geometry of one site: location plus panel orientation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolarGeometryModel {
    latitude_deg: f64,
    longitude_deg: f64,
    tilt_deg: f64,
    azimuth_deg: f64,
}

impl SolarGeometryModel {
    pub fn new(latitude_deg: f64, longitude_deg: f64, tilt_deg: f64, azimuth_deg: f64) -> Self {
        Self {
            latitude_deg,
            longitude_deg,
            tilt_deg,
            azimuth_deg,
        }
    }

    pub fn for_site(site: &SiteConfig) -> Self {
        Self::new(site.latitude, site.longitude, site.tilt_deg, site.azimuth_deg)
    }

    /// Declination, hour angle, elevation and azimuth for a UTC instant.
    pub fn solar_position(&self, time: DateTime<Utc>) -> SolarPosition {
        let day_of_year = time.ordinal() as f64;
        let utc_hour =
            time.hour() as f64 + time.minute() as f64 / 60.0 + time.second() as f64 / 3600.0;

        let declination_deg = 23.45 * (360.0 / 365.0 * (284.0 + day_of_year) * DEG).sin();
        let declination = declination_deg * DEG;
        let latitude = self.latitude_deg * DEG;

        let solar_hour = (utc_hour + self.longitude_deg / 15.0).rem_euclid(24.0);
        let hour_angle_deg = 15.0 * (solar_hour - 12.0);
        let hour_angle = hour_angle_deg * DEG;

        let elevation_sin = latitude.sin() * declination.sin()
            + latitude.cos() * declination.cos() * hour_angle.cos();
        let elevation = elevation_sin.clamp(-1.0, 1.0).asin();

        let denom = latitude.cos() * elevation.cos();
        let azimuth_deg = if denom.abs() < 1e-9 {
            180.0
        } else {
            let cos_az = (declination.sin() - latitude.sin() * elevation.sin()) / denom;
            let az = cos_az.clamp(-1.0, 1.0).acos() / DEG;
            // Afternoon sun sits in the western sky.
            if hour_angle_deg > 0.0 {
                360.0 - az
            } else {
                az
            }
        };

        SolarPosition {
            declination_deg,
            hour_angle_deg,
            elevation_deg: elevation / DEG,
            azimuth_deg,
            solar_hour,
        }
    }

    /// Cosine of the angle between the sun and the panel normal, floored at 0.
    pub fn incidence_cos(&self, position: &SolarPosition) -> f64 {
        let elevation = position.elevation_deg * DEG;
        let tilt = self.tilt_deg * DEG;
        let az_diff = (position.azimuth_deg - self.azimuth_deg) * DEG;
        (elevation.sin() * tilt.cos() + elevation.cos() * tilt.sin() * az_diff.cos()).max(0.0)
    }

    /// Clear-sky plane-of-array irradiance in W/m², before clouds.
    ///
    /// Zero whenever the sun is at or below the horizon.
    pub fn clear_sky_poa(&self, time: DateTime<Utc>, position: &SolarPosition) -> f64 {
        if position.elevation_deg <= 0.0 {
            return 0.0;
        }
        let day_of_year = time.ordinal() as f64;
        let elevation_sin = (position.elevation_deg * DEG).sin();

        // Earth-Sun distance eccentricity correction.
        let extraterrestrial =
            SOLAR_CONSTANT_WM2 * (1.0 + 0.033 * (360.0 * day_of_year / 365.0 * DEG).cos());

        let air_mass = 1.0 / elevation_sin;
        let transmittance = 0.7_f64.powf(air_mass.powf(0.678));
        let dni = extraterrestrial * transmittance;

        // Liu-Jordan: diffuse transmittance falls as beam transmittance rises.
        let diffuse_fraction = (0.271 - 0.294 * transmittance).max(0.0);
        let dhi = extraterrestrial * elevation_sin * diffuse_fraction;

        let tilt = self.tilt_deg * DEG;
        let beam = dni * self.incidence_cos(position);
        let diffuse = dhi * (1.0 + tilt.cos()) / 2.0;
        (beam + diffuse).max(0.0)
    }

    /// Cloud multiplier: seasonal × daily (heavier afternoon cloud) ×
    /// random in `[0.3, 1.2)`, clamped to `[0.1, 1.0]`.
    fn cloud_factor(&self, time: DateTime<Utc>, solar_hour: f64, rng: &mut SeededRandom) -> f64 {
        let day_of_year = time.ordinal() as f64;
        let summer_peak = if self.latitude_deg >= 0.0 { 172.0 } else { 355.0 };
        let seasonal = 0.85 + 0.15 * (2.0 * PI * (day_of_year - summer_peak) / 365.0).cos();
        let daily = 1.0 - 0.05 * (1.0 + (2.0 * PI * (solar_hour - 12.0) / 24.0).sin());
        let random = rng.range(0.3, 1.2);
        (seasonal * daily * random).clamp(0.1, 1.0)
    }

    /// Plane-of-array irradiance after clouds, rounded to 0.1 W/m².
    ///
    /// Returns `(irradiance, cloud_factor, position)`. No random draw is made
    /// when the sun is down.
    pub fn irradiance(
        &self,
        time: DateTime<Utc>,
        rng: &mut SeededRandom,
    ) -> (f64, f64, SolarPosition) {
        let position = self.solar_position(time);
        if position.elevation_deg <= 0.0 {
            return (0.0, 0.0, position);
        }
        let clear_sky = self.clear_sky_poa(time, &position);
        let cloud = self.cloud_factor(time, position.solar_hour, rng);
        (round_to((clear_sky * cloud).max(0.0), 1), cloud, position)
    }

    /// Ambient temperature in °C, clamped to `[-10, 50]`, rounded to 0.1.
    pub fn temperature(&self, time: DateTime<Utc>, solar_hour: f64, rng: &mut SeededRandom) -> f64 {
        let day_of_year = time.ordinal() as f64;
        let abs_lat = self.latitude_deg.abs();
        let base = 28.0 - 0.4 * abs_lat;

        // Warmest around day 200 in the north, day 20 in the south.
        let warm_peak = if self.latitude_deg >= 0.0 { 200.0 } else { 20.0 };
        let amplitude = 2.0 + 0.2 * abs_lat.min(60.0);
        let seasonal = amplitude * (2.0 * PI * (day_of_year - warm_peak) / 365.0).cos();

        // Daily maximum mid-afternoon.
        let daily = 5.0 * (2.0 * PI * (solar_hour - 14.0) / 24.0).cos();

        let noise = rng.normal(0.0, 1.5);
        round_to((base + seasonal + daily + noise).clamp(-10.0, 50.0), 1)
    }

    /// Wind speed in m/s, floored at 0, rounded to 0.1.
    pub fn wind_speed(&self, solar_hour: f64, rng: &mut SeededRandom) -> f64 {
        let baseline = 3.0 + 1.5 * (2.0 * PI * (solar_hour - 9.0) / 24.0).sin();
        let noise = rng.range(-1.5, 1.5);
        round_to((baseline + noise).max(0.0), 1)
    }

    /// Irradiance, then temperature, then wind.
    pub fn sample(&self, time: DateTime<Utc>, rng: &mut SeededRandom) -> WeatherSample {
        let (poa, cloud, position) = self.irradiance(time, rng);
        let temperature_c = self.temperature(time, position.solar_hour, rng);
        let wind_speed_mps = self.wind_speed(position.solar_hour, rng);
        WeatherSample {
            poa_irradiance_wm2: poa,
            temperature_c,
            wind_speed_mps,
            solar_elevation_deg: position.elevation_deg,
            cloud_factor: cloud,
        }
    }
}
