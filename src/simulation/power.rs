//! # Power conversion
//!
//! Irradiance and temperature to DC, DC to AC with inverter efficiency and a
//! hard AC capacity clip, AC to interval energy.

use serde::{Deserialize, Serialize};

use crate::domain::{interval_energy_kwh, round_to};

/// Module-level constants of the conversion model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerModelParams {
    /// Nominal area of one module, m².
    pub module_area_m2: f64,
    /// STC module efficiency, 0..1.
    pub module_efficiency: f64,
    /// Relative power change per °C above 25 °C (negative).
    pub temperature_coefficient: f64,
}

impl Default for PowerModelParams {
    fn default() -> Self {
        Self {
            module_area_m2: 1.7,
            module_efficiency: 0.20,
            temperature_coefficient: -0.004,
        }
    }
}

/// AC output for one interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerOutput {
    pub dc_power_kw: f64,
    pub ac_power_kw: f64,
    pub ac_energy_kwh: f64,
    /// True when the AC clip was active.
    pub clipped: bool,
}

impl PowerOutput {
    pub const ZERO: PowerOutput = PowerOutput {
        dc_power_kw: 0.0,
        ac_power_kw: 0.0,
        ac_energy_kwh: 0.0,
        clipped: false,
    };
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerConversionModel {
    params: PowerModelParams,
    module_count: u32,
    inverter_efficiency: f64,
    capacity_ac_kw: f64,
    degradation_factor: f64,
}

impl PowerConversionModel {
    pub fn new(
        params: PowerModelParams,
        module_count: u32,
        inverter_efficiency: f64,
        capacity_ac_kw: f64,
    ) -> Self {
        Self {
            params,
            module_count,
            inverter_efficiency,
            capacity_ac_kw,
            degradation_factor: 1.0,
        }
    }

    pub fn with_degradation(mut self, factor: f64) -> Self {
        self.degradation_factor = factor.clamp(0.0, 1.0);
        self
    }

    pub fn capacity_ac_kw(&self) -> f64 {
        self.capacity_ac_kw
    }

    /// DC array output in kW, floored at 0 and rounded to 3 decimals.
    pub fn dc_power_kw(&self, irradiance_wm2: f64, temperature_c: f64) -> f64 {
        let area = self.module_count as f64 * self.params.module_area_m2;
        let thermal = 1.0 + self.params.temperature_coefficient * (temperature_c - 25.0);
        let watts = irradiance_wm2 * area * self.params.module_efficiency * thermal;
        round_to((watts / 1000.0 * self.degradation_factor).max(0.0), 3)
    }

    /// Full conversion for one interval.
    ///
    /// AC power never exceeds the configured AC capacity.
    pub fn convert(&self, irradiance_wm2: f64, temperature_c: f64, interval_minutes: u32) -> PowerOutput {
        let dc = self.dc_power_kw(irradiance_wm2, temperature_c);
        let unclipped = dc * self.inverter_efficiency;
        let clipped = unclipped > self.capacity_ac_kw;
        let ac = round_to(unclipped.min(self.capacity_ac_kw), 3).min(self.capacity_ac_kw);
        PowerOutput {
            dc_power_kw: dc,
            ac_power_kw: ac,
            ac_energy_kwh: round_to(interval_energy_kwh(ac, interval_minutes), 3),
            clipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn model(capacity_ac_kw: f64) -> PowerConversionModel {
        PowerConversionModel::new(PowerModelParams::default(), 3000, 0.97, capacity_ac_kw)
    }

    #[test]
    fn test_stc_dc_power() {
        // 3000 × 1.7 m² × 20 % at 1000 W/m² and 25 °C.
        assert_eq!(model(5000.0).dc_power_kw(1000.0, 25.0), 1020.0);
    }

    #[test]
    fn test_heat_derates_output() {
        let m = model(5000.0);
        assert!(m.dc_power_kw(800.0, 45.0) < m.dc_power_kw(800.0, 25.0));
        assert!(m.dc_power_kw(800.0, 5.0) > m.dc_power_kw(800.0, 25.0));
    }

    #[test]
    fn test_ac_is_clipped_to_capacity() {
        let out = model(900.0).convert(1100.0, 10.0, 5);
        assert_eq!(out.ac_power_kw, 900.0);
        assert!(out.clipped);
        assert_eq!(out.ac_energy_kwh, 75.0);
    }

    #[test]
    fn test_energy_over_one_hour_equals_power() {
        let m = PowerConversionModel::new(PowerModelParams::default(), 1000, 1.0, 100.0);
        let out = m.convert(2000.0, 25.0, 60);
        assert_eq!(out.ac_power_kw, 100.0);
        assert_eq!(out.ac_energy_kwh, 100.0);
    }

    #[test]
    fn test_degradation_reduces_dc() {
        let fresh = model(5000.0);
        let aged = model(5000.0).with_degradation(0.9);
        assert_eq!(aged.dc_power_kw(1000.0, 25.0), 918.0);
        assert!(aged.dc_power_kw(500.0, 25.0) < fresh.dc_power_kw(500.0, 25.0));
    }

    proptest! {
        #[test]
        fn ac_power_within_bounds(
            irradiance in 0.0f64..1500.0,
            temperature in -10.0f64..50.0,
            capacity in 1.0f64..2000.0,
            interval in prop::sample::select(vec![1u32, 5, 10, 15, 30, 60]),
        ) {
            let out = model(capacity).convert(irradiance, temperature, interval);
            prop_assert!(out.ac_power_kw >= 0.0);
            prop_assert!(out.ac_power_kw <= capacity);
            prop_assert!(out.ac_energy_kwh >= 0.0);
            let expected = round_to(out.ac_power_kw * interval as f64 / 60.0, 3);
            prop_assert!((out.ac_energy_kwh - expected).abs() < 1e-9);
        }
    }
}
