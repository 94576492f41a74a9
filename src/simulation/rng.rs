//! # Seeded random source
//!
//! A small-state (4 × 32-bit) generator whose state is derived from the
//! SHA-256 of the seed. For a fixed seed the output is fixed only for a fixed
//! sequence of calls: every method consumes the stream, so adding, removing
//! or reordering a call shifts everything after it.

use std::f64::consts::PI;

use rand::RngCore;
use sha2::{Digest, Sha256};

const TWO_POW_32: f64 = 4_294_967_296.0;

/// Deterministic pseudo-random stream (SFC32 core).
#[derive(Debug, Clone)]
pub struct SeededRandom {
    a: u32,
    b: u32,
    c: u32,
    d: u32,
    spare_normal: Option<f64>,
}

impl SeededRandom {
    /// Generator for an integer seed.
    pub fn new(seed: u64) -> Self {
        Self::from_material(seed.to_string().as_bytes())
    }

    /// Independent stream for `seed` scoped to a context such as
    /// `"{site_id}:{day}"`.
    pub fn derive(seed: u64, context: &str) -> Self {
        Self::from_material(format!("{seed}:{context}").as_bytes())
    }

    fn from_material(material: &[u8]) -> Self {
        let digest = Sha256::digest(material);
        let word = |i: usize| {
            u32::from_be_bytes([digest[i], digest[i + 1], digest[i + 2], digest[i + 3]])
        };
        Self {
            a: word(0),
            b: word(4),
            c: word(8),
            d: word(12),
            spare_normal: None,
        }
    }

    fn step(&mut self) -> u32 {
        let t = self.a.wrapping_add(self.b);
        self.a = self.b ^ (self.b >> 9);
        self.b = self.c.wrapping_add(self.c << 3);
        self.c = self.c.rotate_left(21);
        self.d = self.d.wrapping_add(1);
        let t = t.wrapping_add(self.d);
        self.c = self.c.wrapping_add(t);
        t
    }

    /// Uniform value in `[0, 1)`.
    pub fn next(&mut self) -> f64 {
        self.step() as f64 / TWO_POW_32
    }

    /// Uniform value in `[min, max)`.
    pub fn range(&mut self, min: f64, max: f64) -> f64 {
        min + self.next() * (max - min)
    }

    /// Uniform integer in `[min, max]`, both ends inclusive. Reversed
    /// bounds are swapped.
    pub fn int(&mut self, min: i64, max: i64) -> i64 {
        let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
        let span = (i128::from(hi) - i128::from(lo) + 1) as f64;
        let offset = (self.next() * span).floor() as i128;
        (i128::from(lo) + offset).min(i128::from(hi)) as i64
    }

    /// `true` with probability `p`.
    pub fn boolean(&mut self, p: f64) -> bool {
        self.next() < p
    }

    /// Uniformly chosen element, `None` for an empty slice (which consumes
    /// no randomness).
    pub fn choice<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            return None;
        }
        let idx = self.int(0, items.len() as i64 - 1) as usize;
        items.get(idx)
    }

    /// Gaussian sample via Box–Muller. Each pair of uniforms yields two
    /// values; the second is cached and returned by the next call.
    pub fn normal(&mut self, mean: f64, std_dev: f64) -> f64 {
        if let Some(z) = self.spare_normal.take() {
            return mean + std_dev * z;
        }
        let u1 = 1.0 - self.next();
        let u2 = self.next();
        let magnitude = (-2.0 * u1.ln()).sqrt();
        let angle = 2.0 * PI * u2;
        self.spare_normal = Some(magnitude * angle.sin());
        mean + std_dev * magnitude * angle.cos()
    }
}

impl RngCore for SeededRandom {
    fn next_u32(&mut self) -> u32 {
        self.step()
    }

    fn next_u64(&mut self) -> u64 {
        let hi = self.step() as u64;
        let lo = self.step() as u64;
        (hi << 32) | lo
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(4) {
            let bytes = self.step().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::seq::SliceRandom;

    fn script(rng: &mut SeededRandom) -> Vec<f64> {
        vec![
            rng.next(),
            rng.range(-5.0, 5.0),
            rng.int(1, 6) as f64,
            if rng.boolean(0.3) { 1.0 } else { 0.0 },
            *rng.choice(&[10.0, 20.0, 30.0]).unwrap(),
            rng.normal(20.0, 2.0),
            rng.normal(20.0, 2.0),
            rng.normal(0.0, 1.0),
        ]
    }

    proptest! {
        #[test]
        fn same_seed_same_sequence(seed in any::<u64>()) {
            let mut a = SeededRandom::new(seed);
            let mut b = SeededRandom::new(seed);
            prop_assert_eq!(script(&mut a), script(&mut b));
        }

        #[test]
        fn next_stays_in_unit_interval(seed in any::<u64>()) {
            let mut rng = SeededRandom::new(seed);
            for _ in 0..256 {
                let v = rng.next();
                prop_assert!((0.0..1.0).contains(&v));
            }
        }

        #[test]
        fn int_is_inclusive_and_bounded(seed in any::<u64>(), min in -50i64..50, span in 0i64..20) {
            let mut rng = SeededRandom::new(seed);
            let max = min + span;
            for _ in 0..64 {
                let v = rng.int(min, max);
                prop_assert!(v >= min && v <= max);
            }
        }
    }

    #[test]
    fn test_different_seeds_diverge() {
        let mut a = SeededRandom::new(1);
        let mut b = SeededRandom::new(2);
        assert_ne!(script(&mut a), script(&mut b));
    }

    #[test]
    fn test_derived_streams_are_independent() {
        let mut a = SeededRandom::derive(42, "site-a:2024-06-21");
        let mut b = SeededRandom::derive(42, "site-b:2024-06-21");
        let mut a2 = SeededRandom::derive(42, "site-a:2024-06-21");
        let va: Vec<f64> = (0..8).map(|_| a.next()).collect();
        let vb: Vec<f64> = (0..8).map(|_| b.next()).collect();
        let va2: Vec<f64> = (0..8).map(|_| a2.next()).collect();
        assert_ne!(va, vb);
        assert_eq!(va, va2);
    }

    #[test]
    fn test_call_order_matters() {
        let mut a = SeededRandom::new(7);
        let mut b = SeededRandom::new(7);
        let _ = a.next();
        let x = a.range(0.0, 1.0);
        let y = b.range(0.0, 1.0);
        assert_ne!(x, y);
    }

    #[test]
    fn test_normal_caches_spare() {
        let mut rng = SeededRandom::new(99);
        let mut shadow = rng.clone();
        let _first = rng.normal(0.0, 1.0);
        let _second = rng.normal(0.0, 1.0);
        // Two normals consume exactly two uniforms.
        let _ = shadow.next();
        let _ = shadow.next();
        assert_eq!(rng.next(), shadow.next());
    }

    #[test]
    fn test_normal_moments() {
        let mut rng = SeededRandom::new(2024);
        let n = 20_000;
        let samples: Vec<f64> = (0..n).map(|_| rng.normal(10.0, 2.0)).collect();
        let mean = samples.iter().sum::<f64>() / n as f64;
        let var = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
        assert!((mean - 10.0).abs() < 0.1, "mean {mean}");
        assert!((var.sqrt() - 2.0).abs() < 0.1, "std {}", var.sqrt());
    }

    #[test]
    fn test_int_handles_extreme_and_reversed_bounds() {
        let mut rng = SeededRandom::new(42);
        for _ in 0..1000 {
            rng.int(i64::MIN, i64::MAX);
            let v = rng.int(10, -10);
            assert!((-10..=10).contains(&v), "{v}");
        }
        assert_eq!(rng.int(i64::MAX, i64::MAX), i64::MAX);
        assert_eq!(rng.int(i64::MIN, i64::MIN), i64::MIN);

        let mut forward = SeededRandom::new(7);
        let mut reversed = SeededRandom::new(7);
        assert_eq!(forward.int(3, 9), reversed.int(9, 3));
    }

    #[test]
    fn test_choice_on_empty_slice() {
        let mut rng = SeededRandom::new(1);
        let empty: [u8; 0] = [];
        assert!(rng.choice(&empty).is_none());
    }

    #[test]
    fn test_drives_rand_adapters_deterministically() {
        let mut items_a: Vec<u32> = (0..32).collect();
        let mut items_b = items_a.clone();
        items_a.shuffle(&mut SeededRandom::new(5));
        items_b.shuffle(&mut SeededRandom::new(5));
        assert_eq!(items_a, items_b);
    }
}
