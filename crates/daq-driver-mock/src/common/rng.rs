//! Seeded RNG wrapper for reproducible behavior.
//!
//! Mock devices draw failure decisions and readback noise from a
//! [`MockRng`] so a seeded test replays the same sequence every run.

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Seeded RNG wrapper for reproducible random behavior
pub struct MockRng {
    inner: Mutex<ChaCha8Rng>,
}

impl MockRng {
    /// Create a new RNG. `None` seeds from the OS.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            inner: Mutex::new(rng),
        }
    }

    /// True with probability `rate` (clamped to `[0, 1]`).
    pub fn should_fail(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        self.inner.lock().r#gen::<f64>() < rate
    }

    /// Uniform value in `[0.0, 1.0)`.
    pub fn next_f64(&self) -> f64 {
        self.inner.lock().r#gen()
    }

    /// Uniform noise in `[-amplitude, amplitude]`. Zero amplitude draws nothing.
    pub fn noise(&self, amplitude: f64) -> f64 {
        if amplitude <= 0.0 || !amplitude.is_finite() {
            return 0.0;
        }
        self.inner.lock().gen_range(-amplitude..=amplitude)
    }
}

impl Default for MockRng {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for MockRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRng").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_rng_deterministic() {
        let rng1 = MockRng::new(Some(42));
        let rng2 = MockRng::new(Some(42));

        for _ in 0..10 {
            assert_eq!(rng1.noise(0.5), rng2.noise(0.5));
        }
    }

    #[test]
    fn test_should_fail_bounds() {
        let rng = MockRng::new(Some(7));
        for _ in 0..100 {
            assert!(!rng.should_fail(0.0));
            assert!(rng.should_fail(1.0));
        }
    }

    #[test]
    fn test_should_fail_probability() {
        let rng = MockRng::new(Some(42));
        let failures = (0..10_000).filter(|_| rng.should_fail(0.3)).count();
        assert!((2700..3300).contains(&failures), "got {} failures", failures);
    }

    #[test]
    fn test_noise_amplitude() {
        let rng = MockRng::new(Some(3));
        for _ in 0..1000 {
            let n = rng.noise(0.02);
            assert!((-0.02..=0.02).contains(&n));
        }
        assert_eq!(rng.noise(0.0), 0.0);
        assert_eq!(rng.noise(f64::NAN), 0.0);
    }
}
