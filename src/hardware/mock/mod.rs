//! Simulated instruments.
//!
//! - [`MockServo`]: hobby-servo chopper, range ±1000
//! - [`MockPowerMeter`]: power meter looking through the chopper
//! - [`MockCamera`]: camera imaging an autocorrelation trace
//!
//! All randomness comes from a seeded ChaCha generator so runs are
//! reproducible; failures are injected with a [`FaultPlan`].

mod camera;
mod faults;
mod power_meter;
mod servo;

use std::sync::{Mutex, PoisonError};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

pub use camera::{CameraScene, MockCamera};
pub use faults::{Fault, FaultPlan};
pub use power_meter::{BeamModel, MockPowerMeter};
pub use servo::{MockServo, SERVO_RANGE};

/// Seeded, thread-safe random source for the simulators.
pub struct SimRng {
    inner: Mutex<ChaCha8Rng>,
}

impl SimRng {
    /// `None` seeds from entropy.
    #[must_use]
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            inner: Mutex::new(rng),
        }
    }

    /// True with probability `rate`.
    pub fn should_fail(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        self.uniform() < rate
    }

    /// Uniform in `[0, 1)`.
    pub fn uniform(&self) -> f64 {
        let mut rng = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        rng.gen::<f64>()
    }

    /// Zero-mean noise with standard deviation `sigma` (Box-Muller).
    pub fn gaussian(&self, sigma: f64) -> f64 {
        if sigma <= 0.0 {
            return 0.0;
        }
        let mut rng = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = rng.gen();
        sigma * (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
    }
}

impl Default for SimRng {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for SimRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimRng").finish_non_exhaustive()
    }
}
