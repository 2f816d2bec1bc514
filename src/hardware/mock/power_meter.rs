//! Simulated power meter behind a beam chopper.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{FaultPlan, MockServo, SimRng};
use crate::error::{DeviceError, DeviceErrorKind, DeviceResult};
use crate::hardware::{Readable, WavelengthTunable};

/// What the detector sees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeamModel {
    /// Power added when the chopper lets the beam through, in W.
    pub signal_w: f64,
    /// Power always present (room light, dark offset), in W.
    pub background_w: f64,
    /// Standard deviation of the additive read noise, in W.
    pub noise_w: f64,
}

impl Default for BeamModel {
    fn default() -> Self {
        Self {
            signal_w: 1.0e-3,
            background_w: 5.0e-5,
            noise_w: 1.0e-6,
        }
    }
}

/// Power meter that reports `background + signal` while the watched servo is
/// on the positive side of its range and `background` otherwise.
#[derive(Debug, Clone)]
pub struct MockPowerMeter {
    name: String,
    beam: BeamModel,
    chopper: Option<MockServo>,
    wavelength_range: (f64, f64),
    wavelength: Arc<Mutex<f64>>,
    rng: Arc<SimRng>,
    faults: FaultPlan,
    reads: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl MockPowerMeter {
    /// Meter with the default beam, no chopper and 532 nm applied.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            beam: BeamModel::default(),
            chopper: None,
            wavelength_range: (400.0, 1100.0),
            wavelength: Arc::new(Mutex::new(532.0)),
            rng: Arc::new(SimRng::new(Some(0))),
            faults: FaultPlan::new(),
            reads: Arc::new(AtomicU64::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn with_beam(mut self, beam: BeamModel) -> Self {
        self.beam = beam;
        self
    }

    /// Gate the beam with `servo`.
    #[must_use]
    pub fn with_chopper(mut self, servo: MockServo) -> Self {
        self.chopper = Some(servo);
        self
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Arc::new(SimRng::new(Some(seed)));
        self
    }

    #[must_use]
    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    #[must_use]
    pub fn with_wavelength_range(mut self, min_nm: f64, max_nm: f64) -> Self {
        self.wavelength_range = (min_nm, max_nm);
        self
    }

    /// Successful reads so far.
    #[must_use]
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn beam_open(&self) -> bool {
        self.chopper
            .as_ref()
            .map_or(true, |servo| servo.current_position() > 0.0)
    }

    fn ensure_open(&self) -> DeviceResult<()> {
        if self.is_closed() {
            return Err(DeviceError::new(
                &self.name,
                DeviceErrorKind::Closed,
                "power meter is closed",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Readable for MockPowerMeter {
    async fn read(&self) -> DeviceResult<f64> {
        self.ensure_open()?;
        self.faults.check(&self.name, "read")?;
        let mut power = self.beam.background_w;
        if self.beam_open() {
            power += self.beam.signal_w;
        }
        power += self.rng.gaussian(self.beam.noise_w);
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(power)
    }

    async fn close(&self) -> DeviceResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl WavelengthTunable for MockPowerMeter {
    async fn set_wavelength(&self, nm: f64) -> DeviceResult<f64> {
        self.ensure_open()?;
        self.faults.check(&self.name, "set_wavelength")?;
        if !nm.is_finite() {
            return Err(DeviceError::new(
                &self.name,
                DeviceErrorKind::InvalidParameter,
                format!("wavelength {nm} is not finite"),
            ));
        }
        let (min, max) = self.wavelength_range;
        let applied = nm.clamp(min, max);
        *self.wavelength.lock().unwrap_or_else(PoisonError::into_inner) = applied;
        Ok(applied)
    }

    async fn wavelength(&self) -> DeviceResult<f64> {
        self.ensure_open()?;
        Ok(*self.wavelength.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn wavelength_range(&self) -> (f64, f64) {
        self.wavelength_range
    }
}
