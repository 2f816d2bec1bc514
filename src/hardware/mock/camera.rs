//! Simulated camera looking at an autocorrelator output.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{FaultPlan, SimRng};
use crate::error::{DeviceError, DeviceErrorKind, DeviceResult};
use crate::hardware::{ExposureControl, Frame, FrameProducer};

const REFERENCE_EXPOSURE_S: f64 = 0.01;

/// Autocorrelation trace imaged by the camera, in pixel units and counts at
/// a 10 ms exposure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraScene {
    pub amplitude: f64,
    pub center_px: f64,
    /// `w` in `a * exp(-(x - x0)^2 / w^2)`.
    pub width_px: f64,
    pub background: f64,
    pub noise: f64,
    /// Trace varies along rows instead of columns.
    pub transposed: bool,
}

impl Default for CameraScene {
    fn default() -> Self {
        Self {
            amplitude: 2000.0,
            center_px: 128.0,
            width_px: 20.0,
            background: 0.0,
            noise: 5.0,
            transposed: false,
        }
    }
}

/// Camera producing one synthetic frame per exposure.
#[derive(Debug, Clone)]
pub struct MockCamera {
    width: u32,
    height: u32,
    scene: CameraScene,
    exposure_s: Arc<Mutex<f64>>,
    rng: Arc<SimRng>,
    faults: FaultPlan,
    frames: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl MockCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            scene: CameraScene::default(),
            exposure_s: Arc::new(Mutex::new(REFERENCE_EXPOSURE_S)),
            rng: Arc::new(SimRng::new(Some(0))),
            faults: FaultPlan::new(),
            frames: Arc::new(AtomicU64::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn with_scene(mut self, scene: CameraScene) -> Self {
        self.scene = scene;
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
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn current_exposure(&self) -> f64 {
        *self.exposure_s.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn render(&self, exposure_s: f64) -> Vec<u16> {
        let gain = exposure_s / REFERENCE_EXPOSURE_S;
        let scene = self.scene;
        let mut pixels = Vec::with_capacity(self.width as usize * self.height as usize);
        for row in 0..self.height {
            for col in 0..self.width {
                let x = if scene.transposed { row } else { col };
                let dx = f64::from(x) - scene.center_px;
                let trace = scene.amplitude * (-(dx * dx) / (scene.width_px * scene.width_px)).exp();
                let value = (trace + scene.background) * gain + self.rng.gaussian(scene.noise);
                pixels.push(value.round().clamp(0.0, f64::from(u16::MAX)) as u16);
            }
        }
        pixels
    }
}

#[async_trait]
impl FrameProducer for MockCamera {
    async fn acquire_frame(&self) -> DeviceResult<Frame> {
        if self.is_closed() {
            return Err(DeviceError::new(
                "mock_camera",
                DeviceErrorKind::Closed,
                "camera is closed",
            ));
        }
        self.faults.check("mock_camera", "acquire_frame")?;
        let exposure = self.current_exposure();
        tokio::time::sleep(Duration::from_secs_f64(exposure)).await;

        let pixels = self.render(exposure);
        let frame = Frame::new(self.width, self.height, pixels).ok_or_else(|| {
            DeviceError::new("mock_camera", DeviceErrorKind::Hardware, "frame size mismatch")
        })?;
        self.frames.fetch_add(1, Ordering::SeqCst);
        Ok(frame)
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn frame_count(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }

    async fn close(&self) -> DeviceResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ExposureControl for MockCamera {
    async fn set_exposure(&self, seconds: f64) -> DeviceResult<()> {
        if !(seconds.is_finite() && seconds > 0.0) {
            return Err(DeviceError::new(
                "mock_camera",
                DeviceErrorKind::InvalidParameter,
                format!("exposure must be > 0 s, got {seconds}"),
            ));
        }
        *self.exposure_s.lock().unwrap_or_else(PoisonError::into_inner) = seconds;
        Ok(())
    }

    async fn exposure(&self) -> DeviceResult<f64> {
        Ok(self.current_exposure())
    }
}
