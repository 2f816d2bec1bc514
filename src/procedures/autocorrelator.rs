//! Autocorrelator Procedure
//!
//! Estimates the pulse duration from camera images of an autocorrelation
//! trace. Each frame is averaged to a profile, fitted with a Gaussian and the
//! fitted width is converted to femtoseconds.
//!
//! # Configuration
//!
//! ```toml
//! [autocorrelator]
//! frames = 5
//! exposure_ms = 1.0
//! shape = "sech2"
//! average_axis = "vertical"
//! pixel_to_fs = 0.764
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::{
    Procedure, ProcedureContext, ProcedureProgress, ProcedureResult, ProcedureState,
    QualityMetrics, StepResult,
};
use crate::analysis::{AverageAxis, FitOptions, PulseShape, PulseWidthEstimate, PulseWidthEstimator};
use crate::error::AcquisitionError;
use crate::hardware::{ExposureControl, FrameProducer};
use crate::safety::CleanupRegistry;

/// Default calibration of the autocorrelator camera.
pub const DEFAULT_PIXEL_TO_FS: f64 = 0.764;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutocorrelatorConfig {
    /// Frames to acquire and fit
    #[serde(default = "default_frames")]
    pub frames: u32,

    /// Camera exposure in milliseconds
    #[serde(default = "default_exposure_ms")]
    pub exposure_ms: f64,

    #[serde(default)]
    pub shape: PulseShape,

    #[serde(default)]
    pub average_axis: AverageAxis,

    /// Femtoseconds per pixel
    #[serde(default = "default_pixel_to_fs")]
    pub pixel_to_fs: f64,

    /// Report the achieved frame rate
    #[serde(default = "default_compute_fps")]
    pub compute_fps: bool,

    #[serde(default)]
    pub fit: FitOptions,
}

fn default_frames() -> u32 {
    1
}
fn default_exposure_ms() -> f64 {
    1.0
}
fn default_pixel_to_fs() -> f64 {
    DEFAULT_PIXEL_TO_FS
}
fn default_compute_fps() -> bool {
    true
}

impl Default for AutocorrelatorConfig {
    fn default() -> Self {
        Self {
            frames: default_frames(),
            exposure_ms: default_exposure_ms(),
            shape: PulseShape::default(),
            average_axis: AverageAxis::default(),
            pixel_to_fs: default_pixel_to_fs(),
            compute_fps: default_compute_fps(),
            fit: FitOptions::default(),
        }
    }
}

impl AutocorrelatorConfig {
    /// Apply the shape and averaging toggle pairs.
    pub fn with_toggles(
        mut self,
        gaussian: bool,
        sech2: bool,
        vertical: bool,
        horizontal: bool,
    ) -> Result<Self, AcquisitionError> {
        self.shape = PulseShape::from_toggles(gaussian, sech2)?;
        self.average_axis = AverageAxis::from_toggles(vertical, horizontal)?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), AcquisitionError> {
        if self.frames == 0 {
            return Err(AcquisitionError::InvalidParameter(
                "frames must be at least 1".into(),
            ));
        }
        if !(self.exposure_ms.is_finite() && self.exposure_ms > 0.0) {
            return Err(AcquisitionError::InvalidParameter(format!(
                "exposure must be > 0 ms, got {}",
                self.exposure_ms
            )));
        }
        if !(self.pixel_to_fs.is_finite() && self.pixel_to_fs > 0.0) {
            return Err(AcquisitionError::InvalidParameter(format!(
                "pixel_to_fs must be > 0, got {}",
                self.pixel_to_fs
            )));
        }
        self.fit.validate()
    }
}

// =============================================================================
// Procedure
// =============================================================================

/// Pulse-width measurement on an autocorrelator camera.
pub struct AutocorrelatorProcedure {
    config: AutocorrelatorConfig,
    camera: Arc<dyn FrameProducer>,
    exposure: Option<Arc<dyn ExposureControl>>,
    estimator: PulseWidthEstimator,
    state: ProcedureState,
    cleanup: CleanupRegistry,
}

impl AutocorrelatorProcedure {
    pub fn new(config: AutocorrelatorConfig, camera: Arc<dyn FrameProducer>) -> Self {
        let mut cleanup = CleanupRegistry::new();
        let cam = camera.clone();
        cleanup.register(
            "release camera",
            Box::new(move || {
                Box::pin(async move {
                    if let Err(err) = cam.stop().await {
                        tracing::warn!(error = %err, "failed to stop camera");
                    }
                    if let Err(err) = cam.close().await {
                        tracing::warn!(error = %err, "failed to close camera");
                    }
                })
            }),
        );

        Self {
            config,
            camera,
            exposure: None,
            estimator: PulseWidthEstimator::new(),
            state: ProcedureState::Idle,
            cleanup,
        }
    }

    #[must_use]
    pub fn with_exposure_control(mut self, exposure: Arc<dyn ExposureControl>) -> Self {
        self.exposure = Some(exposure);
        self
    }

    #[must_use]
    pub fn config(&self) -> &AutocorrelatorConfig {
        &self.config
    }

    async fn measure_frame(&self) -> Result<PulseWidthEstimate> {
        let frame = self
            .camera
            .acquire_frame()
            .await
            .map_err(AcquisitionError::SensorFault)?;
        let estimate = self.estimator.fit_frame(
            &frame,
            self.config.average_axis,
            self.config.shape,
            self.config.pixel_to_fs,
        )?;
        Ok(estimate)
    }
}

fn is_fit_failure(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<AcquisitionError>(),
        Some(AcquisitionError::FitDiverged(_) | AcquisitionError::DegenerateInput(_))
    )
}

#[async_trait]
impl Procedure for AutocorrelatorProcedure {
    fn type_id(&self) -> &str {
        "autocorrelator"
    }

    fn state(&self) -> ProcedureState {
        self.state
    }

    async fn validate(&mut self, _ctx: &ProcedureContext) -> Result<Vec<String>> {
        self.state = ProcedureState::Validating;
        self.config.validate()?;
        self.estimator = PulseWidthEstimator::with_options(self.config.fit)?;

        let mut warnings = Vec::new();
        if self.exposure.is_none() {
            warnings.push("camera has no exposure control; exposure not applied".to_string());
        }
        Ok(warnings)
    }

    async fn prepare(&mut self, _ctx: &ProcedureContext) -> Result<()> {
        self.state = ProcedureState::Preparing;
        if let Some(exposure) = &self.exposure {
            exposure
                .set_exposure(self.config.exposure_ms / 1000.0)
                .await
                .map_err(AcquisitionError::SensorFault)
                .context("failed to set camera exposure")?;
            tracing::info!(exposure_ms = self.config.exposure_ms, "camera exposure set");
        }
        Ok(())
    }

    async fn execute(&mut self, ctx: &ProcedureContext) -> Result<ProcedureResult> {
        self.state = ProcedureState::Running;
        let total = self.config.frames as usize;
        let started = Instant::now();

        let mut estimates: Vec<PulseWidthEstimate> = Vec::with_capacity(total);
        let mut steps = Vec::with_capacity(total);
        let mut last_error = None;

        for index in 0..total {
            if ctx.is_cancelled() {
                self.state = ProcedureState::Cancelled;
                let reason = ctx.stop_flag().reason().unwrap_or_else(|| "stop requested".into());
                return Err(AcquisitionError::Cancelled(reason).into());
            }

            match self.measure_frame().await {
                Ok(estimate) => {
                    steps.push(
                        StepResult::success(format!("frame {}", index + 1), index)
                            .with_data("duration_fs", estimate.duration.duration)
                            .with_data("width_px", estimate.duration.width_pixels),
                    );
                    estimates.push(estimate);
                }
                Err(err) if is_fit_failure(&err) => {
                    tracing::warn!(frame = index + 1, error = %err, "fit failed, frame skipped");
                    steps.push(StepResult::failure(
                        format!("frame {}", index + 1),
                        index,
                        err.to_string(),
                    ));
                    last_error = Some(err);
                }
                Err(err) => {
                    self.state = ProcedureState::Failed;
                    return Err(err);
                }
            }
            ctx.update_progress(ProcedureProgress::running(
                index + 1,
                total,
                format!("frame {}/{total}", index + 1),
            ));
        }

        let Some(last) = estimates.last() else {
            self.state = ProcedureState::Failed;
            return Err(last_error.unwrap_or_else(|| {
                AcquisitionError::DegenerateInput("no frames acquired".into()).into()
            }));
        };

        let durations: Vec<f64> = estimates.iter().map(|e| e.duration.duration).collect();
        let mean = durations.iter().sum::<f64>() / durations.len() as f64;
        let failed = total - estimates.len();

        let mut quality = QualityMetrics::default();
        if failed == 0 {
            quality.add_pass("fits", format!("{total} of {total} frames fitted"));
        } else {
            quality.add_warning(
                "fits",
                format!("{failed} of {total} frames could not be fitted"),
            );
        }

        let params = last.fit.params;
        let std_errors: Vec<f64> = (0..3).map(|i| last.fit.covariance[i][i].max(0.0).sqrt()).collect();
        let mut result = ProcedureResult::success("autocorrelator", ctx.procedure_id.clone())
            .with_quality(quality)
            .with_data("duration_fs", last.duration.duration)
            .with_data("mean_duration_fs", mean)
            .with_data("durations_fs", durations)
            .with_data("shape", self.config.shape.to_string())
            .with_data("fit_amplitude", params.amplitude)
            .with_data("fit_center_px", params.center)
            .with_data("fit_width_px", last.duration.width_pixels)
            .with_data("fit_std_errors", std_errors)
            .with_data("profile", last.fit.y.clone())
            .with_data("fitted_curve", last.fit.fitted_curve.clone())
            .with_data("frames_fitted", estimates.len())
            .with_data("frames_failed", failed);
        if failed > 0 {
            result = result.with_warning(format!("{failed} frames skipped after failed fits"));
        }
        if self.config.compute_fps {
            let elapsed = started.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                result = result.with_data("fps", total as f64 / elapsed);
            }
        }
        for step in steps {
            result = result.with_step(step);
        }

        tracing::info!(
            duration_fs = last.duration.duration,
            frames = total,
            shape = %self.config.shape,
            "autocorrelation measurement complete"
        );
        Ok(result)
    }

    async fn finalize(&mut self, _ctx: &ProcedureContext) -> Result<()> {
        let previous = self.state;
        self.state = ProcedureState::Finalizing;
        self.cleanup.run_all().await;
        self.state = match previous {
            ProcedureState::Running => ProcedureState::Completed,
            ProcedureState::Cancelled => ProcedureState::Cancelled,
            _ => ProcedureState::Failed,
        };
        Ok(())
    }
}
