//! Pulse-width estimation from an intensity autocorrelation trace.
//!
//! The autocorrelator images the trace on a camera. A Gaussian is fitted to
//! the profile (in pixels), its width is converted to time with the
//! calibration factor, and the result is divided back from autocorrelation
//! width to pulse width with the deconvolution factor of the assumed pulse
//! shape.

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use super::gaussian_fit::{fit_gaussian, FitOptions, GaussianParams};
use super::profile::{average_profile, AverageAxis};
use crate::error::AcquisitionError;
use crate::hardware::Frame;

/// Autocorrelation-to-pulse factor for Gaussian pulses.
pub const GAUSSIAN_DECONVOLUTION: f64 = 1.0 / 1.41;

/// Autocorrelation-to-pulse factor for sech² pulses.
pub const SECH2_DECONVOLUTION: f64 = 0.65;

/// Assumed temporal shape of the pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PulseShape {
    #[default]
    Gaussian,
    Sech2,
}

impl PulseShape {
    /// Build from the two mutually exclusive shape toggles.
    pub fn from_toggles(gaussian: bool, sech2: bool) -> Result<Self, AcquisitionError> {
        match (gaussian, sech2) {
            (true, false) => Ok(PulseShape::Gaussian),
            (false, true) => Ok(PulseShape::Sech2),
            (true, true) => Err(AcquisitionError::InvalidParameter(
                "Gaussian and sech² pulse shapes are mutually exclusive".into(),
            )),
            (false, false) => Err(AcquisitionError::InvalidParameter(
                "select a Gaussian or sech² pulse shape".into(),
            )),
        }
    }

    #[must_use]
    pub fn deconvolution_factor(self) -> f64 {
        match self {
            PulseShape::Gaussian => GAUSSIAN_DECONVOLUTION,
            PulseShape::Sech2 => SECH2_DECONVOLUTION,
        }
    }
}

impl std::fmt::Display for PulseShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PulseShape::Gaussian => write!(f, "gaussian"),
            PulseShape::Sech2 => write!(f, "sech2"),
        }
    }
}

/// Fit of one profile, in pixel units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileFit {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub params: GaussianParams,
    /// Row-major covariance of `(amplitude, center, width)`.
    pub covariance: [[f64; 3]; 3],
    /// Model evaluated at every `x`.
    pub fitted_curve: Vec<f64>,
    pub iterations: usize,
    pub residual_sum_squares: f64,
}

/// Pulse duration derived from a fitted width.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PulseDurationResult {
    pub width_pixels: f64,
    /// Time per pixel (fs/px for the autocorrelator).
    pub calibration_factor: f64,
    pub shape: PulseShape,
    pub shape_deconvolution_factor: f64,
    /// `width_pixels * calibration_factor * shape_deconvolution_factor`.
    pub duration: f64,
}

impl PulseDurationResult {
    /// Convert a fitted width. `pixel_to_time` must be finite and positive.
    pub fn from_width(
        width_pixels: f64,
        pixel_to_time: f64,
        shape: PulseShape,
    ) -> Result<Self, AcquisitionError> {
        check_calibration(pixel_to_time)?;
        let width_pixels = width_pixels.abs();
        let factor = shape.deconvolution_factor();
        Ok(Self {
            width_pixels,
            calibration_factor: pixel_to_time,
            shape,
            shape_deconvolution_factor: factor,
            duration: width_pixels * pixel_to_time * factor,
        })
    }
}

/// Profile fit plus derived duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulseWidthEstimate {
    pub fit: ProfileFit,
    pub duration: PulseDurationResult,
}

/// Gaussian-fit pulse-width estimator.
#[derive(Debug, Clone, Default)]
pub struct PulseWidthEstimator {
    options: FitOptions,
}

impl PulseWidthEstimator {
    /// Estimator with data-seeded Levenberg–Marquardt defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Estimator with custom solver settings.
    pub fn with_options(options: FitOptions) -> Result<Self, AcquisitionError> {
        options.validate()?;
        Ok(Self { options })
    }

    #[must_use]
    pub fn options(&self) -> &FitOptions {
        &self.options
    }

    /// Fit a 1-D profile sampled at pixels `0..len`.
    pub fn fit_profile(
        &self,
        profile: &[f64],
        shape: PulseShape,
        pixel_to_time: f64,
    ) -> Result<PulseWidthEstimate, AcquisitionError> {
        check_calibration(pixel_to_time)?;
        let x: Vec<f64> = (0..profile.len()).map(|i| i as f64).collect();
        let fit = fit_gaussian(&x, profile, &self.options)?;
        let duration = PulseDurationResult::from_width(fit.params.width, pixel_to_time, shape)?;

        let fitted_curve = x.iter().map(|&xi| fit.params.eval(xi)).collect();
        let c = &fit.covariance;
        let covariance = [
            [c[(0, 0)], c[(0, 1)], c[(0, 2)]],
            [c[(1, 0)], c[(1, 1)], c[(1, 2)]],
            [c[(2, 0)], c[(2, 1)], c[(2, 2)]],
        ];
        tracing::debug!(
            width_px = duration.width_pixels,
            duration = duration.duration,
            %shape,
            "pulse width estimated"
        );
        Ok(PulseWidthEstimate {
            fit: ProfileFit {
                x,
                y: profile.to_vec(),
                params: fit.params,
                covariance,
                fitted_curve,
                iterations: fit.iterations,
                residual_sum_squares: fit.residual_sum_squares,
            },
            duration,
        })
    }

    /// Average a `(rows, cols)` image along `axis`, then fit.
    pub fn fit_image(
        &self,
        image: ArrayView2<'_, f64>,
        axis: AverageAxis,
        shape: PulseShape,
        pixel_to_time: f64,
    ) -> Result<PulseWidthEstimate, AcquisitionError> {
        let profile = average_profile(image, axis)?;
        self.fit_profile(&profile.to_vec(), shape, pixel_to_time)
    }

    /// Reduce a camera frame, then fit.
    pub fn fit_frame(
        &self,
        frame: &Frame,
        axis: AverageAxis,
        shape: PulseShape,
        pixel_to_time: f64,
    ) -> Result<PulseWidthEstimate, AcquisitionError> {
        self.fit_image(frame.to_array().view(), axis, shape, pixel_to_time)
    }
}

/// Fit `profile` with default solver settings.
pub fn fit_profile(
    profile: &[f64],
    shape: PulseShape,
    pixel_to_time: f64,
) -> Result<PulseWidthEstimate, AcquisitionError> {
    PulseWidthEstimator::new().fit_profile(profile, shape, pixel_to_time)
}

fn check_calibration(pixel_to_time: f64) -> Result<(), AcquisitionError> {
    if pixel_to_time.is_finite() && pixel_to_time > 0.0 {
        Ok(())
    } else {
        Err(AcquisitionError::InvalidParameter(format!(
            "pixel-to-time factor must be > 0, got {pixel_to_time}"
        )))
    }
}
