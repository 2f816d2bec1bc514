//! Autocorrelation analysis: frame reduction, Gaussian fitting and pulse
//! duration conversion.

pub mod gaussian_fit;
pub mod profile;
pub mod pulse_width;

pub use gaussian_fit::{fit_gaussian, FitOptions, GaussianFit, GaussianParams, InitialGuess};
pub use profile::{average_profile, parse_profile, AverageAxis};
pub use pulse_width::{
    fit_profile, ProfileFit, PulseDurationResult, PulseShape, PulseWidthEstimate,
    PulseWidthEstimator, GAUSSIAN_DECONVOLUTION, SECH2_DECONVOLUTION,
};
