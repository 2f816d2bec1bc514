//! Pulse-width estimation on synthetic profiles and simulated camera frames.

mod common;

use common::gaussian_profile;
use thorlabs_daq::analysis::{
    fit_profile, AverageAxis, FitOptions, GaussianParams, InitialGuess, PulseShape,
    PulseWidthEstimator, GAUSSIAN_DECONVOLUTION,
};
use thorlabs_daq::hardware::mock::{CameraScene, MockCamera};
use thorlabs_daq::hardware::FrameProducer;
use thorlabs_daq::AcquisitionError;

fn within(actual: f64, expected: f64, rel: f64) -> bool {
    (actual - expected).abs() <= rel * expected.abs()
}

#[test]
fn noiseless_gaussian_is_recovered() {
    let k = 0.764;
    let profile = gaussian_profile(5.0, 20.0, 3.0, 50);
    let estimate = fit_profile(&profile, PulseShape::Gaussian, k).unwrap();

    let p = estimate.fit.params;
    assert!(within(p.amplitude, 5.0, 0.01), "amplitude {}", p.amplitude);
    assert!(within(p.center, 20.0, 0.01), "center {}", p.center);
    assert!(within(p.width, 3.0, 0.01), "width {}", p.width);

    let expected = 3.0 * k * GAUSSIAN_DECONVOLUTION;
    assert!(within(estimate.duration.duration, expected, 0.01));
    assert!(within(estimate.duration.duration, 3.0 * k / 1.41, 0.01));
    assert_eq!(estimate.duration.shape, PulseShape::Gaussian);
}

#[test]
fn sech2_uses_its_own_factor() {
    let profile = gaussian_profile(5.0, 20.0, 3.0, 50);
    let gaussian = fit_profile(&profile, PulseShape::Gaussian, 1.0).unwrap();
    let sech2 = fit_profile(&profile, PulseShape::Sech2, 1.0).unwrap();

    assert_eq!(gaussian.fit.params, sech2.fit.params);
    let ratio = sech2.duration.duration / gaussian.duration.duration;
    assert!((ratio - 0.65 * 1.41).abs() < 1e-12);
}

#[test]
fn three_points_are_degenerate() {
    let err = fit_profile(&[1.0, 2.0, 1.0], PulseShape::Gaussian, 1.0).unwrap_err();
    assert!(matches!(err, AcquisitionError::DegenerateInput(_)));
}

#[test]
fn all_zero_profile_diverges() {
    let err = fit_profile(&[0.0; 32], PulseShape::Gaussian, 1.0).unwrap_err();
    assert!(matches!(err, AcquisitionError::FitDiverged(_)));
}

#[test]
fn non_finite_profile_is_degenerate() {
    let mut profile = gaussian_profile(5.0, 10.0, 2.0, 20);
    profile[4] = f64::NAN;
    let err = fit_profile(&profile, PulseShape::Gaussian, 1.0).unwrap_err();
    assert!(matches!(err, AcquisitionError::DegenerateInput(_)));
}

#[test]
fn invalid_calibration_is_rejected_before_fitting() {
    let profile = gaussian_profile(5.0, 20.0, 3.0, 50);
    let err = fit_profile(&profile, PulseShape::Gaussian, 0.0).unwrap_err();
    assert!(matches!(err, AcquisitionError::InvalidParameter(_)));
}

#[test]
fn fixed_unit_guess_converges_near_its_start() {
    let profile = gaussian_profile(2.0, 1.5, 1.2, 10);
    let options = FitOptions::default().with_initial_guess(InitialGuess::Fixed(GaussianParams::UNIT));
    let estimator = PulseWidthEstimator::with_options(options).unwrap();
    let estimate = estimator
        .fit_profile(&profile, PulseShape::Gaussian, 1.0)
        .unwrap();

    let p = estimate.fit.params;
    assert!(within(p.amplitude, 2.0, 0.01), "amplitude {}", p.amplitude);
    assert!(within(p.center, 1.5, 0.01), "center {}", p.center);
    assert!(within(p.width, 1.2, 0.01), "width {}", p.width);
}

#[test]
fn covariance_is_small_for_clean_data() {
    // Deterministic ripple so the residuals are not exactly zero.
    let profile: Vec<f64> = gaussian_profile(5.0, 20.0, 3.0, 50)
        .iter()
        .enumerate()
        .map(|(i, v)| v + 1e-3 * (i as f64 * 1.7).sin())
        .collect();
    let estimate = fit_profile(&profile, PulseShape::Gaussian, 1.0).unwrap();
    let c = estimate.fit.covariance;
    for (i, row) in c.iter().enumerate() {
        assert!(row[i] >= 0.0);
        assert!(row[i].sqrt() < 0.01, "std error {i} = {}", row[i].sqrt());
    }
    assert!(estimate.fit.residual_sum_squares > 0.0);
}

#[tokio::test(start_paused = true)]
async fn camera_frame_is_averaged_along_the_chosen_axis() {
    let scene = CameraScene {
        amplitude: 1000.0,
        center_px: 32.0,
        width_px: 6.0,
        background: 0.0,
        noise: 0.0,
        transposed: false,
    };
    let camera = MockCamera::new(64, 16).with_scene(scene);
    let frame = camera.acquire_frame().await.unwrap();
    let estimator = PulseWidthEstimator::new();

    let vertical = estimator
        .fit_frame(&frame, AverageAxis::Vertical, PulseShape::Gaussian, 0.764)
        .unwrap();
    assert_eq!(vertical.fit.y.len(), 64);
    assert!(within(vertical.fit.params.center, 32.0, 0.01));
    assert!(within(vertical.duration.width_pixels, 6.0, 0.01));

    // Every row carries the same trace, so the row means are flat.
    let err = estimator
        .fit_frame(&frame, AverageAxis::Horizontal, PulseShape::Gaussian, 0.764)
        .unwrap_err();
    assert!(matches!(err, AcquisitionError::FitDiverged(_)));
}

#[tokio::test(start_paused = true)]
async fn transposed_trace_needs_horizontal_averaging() {
    let scene = CameraScene {
        amplitude: 1000.0,
        center_px: 20.0,
        width_px: 5.0,
        noise: 0.0,
        transposed: true,
        ..CameraScene::default()
    };
    let camera = MockCamera::new(8, 40).with_scene(scene);
    let frame = camera.acquire_frame().await.unwrap();

    let estimate = PulseWidthEstimator::new()
        .fit_frame(&frame, AverageAxis::Horizontal, PulseShape::Sech2, 1.0)
        .unwrap();
    assert_eq!(estimate.fit.y.len(), 40);
    assert!(within(estimate.duration.width_pixels, 5.0, 0.01));
    assert!(within(estimate.duration.duration, 5.0 * 0.65, 0.01));
}
