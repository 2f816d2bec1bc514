//! Least-squares fit of `f(x) = a * exp(-(x - x0)^2 / w^2)`.
//!
//! Levenberg–Marquardt with Marquardt's diagonal scaling: each iteration
//! solves `(JᵀJ + λ·diag(JᵀJ)) δ = Jᵀr` by Cholesky, accepts the step when
//! the residual sum of squares drops (and relaxes λ), otherwise stiffens λ
//! and retries. Parameter covariance is `(JᵀJ)⁻¹ · SSE / (n - 3)`.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::AcquisitionError;

/// Fewest points a 3-parameter fit accepts.
pub const MIN_POINTS: usize = 4;

const LAMBDA_MAX: f64 = 1e16;
const LAMBDA_MIN: f64 = 1e-12;
const RCOND_MIN: f64 = 1e-14;

/// Parameters of the Gaussian model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaussianParams {
    pub amplitude: f64,
    pub center: f64,
    /// `w` in `exp(-(x - x0)^2 / w^2)`, not the standard deviation.
    pub width: f64,
}

impl GaussianParams {
    /// `(1, 1, 1)`, the fixed starting point of older fitting code.
    pub const UNIT: Self = Self {
        amplitude: 1.0,
        center: 1.0,
        width: 1.0,
    };

    #[must_use]
    pub fn new(amplitude: f64, center: f64, width: f64) -> Self {
        Self {
            amplitude,
            center,
            width,
        }
    }

    /// Model value at `x`.
    #[must_use]
    pub fn eval(&self, x: f64) -> f64 {
        let d = x - self.center;
        self.amplitude * (-(d * d) / (self.width * self.width)).exp()
    }

    /// Full width at half maximum, `2·√ln2·|w|`.
    #[must_use]
    pub fn fwhm(&self) -> f64 {
        2.0 * std::f64::consts::LN_2.sqrt() * self.width.abs()
    }

    fn to_vector(self) -> Vector3<f64> {
        Vector3::new(self.amplitude, self.center, self.width)
    }

    fn from_vector(v: &Vector3<f64>) -> Self {
        Self::new(v[0], v[1], v[2])
    }

    fn is_finite(&self) -> bool {
        self.amplitude.is_finite() && self.center.is_finite() && self.width.is_finite()
    }
}

/// Where the solver starts.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialGuess {
    /// Peak position and height from the data, width from its half maximum.
    #[default]
    FromData,
    /// Start from the given parameters.
    Fixed(GaussianParams),
}

/// Solver settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitOptions {
    pub initial_guess: InitialGuess,
    pub max_iterations: usize,
    /// Stop when an accepted step lowers SSE by less than `ftol · SSE`.
    pub ftol: f64,
    /// Stop when the step is smaller than `xtol · (xtol + |p|)`.
    pub xtol: f64,
    /// Starting damping factor.
    pub initial_lambda: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            initial_guess: InitialGuess::FromData,
            max_iterations: 400,
            ftol: 1.49012e-8,
            xtol: 1.49012e-8,
            initial_lambda: 1e-3,
        }
    }
}

impl FitOptions {
    #[must_use]
    pub fn with_initial_guess(mut self, guess: InitialGuess) -> Self {
        self.initial_guess = guess;
        self
    }

    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn validate(&self) -> Result<(), AcquisitionError> {
        if self.max_iterations == 0 {
            return Err(AcquisitionError::InvalidParameter(
                "max_iterations must be at least 1".into(),
            ));
        }
        for (name, value) in [
            ("ftol", self.ftol),
            ("xtol", self.xtol),
            ("initial_lambda", self.initial_lambda),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(AcquisitionError::InvalidParameter(format!(
                    "{name} must be > 0, got {value}"
                )));
            }
        }
        if let InitialGuess::Fixed(p) = self.initial_guess {
            if !p.is_finite() || p.width == 0.0 {
                return Err(AcquisitionError::InvalidParameter(
                    "initial guess must be finite with non-zero width".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Converged fit.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianFit {
    /// Fitted parameters, `width` reported as `|w|`.
    pub params: GaussianParams,
    /// Covariance of `(amplitude, center, width)`.
    pub covariance: Matrix3<f64>,
    pub iterations: usize,
    pub residual_sum_squares: f64,
}

impl GaussianFit {
    /// One-sigma parameter uncertainties.
    #[must_use]
    pub fn std_errors(&self) -> [f64; 3] {
        let d = self.covariance.diagonal();
        [d[0].sqrt(), d[1].sqrt(), d[2].sqrt()]
    }
}

/// Fit the Gaussian model to `(x, y)`.
///
/// # Errors
/// - `DegenerateInput` for fewer than [`MIN_POINTS`] points, mismatched
///   lengths or non-finite values
/// - `FitDiverged` for a profile without dynamic range, a solver that does
///   not converge, or a singular covariance
/// - `InvalidParameter` for invalid `options`
pub fn fit_gaussian(
    x: &[f64],
    y: &[f64],
    options: &FitOptions,
) -> Result<GaussianFit, AcquisitionError> {
    options.validate()?;
    if x.len() != y.len() {
        return Err(AcquisitionError::DegenerateInput(format!(
            "x has {} points, y has {}",
            x.len(),
            y.len()
        )));
    }
    let n = y.len();
    if n < MIN_POINTS {
        return Err(AcquisitionError::DegenerateInput(format!(
            "need at least {MIN_POINTS} points for a 3-parameter fit, got {n}"
        )));
    }
    if x.iter().chain(y).any(|v| !v.is_finite()) {
        return Err(AcquisitionError::DegenerateInput(
            "profile contains non-finite values".into(),
        ));
    }
    let (lo, hi) = y
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if hi - lo <= 0.0 {
        return Err(AcquisitionError::FitDiverged(format!(
            "profile is flat (all values {lo})"
        )));
    }

    let start = match options.initial_guess {
        InitialGuess::FromData => guess_from_data(x, y),
        InitialGuess::Fixed(p) => p,
    };
    tracing::trace!(?start, n, "starting Gaussian fit");

    let mut p = start.to_vector();
    let mut sse = sum_squares(x, y, &p);
    let mut lambda = options.initial_lambda;

    for iteration in 1..=options.max_iterations {
        let (jtj, jtr) = normal_equations(x, y, &p);

        let floor = (jtj.diagonal().max() * 1e-12).max(f64::MIN_POSITIVE);
        let mut accepted = None;
        while lambda <= LAMBDA_MAX {
            let mut damped = jtj;
            for i in 0..3 {
                damped[(i, i)] += lambda * jtj[(i, i)].max(floor);
            }
            let Some(delta) = damped.cholesky().map(|c| c.solve(&jtr)) else {
                lambda *= 10.0;
                continue;
            };
            if delta.norm() <= options.xtol * (options.xtol + p.norm()) {
                return finish(x, y, p, sse, iteration);
            }
            let candidate = p + delta;
            let candidate_sse = sum_squares(x, y, &candidate);
            if candidate_sse.is_finite() && candidate_sse < sse {
                accepted = Some((candidate, candidate_sse));
                lambda = (lambda / 10.0).max(LAMBDA_MIN);
                break;
            }
            lambda *= 10.0;
        }

        let Some((next, next_sse)) = accepted else {
            return Err(AcquisitionError::FitDiverged(format!(
                "damping exceeded {LAMBDA_MAX:e} without reducing residuals (iteration {iteration})"
            )));
        };
        let reduction = sse - next_sse;
        p = next;
        sse = next_sse;
        if sse == 0.0 || reduction <= options.ftol * (sse + reduction) {
            return finish(x, y, p, sse, iteration);
        }
    }

    Err(AcquisitionError::FitDiverged(format!(
        "no convergence after {} iterations (SSE={sse:.6e})",
        options.max_iterations
    )))
}

fn finish(
    x: &[f64],
    y: &[f64],
    p: Vector3<f64>,
    sse: f64,
    iterations: usize,
) -> Result<GaussianFit, AcquisitionError> {
    let params = GaussianParams::from_vector(&p);
    if !params.is_finite() {
        return Err(AcquisitionError::FitDiverged(
            "fit produced non-finite parameters".into(),
        ));
    }
    if params.width.abs() <= f64::EPSILON {
        return Err(AcquisitionError::FitDiverged("fitted width is zero".into()));
    }

    let (jtj, _) = normal_equations(x, y, &p);
    let singular = jtj.svd(false, false).singular_values;
    let s_max = singular.max();
    if s_max.is_nan() || s_max <= 0.0 || singular.min() <= s_max * RCOND_MIN {
        return Err(AcquisitionError::FitDiverged(
            "parameter covariance is singular".into(),
        ));
    }
    let inverse = jtj.try_inverse().ok_or_else(|| {
        AcquisitionError::FitDiverged("parameter covariance is singular".into())
    })?;
    let dof = (x.len() - 3) as f64;
    let mut covariance = inverse * (sse / dof);

    // Model depends on w², report |w| and flip the matching covariance terms.
    let mut params = params;
    if params.width < 0.0 {
        params.width = -params.width;
        for i in 0..3 {
            if i != 2 {
                covariance[(i, 2)] = -covariance[(i, 2)];
                covariance[(2, i)] = -covariance[(2, i)];
            }
        }
    }

    tracing::debug!(?params, iterations, sse, "Gaussian fit converged");
    Ok(GaussianFit {
        params,
        covariance,
        iterations,
        residual_sum_squares: sse,
    })
}

fn sum_squares(x: &[f64], y: &[f64], p: &Vector3<f64>) -> f64 {
    let model = GaussianParams::from_vector(p);
    x.iter()
        .zip(y)
        .map(|(&xi, &yi)| {
            let r = yi - model.eval(xi);
            r * r
        })
        .sum()
}

/// `JᵀJ` and `Jᵀr` for the current parameters, `r = y - f(x)`.
fn normal_equations(x: &[f64], y: &[f64], p: &Vector3<f64>) -> (Matrix3<f64>, Vector3<f64>) {
    let (a, x0, w) = (p[0], p[1], p[2]);
    let w2 = w * w;
    let mut jtj = Matrix3::zeros();
    let mut jtr = Vector3::zeros();
    for (&xi, &yi) in x.iter().zip(y) {
        let d = xi - x0;
        let e = (-(d * d) / w2).exp();
        let f = a * e;
        let j = Vector3::new(e, f * 2.0 * d / w2, f * 2.0 * d * d / (w2 * w));
        jtj += j * j.transpose();
        jtr += j * (yi - f);
    }
    (jtj, jtr)
}

/// Starting point from the strongest sample and its half-maximum crossings.
fn guess_from_data(x: &[f64], y: &[f64]) -> GaussianParams {
    let (peak, amplitude) = y
        .iter()
        .copied()
        .enumerate()
        .fold((0, 0.0_f64), |best, (i, v)| {
            if v.abs() > best.1.abs() {
                (i, v)
            } else {
                best
            }
        });
    let half = amplitude.abs() / 2.0;

    let crossing = |from: usize, to: usize| -> f64 {
        // Linear interpolation between the last point above half maximum
        // and the first one below it.
        let (x_in, y_in) = (x[from], y[from].abs());
        let (x_out, y_out) = (x[to], y[to].abs());
        if (y_in - y_out).abs() <= f64::EPSILON {
            return x_out;
        }
        x_in + (x_out - x_in) * (y_in - half) / (y_in - y_out)
    };

    let left = (0..peak)
        .rev()
        .find(|&i| y[i].abs() < half)
        .map_or(x[0], |i| crossing(i + 1, i));
    let right = (peak + 1..y.len())
        .find(|&i| y[i].abs() < half)
        .map_or(x[y.len() - 1], |i| crossing(i - 1, i));

    let fwhm = (right - left).abs();
    let width = if fwhm > 0.0 {
        fwhm / (2.0 * std::f64::consts::LN_2.sqrt())
    } else {
        ((x[x.len() - 1] - x[0]).abs() / 4.0).max(1.0)
    };
    GaussianParams::new(amplitude, x[peak], width)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(params: GaussianParams, n: usize) -> (Vec<f64>, Vec<f64>) {
        let x: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let y = x.iter().map(|&xi| params.eval(xi)).collect();
        (x, y)
    }

    #[test]
    fn guess_is_close_for_clean_peak() {
        let truth = GaussianParams::new(5.0, 20.0, 3.0);
        let (x, y) = sample(truth, 50);
        let guess = guess_from_data(&x, &y);
        assert_eq!(guess.center, 20.0);
        assert_eq!(guess.amplitude, 5.0);
        assert!((guess.width - 3.0).abs() < 0.3, "width guess {}", guess.width);
    }

    #[test]
    fn recovers_parameters() {
        let truth = GaussianParams::new(5.0, 20.0, 3.0);
        let (x, y) = sample(truth, 50);
        let fit = fit_gaussian(&x, &y, &FitOptions::default()).unwrap();
        assert!((fit.params.amplitude - 5.0).abs() < 1e-6);
        assert!((fit.params.center - 20.0).abs() < 1e-6);
        assert!((fit.params.width - 3.0).abs() < 1e-6);
        assert!(fit.residual_sum_squares < 1e-12);
    }

    #[test]
    fn negative_width_is_reported_positive() {
        let (x, y) = sample(GaussianParams::new(2.0, 10.0, 4.0), 30);
        let options = FitOptions::default()
            .with_initial_guess(InitialGuess::Fixed(GaussianParams::new(1.5, 9.0, -3.0)));
        let fit = fit_gaussian(&x, &y, &options).unwrap();
        assert!((fit.params.width - 4.0).abs() < 1e-6);
    }

    #[test]
    fn short_input_is_degenerate() {
        let err = fit_gaussian(&[0.0, 1.0, 2.0], &[0.0, 1.0, 0.0], &FitOptions::default())
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::DegenerateInput(_)));
    }

    #[test]
    fn mismatched_lengths_are_degenerate() {
        let err = fit_gaussian(&[0.0, 1.0, 2.0, 3.0], &[0.0; 5], &FitOptions::default())
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::DegenerateInput(_)));
    }

    #[test]
    fn nan_is_degenerate() {
        let y = [0.0, 1.0, f64::NAN, 1.0, 0.0];
        let x = [0.0, 1.0, 2.0, 3.0, 4.0];
        let err = fit_gaussian(&x, &y, &FitOptions::default()).unwrap_err();
        assert!(matches!(err, AcquisitionError::DegenerateInput(_)));
    }

    #[test]
    fn flat_profile_diverges() {
        let x: Vec<f64> = (0..20).map(f64::from).collect();
        let err = fit_gaussian(&x, &[7.0; 20], &FitOptions::default()).unwrap_err();
        assert!(matches!(err, AcquisitionError::FitDiverged(_)));
    }

    #[test]
    fn iteration_cap_reports_divergence() {
        let (x, y) = sample(GaussianParams::new(5.0, 20.0, 3.0), 50);
        let options = FitOptions::default()
            .with_initial_guess(InitialGuess::Fixed(GaussianParams::new(1.0, 35.0, 8.0)))
            .with_max_iterations(1);
        let err = fit_gaussian(&x, &y, &options).unwrap_err();
        assert!(matches!(err, AcquisitionError::FitDiverged(_)));
    }

    #[test]
    fn rejects_bad_options() {
        let (x, y) = sample(GaussianParams::new(1.0, 5.0, 2.0), 10);
        let err = fit_gaussian(&x, &y, &FitOptions::default().with_max_iterations(0)).unwrap_err();
        assert!(matches!(err, AcquisitionError::InvalidParameter(_)));
    }

    #[test]
    fn noisy_fit_has_finite_uncertainty() {
        let truth = GaussianParams::new(100.0, 32.0, 6.0);
        let x: Vec<f64> = (0..64).map(f64::from).collect();
        // Deterministic pseudo-noise.
        let y: Vec<f64> = x
            .iter()
            .enumerate()
            .map(|(i, &xi)| truth.eval(xi) + ((i * 7919) % 13) as f64 * 0.1 - 0.6)
            .collect();
        let fit = fit_gaussian(&x, &y, &FitOptions::default()).unwrap();
        let [sa, sx0, sw] = fit.std_errors();
        assert!(sa.is_finite() && sx0.is_finite() && sw.is_finite());
        assert!(sa > 0.0);
        assert!((fit.params.center - 32.0).abs() < 0.5);
        assert!((fit.params.width - 6.0).abs() < 0.5);
    }
}
