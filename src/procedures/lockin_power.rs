//! Lock-in Power Procedure
//!
//! Measures the chopped component of a beam with a power meter and a servo
//! chopper:
//! 1. Set the meter wavelength (when the meter supports it)
//! 2. Alternate the chopper between ON and OFF for N cycles, polling the meter
//! 3. Report `mean(ON) - mean(OFF)` together with the full trace
//!
//! # Configuration
//!
//! ```toml
//! [lockin]
//! cycle_count = 3
//! servo_time_s = 2.0
//! wavelength_nm = 800.0
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    Procedure, ProcedureContext, ProcedureProgress, ProcedureResult, ProcedureState,
    QualityMetrics, StepResult,
};
use crate::acquisition::{AcquisitionRun, LockInConfig, LockInSampler, Phase, SegmentReport};
use crate::error::AcquisitionError;
use crate::hardware::{Movable, Readable, WavelengthTunable};
use crate::safety::CleanupRegistry;

/// Largest accepted cycle count.
pub const MAX_CYCLES: u32 = 300;

/// Servo periods outside this range are accepted with a warning.
pub const RECOMMENDED_SERVO_TIME_S: (f64, f64) = (1.1, 30.0);

// =============================================================================
// Configuration
// =============================================================================

/// Typed configuration for a lock-in power measurement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInPowerConfig {
    /// Number of ON/OFF cycles (1..=300)
    #[serde(default = "default_cycle_count")]
    pub cycle_count: u32,

    /// Full chopper period in seconds, split evenly between ON and OFF
    #[serde(default = "default_servo_time")]
    pub servo_time_s: f64,

    /// Wavelength applied to the meter before acquiring (nm)
    #[serde(default = "default_wavelength")]
    pub wavelength_nm: Option<f64>,

    /// Wait after reaching ON before polling
    #[serde(default = "default_settle_delay", with = "crate::config::secs_f64")]
    pub settle_delay: Duration,

    /// Delay between meter reads
    #[serde(default = "default_poll_interval", with = "crate::config::secs_f64")]
    pub poll_interval: Duration,

    #[serde(default = "default_position_on")]
    pub position_on: f64,

    #[serde(default = "default_position_off")]
    pub position_off: f64,

    /// Fail when any single half-cycle collected no readings
    #[serde(default)]
    pub require_every_segment: bool,
}

fn default_cycle_count() -> u32 {
    1
}
fn default_servo_time() -> f64 {
    1.0
}
#[allow(clippy::unnecessary_wraps)]
fn default_wavelength() -> Option<f64> {
    Some(532.0)
}
fn default_settle_delay() -> Duration {
    LockInConfig::default().settle_delay
}
fn default_poll_interval() -> Duration {
    LockInConfig::default().poll_interval
}
fn default_position_on() -> f64 {
    LockInConfig::default().position_on
}
fn default_position_off() -> f64 {
    LockInConfig::default().position_off
}

impl Default for LockInPowerConfig {
    fn default() -> Self {
        Self {
            cycle_count: default_cycle_count(),
            servo_time_s: default_servo_time(),
            wavelength_nm: default_wavelength(),
            settle_delay: default_settle_delay(),
            poll_interval: default_poll_interval(),
            position_on: default_position_on(),
            position_off: default_position_off(),
            require_every_segment: false,
        }
    }
}

impl LockInPowerConfig {
    /// Fatal errors, then non-fatal warnings.
    pub fn check(&self) -> Result<Vec<String>, AcquisitionError> {
        if !(1..=MAX_CYCLES).contains(&self.cycle_count) {
            return Err(AcquisitionError::InvalidParameter(format!(
                "cycle_count must be in 1..={MAX_CYCLES}, got {}",
                self.cycle_count
            )));
        }
        if let Some(nm) = self.wavelength_nm {
            if !(nm.is_finite() && nm > 0.0) {
                return Err(AcquisitionError::InvalidParameter(format!(
                    "wavelength must be > 0 nm, got {nm}"
                )));
            }
        }
        self.to_lockin_config()?;

        let mut warnings = Vec::new();
        let (lo, hi) = RECOMMENDED_SERVO_TIME_S;
        if self.servo_time_s < lo || self.servo_time_s > hi {
            warnings.push(format!(
                "servo time {} s is outside the recommended {lo}..{hi} s",
                self.servo_time_s
            ));
        }
        Ok(warnings)
    }

    /// Sampler configuration for this measurement.
    pub fn to_lockin_config(&self) -> Result<LockInConfig, AcquisitionError> {
        let config = LockInConfig::from_servo_time(self.cycle_count, self.servo_time_s)?
            .with_settle_delay(self.settle_delay)
            .with_poll_interval(self.poll_interval)
            .with_positions(self.position_on, self.position_off)
            .strict(self.require_every_segment);
        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Procedure
// =============================================================================

/// Chopped-beam power measurement on a servo chopper and a power meter.
pub struct LockInPowerProcedure {
    config: LockInPowerConfig,
    chopper: Arc<dyn Movable>,
    meter: Arc<dyn Readable>,
    wavelength: Option<Arc<dyn WavelengthTunable>>,
    state: ProcedureState,
    applied_wavelength: Option<f64>,
    notes: Vec<String>,
    cleanup: CleanupRegistry,
}

impl LockInPowerProcedure {
    pub fn new(
        config: LockInPowerConfig,
        chopper: Arc<dyn Movable>,
        meter: Arc<dyn Readable>,
    ) -> Self {
        let mut cleanup = CleanupRegistry::new();

        let m = meter.clone();
        cleanup.register(
            "close meter",
            Box::new(move || {
                Box::pin(async move {
                    if let Err(err) = m.close().await {
                        tracing::warn!(error = %err, "failed to close power meter");
                    }
                })
            }),
        );

        // Registered last so it runs first: park, then release the servo.
        let c = chopper.clone();
        let off = config.position_off;
        cleanup.register(
            "park chopper",
            Box::new(move || {
                Box::pin(async move {
                    if let Err(err) = c.move_abs(off).await {
                        tracing::warn!(error = %err, "failed to park chopper");
                    }
                    if let Err(err) = c.close().await {
                        tracing::warn!(error = %err, "failed to close chopper");
                    }
                })
            }),
        );

        Self {
            config,
            chopper,
            meter,
            wavelength: None,
            state: ProcedureState::Idle,
            applied_wavelength: None,
            notes: Vec::new(),
            cleanup,
        }
    }

    /// Meter wavelength control, usually the meter itself.
    #[must_use]
    pub fn with_wavelength_control(mut self, control: Arc<dyn WavelengthTunable>) -> Self {
        self.wavelength = Some(control);
        self
    }

    #[must_use]
    pub fn config(&self) -> &LockInPowerConfig {
        &self.config
    }

    fn package(
        &self,
        ctx: &ProcedureContext,
        run: &AcquisitionRun,
        reports: &[SegmentReport],
    ) -> ProcedureResult {
        let mut quality = QualityMetrics::default();
        let empty = reports.iter().filter(|r| r.samples == 0).count();
        if empty == 0 {
            quality.add_pass("segments", "every half-cycle has readings");
        } else {
            quality.add_warning("segments", format!("{empty} half-cycles have no readings"));
        }
        if run.skipped_reads() == 0 {
            quality.add_pass("reads", "no failed reads");
        } else {
            quality.add_warning("reads", format!("{} reads skipped", run.skipped_reads()));
        }

        let mut result = ProcedureResult::success("lockin_power", ctx.procedure_id.clone())
            .with_quality(quality)
            .with_data("lockin_signal", run.lockin_signal())
            .with_data("mean_on", run.mean(Phase::On))
            .with_data("mean_off", run.mean(Phase::Off))
            .with_data("on_samples", run.count(Phase::On))
            .with_data("off_samples", run.count(Phase::Off))
            .with_data("skipped_reads", run.skipped_reads())
            .with_data("cycle_count", run.cycle_count())
            .with_data("trace_times", run.times())
            .with_data("trace_powers", run.values());
        if let Some(nm) = self.applied_wavelength {
            result = result.with_data("wavelength_nm", nm);
        }
        for note in &self.notes {
            result = result.with_warning(note.clone());
        }
        for (index, report) in reports.iter().enumerate() {
            let name = format!("cycle {} {}", report.cycle, report.phase);
            let step = if report.samples == 0 {
                StepResult::failure(name, index, "no readings")
            } else {
                StepResult::success(name, index)
            };
            result = result.with_step(
                step.with_data("samples", report.samples)
                    .with_data("skipped_reads", report.skipped_reads),
            );
        }
        result
    }
}

#[async_trait]
impl Procedure for LockInPowerProcedure {
    fn type_id(&self) -> &str {
        "lockin_power"
    }

    fn state(&self) -> ProcedureState {
        self.state
    }

    async fn validate(&mut self, _ctx: &ProcedureContext) -> Result<Vec<String>> {
        self.state = ProcedureState::Validating;
        let mut warnings = self.config.check()?;
        if self.config.wavelength_nm.is_some() && self.wavelength.is_none() {
            warnings.push(format!(
                "{} has no wavelength control; wavelength not applied",
                self.meter.name()
            ));
        }
        Ok(warnings)
    }

    async fn prepare(&mut self, _ctx: &ProcedureContext) -> Result<()> {
        self.state = ProcedureState::Preparing;
        if let (Some(nm), Some(control)) = (self.config.wavelength_nm, &self.wavelength) {
            let applied = control
                .set_wavelength(nm)
                .await
                .map_err(AcquisitionError::SensorFault)?;
            if (applied - nm).abs() > f64::EPSILON * nm {
                let (lo, hi) = control.wavelength_range();
                let note = format!("wavelength {nm} nm clamped to {applied} nm (range {lo}..{hi})");
                tracing::warn!("{note}");
                self.notes.push(note);
            }
            tracing::info!(wavelength_nm = applied, "meter wavelength set");
            self.applied_wavelength = Some(applied);
        }
        Ok(())
    }

    async fn execute(&mut self, ctx: &ProcedureContext) -> Result<ProcedureResult> {
        self.state = ProcedureState::Running;
        let sampler = LockInSampler::new(self.config.to_lockin_config()?)?;
        let total = self.config.cycle_count as usize * 2;

        let mut reports: Vec<SegmentReport> = Vec::with_capacity(total);
        let outcome = sampler
            .run_observed(
                self.chopper.as_ref(),
                self.meter.as_ref(),
                ctx.stop_flag(),
                |report| {
                    reports.push(*report);
                    ctx.update_progress(ProcedureProgress::running(
                        reports.len(),
                        total,
                        format!("cycle {}/{} {}", report.cycle, report.cycle_count, report.phase),
                    ));
                },
            )
            .await;

        let run = match outcome {
            Ok(run) => run,
            Err(err) => {
                self.state = if err.is_cancelled() {
                    ProcedureState::Cancelled
                } else {
                    ProcedureState::Failed
                };
                return Err(err.into());
            }
        };

        tracing::info!(
            lockin_signal = run.lockin_signal(),
            on = run.count(Phase::On),
            off = run.count(Phase::Off),
            "lock-in measurement complete"
        );
        Ok(self.package(ctx, &run, &reports))
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
