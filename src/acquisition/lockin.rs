//! Lock-in differential sampling with a mechanical chopper.
//!
//! A servo alternately opens (ON) and blocks (OFF) the beam in front of a
//! power meter. During each half-cycle the meter is polled at a fixed
//! interval and every reading is tagged with the phase it belongs to. At the
//! end of the run all ON readings are pooled, all OFF readings are pooled,
//! and the lock-in signal is `mean(ON) - mean(OFF)`. Background light and
//! detector offset are common to both phases and cancel out.
//!
//! Timing of one cycle:
//!
//! ```text
//! move ON ─ settle ─┬─ read ─ sleep ─ read ─ ... ─┐ move OFF ─┬─ read ─ ... ─┐
//!                   └──────── half_cycle ─────────┘           └─ half_cycle ─┘
//! ```
//!
//! The settle delay is only applied after the ON move; the OFF half-cycle
//! starts polling immediately.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};

use crate::error::AcquisitionError;
use crate::hardware::{Movable, Readable};
use crate::safety::StopFlag;

// =============================================================================
// Configuration
// =============================================================================

/// Parameters of one lock-in run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockInConfig {
    /// Number of ON/OFF cycles, at least 1.
    pub cycle_count: u32,

    /// Duration of one phase (ON or OFF).
    #[serde(with = "crate::config::secs_f64")]
    pub half_cycle: Duration,

    /// Wait after moving ON before the first reading.
    #[serde(with = "crate::config::secs_f64")]
    pub settle_delay: Duration,

    /// Time between two readings.
    #[serde(with = "crate::config::secs_f64")]
    pub poll_interval: Duration,

    /// Actuator position that lets the beam through.
    pub position_on: f64,

    /// Actuator position that blocks the beam.
    pub position_off: f64,

    /// Fail when any single half-cycle collected no sample, instead of only
    /// when a whole phase is empty.
    pub require_every_segment: bool,
}

impl Default for LockInConfig {
    fn default() -> Self {
        Self {
            cycle_count: 1,
            half_cycle: Duration::from_millis(500),
            settle_delay: Duration::from_millis(100),
            poll_interval: Duration::from_millis(10),
            position_on: 1000.0,
            position_off: -1000.0,
            require_every_segment: false,
        }
    }
}

impl LockInConfig {
    /// Config from a full chopper period ("servo time"), split evenly between
    /// the two phases.
    pub fn from_servo_time(cycle_count: u32, servo_time_s: f64) -> Result<Self, AcquisitionError> {
        if !(servo_time_s.is_finite() && servo_time_s > 0.0) {
            return Err(AcquisitionError::InvalidParameter(format!(
                "servo time must be > 0 s, got {servo_time_s}"
            )));
        }
        let half_cycle = Duration::try_from_secs_f64(servo_time_s / 2.0).map_err(|err| {
            AcquisitionError::InvalidParameter(format!("servo time {servo_time_s} s: {err}"))
        })?;
        let config = Self {
            cycle_count,
            half_cycle,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn with_cycles(mut self, cycle_count: u32) -> Self {
        self.cycle_count = cycle_count;
        self
    }

    #[must_use]
    pub fn with_half_cycle(mut self, half_cycle: Duration) -> Self {
        self.half_cycle = half_cycle;
        self
    }

    #[must_use]
    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[must_use]
    pub fn with_positions(mut self, on: f64, off: f64) -> Self {
        self.position_on = on;
        self.position_off = off;
        self
    }

    #[must_use]
    pub fn strict(mut self, require_every_segment: bool) -> Self {
        self.require_every_segment = require_every_segment;
        self
    }

    /// Full chopper period.
    #[must_use]
    pub fn servo_time(&self) -> Duration {
        self.half_cycle * 2
    }

    pub fn validate(&self) -> Result<(), AcquisitionError> {
        if self.cycle_count == 0 {
            return Err(AcquisitionError::InvalidParameter(
                "cycle_count must be at least 1".into(),
            ));
        }
        if self.half_cycle.is_zero() {
            return Err(AcquisitionError::InvalidParameter(
                "half_cycle must be > 0".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(AcquisitionError::InvalidParameter(
                "poll_interval must be > 0".into(),
            ));
        }
        if !(self.position_on.is_finite() && self.position_off.is_finite()) {
            return Err(AcquisitionError::InvalidParameter(
                "actuator positions must be finite".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Run data
// =============================================================================

/// Chopper phase a reading was taken in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    On,
    Off,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::On => write!(f, "ON"),
            Phase::Off => write!(f, "OFF"),
        }
    }
}

/// One reading. `timestamp` is seconds since the start of the run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: f64,
    pub value: f64,
    pub phase: Phase,
}

/// Samples collected during one half-cycle: `samples[start..start + len]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// 1-based cycle number.
    pub cycle: u32,
    pub phase: Phase,
    pub start: usize,
    pub len: usize,
}

/// Finished lock-in acquisition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionRun {
    cycle_count: u32,
    #[serde(with = "crate::config::secs_f64")]
    half_cycle: Duration,
    samples: Vec<Sample>,
    segments: Vec<Segment>,
    skipped_reads: usize,
    mean_on: f64,
    mean_off: f64,
    lockin_signal: f64,
}

impl AcquisitionRun {
    #[must_use]
    pub fn cycle_count(&self) -> u32 {
        self.cycle_count
    }

    #[must_use]
    pub fn half_cycle(&self) -> Duration {
        self.half_cycle
    }

    /// All readings in acquisition order.
    #[must_use]
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Half-cycles in acquisition order: ON(1), OFF(1), ON(2), ...
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Samples of one segment.
    #[must_use]
    pub fn segment_samples(&self, segment: &Segment) -> &[Sample] {
        self.samples
            .get(segment.start..segment.start + segment.len)
            .unwrap_or(&[])
    }

    /// Readings dropped because the sensor reported a recoverable error.
    #[must_use]
    pub fn skipped_reads(&self) -> usize {
        self.skipped_reads
    }

    #[must_use]
    pub fn count(&self, phase: Phase) -> usize {
        self.samples.iter().filter(|s| s.phase == phase).count()
    }

    /// Pooled mean of one phase.
    #[must_use]
    pub fn mean(&self, phase: Phase) -> f64 {
        match phase {
            Phase::On => self.mean_on,
            Phase::Off => self.mean_off,
        }
    }

    /// `mean(ON) - mean(OFF)` over all cycles.
    #[must_use]
    pub fn lockin_signal(&self) -> f64 {
        self.lockin_signal
    }

    /// Sample timestamps, for plotting the raw trace.
    #[must_use]
    pub fn times(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.timestamp).collect()
    }

    /// Sample values, for plotting the raw trace.
    #[must_use]
    pub fn values(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.value).collect()
    }
}

/// Reported after every half-cycle of [`LockInSampler::run_observed`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentReport {
    pub cycle: u32,
    pub cycle_count: u32,
    pub phase: Phase,
    pub samples: usize,
    pub skipped_reads: usize,
}

// =============================================================================
// Sampler
// =============================================================================

#[derive(Default)]
struct RunBuffer {
    samples: Vec<Sample>,
    segments: Vec<Segment>,
    skipped_reads: usize,
}

/// Drives the chopper and the sensor for one lock-in run at a time.
#[derive(Debug, Clone)]
pub struct LockInSampler {
    config: LockInConfig,
}

impl LockInSampler {
    pub fn new(config: LockInConfig) -> Result<Self, AcquisitionError> {
        config.validate()?;
        Ok(Self { config })
    }

    #[must_use]
    pub fn config(&self) -> &LockInConfig {
        &self.config
    }

    /// Run all cycles and return the finalised acquisition.
    pub async fn run<A, S>(
        &self,
        actuator: &A,
        sensor: &S,
        stop: &StopFlag,
    ) -> Result<AcquisitionRun, AcquisitionError>
    where
        A: Movable + ?Sized,
        S: Readable + ?Sized,
    {
        self.run_observed(actuator, sensor, stop, |_| {}).await
    }

    /// Like [`run`](Self::run), calling `observer` after every half-cycle.
    pub async fn run_observed<A, S, F>(
        &self,
        actuator: &A,
        sensor: &S,
        stop: &StopFlag,
        mut observer: F,
    ) -> Result<AcquisitionRun, AcquisitionError>
    where
        A: Movable + ?Sized,
        S: Readable + ?Sized,
        F: FnMut(&SegmentReport) + Send,
    {
        let cfg = &self.config;
        tracing::info!(
            actuator = actuator.name(),
            sensor = sensor.name(),
            cycles = cfg.cycle_count,
            half_cycle_s = cfg.half_cycle.as_secs_f64(),
            "starting lock-in run"
        );

        let run_start = Instant::now();
        let mut buffer = RunBuffer::default();

        let outcome = async {
            for cycle in 1..=cfg.cycle_count {
                for phase in [Phase::On, Phase::Off] {
                    self.check_stop(stop)?;
                    self.move_to(actuator, phase).await?;
                    if phase == Phase::On && !cfg.settle_delay.is_zero() {
                        sleep(cfg.settle_delay).await;
                    }
                    let segment = self
                        .poll_phase(sensor, stop, cycle, phase, run_start, &mut buffer)
                        .await?;
                    tracing::debug!(cycle, %phase, samples = segment.len, "half-cycle done");
                    observer(&SegmentReport {
                        cycle,
                        cycle_count: cfg.cycle_count,
                        phase,
                        samples: segment.len,
                        skipped_reads: buffer.skipped_reads,
                    });
                }
            }
            Ok::<(), AcquisitionError>(())
        }
        .await;

        if let Err(err) = outcome {
            if err.is_cancelled() {
                self.park(actuator).await;
            }
            tracing::warn!(error = %err, "lock-in run aborted");
            return Err(err);
        }

        let run = self.finalize(buffer)?;
        tracing::info!(
            lockin_signal = run.lockin_signal,
            samples = run.samples.len(),
            skipped = run.skipped_reads,
            "lock-in run complete"
        );
        Ok(run)
    }

    fn check_stop(&self, stop: &StopFlag) -> Result<(), AcquisitionError> {
        if stop.is_triggered() {
            return Err(AcquisitionError::Cancelled(
                stop.reason().unwrap_or_else(|| "stop requested".into()),
            ));
        }
        Ok(())
    }

    async fn move_to<A: Movable + ?Sized>(
        &self,
        actuator: &A,
        phase: Phase,
    ) -> Result<(), AcquisitionError> {
        let position = match phase {
            Phase::On => self.config.position_on,
            Phase::Off => self.config.position_off,
        };
        actuator
            .move_abs(position)
            .await
            .map_err(|source| AcquisitionError::ActuatorFault { position, source })
    }

    async fn park<A: Movable + ?Sized>(&self, actuator: &A) {
        if let Err(err) = actuator.move_abs(self.config.position_off).await {
            tracing::warn!(error = %err, "could not park actuator OFF after stop");
        }
    }

    async fn poll_phase<S: Readable + ?Sized>(
        &self,
        sensor: &S,
        stop: &StopFlag,
        cycle: u32,
        phase: Phase,
        run_start: Instant,
        buffer: &mut RunBuffer,
    ) -> Result<Segment, AcquisitionError> {
        let start = buffer.samples.len();
        let window = Instant::now();
        while window.elapsed() < self.config.half_cycle {
            self.check_stop(stop)?;
            match sensor.read().await {
                Ok(value) if value.is_finite() => buffer.samples.push(Sample {
                    timestamp: run_start.elapsed().as_secs_f64(),
                    value,
                    phase,
                }),
                Ok(value) => {
                    buffer.skipped_reads += 1;
                    tracing::warn!(cycle, %phase, value, "non-finite reading skipped");
                }
                Err(err) if err.is_recoverable() => {
                    buffer.skipped_reads += 1;
                    tracing::warn!(cycle, %phase, error = %err, "sensor read skipped");
                }
                Err(err) => return Err(AcquisitionError::SensorFault(err)),
            }
            sleep(self.config.poll_interval).await;
        }
        let segment = Segment {
            cycle,
            phase,
            start,
            len: buffer.samples.len() - start,
        };
        buffer.segments.push(segment);
        Ok(segment)
    }

    fn finalize(&self, buffer: RunBuffer) -> Result<AcquisitionRun, AcquisitionError> {
        let RunBuffer {
            samples,
            segments,
            skipped_reads,
        } = buffer;

        let on: Vec<f64> = phase_values(&samples, Phase::On);
        let off: Vec<f64> = phase_values(&samples, Phase::Off);

        if on.is_empty() || off.is_empty() {
            return Err(AcquisitionError::InsufficientData {
                on_samples: on.len(),
                off_samples: off.len(),
                cycle: None,
            });
        }
        if self.config.require_every_segment {
            if let Some(empty) = segments.iter().find(|s| s.len == 0) {
                return Err(AcquisitionError::InsufficientData {
                    on_samples: on.len(),
                    off_samples: off.len(),
                    cycle: Some(empty.cycle),
                });
            }
        }

        let mean_on = pooled_mean(on);
        let mean_off = pooled_mean(off);
        Ok(AcquisitionRun {
            cycle_count: self.config.cycle_count,
            half_cycle: self.config.half_cycle,
            samples,
            segments,
            skipped_reads,
            mean_on,
            mean_off,
            lockin_signal: mean_on - mean_off,
        })
    }
}

fn phase_values(samples: &[Sample], phase: Phase) -> Vec<f64> {
    samples
        .iter()
        .filter(|s| s.phase == phase)
        .map(|s| s.value)
        .collect()
}

/// Mean of a pooled population.
///
/// Values are sorted first so the result depends only on the multiset of
/// readings, not on which cycle produced them. Residuals are taken from the
/// smallest value, which keeps a constant population exact.
fn pooled_mean(mut values: Vec<f64>) -> f64 {
    values.sort_by(f64::total_cmp);
    let Some(&base) = values.first() else {
        return f64::NAN;
    };
    let residual: f64 = values.iter().map(|v| v - base).sum();
    base + residual / values.len() as f64
}
