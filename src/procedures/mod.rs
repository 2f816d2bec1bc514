//! Procedure framework for host integration.
//!
//! A procedure owns the device handles it needs and runs a fixed lifecycle:
//!
//! ```text
//! validate() → prepare() → execute() → finalize()
//!                                        ▲ always runs
//! ```
//!
//! [`execute_procedure_safely`] drives the lifecycle and guarantees
//! `finalize` runs whatever happened before it, which is where procedures
//! park actuators and close devices. Progress is published on a
//! `tokio::sync::watch` channel; cancellation goes through the shared
//! [`StopFlag`].
//!
//! # Example
//!
//! ```rust,ignore
//! let stop = StopFlag::new();
//! let (ctx, progress) = ProcedureContext::new(stop.clone());
//! let mut procedure = LockInPowerProcedure::new(config, servo, meter);
//! let result = execute_procedure_safely(&mut procedure, &ctx).await?;
//! println!("{}", result.summary());
//! ```

pub mod autocorrelator;
pub mod lockin_power;
pub mod result;

pub use autocorrelator::{AutocorrelatorConfig, AutocorrelatorProcedure};
pub use lockin_power::{LockInPowerConfig, LockInPowerProcedure};
pub use result::{
    CheckStatus, ExecutionTiming, ProcedureResult, QualityCheck, QualityMetrics, ResultValue,
    StepResult,
};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::safety::StopFlag;

// =============================================================================
// Procedure Trait
// =============================================================================

/// Lifecycle state of a procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcedureState {
    Idle,
    Validating,
    Preparing,
    Running,
    Finalizing,
    Completed,
    Failed,
    Cancelled,
}

/// Progress snapshot published while a procedure runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureProgress {
    pub state: ProcedureState,
    pub current_step: usize,
    pub total_steps: usize,
    pub step_name: String,
    /// 0.0 to 1.0
    pub overall_progress: f64,
    pub message: String,
}

impl Default for ProcedureProgress {
    fn default() -> Self {
        Self {
            state: ProcedureState::Idle,
            current_step: 0,
            total_steps: 0,
            step_name: String::new(),
            overall_progress: 0.0,
            message: String::new(),
        }
    }
}

impl ProcedureProgress {
    /// Running progress at step `current` of `total`.
    pub fn running(current: usize, total: usize, step_name: impl Into<String>) -> Self {
        let overall_progress = if total == 0 {
            0.0
        } else {
            current as f64 / total as f64
        };
        Self {
            state: ProcedureState::Running,
            current_step: current,
            total_steps: total,
            step_name: step_name.into(),
            overall_progress,
            message: String::new(),
        }
    }
}

/// A runnable acquisition with a validate/prepare/execute/finalize lifecycle.
#[async_trait]
pub trait Procedure: Send + Sync {
    /// Stable type id, used in results and logs.
    fn type_id(&self) -> &str;

    fn state(&self) -> ProcedureState;

    /// Check parameters. Returns non-fatal warnings, errors on fatal ones.
    async fn validate(&mut self, ctx: &ProcedureContext) -> Result<Vec<String>>;

    /// Apply settings to the devices.
    async fn prepare(&mut self, ctx: &ProcedureContext) -> Result<()>;

    /// Acquire and package the result.
    async fn execute(&mut self, ctx: &ProcedureContext) -> Result<ProcedureResult>;

    /// Return devices to a safe state and release them. Must be safe to call
    /// after any earlier step failed.
    async fn finalize(&mut self, ctx: &ProcedureContext) -> Result<()>;
}

// =============================================================================
// Procedure Context
// =============================================================================

/// Shared per-execution context: id, progress channel, stop flag.
#[derive(Clone)]
pub struct ProcedureContext {
    pub procedure_id: String,
    progress_tx: watch::Sender<ProcedureProgress>,
    stop: StopFlag,
}

impl ProcedureContext {
    /// New context with a fresh execution id and its progress receiver.
    pub fn new(stop: StopFlag) -> (Self, watch::Receiver<ProcedureProgress>) {
        let (progress_tx, progress_rx) = watch::channel(ProcedureProgress::default());
        let ctx = Self {
            procedure_id: uuid::Uuid::new_v4().to_string(),
            progress_tx,
            stop,
        };
        (ctx, progress_rx)
    }

    pub fn update_progress(&self, progress: ProcedureProgress) {
        self.progress_tx.send_replace(progress);
    }

    fn set_state(&self, state: ProcedureState) {
        self.progress_tx.send_modify(|p| p.state = state);
    }

    #[must_use]
    pub fn stop_flag(&self) -> &StopFlag {
        &self.stop
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.stop.is_triggered()
    }
}

// =============================================================================
// Safe Procedure Execution
// =============================================================================

/// Run the full lifecycle. `finalize` is called even when validation,
/// preparation or execution fail; its own error is returned only when
/// everything before it succeeded.
pub async fn execute_procedure_safely(
    procedure: &mut dyn Procedure,
    ctx: &ProcedureContext,
) -> Result<ProcedureResult> {
    let guard = ctx.stop.guard(format!("procedure {}", procedure.type_id()));
    let started_at = chrono::Utc::now();
    let t0 = Instant::now();

    let mut warnings = Vec::new();
    let mut preparation_duration = std::time::Duration::ZERO;
    let mut execution_duration = std::time::Duration::ZERO;

    let outcome = async {
        ctx.set_state(ProcedureState::Validating);
        warnings = procedure.validate(ctx).await?;
        if !warnings.is_empty() {
            tracing::warn!(procedure = procedure.type_id(), ?warnings, "validation warnings");
        }

        ctx.set_state(ProcedureState::Preparing);
        let t_prep = Instant::now();
        procedure.prepare(ctx).await?;
        preparation_duration = t_prep.elapsed();

        ctx.set_state(ProcedureState::Running);
        let t_exec = Instant::now();
        let result = procedure.execute(ctx).await;
        execution_duration = t_exec.elapsed();
        result
    }
    .await;

    ctx.set_state(ProcedureState::Finalizing);
    let t_fin = Instant::now();
    let finalized = procedure.finalize(ctx).await;
    let finalization_duration = t_fin.elapsed();

    let outcome = match (outcome, finalized) {
        (Ok(result), Ok(())) => Ok(result),
        (Ok(_), Err(fin_err)) => {
            tracing::error!(error = %fin_err, "procedure finalize failed");
            Err(fin_err)
        }
        (Err(err), fin) => {
            if let Err(fin_err) = fin {
                tracing::error!(error = %fin_err, "procedure finalize failed after error");
            }
            Err(err)
        }
    };

    guard.dismiss();
    match outcome {
        Ok(mut result) => {
            for warning in warnings {
                if !result.warnings.contains(&warning) {
                    result.warnings.push(warning);
                }
            }
            result.timing = ExecutionTiming {
                total_duration: t0.elapsed(),
                preparation_duration,
                execution_duration,
                finalization_duration,
                started_at: Some(started_at),
                finished_at: Some(chrono::Utc::now()),
            };
            ctx.set_state(ProcedureState::Completed);
            tracing::info!(summary = %result.summary(), "procedure complete");
            Ok(result)
        }
        Err(err) => {
            let cancelled = err
                .downcast_ref::<crate::error::AcquisitionError>()
                .is_some_and(crate::error::AcquisitionError::is_cancelled);
            ctx.set_state(if cancelled {
                ProcedureState::Cancelled
            } else {
                ProcedureState::Failed
            });
            Err(err)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
