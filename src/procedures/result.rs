//! Procedure results and quality checks.
//!
//! A [`ProcedureResult`] is what a host receives at the end of a procedure:
//! named data values (scalars and traces), warnings, quality checks, timing
//! and per-step records. It serialises to JSON for logs and the CLI.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ProcedureResult
// =============================================================================

/// Outcome of one procedure execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureResult {
    /// Procedure type id (`lockin_power`, `autocorrelator`).
    pub procedure_type: String,

    /// Unique id of this execution.
    pub execution_id: String,

    pub success: bool,

    pub quality: QualityMetrics,

    pub timing: ExecutionTiming,

    /// Named outputs, ordered by key.
    #[serde(default)]
    pub data: BTreeMap<String, ResultValue>,

    #[serde(default)]
    pub warnings: Vec<String>,

    #[serde(default)]
    pub error: Option<String>,

    #[serde(default)]
    pub steps: Vec<StepResult>,
}

impl ProcedureResult {
    pub fn success(procedure_type: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self {
            procedure_type: procedure_type.into(),
            execution_id: execution_id.into(),
            success: true,
            quality: QualityMetrics::default(),
            timing: ExecutionTiming::default(),
            data: BTreeMap::new(),
            warnings: Vec::new(),
            error: None,
            steps: Vec::new(),
        }
    }

    pub fn failure(
        procedure_type: impl Into<String>,
        execution_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::success(procedure_type, execution_id)
        }
    }

    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<ResultValue>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    #[must_use]
    pub fn with_quality(mut self, quality: QualityMetrics) -> Self {
        self.quality = quality;
        self
    }

    #[must_use]
    pub fn with_step(mut self, step: StepResult) -> Self {
        self.steps.push(step);
        self
    }

    /// Float value stored under `key`.
    #[must_use]
    pub fn float(&self, key: &str) -> Option<f64> {
        match self.data.get(key)? {
            ResultValue::Float(v) => Some(*v),
            ResultValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Integer value stored under `key`.
    #[must_use]
    pub fn integer(&self, key: &str) -> Option<i64> {
        match self.data.get(key)? {
            ResultValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Float array stored under `key`.
    #[must_use]
    pub fn float_array(&self, key: &str) -> Option<&[f64]> {
        match self.data.get(key)? {
            ResultValue::FloatArray(v) => Some(v),
            _ => None,
        }
    }

    /// One-line human readable summary.
    #[must_use]
    pub fn summary(&self) -> String {
        let status = if self.success { "SUCCESS" } else { "FAILED" };
        if self.success {
            format!(
                "{} - {} - Duration: {:.2}s - Quality: {:.0}% (Pass: {}, Warn: {}, Fail: {})",
                self.procedure_type,
                status,
                self.timing.total_duration.as_secs_f64(),
                self.quality.overall_score * 100.0,
                self.quality.checks_passed,
                self.quality.checks_warned,
                self.quality.checks_failed
            )
        } else {
            format!(
                "{} - {} - Error: {}",
                self.procedure_type,
                status,
                self.error.as_deref().unwrap_or("unknown")
            )
        }
    }
}

// =============================================================================
// Quality Metrics
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warning,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityCheck {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
}

/// Pass/warn/fail tally. Score counts a pass as 1 and a warning as 0.5.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub overall_score: f64,
    pub checks_passed: u32,
    pub checks_warned: u32,
    pub checks_failed: u32,
    #[serde(default)]
    pub checks: Vec<QualityCheck>,
}

impl Default for QualityMetrics {
    fn default() -> Self {
        Self {
            overall_score: 1.0,
            checks_passed: 0,
            checks_warned: 0,
            checks_failed: 0,
            checks: Vec::new(),
        }
    }
}

impl QualityMetrics {
    pub fn add_pass(&mut self, name: impl Into<String>, message: impl Into<String>) {
        self.checks_passed += 1;
        self.push(name.into(), CheckStatus::Pass, message.into());
    }

    pub fn add_warning(&mut self, name: impl Into<String>, message: impl Into<String>) {
        self.checks_warned += 1;
        self.push(name.into(), CheckStatus::Warning, message.into());
    }

    pub fn add_fail(&mut self, name: impl Into<String>, message: impl Into<String>) {
        self.checks_failed += 1;
        self.push(name.into(), CheckStatus::Fail, message.into());
    }

    fn push(&mut self, name: String, status: CheckStatus, message: String) {
        self.checks.push(QualityCheck {
            name,
            status,
            message,
        });
        let total = self.checks_passed + self.checks_warned + self.checks_failed;
        self.overall_score = if total == 0 {
            1.0
        } else {
            (f64::from(self.checks_passed) + f64::from(self.checks_warned) * 0.5) / f64::from(total)
        };
    }
}

// =============================================================================
// Execution Timing
// =============================================================================

/// Wall-clock start/end and per-phase durations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTiming {
    #[serde(with = "crate::config::secs_f64")]
    pub total_duration: Duration,
    #[serde(with = "crate::config::secs_f64")]
    pub preparation_duration: Duration,
    #[serde(with = "crate::config::secs_f64")]
    pub execution_duration: Duration,
    #[serde(with = "crate::config::secs_f64")]
    pub finalization_duration: Duration,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Default for ExecutionTiming {
    fn default() -> Self {
        Self {
            total_duration: Duration::ZERO,
            preparation_duration: Duration::ZERO,
            execution_duration: Duration::ZERO,
            finalization_duration: Duration::ZERO,
            started_at: None,
            finished_at: None,
        }
    }
}

// =============================================================================
// Step Result
// =============================================================================

/// Record of one repeated unit of work (a half-cycle, a frame).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub index: usize,
    pub success: bool,
    #[serde(default)]
    pub data: BTreeMap<String, ResultValue>,
    #[serde(default)]
    pub error: Option<String>,
}

impl StepResult {
    pub fn success(name: impl Into<String>, index: usize) -> Self {
        Self {
            name: name.into(),
            index,
            success: true,
            data: BTreeMap::new(),
            error: None,
        }
    }

    pub fn failure(name: impl Into<String>, index: usize, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::success(name, index)
        }
    }

    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<ResultValue>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// Result Values
// =============================================================================

/// A value a procedure reports to its host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    FloatArray(Vec<f64>),
    Json(serde_json::Value),
}

impl From<bool> for ResultValue {
    fn from(v: bool) -> Self {
        ResultValue::Bool(v)
    }
}

impl From<i64> for ResultValue {
    fn from(v: i64) -> Self {
        ResultValue::Integer(v)
    }
}

impl From<usize> for ResultValue {
    fn from(v: usize) -> Self {
        ResultValue::Integer(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<u32> for ResultValue {
    fn from(v: u32) -> Self {
        ResultValue::Integer(i64::from(v))
    }
}

impl From<f64> for ResultValue {
    fn from(v: f64) -> Self {
        ResultValue::Float(v)
    }
}

impl From<String> for ResultValue {
    fn from(v: String) -> Self {
        ResultValue::String(v)
    }
}

impl From<&str> for ResultValue {
    fn from(v: &str) -> Self {
        ResultValue::String(v.to_string())
    }
}

impl From<Vec<f64>> for ResultValue {
    fn from(v: Vec<f64>) -> Self {
        ResultValue::FloatArray(v)
    }
}

impl From<serde_json::Value> for ResultValue {
    fn from(v: serde_json::Value) -> Self {
        ResultValue::Json(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_score_weights_warnings() {
        let mut q = QualityMetrics::default();
        assert_eq!(q.overall_score, 1.0);
        q.add_pass("a", "ok");
        q.add_warning("b", "meh");
        assert_eq!(q.overall_score, 0.75);
        q.add_fail("c", "bad");
        assert_eq!(q.overall_score, 0.5);
        assert_eq!(q.checks.len(), 3);
    }

    #[test]
    fn typed_accessors() {
        let r = ProcedureResult::success("lockin_power", "id")
            .with_data("lockin_signal", 1.5e-3)
            .with_data("samples", 100_usize)
            .with_data("trace", vec![1.0, 2.0]);
        assert_eq!(r.float("lockin_signal"), Some(1.5e-3));
        assert_eq!(r.integer("samples"), Some(100));
        assert_eq!(r.float("samples"), Some(100.0));
        assert_eq!(r.float_array("trace"), Some(&[1.0, 2.0][..]));
        assert_eq!(r.float("missing"), None);
    }

    #[test]
    fn summary_mentions_status() {
        let ok = ProcedureResult::success("autocorrelator", "id");
        assert!(ok.summary().contains("SUCCESS"));
        let failed = ProcedureResult::failure("autocorrelator", "id", "fit diverged");
        assert!(failed.summary().contains("FAILED"));
        assert!(failed.summary().contains("fit diverged"));
    }

    #[test]
    fn serializes_to_json() {
        let r = ProcedureResult::success("lockin_power", "id")
            .with_data("lockin_signal", 0.25)
            .with_step(StepResult::success("cycle 1 ON", 0).with_data("samples", 50_u32));
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["data"]["lockin_signal"], 0.25);
        assert_eq!(json["steps"][0]["data"]["samples"], 50);

        let back: ProcedureResult = serde_json::from_value(json).unwrap();
        assert_eq!(back.float("lockin_signal"), Some(0.25));
    }
}
