//! Simulated hobby-servo chopper.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::FaultPlan;
use crate::error::{DeviceError, DeviceErrorKind, DeviceResult};
use crate::hardware::Movable;

/// Accepted servo positions, in servo counts.
pub const SERVO_RANGE: (f64, f64) = (-1000.0, 1000.0);

#[derive(Debug)]
struct Motion {
    from: f64,
    to: f64,
    started: Instant,
}

#[derive(Debug)]
struct ServoState {
    motion: Mutex<Motion>,
    history: Mutex<Vec<f64>>,
    enabled: AtomicBool,
}

/// Servo that reaches its target `travel_time` after each command.
///
/// Clones share state, so a [`MockPowerMeter`](super::MockPowerMeter) can
/// watch the servo a procedure is driving.
#[derive(Debug, Clone)]
pub struct MockServo {
    name: String,
    travel_time: Duration,
    faults: FaultPlan,
    state: Arc<ServoState>,
}

impl MockServo {
    /// Servo parked at the OFF position (-1000) with instant moves.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            travel_time: Duration::ZERO,
            faults: FaultPlan::new(),
            state: Arc::new(ServoState {
                motion: Mutex::new(Motion {
                    from: SERVO_RANGE.0,
                    to: SERVO_RANGE.0,
                    started: Instant::now(),
                }),
                history: Mutex::new(Vec::new()),
                enabled: AtomicBool::new(true),
            }),
        }
    }

    /// Time a move takes before the new position is reported.
    #[must_use]
    pub fn with_travel_time(mut self, travel_time: Duration) -> Self {
        self.travel_time = travel_time;
        self
    }

    #[must_use]
    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    /// Every accepted target, in order.
    #[must_use]
    pub fn history(&self) -> Vec<f64> {
        self.state
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether the servo still accepts commands.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.state.enabled.load(Ordering::SeqCst)
    }

    /// Position right now, without counting it as a device call.
    #[must_use]
    pub fn current_position(&self) -> f64 {
        let motion = self
            .state
            .motion
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if motion.started.elapsed() >= self.travel_time {
            motion.to
        } else {
            motion.from
        }
    }

    fn ensure_enabled(&self) -> DeviceResult<()> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(DeviceError::new(
                &self.name,
                DeviceErrorKind::Closed,
                "servo is disabled",
            ))
        }
    }
}

#[async_trait]
impl Movable for MockServo {
    async fn move_abs(&self, position: f64) -> DeviceResult<()> {
        self.ensure_enabled()?;
        self.faults.check(&self.name, "move_abs")?;
        let (min, max) = SERVO_RANGE;
        if !(min..=max).contains(&position) {
            return Err(DeviceError::new(
                &self.name,
                DeviceErrorKind::InvalidParameter,
                format!("position {position} outside [{min}, {max}]"),
            ));
        }
        let from = self.current_position();
        {
            let mut motion = self
                .state
                .motion
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *motion = Motion {
                from,
                to: position,
                started: Instant::now(),
            };
        }
        self.state
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(position);
        tracing::trace!(servo = %self.name, position, "servo move");
        Ok(())
    }

    async fn position(&self) -> DeviceResult<f64> {
        self.ensure_enabled()?;
        self.faults.check(&self.name, "position")?;
        Ok(self.current_position())
    }

    async fn stop(&self) -> DeviceResult<()> {
        self.state.enabled.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> DeviceResult<()> {
        self.state.enabled.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
