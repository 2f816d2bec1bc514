//! User-facing actuator axis.
//!
//! [`BoundedAxis`] wraps any [`Movable`] and adds the per-axis settings a lab
//! user expects on a motor or servo: optional soft bounds (targets are clamped,
//! not rejected), a linear scaling `user = device * scaling + offset`, and an
//! epsilon used to decide that the axis reached its target.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{DeviceError, DeviceErrorKind, DeviceResult};
use crate::hardware::Movable;

/// Axis settings, in user units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisSettings {
    /// Soft limits `(min, max)`; `None` disables clamping.
    #[serde(default)]
    pub bounds: Option<(f64, f64)>,

    #[serde(default = "default_scaling")]
    pub scaling: f64,

    #[serde(default)]
    pub offset: f64,

    /// Distance under which the axis counts as on target.
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,

    /// Give up waiting for the target after this long.
    #[serde(default = "default_settle_timeout", with = "crate::config::secs_f64")]
    pub settle_timeout: Duration,

    #[serde(default = "default_poll_interval", with = "crate::config::secs_f64")]
    pub poll_interval: Duration,
}

fn default_scaling() -> f64 {
    1.0
}

fn default_epsilon() -> f64 {
    1e-3
}

fn default_settle_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(10)
}

impl Default for AxisSettings {
    fn default() -> Self {
        Self {
            bounds: None,
            scaling: default_scaling(),
            offset: 0.0,
            epsilon: default_epsilon(),
            settle_timeout: default_settle_timeout(),
            poll_interval: default_poll_interval(),
        }
    }
}

impl AxisSettings {
    /// Settings with soft bounds.
    #[must_use]
    pub fn with_bounds(mut self, min: f64, max: f64) -> Self {
        self.bounds = Some((min, max));
        self
    }

    /// Settings with a linear conversion from device to user units.
    #[must_use]
    pub fn with_scaling(mut self, scaling: f64, offset: f64) -> Self {
        self.scaling = scaling;
        self.offset = offset;
        self
    }

    #[must_use]
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.scaling.is_finite() || self.scaling == 0.0 {
            return Err(format!("scaling must be finite and non-zero, got {}", self.scaling));
        }
        if !self.offset.is_finite() {
            return Err("offset must be finite".into());
        }
        if let Some((min, max)) = self.bounds {
            if !(min.is_finite() && max.is_finite() && min < max) {
                return Err(format!("bounds must satisfy min < max, got ({min}, {max})"));
            }
        }
        if self.epsilon.is_nan() || self.epsilon <= 0.0 {
            return Err(format!("epsilon must be > 0, got {}", self.epsilon));
        }
        if self.poll_interval.is_zero() {
            return Err("poll_interval must be > 0".into());
        }
        Ok(())
    }

    /// Clamp a user-unit target into the bounds.
    #[must_use]
    pub fn clamp(&self, target: f64) -> f64 {
        match self.bounds {
            Some((min, max)) => target.clamp(min, max),
            None => target,
        }
    }

    #[must_use]
    pub fn to_device(&self, user: f64) -> f64 {
        (user - self.offset) / self.scaling
    }

    #[must_use]
    pub fn to_user(&self, device: f64) -> f64 {
        device * self.scaling + self.offset
    }
}

/// Axis wrapper applying [`AxisSettings`] around a device.
pub struct BoundedAxis<M: ?Sized> {
    settings: AxisSettings,
    device: std::sync::Arc<M>,
}

impl<M: Movable + ?Sized> BoundedAxis<M> {
    /// Wrap `device`, rejecting invalid settings.
    pub fn new(device: std::sync::Arc<M>, settings: AxisSettings) -> DeviceResult<Self> {
        settings.validate().map_err(|msg| {
            DeviceError::new(device.name(), DeviceErrorKind::InvalidParameter, msg)
        })?;
        Ok(Self { settings, device })
    }

    #[must_use]
    pub fn settings(&self) -> &AxisSettings {
        &self.settings
    }

    /// Move to `target` (user units, clamped) and wait until the device
    /// reports a position within epsilon of it. Returns the clamped target.
    pub async fn move_and_wait(&self, target: f64) -> DeviceResult<f64> {
        let target = self.settings.clamp(target);
        self.move_abs(target).await?;
        self.wait_until_reached(target).await?;
        Ok(target)
    }

    /// Poll the position until it is within epsilon of `target`.
    pub async fn wait_until_reached(&self, target: f64) -> DeviceResult<()> {
        let deadline = Instant::now() + self.settings.settle_timeout;
        loop {
            let position = self.position().await?;
            if (position - target).abs() < self.settings.epsilon {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::new(
                    self.device.name(),
                    DeviceErrorKind::Timeout,
                    format!("did not reach {target} (at {position})"),
                ));
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }
}

#[async_trait]
impl<M: Movable + ?Sized> Movable for BoundedAxis<M> {
    async fn move_abs(&self, position: f64) -> DeviceResult<()> {
        let clamped = self.settings.clamp(position);
        if clamped != position {
            tracing::debug!(
                axis = self.device.name(),
                requested = position,
                clamped,
                "target clamped to bounds"
            );
        }
        self.device.move_abs(self.settings.to_device(clamped)).await
    }

    async fn move_rel(&self, distance: f64) -> DeviceResult<()> {
        let current = self.position().await?;
        self.move_abs(current + distance).await
    }

    async fn position(&self) -> DeviceResult<f64> {
        Ok(self.settings.to_user(self.device.position().await?))
    }

    async fn home(&self) -> DeviceResult<()> {
        self.device.home().await
    }

    async fn stop(&self) -> DeviceResult<()> {
        self.device.stop().await
    }

    async fn close(&self) -> DeviceResult<()> {
        self.device.close().await
    }

    fn name(&self) -> &str {
        self.device.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockServo;
    use std::sync::Arc;

    #[test]
    fn scaling_round_trips() {
        let s = AxisSettings::default().with_scaling(0.5, 10.0);
        assert_eq!(s.to_user(100.0), 60.0);
        assert_eq!(s.to_device(60.0), 100.0);
    }

    #[test]
    fn rejects_bad_settings() {
        assert!(AxisSettings::default().with_scaling(0.0, 0.0).validate().is_err());
        assert!(AxisSettings::default().with_bounds(5.0, 1.0).validate().is_err());
        assert!(AxisSettings::default().with_epsilon(0.0).validate().is_err());
        assert!(AxisSettings::default().validate().is_ok());
    }

    #[tokio::test]
    async fn clamps_to_bounds() {
        let servo = Arc::new(MockServo::new("servo"));
        let axis = BoundedAxis::new(
            servo.clone(),
            AxisSettings::default().with_bounds(-500.0, 500.0),
        )
        .unwrap();

        axis.move_abs(900.0).await.unwrap();
        assert_eq!(servo.position().await.unwrap(), 500.0);

        axis.move_rel(-2000.0).await.unwrap();
        assert_eq!(servo.position().await.unwrap(), -500.0);
    }

    #[tokio::test]
    async fn applies_scaling() {
        let servo = Arc::new(MockServo::new("servo"));
        let axis = BoundedAxis::new(
            servo.clone(),
            AxisSettings::default().with_scaling(2.0, 0.0),
        )
        .unwrap();

        axis.move_abs(100.0).await.unwrap();
        assert_eq!(servo.position().await.unwrap(), 50.0);
        assert_eq!(axis.position().await.unwrap(), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_target() {
        let servo = Arc::new(MockServo::new("servo").with_travel_time(Duration::from_millis(100)));
        let axis = BoundedAxis::new(servo, AxisSettings::default().with_epsilon(10.0)).unwrap();

        let start = Instant::now();
        let reached = axis.move_and_wait(1000.0).await.unwrap();
        assert_eq!(reached, 1000.0);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let s: AxisSettings = toml::from_str("bounds = [0.0, 150.0]\nsettle_timeout = 2.5").unwrap();
        assert_eq!(s.bounds, Some((0.0, 150.0)));
        assert_eq!(s.scaling, 1.0);
        assert_eq!(s.settle_timeout, Duration::from_millis(2500));
    }
}
