//! Scripted devices shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thorlabs_daq::error::{DeviceError, DeviceErrorKind, DeviceResult};
use thorlabs_daq::hardware::{Movable, Readable};
use thorlabs_daq::Phase;

pub const ON: f64 = 1000.0;
pub const OFF: f64 = -1000.0;

/// Actuator that records every commanded position.
#[derive(Default)]
pub struct RecordingActuator {
    position: Mutex<f64>,
    moves: Mutex<Vec<f64>>,
    on_moves: AtomicUsize,
    fail_at: Option<f64>,
    closed: AtomicBool,
}

impl RecordingActuator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            position: Mutex::new(OFF),
            ..Default::default()
        })
    }

    /// Actuator whose moves to `position` fail with a hardware error.
    pub fn failing_at(position: f64) -> Arc<Self> {
        Arc::new(Self {
            position: Mutex::new(OFF),
            fail_at: Some(position),
            ..Default::default()
        })
    }

    pub fn moves(&self) -> Vec<f64> {
        self.moves.lock().unwrap().clone()
    }

    pub fn last_move(&self) -> Option<f64> {
        self.moves.lock().unwrap().last().copied()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Current phase and 1-based cycle, as seen by a sensor.
    pub fn phase_and_cycle(&self) -> (Phase, usize) {
        let phase = if *self.position.lock().unwrap() > 0.0 {
            Phase::On
        } else {
            Phase::Off
        };
        (phase, self.on_moves.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl Movable for RecordingActuator {
    async fn move_abs(&self, position: f64) -> DeviceResult<()> {
        if self.fail_at == Some(position) {
            return Err(DeviceError::new(
                "recording_actuator",
                DeviceErrorKind::Hardware,
                format!("stalled moving to {position}"),
            ));
        }
        self.moves.lock().unwrap().push(position);
        *self.position.lock().unwrap() = position;
        if position > 0.0 {
            self.on_moves.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn position(&self) -> DeviceResult<f64> {
        Ok(*self.position.lock().unwrap())
    }

    async fn close(&self) -> DeviceResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "recording_actuator"
    }
}

type Script = dyn Fn(Phase, usize) -> DeviceResult<f64> + Send + Sync;

/// Sensor whose reading is a function of the actuator phase and cycle.
pub struct ScriptedSensor {
    actuator: Arc<RecordingActuator>,
    script: Box<Script>,
    reads: AtomicUsize,
    closed: AtomicBool,
}

impl ScriptedSensor {
    pub fn new<F>(actuator: Arc<RecordingActuator>, script: F) -> Self
    where
        F: Fn(Phase, usize) -> DeviceResult<f64> + Send + Sync + 'static,
    {
        Self {
            actuator,
            script: Box::new(script),
            reads: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Constant `von` while ON and `voff` while OFF.
    pub fn constant(actuator: Arc<RecordingActuator>, von: f64, voff: f64) -> Self {
        Self::new(actuator, move |phase, _| {
            Ok(match phase {
                Phase::On => von,
                Phase::Off => voff,
            })
        })
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Readable for ScriptedSensor {
    async fn read(&self) -> DeviceResult<f64> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let (phase, cycle) = self.actuator.phase_and_cycle();
        (self.script)(phase, cycle)
    }

    async fn close(&self) -> DeviceResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted_sensor"
    }
}

pub fn transient() -> DeviceError {
    DeviceError::transient("scripted_sensor", "read timed out")
}

pub fn fault() -> DeviceError {
    DeviceError::new("scripted_sensor", DeviceErrorKind::Communication, "cable unplugged")
}

/// Noiseless `a * exp(-(x - x0)^2 / w^2)` sampled at `0..n`.
pub fn gaussian_profile(a: f64, x0: f64, w: f64, n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| {
            let d = i as f64 - x0;
            a * (-(d * d) / (w * w)).exp()
        })
        .collect()
}
