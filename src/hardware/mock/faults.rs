//! Fault injection for simulated instruments.
//!
//! A [`FaultPlan`] is shared by clones of a device and is consulted at the
//! start of every operation:
//!
//! ```rust,ignore
//! let meter = MockPowerMeter::new("meter")
//!     .with_faults(FaultPlan::new().with(Fault::FailAfter { operation: "read", count: 20 }));
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::SimRng;
use crate::error::{DeviceError, DeviceErrorKind, DeviceResult};

/// One injected failure rule. `operation` matches the name the device passes
/// to [`FaultPlan::check`] (`"read"`, `"move_abs"`, `"acquire_frame"`, ...).
#[derive(Debug, Clone)]
pub enum Fault {
    /// Every call fails with `kind`.
    Always {
        operation: &'static str,
        kind: DeviceErrorKind,
    },
    /// The first `count` calls succeed, every later call fails with a
    /// hardware fault.
    FailAfter { operation: &'static str, count: u32 },
    /// Calls numbered `from..to` (0-based) fail with `kind`.
    Window {
        operation: &'static str,
        from: u32,
        to: u32,
        kind: DeviceErrorKind,
    },
    /// Each call fails with a transient error with probability `rate`.
    Random { operation: &'static str, rate: f64 },
    /// The link drops on the first checked call and stays down.
    CommunicationLoss,
}

#[derive(Default, Debug)]
struct FaultState {
    calls: HashMap<&'static str, u32>,
    link_down: bool,
}

/// Set of [`Fault`] rules plus per-operation call counters.
#[derive(Clone, Debug)]
pub struct FaultPlan {
    faults: Arc<Vec<Fault>>,
    rng: Arc<SimRng>,
    state: Arc<Mutex<FaultState>>,
}

impl Default for FaultPlan {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultPlan {
    /// A plan that never fails.
    #[must_use]
    pub fn new() -> Self {
        Self {
            faults: Arc::new(Vec::new()),
            rng: Arc::new(SimRng::new(Some(0))),
            state: Arc::new(Mutex::new(FaultState::default())),
        }
    }

    /// Add a rule.
    #[must_use]
    pub fn with(mut self, fault: Fault) -> Self {
        Arc::make_mut(&mut self.faults).push(fault);
        self
    }

    /// Seed the generator behind [`Fault::Random`].
    #[must_use]
    pub fn seeded(mut self, seed: u64) -> Self {
        self.rng = Arc::new(SimRng::new(Some(seed)));
        self
    }

    /// Number of times `operation` has been checked.
    #[must_use]
    pub fn calls(&self, operation: &str) -> u32 {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.calls.get(operation).copied().unwrap_or(0)
    }

    /// Count one call of `operation` and decide whether it fails.
    pub fn check(&self, device: &str, operation: &'static str) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let counter = state.calls.entry(operation).or_insert(0);
        let index = *counter;
        *counter += 1;

        if state.link_down {
            return Err(DeviceError::new(
                device,
                DeviceErrorKind::Communication,
                "communication lost",
            ));
        }

        for fault in self.faults.iter() {
            match fault {
                Fault::Always { operation: op, kind } if *op == operation => {
                    return Err(DeviceError::new(
                        device,
                        *kind,
                        format!("injected {kind} failure on '{operation}'"),
                    ));
                }
                Fault::FailAfter { operation: op, count } if *op == operation && index >= *count => {
                    return Err(DeviceError::new(
                        device,
                        DeviceErrorKind::Hardware,
                        format!("injected failure after {count} calls to '{operation}'"),
                    ));
                }
                Fault::Window {
                    operation: op,
                    from,
                    to,
                    kind,
                } if *op == operation && (*from..*to).contains(&index) => {
                    return Err(DeviceError::new(
                        device,
                        *kind,
                        format!("injected {kind} failure on call {index} of '{operation}'"),
                    ));
                }
                Fault::Random { operation: op, rate } if *op == operation => {
                    if self.rng.should_fail(*rate) {
                        return Err(DeviceError::transient(
                            device,
                            format!("random failure on '{operation}'"),
                        ));
                    }
                }
                Fault::CommunicationLoss => {
                    state.link_down = true;
                    return Err(DeviceError::new(
                        device,
                        DeviceErrorKind::Communication,
                        "communication lost",
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }
}
