//! # Thorlabs DAQ Library
//!
//! Acquisition and analysis routines for two Thorlabs lab instruments:
//!
//! - a **lock-in differential sampler** that chops a beam with a servo and
//!   reports `mean(ON) - mean(OFF)` from a power meter, and
//! - a **pulse-width estimator** that fits a Gaussian to an autocorrelator
//!   camera trace and converts its width to a pulse duration.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: the lock-in sampler and its run record.
//! - **`analysis`**: frame reduction, Levenberg–Marquardt Gaussian fit and
//!   pulse-duration conversion.
//! - **`hardware`**: async capability traits (`Movable`, `Readable`,
//!   `FrameProducer`, ...), the user-facing `BoundedAxis`, and simulated
//!   devices under `hardware::mock`.
//! - **`procedures`**: validate/prepare/execute/finalize wrappers that own the
//!   device handles and package results for a host.
//! - **`config`**: figment-based configuration (TOML plus environment).
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`error`**: `DeviceError`, `AcquisitionError` and the application-level
//!   `DaqError`.
//! - **`safety`**: stop flag, panic guard and cleanup registry.

pub mod acquisition;
pub mod analysis;
pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod procedures;
pub mod safety;

pub use acquisition::{AcquisitionRun, LockInConfig, LockInSampler, Phase};
pub use analysis::{PulseShape, PulseWidthEstimate, PulseWidthEstimator};
pub use error::{AcquisitionError, DaqError, DeviceError, DeviceErrorKind};
pub use safety::StopFlag;
