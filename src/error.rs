//! Error types for the acquisition core and the application shell.
//!
//! Three layers of errors live here:
//!
//! - **[`DeviceError`]**: raised by capability implementations (servo, power
//!   meter, camera). Carries a [`DeviceErrorKind`] so callers can tell a
//!   recoverable read hiccup from a hardware fault.
//! - **[`AcquisitionError`]**: the typed taxonomy of the lock-in sampler and
//!   the pulse-width estimator. Every failure mode of a run or a fit maps to
//!   exactly one variant.
//! - **[`DaqError`]**: application-level errors (configuration, I/O, output)
//!   wrapping the two above with `#[from]` so `?` works across layers.
//!
//! Procedures and the CLI report through `anyhow::Error`; the typed errors
//! above stay reachable with `downcast_ref`.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Result type returned by capability trait methods.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

// =============================================================================
// Device Errors
// =============================================================================

/// Classification of a device-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    /// A single operation failed but the device is still usable.
    Transient,
    /// The device did not answer in time.
    Timeout,
    /// The link to the device is broken.
    Communication,
    /// The device reported a fault.
    Hardware,
    /// A parameter was outside what the device accepts.
    InvalidParameter,
    /// The device has no such operation.
    NotSupported,
    /// The handle was already released.
    Closed,
}

impl DeviceErrorKind {
    /// True for failures a polling loop may skip and retry on the next tick.
    #[must_use]
    pub fn is_recoverable(self) -> bool {
        matches!(self, DeviceErrorKind::Transient | DeviceErrorKind::Timeout)
    }
}

impl std::fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DeviceErrorKind::Transient => "transient",
            DeviceErrorKind::Timeout => "timeout",
            DeviceErrorKind::Communication => "communication",
            DeviceErrorKind::Hardware => "hardware",
            DeviceErrorKind::InvalidParameter => "invalid_parameter",
            DeviceErrorKind::NotSupported => "not_supported",
            DeviceErrorKind::Closed => "closed",
        };
        write!(f, "{}", label)
    }
}

/// Error raised by a device behind one of the capability traits.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Device '{device}' {kind} error: {message}")]
pub struct DeviceError {
    pub device: String,
    pub kind: DeviceErrorKind,
    pub message: String,
}

impl DeviceError {
    pub fn new(
        device: impl Into<String>,
        kind: DeviceErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            device: device.into(),
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a recoverable read failure.
    pub fn transient(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(device, DeviceErrorKind::Transient, message)
    }

    /// Shorthand for an unsupported operation.
    pub fn not_supported(device: impl Into<String>, operation: &str) -> Self {
        Self::new(
            device,
            DeviceErrorKind::NotSupported,
            format!("operation '{operation}' is not supported"),
        )
    }

    /// Whether a polling loop may skip this failure.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.kind.is_recoverable()
    }
}

// =============================================================================
// Acquisition Errors
// =============================================================================

/// Failure of a lock-in run or a pulse-width fit.
#[derive(Error, Debug, Clone)]
pub enum AcquisitionError {
    /// The actuator rejected a move. The run is aborted.
    #[error("actuator fault moving to {position}: {source}")]
    ActuatorFault {
        position: f64,
        #[source]
        source: DeviceError,
    },

    /// The sensor failed in a way that cannot be skipped.
    #[error("sensor fault: {0}")]
    SensorFault(#[source] DeviceError),

    /// A phase ended up with no samples to average.
    #[error(
        "insufficient data: {on_samples} ON / {off_samples} OFF samples{}",
        .cycle.map(|c| format!(" (empty segment in cycle {c})")).unwrap_or_default()
    )]
    InsufficientData {
        on_samples: usize,
        off_samples: usize,
        cycle: Option<u32>,
    },

    /// The input cannot be fitted at all (too short, non-finite values).
    #[error("degenerate input: {0}")]
    DegenerateInput(String),

    /// The least-squares solver did not produce a usable fit.
    #[error("fit diverged: {0}")]
    FitDiverged(String),

    /// A configuration value is out of its valid domain.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The run was stopped through its stop flag.
    #[error("acquisition cancelled: {0}")]
    Cancelled(String),
}

impl AcquisitionError {
    /// True for the cancellation variant.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AcquisitionError::Cancelled(_))
    }
}

// =============================================================================
// Application Errors
// =============================================================================

/// Primary error type of the application shell.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Acquisition error: {0}")]
    Acquisition(#[from] AcquisitionError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid profile data: {0}")]
    ProfileParse(String),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}
