//! Atomic hardware capabilities.
//!
//! Each instrument in the setup exposes only what the acquisition code needs:
//!
//! - the chopper servo and the translation stage implement [`Movable`]
//! - the power meter implements [`Readable`] and [`WavelengthTunable`]
//! - the camera implements [`FrameProducer`] and [`ExposureControl`]
//!
//! Every trait is async (`#[async_trait]`), thread-safe (`Send + Sync`), takes
//! `&self` and reports failures as [`DeviceError`] so the sampler can tell a
//! skippable read from a fault.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn chop_once<A, S>(servo: &A, meter: &S) -> DeviceResult<(f64, f64)>
//! where
//!     A: Movable + ?Sized,
//!     S: Readable + ?Sized,
//! {
//!     servo.move_abs(1000.0).await?;
//!     let on = meter.read().await?;
//!     servo.move_abs(-1000.0).await?;
//!     let off = meter.read().await?;
//!     Ok((on, off))
//! }
//! ```

use async_trait::async_trait;

use crate::error::{DeviceError, DeviceResult};
use crate::hardware::Frame;

/// Capability: Motion Control
///
/// Devices that can move to positions (chopper servos, linear stages).
///
/// # Contract
/// - Positions are in device-native units (servo counts, mm)
/// - `move_abs` returns once the command is accepted; the device may still be
///   in motion, callers that need a settled beam wait on their own clock
/// - `position` returns the last commanded or measured position
/// - `close` releases the handle; later calls may fail with `Closed`
#[async_trait]
pub trait Movable: Send + Sync {
    /// Move to absolute position.
    ///
    /// # Returns
    /// - Ok(()) if the move was accepted
    /// - Err with `InvalidParameter` if the target is out of range, or a
    ///   communication/hardware error
    async fn move_abs(&self, position: f64) -> DeviceResult<()>;

    /// Move relative to the current position.
    async fn move_rel(&self, distance: f64) -> DeviceResult<()> {
        let current = self.position().await?;
        self.move_abs(current + distance).await
    }

    /// Current position in device-native units.
    async fn position(&self) -> DeviceResult<f64>;

    /// Run the device's homing sequence.
    async fn home(&self) -> DeviceResult<()> {
        Err(DeviceError::not_supported(self.name(), "home"))
    }

    /// Halt motion in progress.
    async fn stop(&self) -> DeviceResult<()> {
        Err(DeviceError::not_supported(self.name(), "stop"))
    }

    /// Release the device handle.
    async fn close(&self) -> DeviceResult<()> {
        Ok(())
    }

    /// Name used in errors and logs.
    fn name(&self) -> &str;
}

/// Capability: Scalar Readout
///
/// Devices that return one value per read (power meters, photodiodes).
///
/// # Contract
/// - `read` returns the instantaneous value in device units (W for meters)
/// - A `Transient` or `Timeout` error means the next read may succeed
#[async_trait]
pub trait Readable: Send + Sync {
    /// Read one value.
    async fn read(&self) -> DeviceResult<f64>;

    /// Release the device handle.
    async fn close(&self) -> DeviceResult<()> {
        Ok(())
    }

    /// Name used in errors and logs.
    fn name(&self) -> &str;
}

/// Capability: Wavelength Correction
///
/// Power meters apply a wavelength-dependent responsivity.
#[async_trait]
pub trait WavelengthTunable: Send + Sync {
    /// Apply a wavelength in nm. Returns the value actually applied, which is
    /// clamped to [`wavelength_range`](Self::wavelength_range).
    async fn set_wavelength(&self, nm: f64) -> DeviceResult<f64>;

    /// Wavelength currently applied, in nm.
    async fn wavelength(&self) -> DeviceResult<f64>;

    /// Supported (min, max) wavelength in nm.
    fn wavelength_range(&self) -> (f64, f64);
}

/// Capability: Image Acquisition
///
/// # Contract
/// - `acquire_frame` blocks (asynchronously) until one full frame is ready
/// - `resolution` is (width, height) of the frames currently produced
#[async_trait]
pub trait FrameProducer: Send + Sync {
    /// Acquire one frame.
    async fn acquire_frame(&self) -> DeviceResult<Frame>;

    /// (width, height) in pixels.
    fn resolution(&self) -> (u32, u32);

    /// Frames delivered since the device was opened.
    fn frame_count(&self) -> u64;

    /// Abort any acquisition in progress.
    async fn stop(&self) -> DeviceResult<()> {
        Ok(())
    }

    /// Release the device handle.
    async fn close(&self) -> DeviceResult<()> {
        Ok(())
    }
}

/// Capability: Exposure Control
#[async_trait]
pub trait ExposureControl: Send + Sync {
    /// Set exposure time in seconds.
    async fn set_exposure(&self, seconds: f64) -> DeviceResult<()>;

    /// Exposure time in seconds.
    async fn exposure(&self) -> DeviceResult<f64>;
}
