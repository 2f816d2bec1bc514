//! Hardware abstraction: capability traits, camera frames, axis wrapper and
//! simulated instruments.

pub mod axis;
pub mod capabilities;
pub mod mock;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

pub use axis::{AxisSettings, BoundedAxis};
pub use capabilities::{ExposureControl, FrameProducer, Movable, Readable, WavelengthTunable};

/// One monochrome camera frame, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u16>,
}

impl Frame {
    /// Build a frame, returning `None` when `pixels` does not match the size.
    #[must_use]
    pub fn new(width: u32, height: u32, pixels: Vec<u16>) -> Option<Self> {
        let expected = (width as usize).checked_mul(height as usize)?;
        (pixels.len() == expected).then_some(Self {
            width,
            height,
            pixels,
        })
    }

    /// Pixel at (row, column).
    #[must_use]
    pub fn get(&self, row: u32, col: u32) -> Option<u16> {
        if row >= self.height || col >= self.width {
            return None;
        }
        self.pixels
            .get(row as usize * self.width as usize + col as usize)
            .copied()
    }

    /// Copy into a `(height, width)` float array for analysis.
    #[must_use]
    pub fn to_array(&self) -> Array2<f64> {
        let width = self.width as usize;
        Array2::from_shape_fn((self.height as usize, width), |(r, c)| {
            self.pixels
                .get(r * width + c)
                .map_or(0.0, |&p| f64::from(p))
        })
    }
}
