//! Reduction of a 2-D camera frame to a 1-D autocorrelation profile.

use ndarray::{Array1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{AcquisitionError, DaqError};

/// Direction of the averaging applied to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AverageAxis {
    /// Average down each column: one value per column.
    #[default]
    Vertical,
    /// Average along each row: one value per row.
    Horizontal,
}

impl AverageAxis {
    /// Build from a pair of mutually exclusive toggles.
    pub fn from_toggles(vertical: bool, horizontal: bool) -> Result<Self, AcquisitionError> {
        match (vertical, horizontal) {
            (true, false) => Ok(AverageAxis::Vertical),
            (false, true) => Ok(AverageAxis::Horizontal),
            (true, true) => Err(AcquisitionError::InvalidParameter(
                "vertical and horizontal averaging are mutually exclusive".into(),
            )),
            (false, false) => Err(AcquisitionError::InvalidParameter(
                "select vertical or horizontal averaging".into(),
            )),
        }
    }

    /// ndarray axis that is collapsed.
    #[must_use]
    pub fn axis(self) -> Axis {
        match self {
            AverageAxis::Vertical => Axis(0),
            AverageAxis::Horizontal => Axis(1),
        }
    }
}

/// Mean of `frame` (shape `(rows, cols)`) along `axis`.
pub fn average_profile(
    frame: ArrayView2<'_, f64>,
    axis: AverageAxis,
) -> Result<Array1<f64>, AcquisitionError> {
    frame.mean_axis(axis.axis()).ok_or_else(|| {
        AcquisitionError::DegenerateInput(format!("cannot average empty frame {:?}", frame.shape()))
    })
}

/// Parse a profile from text: numbers separated by whitespace or commas.
/// Lines starting with `#` are ignored.
pub fn parse_profile(text: &str) -> Result<Vec<f64>, DaqError> {
    let mut values = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        for token in line.split(|c: char| c == ',' || c.is_whitespace()) {
            if token.is_empty() {
                continue;
            }
            let value: f64 = token.parse().map_err(|_| {
                DaqError::ProfileParse(format!("line {}: '{token}' is not a number", line_no + 1))
            })?;
            values.push(value);
        }
    }
    if values.is_empty() {
        return Err(DaqError::ProfileParse("no values found".into()));
    }
    Ok(values)
}
