//! Padding Modes
//!
//! Conv2D and MaxPooling2D share one padding computation per spatial axis:
//!
//! ```text
//! valid:  out = floor((in - k) / stride) + 1        no padding
//! same:   out = ceil(in / stride)
//!         total = max(0, (out - 1) * stride + k - in)
//!         before = floor(total / 2), after = total - before
//! ```
//!
//! With odd totals the extra cell goes after, matching the usual
//! TensorFlow convention.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a windowed layer treats the borders of its input
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Padding {
    #[default]
    Valid,
    Same,
}

impl FromStr for Padding {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "valid" => Ok(Padding::Valid),
            "same" => Ok(Padding::Same),
            other => Err(EngineError::InvalidConfiguration(format!(
                "unknown padding mode '{}', expected 'valid' or 'same'",
                other
            ))),
        }
    }
}

impl fmt::Display for Padding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Padding::Valid => write!(f, "valid"),
            Padding::Same => write!(f, "same"),
        }
    }
}

/// Resolved geometry of one spatial axis
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AxisPlan {
    pub output: usize,
    pub before: usize,
    pub after: usize,
}

impl Padding {
    /// Output size and padding for one axis
    pub fn plan(&self, input: usize, kernel: usize, stride: usize) -> Result<AxisPlan> {
        if kernel == 0 || stride == 0 {
            return Err(EngineError::InvalidConfiguration(format!(
                "kernel ({}) and stride ({}) must be positive",
                kernel, stride
            )));
        }
        if input == 0 {
            return Err(EngineError::ShapeMismatch(
                "cannot window an empty spatial axis".to_string(),
            ));
        }
        match self {
            Padding::Valid => {
                if input < kernel {
                    return Err(EngineError::ShapeMismatch(format!(
                        "window of {} does not fit an input of {} without padding",
                        kernel, input
                    )));
                }
                Ok(AxisPlan {
                    output: (input - kernel) / stride + 1,
                    before: 0,
                    after: 0,
                })
            }
            Padding::Same => {
                let output = input.div_ceil(stride);
                let total = ((output - 1) * stride + kernel).saturating_sub(input);
                let before = total / 2;
                Ok(AxisPlan {
                    output,
                    before,
                    after: total - before,
                })
            }
        }
    }
}
