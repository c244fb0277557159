//! Error types for the polarization math library

use thiserror::Error;

/// Result type alias for polarization math operations
pub type Result<T> = std::result::Result<T, PolMathError>;

/// Validation failures raised before any pixel is touched
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolMathError {
    #[error("Invalid image shape: expected {expected}, got {actual}")]
    InvalidShape { expected: String, actual: String },

    #[error("Image too small: {width}x{height}, minimum is {min}x{min}")]
    TooSmall {
        width: usize,
        height: usize,
        min: usize,
    },

    #[error("Image dimensions {width}x{height} must be multiples of {multiple}")]
    NotMultipleOf {
        width: usize,
        height: usize,
        multiple: usize,
    },

    #[error("Channel count mismatch: expected {expected}, got {actual}")]
    ChannelMismatch { expected: usize, actual: usize },

    #[error("Image dimensions differ: {first:?} vs {other:?}")]
    ShapeMismatch {
        first: (usize, usize),
        other: (usize, usize),
    },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

impl PolMathError {
    pub fn invalid_shape<E: Into<String>, A: Into<String>>(expected: E, actual: A) -> Self {
        Self::InvalidShape {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn invalid_parameter<S: Into<String>>(msg: S) -> Self {
        Self::InvalidParameter(msg.into())
    }
}
