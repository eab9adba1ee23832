// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use crate::coords::Shape;

pub type Result<T> = std::result::Result<T, SpotError>;

/// Errors raised by detection and measurement operations. Each one aborts
/// only the offending operation; collections are left untouched.
#[derive(Debug, thiserror::Error)]
pub enum SpotError {
    #[error("Incompatible shape: expected {expected:?}, got {actual:?}")]
    ShapeMismatch { expected: Shape, actual: Shape },

    #[error("Spot has no voxels")]
    EmptySpot,

    #[error("Invalid quantile {0}; must lie in [0, 1]")]
    InvalidQuantile(f64),

    #[error("Invalid percentile {0}; must lie in [0, 100]")]
    InvalidPercentile(f64),

    #[error("Invalid radius {0}")]
    InvalidRadius(f64),

    #[error("Collection length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Cube has no physical scale")]
    MissingScale,

    #[error("Cannot parse detection command: {0}")]
    ParseDetect(String),

    #[error("Bad configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Inconsistent configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
