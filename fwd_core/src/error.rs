//! Error types for the forward tracker.

use crate::calibration::AlignmentLink;
use crate::types::PlaneKey;
use thiserror::Error;

#[derive(Error, Clone, Debug, PartialEq)]
pub enum FwdError {
    /// A calibration row needed to resolve one sensor is missing or malformed.
    #[error("calibration error in {link} for sensor {sensor}: {reason}")]
    Calibration {
        link: AlignmentLink,
        sensor: usize,
        reason: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("insufficient hits: need {required}, found {found}")]
    InsufficientHits { required: usize, found: usize },

    /// Extrapolation diverged, hit a parallel plane, or an update was singular.
    #[error("propagation failure: {0}")]
    Propagation(String),

    #[error("fit did not converge")]
    FitNotConverged,

    #[error("unknown plane {0}")]
    UnknownPlane(PlaneKey),
}

impl FwdError {
    /// Short stable name, used to aggregate failures per event.
    pub fn kind(&self) -> &'static str {
        match self {
            FwdError::Calibration { .. } => "calibration",
            FwdError::Config(_) => "config",
            FwdError::InsufficientHits { .. } => "insufficient_hits",
            FwdError::Propagation(_) => "propagation",
            FwdError::FitNotConverged => "not_converged",
            FwdError::UnknownPlane(_) => "unknown_plane",
        }
    }
}

impl From<std::io::Error> for FwdError {
    fn from(e: std::io::Error) -> Self {
        FwdError::Config(e.to_string())
    }
}

impl From<serde_json::Error> for FwdError {
    fn from(e: serde_json::Error) -> Self {
        FwdError::Config(e.to_string())
    }
}

impl From<toml::de::Error> for FwdError {
    fn from(e: toml::de::Error) -> Self {
        FwdError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FwdError>;
