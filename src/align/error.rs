use thiserror::Error;

use crate::devices::DeviceError;
use crate::image::MissingMetadata;
use crate::solver::{HintError, SolveError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AlignError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("{0} is busy")]
    DeviceBusy(&'static str),
    #[error("solver failed: {0}")]
    Solve(SolveError),
    #[error("target not reached after {0} iterations")]
    Convergence(u32),
    #[error("device failure: {0}")]
    DeviceFailure(String),
    #[error(transparent)]
    MissingMetadata(#[from] MissingMetadata),
}

impl From<DeviceError> for AlignError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Busy(device) => AlignError::DeviceBusy(device),
            DeviceError::NotPresent(_)
            | DeviceError::NotConnected(_)
            | DeviceError::Unsupported(_) => AlignError::Configuration(err.to_string()),
            DeviceError::CommandFailed(_) => AlignError::DeviceFailure(err.to_string()),
        }
    }
}

impl From<HintError> for AlignError {
    fn from(err: HintError) -> Self {
        AlignError::Validation(err.to_string())
    }
}

impl From<SolveError> for AlignError {
    fn from(err: SolveError) -> Self {
        AlignError::Solve(err)
    }
}
