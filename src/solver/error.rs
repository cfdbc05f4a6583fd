use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolveError {
    #[error("solver engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("solver timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("no solution found")]
    NoSolution,
    #[error("malformed image: {0}")]
    MalformedImage(String),
    #[error("a solve is already in progress")]
    Busy,
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SolveError {
    fn from(err: std::io::Error) -> Self {
        SolveError::Io(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum HintError {
    #[error("search RA {0} outside [0, 24) hours")]
    Ra(f64),
    #[error("search Dec {0} outside [-90, 90] degrees")]
    Dec(f64),
    #[error("search radius {0} must be positive")]
    Radius(f64),
}
