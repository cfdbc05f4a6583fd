use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoordinateError {
    #[error("right ascension must be between 0.0 and 24.0 hours, got {0}")]
    RaOutOfRange(f64),
    #[error("declination must be between -90.0 and 90.0 degrees, got {0}")]
    DecOutOfRange(f64),
    #[error("invalid sexagesimal value: {0}")]
    Parse(String),
}
