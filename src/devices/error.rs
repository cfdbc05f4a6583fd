use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeviceError {
    #[error("no {0} configured")]
    NotPresent(&'static str),
    #[error("{0} is not connected")]
    NotConnected(&'static str),
    #[error("{0} is busy")]
    Busy(&'static str),
    #[error("{0} does not support this operation")]
    Unsupported(&'static str),
    #[error("command failed: {0}")]
    CommandFailed(String),
}
