use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::error::DeviceError;

/// Progress of a long-running device command, polled by the controllers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum OperationStatus {
    Idle,
    Busy,
    Complete,
    Failed(String),
}

impl OperationStatus {
    pub fn is_busy(&self) -> bool {
        matches!(self, OperationStatus::Busy)
    }
}

/// Where the camera delivers finished frames.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum UploadMode {
    #[default]
    Client,
    Local,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChipFrame {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExposureRequest {
    pub ticket: u64,
    pub seconds: f64,
    pub bin_x: u32,
    pub bin_y: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapturedFrame {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub bin_x: u32,
    pub bin_y: u32,
}

/// Completion of an exposure, tagged with the ticket it was requested under.
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureOutcome {
    pub ticket: u64,
    pub result: Result<CapturedFrame, DeviceError>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum WeatherStatus {
    #[default]
    Ok,
    Warning,
    Alert,
}

#[derive(Debug, Clone, PartialEq, Serialize, strum_macros::Display)]
pub enum SessionStatus {
    Stopped,
    Starting,
    Started,
    Connecting,
    Connected,
    Failed(String),
}
