use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::astro::SkyCoordinate;

pub const DEFAULT_PRIORITY: u8 = 10;
pub const LOWEST_PRIORITY: u8 = 20;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTarget {
    /// J2000 position.
    Coordinates(SkyCoordinate),
    /// Image whose solved centre becomes the target before the run.
    Fits(PathBuf),
}

/// Optional phases of a job. Slewing is `track`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSteps {
    #[serde(default = "enabled")]
    pub track: bool,
    #[serde(default = "enabled")]
    pub focus: bool,
    #[serde(default = "enabled")]
    pub align: bool,
    #[serde(default = "enabled")]
    pub guide: bool,
}

fn enabled() -> bool {
    true
}

impl Default for JobSteps {
    fn default() -> Self {
        Self {
            track: true,
            focus: true,
            align: true,
            guide: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobConstraints {
    pub min_altitude_deg: Option<f64>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub enforce_weather: bool,
    pub min_moon_separation_deg: Option<f64>,
    /// Filter the sequence needs in the wheel.
    pub filter: Option<String>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Idle,
    /// Waiting for its window to open.
    Scheduled,
    Running,
    Aborted,
    Complete,
    Error,
}

impl JobState {
    /// Jobs in these states are never selected again during a run.
    pub fn is_final(self) -> bool {
        matches!(self, JobState::Aborted | JobState::Complete | JobState::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservationJob {
    pub name: String,
    pub target: JobTarget,
    pub sequence: PathBuf,
    pub steps: JobSteps,
    pub constraints: JobConstraints,
    /// 0 is the most urgent, [`LOWEST_PRIORITY`] the least.
    pub priority: u8,
    pub state: JobState,
}

impl ObservationJob {
    pub fn new(name: impl Into<String>, target: JobTarget, sequence: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            target,
            sequence: sequence.into(),
            steps: JobSteps::default(),
            constraints: JobConstraints::default(),
            priority: DEFAULT_PRIORITY,
            state: JobState::Idle,
        }
    }

    pub fn coordinates(&self) -> Option<SkyCoordinate> {
        match &self.target {
            JobTarget::Coordinates(c) => Some(*c),
            JobTarget::Fits(_) => None,
        }
    }
}
