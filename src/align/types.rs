use serde::{Deserialize, Serialize};

use super::error::AlignError;
use super::polar::PolarError;
use crate::astro::{HorizontalCoordinate, ObserverSite, OpticalGeometry, SkyCoordinate};
use crate::solver::HintInput;

/// What to do with the mount once an image is solved.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentMode {
    /// Sync the mount to the solution and stop.
    Sync,
    /// Repeat capture, solve and slew until the target is within accuracy.
    #[default]
    Slew,
    /// Only report the solution.
    NoAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum_macros::Display)]
pub enum AlignTask {
    Goto,
    PolarAlign,
    LoadAndSlew,
    SolveFile,
}

/// Publicly visible progress of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum_macros::Display)]
pub enum AlignState {
    Idle,
    SelectingFilter,
    Capturing,
    Solving,
    Slewing,
    Complete,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlignSettings {
    #[serde(default = "default_exposure")]
    pub exposure_s: f64,
    #[serde(default = "default_binning")]
    pub binning: u32,
    #[serde(default = "default_accuracy")]
    pub accuracy_arcsec: f64,
    #[serde(default)]
    pub mode: AlignmentMode,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default = "default_retries")]
    pub solver_retries: u32,
    #[serde(default = "default_retries")]
    pub capture_retries: u32,
    /// Filter moved into place before every alignment exposure.
    #[serde(default)]
    pub locked_filter: Option<String>,
    #[serde(default)]
    pub search_hint: Option<HintInput>,
}

fn default_exposure() -> f64 {
    5.0
}

fn default_binning() -> u32 {
    2
}

fn default_accuracy() -> f64 {
    30.0
}

fn default_retries() -> u32 {
    3
}

impl Default for AlignSettings {
    fn default() -> Self {
        Self {
            exposure_s: default_exposure(),
            binning: default_binning(),
            accuracy_arcsec: default_accuracy(),
            mode: AlignmentMode::default(),
            verbose: false,
            solver_retries: default_retries(),
            capture_retries: default_retries(),
            locked_filter: None,
            search_hint: None,
        }
    }
}

/// Everything the controller is configured with, replaced as a whole through
/// `update_configuration`.
#[derive(Debug, Clone, Default)]
pub struct AlignConfig {
    pub settings: AlignSettings,
    pub optics: OpticalGeometry,
    pub site: ObserverSite,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub exposure_s: f64,
    pub bin_x: u32,
    pub bin_y: u32,
    pub geometry: OpticalGeometry,
    pub mode: AlignmentMode,
}

impl CaptureRequest {
    pub fn from_config(config: &AlignConfig) -> Self {
        Self {
            exposure_s: config.settings.exposure_s,
            bin_x: config.settings.binning,
            bin_y: config.settings.binning,
            geometry: config.optics,
            mode: config.settings.mode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Solution {
    /// Solved centre in the apparent frame.
    pub coordinate: SkyCoordinate,
    pub j2000: SkyCoordinate,
    pub horizontal: HorizontalCoordinate,
    pub orientation_deg: f64,
    pub pixel_scale_arcsec_per_px: f64,
    /// Planar distance to the session target, when there is one.
    pub target_diff_arcsec: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlignEvent {
    Message(String),
    Solved(Solution),
    PolarError(PolarError),
    Completed {
        task: AlignTask,
        solution: Solution,
        iterations: u32,
    },
    Failed {
        task: AlignTask,
        error: AlignError,
    },
    Aborted,
}
