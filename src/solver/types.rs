use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::error::{HintError, SolveError};
use crate::astro::FieldBounds;

pub const DEFAULT_SEARCH_RADIUS_DEG: f64 = 30.0;

/// Position and radius the solver should search around.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SearchHint {
    ra_hours: f64,
    dec_deg: f64,
    radius_deg: f64,
}

impl SearchHint {
    pub fn new(ra_hours: f64, dec_deg: f64, radius_deg: f64) -> Result<Self, HintError> {
        if !(0.0..24.0).contains(&ra_hours) {
            return Err(HintError::Ra(ra_hours));
        }
        if !(-90.0..=90.0).contains(&dec_deg) {
            return Err(HintError::Dec(dec_deg));
        }
        if !(radius_deg > 0.0 && radius_deg.is_finite()) {
            return Err(HintError::Radius(radius_deg));
        }
        Ok(Self {
            ra_hours,
            dec_deg,
            radius_deg,
        })
    }

    pub fn ra_hours(&self) -> f64 {
        self.ra_hours
    }

    pub fn dec_degrees(&self) -> f64 {
        self.dec_deg
    }

    pub fn radius_degrees(&self) -> f64 {
        self.radius_deg
    }
}

/// User-supplied hint as it appears in configuration. Validated into a
/// [`SearchHint`] only when a solve is about to be issued.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HintInput {
    pub ra_hours: f64,
    pub dec_deg: f64,
    #[serde(default = "default_radius")]
    pub radius_deg: f64,
}

fn default_radius() -> f64 {
    DEFAULT_SEARCH_RADIUS_DEG
}

impl HintInput {
    pub fn validate(&self) -> Result<SearchHint, HintError> {
        SearchHint::new(self.ra_hours, self.dec_deg, self.radius_deg)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolveRequest {
    pub ticket: u64,
    pub image: PathBuf,
    pub bounds: Option<FieldBounds>,
    pub hint: Option<SearchHint>,
}

/// Solver output. Coordinates are J2000.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SolveResult {
    pub orientation_deg: f64,
    pub ra_deg: f64,
    pub dec_deg: f64,
    pub pixel_scale_arcsec_per_px: f64,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolveCompletion {
    pub ticket: u64,
    pub outcome: Result<SolveResult, SolveError>,
}
