//! Capture, plate-solve and correct loop, plus polar axis measurement.

mod controller;
mod error;
pub mod polar;
mod types;

pub use controller::{AlignmentController, MAXIMUM_SOLVER_ITERATIONS};
pub use error::AlignError;
pub use polar::{Direction, Operator, PolarAxis, PolarError, PolarStage};
pub use types::{
    AlignConfig, AlignEvent, AlignSettings, AlignState, AlignTask, AlignmentMode, CaptureRequest,
    Solution,
};
