mod args;
mod astrometry;
mod error;
pub mod sim;
mod types;

pub use args::{build_args, default_args, parse_solution, SolverOptions};
pub use astrometry::AstrometrySolver;
pub use error::{HintError, SolveError};
pub use sim::SimulatedSolver;
pub use types::{
    HintInput, SearchHint, SolveCompletion, SolveRequest, SolveResult, DEFAULT_SEARCH_RADIUS_DEG,
};

/// Asynchronous plate solver. At most one request is in flight; completions are
/// picked up by polling. Implementations never retry on their own.
pub trait PlateSolver: Send {
    fn submit(&mut self, request: SolveRequest) -> Result<(), SolveError>;
    fn poll(&mut self) -> Option<SolveCompletion>;
    fn cancel(&mut self);
    fn is_busy(&self) -> bool;
}
