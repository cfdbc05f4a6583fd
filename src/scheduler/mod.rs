mod controller;
pub mod job;
pub mod journal;
pub mod parser;
pub mod runner;
pub mod scorer;

pub use controller::{
    Phase, SchedulerController, SchedulerError, SchedulerEvent, SchedulerSettings, ShutdownStage,
};
pub use job::{JobConstraints, JobState, JobSteps, JobTarget, ObservationJob};
pub use journal::{Journal, RunLog, RunState};
pub use parser::{JobList, ParseError};
pub use runner::{Runner, RunnerStatus};
