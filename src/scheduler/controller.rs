use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::job::{JobState, JobTarget, ObservationJob};
use super::journal::{JobOutcome, Journal, RunState};
use super::scorer::{self, Conditions};
use crate::align::{AlignError, AlignEvent, AlignmentController};
use crate::astro::{moon_position, ObserverSite};
use crate::devices::{DeviceError, OperationStatus, Rig, SessionStatus};

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSettings {
    /// Interval between status checks.
    #[serde(
        default = "default_poll_interval",
        deserialize_with = "crate::config::deserialize_duration"
    )]
    pub poll_interval: Duration,
    /// Retries of a phase that reports a failed status before the job errors out.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    /// A phase without progress for this long counts as failed.
    #[serde(
        default = "default_phase_timeout",
        deserialize_with = "crate::config::deserialize_duration"
    )]
    pub phase_timeout: Duration,
    #[serde(default)]
    pub journal_dir: Option<PathBuf>,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_retry_budget() -> u32 {
    3
}

fn default_phase_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            retry_budget: default_retry_budget(),
            phase_timeout: default_phase_timeout(),
            journal_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum_macros::Display)]
pub enum ShutdownStage {
    ParkTelescope,
    WarmCcd,
    CloseDome,
}

impl ShutdownStage {
    fn next(self) -> Option<Self> {
        match self {
            ShutdownStage::ParkTelescope => Some(ShutdownStage::WarmCcd),
            ShutdownStage::WarmCcd => Some(ShutdownStage::CloseDome),
            ShutdownStage::CloseDome => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum_macros::Display)]
pub enum Phase {
    Idle,
    StartingDevices,
    Connecting,
    Connected,
    /// Solving the image of a FITS-referenced job.
    ResolvingTarget,
    Slewing,
    Focusing,
    Aligning,
    Guiding,
    Capturing,
    Finished,
    Aborted,
    Shutdown(ShutdownStage),
    Stopped,
}

impl Phase {
    fn is_job_phase(self) -> bool {
        matches!(
            self,
            Phase::Slewing | Phase::Focusing | Phase::Aligning | Phase::Guiding | Phase::Capturing
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    PhaseChanged {
        job: Option<String>,
        phase: Phase,
    },
    JobStarted(String),
    JobEnded {
        job: String,
        state: JobState,
        reason: Option<String>,
    },
    Stopped(RunState),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no jobs to run")]
    NoJobs,
    #[error("scheduler is already running")]
    AlreadyRunning,
    #[error("journal: {0}")]
    Journal(#[from] std::io::Error),
}

/// How a phase went wrong, which decides what happens to the job.
#[derive(Debug, Clone, PartialEq)]
enum Failure {
    /// Command error: the job is aborted and the next one selected.
    Device(String),
    /// Failed status: the phase is retried within the budget.
    Retry(String),
    /// Not recoverable by retrying: the job ends in error.
    Fatal(String),
}

impl From<DeviceError> for Failure {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Busy(_) => Failure::Retry(err.to_string()),
            _ => Failure::Device(err.to_string()),
        }
    }
}

impl From<AlignError> for Failure {
    fn from(err: AlignError) -> Self {
        match err {
            AlignError::Solve(_) | AlignError::DeviceBusy(_) => Failure::Retry(err.to_string()),
            AlignError::DeviceFailure(_) => Failure::Device(err.to_string()),
            AlignError::Configuration(_)
            | AlignError::Validation(_)
            | AlignError::Convergence(_)
            | AlignError::MissingMetadata(_) => Failure::Fatal(err.to_string()),
        }
    }
}

struct RunProgress {
    current: Option<usize>,
    resolving: Option<usize>,
    retries: u32,
    attempts: u32,
    phase_started: DateTime<Utc>,
    job_started: DateTime<Utc>,
    stop_requested: bool,
    outcome: RunState,
}

/// Runs observation jobs one after another through their phases.
///
/// Everything happens inside [`SchedulerController::tick`], which checks the
/// collaborator of the current phase and moves on when it reports completion.
pub struct SchedulerController {
    settings: SchedulerSettings,
    site: ObserverSite,
    jobs: Vec<ObservationJob>,
    align: AlignmentController,
    journal: Option<Journal>,
    phase: Phase,
    run: Option<RunProgress>,
    events: Vec<SchedulerEvent>,
}

impl SchedulerController {
    pub fn new(
        settings: SchedulerSettings,
        site: ObserverSite,
        jobs: Vec<ObservationJob>,
        align: AlignmentController,
    ) -> Self {
        Self {
            settings,
            site,
            jobs,
            align,
            journal: None,
            phase: Phase::Idle,
            run: None,
            events: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn jobs(&self) -> &[ObservationJob] {
        &self.jobs
    }

    pub fn align(&self) -> &AlignmentController {
        &self.align
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    pub fn current_job(&self) -> Option<&ObservationJob> {
        self.run
            .as_ref()
            .and_then(|r| r.current)
            .and_then(|i| self.jobs.get(i))
    }

    pub fn journal(&self) -> Option<&Journal> {
        self.journal.as_ref()
    }

    pub fn drain_events(&mut self) -> Vec<SchedulerEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn start(&mut self, rig: &mut Rig, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        if self.run.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }
        if self.jobs.is_empty() {
            return Err(SchedulerError::NoJobs);
        }
        if let Some(dir) = &self.settings.journal_dir {
            let journal = Journal::create(dir, now)?;
            log::info!("Journal at {}", journal.path().display());
            self.journal = Some(journal);
        }

        self.run = Some(RunProgress {
            current: None,
            resolving: None,
            retries: 0,
            attempts: 0,
            phase_started: now,
            job_started: now,
            stop_requested: false,
            outcome: RunState::Completed,
        });
        log::info!("Scheduler started with {} job(s)", self.jobs.len());

        if rig.session.is_some() {
            self.enter_session_phase(rig, now, Phase::StartingDevices);
        } else {
            self.set_phase(now, Phase::Connected);
        }
        Ok(())
    }

    /// Aborts the running job and shuts the observatory down.
    pub fn stop(&mut self, rig: &mut Rig, now: DateTime<Utc>) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        if run.stop_requested {
            return;
        }
        run.stop_requested = true;
        run.outcome = RunState::Stopped;
        log::info!("Scheduler stop requested");

        match self.phase {
            Phase::Shutdown(_) | Phase::Stopped => {}
            Phase::Idle | Phase::StartingDevices | Phase::Connecting => self.finish(now),
            Phase::ResolvingTarget => {
                self.align.abort(rig);
                self.begin_shutdown(rig, now);
            }
            phase if phase.is_job_phase() => {
                self.end_job(rig, now, JobState::Aborted, Some("stopped".into()));
                self.begin_shutdown(rig, now);
            }
            _ => self.begin_shutdown(rig, now),
        }
    }

    pub fn tick(&mut self, rig: &mut Rig, now: DateTime<Utc>) {
        let Some(run) = self.run.as_ref() else {
            return;
        };
        let elapsed = (now - run.phase_started).to_std().unwrap_or_default();
        if elapsed >= self.settings.phase_timeout && self.is_waiting_phase() {
            return self.on_timeout(rig, now);
        }

        match self.phase {
            Phase::Idle | Phase::Stopped => {}
            Phase::StartingDevices => self.poll_session(rig, now, SessionStatus::Started),
            Phase::Connecting => self.poll_session(rig, now, SessionStatus::Connected),
            Phase::Connected | Phase::Finished | Phase::Aborted => self.select_next(rig, now),
            Phase::ResolvingTarget => self.poll_resolve(rig, now),
            Phase::Slewing => {
                if rig.mount().is_ok_and(|m| !m.is_slewing()) {
                    self.advance(rig, now);
                }
            }
            Phase::Focusing => {
                let status = rig.focuser.as_ref().map(|f| f.status());
                self.poll_operation(rig, now, status);
            }
            Phase::Aligning => self.poll_align(rig, now),
            Phase::Guiding => {
                let status = rig.guider.as_ref().map(|g| g.status());
                self.poll_operation(rig, now, status);
            }
            Phase::Capturing => {
                let status = rig.sequencer.as_ref().map(|s| s.status());
                self.poll_operation(rig, now, status);
            }
            Phase::Shutdown(stage) => self.poll_shutdown(rig, now, stage),
        }
    }

    fn is_waiting_phase(&self) -> bool {
        !matches!(
            self.phase,
            Phase::Idle | Phase::Stopped | Phase::Connected | Phase::Finished | Phase::Aborted
        )
    }

    fn on_timeout(&mut self, rig: &mut Rig, now: DateTime<Utc>) {
        let reason = format!("{} timed out", self.phase);
        log::warn!("{}", reason);
        match self.phase {
            Phase::StartingDevices | Phase::Connecting => self.session_failed(rig, now, reason),
            Phase::ResolvingTarget => {
                self.align.abort(rig);
                self.target_unresolved(now, reason);
            }
            Phase::Shutdown(stage) => self.next_shutdown_stage(rig, now, stage),
            _ => self.fail(rig, now, Failure::Retry(reason)),
        }
    }

    fn set_phase(&mut self, now: DateTime<Utc>, phase: Phase) {
        let job = self.current_job().map(|j| j.name.clone());
        if let Some(run) = self.run.as_mut() {
            run.phase_started = now;
        }
        if phase != self.phase {
            match &job {
                Some(name) => log::info!("{}: {}", name, phase),
                None => log::info!("Scheduler: {}", phase),
            }
            self.events.push(SchedulerEvent::PhaseChanged { job, phase });
        }
        self.phase = phase;
    }

    fn enter_session_phase(&mut self, rig: &mut Rig, now: DateTime<Utc>, phase: Phase) {
        self.set_phase(now, phase);
        let Some(session) = rig.session.as_mut() else {
            return self.set_phase(now, Phase::Connected);
        };
        let issued = match phase {
            Phase::StartingDevices => session.start_devices(),
            _ => session.connect(),
        };
        if let Err(e) = issued {
            self.session_failed(rig, now, e.to_string());
        }
    }

    fn poll_session(&mut self, rig: &mut Rig, now: DateTime<Utc>, ready: SessionStatus) {
        let Some(status) = rig.session.as_ref().map(|s| s.status()) else {
            return self.set_phase(now, Phase::Connected);
        };
        if status == ready {
            if let Some(run) = self.run.as_mut() {
                run.retries = 0;
            }
            match self.phase {
                Phase::StartingDevices => self.enter_session_phase(rig, now, Phase::Connecting),
                _ => self.set_phase(now, Phase::Connected),
            }
        } else if let SessionStatus::Failed(reason) = status {
            self.session_failed(rig, now, reason);
        }
    }

    fn session_failed(&mut self, rig: &mut Rig, now: DateTime<Utc>, reason: String) {
        let budget = self.settings.retry_budget;
        let Some(run) = self.run.as_mut() else {
            return;
        };
        if run.retries < budget {
            run.retries += 1;
            log::warn!(
                "{} failed ({}), retrying {}/{}",
                self.phase,
                reason,
                run.retries,
                budget
            );
            let phase = self.phase;
            return self.enter_session_phase(rig, now, phase);
        }
        log::error!("Devices could not be brought up: {}", reason);
        run.outcome = RunState::Failed;
        self.finish(now);
    }

    fn select_next(&mut self, rig: &mut Rig, now: DateTime<Utc>) {
        if self.run.as_ref().is_some_and(|r| r.stop_requested) {
            return self.begin_shutdown(rig, now);
        }

        while let Some(index) = self.next_unresolved() {
            let JobTarget::Fits(path) = self.jobs[index].target.clone() else {
                continue;
            };
            log::info!("{}: solving {} for target", self.jobs[index].name, path.display());
            if let Some(run) = self.run.as_mut() {
                run.resolving = Some(index);
            }
            match self.align.solve_file(rig, &path) {
                Ok(()) => return self.set_phase(now, Phase::ResolvingTarget),
                Err(e) => self.target_unresolved(now, e.to_string()),
            }
        }

        let filters = rig.available_filters();
        let conditions = Conditions {
            now,
            site: self.site,
            weather: rig.weather_status(),
            moon: moon_position(now),
            filters: &filters,
        };

        if let Some(&(index, score)) = scorer::rank(&self.jobs, &conditions).first() {
            log::info!(
                "Selected {} (priority {}, altitude {:.1}°, suitability {:.1})",
                self.jobs[index].name,
                score.priority,
                score.altitude_deg,
                score.suitability
            );
            return self.start_job(rig, now, index);
        }

        let mut pending = false;
        for job in self.jobs.iter_mut().filter(|j| !j.state.is_final()) {
            if let Err(reason) = scorer::score(job, &conditions) {
                if reason.is_pending() {
                    job.state = JobState::Scheduled;
                    pending = true;
                }
            }
        }
        if pending {
            if self.phase != Phase::Connected {
                log::info!("Waiting for the next job window");
                self.set_phase(now, Phase::Connected);
            }
        } else {
            log::info!("No eligible jobs left");
            self.begin_shutdown(rig, now);
        }
    }

    fn next_unresolved(&self) -> Option<usize> {
        self.jobs
            .iter()
            .position(|j| matches!(j.target, JobTarget::Fits(_)) && !j.state.is_final())
    }

    fn poll_resolve(&mut self, rig: &mut Rig, now: DateTime<Utc>) {
        self.align.service(rig);
        for event in self.align.drain_events() {
            match event {
                AlignEvent::Completed { solution, .. } => {
                    let Some(index) = self.run.as_mut().and_then(|r| r.resolving.take()) else {
                        continue;
                    };
                    let job = &mut self.jobs[index];
                    log::info!(
                        "{}: image solved to RA {:.4}h Dec {:.4}°",
                        job.name,
                        solution.j2000.ra_hours(),
                        solution.j2000.dec_degrees()
                    );
                    job.target = JobTarget::Coordinates(solution.j2000);
                    self.set_phase(now, Phase::Connected);
                }
                AlignEvent::Failed { error, .. } => self.target_unresolved(now, error.to_string()),
                _ => {}
            }
        }
    }

    fn target_unresolved(&mut self, now: DateTime<Utc>, reason: String) {
        let Some(index) = self.run.as_mut().and_then(|r| r.resolving.take()) else {
            return;
        };
        self.jobs[index].state = JobState::Error;
        let name = self.jobs[index].name.clone();
        log::error!("{}: target image could not be solved: {}", name, reason);
        self.events.push(SchedulerEvent::JobEnded {
            job: name,
            state: JobState::Error,
            reason: Some(reason.clone()),
        });
        self.record(index, now, now, 0, Some(reason));
        self.set_phase(now, Phase::Connected);
    }

    fn start_job(&mut self, rig: &mut Rig, now: DateTime<Utc>, index: usize) {
        self.jobs[index].state = JobState::Running;
        if let Some(run) = self.run.as_mut() {
            run.current = Some(index);
            run.retries = 0;
            run.attempts = 1;
            run.job_started = now;
        }
        self.events
            .push(SchedulerEvent::JobStarted(self.jobs[index].name.clone()));
        match self.next_job_phase(None) {
            Some(phase) => self.enter_job_phase(rig, now, phase),
            None => self.end_job(rig, now, JobState::Complete, None),
        }
    }

    /// Enabled phase following `after`, or the first one when `None`.
    fn next_job_phase(&self, after: Option<Phase>) -> Option<Phase> {
        let steps = self.current_job()?.steps;
        let order = [
            (Phase::Slewing, steps.track),
            (Phase::Focusing, steps.focus),
            (Phase::Aligning, steps.align),
            (Phase::Guiding, steps.guide),
            (Phase::Capturing, true),
        ];
        let start = match after {
            Some(after) => order.iter().position(|(p, _)| *p == after)? + 1,
            None => 0,
        };
        order[start..]
            .iter()
            .find(|(_, enabled)| *enabled)
            .map(|(p, _)| *p)
    }

    fn enter_job_phase(&mut self, rig: &mut Rig, now: DateTime<Utc>, phase: Phase) {
        let mut next = Some(phase);
        while let Some(phase) = next {
            self.set_phase(now, phase);
            match self.issue(rig, now, phase) {
                Ok(true) => return,
                Ok(false) => next = self.next_job_phase(Some(phase)),
                Err(failure) => return self.fail(rig, now, failure),
            }
        }
        self.end_job(rig, now, JobState::Complete, None);
    }

    /// Sends the command that starts `phase`. `Ok(false)` means the device is
    /// absent and the phase is skipped.
    fn issue(&mut self, rig: &mut Rig, now: DateTime<Utc>, phase: Phase) -> Result<bool, Failure> {
        let Some(job) = self.current_job().cloned() else {
            return Ok(false);
        };
        match phase {
            Phase::Slewing => {
                let target = job
                    .coordinates()
                    .ok_or_else(|| Failure::Fatal("target is unresolved".into()))?
                    .to_apparent(now);
                rig.mount_mut()?.slew(target.ra_hours(), target.dec_degrees())?;
            }
            Phase::Focusing => match rig.focuser.as_mut() {
                Some(focuser) => focuser.start_autofocus()?,
                None => {
                    log::warn!("{}: no focuser, skipping focus", job.name);
                    return Ok(false);
                }
            },
            Phase::Aligning => {
                let request = self.align.default_request();
                self.align.start_capture(rig, request)?;
            }
            Phase::Guiding => match rig.guider.as_mut() {
                Some(guider) => guider.start_guiding()?,
                None => {
                    log::warn!("{}: no guider, skipping guiding", job.name);
                    return Ok(false);
                }
            },
            Phase::Capturing => {
                let sequencer = rig
                    .sequencer
                    .as_mut()
                    .ok_or_else(|| Failure::Fatal("no capture sequencer".into()))?;
                sequencer.start(&job.sequence)?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn poll_operation(&mut self, rig: &mut Rig, now: DateTime<Utc>, status: Option<OperationStatus>) {
        match status {
            Some(OperationStatus::Complete) | None => self.advance(rig, now),
            Some(OperationStatus::Failed(reason)) => self.fail(rig, now, Failure::Retry(reason)),
            Some(OperationStatus::Busy) | Some(OperationStatus::Idle) => {}
        }
    }

    fn poll_align(&mut self, rig: &mut Rig, now: DateTime<Utc>) {
        self.align.service(rig);
        let mut outcome = None;
        for event in self.align.drain_events() {
            match event {
                AlignEvent::Completed { iterations, .. } => {
                    log::info!("Alignment complete after {} iteration(s)", iterations);
                    outcome = Some(Ok(()));
                }
                AlignEvent::Failed { error, .. } => outcome = Some(Err(error)),
                _ => {}
            }
        }
        match outcome {
            Some(Ok(())) => self.advance(rig, now),
            Some(Err(error)) => self.fail(rig, now, error.into()),
            None => {}
        }
    }

    fn advance(&mut self, rig: &mut Rig, now: DateTime<Utc>) {
        if let Some(run) = self.run.as_mut() {
            run.retries = 0;
        }
        match self.next_job_phase(Some(self.phase)) {
            Some(phase) => self.enter_job_phase(rig, now, phase),
            None => self.end_job(rig, now, JobState::Complete, None),
        }
    }

    fn fail(&mut self, rig: &mut Rig, now: DateTime<Utc>, failure: Failure) {
        let budget = self.settings.retry_budget;
        match failure {
            Failure::Retry(reason) => {
                let Some(run) = self.run.as_mut() else {
                    return;
                };
                if run.retries < budget {
                    run.retries += 1;
                    run.attempts += 1;
                    log::warn!(
                        "{} failed ({}), retrying {}/{}",
                        self.phase,
                        reason,
                        run.retries,
                        budget
                    );
                    let phase = self.phase;
                    return self.enter_job_phase(rig, now, phase);
                }
                let reason = format!("{} failed after {} retries: {}", self.phase, budget, reason);
                self.end_job(rig, now, JobState::Error, Some(reason));
            }
            Failure::Fatal(reason) => self.end_job(rig, now, JobState::Error, Some(reason)),
            Failure::Device(reason) => self.end_job(rig, now, JobState::Aborted, Some(reason)),
        }
    }

    fn end_job(&mut self, rig: &mut Rig, now: DateTime<Utc>, state: JobState, reason: Option<String>) {
        let Some(index) = self.run.as_mut().and_then(|r| r.current.take()) else {
            return;
        };
        let (started, attempts) = self
            .run
            .as_ref()
            .map(|r| (r.job_started, r.attempts))
            .unwrap_or((now, 0));

        if state != JobState::Complete {
            match self.phase {
                Phase::Aligning => self.align.abort(rig),
                Phase::Capturing => {
                    if let Some(Err(e)) = rig.sequencer.as_mut().map(|s| s.abort()) {
                        log::warn!("Failed to abort sequence: {}", e);
                    }
                }
                _ => {}
            }
        }
        if self.jobs[index].steps.guide {
            if let Some(Err(e)) = rig.guider.as_mut().map(|g| g.stop_guiding()) {
                log::warn!("Failed to stop guiding: {}", e);
            }
        }

        let job = &mut self.jobs[index];
        job.state = state;
        match &reason {
            Some(reason) => log::error!("{}: {} ({})", job.name, state, reason),
            None => log::info!("{}: {}", job.name, state),
        }
        self.events.push(SchedulerEvent::JobEnded {
            job: job.name.clone(),
            state,
            reason: reason.clone(),
        });
        self.record(index, started, now, attempts, reason);

        let phase = if state == JobState::Complete {
            Phase::Finished
        } else {
            Phase::Aborted
        };
        self.set_phase(now, phase);
    }

    fn record(
        &mut self,
        index: usize,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        attempts: u32,
        error: Option<String>,
    ) {
        let job = &self.jobs[index];
        let outcome = JobOutcome {
            job: job.name.clone(),
            state: job.state,
            started_at,
            completed_at,
            attempts,
            error,
        };
        if let Some(journal) = self.journal.as_mut() {
            if let Err(e) = journal.record(outcome) {
                log::error!("Failed to write journal: {}", e);
            }
        }
    }

    fn begin_shutdown(&mut self, rig: &mut Rig, now: DateTime<Utc>) {
        log::info!("Starting shutdown sequence");
        self.enter_shutdown_stage(rig, now, ShutdownStage::ParkTelescope);
    }

    fn enter_shutdown_stage(&mut self, rig: &mut Rig, now: DateTime<Utc>, stage: ShutdownStage) {
        self.set_phase(now, Phase::Shutdown(stage));
        let issued = match stage {
            ShutdownStage::ParkTelescope => rig.mount.as_mut().map(|m| m.park()),
            ShutdownStage::WarmCcd => rig.camera.as_mut().map(|c| c.warm_up()),
            ShutdownStage::CloseDome => rig.dome.as_mut().map(|d| d.close()),
        };
        match issued {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                log::error!("{} failed: {}", stage, e);
                self.next_shutdown_stage(rig, now, stage);
            }
            None => self.next_shutdown_stage(rig, now, stage),
        }
    }

    fn poll_shutdown(&mut self, rig: &mut Rig, now: DateTime<Utc>, stage: ShutdownStage) {
        let done = match stage {
            ShutdownStage::ParkTelescope => rig.mount().map_or(true, |m| m.is_parked()),
            ShutdownStage::WarmCcd => rig.camera().map_or(true, |c| c.is_warm()),
            ShutdownStage::CloseDome => match rig.dome.as_ref().map(|d| d.status()) {
                Some(OperationStatus::Failed(reason)) => {
                    log::error!("Closing dome failed: {}", reason);
                    true
                }
                Some(OperationStatus::Busy) => false,
                _ => true,
            },
        };
        if done {
            self.next_shutdown_stage(rig, now, stage);
        }
    }

    fn next_shutdown_stage(&mut self, rig: &mut Rig, now: DateTime<Utc>, stage: ShutdownStage) {
        match stage.next() {
            Some(next) => self.enter_shutdown_stage(rig, now, next),
            None => self.finish(now),
        }
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        let Some(run) = self.run.take() else {
            return;
        };
        self.set_phase(now, Phase::Stopped);
        if let Some(journal) = self.journal.as_mut() {
            if let Err(e) = journal.finish(run.outcome, now) {
                log::error!("Failed to write journal: {}", e);
            }
        }
        log::info!("Scheduler stopped ({})", run.outcome);
        self.events.push(SchedulerEvent::Stopped(run.outcome));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::{AlignConfig, AlignSettings};
    use crate::astro::{local_sidereal_time, Clock, FixedClock, Frame, OpticalGeometry, SkyCoordinate};
    use crate::devices::sim::{build, lock, SimHandles, SimSettings};
    use crate::devices::WeatherStatus;
    use crate::scheduler::journal::RunLog;
    use crate::solver::SimulatedSolver;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 12, 22, 0, 0).unwrap()
    }

    fn site() -> ObserverSite {
        ObserverSite {
            latitude_deg: 48.0,
            longitude_deg: 11.0,
            altitude_m: 0.0,
        }
    }

    /// J2000 target on the meridian at Dec 40 at the start of the run.
    fn overhead() -> SkyCoordinate {
        let lst = local_sidereal_time(start_time(), site().longitude_deg);
        SkyCoordinate::new(lst, 40.0, Frame::Apparent)
            .unwrap()
            .to_j2000(start_time())
    }

    fn job(name: &str) -> ObservationJob {
        ObservationJob::new(name, JobTarget::Coordinates(overhead()), format!("{name}.esq"))
    }

    struct Harness {
        scheduler: SchedulerController,
        rig: Rig,
        sim: SimHandles,
        now: DateTime<Utc>,
    }

    fn harness(jobs: Vec<ObservationJob>, settings: SchedulerSettings) -> Harness {
        harness_with(jobs, settings, SimSettings::default())
    }

    fn harness_with(
        jobs: Vec<ObservationJob>,
        settings: SchedulerSettings,
        sim: SimSettings,
    ) -> Harness {
        let (rig, handles) = build(&sim);
        let clock: Arc<dyn Clock> = Arc::new(FixedClock(start_time()));
        let solver = SimulatedSolver::new(handles.mount.clone(), clock.clone(), 1);
        let config = AlignConfig {
            settings: AlignSettings::default(),
            optics: OpticalGeometry {
                focal_length_mm: Some(800.0),
                aperture_mm: Some(200.0),
                pixel_size_x_um: Some(3.8),
                pixel_size_y_um: Some(3.8),
                sensor_width_px: Some(1280),
                sensor_height_px: Some(1024),
                ..Default::default()
            },
            site: site(),
        };
        let align = AlignmentController::new(config, Box::new(solver), clock);
        Harness {
            scheduler: SchedulerController::new(settings, site(), jobs, align),
            rig,
            sim: handles,
            now: start_time(),
        }
    }

    impl Harness {
        fn start(&mut self) {
            self.scheduler.start(&mut self.rig, self.now).unwrap();
        }

        fn tick(&mut self) {
            self.now += chrono::Duration::seconds(1);
            self.scheduler.tick(&mut self.rig, self.now);
        }

        fn run(&mut self) -> Vec<SchedulerEvent> {
            for _ in 0..2000 {
                if self.scheduler.phase() == Phase::Stopped {
                    break;
                }
                self.tick();
            }
            self.scheduler.drain_events()
        }
    }

    fn phases(events: &[SchedulerEvent]) -> Vec<Phase> {
        events
            .iter()
            .filter_map(|e| match e {
                SchedulerEvent::PhaseChanged { phase, .. } => Some(*phase),
                _ => None,
            })
            .collect()
    }

    fn ended(events: &[SchedulerEvent]) -> Vec<(String, JobState)> {
        events
            .iter()
            .filter_map(|e| match e {
                SchedulerEvent::JobEnded { job, state, .. } => Some((job.clone(), *state)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn runs_job_through_every_phase_then_shuts_down() {
        let mut h = harness(vec![job("M42")], SchedulerSettings::default());
        h.start();
        let events = h.run();

        assert_eq!(
            phases(&events),
            vec![
                Phase::StartingDevices,
                Phase::Connecting,
                Phase::Connected,
                Phase::Slewing,
                Phase::Focusing,
                Phase::Aligning,
                Phase::Guiding,
                Phase::Capturing,
                Phase::Finished,
                Phase::Shutdown(ShutdownStage::ParkTelescope),
                Phase::Shutdown(ShutdownStage::WarmCcd),
                Phase::Shutdown(ShutdownStage::CloseDome),
                Phase::Stopped,
            ]
        );
        assert_eq!(ended(&events), vec![("M42".to_string(), JobState::Complete)]);
        assert!(events.contains(&SchedulerEvent::Stopped(RunState::Completed)));
        assert_eq!(h.scheduler.jobs()[0].state, JobState::Complete);

        assert!(lock(&h.sim.mount).parked);
        assert!(lock(&h.sim.camera).warm);
        assert_eq!(lock(&h.sim.sequences)[0], PathBuf::from("M42.esq"));
        assert!(!h.scheduler.is_running());
    }

    #[test]
    fn disabled_steps_are_skipped() {
        let mut j = job("quick");
        j.steps.focus = false;
        j.steps.align = false;
        j.steps.guide = false;
        let mut h = harness(vec![j], SchedulerSettings::default());
        h.start();
        let events = h.run();
        let seen = phases(&events);
        assert!(seen.contains(&Phase::Slewing));
        assert!(!seen.contains(&Phase::Focusing));
        assert!(!seen.contains(&Phase::Aligning));
        assert!(!seen.contains(&Phase::Guiding));
        assert_eq!(lock(&h.sim.focuser).started, 0);
    }

    #[test]
    fn failed_status_retries_then_errors_and_run_continues() {
        let mut h = harness(vec![job("first"), job("second")], SchedulerSettings::default());
        lock(&h.sim.focuser).pending_failures = 4;
        h.start();
        let events = h.run();
        assert_eq!(
            ended(&events),
            vec![
                ("first".to_string(), JobState::Error),
                ("second".to_string(), JobState::Complete),
            ]
        );
        // One attempt plus three retries for the first job, one for the second.
        assert_eq!(lock(&h.sim.focuser).started, 5);
    }

    #[test]
    fn retries_within_budget_recover() {
        let mut h = harness(vec![job("flaky")], SchedulerSettings::default());
        lock(&h.sim.sequencer).pending_failures = 2;
        h.start();
        let events = h.run();
        assert_eq!(ended(&events), vec![("flaky".to_string(), JobState::Complete)]);
    }

    #[test]
    fn device_failure_aborts_job_and_selects_next() {
        let mut h = harness(vec![job("first"), job("second")], SchedulerSettings::default());
        lock(&h.sim.mount).fail_slews = true;
        h.start();
        while h.scheduler.jobs()[0].state != JobState::Aborted {
            h.tick();
        }
        lock(&h.sim.mount).fail_slews = false;
        let events = h.run();
        let ended = ended(&events);
        assert_eq!(ended[0], ("first".to_string(), JobState::Aborted));
        assert_eq!(ended[1], ("second".to_string(), JobState::Complete));
    }

    #[test]
    fn convergence_failure_is_a_job_error() {
        let sim = SimSettings {
            pointing_error_ra_arcmin: 30.0,
            can_sync: false,
            ..Default::default()
        };
        let mut h = harness_with(vec![job("stubborn")], SchedulerSettings::default(), sim);
        h.start();
        let events = h.run();
        assert_eq!(ended(&events), vec![("stubborn".to_string(), JobState::Error)]);
    }

    #[test]
    fn ineligible_jobs_lead_to_shutdown_and_pending_jobs_wait() {
        let mut low = job("low");
        low.constraints.min_altitude_deg = Some(89.0);
        let mut h = harness(vec![low], SchedulerSettings::default());
        h.start();
        let events = h.run();
        assert!(ended(&events).is_empty());
        assert!(events.contains(&SchedulerEvent::Stopped(RunState::Completed)));

        let mut later = job("later");
        later.constraints.start = Some(start_time() + chrono::Duration::seconds(30));
        let mut h = harness(vec![later], SchedulerSettings::default());
        h.start();
        for _ in 0..10 {
            h.tick();
        }
        assert_eq!(h.scheduler.phase(), Phase::Connected);
        assert_eq!(h.scheduler.jobs()[0].state, JobState::Scheduled);
        let events = h.run();
        assert_eq!(ended(&events), vec![("later".to_string(), JobState::Complete)]);
    }

    #[test]
    fn weather_alert_blocks_weather_sensitive_jobs() {
        let mut j = job("careful");
        j.constraints.enforce_weather = true;
        let sim = SimSettings {
            weather: WeatherStatus::Alert,
            ..Default::default()
        };
        let mut h = harness_with(vec![j], SchedulerSettings::default(), sim);
        h.start();
        let events = h.run();
        assert!(ended(&events).is_empty());
        assert_eq!(h.scheduler.jobs()[0].state, JobState::Idle);
    }

    #[test]
    fn priority_decides_order() {
        let mut urgent = job("urgent");
        urgent.priority = 0;
        let mut h = harness(vec![job("normal"), urgent], SchedulerSettings::default());
        h.start();
        let events = h.run();
        let names: Vec<_> = ended(&events).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["urgent", "normal"]);
    }

    #[test]
    fn stop_aborts_running_job_and_parks() {
        let mut h = harness(vec![job("M42")], SchedulerSettings::default());
        h.start();
        while h.scheduler.phase() != Phase::Aligning {
            h.tick();
        }
        let now = h.now;
        h.scheduler.stop(&mut h.rig, now);
        let events = h.run();
        assert_eq!(ended(&events), vec![("M42".to_string(), JobState::Aborted)]);
        assert!(events.contains(&SchedulerEvent::Stopped(RunState::Stopped)));
        assert!(lock(&h.sim.mount).parked);
    }

    #[test]
    fn phase_timeout_counts_as_failure() {
        let settings = SchedulerSettings {
            phase_timeout: Duration::from_secs(60),
            retry_budget: 1,
            ..Default::default()
        };
        let mut h = harness(vec![job("slow")], settings);
        lock(&h.sim.sequencer).duration_polls = 1000;
        h.start();
        let events = h.run();
        assert_eq!(ended(&events), vec![("slow".to_string(), JobState::Error)]);
    }

    #[test]
    fn session_failures_stop_the_run() {
        let mut h = harness(vec![job("M42")], SchedulerSettings::default());
        lock(&h.sim.session).op.pending_failures = 10;
        h.start();
        let events = h.run();
        assert!(events.contains(&SchedulerEvent::Stopped(RunState::Failed)));
        assert!(ended(&events).is_empty());
    }

    #[test]
    fn fits_targets_are_solved_before_selection() {
        let mut j = job("from image");
        j.target = JobTarget::Fits(PathBuf::from("/nonexistent/m31.fits"));
        let mut h = harness(vec![j, job("plain")], SchedulerSettings::default());
        h.start();
        let events = h.run();
        assert_eq!(
            ended(&events),
            vec![
                ("from image".to_string(), JobState::Error),
                ("plain".to_string(), JobState::Complete),
            ]
        );
    }

    #[test]
    fn journal_records_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SchedulerSettings {
            journal_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let mut h = harness(vec![job("M42")], settings);
        h.start();
        h.run();
        let path = h.scheduler.journal().unwrap().path();
        let log = RunLog::load(&path).unwrap();
        assert_eq!(log.state, RunState::Completed);
        assert_eq!(log.jobs.len(), 1);
        assert_eq!(log.jobs[0].state, JobState::Complete);
        assert_eq!(log.jobs[0].attempts, 1);
    }

    #[test]
    fn start_requires_jobs_and_idle_scheduler() {
        let mut h = harness(Vec::new(), SchedulerSettings::default());
        let now = h.now;
        assert!(matches!(
            h.scheduler.start(&mut h.rig, now),
            Err(SchedulerError::NoJobs)
        ));

        let mut h = harness(vec![job("M42")], SchedulerSettings::default());
        h.start();
        let now = h.now;
        assert!(matches!(
            h.scheduler.start(&mut h.rig, now),
            Err(SchedulerError::AlreadyRunning)
        ));
    }
}
