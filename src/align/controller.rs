use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::error::AlignError;
use super::polar::{self, Operator, PolarAxis, PolarSample, PolarStage, RA_MOTION_DEG};
use super::types::{
    AlignConfig, AlignEvent, AlignState, AlignTask, AlignmentMode, CaptureRequest, Solution,
};
use crate::astro::{
    format_coordinates, format_dms, planar_separation_arcsec, Clock, FieldBounds, Frame, SkyCoordinate,
};
use crate::devices::{CapturedFrame, ExposureRequest, Rig, UploadMode};
use crate::image::{is_fits, seed_from_metadata, ImageMetadata, SolveSeed};
use crate::solver::{PlateSolver, SearchHint, SolveError, SolveRequest, SolveResult};

pub const MAXIMUM_SOLVER_ITERATIONS: u32 = 10;

/// Status polls without observed motion after which a slew counts as done.
const SLEW_START_GRACE_POLLS: u32 = 3;

struct Session {
    task: AlignTask,
    request: CaptureRequest,
    target: Option<SkyCoordinate>,
    iterations: u32,
    solve_failures: u32,
    capture_failures: u32,
    /// Image solved instead of a fresh exposure.
    file: Option<PathBuf>,
    /// Slewing to the solution of a loaded image, before the convergence loop.
    load_slew_pending: bool,
}

impl Session {
    fn new(task: AlignTask, request: CaptureRequest) -> Self {
        Self {
            task,
            request,
            target: None,
            iterations: 0,
            solve_failures: 0,
            capture_failures: 0,
            file: None,
            load_slew_pending: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct AxisState {
    stage: PolarStage,
    init: Option<PolarSample>,
    deviation_deg: Option<f64>,
    /// Mount polls without motion while in `Syncing`.
    idle_polls: u32,
}

/// Capture, solve and correct loop for a single optical train.
///
/// The controller never blocks: commands are issued to the devices and the
/// solver, and their completions are picked up by [`AlignmentController::service`]
/// (or delivered directly through the `on_*` callbacks). Every request carries a
/// ticket and completions with an outdated ticket are dropped.
pub struct AlignmentController {
    config: AlignConfig,
    solver: Box<dyn PlateSolver>,
    clock: Arc<dyn Clock>,
    state: AlignState,
    session: Option<Session>,
    azimuth: AxisState,
    altitude: AxisState,
    next_ticket: u64,
    capture_ticket: Option<u64>,
    solve_ticket: Option<u64>,
    restore_upload: Option<UploadMode>,
    slew_seen: bool,
    slew_idle_polls: u32,
    last_solution: Option<Solution>,
    events: Vec<AlignEvent>,
}

impl AlignmentController {
    pub fn new(config: AlignConfig, solver: Box<dyn PlateSolver>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            solver,
            clock,
            state: AlignState::Idle,
            session: None,
            azimuth: AxisState::default(),
            altitude: AxisState::default(),
            next_ticket: 0,
            capture_ticket: None,
            solve_ticket: None,
            restore_upload: None,
            slew_seen: false,
            slew_idle_polls: 0,
            last_solution: None,
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> AlignState {
        self.state
    }

    pub fn config(&self) -> &AlignConfig {
        &self.config
    }

    pub fn polar_stage(&self, axis: PolarAxis) -> PolarStage {
        self.axis(axis).stage
    }

    /// Deviation magnitude from the last completed measurement of `axis`.
    pub fn polar_deviation(&self, axis: PolarAxis) -> Option<f64> {
        self.axis(axis).deviation_deg
    }

    pub fn last_solution(&self) -> Option<&Solution> {
        self.last_solution.as_ref()
    }

    /// True while a session or a polar measurement is in progress.
    pub fn is_busy(&self) -> bool {
        matches!(
            self.state,
            AlignState::SelectingFilter
                | AlignState::Capturing
                | AlignState::Solving
                | AlignState::Slewing
        ) || self.azimuth.stage.is_measuring()
            || self.altitude.stage.is_measuring()
    }

    /// Request built from the configured exposure, binning, optics and mode.
    pub fn default_request(&self) -> CaptureRequest {
        CaptureRequest::from_config(&self.config)
    }

    pub fn update_configuration(&mut self, config: AlignConfig) {
        if config.site != self.config.site {
            log::info!(
                "Alignment site now {:.4}, {:.4}",
                config.site.latitude_deg,
                config.site.longitude_deg
            );
        }
        self.config = config;
    }

    pub fn drain_events(&mut self) -> Vec<AlignEvent> {
        std::mem::take(&mut self.events)
    }

    /// Starts a capture and solve of the current pointing.
    pub fn start_capture(&mut self, rig: &mut Rig, request: CaptureRequest) -> Result<(), AlignError> {
        self.ensure_idle()?;
        check_request(&request)?;
        check_devices(rig)?;
        self.validated_hint()?;

        self.session = Some(Session::new(AlignTask::Goto, request));
        self.begin_capture(rig).inspect_err(|_| self.reset_session())
    }

    /// Solves an existing image without moving the mount.
    pub fn solve_file(&mut self, rig: &mut Rig, path: &Path) -> Result<(), AlignError> {
        self.start_file_session(rig, path, AlignTask::SolveFile)
    }

    /// Solves an existing image, slews to its centre and then aligns there.
    pub fn load_and_slew(&mut self, rig: &mut Rig, path: &Path) -> Result<(), AlignError> {
        rig.mount()?;
        self.start_file_session(rig, path, AlignTask::LoadAndSlew)
    }

    fn start_file_session(
        &mut self,
        rig: &mut Rig,
        path: &Path,
        task: AlignTask,
    ) -> Result<(), AlignError> {
        self.ensure_idle()?;
        if !path.exists() {
            return Err(AlignError::Validation(format!(
                "{} does not exist",
                path.display()
            )));
        }

        let seed = if is_fits(path) {
            let meta = ImageMetadata::read(path)
                .map_err(|e| AlignError::Solve(SolveError::MalformedImage(e.to_string())))?;
            let mount = rig.mount().ok().and_then(|m| m.equatorial_coordinates().ok());
            match seed_from_metadata(&meta, mount) {
                Ok(seed) => seed,
                Err(missing) => {
                    self.message(format!("FITS header: cannot find {}.", missing.keyword));
                    return Err(missing.into());
                }
            }
        } else {
            SolveSeed {
                hint: self.validated_hint()?,
                bounds: None,
            }
        };

        let mut request = self.default_request();
        request.mode = AlignmentMode::Slew;
        let mut session = Session::new(task, request);
        session.file = Some(path.to_path_buf());
        self.session = Some(session);

        self.message(format!("Solving {}", path.display()));
        self.submit_solve(rig, path.to_path_buf(), seed.bounds, seed.hint);
        match self.state {
            AlignState::Failed => Err(self
                .failure_from_events()
                .unwrap_or(AlignError::Solve(SolveError::NoSolution))),
            _ => Ok(()),
        }
    }

    pub fn measure_azimuth_error(
        &mut self,
        rig: &mut Rig,
        operator: &mut impl Operator,
    ) -> Result<bool, AlignError> {
        self.start_polar(rig, PolarAxis::Azimuth, operator)
    }

    pub fn measure_altitude_error(
        &mut self,
        rig: &mut Rig,
        operator: &mut impl Operator,
    ) -> Result<bool, AlignError> {
        self.start_polar(rig, PolarAxis::Altitude, operator)
    }

    /// Returns `Ok(false)` when the operator declined.
    fn start_polar(
        &mut self,
        rig: &mut Rig,
        axis: PolarAxis,
        operator: &mut impl Operator,
    ) -> Result<bool, AlignError> {
        if self.axis(axis).stage != PolarStage::Init {
            return Err(AlignError::DeviceBusy("polar alignment"));
        }
        self.ensure_idle()?;
        let request = self.default_request();
        check_request(&request)?;
        check_devices(rig)?;

        let hemisphere = self.config.site.hemisphere();
        if !operator.confirm(polar::prompt(axis, hemisphere)) {
            log::info!("Polar {} measurement declined", axis);
            return Ok(false);
        }

        self.message(match axis {
            PolarAxis::Azimuth => "Solving first frame near the meridian.".to_string(),
            PolarAxis::Altitude => "Solving first frame.".to_string(),
        });
        let state = self.axis_mut(axis);
        state.stage = PolarStage::FirstTarget;
        state.init = None;
        self.session = Some(Session::new(AlignTask::PolarAlign, request));
        if let Err(e) = self.begin_capture(rig) {
            self.axis_mut(axis).stage = PolarStage::Init;
            self.reset_session();
            return Err(e);
        }
        Ok(true)
    }

    /// Slews to where the measured altitude error would vanish. The operator
    /// then centres the target with the altitude knob.
    pub fn correct_altitude_error(&mut self, rig: &mut Rig) -> Result<(), AlignError> {
        let deviation = self.correction_deviation(PolarAxis::Altitude)?;
        let site = self.config.site;
        let now = self.clock.now();
        let lst = site.local_sidereal_time(now);

        let mount = rig.mount_mut()?;
        let current = mount.equatorial_coordinates()?;
        let target_latitude = site.latitude_deg + deviation;
        let horizontal = current.to_horizontal(lst, target_latitude);
        let target =
            SkyCoordinate::from_horizontal(horizontal, lst, site.latitude_deg, Frame::Apparent);

        log::debug!(
            "Polar alignment: target latitude {:.4} = {:.4} + {:.4}",
            target_latitude,
            site.latitude_deg,
            deviation
        );
        mount.slew(target.ra_hours(), target.dec_degrees())?;
        self.altitude.stage = PolarStage::Correcting;
        self.message(
            "Slewing to calibration position, please wait until telescope completes slewing."
                .into(),
        );
        Ok(())
    }

    /// Slews to the current altitude at an azimuth shifted by the measured error.
    pub fn correct_azimuth_error(&mut self, rig: &mut Rig) -> Result<(), AlignError> {
        let deviation = self.correction_deviation(PolarAxis::Azimuth)?;
        let site = self.config.site;
        let now = self.clock.now();
        let lst = site.local_sidereal_time(now);

        let mount = rig.mount_mut()?;
        let current = mount.equatorial_coordinates()?;
        let mut horizontal = current.to_horizontal(lst, site.latitude_deg);
        horizontal.az_deg = (horizontal.az_deg + deviation).rem_euclid(360.0);
        let target =
            SkyCoordinate::from_horizontal(horizontal, lst, site.latitude_deg, Frame::Apparent);

        mount.slew(target.ra_hours(), target.dec_degrees())?;
        self.azimuth.stage = PolarStage::Correcting;
        self.message(
            "Slewing to calibration position, please wait until telescope completes slewing."
                .into(),
        );
        Ok(())
    }

    fn correction_deviation(&self, axis: PolarAxis) -> Result<f64, AlignError> {
        if self.azimuth.stage.is_measuring() || self.altitude.stage.is_measuring() {
            return Err(AlignError::DeviceBusy("polar alignment"));
        }
        self.axis(axis).deviation_deg.ok_or_else(|| {
            AlignError::Validation(format!("{axis} error has not been measured yet"))
        })
    }

    /// Cancels whatever is in flight and returns to the initial state.
    pub fn abort(&mut self, rig: &mut Rig) {
        let active = self.is_busy()
            || self.session.is_some()
            || self.azimuth.stage != PolarStage::Init
            || self.altitude.stage != PolarStage::Init;

        if self.solve_ticket.take().is_some() || self.solver.is_busy() {
            self.solver.cancel();
            log::info!("Solver aborted");
        }
        if self.capture_ticket.take().is_some() {
            if let Ok(camera) = rig.camera_mut() {
                if camera.is_capturing() {
                    if let Err(e) = camera.abort_exposure() {
                        log::warn!("Failed to abort exposure: {}", e);
                    }
                    log::info!("Capture aborted");
                }
            }
        }
        self.restore_upload_mode(rig);
        self.azimuth.stage = PolarStage::Init;
        self.altitude.stage = PolarStage::Init;
        self.session = None;
        self.slew_seen = false;
        self.slew_idle_polls = 0;

        if active {
            self.state = AlignState::Aborted;
            self.events.push(AlignEvent::Aborted);
        }
    }

    /// Pumps device and solver completions into the state machine.
    pub fn service(&mut self, rig: &mut Rig) {
        if self.state == AlignState::SelectingFilter {
            self.check_filter(rig);
        }

        let exposure = rig.camera.as_mut().and_then(|c| c.poll_exposure());
        if let Some(outcome) = exposure {
            match outcome.result {
                Ok(frame) => self.on_image_ready(rig, outcome.ticket, frame),
                Err(e) => self.on_capture_failed(rig, outcome.ticket, &e.to_string()),
            }
        }

        if let Some(completion) = self.solver.poll() {
            self.on_solve_complete(rig, completion.ticket, completion.outcome);
        }

        self.on_mount_update(rig);
    }

    pub fn on_image_ready(&mut self, rig: &mut Rig, ticket: u64, frame: CapturedFrame) {
        if self.capture_ticket != Some(ticket) {
            log::debug!("Discarding stale exposure (ticket {})", ticket);
            return;
        }
        self.capture_ticket = None;
        self.restore_upload_mode(rig);

        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.capture_failures = 0;

        if session.task == AlignTask::Goto && session.iterations == 0 && session.target.is_none() {
            match rig.mount().and_then(|m| m.equatorial_coordinates()) {
                Ok(position) => session.target = Some(position),
                Err(e) => return self.fail(rig, e.into()),
            }
        }
        let mut geometry = session.request.geometry;
        if let Ok(camera) = rig.camera() {
            let chip = camera.frame();
            geometry.sensor_width_px.get_or_insert(chip.width);
            geometry.sensor_height_px.get_or_insert(chip.height);
        }
        let bounds = geometry.field_of_view().map(|fov| fov.bounds());

        let hint = match self.validated_hint() {
            Ok(hint) => hint,
            Err(e) => return self.fail(rig, e),
        };
        self.submit_solve(rig, frame.path, bounds, hint);
    }

    pub fn on_capture_failed(&mut self, rig: &mut Rig, ticket: u64, reason: &str) {
        if self.capture_ticket != Some(ticket) {
            log::debug!("Discarding stale exposure failure (ticket {})", ticket);
            return;
        }
        self.capture_ticket = None;
        self.restore_upload_mode(rig);

        let limit = self.config.settings.capture_retries.max(1);
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.capture_failures += 1;
        let failures = session.capture_failures;

        if failures >= limit {
            return self.fail(
                rig,
                AlignError::DeviceFailure(format!("capture failed {failures} times: {reason}")),
            );
        }
        log::warn!("Capture failed ({}/{}): {}", failures, limit, reason);
        self.message(format!("Capture failed, retrying ({failures}/{limit})."));
        if let Err(e) = self.begin_capture(rig) {
            self.fail(rig, e);
        }
    }

    pub fn on_solve_complete(
        &mut self,
        rig: &mut Rig,
        ticket: u64,
        outcome: Result<SolveResult, SolveError>,
    ) {
        if self.solve_ticket != Some(ticket) {
            log::debug!("Discarding stale solution (ticket {})", ticket);
            return;
        }
        self.solve_ticket = None;

        let result = match outcome {
            Ok(result) if result.success => result,
            Ok(_) => return self.on_solve_failed(rig, SolveError::NoSolution),
            Err(e) => return self.on_solve_failed(rig, e),
        };
        let Some(solution) = self.build_solution(&result) else {
            return self.on_solve_failed(rig, SolveError::NoSolution);
        };

        self.report_solution(&solution, &result);
        self.last_solution = Some(solution.clone());
        self.events.push(AlignEvent::Solved(solution.clone()));

        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.solve_failures = 0;

        match session.task {
            AlignTask::Goto => self.evaluate(rig, solution),
            AlignTask::PolarAlign => self.polar_solved(rig, solution),
            AlignTask::SolveFile => self.complete(solution),
            AlignTask::LoadAndSlew => {
                if session.file.take().is_some() {
                    session.target = Some(solution.coordinate);
                    session.load_slew_pending = true;
                    let target = solution.coordinate;
                    self.slew_to(rig, target);
                } else {
                    self.evaluate(rig, solution);
                }
            }
        }
    }

    /// Tracks mount motion for the convergence loop and the polar stages.
    pub fn on_mount_update(&mut self, rig: &mut Rig) {
        let slewing = match rig.mount() {
            Ok(mount) => mount.is_slewing(),
            Err(_) => return,
        };

        if self.state == AlignState::Slewing {
            if slewing {
                self.slew_seen = true;
            } else {
                self.slew_idle_polls += 1;
                if self.slew_seen || self.slew_idle_polls >= SLEW_START_GRACE_POLLS {
                    self.on_slew_complete(rig);
                }
            }
        }

        for axis in [PolarAxis::Azimuth, PolarAxis::Altitude] {
            let stage = self.axis(axis).stage;
            let started = match stage {
                PolarStage::Syncing if slewing => {
                    self.axis_mut(axis).stage = PolarStage::Slewing;
                    false
                }
                PolarStage::Syncing => {
                    let state = self.axis_mut(axis);
                    state.idle_polls += 1;
                    state.idle_polls >= SLEW_START_GRACE_POLLS
                }
                PolarStage::Slewing => !slewing,
                _ => false,
            };
            if started {
                let state = self.axis_mut(axis);
                state.idle_polls = 0;
                state.stage = PolarStage::SecondTarget;
                self.message(match axis {
                    PolarAxis::Azimuth => "Solving second frame near the meridian.".into(),
                    PolarAxis::Altitude => "Solving second frame.".into(),
                });
                if let Err(e) = self.begin_capture(rig) {
                    self.fail(rig, e);
                }
                continue;
            }
            if stage == PolarStage::Correcting && !slewing {
                self.message(format!(
                    "Slew complete. Please adjust the {axis} knob until the target is in the center of the view."
                ));
                self.axis_mut(axis).stage = PolarStage::Init;
            }
        }
    }

    fn on_slew_complete(&mut self, rig: &mut Rig) {
        self.slew_seen = false;
        self.slew_idle_polls = 0;
        let Some(session) = self.session.as_mut() else {
            self.state = AlignState::Idle;
            return;
        };

        if session.load_slew_pending {
            session.load_slew_pending = false;
            self.message("Slew to loaded image complete, aligning there.".into());
        } else {
            session.iterations += 1;
            let iterations = session.iterations;
            if iterations >= MAXIMUM_SOLVER_ITERATIONS {
                self.message("Maximum number of iterations reached. Solver failed.".into());
                return self.fail(rig, AlignError::Convergence(iterations));
            }
            self.message("Target accuracy is not met, running solver again...".into());
        }

        if let Err(e) = self.begin_capture(rig) {
            self.fail(rig, e);
        }
    }

    fn on_solve_failed(&mut self, rig: &mut Rig, error: SolveError) {
        let limit = self.config.settings.solver_retries.max(1);
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.solve_failures += 1;
        let failures = session.solve_failures;
        let retryable = matches!(session.task, AlignTask::Goto | AlignTask::LoadAndSlew)
            && session.request.mode == AlignmentMode::Slew
            && session.file.is_none();

        if !retryable || failures >= limit {
            return self.fail(rig, AlignError::Solve(error));
        }
        log::warn!("Solve failed ({}/{}): {}", failures, limit, error);
        self.message(format!("Solver failed, retrying ({failures}/{limit})."));
        if let Err(e) = self.begin_capture(rig) {
            self.fail(rig, e);
        }
    }

    /// Applies the configured mode to a solution of the live pointing.
    fn evaluate(&mut self, rig: &mut Rig, solution: Solution) {
        let Some((mode, target)) = self.session.as_ref().map(|s| (s.request.mode, s.target)) else {
            return;
        };
        let threshold = self.config.settings.accuracy_arcsec;

        match mode {
            AlignmentMode::NoAction => self.complete(solution),
            AlignmentMode::Sync => match self.sync_to(rig, &solution) {
                Ok(()) => self.complete(solution),
                Err(e) => self.fail(rig, e),
            },
            AlignmentMode::Slew => {
                let can_sync = rig.mount().map(|m| m.can_sync()).unwrap_or(false);
                if can_sync {
                    if let Err(e) = self.sync_to(rig, &solution) {
                        return self.fail(rig, e);
                    }
                }
                match (target, solution.target_diff_arcsec) {
                    (Some(target), Some(diff)) if diff > threshold => {
                        self.message(format!(
                            "Target is {} away from solution coordinates.",
                            format_dms(diff / 3600.0)
                        ));
                        self.slew_to(rig, target);
                    }
                    _ => {
                        self.message(
                            "Target is within acceptable range. Astrometric solver is successful."
                                .into(),
                        );
                        self.complete(solution);
                    }
                }
            }
        }
    }

    fn polar_solved(&mut self, rig: &mut Rig, solution: Solution) {
        let Some(axis) = [PolarAxis::Azimuth, PolarAxis::Altitude]
            .into_iter()
            .find(|a| {
                matches!(
                    self.axis(*a).stage,
                    PolarStage::FirstTarget | PolarStage::SecondTarget
                )
            })
        else {
            return self.complete(solution);
        };

        self.message("Processing solution for polar alignment...".into());
        let first = self.axis(axis).stage == PolarStage::FirstTarget;
        let result = if first {
            self.polar_first_target(rig, axis, &solution)
        } else {
            self.axis_mut(axis).stage = PolarStage::Finished;
            self.polar_finished(rig, axis, solution)
        };
        if let Err(e) = result {
            self.fail(rig, e);
        }
    }

    fn polar_first_target(
        &mut self,
        rig: &mut Rig,
        axis: PolarAxis,
        solution: &Solution,
    ) -> Result<(), AlignError> {
        let init = PolarSample {
            ra_deg: solution.coordinate.ra_degrees(),
            dec_deg: solution.coordinate.dec_degrees(),
            az_deg: solution.horizontal.az_deg,
        };
        log::debug!(
            "Polar alignment: initRA {:.4} initDEC {:.4} initAz {:.4} initAlt {:.4}",
            init.ra_deg,
            init.dec_deg,
            init.az_deg,
            solution.horizontal.alt_deg
        );
        let state = self.axis_mut(axis);
        state.init = Some(init);
        state.idle_polls = 0;

        let mount = rig.mount_mut()?;
        if mount.can_sync() {
            self.axis_mut(axis).stage = PolarStage::Syncing;
            mount.sync(init.ra_deg / 15.0, init.dec_deg)?;
            mount.slew(
                ((init.ra_deg - RA_MOTION_DEG) / 15.0).rem_euclid(24.0),
                init.dec_deg,
            )?;
        } else {
            self.axis_mut(axis).stage = PolarStage::Slewing;
            let position = mount.equatorial_coordinates()?;
            mount.slew(
                (position.ra_hours() - RA_MOTION_DEG / 15.0).rem_euclid(24.0),
                position.dec_degrees(),
            )?;
        }
        self.state = AlignState::Idle;
        self.message("Slewing 30 arcminutes in RA...".into());
        Ok(())
    }

    fn polar_finished(
        &mut self,
        rig: &mut Rig,
        axis: PolarAxis,
        solution: Solution,
    ) -> Result<(), AlignError> {
        self.message(format!("Calculating {axis} alignment error..."));
        let init = self.axis(axis).init.ok_or_else(|| {
            AlignError::Validation("polar measurement has no first frame".into())
        })?;
        let final_ra = solution.coordinate.ra_degrees();
        let final_dec = solution.coordinate.dec_degrees();

        let mount = rig.mount_mut()?;
        if mount.can_sync() {
            mount.slew(init.ra_deg / 15.0, init.dec_deg)?;
        } else {
            let position = mount.equatorial_coordinates()?;
            mount.slew(
                (position.ra_hours() + RA_MOTION_DEG / 15.0).rem_euclid(24.0),
                position.dec_degrees(),
            )?;
        }
        self.message("Slewing back to original position...".into());

        let hemisphere = self.config.site.hemisphere();
        let error = polar::calculate_polar_error(axis, hemisphere, init, final_ra, final_dec);
        self.axis_mut(axis).stage = PolarStage::Init;
        let error = error?;

        self.axis_mut(axis).deviation_deg = Some(error.deviation_deg);
        self.message(format!("Polar {axis} error: {}", error.message));
        self.events.push(AlignEvent::PolarError(error));
        self.complete(solution);
        Ok(())
    }

    fn ensure_idle(&self) -> Result<(), AlignError> {
        match self.state {
            AlignState::SelectingFilter | AlignState::Capturing => {
                Err(AlignError::DeviceBusy("camera"))
            }
            AlignState::Solving => Err(AlignError::DeviceBusy("solver")),
            AlignState::Slewing => Err(AlignError::DeviceBusy("mount")),
            _ if self.solver.is_busy() => Err(AlignError::DeviceBusy("solver")),
            _ if self.azimuth.stage.is_measuring() || self.altitude.stage.is_measuring() => {
                Err(AlignError::DeviceBusy("polar alignment"))
            }
            _ => Ok(()),
        }
    }

    fn validated_hint(&self) -> Result<Option<SearchHint>, AlignError> {
        Ok(self
            .config
            .settings
            .search_hint
            .map(|hint| hint.validate())
            .transpose()?)
    }

    /// Moves a locked filter into place, then exposes.
    fn begin_capture(&mut self, rig: &mut Rig) -> Result<(), AlignError> {
        if let (Some(filter), Some(wheel)) = (
            self.config.settings.locked_filter.as_deref(),
            rig.filter_wheel.as_mut(),
        ) {
            if wheel.current().as_deref() != Some(filter) {
                log::info!("Changing filter to {}", filter);
                wheel.select(filter)?;
                self.state = AlignState::SelectingFilter;
                return Ok(());
            }
        }
        self.expose(rig)
    }

    fn check_filter(&mut self, rig: &mut Rig) {
        let status = match rig.filter_wheel.as_ref() {
            Some(wheel) => wheel.status(),
            None => crate::devices::OperationStatus::Complete,
        };
        match status {
            crate::devices::OperationStatus::Busy => {}
            crate::devices::OperationStatus::Failed(reason) => {
                self.fail(rig, AlignError::DeviceFailure(format!("filter change failed: {reason}")))
            }
            _ => {
                if let Err(e) = self.expose(rig) {
                    self.fail(rig, e);
                }
            }
        }
    }

    fn expose(&mut self, rig: &mut Rig) -> Result<(), AlignError> {
        let Some(request) = self.session.as_ref().map(|s| s.request.clone()) else {
            return Ok(());
        };
        let ticket = self.issue_ticket();
        let camera = rig.camera_mut()?;
        if camera.is_capturing() {
            return Err(AlignError::DeviceBusy("camera"));
        }

        if camera.upload_mode() == UploadMode::Local {
            self.restore_upload.get_or_insert(UploadMode::Local);
            camera.set_upload_mode(UploadMode::Client)?;
        }

        let (bin_x, bin_y) = if camera.can_bin() {
            let (max_x, max_y) = camera.max_binning();
            let bin = (request.bin_x.clamp(1, max_x.max(1)), request.bin_y.clamp(1, max_y.max(1)));
            camera.set_binning(bin.0, bin.1)?;
            bin
        } else {
            (1, 1)
        };

        camera.capture(ExposureRequest {
            ticket,
            seconds: request.exposure_s,
            bin_x,
            bin_y,
        })?;
        self.capture_ticket = Some(ticket);
        self.state = AlignState::Capturing;
        log::debug!("Exposure {} started ({}s, bin {}x{})", ticket, request.exposure_s, bin_x, bin_y);
        Ok(())
    }

    fn submit_solve(
        &mut self,
        rig: &mut Rig,
        image: PathBuf,
        bounds: Option<FieldBounds>,
        hint: Option<SearchHint>,
    ) {
        let ticket = self.issue_ticket();
        let request = SolveRequest {
            ticket,
            image,
            bounds,
            hint,
        };
        match self.solver.submit(request) {
            Ok(()) => {
                self.solve_ticket = Some(ticket);
                self.state = AlignState::Solving;
                let iteration = self
                    .session
                    .as_ref()
                    .filter(|s| s.request.mode == AlignmentMode::Slew && s.task == AlignTask::Goto)
                    .map(|s| s.iterations + 1);
                if let Some(iteration) = iteration {
                    self.message(format!("Solver iteration #{iteration}"));
                }
            }
            Err(e) => self.on_solve_failed(rig, e),
        }
    }

    fn build_solution(&self, result: &SolveResult) -> Option<Solution> {
        let j2000 = SkyCoordinate::from_degrees(result.ra_deg, result.dec_deg, Frame::J2000)
            .inspect_err(|e| log::warn!("Solver returned an invalid position: {}", e))
            .ok()?;
        let now = self.clock.now();
        let coordinate = j2000.to_apparent(now);
        let site = self.config.site;
        let horizontal =
            coordinate.to_horizontal(site.local_sidereal_time(now), site.latitude_deg);
        let target_diff_arcsec = self
            .session
            .as_ref()
            .and_then(|s| s.target)
            .map(|target| planar_separation_arcsec(&coordinate, &target));

        Some(Solution {
            coordinate,
            j2000,
            horizontal,
            orientation_deg: result.orientation_deg,
            pixel_scale_arcsec_per_px: result.pixel_scale_arcsec_per_px,
            target_diff_arcsec,
        })
    }

    fn report_solution(&mut self, solution: &Solution, result: &SolveResult) {
        let (ra, dec) = format_coordinates(
            solution.coordinate.ra_hours(),
            solution.coordinate.dec_degrees(),
        );
        if self.config.settings.verbose {
            self.message(format!(
                "Solver RA ({:.5}) DEC ({:.5}) Orientation ({:.5}) Pixel Scale ({:.5})",
                result.ra_deg, result.dec_deg, result.orientation_deg, result.pixel_scale_arcsec_per_px
            ));
        }
        self.message(format!("Solution coordinates: RA ({ra}) DEC ({dec})"));

        let from_file = self
            .session
            .as_ref()
            .is_some_and(|s| s.file.is_some() || s.task == AlignTask::SolveFile);
        if from_file || result.pixel_scale_arcsec_per_px <= 0.0 {
            return;
        }
        let Some(request) = self.session.as_ref().map(|s| s.request.clone()) else {
            return;
        };
        let solved_focal = request
            .geometry
            .focal_length_from_scale(result.pixel_scale_arcsec_per_px, request.bin_x);
        if let (Some(configured), Some(solved)) = (request.geometry.focal_length(), solved_focal) {
            if (configured - solved).abs() > 1.0 {
                log::warn!("Configured focal length {:.5} mm, solver implies {:.5} mm", configured, solved);
                self.message(format!(
                    "Current focal length is {configured:.5} mm while computed focal length from the solver is {solved:.5} mm. Please update the mount focal length to obtain accurate results."
                ));
            }
        }
    }

    fn sync_to(&mut self, rig: &mut Rig, solution: &Solution) -> Result<(), AlignError> {
        let mount = rig.mount_mut()?;
        mount.sync(solution.coordinate.ra_hours(), solution.coordinate.dec_degrees())?;
        let (ra, dec) = format_coordinates(
            solution.coordinate.ra_hours(),
            solution.coordinate.dec_degrees(),
        );
        self.message(format!("Syncing to RA ({ra}) DEC ({dec}) is successful."));
        Ok(())
    }

    fn slew_to(&mut self, rig: &mut Rig, target: SkyCoordinate) {
        let slew = rig
            .mount_mut()
            .and_then(|m| m.slew(target.ra_hours(), target.dec_degrees()));
        if let Err(e) = slew {
            return self.fail(rig, e.into());
        }
        let (ra, dec) = format_coordinates(target.ra_hours(), target.dec_degrees());
        self.message(format!("Slewing to target coordinates: RA ({ra}) DEC ({dec})."));
        self.state = AlignState::Slewing;
        self.slew_seen = false;
        self.slew_idle_polls = 0;
    }

    fn complete(&mut self, solution: Solution) {
        let (task, iterations) = self
            .session
            .take()
            .map(|s| (s.task, s.iterations))
            .unwrap_or((AlignTask::Goto, 0));
        self.state = AlignState::Complete;
        log::info!("Alignment {} complete after {} iteration(s)", task, iterations);
        self.events.push(AlignEvent::Completed {
            task,
            solution,
            iterations,
        });
    }

    fn fail(&mut self, rig: &mut Rig, error: AlignError) {
        log::error!("Alignment failed: {}", error);
        if self.solve_ticket.take().is_some() {
            self.solver.cancel();
        }
        if self.capture_ticket.take().is_some() {
            if let Some(Err(e)) = rig.camera.as_mut().map(|c| c.abort_exposure()) {
                log::warn!("Failed to abort exposure: {}", e);
            }
        }
        self.restore_upload_mode(rig);
        self.azimuth.stage = PolarStage::Init;
        self.altitude.stage = PolarStage::Init;
        let task = self
            .session
            .take()
            .map(|s| s.task)
            .unwrap_or(AlignTask::Goto);
        self.state = AlignState::Failed;
        self.events.push(AlignEvent::Failed { task, error });
    }

    fn failure_from_events(&self) -> Option<AlignError> {
        self.events.iter().rev().find_map(|e| match e {
            AlignEvent::Failed { error, .. } => Some(error.clone()),
            _ => None,
        })
    }

    fn reset_session(&mut self) {
        self.session = None;
        self.capture_ticket = None;
        self.state = AlignState::Idle;
    }

    fn restore_upload_mode(&mut self, rig: &mut Rig) {
        let Some(mode) = self.restore_upload.take() else {
            return;
        };
        if let Ok(camera) = rig.camera_mut() {
            if let Err(e) = camera.set_upload_mode(mode) {
                log::warn!("Failed to restore upload mode {}: {}", mode, e);
            }
        }
    }

    fn issue_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn message(&mut self, text: String) {
        log::info!("{}", text);
        self.events.push(AlignEvent::Message(text));
    }

    fn axis(&self, axis: PolarAxis) -> &AxisState {
        match axis {
            PolarAxis::Azimuth => &self.azimuth,
            PolarAxis::Altitude => &self.altitude,
        }
    }

    fn axis_mut(&mut self, axis: PolarAxis) -> &mut AxisState {
        match axis {
            PolarAxis::Azimuth => &mut self.azimuth,
            PolarAxis::Altitude => &mut self.altitude,
        }
    }
}

fn check_request(request: &CaptureRequest) -> Result<(), AlignError> {
    if !(request.exposure_s > 0.0 && request.exposure_s.is_finite()) {
        return Err(AlignError::Validation(format!(
            "exposure {} must be positive",
            request.exposure_s
        )));
    }
    if let Some(missing) = request.geometry.missing_optics() {
        return Err(AlignError::Configuration(format!(
            "telescope {missing} is missing"
        )));
    }
    Ok(())
}

fn check_devices(rig: &Rig) -> Result<(), AlignError> {
    let mount = rig.mount()?;
    if !mount.is_connected() {
        return Err(AlignError::Configuration("mount is not connected".into()));
    }
    let camera = rig.camera()?;
    if !camera.is_connected() {
        return Err(AlignError::Configuration("camera is not connected".into()));
    }
    if camera.is_capturing() {
        return Err(AlignError::DeviceBusy("camera"));
    }
    if rig.focus_busy() {
        return Err(AlignError::DeviceBusy("focuser"));
    }
    Ok(())
}
