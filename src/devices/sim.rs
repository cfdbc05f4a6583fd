//! Simulated observatory used by the CLI dry runs and the controller tests.
//!
//! Every device keeps its state behind an `Arc<Mutex<_>>` so the simulated
//! solver and the tests can observe what the controllers commanded. Status
//! queries advance the simulation by one step.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Deserialize;

use super::{
    CameraControl, CapturedFrame, ChipFrame, DeviceError, DomeControl, ExposureOutcome,
    ExposureRequest, FilterControl, FocusControl, GuideControl, MountControl, OperationStatus,
    Rig, SequenceControl, SessionControl, SessionStatus, UploadMode, WeatherSource,
    WeatherStatus,
};
use crate::astro::{Frame, SkyCoordinate};

pub(crate) use super::lock;

#[derive(Debug, Clone, Deserialize)]
pub struct SimSettings {
    #[serde(default = "default_start_ra")]
    pub start_ra_hours: f64,
    #[serde(default = "default_start_dec")]
    pub start_dec_deg: f64,
    /// Offset between where the mount thinks it points and where it does.
    #[serde(default)]
    pub pointing_error_ra_arcmin: f64,
    #[serde(default)]
    pub pointing_error_dec_arcmin: f64,
    /// Declination drift per degree of RA motion, mimicking polar misalignment.
    #[serde(default)]
    pub dec_drift_arcsec_per_deg: f64,
    #[serde(default = "default_true")]
    pub can_sync: bool,
    #[serde(default = "default_polls")]
    pub slew_polls: u32,
    #[serde(default = "default_polls")]
    pub exposure_polls: u32,
    #[serde(default = "default_polls")]
    pub operation_polls: u32,
    #[serde(default = "default_polls")]
    pub solve_polls: u32,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub weather: WeatherStatus,
    #[serde(default = "default_frame_dir")]
    pub frame_dir: PathBuf,
}

fn default_start_ra() -> f64 {
    3.0
}

fn default_start_dec() -> f64 {
    45.0
}

fn default_true() -> bool {
    true
}

fn default_polls() -> u32 {
    2
}

fn default_frame_dir() -> PathBuf {
    PathBuf::from(SIM_FRAME_DIR)
}

/// Directory prefix of frames produced by [`SimCamera`].
pub const SIM_FRAME_DIR: &str = "sim";

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            start_ra_hours: default_start_ra(),
            start_dec_deg: default_start_dec(),
            pointing_error_ra_arcmin: 0.0,
            pointing_error_dec_arcmin: 0.0,
            dec_drift_arcsec_per_deg: 0.0,
            can_sync: true,
            slew_polls: default_polls(),
            exposure_polls: default_polls(),
            operation_polls: default_polls(),
            solve_polls: default_polls(),
            filters: Vec::new(),
            weather: WeatherStatus::Ok,
            frame_dir: default_frame_dir(),
        }
    }
}

/// A command that takes a number of status polls to finish.
#[derive(Debug, Clone)]
pub struct SimOperation {
    pub duration_polls: u32,
    pub pending_failures: u32,
    pub started: u32,
    left: u32,
    running: bool,
    last: OperationStatus,
}

impl SimOperation {
    pub fn new(duration_polls: u32) -> Self {
        Self {
            duration_polls,
            pending_failures: 0,
            started: 0,
            left: 0,
            running: false,
            last: OperationStatus::Idle,
        }
    }

    fn start(&mut self) {
        self.running = true;
        self.left = self.duration_polls;
        self.started += 1;
    }

    fn poll(&mut self) -> OperationStatus {
        if !self.running {
            return self.last.clone();
        }
        if self.left > 0 {
            self.left -= 1;
            return OperationStatus::Busy;
        }
        self.running = false;
        self.last = if self.pending_failures > 0 {
            self.pending_failures -= 1;
            OperationStatus::Failed("simulated failure".into())
        } else {
            OperationStatus::Complete
        };
        self.last.clone()
    }

    fn reset(&mut self) {
        self.running = false;
        self.last = OperationStatus::Idle;
    }
}

pub type Shared<T> = Arc<Mutex<T>>;

#[derive(Debug, Clone)]
pub struct MountState {
    /// Position the mount reports, in the apparent frame.
    pub reported: SkyCoordinate,
    pub error_ra_deg: f64,
    pub error_dec_deg: f64,
    pub dec_drift_per_ra_deg: f64,
    pub can_sync: bool,
    pub slew_polls: u32,
    pub connected: bool,
    pub parked: bool,
    pub fail_slews: bool,
    pub slews: Vec<(f64, f64)>,
    pub syncs: Vec<(f64, f64)>,
    slewing_left: u32,
}

impl MountState {
    pub fn new(reported: SkyCoordinate) -> Self {
        Self {
            reported,
            error_ra_deg: 0.0,
            error_dec_deg: 0.0,
            dec_drift_per_ra_deg: 0.0,
            can_sync: true,
            slew_polls: default_polls(),
            connected: true,
            parked: false,
            fail_slews: false,
            slews: Vec::new(),
            syncs: Vec::new(),
            slewing_left: 0,
        }
    }

    /// Where the optics actually point.
    pub fn true_pointing(&self) -> SkyCoordinate {
        SkyCoordinate::clamped(
            self.reported.ra_hours() + self.error_ra_deg / 15.0,
            self.reported.dec_degrees() + self.error_dec_deg,
            Frame::Apparent,
        )
    }
}

pub struct SimMount {
    state: Shared<MountState>,
}

impl SimMount {
    pub fn new(state: Shared<MountState>) -> Self {
        Self { state }
    }
}

impl MountControl for SimMount {
    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    fn equatorial_coordinates(&self) -> Result<SkyCoordinate, DeviceError> {
        let state = lock(&self.state);
        if !state.connected {
            return Err(DeviceError::NotConnected("mount"));
        }
        Ok(state.reported)
    }

    fn slew(&mut self, ra_hours: f64, dec_deg: f64) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        if state.fail_slews {
            return Err(DeviceError::CommandFailed("slew rejected".into()));
        }
        let target = SkyCoordinate::new(ra_hours, dec_deg, Frame::Apparent)
            .map_err(|e| DeviceError::CommandFailed(e.to_string()))?;
        let delta_ra = wrap_degrees(target.ra_degrees() - state.reported.ra_degrees());
        state.error_dec_deg += state.dec_drift_per_ra_deg * delta_ra;
        state.reported = target;
        state.slewing_left = state.slew_polls;
        state.parked = false;
        state.slews.push((ra_hours, dec_deg));
        log::debug!("sim mount slewing to {:.4}h {:.4}°", ra_hours, dec_deg);
        Ok(())
    }

    fn sync(&mut self, ra_hours: f64, dec_deg: f64) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        if !state.can_sync {
            return Err(DeviceError::Unsupported("mount"));
        }
        let actual = state.true_pointing();
        let synced = SkyCoordinate::new(ra_hours, dec_deg, Frame::Apparent)
            .map_err(|e| DeviceError::CommandFailed(e.to_string()))?;
        state.error_ra_deg = wrap_degrees(actual.ra_degrees() - synced.ra_degrees());
        state.error_dec_deg = actual.dec_degrees() - synced.dec_degrees();
        state.reported = synced;
        state.syncs.push((ra_hours, dec_deg));
        Ok(())
    }

    fn is_slewing(&self) -> bool {
        let mut state = lock(&self.state);
        if state.slewing_left > 0 {
            state.slewing_left -= 1;
            true
        } else {
            false
        }
    }

    fn can_sync(&self) -> bool {
        lock(&self.state).can_sync
    }

    fn park(&mut self) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        state.parked = true;
        Ok(())
    }

    fn is_parked(&self) -> bool {
        lock(&self.state).parked
    }

    fn abort(&mut self) -> Result<(), DeviceError> {
        lock(&self.state).slewing_left = 0;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CameraState {
    pub connected: bool,
    pub exposure_polls: u32,
    pub pending_failures: u32,
    pub upload_mode: UploadMode,
    pub binning: (u32, u32),
    pub max_binning: (u32, u32),
    pub width: u32,
    pub height: u32,
    pub warm: bool,
    pub frame_dir: PathBuf,
    pub requests: Vec<ExposureRequest>,
    pub upload_modes: Vec<UploadMode>,
    frames_taken: u32,
    pending: Option<(ExposureRequest, u32)>,
}

impl CameraState {
    pub fn new(exposure_polls: u32) -> Self {
        Self {
            connected: true,
            exposure_polls,
            pending_failures: 0,
            upload_mode: UploadMode::Client,
            binning: (1, 1),
            max_binning: (4, 4),
            width: 1280,
            height: 1024,
            warm: false,
            frame_dir: default_frame_dir(),
            requests: Vec::new(),
            upload_modes: Vec::new(),
            frames_taken: 0,
            pending: None,
        }
    }
}

pub struct SimCamera {
    state: Shared<CameraState>,
}

impl SimCamera {
    pub fn new(state: Shared<CameraState>) -> Self {
        Self { state }
    }
}

impl CameraControl for SimCamera {
    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    fn capture(&mut self, request: ExposureRequest) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        if state.pending.is_some() {
            return Err(DeviceError::Busy("camera"));
        }
        state.requests.push(request.clone());
        let polls = state.exposure_polls;
        state.pending = Some((request, polls));
        Ok(())
    }

    fn poll_exposure(&mut self) -> Option<ExposureOutcome> {
        let mut state = lock(&self.state);
        let (request, left) = state.pending.take()?;
        if left > 0 {
            state.pending = Some((request, left - 1));
            return None;
        }
        let result = if state.pending_failures > 0 {
            state.pending_failures -= 1;
            Err(DeviceError::CommandFailed("exposure failed".into()))
        } else {
            state.frames_taken += 1;
            Ok(CapturedFrame {
                path: state
                    .frame_dir
                    .join(format!("frame_{:04}.fits", state.frames_taken)),
                width: state.width / request.bin_x.max(1),
                height: state.height / request.bin_y.max(1),
                bin_x: request.bin_x,
                bin_y: request.bin_y,
            })
        };
        Some(ExposureOutcome {
            ticket: request.ticket,
            result,
        })
    }

    fn abort_exposure(&mut self) -> Result<(), DeviceError> {
        lock(&self.state).pending = None;
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        lock(&self.state).pending.is_some()
    }

    fn can_bin(&self) -> bool {
        let state = lock(&self.state);
        state.max_binning.0 > 1 || state.max_binning.1 > 1
    }

    fn max_binning(&self) -> (u32, u32) {
        lock(&self.state).max_binning
    }

    fn set_binning(&mut self, x: u32, y: u32) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        if x == 0 || y == 0 || x > state.max_binning.0 || y > state.max_binning.1 {
            return Err(DeviceError::CommandFailed(format!("binning {x}x{y} unsupported")));
        }
        state.binning = (x, y);
        Ok(())
    }

    fn frame(&self) -> ChipFrame {
        let state = lock(&self.state);
        ChipFrame {
            x: 0,
            y: 0,
            width: state.width,
            height: state.height,
        }
    }

    fn upload_mode(&self) -> UploadMode {
        lock(&self.state).upload_mode
    }

    fn set_upload_mode(&mut self, mode: UploadMode) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        state.upload_mode = mode;
        state.upload_modes.push(mode);
        Ok(())
    }

    fn warm_up(&mut self) -> Result<(), DeviceError> {
        lock(&self.state).warm = true;
        Ok(())
    }

    fn is_warm(&self) -> bool {
        lock(&self.state).warm
    }
}

#[derive(Debug, Clone)]
pub struct FilterState {
    pub filters: Vec<String>,
    pub current: Option<String>,
    pub op: SimOperation,
}

pub struct SimFilterWheel {
    state: Shared<FilterState>,
}

impl FilterControl for SimFilterWheel {
    fn filters(&self) -> Vec<String> {
        lock(&self.state).filters.clone()
    }

    fn current(&self) -> Option<String> {
        lock(&self.state).current.clone()
    }

    fn select(&mut self, name: &str) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        if !state.filters.iter().any(|f| f == name) {
            return Err(DeviceError::CommandFailed(format!("no filter named {name}")));
        }
        state.current = Some(name.to_string());
        state.op.start();
        Ok(())
    }

    fn status(&self) -> OperationStatus {
        lock(&self.state).op.poll()
    }
}

pub struct SimFocuser {
    op: Shared<SimOperation>,
}

impl FocusControl for SimFocuser {
    fn start_autofocus(&mut self) -> Result<(), DeviceError> {
        lock(&self.op).start();
        Ok(())
    }

    fn status(&self) -> OperationStatus {
        lock(&self.op).poll()
    }
}

pub struct SimGuider {
    op: Shared<SimOperation>,
}

impl GuideControl for SimGuider {
    fn start_guiding(&mut self) -> Result<(), DeviceError> {
        lock(&self.op).start();
        Ok(())
    }

    fn stop_guiding(&mut self) -> Result<(), DeviceError> {
        lock(&self.op).reset();
        Ok(())
    }

    fn status(&self) -> OperationStatus {
        lock(&self.op).poll()
    }
}

pub struct SimSequencer {
    op: Shared<SimOperation>,
    sequences: Shared<Vec<PathBuf>>,
}

impl SequenceControl for SimSequencer {
    fn start(&mut self, sequence: &Path) -> Result<(), DeviceError> {
        lock(&self.sequences).push(sequence.to_path_buf());
        lock(&self.op).start();
        Ok(())
    }

    fn abort(&mut self) -> Result<(), DeviceError> {
        lock(&self.op).reset();
        Ok(())
    }

    fn status(&self) -> OperationStatus {
        lock(&self.op).poll()
    }
}

pub struct SimDome {
    op: Shared<SimOperation>,
}

impl DomeControl for SimDome {
    fn close(&mut self) -> Result<(), DeviceError> {
        lock(&self.op).start();
        Ok(())
    }

    fn status(&self) -> OperationStatus {
        lock(&self.op).poll()
    }
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub op: SimOperation,
    status: SessionStatus,
    target: SessionStatus,
}

pub struct SimSession {
    state: Shared<SessionState>,
}

impl SessionControl for SimSession {
    fn start_devices(&mut self) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        state.op.start();
        state.status = SessionStatus::Starting;
        state.target = SessionStatus::Started;
        Ok(())
    }

    fn connect(&mut self) -> Result<(), DeviceError> {
        let mut state = lock(&self.state);
        state.op.start();
        state.status = SessionStatus::Connecting;
        state.target = SessionStatus::Connected;
        Ok(())
    }

    fn status(&self) -> SessionStatus {
        let mut state = lock(&self.state);
        match state.op.poll() {
            OperationStatus::Complete => {
                state.status = state.target.clone();
            }
            OperationStatus::Failed(reason) => {
                state.status = SessionStatus::Failed(reason);
            }
            OperationStatus::Busy | OperationStatus::Idle => {}
        }
        state.status.clone()
    }
}

pub struct SimWeather {
    status: Shared<WeatherStatus>,
}

impl WeatherSource for SimWeather {
    fn status(&self) -> WeatherStatus {
        *lock(&self.status)
    }
}

/// Handles onto every simulated device behind a [`Rig`].
#[derive(Clone)]
pub struct SimHandles {
    pub mount: Shared<MountState>,
    pub camera: Shared<CameraState>,
    pub filter_wheel: Shared<FilterState>,
    pub focuser: Shared<SimOperation>,
    pub guider: Shared<SimOperation>,
    pub sequencer: Shared<SimOperation>,
    pub sequences: Shared<Vec<PathBuf>>,
    pub dome: Shared<SimOperation>,
    pub session: Shared<SessionState>,
    pub weather: Shared<WeatherStatus>,
}

/// Builds a fully populated simulated rig.
pub fn build(settings: &SimSettings) -> (Rig, SimHandles) {
    let start = SkyCoordinate::clamped(
        settings.start_ra_hours,
        settings.start_dec_deg,
        Frame::Apparent,
    );
    let mut mount = MountState::new(start);
    mount.error_ra_deg = settings.pointing_error_ra_arcmin / 60.0;
    mount.error_dec_deg = settings.pointing_error_dec_arcmin / 60.0;
    mount.dec_drift_per_ra_deg = settings.dec_drift_arcsec_per_deg / 3600.0;
    mount.can_sync = settings.can_sync;
    mount.slew_polls = settings.slew_polls;

    let mut camera = CameraState::new(settings.exposure_polls);
    camera.frame_dir = settings.frame_dir.clone();

    let ops = settings.operation_polls;
    let handles = SimHandles {
        mount: Arc::new(Mutex::new(mount)),
        camera: Arc::new(Mutex::new(camera)),
        filter_wheel: Arc::new(Mutex::new(FilterState {
            filters: settings.filters.clone(),
            current: settings.filters.first().cloned(),
            op: SimOperation::new(ops),
        })),
        focuser: Arc::new(Mutex::new(SimOperation::new(ops))),
        guider: Arc::new(Mutex::new(SimOperation::new(ops))),
        sequencer: Arc::new(Mutex::new(SimOperation::new(ops))),
        sequences: Arc::new(Mutex::new(Vec::new())),
        dome: Arc::new(Mutex::new(SimOperation::new(ops))),
        session: Arc::new(Mutex::new(SessionState {
            op: SimOperation::new(ops),
            status: SessionStatus::Stopped,
            target: SessionStatus::Stopped,
        })),
        weather: Arc::new(Mutex::new(settings.weather)),
    };

    let rig = Rig {
        mount: Some(Box::new(SimMount::new(handles.mount.clone()))),
        camera: Some(Box::new(SimCamera::new(handles.camera.clone()))),
        filter_wheel: if settings.filters.is_empty() {
            None
        } else {
            Some(Box::new(SimFilterWheel {
                state: handles.filter_wheel.clone(),
            }))
        },
        focuser: Some(Box::new(SimFocuser {
            op: handles.focuser.clone(),
        })),
        guider: Some(Box::new(SimGuider {
            op: handles.guider.clone(),
        })),
        sequencer: Some(Box::new(SimSequencer {
            op: handles.sequencer.clone(),
            sequences: handles.sequences.clone(),
        })),
        dome: Some(Box::new(SimDome {
            op: handles.dome.clone(),
        })),
        session: Some(Box::new(SimSession {
            state: handles.session.clone(),
        })),
        weather: Some(Box::new(SimWeather {
            status: handles.weather.clone(),
        })),
    };

    (rig, handles)
}

fn wrap_degrees(deg: f64) -> f64 {
    (deg + 180.0).rem_euclid(360.0) - 180.0
}
