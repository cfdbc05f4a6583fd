//! Capability interfaces for the observatory hardware.
//!
//! Each device implements only the capabilities it has. A missing capability is
//! a `None` slot in [`Rig`], never a failed downcast.

mod error;
pub mod sim;
mod types;

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub use error::DeviceError;
pub use types::{
    CapturedFrame, ChipFrame, ExposureOutcome, ExposureRequest, OperationStatus, SessionStatus,
    UploadMode, WeatherStatus,
};

use crate::astro::SkyCoordinate;

pub trait MountControl: Send {
    fn is_connected(&self) -> bool;
    /// Current pointing in the mount's own (apparent) frame.
    fn equatorial_coordinates(&self) -> Result<SkyCoordinate, DeviceError>;
    fn slew(&mut self, ra_hours: f64, dec_deg: f64) -> Result<(), DeviceError>;
    fn sync(&mut self, ra_hours: f64, dec_deg: f64) -> Result<(), DeviceError>;
    fn is_slewing(&self) -> bool;
    fn can_sync(&self) -> bool;
    fn park(&mut self) -> Result<(), DeviceError>;
    fn is_parked(&self) -> bool;
    fn abort(&mut self) -> Result<(), DeviceError>;
}

pub trait CameraControl: Send {
    fn is_connected(&self) -> bool;
    fn capture(&mut self, request: ExposureRequest) -> Result<(), DeviceError>;
    /// Returns each finished exposure exactly once.
    fn poll_exposure(&mut self) -> Option<ExposureOutcome>;
    fn abort_exposure(&mut self) -> Result<(), DeviceError>;
    fn is_capturing(&self) -> bool;
    fn can_bin(&self) -> bool;
    fn max_binning(&self) -> (u32, u32);
    fn set_binning(&mut self, x: u32, y: u32) -> Result<(), DeviceError>;
    fn frame(&self) -> ChipFrame;
    fn upload_mode(&self) -> UploadMode;
    fn set_upload_mode(&mut self, mode: UploadMode) -> Result<(), DeviceError>;
    fn warm_up(&mut self) -> Result<(), DeviceError>;
    fn is_warm(&self) -> bool;
}

pub trait FilterControl: Send {
    fn filters(&self) -> Vec<String>;
    fn current(&self) -> Option<String>;
    fn select(&mut self, name: &str) -> Result<(), DeviceError>;
    fn status(&self) -> OperationStatus;
}

pub trait FocusControl: Send {
    fn start_autofocus(&mut self) -> Result<(), DeviceError>;
    fn status(&self) -> OperationStatus;
}

pub trait GuideControl: Send {
    fn start_guiding(&mut self) -> Result<(), DeviceError>;
    fn stop_guiding(&mut self) -> Result<(), DeviceError>;
    fn status(&self) -> OperationStatus;
}

/// Runs the capture sequence attached to a job.
pub trait SequenceControl: Send {
    fn start(&mut self, sequence: &Path) -> Result<(), DeviceError>;
    fn abort(&mut self) -> Result<(), DeviceError>;
    fn status(&self) -> OperationStatus;
}

pub trait DomeControl: Send {
    fn close(&mut self) -> Result<(), DeviceError>;
    fn status(&self) -> OperationStatus;
}

/// Brings the device drivers up and connects them.
pub trait SessionControl: Send {
    fn start_devices(&mut self) -> Result<(), DeviceError>;
    fn connect(&mut self) -> Result<(), DeviceError>;
    fn status(&self) -> SessionStatus;
}

pub trait WeatherSource: Send {
    fn status(&self) -> WeatherStatus;
}

/// Locks shared device state, carrying on past a poisoned lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The set of devices available to the controllers.
#[derive(Default)]
pub struct Rig {
    pub mount: Option<Box<dyn MountControl>>,
    pub camera: Option<Box<dyn CameraControl>>,
    pub filter_wheel: Option<Box<dyn FilterControl>>,
    pub focuser: Option<Box<dyn FocusControl>>,
    pub guider: Option<Box<dyn GuideControl>>,
    pub sequencer: Option<Box<dyn SequenceControl>>,
    pub dome: Option<Box<dyn DomeControl>>,
    pub session: Option<Box<dyn SessionControl>>,
    pub weather: Option<Box<dyn WeatherSource>>,
}

impl Rig {
    pub fn mount(&self) -> Result<&dyn MountControl, DeviceError> {
        self.mount.as_deref().ok_or(DeviceError::NotPresent("mount"))
    }

    pub fn mount_mut(&mut self) -> Result<&mut (dyn MountControl + 'static), DeviceError> {
        self.mount
            .as_deref_mut()
            .ok_or(DeviceError::NotPresent("mount"))
    }

    pub fn camera(&self) -> Result<&dyn CameraControl, DeviceError> {
        self.camera.as_deref().ok_or(DeviceError::NotPresent("camera"))
    }

    pub fn camera_mut(&mut self) -> Result<&mut (dyn CameraControl + 'static), DeviceError> {
        self.camera
            .as_deref_mut()
            .ok_or(DeviceError::NotPresent("camera"))
    }

    pub fn focus_busy(&self) -> bool {
        self.focuser
            .as_ref()
            .is_some_and(|f| f.status().is_busy())
    }

    /// Weather without a station is taken as clear.
    pub fn weather_status(&self) -> WeatherStatus {
        self.weather
            .as_ref()
            .map(|w| w.status())
            .unwrap_or(WeatherStatus::Ok)
    }

    pub fn available_filters(&self) -> Vec<String> {
        self.filter_wheel
            .as_ref()
            .map(|f| f.filters())
            .unwrap_or_default()
    }
}
