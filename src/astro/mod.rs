mod coords;
mod error;
mod format;
mod moon;
mod optics;
mod site;
mod time;

pub use coords::{angular_separation_deg, planar_separation_arcsec, Frame, HorizontalCoordinate, SkyCoordinate};
pub use error::CoordinateError;
pub use format::{format_coordinates, format_dec, format_dms, format_ra, parse_dms, parse_hms};
pub use moon::moon_position;
pub use optics::{
    fov_arcmin, FieldBounds, FieldOfView, OpticalGeometry, ARCSEC_PER_RADIAN, FIELD_STRETCH,
};
pub use site::{Hemisphere, ObserverSite};
pub use time::{julian_date, local_sidereal_time, Clock, FixedClock, SystemClock};
