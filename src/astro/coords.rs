use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::CoordinateError;
use super::time::julian_date;

const J2000_JD: f64 = 2_451_545.0;
const DAYS_PER_CENTURY: f64 = 36_525.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
pub enum Frame {
    /// Mean equator and equinox of J2000, as returned by the plate solver.
    J2000,
    /// Equator and equinox of date (JNow), as used by the mount.
    Apparent,
    Topocentric,
}

/// Equatorial position. RA is kept in [0, 24) hours, Dec in [-90, 90] degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkyCoordinate {
    ra_hours: f64,
    dec_deg: f64,
    frame: Frame,
}

/// Horizontal position. Azimuth is measured from north through east.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HorizontalCoordinate {
    pub alt_deg: f64,
    pub az_deg: f64,
}

impl SkyCoordinate {
    pub fn new(ra_hours: f64, dec_deg: f64, frame: Frame) -> Result<Self, CoordinateError> {
        if !ra_hours.is_finite() {
            return Err(CoordinateError::RaOutOfRange(ra_hours));
        }
        if !dec_deg.is_finite() || !(-90.0..=90.0).contains(&dec_deg) {
            return Err(CoordinateError::DecOutOfRange(dec_deg));
        }
        Ok(Self {
            ra_hours: normalize_hours(ra_hours),
            dec_deg,
            frame,
        })
    }

    /// For values produced by trigonometry, where only rounding can push Dec
    /// past the poles.
    pub(crate) fn clamped(ra_hours: f64, dec_deg: f64, frame: Frame) -> Self {
        Self {
            ra_hours: normalize_hours(ra_hours),
            dec_deg: dec_deg.clamp(-90.0, 90.0),
            frame,
        }
    }

    pub fn from_degrees(ra_deg: f64, dec_deg: f64, frame: Frame) -> Result<Self, CoordinateError> {
        Self::new(ra_deg / 15.0, dec_deg, frame)
    }

    pub fn ra_hours(&self) -> f64 {
        self.ra_hours
    }

    pub fn ra_degrees(&self) -> f64 {
        self.ra_hours * 15.0
    }

    pub fn dec_degrees(&self) -> f64 {
        self.dec_deg
    }

    pub fn frame(&self) -> Frame {
        self.frame
    }

    pub fn with_frame(self, frame: Frame) -> Self {
        Self { frame, ..self }
    }

    /// Hour angle in degrees for the given local sidereal time.
    pub fn hour_angle_deg(&self, lst_hours: f64) -> f64 {
        (lst_hours - self.ra_hours) * 15.0
    }

    pub fn to_horizontal(&self, lst_hours: f64, latitude_deg: f64) -> HorizontalCoordinate {
        let ha = self.hour_angle_deg(lst_hours).to_radians();
        let dec = self.dec_deg.to_radians();
        let lat = latitude_deg.to_radians();

        let sin_alt = dec.sin() * lat.sin() + dec.cos() * lat.cos() * ha.cos();
        let alt = sin_alt.clamp(-1.0, 1.0).asin();
        let az = (-dec.cos() * ha.sin()).atan2(dec.sin() * lat.cos() - dec.cos() * lat.sin() * ha.cos());

        HorizontalCoordinate {
            alt_deg: alt.to_degrees(),
            az_deg: az.to_degrees().rem_euclid(360.0),
        }
    }

    pub fn from_horizontal(
        horizontal: HorizontalCoordinate,
        lst_hours: f64,
        latitude_deg: f64,
        frame: Frame,
    ) -> Self {
        let alt = horizontal.alt_deg.to_radians();
        let az = horizontal.az_deg.to_radians();
        let lat = latitude_deg.to_radians();

        let sin_dec = alt.sin() * lat.sin() + alt.cos() * lat.cos() * az.cos();
        let dec = sin_dec.clamp(-1.0, 1.0).asin();
        let ha = (-az.sin() * alt.cos()).atan2(alt.sin() * lat.cos() - alt.cos() * lat.sin() * az.cos());

        Self {
            ra_hours: normalize_hours(lst_hours - ha.to_degrees() / 15.0),
            dec_deg: dec.to_degrees(),
            frame,
        }
    }

    /// Shifts the position along RA, wrapping into [0, 24) hours.
    pub fn offset_ra_deg(&self, delta_deg: f64) -> Self {
        Self {
            ra_hours: normalize_hours(self.ra_hours + delta_deg / 15.0),
            ..*self
        }
    }

    /// Precesses a J2000 position to the equinox of `at` (IAU 1976 angles).
    pub fn to_apparent(&self, at: DateTime<Utc>) -> Self {
        if self.frame != Frame::J2000 {
            return *self;
        }
        let (ra, dec) = precess(self.ra_degrees(), self.dec_deg, centuries_since_j2000(at));
        Self {
            ra_hours: normalize_hours(ra / 15.0),
            dec_deg: dec,
            frame: Frame::Apparent,
        }
    }

    /// Inverse of [`SkyCoordinate::to_apparent`], solved by fixed-point iteration.
    pub fn to_j2000(&self, at: DateTime<Utc>) -> Self {
        if self.frame == Frame::J2000 {
            return *self;
        }
        let t = centuries_since_j2000(at);
        let (mut ra, mut dec) = (self.ra_degrees(), self.dec_deg);
        for _ in 0..4 {
            let (pra, pdec) = precess(ra, dec, t);
            ra += wrap_degrees(self.ra_degrees() - pra);
            dec += self.dec_deg - pdec;
        }
        Self {
            ra_hours: normalize_hours(ra / 15.0),
            dec_deg: dec.clamp(-90.0, 90.0),
            frame: Frame::J2000,
        }
    }
}

/// Great-circle separation in degrees.
pub fn angular_separation_deg(a: &SkyCoordinate, b: &SkyCoordinate) -> f64 {
    let (ra1, dec1) = (a.ra_degrees().to_radians(), a.dec_deg.to_radians());
    let (ra2, dec2) = (b.ra_degrees().to_radians(), b.dec_deg.to_radians());
    let hav = ((dec2 - dec1) / 2.0).sin().powi(2)
        + dec1.cos() * dec2.cos() * ((ra2 - ra1) / 2.0).sin().powi(2);
    (2.0 * hav.sqrt().clamp(0.0, 1.0).asin()).to_degrees()
}

/// Separation used for the alignment accuracy check. The RA difference is taken
/// linearly in arcseconds without the cos(dec) factor. It is not wrapped, so
/// positions either side of 0h compare as nearly a full circle apart.
pub fn planar_separation_arcsec(a: &SkyCoordinate, b: &SkyCoordinate) -> f64 {
    let ra_diff = (a.ra_degrees() - b.ra_degrees()).abs() * 3600.0;
    let dec_diff = (a.dec_deg - b.dec_deg).abs() * 3600.0;
    (ra_diff * ra_diff + dec_diff * dec_diff).sqrt()
}

fn centuries_since_j2000(at: DateTime<Utc>) -> f64 {
    (julian_date(at) - J2000_JD) / DAYS_PER_CENTURY
}

fn precess(ra_deg: f64, dec_deg: f64, t: f64) -> (f64, f64) {
    let arcsec = |v: f64| (v / 3600.0).to_radians();
    let zeta = arcsec(2306.2181 * t + 0.30188 * t * t + 0.017998 * t * t * t);
    let z = arcsec(2306.2181 * t + 1.09468 * t * t + 0.018203 * t * t * t);
    let theta = arcsec(2004.3109 * t - 0.42665 * t * t - 0.041833 * t * t * t);

    let ra0 = ra_deg.to_radians();
    let dec0 = dec_deg.to_radians();

    let a = dec0.cos() * (ra0 + zeta).sin();
    let b = theta.cos() * dec0.cos() * (ra0 + zeta).cos() - theta.sin() * dec0.sin();
    let c = theta.sin() * dec0.cos() * (ra0 + zeta).cos() + theta.cos() * dec0.sin();

    let ra = a.atan2(b) + z;
    let dec = c.clamp(-1.0, 1.0).asin();
    (ra.to_degrees().rem_euclid(360.0), dec.to_degrees())
}

fn normalize_hours(hours: f64) -> f64 {
    let h = hours.rem_euclid(24.0);
    if h >= 24.0 {
        0.0
    } else {
        h
    }
}

fn wrap_degrees(deg: f64) -> f64 {
    (deg + 180.0).rem_euclid(360.0) - 180.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn coord(ra: f64, dec: f64) -> SkyCoordinate {
        SkyCoordinate::new(ra, dec, Frame::Apparent).unwrap()
    }

    #[test]
    fn rejects_declination_outside_range() {
        assert_eq!(
            SkyCoordinate::new(1.0, 91.0, Frame::J2000),
            Err(CoordinateError::DecOutOfRange(91.0))
        );
        assert!(SkyCoordinate::new(f64::NAN, 0.0, Frame::J2000).is_err());
    }

    #[test]
    fn wraps_right_ascension() {
        assert!((coord(-0.5, 0.0).ra_hours() - 23.5).abs() < 1e-12);
        assert!((coord(25.0, 0.0).ra_hours() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn object_on_meridian_culminates_due_south() {
        // Dec 20 seen from latitude 50: altitude 60, azimuth 180.
        let h = coord(6.0, 20.0).to_horizontal(6.0, 50.0);
        assert!((h.alt_deg - 60.0).abs() < 1e-9);
        assert!((h.az_deg - 180.0).abs() < 1e-9);
    }

    #[test]
    fn rising_object_is_east() {
        let h = coord(12.0, 0.0).to_horizontal(8.0, 45.0);
        assert!(h.az_deg > 0.0 && h.az_deg < 180.0);
    }

    #[test]
    fn horizontal_round_trip() {
        let c = coord(3.25, -12.5);
        let h = c.to_horizontal(7.1, 38.0);
        let back = SkyCoordinate::from_horizontal(h, 7.1, 38.0, Frame::Apparent);
        assert!((back.ra_hours() - c.ra_hours()).abs() < 1e-9);
        assert!((back.dec_degrees() - c.dec_degrees()).abs() < 1e-9);
    }

    #[test]
    fn precession_moves_position_by_expected_amount() {
        // About 50"/yr in longitude; after ~26 years the shift is well under a degree.
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let j2000 = SkyCoordinate::new(0.7124, 41.269, Frame::J2000).unwrap();
        let apparent = j2000.to_apparent(at);
        let sep = angular_separation_deg(&j2000, &apparent);
        assert!(sep > 0.1 && sep < 0.6, "separation {sep}");
        let back = apparent.to_j2000(at);
        assert!(angular_separation_deg(&back, &j2000) * 3600.0 < 0.01);
    }

    #[test]
    fn planar_separation_ignores_declination_scaling() {
        let a = coord(0.0, 80.0);
        let b = coord(1.0 / 15.0, 80.0);
        assert!((planar_separation_arcsec(&a, &b) - 3600.0).abs() < 1e-6);
        assert!(angular_separation_deg(&a, &b) * 3600.0 < 700.0);
    }

    #[test]
    fn planar_separation_does_not_wrap_at_zero_hours() {
        let a = coord(0.1 / 15.0, 30.0);
        let b = coord(359.9 / 15.0, 30.0);
        let sep = planar_separation_arcsec(&a, &b);
        assert!((sep - 359.8 * 3600.0).abs() < 1e-3, "{sep}");
        assert!(angular_separation_deg(&a, &b) < 0.2);
    }
}
