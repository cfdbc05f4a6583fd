//! Polar axis error measurement.
//!
//! Each axis is measured by solving a frame, moving the mount a fixed amount in
//! RA, solving again and converting the declination drift into an angular
//! misalignment of the polar axis.

use serde::Serialize;

use super::error::AlignError;
use crate::astro::{format_dms, Hemisphere};

/// RA offset of the second frame, in degrees (30 arcminutes).
pub const RA_MOTION_DEG: f64 = 0.5;

/// Asks the person at the telescope to confirm a manual step.
pub trait Operator {
    fn confirm(&mut self, prompt: &str) -> bool;
}

impl<F: FnMut(&str) -> bool> Operator for F {
    fn confirm(&mut self, prompt: &str) -> bool {
        self(prompt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum PolarAxis {
    Azimuth,
    Altitude,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum_macros::Display)]
pub enum PolarStage {
    #[default]
    Init,
    FirstTarget,
    Syncing,
    Slewing,
    SecondTarget,
    Finished,
    Correcting,
}

impl PolarStage {
    /// True while a measurement is running for this axis.
    pub fn is_measuring(self) -> bool {
        !matches!(self, PolarStage::Init | PolarStage::Correcting)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
    East,
    West,
    High,
    Low,
}

/// Solved position of the first frame of a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PolarSample {
    pub ra_deg: f64,
    pub dec_deg: f64,
    pub az_deg: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolarError {
    pub axis: PolarAxis,
    /// Size of the error in degrees, never negative. The sign of the drift is
    /// carried by `direction`.
    pub deviation_deg: f64,
    pub direction: Direction,
    pub message: String,
}

pub fn prompt(axis: PolarAxis, hemisphere: Hemisphere) -> &'static str {
    match (axis, hemisphere) {
        (PolarAxis::Azimuth, Hemisphere::North) => {
            "Point the telescope at the southern meridian. Press continue when ready."
        }
        (PolarAxis::Azimuth, Hemisphere::South) => {
            "Point the telescope at the northern meridian. Press continue when ready."
        }
        (PolarAxis::Altitude, _) => {
            "Point the telescope to the eastern or western horizon with a minimum altitude of 20 degrees. Press continue when ready."
        }
    }
}

/// Which way the axis is off. A first frame with azimuth in (0, 180] lies east
/// of the meridian.
pub fn direction(
    hemisphere: Hemisphere,
    axis: PolarAxis,
    init_az_deg: f64,
    dec_deviation: f64,
) -> Direction {
    let positive = dec_deviation > 0.0;
    let east = init_az_deg > 0.0 && init_az_deg <= 180.0;
    match (hemisphere, axis, east) {
        (Hemisphere::North, PolarAxis::Azimuth, _) => {
            if positive { Direction::West } else { Direction::East }
        }
        (Hemisphere::North, PolarAxis::Altitude, true) => {
            if positive { Direction::High } else { Direction::Low }
        }
        (Hemisphere::North, PolarAxis::Altitude, false) => {
            if positive { Direction::Low } else { Direction::High }
        }
        (Hemisphere::South, PolarAxis::Azimuth, _) => {
            if positive { Direction::East } else { Direction::West }
        }
        (Hemisphere::South, PolarAxis::Altitude, true) => {
            if positive { Direction::Low } else { Direction::High }
        }
        (Hemisphere::South, PolarAxis::Altitude, false) => {
            if positive { Direction::High } else { Direction::Low }
        }
    }
}

/// Converts the drift between two solved frames into a polar axis error
/// (Frank Barrett, "Measuring Polar Axis Alignment Error").
pub fn calculate_polar_error(
    axis: PolarAxis,
    hemisphere: Hemisphere,
    init: PolarSample,
    final_ra_deg: f64,
    final_dec_deg: f64,
) -> Result<PolarError, AlignError> {
    let ra_motion = final_ra_deg - init.ra_deg;
    let dec_deviation = final_dec_deg - init.dec_deg;
    // Minutes of RA motion, taken linearly from the degree difference.
    let ra_time = ra_motion.abs() * 60.0;
    if ra_time == 0.0 {
        return Err(AlignError::Validation(
            "no RA motion between polar alignment frames".into(),
        ));
    }

    let deviation =
        (3.81 * (dec_deviation * 3600.0)) / (ra_time * init.dec_deg.to_radians().cos()) / 60.0;
    if !deviation.is_finite() {
        return Err(AlignError::Validation(format!(
            "polar error undefined at declination {}",
            init.dec_deg
        )));
    }

    let direction = direction(hemisphere, axis, init.az_deg, dec_deviation);
    log::debug!(
        "Polar alignment: hemisphere {} initAz {:.3} decDeviation {:.1}\" RATime {:.3} min raw deviation {:.5}°",
        hemisphere,
        init.az_deg,
        dec_deviation * 3600.0,
        ra_time,
        deviation
    );

    Ok(PolarError {
        axis,
        deviation_deg: deviation.abs(),
        direction,
        message: format!("{} too far {}", format_dms(deviation.abs()), direction),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(dec: f64, az: f64) -> PolarSample {
        PolarSample {
            ra_deg: 100.0,
            dec_deg: dec,
            az_deg: az,
        }
    }

    #[test]
    fn direction_table() {
        use Direction::*;
        use Hemisphere::*;
        use PolarAxis::*;

        let cases = [
            (North, Azimuth, 90.0, West, East),
            (North, Azimuth, 270.0, West, East),
            (North, Altitude, 90.0, High, Low),
            (North, Altitude, 270.0, Low, High),
            (South, Azimuth, 90.0, East, West),
            (South, Azimuth, 270.0, East, West),
            (South, Altitude, 90.0, Low, High),
            (South, Altitude, 270.0, High, Low),
        ];
        for (hemisphere, axis, az, positive, negative) in cases {
            assert_eq!(direction(hemisphere, axis, az, 0.01), positive, "{hemisphere} {axis} {az}");
            assert_eq!(direction(hemisphere, axis, az, -0.01), negative, "{hemisphere} {axis} {az}");
        }
    }

    #[test]
    fn horizon_boundaries() {
        let h = Hemisphere::North;
        let a = PolarAxis::Altitude;
        assert_eq!(direction(h, a, 180.0, 1.0), Direction::High);
        assert_eq!(direction(h, a, 0.0, 1.0), Direction::Low);
        assert_eq!(direction(h, a, 180.1, 1.0), Direction::Low);
        assert_eq!(direction(h, a, 0.0, 0.0), Direction::High);
    }

    #[test]
    fn northern_azimuth_messages() {
        let west = calculate_polar_error(
            PolarAxis::Azimuth,
            Hemisphere::North,
            sample(0.0, 180.0),
            99.5,
            0.01,
        )
        .unwrap();
        assert!(west.message.ends_with("too far west"), "{}", west.message);
        assert!(west.deviation_deg > 0.0);

        let east = calculate_polar_error(
            PolarAxis::Azimuth,
            Hemisphere::North,
            sample(0.0, 180.0),
            99.5,
            -0.01,
        )
        .unwrap();
        assert!(east.message.ends_with("too far east"), "{}", east.message);
        assert!(east.deviation_deg > 0.0);
        assert!((east.deviation_deg - west.deviation_deg).abs() < 1e-12);
    }

    #[test]
    fn deviation_formula() {
        // 36" of drift over 30' of RA at the equator: 3.81 * 36 / 30 / 60.
        let err = calculate_polar_error(
            PolarAxis::Azimuth,
            Hemisphere::North,
            sample(0.0, 180.0),
            99.5,
            0.01,
        )
        .unwrap();
        let expected = 3.81 * 36.0 / 30.0 / 60.0;
        assert!((err.deviation_deg - expected).abs() < 1e-12);
        assert_eq!(err.message, format!("{} too far west", format_dms(expected)));

        // Higher declination stretches the deviation by 1/cos(dec).
        let high = calculate_polar_error(
            PolarAxis::Azimuth,
            Hemisphere::North,
            sample(60.0, 180.0),
            99.5,
            60.01,
        )
        .unwrap();
        assert!((high.deviation_deg - 2.0 * expected).abs() < 1e-9);
    }

    #[test]
    fn zero_ra_motion_is_rejected() {
        let err = calculate_polar_error(
            PolarAxis::Altitude,
            Hemisphere::South,
            sample(10.0, 90.0),
            100.0,
            10.1,
        )
        .unwrap_err();
        assert!(matches!(err, AlignError::Validation(_)));
    }

    #[test]
    fn closures_are_operators() {
        let mut asked = Vec::new();
        let mut operator = |prompt: &str| {
            asked.push(prompt.to_string());
            false
        };
        assert!(!operator.confirm(prompt(PolarAxis::Azimuth, Hemisphere::South)));
        assert!(asked[0].contains("northern meridian"));
    }
}
