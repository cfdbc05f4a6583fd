use chrono::{DateTime, Utc};

use super::coords::{Frame, SkyCoordinate};
use super::time::julian_date;

/// Low-precision geocentric position of the Moon (about 0.3 degrees), which is
/// plenty for a separation constraint.
pub fn moon_position(at: DateTime<Utc>) -> SkyCoordinate {
    let t = (julian_date(at) - 2_451_545.0) / 36_525.0;
    let sind = |deg: f64| deg.to_radians().sin();

    let lambda = 218.32 + 481_267.881 * t
        + 6.29 * sind(135.0 + 477_198.87 * t)
        - 1.27 * sind(259.3 - 413_335.36 * t)
        + 0.66 * sind(235.7 + 890_534.22 * t)
        + 0.21 * sind(269.9 + 954_397.74 * t)
        - 0.19 * sind(357.5 + 35_999.05 * t)
        - 0.11 * sind(186.5 + 966_404.03 * t);
    let beta = 5.13 * sind(93.3 + 483_202.02 * t)
        + 0.28 * sind(228.2 + 960_400.89 * t)
        - 0.28 * sind(318.3 + 6_003.15 * t)
        - 0.17 * sind(217.6 - 407_332.21 * t);
    let epsilon = (23.439 - 0.013 * t).to_radians();

    let lambda = lambda.to_radians();
    let beta = beta.to_radians();

    let ra = (lambda.sin() * epsilon.cos() - beta.tan() * epsilon.sin()).atan2(lambda.cos());
    let dec = (beta.sin() * epsilon.cos() + beta.cos() * epsilon.sin() * lambda.sin())
        .clamp(-1.0, 1.0)
        .asin();

    SkyCoordinate::clamped(ra.to_degrees() / 15.0, dec.to_degrees(), Frame::Apparent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn matches_almanac_within_a_degree() {
        // Meeus example 47.a: 1992-04-12 0h TT, RA 134.688, Dec 13.768.
        let at = Utc.with_ymd_and_hms(1992, 4, 12, 0, 0, 0).unwrap();
        let moon = moon_position(at);
        assert!((moon.ra_degrees() - 134.688).abs() < 1.0, "ra {}", moon.ra_degrees());
        assert!((moon.dec_degrees() - 13.768).abs() < 1.0, "dec {}", moon.dec_degrees());
    }

    #[test]
    fn stays_near_the_ecliptic() {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 22, 0, 0).unwrap();
        assert!(moon_position(at).dec_degrees().abs() < 29.0);
    }
}
