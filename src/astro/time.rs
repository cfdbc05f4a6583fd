use chrono::{DateTime, Utc};

const UNIX_EPOCH_JD: f64 = 2_440_587.5;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to a single instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

pub fn julian_date(at: DateTime<Utc>) -> f64 {
    let seconds = at.timestamp() as f64 + f64::from(at.timestamp_subsec_nanos()) * 1e-9;
    seconds / 86_400.0 + UNIX_EPOCH_JD
}

/// Local mean sidereal time in hours for an east-positive longitude.
pub fn local_sidereal_time(at: DateTime<Utc>, longitude_deg: f64) -> f64 {
    let d = julian_date(at) - 2_451_545.0;
    let gmst = 18.697_374_558 + 24.065_709_824_419_08 * d;
    (gmst + longitude_deg / 15.0).rem_euclid(24.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn julian_date_of_j2000() {
        let at = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap();
        assert!((julian_date(at) - 2_451_545.0).abs() < 1e-9);
    }

    #[test]
    fn greenwich_sidereal_time_at_j2000() {
        let at = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap();
        assert!((local_sidereal_time(at, 0.0) - 18.697_374_558).abs() < 1e-6);
        let east = local_sidereal_time(at, 15.0);
        assert!((east - 19.697_374_558).abs() < 1e-6);
    }
}
