use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::time::local_sidereal_time;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum_macros::Display)]
pub enum Hemisphere {
    North,
    South,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObserverSite {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub altitude_m: f64,
}

impl Default for ObserverSite {
    fn default() -> Self {
        Self {
            latitude_deg: 0.0,
            longitude_deg: 0.0,
            altitude_m: 0.0,
        }
    }
}

impl ObserverSite {
    /// Parses `"lat, lon"` in decimal degrees, east-positive longitude.
    pub fn from_coordinates(coordinates: &str, altitude_m: Option<f64>) -> Option<Self> {
        let parts: Vec<_> = coordinates.split(',').map(|s| s.trim()).collect();
        if parts.len() < 2 {
            return None;
        }
        let lat: f64 = parts[0].parse().ok()?;
        let lon: f64 = parts[1].parse().ok()?;
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=360.0).contains(&lon) {
            return None;
        }
        Some(Self {
            latitude_deg: lat,
            longitude_deg: lon,
            altitude_m: altitude_m.unwrap_or(0.0),
        })
    }

    /// A site exactly on the equator counts as southern.
    pub fn hemisphere(&self) -> Hemisphere {
        if self.latitude_deg > 0.0 {
            Hemisphere::North
        } else {
            Hemisphere::South
        }
    }

    pub fn local_sidereal_time(&self, at: DateTime<Utc>) -> f64 {
        local_sidereal_time(at, self.longitude_deg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_coordinate_pair() {
        let site = ObserverSite::from_coordinates("52.5, 13.4", Some(34.0)).unwrap();
        assert_eq!(site.latitude_deg, 52.5);
        assert_eq!(site.longitude_deg, 13.4);
        assert_eq!(site.altitude_m, 34.0);
        assert_eq!(site.hemisphere(), Hemisphere::North);
    }

    #[test]
    fn rejects_malformed_coordinates() {
        assert!(ObserverSite::from_coordinates("52.5", None).is_none());
        assert!(ObserverSite::from_coordinates("north, east", None).is_none());
        assert!(ObserverSite::from_coordinates("95, 10", None).is_none());
    }

    #[test]
    fn equator_is_southern() {
        let site = ObserverSite::from_coordinates("0, 0", None).unwrap();
        assert_eq!(site.hemisphere(), Hemisphere::South);
    }
}
