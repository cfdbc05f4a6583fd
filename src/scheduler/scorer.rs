//! Job eligibility and ranking.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::job::{JobState, JobTarget, ObservationJob};
use crate::astro::{angular_separation_deg, ObserverSite, SkyCoordinate};
use crate::devices::WeatherStatus;

/// Suitability bonus for a window about to close, in degrees of altitude.
const URGENCY_BONUS: f64 = 30.0;

/// Observing conditions a job is scored against.
#[derive(Debug, Clone)]
pub struct Conditions<'a> {
    pub now: DateTime<Utc>,
    pub site: ObserverSite,
    pub weather: WeatherStatus,
    /// Apparent position of the Moon.
    pub moon: SkyCoordinate,
    pub filters: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Ineligible {
    #[error("job is {0}")]
    Finished(JobState),
    #[error("window opens at {0}")]
    NotStarted(DateTime<Utc>),
    #[error("window closed at {0}")]
    Expired(DateTime<Utc>),
    #[error("target altitude {altitude:.1}° below minimum {minimum:.1}°")]
    BelowAltitude { altitude: f64, minimum: f64 },
    #[error("weather is {0}")]
    Weather(WeatherStatus),
    #[error("moon separation {separation:.1}° below minimum {minimum:.1}°")]
    MoonTooClose { separation: f64, minimum: f64 },
    #[error("filter {0} is not available")]
    FilterUnavailable(String),
    #[error("target image has not been solved")]
    UnresolvedTarget,
}

impl Ineligible {
    /// True when waiting may make the job eligible later in the night.
    pub fn is_pending(&self) -> bool {
        matches!(self, Ineligible::NotStarted(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobScore {
    pub priority: u8,
    pub altitude_deg: f64,
    pub suitability: f64,
}

impl JobScore {
    /// Priority first (0 before 20), then higher suitability.
    pub fn rank(&self, other: &JobScore) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.suitability.total_cmp(&self.suitability))
    }
}

pub fn score(job: &ObservationJob, conditions: &Conditions) -> Result<JobScore, Ineligible> {
    if job.state.is_final() || job.state == JobState::Running {
        return Err(Ineligible::Finished(job.state));
    }
    let c = &job.constraints;
    let now = conditions.now;

    if let Some(start) = c.start.filter(|start| now < *start) {
        return Err(Ineligible::NotStarted(start));
    }
    if let Some(end) = c.end.filter(|end| now >= *end) {
        return Err(Ineligible::Expired(end));
    }

    let target = match &job.target {
        JobTarget::Coordinates(c) => c.to_apparent(now),
        JobTarget::Fits(_) => return Err(Ineligible::UnresolvedTarget),
    };
    let site = conditions.site;
    let altitude = target
        .to_horizontal(site.local_sidereal_time(now), site.latitude_deg)
        .alt_deg;
    if let Some(minimum) = c.min_altitude_deg.filter(|min| altitude < *min) {
        return Err(Ineligible::BelowAltitude { altitude, minimum });
    }

    if c.enforce_weather && conditions.weather != WeatherStatus::Ok {
        return Err(Ineligible::Weather(conditions.weather));
    }

    if let Some(minimum) = c.min_moon_separation_deg {
        let separation = angular_separation_deg(&target, &conditions.moon);
        if separation < minimum {
            return Err(Ineligible::MoonTooClose {
                separation,
                minimum,
            });
        }
    }

    if let Some(filter) = &c.filter {
        if !conditions.filters.iter().any(|f| f == filter) {
            return Err(Ineligible::FilterUnavailable(filter.clone()));
        }
    }

    let urgency = c
        .end
        .map(|end| {
            let hours = (end - now).num_seconds() as f64 / 3600.0;
            URGENCY_BONUS / (1.0 + hours)
        })
        .unwrap_or(0.0);

    Ok(JobScore {
        priority: job.priority,
        altitude_deg: altitude,
        suitability: altitude + urgency,
    })
}

/// Eligible jobs, best first. Equal scores keep list order.
pub fn rank(jobs: &[ObservationJob], conditions: &Conditions) -> Vec<(usize, JobScore)> {
    let mut eligible: Vec<_> = jobs
        .iter()
        .enumerate()
        .filter_map(|(i, job)| match score(job, conditions) {
            Ok(score) => Some((i, score)),
            Err(reason) => {
                log::debug!("{} not eligible: {}", job.name, reason);
                None
            }
        })
        .collect();
    eligible.sort_by(|(_, a), (_, b)| a.rank(b));
    eligible
}
