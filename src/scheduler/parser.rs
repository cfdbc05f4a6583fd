use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::job::{
    JobConstraints, JobState, JobSteps, JobTarget, ObservationJob, DEFAULT_PRIORITY,
    LOWEST_PRIORITY,
};
use crate::astro::{format_dec, format_ra, parse_dms, parse_hms, Frame, SkyCoordinate};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("job {0}: {1}")]
    Job(usize, String),
}

/// A job list as written: windows may still be relative to the run start.
#[derive(Debug, Clone)]
pub struct JobList {
    pub variables: HashMap<String, serde_yaml::Value>,
    pub jobs: Vec<JobSpec>,
}

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub job: ObservationJob,
    pub start: Option<TimeExpr>,
    pub end: Option<TimeExpr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimeExpr {
    Relative(Duration),
    Absolute(DateTime<Utc>),
}

impl TimeExpr {
    pub fn resolve(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            TimeExpr::Relative(d) => start + *d,
            TimeExpr::Absolute(dt) => *dt,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct JobInput {
    name: String,
    target: TargetInput,
    sequence: PathBuf,
    #[serde(default)]
    steps: JobSteps,
    #[serde(default = "default_priority")]
    priority: u8,
    #[serde(default)]
    constraints: ConstraintInput,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum TargetInput {
    Coordinates { ra: AngleInput, dec: AngleInput },
    Fits { fits: PathBuf },
}

/// Sexagesimal text or a plain number (hours for RA, degrees for Dec).
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum AngleInput {
    Number(f64),
    Text(String),
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConstraintInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    min_altitude_deg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    end: Option<String>,
    #[serde(default)]
    enforce_weather: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    min_moon_separation_deg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filter: Option<String>,
}

#[derive(Debug, Serialize)]
struct JobOutput<'a> {
    name: &'a str,
    target: TargetInput,
    sequence: &'a PathBuf,
    steps: JobSteps,
    priority: u8,
    constraints: ConstraintInput,
}

#[derive(Debug, Serialize)]
struct Document<'a> {
    jobs: Vec<JobOutput<'a>>,
}

impl JobList {
    pub fn from_str(yaml: &str) -> Result<Self, ParseError> {
        let root: serde_yaml::Value = serde_yaml::from_str(yaml)?;

        let variables: HashMap<String, serde_yaml::Value> = root
            .get("variables")
            .map(|v| serde_yaml::from_value(v.clone()))
            .transpose()?
            .unwrap_or_default();

        let jobs = root
            .get("jobs")
            .and_then(|v| v.as_sequence())
            .ok_or_else(|| ParseError::Job(0, "missing 'jobs'".into()))?
            .iter()
            .enumerate()
            .map(|(i, v)| parse_job(i, v, &variables))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(JobList { variables, jobs })
    }

    /// Jobs with their windows fixed relative to `start`.
    pub fn instantiate(&self, start: DateTime<Utc>) -> Vec<ObservationJob> {
        self.jobs
            .iter()
            .map(|spec| {
                let mut job = spec.job.clone();
                job.constraints.start = spec.start.as_ref().map(|t| t.resolve(start));
                job.constraints.end = spec.end.as_ref().map(|t| t.resolve(start));
                job
            })
            .collect()
    }
}

/// Serializes jobs back into the list format, with absolute windows.
pub fn to_yaml(jobs: &[ObservationJob]) -> Result<String, ParseError> {
    let jobs = jobs
        .iter()
        .map(|job| JobOutput {
            name: &job.name,
            target: match &job.target {
                JobTarget::Coordinates(c) => TargetInput::Coordinates {
                    ra: AngleInput::Text(format_ra(c.ra_hours())),
                    dec: AngleInput::Text(format_dec(c.dec_degrees())),
                },
                JobTarget::Fits(path) => TargetInput::Fits { fits: path.clone() },
            },
            sequence: &job.sequence,
            steps: job.steps,
            priority: job.priority,
            constraints: ConstraintInput {
                min_altitude_deg: job.constraints.min_altitude_deg,
                start: job.constraints.start.map(|t| t.to_rfc3339()),
                end: job.constraints.end.map(|t| t.to_rfc3339()),
                enforce_weather: job.constraints.enforce_weather,
                min_moon_separation_deg: job.constraints.min_moon_separation_deg,
                filter: job.constraints.filter.clone(),
            },
        })
        .collect();
    Ok(serde_yaml::to_string(&Document { jobs })?)
}

fn parse_job(
    i: usize,
    value: &serde_yaml::Value,
    vars: &HashMap<String, serde_yaml::Value>,
) -> Result<JobSpec, ParseError> {
    let err = |msg: &str| ParseError::Job(i, msg.into());
    if value.as_mapping().is_none() {
        return Err(err("expected mapping"));
    }

    let input: JobInput =
        serde_yaml::from_value(resolve_value(value, vars)).map_err(|e| err(&e.to_string()))?;

    if input.priority > LOWEST_PRIORITY {
        return Err(err(&format!(
            "priority {} outside 0..={}",
            input.priority, LOWEST_PRIORITY
        )));
    }

    let target = match input.target {
        TargetInput::Coordinates { ra, dec } => {
            let ra = angle(&ra, parse_hms).map_err(|e| err(&format!("ra: {e}")))?;
            let dec = angle(&dec, parse_dms).map_err(|e| err(&format!("dec: {e}")))?;
            JobTarget::Coordinates(
                SkyCoordinate::new(ra, dec, Frame::J2000).map_err(|e| err(&e.to_string()))?,
            )
        }
        TargetInput::Fits { fits } => JobTarget::Fits(fits),
    };

    let c = input.constraints;
    let start = c.start.map(parse_time).transpose().map_err(|e| err(&e))?;
    let end = c.end.map(parse_time).transpose().map_err(|e| err(&e))?;

    let job = ObservationJob {
        name: input.name,
        target,
        sequence: input.sequence,
        steps: input.steps,
        constraints: JobConstraints {
            min_altitude_deg: c.min_altitude_deg,
            start: None,
            end: None,
            enforce_weather: c.enforce_weather,
            min_moon_separation_deg: c.min_moon_separation_deg,
            filter: c.filter,
        },
        priority: input.priority,
        state: JobState::Idle,
    };

    Ok(JobSpec { job, start, end })
}

fn angle(
    value: &AngleInput,
    parse: fn(&str) -> Result<f64, crate::astro::CoordinateError>,
) -> Result<f64, String> {
    match value {
        AngleInput::Number(n) => Ok(*n),
        AngleInput::Text(s) => parse(s).map_err(|e| e.to_string()),
    }
}

fn parse_time(s: String) -> Result<TimeExpr, String> {
    let s = s.trim();

    // Relative: T+10m, T-5m
    if s.to_lowercase().starts_with('t') {
        let rest = &s[1..];
        let (neg, rest) = match rest.strip_prefix('-') {
            Some(r) => (true, r),
            None => (false, rest.strip_prefix('+').unwrap_or(rest)),
        };
        let dur = parse_duration(rest)?;
        return Ok(TimeExpr::Relative(if neg { -dur } else { dur }));
    }

    // Absolute with offset: 2026-01-12T22:00:00Z + 2h
    if let Some(idx) = s.rfind(['+', '-']) {
        if idx > 10 {
            if let Ok(base) = DateTime::parse_from_rfc3339(s[..idx].trim()) {
                let offset = &s[idx..];
                let (neg, rest) = match offset.strip_prefix('-') {
                    Some(r) => (true, r),
                    None => (false, offset.strip_prefix('+').unwrap_or(offset)),
                };
                let dur = parse_duration(rest)?;
                return Ok(TimeExpr::Absolute(
                    base.with_timezone(&Utc) + if neg { -dur } else { dur },
                ));
            }
        }
    }

    DateTime::parse_from_rfc3339(s)
        .map(|dt| TimeExpr::Absolute(dt.with_timezone(&Utc)))
        .map_err(|e| e.to_string())
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s.trim())
        .map_err(|e| e.to_string())
        .and_then(|d| Duration::from_std(d).map_err(|e| e.to_string()))
}

fn resolve_value(
    value: &serde_yaml::Value,
    vars: &HashMap<String, serde_yaml::Value>,
) -> serde_yaml::Value {
    match value {
        serde_yaml::Value::String(s) => {
            // Whole-value reference keeps the variable's type.
            let t = s.trim();
            if let Some(name) = t.strip_prefix('$').filter(|n| !n.contains(' ')) {
                if let Some(v) = vars.get(name) {
                    return v.clone();
                }
            }
            let mut result = s.clone();
            for (name, val) in vars {
                if let Some(rep) = scalar_to_string(val) {
                    result = result.replace(&format!("${name}"), &rep);
                }
            }
            serde_yaml::Value::String(result)
        }
        serde_yaml::Value::Mapping(m) => serde_yaml::Value::Mapping(
            m.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, vars)))
                .collect(),
        ),
        serde_yaml::Value::Sequence(s) => {
            serde_yaml::Value::Sequence(s.iter().map(|v| resolve_value(v, vars)).collect())
        }
        other => other.clone(),
    }
}

fn scalar_to_string(v: &serde_yaml::Value) -> Option<String> {
    match v {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const JOBS: &str = r#"
variables:
  seq_dir: /data/sequences
  min_alt: 30
jobs:
  - name: M42
    target: { ra: "05:35:17.3", dec: "-05:23:28" }
    sequence: $seq_dir/m42.esq
    priority: 2
    constraints:
      min_altitude_deg: $min_alt
      start: T+10m
      end: 2026-01-12T22:00:00Z + 2h
      enforce_weather: true
      filter: Ha
  - name: From image
    target: { fits: /data/m31.fits }
    sequence: $seq_dir/m31.esq
    steps: { focus: false, guide: false }
"#;

    #[test]
    fn parses_jobs_with_variables_and_windows() {
        let list = JobList::from_str(JOBS).unwrap();
        assert_eq!(list.jobs.len(), 2);

        let m42 = &list.jobs[0];
        assert_eq!(m42.job.sequence, PathBuf::from("/data/sequences/m42.esq"));
        assert_eq!(m42.job.priority, 2);
        assert_eq!(m42.job.constraints.min_altitude_deg, Some(30.0));
        assert_eq!(m42.job.constraints.filter.as_deref(), Some("Ha"));
        assert_eq!(m42.start, Some(TimeExpr::Relative(Duration::minutes(10))));
        assert_eq!(
            m42.end,
            Some(TimeExpr::Absolute(
                Utc.with_ymd_and_hms(2026, 1, 13, 0, 0, 0).unwrap()
            ))
        );
        let target = m42.job.coordinates().unwrap();
        assert_eq!(target.frame(), Frame::J2000);
        assert!((target.ra_hours() - 5.588_139).abs() < 1e-5);

        let m31 = &list.jobs[1].job;
        assert_eq!(m31.target, JobTarget::Fits(PathBuf::from("/data/m31.fits")));
        assert_eq!(m31.priority, DEFAULT_PRIORITY);
        assert!(!m31.steps.focus && !m31.steps.guide);
        assert!(m31.steps.track && m31.steps.align);
    }

    #[test]
    fn instantiation_resolves_relative_windows() {
        let list = JobList::from_str(JOBS).unwrap();
        let start = Utc.with_ymd_and_hms(2026, 1, 12, 20, 0, 0).unwrap();
        let jobs = list.instantiate(start);
        assert_eq!(
            jobs[0].constraints.start,
            Some(Utc.with_ymd_and_hms(2026, 1, 12, 20, 10, 0).unwrap())
        );
        assert!(jobs[1].constraints.start.is_none());
    }

    #[test]
    fn rejects_bad_jobs() {
        let bad_priority = "jobs:\n  - { name: a, target: { ra: 1, dec: 2 }, sequence: s, priority: 21 }";
        assert!(matches!(
            JobList::from_str(bad_priority),
            Err(ParseError::Job(0, _))
        ));

        let bad_dec = "jobs:\n  - { name: a, target: { ra: 1, dec: 95 }, sequence: s }";
        assert!(JobList::from_str(bad_dec).is_err());

        let bad_time = "jobs:\n  - { name: a, target: { ra: 1, dec: 2 }, sequence: s, constraints: { start: tomorrow } }";
        assert!(JobList::from_str(bad_time).is_err());

        assert!(JobList::from_str("variables: {}").is_err());
    }

    #[test]
    fn saved_list_parses_back() {
        let start = Utc.with_ymd_and_hms(2026, 1, 12, 20, 0, 0).unwrap();
        let jobs = JobList::from_str(JOBS).unwrap().instantiate(start);
        let yaml = to_yaml(&jobs).unwrap();
        let again = JobList::from_str(&yaml).unwrap().instantiate(start);
        assert_eq!(again.len(), 2);
        assert_eq!(again[0].constraints, jobs[0].constraints);
        assert_eq!(again[1].target, jobs[1].target);
        let (a, b) = (again[0].coordinates().unwrap(), jobs[0].coordinates().unwrap());
        assert!((a.ra_hours() - b.ra_hours()).abs() * 3600.0 < 0.2);
    }
}
