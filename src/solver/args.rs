use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use super::types::{SolveRequest, SolveResult};
use crate::config::deserialize_duration;

/// Settings of the `solve-field` engine.
#[derive(Debug, Clone, Deserialize)]
pub struct SolverOptions {
    #[serde(default = "default_binary")]
    pub binary: PathBuf,
    #[serde(default = "default_timeout", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Let the engine verify candidate matches against existing WCS.
    #[serde(default)]
    pub verify: bool,
    #[serde(default = "default_downsample")]
    pub downsample: u32,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_binary() -> PathBuf {
    PathBuf::from("solve-field")
}

fn default_timeout() -> Duration {
    Duration::from_secs(180)
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("scope-o-mat")
}

fn default_downsample() -> u32 {
    2
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            timeout: default_timeout(),
            work_dir: default_work_dir(),
            verify: false,
            downsample: default_downsample(),
            extra_args: Vec::new(),
        }
    }
}

/// Arguments used for every solve, before bounds and hints are added.
pub fn default_args(options: &SolverOptions) -> Vec<String> {
    let mut args = Vec::new();
    if !options.verify {
        args.push("--no-verify".to_string());
    }
    args.extend(
        ["--no-plots", "--no-fits2fits", "--resort", "--downsample"]
            .iter()
            .map(|s| s.to_string()),
    );
    args.push(options.downsample.to_string());
    args.push("-O".to_string());
    args
}

/// Full command line for a request, image path last.
pub fn build_args(options: &SolverOptions, request: &SolveRequest) -> Vec<String> {
    let mut args = default_args(options);
    if let Some(bounds) = request.bounds {
        args.extend([
            "-L".to_string(),
            bounds.low_arcmin.to_string(),
            "-H".to_string(),
            bounds.high_arcmin.to_string(),
            "-u".to_string(),
            "aw".to_string(),
        ]);
    }
    if let Some(hint) = request.hint {
        args.extend([
            "-3".to_string(),
            (hint.ra_hours() * 15.0).to_string(),
            "-4".to_string(),
            hint.dec_degrees().to_string(),
            "-5".to_string(),
            hint.radius_degrees().to_string(),
        ]);
    }
    args.extend(options.extra_args.iter().cloned());
    args.push("--dir".to_string());
    args.push(options.work_dir.display().to_string());
    args.push(request.image.display().to_string());
    args
}

/// Extracts the solution from a `solve-field` log.
///
/// Recognised lines:
/// `Field center: (RA,Dec) = (83.8221, -5.3911) deg.`,
/// `Field rotation angle: up is 12.5 degrees E of N` and
/// `... pixel scale 1.12 arcsec/pix.`
pub fn parse_solution(log: &str) -> Option<SolveResult> {
    let mut center = None;
    let mut orientation = None;
    let mut scale = None;

    for line in log.lines() {
        if let Some(rest) = line.split("Field center: (RA,Dec) = (").nth(1) {
            let inner = rest.split(')').next()?;
            let mut parts = inner.split(',').map(|p| p.trim().parse::<f64>());
            if let (Some(Ok(ra)), Some(Ok(dec))) = (parts.next(), parts.next()) {
                center = Some((ra, dec));
            }
        } else if let Some(rest) = line.split("up is ").nth(1) {
            let mut words = rest.split_whitespace();
            let angle = words.next().and_then(|w| w.parse::<f64>().ok());
            let side = words.nth(1);
            if let (Some(angle), Some(side)) = (angle, side) {
                orientation = Some(if side == "W" { -angle } else { angle });
            }
        } else if let Some(rest) = line.split("pixel scale ").nth(1) {
            scale = rest
                .split_whitespace()
                .next()
                .and_then(|w| w.parse::<f64>().ok());
        }
    }

    let (ra_deg, dec_deg) = center?;
    Some(SolveResult {
        orientation_deg: orientation.unwrap_or(0.0),
        ra_deg,
        dec_deg,
        pixel_scale_arcsec_per_px: scale.unwrap_or(0.0),
        success: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::astro::FieldBounds;
    use crate::solver::SearchHint;

    fn request() -> SolveRequest {
        SolveRequest {
            ticket: 1,
            image: PathBuf::from("/data/m42.fits"),
            bounds: Some(FieldBounds {
                low_arcmin: 28.5,
                high_arcmin: 42.0,
            }),
            hint: Some(SearchHint::new(5.5, -5.0, 30.0).unwrap()),
        }
    }

    #[test]
    fn default_arguments_match_engine_defaults() {
        let args = default_args(&SolverOptions::default());
        assert_eq!(
            args,
            vec![
                "--no-verify",
                "--no-plots",
                "--no-fits2fits",
                "--resort",
                "--downsample",
                "2",
                "-O"
            ]
        );
    }

    #[test]
    fn verification_is_pass_through() {
        let options = SolverOptions {
            verify: true,
            ..Default::default()
        };
        assert!(!default_args(&options).contains(&"--no-verify".to_string()));
    }

    #[test]
    fn builds_bounds_and_hint() {
        let options = SolverOptions {
            work_dir: PathBuf::from("/tmp/solve"),
            extra_args: vec!["--crpix-center".into()],
            ..Default::default()
        };
        let args = build_args(&options, &request());
        let joined = args.join(" ");
        assert!(joined.contains("-L 28.5 -H 42 -u aw"), "{joined}");
        assert!(joined.contains("-3 82.5 -4 -5 -5 30"), "{joined}");
        assert!(joined.contains("--crpix-center --dir /tmp/solve"));
        assert_eq!(args.last().map(String::as_str), Some("/data/m42.fits"));
    }

    #[test]
    fn omits_optional_sections() {
        let mut req = request();
        req.bounds = None;
        req.hint = None;
        let args = build_args(&SolverOptions::default(), &req);
        assert!(!args.contains(&"-L".to_string()));
        assert!(!args.contains(&"-3".to_string()));
    }

    #[test]
    fn parses_solver_log() {
        let log = "\
Field 1: solved with index index-4208.fits.
Field 1 solved: writing to file ./m42.solved to indicate this.
Field: m42.fits
Field center: (RA,Dec) = (83.8221, -5.3911) deg.
Field center: (RA H:M:S, Dec D:M:S) = (05:35:17.304, -05:23:28.0).
Field size: 38.2 x 30.5 arcminutes
Field rotation angle: up is 178.2 degrees W of N
Field parity: pos
  pixel scale 1.79 arcsec/pix.
";
        let result = parse_solution(log).unwrap();
        assert!((result.ra_deg - 83.8221).abs() < 1e-9);
        assert!((result.dec_deg + 5.3911).abs() < 1e-9);
        assert!((result.orientation_deg + 178.2).abs() < 1e-9);
        assert!((result.pixel_scale_arcsec_per_px - 1.79).abs() < 1e-9);
        assert!(result.success);
    }

    #[test]
    fn log_without_center_is_no_solution() {
        assert!(parse_solution("Did not solve (or no WCS file was written).").is_none());
    }
}
