use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::align::{AlignConfig, AlignSettings};
use crate::astro::{ObserverSite, OpticalGeometry};
use crate::devices::sim::SimSettings;
use crate::scheduler::SchedulerSettings;
use crate::solver::SolverOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid site coordinates: {0}")]
    Site(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub optics: OpticalGeometry,
    #[serde(default)]
    pub align: AlignSettings,
    #[serde(default)]
    pub solver: SolverConfig,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub simulation: SimSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// `"lat, lon"` in decimal degrees, east-positive.
    pub coordinates: String,
    #[serde(default)]
    pub altitude_m: f64,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            coordinates: "0, 0".to_string(),
            altitude_m: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
pub enum SolverKind {
    /// Solutions derived from the simulated mount.
    #[default]
    Sim,
    /// `solve-field` from astrometry.net.
    Astrometry,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SolverConfig {
    #[serde(default)]
    pub kind: SolverKind,
    #[serde(flatten)]
    pub options: SolverOptions,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.site()?;
        Ok(config)
    }

    pub fn site(&self) -> Result<ObserverSite, ConfigError> {
        ObserverSite::from_coordinates(&self.site.coordinates, Some(self.site.altitude_m))
            .ok_or_else(|| ConfigError::Site(self.site.coordinates.clone()))
    }

    pub fn align_config(&self) -> Result<AlignConfig, ConfigError> {
        Ok(AlignConfig {
            settings: self.align.clone(),
            optics: self.optics,
            site: self.site()?,
        })
    }
}

/// Reads a duration written like `90s` or `2m 30s`.
pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    humantime::parse_duration(&text).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::AlignmentMode;
    use std::io::Write;

    #[test]
    fn parses_full_config() {
        let yaml = r#"
site:
  coordinates: "48.1, 11.6"
  altitude_m: 520
optics:
  focal_length_mm: 800
  aperture_mm: 200
  pixel_size_x_um: 3.8
  pixel_size_y_um: 3.8
align:
  exposure_s: 3
  mode: sync
  search_hint:
    ra_hours: 5.5
    dec_deg: -5.4
solver:
  kind: astrometry
  binary: /usr/bin/solve-field
  timeout: 2m
scheduler:
  poll_interval: 500ms
  retry_budget: 5
  phase_timeout: 45m
  journal_dir: /var/lib/scope-o-mat
simulation:
  pointing_error_ra_arcmin: 12
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let site = config.site().unwrap();
        assert!((site.latitude_deg - 48.1).abs() < 1e-9);
        assert_eq!(site.altitude_m, 520.0);

        let align = config.align_config().unwrap();
        assert_eq!(align.settings.mode, AlignmentMode::Sync);
        assert_eq!(align.optics.focal_length_mm, Some(800.0));
        assert!(align.settings.search_hint.is_some());

        assert_eq!(config.solver.kind, SolverKind::Astrometry);
        assert_eq!(config.solver.options.timeout, Duration::from_secs(120));
        assert_eq!(config.solver.options.downsample, 2);
        assert_eq!(config.scheduler.poll_interval, Duration::from_millis(500));
        assert_eq!(config.scheduler.retry_budget, 5);
        assert_eq!(config.scheduler.phase_timeout, Duration::from_secs(45 * 60));
        assert_eq!(config.simulation.pointing_error_ra_arcmin, 12.0);
    }

    #[test]
    fn defaults_apply_to_missing_sections() {
        let config: Config = serde_yaml::from_str("site:\n  coordinates: \"-33.9, 18.4\"\n").unwrap();
        assert_eq!(config.solver.kind, SolverKind::Sim);
        assert_eq!(config.scheduler.retry_budget, 3);
        assert_eq!(config.scheduler.poll_interval, Duration::from_secs(1));
        assert_eq!(config.align.mode, AlignmentMode::Slew);
        assert!(config.site().unwrap().latitude_deg < 0.0);
    }

    #[test]
    fn rejects_bad_site_and_duration() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "site:\n  coordinates: \"north of here\"").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::Site(_))
        ));

        let err = serde_yaml::from_str::<Config>("scheduler:\n  poll_interval: soon\n");
        assert!(err.is_err());
    }
}
