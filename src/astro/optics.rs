use serde::{Deserialize, Serialize};

pub const ARCSEC_PER_RADIAN: f64 = 206_264.806_247_096_355_2;

/// Fraction by which the solver's scale bounds are widened around the FOV.
pub const FIELD_STRETCH: f64 = 0.05;

/// Telescope and sensor parameters. `None` (or a non-positive value) means the
/// parameter has not been reported yet.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OpticalGeometry {
    #[serde(default)]
    pub focal_length_mm: Option<f64>,
    #[serde(default)]
    pub aperture_mm: Option<f64>,
    #[serde(default)]
    pub pixel_size_x_um: Option<f64>,
    #[serde(default)]
    pub pixel_size_y_um: Option<f64>,
    #[serde(default = "default_bin")]
    pub bin_x: u32,
    #[serde(default = "default_bin")]
    pub bin_y: u32,
    #[serde(default)]
    pub sensor_width_px: Option<u32>,
    #[serde(default)]
    pub sensor_height_px: Option<u32>,
}

fn default_bin() -> u32 {
    1
}

impl Default for OpticalGeometry {
    fn default() -> Self {
        Self {
            focal_length_mm: None,
            aperture_mm: None,
            pixel_size_x_um: None,
            pixel_size_y_um: None,
            bin_x: 1,
            bin_y: 1,
            sensor_width_px: None,
            sensor_height_px: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FieldOfView {
    pub width_arcmin: f64,
    pub height_arcmin: f64,
}

/// Lower/upper image width handed to the solver, in arcminutes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldBounds {
    pub low_arcmin: f64,
    pub high_arcmin: f64,
}

impl OpticalGeometry {
    pub fn focal_length(&self) -> Option<f64> {
        positive(self.focal_length_mm)
    }

    pub fn aperture(&self) -> Option<f64> {
        positive(self.aperture_mm)
    }

    /// Horizontal pixel size; a sensor reporting only X is taken as square.
    pub fn pixel_size_x(&self) -> Option<f64> {
        positive(self.pixel_size_x_um)
    }

    pub fn pixel_size_y(&self) -> Option<f64> {
        positive(self.pixel_size_y_um).or_else(|| self.pixel_size_x())
    }

    /// Name of the first optical parameter that is still unknown.
    pub fn missing_optics(&self) -> Option<&'static str> {
        if self.focal_length().is_none() {
            Some("focal length")
        } else if self.aperture().is_none() {
            Some("aperture")
        } else if self.pixel_size_x().is_none() || self.pixel_size_y().is_none() {
            Some("pixel size")
        } else {
            None
        }
    }

    pub fn field_of_view(&self) -> Option<FieldOfView> {
        if self.missing_optics().is_some() {
            return None;
        }
        let focal = self.focal_length()?;
        let width = self.sensor_width_px.filter(|w| *w > 0)?;
        let height = self.sensor_height_px.filter(|h| *h > 0)?;
        Some(FieldOfView {
            width_arcmin: fov_arcmin(width, self.pixel_size_x()?, focal),
            height_arcmin: fov_arcmin(height, self.pixel_size_y()?, focal),
        })
    }

    /// Focal length implied by a solved pixel scale at the given binning.
    pub fn focal_length_from_scale(&self, arcsec_per_px: f64, bin_x: u32) -> Option<f64> {
        if arcsec_per_px <= 0.0 {
            return None;
        }
        let pixel = self.pixel_size_x()?;
        Some((ARCSEC_PER_RADIAN / 1000.0 * pixel) / arcsec_per_px * f64::from(bin_x))
    }
}

impl FieldOfView {
    pub fn bounds(&self) -> FieldBounds {
        FieldBounds {
            low_arcmin: self.width_arcmin.min(self.height_arcmin) * (1.0 - FIELD_STRETCH),
            high_arcmin: self.width_arcmin.max(self.height_arcmin) * (1.0 + FIELD_STRETCH),
        }
    }
}

/// Angular extent in arcminutes of `dimension_px` pixels of `pixel_um` at `focal_mm`.
pub fn fov_arcmin(dimension_px: u32, pixel_um: f64, focal_mm: f64) -> f64 {
    ARCSEC_PER_RADIAN * f64::from(dimension_px) * pixel_um / 1000.0 / focal_mm / 60.0
}

fn positive(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(focal: f64) -> OpticalGeometry {
        OpticalGeometry {
            focal_length_mm: Some(focal),
            aperture_mm: Some(100.0),
            pixel_size_x_um: Some(5.4),
            pixel_size_y_um: Some(5.4),
            sensor_width_px: Some(1280),
            sensor_height_px: Some(1024),
            ..Default::default()
        }
    }

    #[test]
    fn field_of_view_matches_formula() {
        let fov = geometry(1000.0).field_of_view().unwrap();
        let expected_x = 206_264.806247 * 1280.0 * 5.4 / 1000.0 / 1000.0 / 60.0;
        let expected_y = 206_264.806247 * 1024.0 * 5.4 / 1000.0 / 1000.0 / 60.0;
        assert!((fov.width_arcmin - expected_x).abs() < 1e-6);
        assert!((fov.height_arcmin - expected_y).abs() < 1e-6);
    }

    #[test]
    fn longer_focal_length_narrows_field() {
        let mut previous = f64::INFINITY;
        for focal in [200.0, 400.0, 1000.0, 2000.0, 4000.0] {
            let fov = geometry(focal).field_of_view().unwrap();
            assert!(fov.width_arcmin < previous);
            previous = fov.width_arcmin;
        }
    }

    #[test]
    fn field_is_undefined_until_optics_known() {
        let mut g = geometry(1000.0);
        g.aperture_mm = None;
        assert_eq!(g.missing_optics(), Some("aperture"));
        assert!(g.field_of_view().is_none());

        let mut g = geometry(1000.0);
        g.focal_length_mm = Some(-1.0);
        assert_eq!(g.missing_optics(), Some("focal length"));

        let mut g = geometry(1000.0);
        g.sensor_height_px = None;
        assert!(g.missing_optics().is_none());
        assert!(g.field_of_view().is_none());
    }

    #[test]
    fn bounds_are_stretched_five_percent() {
        let fov = FieldOfView {
            width_arcmin: 40.0,
            height_arcmin: 30.0,
        };
        let b = fov.bounds();
        assert!((b.low_arcmin - 28.5).abs() < 1e-12);
        assert!((b.high_arcmin - 42.0).abs() < 1e-12);
    }

    #[test]
    fn focal_length_from_pixel_scale() {
        let g = geometry(1000.0);
        let f = g.focal_length_from_scale(1.1138, 1).unwrap();
        assert!((f - 1000.0).abs() < 1.0, "{f}");
        assert!(g.focal_length_from_scale(0.0, 1).is_none());
    }
}
