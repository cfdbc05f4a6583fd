use std::collections::HashMap;
use std::path::Path;

use fitrs::{Fits, HeaderValue};
use thiserror::Error;

use crate::astro::{
    fov_arcmin, parse_dms, parse_hms, CoordinateError, FieldBounds, FieldOfView, SkyCoordinate,
};
use crate::solver::SearchHint;

/// Search radius used when the hint comes from an image header.
pub const FITS_SEARCH_RADIUS_DEG: f64 = 15.0;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("cannot open {path}: {reason}")]
    Open { path: String, reason: String },
    #[error("{0} has no primary header")]
    NoHeader(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CardValue {
    Text(String),
    Integer(i64),
    Real(f64),
    Logical(bool),
}

impl CardValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CardValue::Integer(i) => Some(*i as f64),
            CardValue::Real(r) => Some(*r),
            CardValue::Text(s) => s.trim().parse().ok(),
            CardValue::Logical(_) => None,
        }
    }
}

/// Keyword/value pairs of a primary header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderCards(HashMap<String, CardValue>);

impl HeaderCards {
    pub fn read(path: &Path) -> Result<Self, MetadataError> {
        let fits = Fits::open(path).map_err(|e| MetadataError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let hdu = fits
            .into_iter()
            .next()
            .ok_or_else(|| MetadataError::NoHeader(path.display().to_string()))?;

        let mut cards = HeaderCards::default();
        for (key, value) in hdu.iter() {
            let value = match value {
                Some(HeaderValue::CharacterString(s)) => CardValue::Text(s.trim().to_string()),
                Some(HeaderValue::IntegerNumber(i)) => CardValue::Integer(i64::from(*i)),
                Some(HeaderValue::RealFloatingNumber(r)) => CardValue::Real(*r),
                Some(HeaderValue::Logical(b)) => CardValue::Logical(*b),
                _ => continue,
            };
            cards.insert(key, value);
        }
        Ok(cards)
    }

    pub fn insert(&mut self, key: &str, value: CardValue) {
        self.0.insert(key.trim().to_uppercase(), value);
    }

    pub fn get(&self, key: &str) -> Option<&CardValue> {
        self.0.get(key)
    }

    fn number(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(CardValue::as_f64)
    }
}

/// Header fields used to seed the solver from an existing image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageMetadata {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub object_ra_hours: Option<f64>,
    pub object_dec_deg: Option<f64>,
    pub focal_length_mm: Option<f64>,
    pub pixel_size_x_um: Option<f64>,
    pub pixel_size_y_um: Option<f64>,
    pub bin_x: u32,
    pub bin_y: u32,
}

impl ImageMetadata {
    pub fn from_cards(cards: &HeaderCards) -> Self {
        let dimension = |key: &str| {
            cards
                .number(key)
                .filter(|v| *v >= 1.0)
                .map(|v| v as u32)
        };
        let binning = |key: &str| dimension(key).unwrap_or(1);
        Self {
            width: dimension("NAXIS1"),
            height: dimension("NAXIS2"),
            object_ra_hours: cards.get("OBJCTRA").and_then(|v| angle(v, parse_hms)),
            object_dec_deg: cards.get("OBJCTDEC").and_then(|v| angle(v, parse_dms)),
            focal_length_mm: cards.number("FOCALLEN").filter(|v| *v > 0.0),
            pixel_size_x_um: cards.number("PIXSIZE1").filter(|v| *v > 0.0),
            pixel_size_y_um: cards.number("PIXSIZE2").filter(|v| *v > 0.0),
            bin_x: binning("XBINNING"),
            bin_y: binning("YBINNING"),
        }
    }

    pub fn read(path: &Path) -> Result<Self, MetadataError> {
        Ok(Self::from_cards(&HeaderCards::read(path)?))
    }

    /// Field of view of the stored image. The header dimensions are binned
    /// pixels, so the binning factor scales the field back up.
    pub fn field_of_view(&self) -> Option<FieldOfView> {
        let focal = self.focal_length_mm?;
        Some(FieldOfView {
            width_arcmin: fov_arcmin(self.width?, self.pixel_size_x_um?, focal)
                * f64::from(self.bin_x),
            height_arcmin: fov_arcmin(self.height?, self.pixel_size_y_um?, focal)
                * f64::from(self.bin_y),
        })
    }
}

fn angle(value: &CardValue, parse: fn(&str) -> Result<f64, CoordinateError>) -> Option<f64> {
    match value {
        CardValue::Text(s) => parse(s).ok(),
        other => other.as_f64(),
    }
}

/// What could be recovered for a solve: hint and, with complete optics, bounds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SolveSeed {
    pub hint: Option<SearchHint>,
    pub bounds: Option<FieldBounds>,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("image header is missing {keyword}")]
pub struct MissingMetadata {
    pub keyword: &'static str,
    pub seed: SolveSeed,
}

/// Builds the solver seed for an existing image.
///
/// The hint comes from OBJCTRA/OBJCTDEC, falling back to the mount position.
/// A missing mandatory keyword yields [`MissingMetadata`] carrying whatever
/// was recovered before it.
pub fn seed_from_metadata(
    meta: &ImageMetadata,
    mount: Option<SkyCoordinate>,
) -> Result<SolveSeed, MissingMetadata> {
    let mut seed = SolveSeed::default();

    if meta.width.is_none() {
        return missing("NAXIS1", seed);
    }
    if meta.height.is_none() {
        return missing("NAXIS2", seed);
    }

    let center = match (meta.object_ra_hours, meta.object_dec_deg) {
        (Some(ra), Some(dec)) => Some((ra, dec)),
        _ => {
            log::warn!("image header has no OBJCTRA/OBJCTDEC, using mount coordinates");
            mount.map(|m| (m.ra_hours(), m.dec_degrees()))
        }
    };
    seed.hint = center.and_then(|(ra, dec)| {
        SearchHint::new(ra.rem_euclid(24.0), dec, FITS_SEARCH_RADIUS_DEG).ok()
    });

    if meta.focal_length_mm.is_none() {
        return missing("FOCALLEN", seed);
    }
    if meta.pixel_size_x_um.is_none() {
        return missing("PIXSIZE1", seed);
    }
    if meta.pixel_size_y_um.is_none() {
        return missing("PIXSIZE2", seed);
    }

    seed.bounds = meta.field_of_view().map(|fov| fov.bounds());
    Ok(seed)
}

fn missing(keyword: &'static str, seed: SolveSeed) -> Result<SolveSeed, MissingMetadata> {
    Err(MissingMetadata { keyword, seed })
}

pub fn is_fits(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_ascii_lowercase().as_str(), "fits" | "fit" | "fts"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::astro::Frame;

    fn full_cards() -> HeaderCards {
        let mut cards = HeaderCards::default();
        cards.insert("NAXIS1", CardValue::Integer(640));
        cards.insert("NAXIS2", CardValue::Integer(512));
        cards.insert("OBJCTRA", CardValue::Text("05 35 17".into()));
        cards.insert("OBJCTDEC", CardValue::Text("-05 23 28".into()));
        cards.insert("FOCALLEN", CardValue::Integer(1000));
        cards.insert("PIXSIZE1", CardValue::Real(5.4));
        cards.insert("PIXSIZE2", CardValue::Real(5.4));
        cards.insert("XBINNING", CardValue::Integer(2));
        cards.insert("YBINNING", CardValue::Integer(2));
        cards
    }

    #[test]
    fn reads_keywords_in_any_representation() {
        let meta = ImageMetadata::from_cards(&full_cards());
        assert_eq!(meta.width, Some(640));
        assert!((meta.object_ra_hours.unwrap() - 5.588_055).abs() < 1e-5);
        assert!((meta.object_dec_deg.unwrap() + 5.391_111).abs() < 1e-5);
        assert_eq!(meta.bin_x, 2);

        let mut cards = HeaderCards::default();
        cards.insert("objctra", CardValue::Real(12.5));
        cards.insert("FOCALLEN", CardValue::Text("800".into()));
        let meta = ImageMetadata::from_cards(&cards);
        assert_eq!(meta.object_ra_hours, Some(12.5));
        assert_eq!(meta.focal_length_mm, Some(800.0));
        assert_eq!(meta.bin_y, 1);
    }

    #[test]
    fn complete_header_yields_hint_and_binned_bounds() {
        let meta = ImageMetadata::from_cards(&full_cards());
        let seed = seed_from_metadata(&meta, None).unwrap();
        let hint = seed.hint.unwrap();
        assert_eq!(hint.radius_degrees(), FITS_SEARCH_RADIUS_DEG);
        // 640x512 binned 2x2 covers the same sky as 1280x1024 unbinned.
        let bounds = seed.bounds.unwrap();
        let full_width = fov_arcmin(1280, 5.4, 1000.0);
        let full_height = fov_arcmin(1024, 5.4, 1000.0);
        assert!((bounds.high_arcmin - full_width * 1.05).abs() < 1e-9);
        assert!((bounds.low_arcmin - full_height * 0.95).abs() < 1e-9);
    }

    #[test]
    fn missing_coordinates_fall_back_to_mount() {
        let mut cards = full_cards();
        cards.0.remove("OBJCTDEC");
        let meta = ImageMetadata::from_cards(&cards);
        let mount = SkyCoordinate::new(10.0, 20.0, Frame::Apparent).unwrap();
        let hint = seed_from_metadata(&meta, Some(mount)).unwrap().hint.unwrap();
        assert_eq!(hint.ra_hours(), 10.0);
        assert_eq!(hint.dec_degrees(), 20.0);
    }

    #[test]
    fn missing_optics_keeps_recovered_hint() {
        let mut cards = full_cards();
        cards.0.remove("FOCALLEN");
        let meta = ImageMetadata::from_cards(&cards);
        let err = seed_from_metadata(&meta, None).unwrap_err();
        assert_eq!(err.keyword, "FOCALLEN");
        assert!(err.seed.hint.is_some());
        assert!(err.seed.bounds.is_none());
    }

    #[test]
    fn missing_dimensions_recover_nothing() {
        let mut cards = full_cards();
        cards.0.remove("NAXIS2");
        let err = seed_from_metadata(&ImageMetadata::from_cards(&cards), None).unwrap_err();
        assert_eq!(err.keyword, "NAXIS2");
        assert_eq!(err.seed, SolveSeed::default());
    }

    #[test]
    fn recognises_fits_extensions() {
        assert!(is_fits(Path::new("/data/m31.FITS")));
        assert!(is_fits(Path::new("frame.fit")));
        assert!(!is_fits(Path::new("frame.jpg")));
    }

    #[test]
    fn absent_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ImageMetadata::read(&dir.path().join("absent.fits")).is_err());
    }
}
