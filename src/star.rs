use rkyv::{Archive, Deserialize, Serialize};

use crate::psf::FittedStar;

/// A reference catalog star.
///
/// Positions are equatorial degrees at the observation epoch; any proper
/// motion has already been applied by whoever parsed the catalog. The
/// `projected` slot is scratch space written by
/// [`project_catalog`](crate::projection::project_catalog).
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct CatalogStar {
    /// Catalog designation (e.g. "HIP 27989").
    pub code: String,
    pub ra_deg: f64,
    pub dec_deg: f64,
    pub mag: f64,
    /// B-V color index, when the catalog has one.
    pub color_index: Option<f64>,
    /// Tangent-plane `(ξ, η)` from the most recent projection pass.
    pub projected: Option<[f64; 2]>,
}

impl CatalogStar {
    pub fn new(code: impl Into<String>, ra_deg: f64, dec_deg: f64, mag: f64) -> Self {
        Self {
            code: code.into(),
            ra_deg,
            dec_deg,
            mag,
            color_index: None,
            projected: None,
        }
    }
}

/// An image star handed to the matcher and plate solver.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedStar {
    /// Column position in 0-based full-image pixels.
    pub x: f64,
    /// Row position in 0-based full-image pixels (+Y down).
    pub y: f64,
    /// Instrumental magnitude, used for brightness ordering only.
    pub mag: f64,
}

impl From<&FittedStar> for DetectedStar {
    fn from(star: &FittedStar) -> Self {
        Self {
            x: star.xpos,
            y: star.ypos,
            mag: star.mag,
        }
    }
}

/// Sort stars brightest (lowest magnitude) first. NaN magnitudes sink to the end.
pub fn sort_by_brightness<T>(stars: &mut [T], mag: impl Fn(&T) -> f64) {
    stars.sort_by(|a, b| {
        let (ma, mb) = (mag(a), mag(b));
        match (ma.is_nan(), mb.is_nan()) {
            (false, false) => ma.total_cmp(&mb),
            (a_nan, b_nan) => a_nan.cmp(&b_nan),
        }
    });
}
