//! Gnomonic (TAN) projection between equatorial coordinates and the
//! tangent plane at a reference point.
//!
//! Angles in and out of the sky side are degrees. Tangent-plane coordinates
//! are radians, or arcseconds when [`PlaneUnits::Arcsec`] is requested; the
//! plate solver works in arcseconds throughout.
//!
//! Reference: Calabretta & Greisen (2002), FITS WCS Paper II, §5.1.1.

use crate::star::CatalogStar;

/// Arcseconds per radian.
pub const ARCSEC_PER_RAD: f64 = 206_264.806_247_096_36;

/// Units of tangent-plane coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneUnits {
    Radians,
    Arcsec,
}

impl PlaneUnits {
    #[inline]
    fn scale(self) -> f64 {
        match self {
            PlaneUnits::Radians => 1.0,
            PlaneUnits::Arcsec => ARCSEC_PER_RAD,
        }
    }
}

/// Tangent point of a projection, in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkyPoint {
    pub ra_deg: f64,
    pub dec_deg: f64,
}

impl SkyPoint {
    pub fn new(ra_deg: f64, dec_deg: f64) -> Self {
        Self { ra_deg, dec_deg }
    }

    /// Project `(ra, dec)` onto the tangent plane at this point.
    pub fn project(&self, ra_deg: f64, dec_deg: f64, units: PlaneUnits) -> Option<(f64, f64)> {
        project(ra_deg, dec_deg, self.ra_deg, self.dec_deg, units)
    }

    /// Map tangent-plane `(ξ, η)` back to the sky.
    pub fn deproject(&self, xi: f64, eta: f64, units: PlaneUnits) -> (f64, f64) {
        deproject(xi, eta, self.ra_deg, self.dec_deg, units)
    }
}

/// RA difference `ra - ra0` folded into `[-180, 180]` degrees, so a tangent
/// point just past 0h still sees stars just before 24h as neighbours.
#[inline]
fn delta_ra_deg(ra_deg: f64, ra0_deg: f64) -> f64 {
    let mut d = ra_deg - ra0_deg;
    if d > 180.0 {
        d -= 360.0;
    } else if d < -180.0 {
        d += 360.0;
    }
    d
}

/// Forward gnomonic projection of `(ra, dec)` about `(ra0, dec0)`.
///
/// Returns `None` when the point lies on or behind the tangent plane.
#[inline]
pub fn project(
    ra_deg: f64,
    dec_deg: f64,
    ra0_deg: f64,
    dec0_deg: f64,
    units: PlaneUnits,
) -> Option<(f64, f64)> {
    let dra = delta_ra_deg(ra_deg, ra0_deg).to_radians();
    let (sin_dec, cos_dec) = dec_deg.to_radians().sin_cos();
    let (sin_dec0, cos_dec0) = dec0_deg.to_radians().sin_cos();
    let (sin_dra, cos_dra) = dra.sin_cos();

    let denom = sin_dec0 * sin_dec + cos_dec0 * cos_dec * cos_dra;
    if denom <= 1e-12 {
        return None;
    }

    let xi = cos_dec * sin_dra / denom;
    let eta = (cos_dec0 * sin_dec - sin_dec0 * cos_dec * cos_dra) / denom;
    let s = units.scale();
    Some((xi * s, eta * s))
}

/// Inverse gnomonic projection. RA is returned in `[0, 360)`.
#[inline]
pub fn deproject(xi: f64, eta: f64, ra0_deg: f64, dec0_deg: f64, units: PlaneUnits) -> (f64, f64) {
    let s = units.scale();
    let xi = xi / s;
    let eta = eta / s;
    let (sin_dec0, cos_dec0) = dec0_deg.to_radians().sin_cos();

    let d = cos_dec0 - eta * sin_dec0;
    let dra = xi.atan2(d);
    let dec = (sin_dec0 + eta * cos_dec0).atan2(xi.hypot(d));

    let ra = (ra0_deg + dra.to_degrees()).rem_euclid(360.0);
    (ra, dec.to_degrees())
}

/// Project every catalog star in place, storing `(ξ, η)` in arcseconds.
///
/// Stars behind the tangent plane get `projected = None`. Returns the number
/// of stars that projected successfully.
pub fn project_catalog(stars: &mut [CatalogStar], center: SkyPoint) -> usize {
    let mut n = 0;
    for star in stars.iter_mut() {
        star.projected = center
            .project(star.ra_deg, star.dec_deg, PlaneUnits::Arcsec)
            .map(|(xi, eta)| [xi, eta]);
        if star.projected.is_some() {
            n += 1;
        }
    }
    n
}

/// Recompute each star's RA/Dec from its stored projection about `center`.
pub fn deproject_catalog(stars: &mut [CatalogStar], center: SkyPoint) {
    for star in stars.iter_mut() {
        if let Some([xi, eta]) = star.projected {
            let (ra, dec) = center.deproject(xi, eta, PlaneUnits::Arcsec);
            star.ra_deg = ra;
            star.dec_deg = dec;
        }
    }
}

/// Angular separation in degrees (haversine form, stable at small angles).
pub fn separation_deg(a: SkyPoint, b: SkyPoint) -> f64 {
    let dra = delta_ra_deg(b.ra_deg, a.ra_deg).to_radians();
    let d1 = a.dec_deg.to_radians();
    let d2 = b.dec_deg.to_radians();
    let h = ((d2 - d1) / 2.0).sin().powi(2) + d1.cos() * d2.cos() * (dra / 2.0).sin().powi(2);
    (2.0 * h.sqrt().min(1.0).asin()).to_degrees()
}
