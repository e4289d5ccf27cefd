//! Plate solver: register detected stars against a catalog and derive the
//! image's world coordinate system.
//!
//! 1. **Init**: validate the inputs and project the catalog onto the
//!    tangent plane at the approximate field centre (arcseconds).
//! 2. **Matching**: run [`match_stars`] from pixel offsets (relative to the
//!    reference pixel) to the projected catalog, walking the retry ladder in
//!    [`retry`] until a transform passes the sanity check.
//! 3. **Converging**: when the reference pixel is not the image centre,
//!    re-centre the projection on the matched reference coordinate and refit
//!    on the same pairs until the coordinate settles.
//! 4. **Done**: probe the final transform at unit pixel steps to get the CD
//!    matrix, then derive CDELT/PC, plate scale and focal length.
//!
//! Progress is reported to an observer at every matching attempt and every
//! refinement trial; it can stop the solve by returning `ControlFlow::Break`.

pub mod retry;
pub mod wcs;

use std::ops::ControlFlow;

use tracing::{debug, info, warn};

use crate::error::{MatchError, SolveError};
use crate::matching::{match_stars, Homography, MatchConfig, TransformKind};
use crate::projection::{deproject_catalog, project_catalog, PlaneUnits, SkyPoint};
use crate::psf::units::RADCONV;
use crate::star::{sort_by_brightness, CatalogStar, DetectedStar};

pub use retry::{Attempt, MAX_ATTEMPTS};
pub use wcs::PlateSolution;

/// Refinement trials used when the reference pixel is offset from the image centre.
pub const OFFSET_TRIALS: u32 = 20;

/// Relative change in RA and in Dec below which the refinement has converged.
pub const CONVERGENCE_TOLERANCE: f64 = 1e-8;

/// Largest change of a homography's projective denominator across the image.
pub const MAX_PERSPECTIVE: f64 = 0.05;

/// Parameters for a plate-solve attempt.
#[derive(Debug, Clone)]
pub struct SolveConfig {
    /// Image size in pixels.
    pub image_width: u32,
    pub image_height: u32,
    /// Approximate RA/Dec (degrees) of the reference pixel, used as the
    /// initial tangent point.
    pub center: SkyPoint,
    /// Nominal focal length in mm. Together with the pixel size this gives
    /// the expected plate scale.
    pub focal_length_mm: f64,
    /// Pixel pitch in µm.
    pub pixel_size_um: f64,
    /// Binning factor. Default: 1.
    pub binning: f64,
    /// Reference pixel offset from the geometric image centre, pixels.
    /// Default: (0, 0).
    pub reference_offset: (f64, f64),
    /// Brightest stars per list on the first attempt. Default: 20.
    pub n_candidates: usize,
    /// Increase of `n_candidates` each time the pool is widened. Default: 10.
    pub candidate_step: usize,
    /// Fewest matched pairs for a solution. Default: 5.
    pub min_pairs: usize,
    /// Relative half-width of the plate scale window on constrained
    /// attempts. Default: 0.1.
    pub scale_tolerance: f64,
    /// Transform family to fit. Default: Affine.
    pub transform: TransformKind,
    /// Matching attempts before giving up, at most [`MAX_ATTEMPTS`]. Default: 10.
    pub max_attempts: usize,
    /// Override for the number of refinement trials. `None` uses
    /// [`OFFSET_TRIALS`] when `reference_offset` is non-zero and 0 otherwise.
    pub max_trials: Option<u32>,
    /// Largest allowed difference between `|b|` and `|f|`, and between `|c|`
    /// and `|e|`, of the scale-normalized linear transform. Default: 0.3.
    pub affine_tolerance: f64,
}

impl Default for SolveConfig {
    fn default() -> Self {
        Self {
            image_width: 0,
            image_height: 0,
            center: SkyPoint::new(0.0, 0.0),
            focal_length_mm: 0.0,
            pixel_size_um: 0.0,
            binning: 1.0,
            reference_offset: (0.0, 0.0),
            n_candidates: 20,
            candidate_step: 10,
            min_pairs: 5,
            scale_tolerance: 0.1,
            transform: TransformKind::Affine,
            max_attempts: MAX_ATTEMPTS,
            max_trials: None,
            affine_tolerance: 0.3,
        }
    }
}

impl SolveConfig {
    /// Configuration for an image of the given size, centred on `center`,
    /// taken through `focal_length_mm` with `pixel_size_um` pixels.
    pub fn new(
        image_width: u32,
        image_height: u32,
        center: SkyPoint,
        focal_length_mm: f64,
        pixel_size_um: f64,
    ) -> Self {
        Self {
            image_width,
            image_height,
            center,
            focal_length_mm,
            pixel_size_um,
            ..Default::default()
        }
    }

    /// Expected plate scale in arcsec per pixel.
    pub fn nominal_scale(&self) -> f64 {
        RADCONV * self.pixel_size_um * self.binning / self.focal_length_mm
    }

    /// Reference pixel, 0-based.
    pub fn reference_pixel(&self) -> (f64, f64) {
        (
            (self.image_width as f64 - 1.0) / 2.0 + self.reference_offset.0,
            (self.image_height as f64 - 1.0) / 2.0 + self.reference_offset.1,
        )
    }

    fn trials(&self) -> u32 {
        self.max_trials.unwrap_or(if self.reference_offset != (0.0, 0.0) {
            OFFSET_TRIALS
        } else {
            0
        })
    }

    fn validate(&self) -> Result<(), SolveError> {
        let c = self.center;
        if !(c.ra_deg.is_finite() && c.dec_deg.is_finite()) || c.dec_deg.abs() > 90.0 {
            return Err(SolveError::InvalidInput(format!(
                "field centre ({}, {}) is not a valid sky position",
                c.ra_deg, c.dec_deg
            )));
        }
        if c.ra_deg == 0.0 && c.dec_deg == 0.0 {
            return Err(SolveError::InvalidInput("field centre is unset".into()));
        }
        let fov_ok = self.image_width > 0
            && self.image_height > 0
            && self.nominal_scale().is_finite()
            && self.nominal_scale() > 0.0;
        if !fov_ok {
            return Err(SolveError::InvalidInput(format!(
                "no field of view: {}x{} px, {} mm, {} µm, bin {}",
                self.image_width,
                self.image_height,
                self.focal_length_mm,
                self.pixel_size_um,
                self.binning
            )));
        }
        Ok(())
    }
}

/// Where the solver is, as reported to the observer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SolveStage {
    /// About to run matching attempt `attempt` (1-based).
    Matching { attempt: usize, rung: Attempt },
    /// About to run refinement trial `trial` (1-based).
    Converging { trial: u32 },
}

/// Solve without interruption. See [`solve_plate_with`].
pub fn solve_plate(
    detected: &[DetectedStar],
    catalog: &[CatalogStar],
    config: &SolveConfig,
) -> Result<PlateSolution, SolveError> {
    solve_plate_with(detected, catalog, config, |_| ControlFlow::Continue(()))
}

/// Solve the plate of an image.
///
/// `detected` are image star positions in 0-based pixels; `catalog` are
/// reference stars around `config.center`. Neither list is modified; both
/// are ordered brightest first internally.
///
/// `observer` is called before every matching attempt and refinement trial;
/// returning `ControlFlow::Break` ends the solve with [`SolveError::Cancelled`].
pub fn solve_plate_with<F>(
    detected: &[DetectedStar],
    catalog: &[CatalogStar],
    config: &SolveConfig,
    mut observer: F,
) -> Result<PlateSolution, SolveError>
where
    F: FnMut(&SolveStage) -> ControlFlow<()>,
{
    // ── Init ────────────────────────────────────────────────────────────
    config.validate()?;
    if detected.len() < config.min_pairs {
        return Err(SolveError::InsufficientData(format!(
            "{} detected stars, {} required",
            detected.len(),
            config.min_pairs
        )));
    }

    let mut stars: Vec<DetectedStar> = detected.to_vec();
    sort_by_brightness(&mut stars, |s| s.mag);
    let (rx, ry) = config.reference_pixel();
    let offsets: Vec<(f64, f64)> = stars.iter().map(|s| (s.x - rx, s.y - ry)).collect();

    let mut working: Vec<CatalogStar> = catalog.to_vec();
    project_catalog(&mut working, config.center);
    working.retain(|s| s.projected.is_some());
    sort_by_brightness(&mut working, |s| s.mag);
    if working.len() < config.min_pairs {
        return Err(SolveError::InsufficientData(format!(
            "{} catalog stars in front of the tangent plane, {} required",
            working.len(),
            config.min_pairs
        )));
    }
    let plane = plane_points(&working);

    // ── Matching ────────────────────────────────────────────────────────
    let nominal = config.nominal_scale();
    let rungs = retry::ladder(
        config.n_candidates,
        config.candidate_step,
        offsets.len().max(plane.len()),
        nominal,
        config.scale_tolerance,
        config.max_attempts,
    );
    debug!(
        "solve: {} stars, {} catalog stars, nominal scale {:.4}\"/px, {} attempts",
        offsets.len(),
        plane.len(),
        nominal,
        rungs.len()
    );

    let mut failure: Option<SolveError> = None;
    let mut matched: Option<Homography> = None;
    for (k, rung) in rungs.iter().enumerate() {
        let stage = SolveStage::Matching {
            attempt: k + 1,
            rung: *rung,
        };
        if observer(&stage).is_break() {
            return Err(SolveError::Cancelled);
        }
        let match_config = MatchConfig {
            n_candidates: rung.n_candidates,
            min_pairs: config.min_pairs,
            scale_min: rung.scale.map(|s| s.0),
            scale_max: rung.scale.map(|s| s.1),
            transform: config.transform,
            ..Default::default()
        };
        match match_stars(&offsets, &plane, &match_config) {
            Ok(h) => match check_geometry(
                &h,
                config.affine_tolerance,
                (config.image_width as f64, config.image_height as f64),
            ) {
                Ok(()) => {
                    debug!(
                        "solve: attempt {} matched {} of {} pairs",
                        k + 1,
                        h.inlier_count,
                        h.pair_count
                    );
                    matched = Some(h);
                    break;
                }
                Err(e) => {
                    debug!("solve: attempt {} rejected: {}", k + 1, e);
                    failure = Some(e);
                }
            },
            Err(e @ MatchError::TooFewStars { .. }) => {
                return Err(SolveError::InsufficientData(e.to_string()));
            }
            Err(e) => {
                debug!("solve: attempt {} ({:?}) failed: {}", k + 1, rung, e);
                failure = Some(SolveError::MatchNotFound {
                    attempts: k + 1,
                    last: e,
                });
            }
        }
    }
    let Some(mut h) = matched else {
        return Err(match failure {
            Some(SolveError::MatchNotFound { last, .. }) => SolveError::MatchNotFound {
                attempts: rungs.len(),
                last,
            },
            Some(e) => e,
            None => SolveError::MatchNotFound {
                attempts: 0,
                last: MatchError::NoConsistentMatch("no attempts made".into()),
            },
        });
    };

    // ── Converging ──────────────────────────────────────────────────────
    let src: Vec<(f64, f64)> = h.pairs.iter().map(|&(i, _)| offsets[i]).collect();
    let mut refs: Vec<CatalogStar> = h.pairs.iter().map(|&(_, j)| working[j].clone()).collect();
    let mut center = config.center;
    let mut crval = reference_coordinate(&h, center);

    let max_trials = config.trials();
    let mut converged = max_trials == 0;
    for trial in 1..=max_trials {
        if observer(&SolveStage::Converging { trial }).is_break() {
            return Err(SolveError::Cancelled);
        }
        deproject_catalog(&mut refs, center);
        if project_catalog(&mut refs, crval) != refs.len() {
            warn!("solve: matched star behind tangent plane at trial {}, stopping", trial);
            project_catalog(&mut refs, center);
            break;
        }
        let refit = match h.refit(&src, &plane_points(&refs)) {
            Ok(refit) => refit,
            Err(e) => {
                warn!("solve: refit failed at trial {}: {}", trial, e);
                project_catalog(&mut refs, center);
                break;
            }
        };
        h = refit;
        center = crval;

        let next = reference_coordinate(&h, center);
        let d_ra = relative_change(next.ra_deg, crval.ra_deg, true);
        let d_dec = relative_change(next.dec_deg, crval.dec_deg, false);
        debug!(
            "solve: trial {}: crval ({:.8}, {:.8}), change ({:.2e}, {:.2e})",
            trial, next.ra_deg, next.dec_deg, d_ra, d_dec
        );
        crval = next;
        if d_ra < CONVERGENCE_TOLERANCE && d_dec < CONVERGENCE_TOLERANCE {
            converged = true;
            break;
        }
    }
    if !converged {
        warn!(
            "solve: reference coordinate not converged after {} trials",
            max_trials
        );
    }

    // ── Done ────────────────────────────────────────────────────────────
    let cd = probe_cd(&h, center, crval);
    let solution = PlateSolution::from_cd(
        config.image_width,
        config.image_height,
        [rx + 1.0, ry + 1.0],
        crval,
        cd,
        config.pixel_size_um * config.binning,
        converged,
        h.inlier_count as u32,
        h.pair_count as u32,
        h.rms,
    );
    info!(
        "solve: crval ({:.6}, {:.6}), scale {:.4}\"/px, rotation {:.3}°, {} stars, rms {:.3}\"{}",
        solution.crval[0],
        solution.crval[1],
        solution.pixel_scale_arcsec,
        solution.rotation_deg(),
        solution.matched_stars,
        solution.rms_arcsec,
        if solution.flipped { ", flipped" } else { "" }
    );
    Ok(solution)
}

fn plane_points(stars: &[CatalogStar]) -> Vec<(f64, f64)> {
    stars
        .iter()
        .filter_map(|s| s.projected.map(|[xi, eta]| (xi, eta)))
        .collect()
}

/// Sky position of the reference pixel under `h`, whose plane is tangent at `center`.
fn reference_coordinate(h: &Homography, center: SkyPoint) -> SkyPoint {
    let (xi, eta) = h.apply(0.0, 0.0);
    let (ra, dec) = center.deproject(xi, eta, PlaneUnits::Arcsec);
    SkyPoint::new(ra, dec)
}

fn relative_change(new: f64, old: f64, wraps: bool) -> f64 {
    let mut d = new - old;
    if wraps {
        d = (d + 180.0).rem_euclid(360.0) - 180.0;
    }
    d.abs() / old.abs().max(1.0)
}

/// CD matrix (degrees per pixel) at `crval` from unit pixel steps through
/// `h`, whose plane is tangent at `center`.
fn probe_cd(h: &Homography, center: SkyPoint, crval: SkyPoint) -> [[f64; 2]; 2] {
    let to_plane = |dx: f64, dy: f64| -> (f64, f64) {
        let (xi, eta) = h.apply(dx, dy);
        let (ra, dec) = center.deproject(xi, eta, PlaneUnits::Arcsec);
        crval
            .project(ra, dec, PlaneUnits::Arcsec)
            .unwrap_or((f64::NAN, f64::NAN))
    };
    let p0 = to_plane(0.0, 0.0);
    let px = to_plane(1.0, 0.0);
    let py = to_plane(0.0, 1.0);
    [
        [(px.0 - p0.0) / 3600.0, (py.0 - p0.0) / 3600.0],
        [(px.1 - p0.1) / 3600.0, (py.1 - p0.1) / 3600.0],
    ]
}

/// Reject transforms real optics cannot produce: with `[[b, c], [e, f]]`
/// the linear part divided by its scale, require `||b| - |f|| <= tol` and
/// `||c| - |e|| <= tol`. A homography's projective row must also change the
/// denominator by at most [`MAX_PERSPECTIVE`] over an image of `extent` pixels.
fn check_geometry(h: &Homography, tolerance: f64, extent: (f64, f64)) -> Result<(), SolveError> {
    let s = h.scale();
    if !(s > 0.0 && s.is_finite()) {
        return Err(SolveError::GeometricImplausibility(format!(
            "transform scale {}",
            s
        )));
    }
    let [[b, c], [e, f]] = h.linear().map(|row| row.map(|v| v / s));
    let (d1, d2) = ((b.abs() - f.abs()).abs(), (c.abs() - e.abs()).abs());
    if d1 > tolerance || d2 > tolerance {
        return Err(SolveError::GeometricImplausibility(format!(
            "||b|-|f|| = {:.3}, ||c|-|e|| = {:.3} exceed {}",
            d1, d2, tolerance
        )));
    }
    let perspective = h.h[2][0].abs() * extent.0 + h.h[2][1].abs() * extent.1;
    if !(perspective <= MAX_PERSPECTIVE) {
        return Err(SolveError::GeometricImplausibility(format!(
            "perspective term {:.3} across the image exceeds {}",
            perspective, MAX_PERSPECTIVE
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn homography(l: [[f64; 2]; 2]) -> Homography {
        Homography {
            h: [[l[0][0], l[0][1], 0.0], [l[1][0], l[1][1], 0.0], [0.0, 0.0, 1.0]],
            kind: TransformKind::Affine,
            pairs: Vec::new(),
            pair_count: 0,
            inlier_count: 0,
            rms: 0.0,
        }
    }

    #[test]
    fn test_geometry_sanity_check() {
        let (s, c) = 0.3f64.sin_cos();
        let extent = (1000.0, 800.0);
        // rotation and mirror at 2"/px pass
        let rotated = homography([[2.0 * c, -2.0 * s], [2.0 * s, 2.0 * c]]);
        assert!(check_geometry(&rotated, 0.3, extent).is_ok());
        let mirrored = homography([[2.0 * c, 2.0 * s], [2.0 * s, -2.0 * c]]);
        assert!(check_geometry(&mirrored, 0.3, extent).is_ok());
        // 2:1 pixel aspect fails
        assert!(matches!(
            check_geometry(&homography([[4.0, 0.0], [0.0, 2.0]]), 0.3, extent),
            Err(SolveError::GeometricImplausibility(_))
        ));
        assert!(check_geometry(&homography([[0.0, 0.0], [0.0, 0.0]]), 0.3, extent).is_err());
    }

    #[test]
    fn test_perspective_bound() {
        let mut h = homography([[2.0, 0.0], [0.0, 2.0]]);
        h.kind = TransformKind::Homography;
        h.h[2][0] = 1e-6;
        h.h[2][1] = -2e-6;
        assert!(check_geometry(&h, 0.3, (1000.0, 800.0)).is_ok());

        // 1e-3 per pixel doubles the denominator across the frame
        h.h[2][0] = 1e-3;
        assert!(matches!(
            check_geometry(&h, 0.3, (1000.0, 800.0)),
            Err(SolveError::GeometricImplausibility(_))
        ));
        h.h[2][0] = 0.0;
        h.h[2][1] = 1e-4;
        assert!(check_geometry(&h, 0.3, (1000.0, 800.0)).is_err());
    }

    #[test]
    fn test_config_validation() {
        let good = SolveConfig::new(1000, 800, SkyPoint::new(83.8, -5.4), 400.0, 3.76);
        assert!(good.validate().is_ok());
        assert!((good.nominal_scale() - 1.9389).abs() < 1e-4);

        for bad in [
            SolveConfig { center: SkyPoint::new(0.0, 0.0), ..good.clone() },
            SolveConfig { center: SkyPoint::new(10.0, 95.0), ..good.clone() },
            SolveConfig { center: SkyPoint::new(f64::NAN, 5.0), ..good.clone() },
            SolveConfig { focal_length_mm: 0.0, ..good.clone() },
            SolveConfig { pixel_size_um: -1.0, ..good.clone() },
            SolveConfig { image_width: 0, ..good.clone() },
        ] {
            assert!(matches!(bad.validate(), Err(SolveError::InvalidInput(_))), "{bad:?}");
        }
    }

    #[test]
    fn test_trials_default() {
        let mut cfg = SolveConfig::default();
        assert_eq!(cfg.trials(), 0);
        cfg.reference_offset = (10.0, 0.0);
        assert_eq!(cfg.trials(), OFFSET_TRIALS);
        cfg.max_trials = Some(3);
        assert_eq!(cfg.trials(), 3);
    }

    #[test]
    fn test_relative_change_wraps() {
        assert!(relative_change(0.000_001, 359.999_999, true) < 1e-8);
        assert!((relative_change(10.5, 10.0, false) - 0.05).abs() < 1e-12);
    }
}
