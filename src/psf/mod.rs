//! Stellar PSF fitting.
//!
//! A star is fitted in two stages:
//!
//! 1. An axis-aligned elliptical Gaussian (6 parameters), seeded from the
//!    window itself by [`initial_guess`].
//! 2. If the star is measurably elongated, a rotated Gaussian (7 parameters)
//!    seeded from stage 1 with θ = 0.
//!
//! Seeding the rotated fit from the converged aligned fit keeps θ from
//! wandering on nearly round stars; stars rounder than
//! [`ROUND_STAR_THRESHOLD`] skip stage 2 entirely.
//!
//! [`fit_star`] is the entry point. Every fit is a pure function of its
//! window, so callers may fit disjoint windows on as many threads as they like.

mod fit;
pub(crate) mod lm;
pub mod model;
pub mod units;
mod window;

use tracing::debug;

use crate::photometry::{AperturePhotometry, Photometry};
use crate::pixels::PixelSource;

pub use fit::{fit_no_angle, fit_with_angle, initial_guess};
pub use model::GaussianModel;
pub use units::{fwhm_to_arcsec, Calibration};
pub use window::{PixelWindow, Rect};

/// Largest `|σx - σy|` (pixels) for which a star counts as round and the
/// rotated fit is skipped.
pub const ROUND_STAR_THRESHOLD: f64 = 0.001;

/// Magnitude error reported when no photometric error is available.
pub const NO_MAG_ERROR: f64 = 9.999;

/// Parameters controlling a PSF fit.
#[derive(Debug, Clone)]
pub struct PsfConfig {
    /// Maximum Levenberg-Marquardt iterations per stage. Default 10.
    pub max_iterations: u32,
    /// Step-size convergence tolerance (absolute and relative). Default 1e-4.
    pub tolerance: f64,
    /// See [`ROUND_STAR_THRESHOLD`].
    pub round_star_threshold: f64,
}

impl Default for PsfConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            tolerance: 1e-4,
            round_star_threshold: ROUND_STAR_THRESHOLD,
        }
    }
}

/// Elliptical Gaussian parameters in window coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PsfParameters {
    pub background: f64,
    pub amplitude: f64,
    /// Centre, 1-based window coordinates.
    pub x0: f64,
    pub y0: f64,
    /// Standard deviation along the model's first and second axis, pixels.
    pub sigma_x: f64,
    pub sigma_y: f64,
    /// Rotation of the model axes in degrees, within `[-90, 90]`.
    pub angle: f64,
}

/// Relative (1σ / value) uncertainty of each fitted parameter.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ParamUncertainty {
    pub background: f64,
    pub amplitude: f64,
    pub x0: f64,
    pub y0: f64,
    pub sigma_x: f64,
    pub sigma_y: f64,
}

/// Where a magnitude error came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MagnitudeError {
    /// Nothing to derive it from.
    Unavailable,
    /// Propagated from the covariance of the rotated fit.
    FitCovariance(f64),
    /// Reported by aperture photometry.
    Photometric(f64),
}

impl MagnitudeError {
    /// Numeric value, with [`NO_MAG_ERROR`] standing in for `Unavailable`.
    pub fn value(&self) -> f64 {
        match *self {
            MagnitudeError::Unavailable => NO_MAG_ERROR,
            MagnitudeError::FitCovariance(v) | MagnitudeError::Photometric(v) => v,
        }
    }
}

/// Result of a successful PSF fit.
///
/// Invariants: `params.sigma_x >= params.sigma_y`, `params.angle ∈ [-90, 90]`,
/// FWHM values finite and positive.
#[derive(Debug, Clone, PartialEq)]
pub struct FittedStar {
    pub params: PsfParameters,
    /// Which model produced `params`.
    pub model: GaussianModel,
    /// FWHM along the first and second model axis, pixels.
    pub fwhm_x: f64,
    pub fwhm_y: f64,
    /// FWHM in arcseconds, once [`fwhm_to_arcsec`] has been applied with
    /// usable calibration.
    pub fwhm_arcsec: Option<[f64; 2]>,
    pub mag: f64,
    pub mag_error: MagnitudeError,
    pub snr: Option<f64>,
    /// RMS of `model - data` over the window.
    pub rmse: f64,
    pub uncertainty: ParamUncertainty,
    /// Centre in 0-based full-image pixels.
    pub xpos: f64,
    pub ypos: f64,
    pub photometry: Option<Photometry>,
    /// Whether the last Levenberg-Marquardt stage met its tolerance.
    pub converged: bool,
}

impl FittedStar {
    /// Ratio of minor to major axis, in `(0, 1]`.
    pub fn roundness(&self) -> f64 {
        self.params.sigma_y / self.params.sigma_x
    }

    /// Swap the two model axes, rotating the angle by 90° so the ellipse
    /// described stays the same.
    fn swap_axes(&mut self) {
        let p = &mut self.params;
        std::mem::swap(&mut p.sigma_x, &mut p.sigma_y);
        std::mem::swap(&mut self.fwhm_x, &mut self.fwhm_y);
        std::mem::swap(&mut self.uncertainty.sigma_x, &mut self.uncertainty.sigma_y);
        if let Some([ax, ay]) = self.fwhm_arcsec {
            self.fwhm_arcsec = Some([ay, ax]);
        }
        p.angle += if p.angle > 0.0 { -90.0 } else { 90.0 };
    }

    /// Fold the angle into `[-90, 90]` in 90° steps, swapping axes at each
    /// step so the ellipse is unchanged.
    fn fold_angle(&mut self) {
        while self.params.angle > 90.0 {
            self.swap_axes();
        }
        while self.params.angle < -90.0 {
            self.swap_axes();
        }
    }

    /// Apply the `sigma_x >= sigma_y` convention.
    fn order_axes(&mut self) {
        if self.params.sigma_y > self.params.sigma_x {
            self.swap_axes();
        }
    }

    /// Use aperture photometry in place of the fit-based magnitude, if the
    /// collaborator produces a measurement.
    fn apply_photometry(&mut self, window: &PixelWindow, photometry: &dyn AperturePhotometry) {
        let x = self.params.x0 - 1.0;
        let y = self.params.y0 - 1.0;
        let fwhm = (self.fwhm_x * self.fwhm_y).sqrt();
        match photometry.measure(window, x, y, fwhm) {
            Some(p) => {
                self.mag = p.mag;
                self.mag_error = MagnitudeError::Photometric(p.mag_error);
                self.snr = Some(p.snr);
                self.photometry = Some(p);
            }
            None => debug!(
                "photometry unavailable at ({:.2}, {:.2}), keeping fit magnitude",
                self.xpos, self.ypos
            ),
        }
    }
}

/// Fit a star with the default [`PsfConfig`].
///
/// `background` seeds the background parameter. With `fit_angle` false, or
/// for round stars, only the aligned model is fitted. When `photometry` is
/// given it replaces the fit-based magnitude where it can.
///
/// Returns `None` if the window has too few pixels, the optimizer diverges,
/// or the rotated stage fails.
pub fn fit_star(
    window: &PixelWindow,
    background: f64,
    fit_angle: bool,
    photometry: Option<&dyn AperturePhotometry>,
) -> Option<FittedStar> {
    fit_star_with(window, background, fit_angle, photometry, &PsfConfig::default())
}

/// [`fit_star`] with explicit configuration.
pub fn fit_star_with(
    window: &PixelWindow,
    background: f64,
    fit_angle: bool,
    photometry: Option<&dyn AperturePhotometry>,
    config: &PsfConfig,
) -> Option<FittedStar> {
    let aligned = fit_no_angle(window, background, config)?;

    let round = (aligned.params.sigma_x - aligned.params.sigma_y).abs() < config.round_star_threshold;
    let mut star = if !fit_angle || round {
        let mut star = aligned;
        if let Some(phot) = photometry {
            star.apply_photometry(window, phot);
        }
        star
    } else {
        fit_with_angle(window, &aligned, photometry, config)?
    };

    star.order_axes();

    if !(star.fwhm_x.is_finite() && star.fwhm_y.is_finite() && star.fwhm_x > 0.0 && star.fwhm_y > 0.0)
    {
        debug!("rejecting fit with FWHM ({}, {})", star.fwhm_x, star.fwhm_y);
        return None;
    }
    Some(star)
}

/// Fit a star at each candidate pixel position in `layer` of `source`.
///
/// Each candidate gets a square window of side `2 * radius + 1`. Failed
/// fits are skipped. The result is sorted brightest first.
#[allow(clippy::too_many_arguments)]
pub fn fit_stars<S: PixelSource + ?Sized>(
    source: &S,
    layer: usize,
    candidates: &[(usize, usize)],
    radius: usize,
    background: f64,
    fit_angle: bool,
    photometry: Option<&dyn AperturePhotometry>,
    config: &PsfConfig,
) -> Vec<FittedStar> {
    let mut stars: Vec<FittedStar> = candidates
        .iter()
        .filter_map(|&(x, y)| {
            let window = match PixelWindow::around(source, layer, x, y, radius) {
                Ok(w) => w,
                Err(e) => {
                    debug!("candidate ({}, {}) skipped: {}", x, y, e);
                    return None;
                }
            };
            fit_star_with(&window, background, fit_angle, photometry, config)
        })
        .collect();

    crate::star::sort_by_brightness(&mut stars, |s| s.mag);
    debug!("fitted {} of {} candidates", stars.len(), candidates.len());
    stars
}
