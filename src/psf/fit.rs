use nalgebra::DVector;
use tracing::debug;

use super::lm::{levenberg_marquardt, GaussianResiduals, LmOutcome};
use super::model::{self, fwhm_from_spread, sigma_from_spread, GaussianModel};
use super::window::PixelWindow;
use super::{FittedStar, MagnitudeError, ParamUncertainty, PsfConfig, PsfParameters};
use crate::photometry::{AperturePhotometry, MAG_PER_REL_FLUX};

/// Starting point for the aligned fit, derived from the window alone.
///
/// The peak is the maximum of the 3×3-median-filtered window. From there
/// the row and the column through the peak are walked outward until the
/// intensity drops below half the peak height above `background`; the
/// interpolated crossings give the width at half maximum along each axis,
/// from which `σ = w / FWHM_PER_SIGMA`.
///
/// Returns `None` for an empty window or one with no signal above `background`.
pub fn initial_guess(window: &PixelWindow, background: f64) -> Option<PsfParameters> {
    if window.is_empty() {
        return None;
    }
    let (mut pc, mut pr, mut peak) = (0, 0, f64::NEG_INFINITY);
    for r in 0..window.height() {
        for c in 0..window.width() {
            let v = window.median3(c, r);
            if v > peak {
                (pc, pr, peak) = (c, r, v);
            }
        }
    }
    let amplitude = peak - background;
    if !(amplitude > 0.0) {
        return None;
    }
    let half = background + amplitude / 2.0;

    let wx = half_max_width(window.width(), pc, half, |c| window.at(c, pr));
    let wy = half_max_width(window.height(), pr, half, |r| window.at(pc, r));

    Some(PsfParameters {
        background,
        amplitude,
        x0: (pc + 1) as f64,
        y0: (pr + 1) as f64,
        sigma_x: wx / model::FWHM_PER_SIGMA,
        sigma_y: wy / model::FWHM_PER_SIGMA,
        angle: 0.0,
    })
}

/// Width of the region around `peak` where `value` stays above `half`,
/// with linear interpolation at both crossings. At least one pixel.
fn half_max_width(len: usize, peak: usize, half: f64, value: impl Fn(usize) -> f64) -> f64 {
    let crossing = |inside: usize, outside: usize| {
        let (vi, vo) = (value(inside), value(outside));
        let t = if vi > vo { (vi - half) / (vi - vo) } else { 0.5 };
        inside as f64 + t.clamp(0.0, 1.0) * (outside as f64 - inside as f64)
    };

    let mut lo = peak;
    while lo > 0 && value(lo - 1) > half {
        lo -= 1;
    }
    let left = if lo > 0 { crossing(lo, lo - 1) } else { -0.5 };

    let mut hi = peak;
    while hi + 1 < len && value(hi + 1) > half {
        hi += 1;
    }
    let right = if hi + 1 < len {
        crossing(hi, hi + 1)
    } else {
        len as f64 - 0.5
    };

    (right - left).max(1.0)
}

/// Fit the axis-aligned Gaussian (6 parameters).
///
/// Fails if the window has no more pixels than parameters, if no starting
/// point can be found, or if the optimizer ends on a non-positive spread.
pub fn fit_no_angle(
    window: &PixelWindow,
    background: f64,
    config: &PsfConfig,
) -> Option<FittedStar> {
    let model = GaussianModel::Aligned;
    if window.len() <= model.n_params() {
        debug!("window of {} pixels too small for {:?} fit", window.len(), model);
        return None;
    }
    let guess = initial_guess(window, background)?;
    let p0 = DVector::from_vec(vec![
        guess.background,
        guess.amplitude,
        guess.x0,
        guess.y0,
        2.0 * guess.sigma_x * guess.sigma_x,
        2.0 * guess.sigma_y * guess.sigma_y,
    ]);
    let outcome = run(window, model, p0, config)?;
    let mut star = assemble(window, model, &outcome)?;
    star.mag_error = MagnitudeError::Unavailable;
    Some(star)
}

/// Fit the rotated Gaussian (7 parameters), seeded from `seed`.
///
/// `seed` is normally the result of [`fit_no_angle`], so θ starts at zero.
/// Without photometry, or when it yields nothing, the magnitude is the
/// window sum and its error is propagated from the fit covariance.
pub fn fit_with_angle(
    window: &PixelWindow,
    seed: &FittedStar,
    photometry: Option<&dyn AperturePhotometry>,
    config: &PsfConfig,
) -> Option<FittedStar> {
    let model = GaussianModel::Rotated;
    if window.len() <= model.n_params() {
        return None;
    }
    let s = &seed.params;
    let p0 = DVector::from_vec(vec![
        s.background,
        s.amplitude,
        s.x0,
        s.y0,
        2.0 * s.sigma_x * s.sigma_x,
        2.0 * s.sigma_y * s.sigma_y,
        s.angle.to_radians(),
    ]);
    let outcome = run(window, model, p0, config)?;
    let mut star = assemble(window, model, &outcome)?;

    star.mag_error = match &outcome.covariance {
        Some(_) => {
            let u = &star.uncertainty;
            let rel = (u.amplitude.powi(2) + u.sigma_x.powi(2) + u.sigma_y.powi(2)).sqrt();
            if rel.is_finite() {
                MagnitudeError::FitCovariance(MAG_PER_REL_FLUX * rel)
            } else {
                MagnitudeError::Unavailable
            }
        }
        None => MagnitudeError::Unavailable,
    };
    star.fold_angle();

    if let Some(phot) = photometry {
        star.apply_photometry(window, phot);
    }
    Some(star)
}

fn run(
    window: &PixelWindow,
    model: GaussianModel,
    p0: DVector<f64>,
    config: &PsfConfig,
) -> Option<LmOutcome> {
    let problem = GaussianResiduals::new(window, model);
    let outcome = levenberg_marquardt(&problem, p0, config.max_iterations, config.tolerance);
    if outcome.is_none() {
        debug!("{:?} fit: starting point outside model domain", model);
    }
    outcome
}

/// Turn a finished optimizer run into a star record. `None` if the spreads
/// or amplitude are unusable.
fn assemble(window: &PixelWindow, model: GaussianModel, out: &LmOutcome) -> Option<FittedStar> {
    let p = out.params.as_slice();
    let (sx, sy) = (p[model::SX], p[model::SY]);
    if !(sx.is_finite() && sy.is_finite() && sx > 0.0 && sy > 0.0 && p[model::A].is_finite()) {
        debug!("{:?} fit diverged: Sx = {}, Sy = {}", model, sx, sy);
        return None;
    }

    let angle = match model {
        GaussianModel::Aligned => 0.0,
        GaussianModel::Rotated => p[model::THETA].to_degrees(),
    };
    let params = PsfParameters {
        background: p[model::B],
        amplitude: p[model::A],
        x0: p[model::X0],
        y0: p[model::Y0],
        sigma_x: sigma_from_spread(sx),
        sigma_y: sigma_from_spread(sy),
        angle,
    };

    let uncertainty = match &out.covariance {
        Some(cov) => {
            let rel = |k: usize| cov[(k, k)].max(0.0).sqrt() / p[k].abs();
            ParamUncertainty {
                background: rel(model::B),
                amplitude: rel(model::A),
                x0: rel(model::X0),
                y0: rel(model::Y0),
                // σ = sqrt(S/2)
                sigma_x: rel(model::SX) / 2.0,
                sigma_y: rel(model::SY) / 2.0,
            }
        }
        None => ParamUncertainty {
            background: f64::NAN,
            amplitude: f64::NAN,
            x0: f64::NAN,
            y0: f64::NAN,
            sigma_x: f64::NAN,
            sigma_y: f64::NAN,
        },
    };

    let flux: f64 = window.data().iter().map(|v| v - params.background).sum();
    let mag = if flux > 0.0 { -2.5 * flux.log10() } else { f64::NAN };
    let rect = window.rect();

    Some(FittedStar {
        params,
        model,
        fwhm_x: fwhm_from_spread(sx),
        fwhm_y: fwhm_from_spread(sy),
        fwhm_arcsec: None,
        mag,
        mag_error: MagnitudeError::Unavailable,
        snr: None,
        rmse: (out.chi2 / window.len() as f64).sqrt(),
        uncertainty,
        xpos: rect.x as f64 + params.x0 - 1.0,
        ypos: rect.y as f64 + params.y0 - 1.0,
        photometry: None,
        converged: out.converged,
    })
}
