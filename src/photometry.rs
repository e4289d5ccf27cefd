//! Aperture photometry on a fitted star.
//!
//! The PSF fitter only needs the [`AperturePhotometry`] trait; returning
//! `None` is a legal answer and makes the fitter fall back to its own
//! magnitude estimate. [`CircularAperture`] is a straightforward
//! implementation: a circular aperture with the sky taken from a
//! sigma-clipped annulus.

use crate::psf::PixelWindow;

/// 2.5 / ln(10): converts a relative flux error to a magnitude error.
pub const MAG_PER_REL_FLUX: f64 = 1.085_736_204_758_129_6;

/// Photometric measurement of one star.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Photometry {
    pub mag: f64,
    pub mag_error: f64,
    /// Linear signal-to-noise ratio of the aperture flux.
    pub snr: f64,
    /// `false` if the aperture was truncated by the window edge or touched a
    /// saturated pixel. The numbers are still reported.
    pub valid: bool,
}

/// Aperture photometry collaborator used by
/// [`fit_star`](crate::psf::fit_star).
pub trait AperturePhotometry {
    /// Measure the star centred at 0-based window coordinates `(x, y)`.
    fn measure(&self, window: &PixelWindow, x: f64, y: f64, fwhm: f64) -> Option<Photometry>;
}

/// Circular aperture with an annulus sky estimate.
#[derive(Debug, Clone)]
pub struct CircularAperture {
    /// Aperture radius in pixels. Default 5.0.
    pub radius: f64,
    /// Inner radius of the sky annulus. Default 8.0.
    pub inner_radius: f64,
    /// Outer radius of the sky annulus. Default 12.0.
    pub outer_radius: f64,
    /// Camera gain in e-/ADU. Default 1.0.
    pub gain: f64,
    /// Magnitude of a 1 ADU source. Default 0.0 (instrumental magnitudes).
    pub zero_point: f64,
    /// Pixels at or above this level invalidate the measurement. Default None.
    pub saturation: Option<f64>,
    /// Minimum number of usable annulus pixels. Default 10.
    pub min_sky_pixels: usize,
}

impl Default for CircularAperture {
    fn default() -> Self {
        Self {
            radius: 5.0,
            inner_radius: 8.0,
            outer_radius: 12.0,
            gain: 1.0,
            zero_point: 0.0,
            saturation: None,
            min_sky_pixels: 10,
        }
    }
}

/// Median and standard deviation after iterative 3σ clipping.
fn clipped_sky(values: &mut Vec<f64>) -> Option<(f64, f64)> {
    const CLIP: f64 = 3.0;
    for _ in 0..5 {
        if values.len() < 3 {
            return None;
        }
        values.sort_unstable_by(|a, b| a.total_cmp(b));
        let median = values[values.len() / 2];
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let var =
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
        let sd = var.sqrt();
        let before = values.len();
        values.retain(|v| (v - median).abs() <= CLIP * sd);
        if values.len() == before {
            return Some((median, sd));
        }
    }
    if values.len() < 3 {
        return None;
    }
    values.sort_unstable_by(|a, b| a.total_cmp(b));
    let median = values[values.len() / 2];
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let sd = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64)
        .sqrt();
    Some((median, sd))
}

impl AperturePhotometry for CircularAperture {
    fn measure(&self, window: &PixelWindow, x: f64, y: f64, _fwhm: f64) -> Option<Photometry> {
        if !(self.radius > 0.0 && self.inner_radius >= self.radius && self.outer_radius > self.inner_radius)
        {
            return None;
        }
        let r2 = self.radius * self.radius;
        let in2 = self.inner_radius * self.inner_radius;
        let out2 = self.outer_radius * self.outer_radius;

        let mut aperture = Vec::new();
        let mut sky = Vec::new();
        let mut saturated = false;
        for row in 0..window.height() {
            for col in 0..window.width() {
                let dx = col as f64 - x;
                let dy = row as f64 - y;
                let d2 = dx * dx + dy * dy;
                let v = window.at(col, row);
                if d2 <= r2 {
                    if self.saturation.is_some_and(|s| v >= s) {
                        saturated = true;
                    }
                    aperture.push(v);
                } else if d2 >= in2 && d2 < out2 {
                    sky.push(v);
                }
            }
        }

        if aperture.is_empty() || sky.len() < self.min_sky_pixels {
            return None;
        }
        let (sky_level, sky_sd) = clipped_sky(&mut sky)?;
        let n_ap = aperture.len() as f64;
        let n_sky = sky.len() as f64;
        let flux: f64 = aperture.iter().map(|v| v - sky_level).sum();
        if !(flux > 0.0) {
            return None;
        }

        let variance = flux / self.gain + n_ap * sky_sd * sky_sd * (1.0 + n_ap / n_sky);
        let snr = flux / variance.sqrt();

        let inside = x - self.radius >= -0.5
            && y - self.radius >= -0.5
            && x + self.radius <= window.width() as f64 - 0.5
            && y + self.radius <= window.height() as f64 - 0.5;

        Some(Photometry {
            mag: self.zero_point - 2.5 * flux.log10(),
            mag_error: MAG_PER_REL_FLUX / snr,
            snr,
            valid: inside && !saturated,
        })
    }
}
