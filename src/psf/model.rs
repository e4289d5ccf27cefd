//! Elliptical Gaussian PSF model and its analytic Jacobian.
//!
//! ```text
//! f(x, y) = B + A · exp(-(u² / Sx + v² / Sy))
//! u =  cos θ · (x - x0) - sin θ · (y - y0)
//! v =  sin θ · (x - x0) + cos θ · (y - y0)
//! ```
//!
//! `Sx`, `Sy` are spread parameters, `S = 2σ²`. Parameter vectors are laid
//! out as `[B, A, x0, y0, Sx, Sy]`, with `θ` (radians) appended for the
//! rotated model.

/// Parameter indices into a model parameter vector.
pub const B: usize = 0;
pub const A: usize = 1;
pub const X0: usize = 2;
pub const Y0: usize = 3;
pub const SX: usize = 4;
pub const SY: usize = 5;
pub const THETA: usize = 6;

/// `2·sqrt(2·ln 2)`: FWHM of a Gaussian in units of σ.
pub const FWHM_PER_SIGMA: f64 = 2.354_820_045_030_949_3;

/// Which functional form is being fitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GaussianModel {
    /// Axis-aligned, six parameters.
    Aligned,
    /// Rotated by θ, seven parameters.
    Rotated,
}

impl GaussianModel {
    pub fn n_params(self) -> usize {
        match self {
            GaussianModel::Aligned => 6,
            GaussianModel::Rotated => 7,
        }
    }

    #[inline]
    fn angle(self, p: &[f64]) -> f64 {
        match self {
            GaussianModel::Aligned => 0.0,
            GaussianModel::Rotated => p[THETA],
        }
    }

    /// Model value at 1-based window coordinates `(x, y)`.
    #[inline]
    pub fn value(self, p: &[f64], x: f64, y: f64) -> f64 {
        let (sin_t, cos_t) = self.angle(p).sin_cos();
        let dx = x - p[X0];
        let dy = y - p[Y0];
        let u = cos_t * dx - sin_t * dy;
        let v = sin_t * dx + cos_t * dy;
        p[B] + p[A] * (-(u * u / p[SX] + v * v / p[SY])).exp()
    }

    /// Partial derivatives of the model at `(x, y)`, written into `grad`
    /// (length [`n_params`](Self::n_params)). Returns the model value.
    #[inline]
    pub fn gradient(self, p: &[f64], x: f64, y: f64, grad: &mut [f64]) -> f64 {
        let (sin_t, cos_t) = self.angle(p).sin_cos();
        let dx = x - p[X0];
        let dy = y - p[Y0];
        let u = cos_t * dx - sin_t * dy;
        let v = sin_t * dx + cos_t * dy;
        let (sx, sy) = (p[SX], p[SY]);
        let e = (-(u * u / sx + v * v / sy)).exp();
        let ae = p[A] * e;

        grad[B] = 1.0;
        grad[A] = e;
        grad[X0] = ae * 2.0 * (u * cos_t / sx + v * sin_t / sy);
        grad[Y0] = ae * 2.0 * (-u * sin_t / sx + v * cos_t / sy);
        grad[SX] = ae * u * u / (sx * sx);
        grad[SY] = ae * v * v / (sy * sy);
        if self == GaussianModel::Rotated {
            grad[THETA] = ae * 2.0 * u * v * (1.0 / sx - 1.0 / sy);
        }

        p[B] + ae
    }
}

/// σ from a spread parameter `S = 2σ²`.
#[inline]
pub fn sigma_from_spread(s: f64) -> f64 {
    (s / 2.0).sqrt()
}

/// FWHM in pixels from a spread parameter.
#[inline]
pub fn fwhm_from_spread(s: f64) -> f64 {
    sigma_from_spread(s) * FWHM_PER_SIGMA
}
