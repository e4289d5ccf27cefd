//! Damped Gauss-Newton (Levenberg-Marquardt) for the PSF fits.
//!
//! Problems are 6 or 7 parameters over a few hundred pixels. The normal
//! equations are formed explicitly and solved with a Cholesky factorization.

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use super::model::GaussianModel;
use super::window::PixelWindow;

/// A least-squares problem: residual vector and Jacobian as functions of the
/// parameters.
pub(crate) trait LeastSquares {
    fn n_params(&self) -> usize;
    fn n_residuals(&self) -> usize;

    /// Fill `r` with residuals at `p`. Returns `false` when `p` is outside
    /// the model domain; the solver then treats the step as uphill.
    fn residuals(&self, p: &[f64], r: &mut DVector<f64>) -> bool;

    /// Fill `j` (`n_residuals × n_params`) with the Jacobian at `p`.
    fn jacobian(&self, p: &[f64], j: &mut DMatrix<f64>);
}

/// Gaussian model fitted to every pixel of a window, with equal weights.
pub(crate) struct GaussianResiduals<'a> {
    window: &'a PixelWindow,
    model: GaussianModel,
    sigma: f64,
}

impl<'a> GaussianResiduals<'a> {
    pub(crate) fn new(window: &'a PixelWindow, model: GaussianModel) -> Self {
        Self {
            window,
            model,
            sigma: 1.0,
        }
    }
}

impl LeastSquares for GaussianResiduals<'_> {
    fn n_params(&self) -> usize {
        self.model.n_params()
    }

    fn n_residuals(&self) -> usize {
        self.window.len()
    }

    fn residuals(&self, p: &[f64], r: &mut DVector<f64>) -> bool {
        if !(p[super::model::SX] > 0.0 && p[super::model::SY] > 0.0) {
            return false;
        }
        let w = self.window.width();
        for row in 0..self.window.height() {
            for col in 0..w {
                let x = (col + 1) as f64;
                let y = (row + 1) as f64;
                let f = self.model.value(p, x, y);
                r[row * w + col] = (f - self.window.at(col, row)) / self.sigma;
            }
        }
        r.iter().all(|v| v.is_finite())
    }

    fn jacobian(&self, p: &[f64], j: &mut DMatrix<f64>) {
        let n = self.model.n_params();
        let w = self.window.width();
        let mut grad = [0.0f64; 7];
        for row in 0..self.window.height() {
            for col in 0..w {
                let x = (col + 1) as f64;
                let y = (row + 1) as f64;
                self.model.gradient(p, x, y, &mut grad[..n]);
                let i = row * w + col;
                for k in 0..n {
                    j[(i, k)] = grad[k] / self.sigma;
                }
            }
        }
    }
}

/// Final state of a Levenberg-Marquardt run.
pub(crate) struct LmOutcome {
    pub params: DVector<f64>,
    /// Sum of squared residuals at `params`.
    pub chi2: f64,
    pub iterations: u32,
    pub converged: bool,
    /// `(JᵀJ)⁻¹` at the solution, scaled by `max(1, χ²/dof)`.
    /// `None` if the normal matrix is singular or there are no spare degrees of freedom.
    pub covariance: Option<DMatrix<f64>>,
}

const LAMBDA_INIT: f64 = 1e-3;
const LAMBDA_MAX: f64 = 1e10;

/// Step-size convergence test: every `|dx_i| < tol + tol·|x_i|`.
fn step_converged(dx: &DVector<f64>, x: &DVector<f64>, tol: f64) -> bool {
    dx.iter().zip(x.iter()).all(|(d, v)| d.abs() < tol + tol * v.abs())
}

/// Minimize `Σ r²` from `p0`, for at most `max_iterations` accepted or
/// rejected outer steps. A failed step (singular system, no downhill move at
/// any damping) stops the run and keeps the last iterate.
///
/// Returns `None` only if the starting point is itself outside the domain.
pub(crate) fn levenberg_marquardt<P: LeastSquares>(
    problem: &P,
    p0: DVector<f64>,
    max_iterations: u32,
    tol: f64,
) -> Option<LmOutcome> {
    let n = problem.n_params();
    let m = problem.n_residuals();

    let mut p = p0;
    let mut r = DVector::zeros(m);
    if !problem.residuals(p.as_slice(), &mut r) {
        return None;
    }
    let mut chi2 = r.norm_squared();

    let mut j = DMatrix::zeros(m, n);
    let mut r_trial = DVector::zeros(m);
    let mut lambda = LAMBDA_INIT;
    let mut converged = false;
    let mut iterations = 0;

    while iterations < max_iterations {
        iterations += 1;
        problem.jacobian(p.as_slice(), &mut j);
        let jtj = j.tr_mul(&j);
        let g = j.tr_mul(&r);

        let mut accepted = None;
        let mut negligible = false;
        while lambda < LAMBDA_MAX {
            let mut a = jtj.clone();
            for i in 0..n {
                a[(i, i)] += lambda * jtj[(i, i)].max(1e-12);
            }
            let Some(chol) = a.cholesky() else {
                lambda *= 10.0;
                continue;
            };
            let dx = -chol.solve(&g);
            let trial = &p + &dx;
            // At the minimum, rounding can make a vanishing step look uphill:
            // take it only if it does not.
            if step_converged(&dx, &p, tol) {
                negligible = true;
                if problem.residuals(trial.as_slice(), &mut r_trial) {
                    let c = r_trial.norm_squared();
                    if c <= chi2 {
                        accepted = Some((trial, dx, c));
                    }
                }
                break;
            }
            if problem.residuals(trial.as_slice(), &mut r_trial) {
                let c = r_trial.norm_squared();
                if c <= chi2 {
                    accepted = Some((trial, dx, c));
                    break;
                }
            }
            lambda *= 10.0;
        }

        if negligible {
            if let Some((trial, _, c)) = accepted {
                std::mem::swap(&mut r, &mut r_trial);
                chi2 = c;
                p = trial;
            }
            converged = true;
            break;
        }
        let Some((trial, dx, c)) = accepted else {
            debug!("LM: no downhill step at iteration {}, keeping last iterate", iterations);
            break;
        };

        std::mem::swap(&mut r, &mut r_trial);
        chi2 = c;
        lambda = (lambda / 10.0).max(1e-12);
        let done = step_converged(&dx, &trial, tol);
        p = trial;
        if done {
            converged = true;
            break;
        }
    }

    problem.jacobian(p.as_slice(), &mut j);
    let covariance = if m > n {
        j.tr_mul(&j).try_inverse().map(|cov| {
            let scale = (chi2 / (m - n) as f64).max(1.0);
            cov * scale
        })
    } else {
        None
    };

    Some(LmOutcome {
        params: p,
        chi2,
        iterations,
        converged,
        covariance,
    })
}
