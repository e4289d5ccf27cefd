//! Least-squares fits of planar transforms to point correspondences.
//!
//! Every fit returns a 3×3 matrix in homogeneous form, normalized so that
//! `h[2][2] == 1`. Similarity and affine fits leave the bottom row `[0, 0, 1]`.

use nalgebra::{Matrix3, SMatrix, SymmetricEigen};

/// Which family of transforms the matcher fits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformKind {
    /// Rotation, uniform scale and translation (4 parameters). Both mirror
    /// parities are tried and the better one kept.
    Similarity,
    /// Full linear part plus translation (6 parameters).
    Affine,
    /// Projective transform (8 parameters).
    Homography,
}

impl TransformKind {
    /// Fewest correspondences that determine the transform.
    pub fn min_points(self) -> usize {
        match self {
            TransformKind::Similarity => 2,
            TransformKind::Affine => 3,
            TransformKind::Homography => 4,
        }
    }
}

pub(crate) type Mat3 = [[f64; 3]; 3];

/// Apply `h` to `(x, y)`.
#[inline]
pub(crate) fn apply(h: &Mat3, x: f64, y: f64) -> (f64, f64) {
    let w = h[2][0] * x + h[2][1] * y + h[2][2];
    (
        (h[0][0] * x + h[0][1] * y + h[0][2]) / w,
        (h[1][0] * x + h[1][1] * y + h[1][2]) / w,
    )
}

/// Fit `kind` mapping `src[i]` onto `dst[i]`. `None` when the points are
/// too few or degenerate (coincident or collinear).
pub(crate) fn fit(kind: TransformKind, src: &[(f64, f64)], dst: &[(f64, f64)]) -> Option<Mat3> {
    debug_assert_eq!(src.len(), dst.len());
    if src.len() < kind.min_points() {
        return None;
    }
    let h = match kind {
        TransformKind::Similarity => fit_similarity(src, dst)?,
        TransformKind::Affine => fit_affine(src, dst)?,
        TransformKind::Homography => fit_homography(src, dst)?,
    };
    h.iter().flatten().all(|v| v.is_finite()).then_some(h)
}

fn centroid(pts: &[(f64, f64)]) -> (f64, f64) {
    let n = pts.len() as f64;
    let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
    (sx / n, sy / n)
}

fn sum_sq_error(h: &Mat3, src: &[(f64, f64)], dst: &[(f64, f64)]) -> f64 {
    src.iter()
        .zip(dst)
        .map(|(&(x, y), &(u, v))| {
            let (px, py) = apply(h, x, y);
            (px - u).powi(2) + (py - v).powi(2)
        })
        .sum()
}

// ── Similarity ──────────────────────────────────────────────────────────────

fn fit_similarity(src: &[(f64, f64)], dst: &[(f64, f64)]) -> Option<Mat3> {
    let (mx, my) = centroid(src);
    let (nx, ny) = centroid(dst);

    // parity = +1: q = [[a, -b], [b, a]] p, parity = -1: q = [[a, b], [b, -a]] p
    let solve = |parity: f64| -> Option<Mat3> {
        let (mut spp, mut sa, mut sb) = (0.0, 0.0, 0.0);
        for (&(x, y), &(u, v)) in src.iter().zip(dst) {
            let (px, py) = (x - mx, parity * (y - my));
            let (qx, qy) = (u - nx, v - ny);
            spp += px * px + py * py;
            sa += px * qx + py * qy;
            sb += px * qy - py * qx;
        }
        if spp < 1e-30 {
            return None;
        }
        let (a, b) = (sa / spp, sb / spp);
        let l = [[a, -b * parity], [b, a * parity]];
        Some([
            [l[0][0], l[0][1], nx - l[0][0] * mx - l[0][1] * my],
            [l[1][0], l[1][1], ny - l[1][0] * mx - l[1][1] * my],
            [0.0, 0.0, 1.0],
        ])
    };

    match (solve(1.0), solve(-1.0)) {
        (Some(direct), Some(mirrored)) => {
            if sum_sq_error(&mirrored, src, dst) < sum_sq_error(&direct, src, dst) {
                Some(mirrored)
            } else {
                Some(direct)
            }
        }
        (direct, mirrored) => direct.or(mirrored),
    }
}

// ── Affine ──────────────────────────────────────────────────────────────────

/// Two independent 3-parameter least-squares problems sharing the design
/// matrix `[x, y, 1]`, with `x, y` taken relative to the source centroid.
fn fit_affine(src: &[(f64, f64)], dst: &[(f64, f64)]) -> Option<Mat3> {
    let (mx, my) = centroid(src);
    let mut ata = [[0.0f64; 3]; 3];
    let mut atu = [0.0f64; 3];
    let mut atv = [0.0f64; 3];
    for (&(x, y), &(u, v)) in src.iter().zip(dst) {
        let row = [x - mx, y - my, 1.0];
        for i in 0..3 {
            for j in 0..3 {
                ata[i][j] += row[i] * row[j];
            }
            atu[i] += row[i] * u;
            atv[i] += row[i] * v;
        }
    }
    let su = solve_3x3(&ata, &atu)?;
    let sv = solve_3x3(&ata, &atv)?;
    Some([
        [su[0], su[1], su[2] - su[0] * mx - su[1] * my],
        [sv[0], sv[1], sv[2] - sv[0] * mx - sv[1] * my],
        [0.0, 0.0, 1.0],
    ])
}

/// Solve `Ax = b` by Gaussian elimination with partial pivoting.
/// `None` if `A` is singular to working precision.
pub(crate) fn solve_3x3(a: &[[f64; 3]; 3], b: &[f64; 3]) -> Option<[f64; 3]> {
    let mut m = *a;
    let mut rhs = *b;
    let scale = a.iter().flatten().fold(0.0f64, |acc, v| acc.max(v.abs()));
    let eps = 1e-14 * scale.max(1e-300);

    for col in 0..3 {
        let pivot_row = (col..3)
            .max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))
            .unwrap_or(col);
        if m[pivot_row][col].abs() <= eps {
            return None;
        }
        m.swap(col, pivot_row);
        rhs.swap(col, pivot_row);

        for row in (col + 1)..3 {
            let f = m[row][col] / m[col][col];
            for j in col..3 {
                m[row][j] -= f * m[col][j];
            }
            rhs[row] -= f * rhs[col];
        }
    }

    let mut x = [0.0f64; 3];
    for i in (0..3).rev() {
        let tail: f64 = ((i + 1)..3).map(|j| m[i][j] * x[j]).sum();
        x[i] = (rhs[i] - tail) / m[i][i];
    }
    Some(x)
}

// ── Homography ──────────────────────────────────────────────────────────────

/// Similarity normalization moving the centroid to the origin with mean
/// distance √2. Returns the normalizing matrix and its inverse.
fn hartley(pts: &[(f64, f64)]) -> Option<(Matrix3<f64>, Matrix3<f64>)> {
    let (mx, my) = centroid(pts);
    let mean_dist =
        pts.iter().map(|&(x, y)| (x - mx).hypot(y - my)).sum::<f64>() / pts.len() as f64;
    if mean_dist < 1e-30 {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    let t = Matrix3::new(s, 0.0, -s * mx, 0.0, s, -s * my, 0.0, 0.0, 1.0);
    let t_inv = Matrix3::new(1.0 / s, 0.0, mx, 0.0, 1.0 / s, my, 0.0, 0.0, 1.0);
    Some((t, t_inv))
}

/// Normalized direct linear transform: the null vector of the stacked
/// constraint matrix, taken as the eigenvector of `AᵀA` with the smallest
/// eigenvalue.
fn fit_homography(src: &[(f64, f64)], dst: &[(f64, f64)]) -> Option<Mat3> {
    let (tp, _) = hartley(src)?;
    let (tq, tq_inv) = hartley(dst)?;

    let mut ata = SMatrix::<f64, 9, 9>::zeros();
    for (&(x, y), &(u, v)) in src.iter().zip(dst) {
        let (x, y) = (
            tp[(0, 0)] * x + tp[(0, 2)],
            tp[(1, 1)] * y + tp[(1, 2)],
        );
        let (u, v) = (
            tq[(0, 0)] * u + tq[(0, 2)],
            tq[(1, 1)] * v + tq[(1, 2)],
        );
        let rows = [
            [-x, -y, -1.0, 0.0, 0.0, 0.0, u * x, u * y, u],
            [0.0, 0.0, 0.0, -x, -y, -1.0, v * x, v * y, v],
        ];
        for r in &rows {
            for i in 0..9 {
                for j in 0..9 {
                    ata[(i, j)] += r[i] * r[j];
                }
            }
        }
    }

    let eig = SymmetricEigen::new(ata);
    let (k, _) = eig
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let h = eig.eigenvectors.column(k);
    let hn = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let full = tq_inv * hn * tp;
    let w = full[(2, 2)];
    if w.abs() < 1e-15 {
        return None;
    }
    let full = full / w;
    Some(std::array::from_fn(|r| std::array::from_fn(|c| full[(r, c)])))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> Vec<(f64, f64)> {
        (0..5)
            .flat_map(|i| (0..4).map(move |j| (i as f64 * 37.0 - 50.0, j as f64 * 23.0 + 10.0)))
            .collect()
    }

    fn map(h: &Mat3, pts: &[(f64, f64)]) -> Vec<(f64, f64)> {
        pts.iter().map(|&(x, y)| apply(h, x, y)).collect()
    }

    fn assert_close(a: &Mat3, b: &Mat3, tol: f64) {
        for r in 0..3 {
            for c in 0..3 {
                assert!((a[r][c] - b[r][c]).abs() < tol, "{a:?} vs {b:?}");
            }
        }
    }

    #[test]
    fn test_affine_exact() {
        let h = [[1.2, 0.1, 5.0], [-0.05, 0.9, -3.0], [0.0, 0.0, 1.0]];
        let src = grid();
        let fitted = fit(TransformKind::Affine, &src, &map(&h, &src)).unwrap();
        assert_close(&fitted, &h, 1e-9);
    }

    #[test]
    fn test_similarity_both_parities() {
        let (s, c) = (0.3f64.sin() * 2.0, 0.3f64.cos() * 2.0);
        let direct = [[c, -s, 7.0], [s, c, 1.0], [0.0, 0.0, 1.0]];
        let mirrored = [[c, s, 7.0], [s, -c, 1.0], [0.0, 0.0, 1.0]];
        let src = grid();
        for h in [direct, mirrored] {
            let fitted = fit(TransformKind::Similarity, &src, &map(&h, &src)).unwrap();
            assert_close(&fitted, &h, 1e-9);
        }
    }

    #[test]
    fn test_homography_exact() {
        let h = [[1.1, 0.02, 4.0], [0.01, 0.95, -2.0], [1e-4, -2e-4, 1.0]];
        let src = grid();
        let fitted = fit(TransformKind::Homography, &src, &map(&h, &src)).unwrap();
        assert_close(&fitted, &h, 1e-6);
    }

    #[test]
    fn test_degenerate_points() {
        let same = vec![(1.0, 1.0); 6];
        assert!(fit(TransformKind::Affine, &same, &same).is_none());
        assert!(fit(TransformKind::Similarity, &same, &same).is_none());
        let line: Vec<(f64, f64)> = (0..6).map(|i| (i as f64, 2.0 * i as f64)).collect();
        assert!(fit(TransformKind::Affine, &line, &line).is_none());
        assert!(fit(TransformKind::Affine, &line[..2], &line[..2]).is_none());
    }

    #[test]
    fn test_solve_3x3() {
        let a = [[2.0, 1.0, -1.0], [-3.0, -1.0, 2.0], [-2.0, 1.0, 2.0]];
        let x = solve_3x3(&a, &[8.0, -11.0, -3.0]).unwrap();
        assert!((x[0] - 2.0).abs() < 1e-12);
        assert!((x[1] - 3.0).abs() < 1e-12);
        assert!((x[2] + 1.0).abs() < 1e-12);
    }
}
