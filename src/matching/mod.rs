//! Star list matching.
//!
//! [`match_stars`] registers a list of detected image positions against a
//! list of reference positions (normally catalog stars projected onto the
//! tangent plane) and returns the fitted transform from the first to the
//! second. Both lists must be sorted brightest first.
//!
//! ## Algorithm
//!
//! 1. Build all triangles among the `n_candidates` brightest stars of each
//!    list and vote for vertex correspondences between similar triangles
//!    (see [`triangles`]).
//! 2. Take unique pairs in decreasing vote order as seeds.
//! 3. Fit the transform to the seeds, dropping the worst pair while its
//!    residual is an outlier.
//! 4. Re-associate every star in both lists by nearest neighbour under that
//!    transform, and fit and clip again on the full set.
//!
//! The seed fit and the final fit must both have an RMS residual within the
//! association radius (`recovery_radius_px` source units). Coincidental
//! alignments from the voting fail this and are reported as
//! [`MatchError::NoConsistentMatch`].

mod transform;
mod triangles;

use tracing::debug;

use crate::error::MatchError;

pub use transform::TransformKind;
use transform::Mat3;

/// MAD → σ for Gaussian residuals.
const MAD_SCALE: f64 = 1.4826;

/// Residuals below this many source units are never clipped.
const CLIP_FLOOR: f64 = 0.05;

/// Parameters for [`match_stars`].
#[derive(Debug, Clone)]
pub struct MatchConfig {
    /// Number of brightest stars from each list used for triangle voting.
    /// Default: 20.
    pub n_candidates: usize,
    /// Fewest accepted pairs for a match. Also the fewest stars either list
    /// must hold. Default: 5.
    pub min_pairs: usize,
    /// Bounds on the transform scale (reference units per source unit).
    /// `None` means unconstrained. Default: None.
    pub scale_min: Option<f64>,
    pub scale_max: Option<f64>,
    /// Transform family to fit. Default: Affine.
    pub transform: TransformKind,
    /// Maximum difference in each triangle side ratio for two triangles to
    /// count as similar. Default: 0.005.
    pub ratio_tolerance: f64,
    /// Outlier threshold in robust standard deviations. Default: 3.0.
    pub clip_sigma: f64,
    /// Association radius for the re-matching pass, in source units. Also
    /// the largest RMS residual a match may have. Default: 2.5.
    pub recovery_radius_px: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            n_candidates: 20,
            min_pairs: 5,
            scale_min: None,
            scale_max: None,
            transform: TransformKind::Affine,
            ratio_tolerance: 0.005,
            clip_sigma: 3.0,
            recovery_radius_px: 2.5,
        }
    }
}

/// A fitted transform from source (image) to reference (catalog) positions.
#[derive(Debug, Clone, PartialEq)]
pub struct Homography {
    /// Homogeneous 3×3 matrix, `h[2][2] == 1`.
    pub h: [[f64; 3]; 3],
    pub kind: TransformKind,
    /// Accepted `(source index, reference index)` pairs.
    pub pairs: Vec<(usize, usize)>,
    /// Pairs that entered the final fit.
    pub pair_count: usize,
    /// Pairs that survived outlier rejection (`pairs.len()`).
    pub inlier_count: usize,
    /// RMS residual of the inliers, reference units.
    pub rms: f64,
}

impl Homography {
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        transform::apply(&self.h, x, y)
    }

    /// Linear part at the origin, `[[b, c], [e, f]]`.
    pub fn linear(&self) -> [[f64; 2]; 2] {
        [[self.h[0][0], self.h[0][1]], [self.h[1][0], self.h[1][1]]]
    }

    pub fn translation(&self) -> (f64, f64) {
        (self.h[0][2], self.h[1][2])
    }

    pub fn determinant(&self) -> f64 {
        let l = self.linear();
        l[0][0] * l[1][1] - l[0][1] * l[1][0]
    }

    /// Geometric-mean scale of the linear part.
    pub fn scale(&self) -> f64 {
        scale_of(&self.h)
    }

    /// Whether the transform includes a mirror flip.
    pub fn is_flipped(&self) -> bool {
        self.determinant() < 0.0
    }

    /// Refit the same kind of transform with the correspondences unchanged
    /// but the positions moved. `source[k]` and `reference[k]` are the new
    /// positions of the `k`-th accepted pair.
    pub fn refit(
        &self,
        source: &[(f64, f64)],
        reference: &[(f64, f64)],
    ) -> Result<Homography, MatchError> {
        if source.len() != self.pairs.len() || reference.len() != self.pairs.len() {
            return Err(MatchError::Degenerate(format!(
                "refit expects {} pairs, got {} and {}",
                self.pairs.len(),
                source.len(),
                reference.len()
            )));
        }
        let h = transform::fit(self.kind, source, reference)
            .ok_or_else(|| MatchError::Degenerate("refit on matched pairs is singular".into()))?;
        Ok(Homography {
            h,
            rms: rms(&h, source, reference),
            ..self.clone()
        })
    }
}

fn gather(
    source: &[(f64, f64)],
    reference: &[(f64, f64)],
    pairs: &[(usize, usize)],
) -> (Vec<(f64, f64)>, Vec<(f64, f64)>) {
    pairs.iter().map(|&(i, j)| (source[i], reference[j])).unzip()
}

fn residuals(h: &Mat3, src: &[(f64, f64)], dst: &[(f64, f64)]) -> Vec<f64> {
    src.iter()
        .zip(dst)
        .map(|(&(x, y), &(u, v))| {
            let (px, py) = transform::apply(h, x, y);
            (px - u).hypot(py - v)
        })
        .collect()
}

fn rms(h: &Mat3, src: &[(f64, f64)], dst: &[(f64, f64)]) -> f64 {
    let r = residuals(h, src, dst);
    if r.is_empty() {
        return 0.0;
    }
    (r.iter().map(|v| v * v).sum::<f64>() / r.len() as f64).sqrt()
}

fn scale_of(h: &Mat3) -> f64 {
    (h[0][0] * h[1][1] - h[0][1] * h[1][0]).abs().sqrt()
}

fn median(sorted: &[f64]) -> f64 {
    sorted[sorted.len() / 2]
}

/// Fit `kind` to `pairs`, removing the worst pair while it lies beyond
/// `median + clip_sigma · σ_MAD` of the residuals.
fn fit_clipped(
    kind: TransformKind,
    source: &[(f64, f64)],
    reference: &[(f64, f64)],
    mut pairs: Vec<(usize, usize)>,
    clip_sigma: f64,
) -> Result<(Mat3, Vec<(usize, usize)>), MatchError> {
    loop {
        let (src, dst) = gather(source, reference, &pairs);
        let h = transform::fit(kind, &src, &dst).ok_or_else(|| {
            MatchError::Degenerate(format!("{:?} fit on {} pairs is singular", kind, pairs.len()))
        })?;
        if pairs.len() <= kind.min_points() + 1 {
            return Ok((h, pairs));
        }

        let res = residuals(&h, &src, &dst);
        let mut sorted = res.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let med = median(&sorted);
        let mut dev: Vec<f64> = sorted.iter().map(|r| (r - med).abs()).collect();
        dev.sort_by(|a, b| a.total_cmp(b));
        let threshold = (med + clip_sigma * MAD_SCALE * median(&dev)).max(CLIP_FLOOR * scale_of(&h));

        let (worst, &worst_res) = res
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .ok_or_else(|| MatchError::Degenerate("no pairs".into()))?;
        if worst_res <= threshold {
            return Ok((h, pairs));
        }
        pairs.remove(worst);
    }
}

/// Greedy one-to-one nearest-neighbour association within `radius`.
fn associate(
    h: &Mat3,
    source: &[(f64, f64)],
    reference: &[(f64, f64)],
    radius: f64,
) -> Vec<(usize, usize)> {
    let r2 = radius * radius;
    let mut candidates: Vec<(f64, usize, usize)> = Vec::new();
    for (i, &(x, y)) in source.iter().enumerate() {
        let (px, py) = transform::apply(h, x, y);
        for (j, &(u, v)) in reference.iter().enumerate() {
            let d2 = (px - u).powi(2) + (py - v).powi(2);
            if d2 <= r2 {
                candidates.push((d2, i, j));
            }
        }
    }
    candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut used_src = vec![false; source.len()];
    let mut used_ref = vec![false; reference.len()];
    let mut pairs = Vec::new();
    for (_, i, j) in candidates {
        if !used_src[i] && !used_ref[j] {
            used_src[i] = true;
            used_ref[j] = true;
            pairs.push((i, j));
        }
    }
    pairs.sort_unstable();
    pairs
}

/// Find the transform carrying `detected` onto `catalog`.
///
/// Fails with [`MatchError::TooFewStars`] before any search if either list
/// holds fewer than `config.min_pairs` stars, with
/// [`MatchError::NoConsistentMatch`] if the voting finds no consistent set of
/// pairs within the scale bounds and the association radius, and with [`MatchError::Degenerate`] if the
/// matched pairs do not determine a transform.
pub fn match_stars(
    detected: &[(f64, f64)],
    catalog: &[(f64, f64)],
    config: &MatchConfig,
) -> Result<Homography, MatchError> {
    let kind = config.transform;
    let required = config.min_pairs.max(kind.min_points() + 1);
    let found = detected.len().min(catalog.len());
    if found < required {
        return Err(MatchError::TooFewStars { found, required });
    }

    let n_img = config.n_candidates.min(detected.len());
    let n_cat = config.n_candidates.min(catalog.len());
    let img_tris = triangles::build(detected, n_img);
    let cat_tris = triangles::build(catalog, n_cat);
    let votes = triangles::vote(
        &img_tris,
        &cat_tris,
        n_img,
        n_cat,
        config.ratio_tolerance,
        (config.scale_min, config.scale_max),
    );
    let best = votes.max();
    let seeds = votes.greedy_pairs((best / 4).max(2));
    debug!(
        "match: {} x {} triangles, {} similar, best vote {}, {} seed pairs",
        img_tris.len(),
        cat_tris.len(),
        votes.similar,
        best,
        seeds.len()
    );
    if seeds.len() < kind.min_points() + 1 {
        return Err(MatchError::NoConsistentMatch(format!(
            "{} seed pairs from triangle voting (best vote {})",
            seeds.len(),
            best
        )));
    }

    let seeds: Vec<(usize, usize)> = seeds.iter().map(|&(i, j, _)| (i, j)).collect();
    let (h, kept) = fit_clipped(kind, detected, catalog, seeds, config.clip_sigma)?;
    let scale = scale_of(&h);
    let (src, dst) = gather(detected, catalog, &kept);
    let seed_rms = rms(&h, &src, &dst);
    debug!(
        "match: seed fit on {} pairs, scale {:.6}, rms {:.3e}",
        kept.len(),
        scale,
        seed_rms
    );

    let radius = config.recovery_radius_px * scale;
    if !(seed_rms <= radius) {
        return Err(MatchError::NoConsistentMatch(format!(
            "seed fit rms {:.3e} exceeds association radius {:.3e}",
            seed_rms, radius
        )));
    }
    let candidates = associate(&h, detected, catalog, radius);
    let pair_count = candidates.len();
    if pair_count < required {
        return Err(MatchError::NoConsistentMatch(format!(
            "only {} stars associate within {:.3} of the seed transform",
            pair_count, radius
        )));
    }
    let (h, pairs) = fit_clipped(kind, detected, catalog, candidates, config.clip_sigma)?;

    let result = {
        let (src, dst) = gather(detected, catalog, &pairs);
        Homography {
            h,
            kind,
            rms: rms(&h, &src, &dst),
            pair_count,
            inlier_count: pairs.len(),
            pairs,
        }
    };

    if result.inlier_count < required {
        return Err(MatchError::NoConsistentMatch(format!(
            "{} inliers, {} required",
            result.inlier_count, required
        )));
    }
    let s = result.scale();
    if !(result.rms <= config.recovery_radius_px * s) {
        return Err(MatchError::NoConsistentMatch(format!(
            "inlier rms {:.3e} exceeds association radius {:.3e}",
            result.rms,
            config.recovery_radius_px * s
        )));
    }
    if config.scale_min.is_some_and(|lo| s < lo) || config.scale_max.is_some_and(|hi| s > hi) {
        return Err(MatchError::NoConsistentMatch(format!(
            "fitted scale {:.6} outside bounds",
            s
        )));
    }

    debug!(
        "match: {} of {} pairs accepted, scale {:.6}, rms {:.3e}",
        result.inlier_count, result.pair_count, s, result.rms
    );
    Ok(result)
}
