//! Similar-triangle voting.
//!
//! A triangle is described by its side ratios `(b/a, c/a)` with
//! `a >= b >= c`, which are invariant under rotation, uniform scale,
//! translation and mirroring. Each vertex is labelled by the side opposite
//! it, so two similar triangles put their vertices in correspondence. Every
//! pair of similar triangles casts one vote for each of its three vertex
//! pairs; true correspondences collect votes from many triangles while
//! chance alignments stay scattered.

/// Triangles whose shortest side is below this fraction of the longest are
/// skipped: their shape is dominated by position noise.
const MIN_SHAPE_RATIO: f64 = 0.05;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Triangle {
    /// Vertices opposite the longest, middle and shortest side.
    pub vertices: [usize; 3],
    /// `b / a`
    pub r1: f64,
    /// `c / a`
    pub r2: f64,
    /// `a`
    pub longest: f64,
}

impl Triangle {
    fn new(points: &[(f64, f64)], [i, j, k]: [usize; 3]) -> Option<Self> {
        let dist = |p: usize, q: usize| {
            let (a, b) = (points[p], points[q]);
            (a.0 - b.0).hypot(a.1 - b.1)
        };
        let mut sides = [(dist(j, k), i), (dist(i, k), j), (dist(i, j), k)];
        sides.sort_by(|x, y| y.0.total_cmp(&x.0));
        let [(a, va), (b, vb), (c, vc)] = sides;
        if !(a > 0.0) || c / a < MIN_SHAPE_RATIO {
            return None;
        }
        Some(Self {
            vertices: [va, vb, vc],
            r1: b / a,
            r2: c / a,
            longest: a,
        })
    }
}

/// All usable triangles among the first `n` points.
pub(crate) fn build(points: &[(f64, f64)], n: usize) -> Vec<Triangle> {
    let n = n.min(points.len());
    (0..n)
        .flat_map(|i| (i + 1..n).flat_map(move |j| (j + 1..n).map(move |k| [i, j, k])))
        .filter_map(|combo| Triangle::new(points, combo))
        .collect()
}

/// Vote matrix, `n_img × n_cat` in row-major order.
pub(crate) struct Votes {
    pub n_img: usize,
    pub n_cat: usize,
    pub counts: Vec<u32>,
    /// Number of similar triangle pairs found.
    pub similar: usize,
}

impl Votes {
    #[inline]
    pub fn get(&self, i: usize, j: usize) -> u32 {
        self.counts[i * self.n_cat + j]
    }

    /// Unique `(img, cat)` pairs in decreasing vote order, each star used at
    /// most once, keeping only pairs with at least `min_votes`.
    pub fn greedy_pairs(&self, min_votes: u32) -> Vec<(usize, usize, u32)> {
        let mut all: Vec<(usize, usize, u32)> = (0..self.n_img)
            .flat_map(|i| (0..self.n_cat).map(move |j| (i, j)))
            .filter_map(|(i, j)| {
                let v = self.get(i, j);
                (v >= min_votes).then_some((i, j, v))
            })
            .collect();
        all.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)).then(a.1.cmp(&b.1)));

        let mut used_img = vec![false; self.n_img];
        let mut used_cat = vec![false; self.n_cat];
        let mut out = Vec::new();
        for (i, j, v) in all {
            if !used_img[i] && !used_cat[j] {
                used_img[i] = true;
                used_cat[j] = true;
                out.push((i, j, v));
            }
        }
        out
    }

    pub fn max(&self) -> u32 {
        self.counts.iter().copied().max().unwrap_or(0)
    }
}

/// Compare every image triangle with every catalog triangle of similar
/// shape. `scale` bounds the ratio `catalog side / image side`.
pub(crate) fn vote(
    img: &[Triangle],
    cat: &[Triangle],
    n_img: usize,
    n_cat: usize,
    tolerance: f64,
    scale: (Option<f64>, Option<f64>),
) -> Votes {
    let mut sorted: Vec<&Triangle> = cat.iter().collect();
    sorted.sort_by(|a, b| a.r1.total_cmp(&b.r1));

    let mut votes = Votes {
        n_img,
        n_cat,
        counts: vec![0; n_img * n_cat],
        similar: 0,
    };
    let in_scale = |s: f64| scale.0.is_none_or(|lo| s >= lo) && scale.1.is_none_or(|hi| s <= hi);

    for t in img {
        let start = sorted.partition_point(|c| c.r1 < t.r1 - tolerance);
        for c in sorted[start..].iter().take_while(|c| c.r1 <= t.r1 + tolerance) {
            if (c.r2 - t.r2).abs() > tolerance || !in_scale(c.longest / t.longest) {
                continue;
            }
            votes.similar += 1;
            for (&vi, &vc) in t.vertices.iter().zip(&c.vertices) {
                votes.counts[vi * n_cat + vc] += 1;
            }
        }
    }
    votes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triangle_invariants() {
        let pts = [(0.0, 0.0), (4.0, 0.0), (0.0, 3.0)];
        let t = Triangle::new(&pts, [0, 1, 2]).unwrap();
        // sides 5, 4, 3 are opposite vertices 0, 2, 1
        assert_eq!(t.vertices, [0, 2, 1]);
        assert!((t.r1 - 0.8).abs() < 1e-12);
        assert!((t.r2 - 0.6).abs() < 1e-12);

        // rotated, scaled, mirrored copy
        let moved: Vec<(f64, f64)> = pts.iter().map(|&(x, y)| (2.0 * y + 10.0, 2.0 * x)).collect();
        let m = Triangle::new(&moved, [0, 1, 2]).unwrap();
        assert_eq!(m.vertices, t.vertices);
        assert!((m.r1 - t.r1).abs() < 1e-12 && (m.r2 - t.r2).abs() < 1e-12);
        assert!((m.longest - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_sliver_skipped() {
        let pts = [(0.0, 0.0), (100.0, 0.0), (2.0, 0.1)];
        assert!(Triangle::new(&pts, [0, 1, 2]).is_none());
    }

    #[test]
    fn test_build_counts() {
        let pts = [(0.0, 0.0), (10.0, 1.0), (3.0, 7.0), (8.0, 9.0)];
        assert_eq!(build(&pts, 4).len(), 4);
        assert_eq!(build(&pts, 9).len(), 4);
        assert_eq!(build(&pts, 3).len(), 1);
        assert!(build(&pts, 2).is_empty());
    }

    #[test]
    fn test_votes_pick_identity() {
        let pts = vec![(0.0, 0.0), (10.0, 1.0), (3.0, 7.0), (8.0, 9.0), (-4.0, 5.0)];
        let tris = build(&pts, pts.len());
        let votes = vote(&tris, &tris, 5, 5, 1e-6, (None, None));
        let pairs = votes.greedy_pairs(1);
        assert_eq!(pairs.len(), 5);
        assert!(pairs.iter().all(|&(i, j, _)| i == j));
    }

    #[test]
    fn test_scale_bounds_filter() {
        let pts = vec![(0.0, 0.0), (10.0, 1.0), (3.0, 7.0), (8.0, 9.0)];
        let big: Vec<(f64, f64)> = pts.iter().map(|&(x, y)| (3.0 * x, 3.0 * y)).collect();
        let (ti, tc) = (build(&pts, 4), build(&big, 4));
        assert!(vote(&ti, &tc, 4, 4, 1e-6, (Some(2.9), Some(3.1))).similar > 0);
        assert_eq!(vote(&ti, &tc, 4, 4, 1e-6, (Some(0.9), Some(1.1))).similar, 0);
    }
}
