//! Ordered list of matching attempts.
//!
//! Each candidate pool size is tried first with the scale constrained to
//! the nominal plate scale, then unconstrained. Once both fail the pool is
//! widened by `candidate_step`. The ladder ends at `max_attempts` (never more
//! than [`MAX_ATTEMPTS`]) or once the pool already covers every star.

/// Hard bound on the number of matching attempts in one solve.
pub const MAX_ATTEMPTS: usize = 10;

/// One rung of the ladder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attempt {
    /// Brightest stars per list used for triangle voting.
    pub n_candidates: usize,
    /// `(min, max)` plate scale in arcsec/pixel, or `None` for unconstrained.
    pub scale: Option<(f64, f64)>,
}

pub(crate) fn ladder(
    n_candidates: usize,
    candidate_step: usize,
    available: usize,
    nominal_scale: f64,
    scale_tolerance: f64,
    max_attempts: usize,
) -> Vec<Attempt> {
    let max_attempts = max_attempts.clamp(1, MAX_ATTEMPTS);
    let bounds = (nominal_scale * (1.0 - scale_tolerance), nominal_scale * (1.0 + scale_tolerance));
    let constrained = bounds.0 > 0.0 && bounds.1.is_finite();

    let mut out = Vec::with_capacity(max_attempts);
    let mut n = n_candidates.max(3);
    loop {
        if constrained {
            out.push(Attempt {
                n_candidates: n,
                scale: Some(bounds),
            });
        }
        out.push(Attempt {
            n_candidates: n,
            scale: None,
        });
        if out.len() >= max_attempts || n >= available || candidate_step == 0 {
            break;
        }
        n += candidate_step;
    }
    out.truncate(max_attempts);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progression() {
        let l = ladder(20, 10, 100, 2.0, 0.1, 10);
        assert_eq!(l.len(), 10);
        assert_eq!(l[0].n_candidates, 20);
        let (lo, hi) = l[0].scale.unwrap();
        assert!((lo - 1.8).abs() < 1e-12 && (hi - 2.2).abs() < 1e-12);
        assert_eq!(l[1], Attempt { n_candidates: 20, scale: None });
        assert_eq!(l[2].n_candidates, 30);
        assert!(l[2].scale.is_some());
        assert_eq!(l[9], Attempt { n_candidates: 60, scale: None });
    }

    #[test]
    fn test_bounded() {
        assert_eq!(ladder(20, 1, 10_000, 2.0, 0.1, 50).len(), MAX_ATTEMPTS);
        assert_eq!(ladder(20, 1, 10_000, 2.0, 0.1, 0).len(), 1);
    }

    #[test]
    fn test_stops_when_pool_covers_all_stars() {
        let l = ladder(20, 10, 25, 2.0, 0.1, 10);
        assert_eq!(l.len(), 4);
        assert_eq!(l[3].n_candidates, 30);
    }

    #[test]
    fn test_unknown_scale_skips_constrained_rungs() {
        let l = ladder(20, 10, 100, 0.0, 0.1, 4);
        assert!(l.iter().all(|a| a.scale.is_none()));
        assert_eq!(
            l.iter().map(|a| a.n_candidates).collect::<Vec<_>>(),
            vec![20, 30, 40, 50]
        );
    }
}
