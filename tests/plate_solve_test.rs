//! Plate solving against synthetic star fields: build a catalog on the
//! tangent plane around a known centre, map it into an image through a known
//! rotation, scale and shift, and check the solver recovers that mapping.

use std::ops::{ControlFlow, Range};

use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use rand_distr::{Distribution, Normal};
use starplate::projection::separation_deg;
use starplate::solver::{Attempt, MAX_ATTEMPTS};
use starplate::{
    deproject, project, solve_plate, solve_plate_with, CatalogStar, DetectedStar, MatchError,
    PlaneUnits, PlateSolution, SkyPoint, SolveConfig, SolveError, SolveStage,
};

const WIDTH: u32 = 1000;
const HEIGHT: u32 = 800;
const FOCAL_MM: f64 = 400.0;
const PIXEL_UM: f64 = 3.76;
const CENTER: (f64, f64) = (83.8, -5.4);

fn nominal_scale() -> f64 {
    206.264_806_247_096_36 * PIXEL_UM / FOCAL_MM
}

fn config() -> SolveConfig {
    SolveConfig::new(
        WIDTH,
        HEIGHT,
        SkyPoint::new(CENTER.0, CENTER.1),
        FOCAL_MM,
        PIXEL_UM,
    )
}

/// Deterministic, well separated offsets in pixels covering most of the frame.
/// Disjoint index ranges give unrelated star patterns.
fn scatter(range: Range<usize>) -> Vec<(f64, f64)> {
    range
        .map(|i| {
            let t = i as f64;
            (
                (t * 137.507_764).rem_euclid(940.0) - 470.0,
                (t * 73.133_71 + 31.0 * (t * 0.7).sin()).rem_euclid(740.0) - 370.0,
            )
        })
        .collect()
}

/// Catalog of `n` stars around `CENTER`, and their image positions under
/// `pixel = centre + scale · R(rot_deg) · (ξ, η) / s0 + shift`.
fn synthetic_field(
    n: usize,
    scale: f64,
    rot_deg: f64,
    shift: (f64, f64),
) -> (Vec<CatalogStar>, Vec<DetectedStar>) {
    let s0 = nominal_scale();
    let (s, c) = rot_deg.to_radians().sin_cos();
    let (rx, ry) = ((WIDTH as f64 - 1.0) / 2.0, (HEIGHT as f64 - 1.0) / 2.0);

    let mut catalog = Vec::new();
    let mut detected = Vec::new();
    for (i, (px, py)) in scatter(0..n).into_iter().enumerate() {
        let mag = 6.0 + 0.1 * i as f64;
        let (ra, dec) = deproject(px * s0, py * s0, CENTER.0, CENTER.1, PlaneUnits::Arcsec);
        catalog.push(CatalogStar::new(format!("S{i}"), ra, dec, mag));

        let (xi, eta) = project(ra, dec, CENTER.0, CENTER.1, PlaneUnits::Arcsec).unwrap();
        let (u, v) = (xi / s0, eta / s0);
        detected.push(DetectedStar {
            x: rx + scale * (c * u - s * v) + shift.0,
            y: ry + scale * (s * u + c * v) + shift.1,
            mag,
        });
    }
    (catalog, detected)
}

fn reference_pixel() -> (f64, f64) {
    ((WIDTH as f64 - 1.0) / 2.0, (HEIGHT as f64 - 1.0) / 2.0)
}

/// Detections at the reference pixel plus `scatter(range)`, none of them in
/// the catalog, with magnitudes from `mag0` in steps of 0.1.
fn unrelated_stars(range: Range<usize>, mag0: f64) -> Vec<DetectedStar> {
    let (rx, ry) = reference_pixel();
    scatter(range)
        .into_iter()
        .enumerate()
        .map(|(k, (px, py))| DetectedStar {
            x: rx + px,
            y: ry + py,
            mag: mag0 + 0.1 * k as f64,
        })
        .collect()
}

/// Solve while recording the matching attempts the observer sees.
fn solve_recording(
    detected: &[DetectedStar],
    catalog: &[CatalogStar],
    cfg: &SolveConfig,
) -> (Result<PlateSolution, SolveError>, Vec<(usize, Attempt)>) {
    let mut attempts = Vec::new();
    let result = solve_plate_with(detected, catalog, cfg, |stage| {
        if let SolveStage::Matching { attempt, rung } = stage {
            attempts.push((*attempt, *rung));
        }
        ControlFlow::Continue(())
    });
    (result, attempts)
}

/// Largest distance in arcsec between a star's catalog position and the
/// solution's sky position of its pixel.
fn max_residual_arcsec(sol: &PlateSolution, catalog: &[CatalogStar], detected: &[DetectedStar]) -> f64 {
    catalog
        .iter()
        .zip(detected)
        .map(|(cat, det)| {
            let (ra, dec) = sol.pixel_to_world(det.x, det.y).unwrap();
            separation_deg(SkyPoint::new(ra, dec), SkyPoint::new(cat.ra_deg, cat.dec_deg)) * 3600.0
        })
        .fold(0.0, f64::max)
}

#[test]
fn test_solve_synthetic_field() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

    let (catalog, detected) = synthetic_field(30, 1.0003, 0.5, (2.0, -3.0));
    let sol = solve_plate(&detected, &catalog, &config()).expect("solve failed");

    println!(
        "crval ({:.6}, {:.6}), scale {:.5}\"/px, rotation {:.4}°, {} stars, rms {:.2e}\"",
        sol.crval[0],
        sol.crval[1],
        sol.pixel_scale_arcsec,
        sol.rotation_deg(),
        sol.matched_stars,
        sol.rms_arcsec
    );

    assert!(sol.converged);
    assert!(!sol.flipped);
    assert_eq!(sol.matched_stars, 30);
    assert_eq!(sol.crpix, [500.5, 400.5]);
    // Catalog → image rotates by +0.5°, so the image axes sit at -0.5° on the sky.
    assert!((sol.rotation_deg() + 0.5).abs() < 0.01, "rotation {}", sol.rotation_deg());
    let expected_scale = nominal_scale() / 1.0003;
    assert!(((sol.pixel_scale_arcsec - expected_scale) / expected_scale).abs() < 1e-3);
    assert!(((sol.focal_length_mm - FOCAL_MM * 1.0003) / FOCAL_MM).abs() < 1e-3);
    assert!(sol.rms_arcsec < 1e-3);

    let worst = max_residual_arcsec(&sol, &catalog, &detected);
    assert!(worst < 0.01, "worst residual {worst}\"");

    // The shift puts the field centre a few arcsec away from CENTER.
    let offset = separation_deg(sol.crval_point(), SkyPoint::new(CENTER.0, CENTER.1)) * 3600.0;
    assert!(offset > 1.0 && offset < 20.0, "crval offset {offset}\"");

    for (cat, det) in catalog.iter().zip(&detected).take(5) {
        let (x, y) = sol.world_to_pixel(cat.ra_deg, cat.dec_deg).unwrap();
        assert!((x - det.x).abs() < 0.01 && (y - det.y).abs() < 0.01);
    }
}

#[test]
fn test_solve_reference_offset_converges() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

    let (catalog, detected) = synthetic_field(30, 1.0003, 0.5, (2.0, -3.0));
    let cfg = SolveConfig {
        reference_offset: (100.0, -50.0),
        ..config()
    };

    let mut stages = Vec::new();
    let sol = solve_plate_with(&detected, &catalog, &cfg, |stage| {
        stages.push(*stage);
        ControlFlow::Continue(())
    })
    .expect("solve failed");

    assert!(sol.converged);
    assert_eq!(sol.crpix, [600.5, 350.5]);
    assert!(matches!(stages[0], SolveStage::Matching { attempt: 1, .. }));
    let trials = stages
        .iter()
        .filter(|s| matches!(s, SolveStage::Converging { .. }))
        .count();
    assert!((1..20).contains(&trials), "{trials} refinement trials");

    let expected_scale = nominal_scale() / 1.0003;
    assert!(((sol.pixel_scale_arcsec - expected_scale) / expected_scale).abs() < 1e-3);
    assert!((sol.rotation_deg() + 0.5).abs() < 0.02);
    let worst = max_residual_arcsec(&sol, &catalog, &detected);
    assert!(worst < 0.05, "worst residual {worst}\"");

    // The reference pixel sees crval.
    let (ra, dec) = sol.pixel_to_world(599.5, 349.5).unwrap();
    assert!((ra - sol.crval[0]).abs() < 1e-10 && (dec - sol.crval[1]).abs() < 1e-10);
}

#[test]
fn test_solve_noisy_field_with_spurious_stars() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();

    let (catalog, clean) = synthetic_field(30, 1.0003, 0.5, (2.0, -3.0));
    let noise = Normal::new(0.0, 0.05).unwrap();

    for seed in [7u64, 42, 1234] {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut detected: Vec<DetectedStar> = clean
            .iter()
            .enumerate()
            .filter(|(i, _)| i % 7 != 3)
            .map(|(_, s)| DetectedStar {
                x: s.x + noise.sample(&mut rng),
                y: s.y + noise.sample(&mut rng),
                mag: s.mag,
            })
            .collect();
        detected.extend([
            DetectedStar { x: 40.0, y: 700.0, mag: 6.55 },
            DetectedStar { x: 900.0, y: 30.0, mag: 7.05 },
            DetectedStar { x: 480.0, y: 420.0, mag: 8.5 },
        ]);

        let sol = solve_plate(&detected, &catalog, &config()).expect("solve failed");
        assert!(sol.matched_stars >= 20, "seed {seed}: {} stars", sol.matched_stars);
        assert!(sol.candidate_pairs >= sol.matched_stars);
        assert!((sol.rotation_deg() + 0.5).abs() < 0.02, "seed {seed}: {}", sol.rotation_deg());
        let expected_scale = nominal_scale() / 1.0003;
        assert!(((sol.pixel_scale_arcsec - expected_scale) / expected_scale).abs() < 1e-3);
        assert!(sol.rms_arcsec < 0.5);
    }
}

#[test]
fn test_solve_mirrored_image() {
    let (catalog, detected) = synthetic_field(30, 1.0003, 0.5, (2.0, -3.0));
    let mirrored: Vec<DetectedStar> = detected
        .iter()
        .map(|s| DetectedStar {
            y: HEIGHT as f64 - 1.0 - s.y,
            ..s.clone()
        })
        .collect();

    let sol = solve_plate(&mirrored, &catalog, &config()).expect("solve failed");
    assert!(sol.flipped);
    assert_eq!(sol.matched_stars, 30);

    // Flipping rows back recovers the unmirrored solution.
    let upright = sol.flip_rows(HEIGHT);
    assert!(!upright.flipped);
    assert!((upright.rotation_deg() + 0.5).abs() < 0.01);
    assert!(max_residual_arcsec(&upright, &catalog, &detected) < 0.01);
}

#[test]
fn test_off_nominal_scale_solves_unconstrained() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();

    // True plate scale 2.6"/px against a nominal 1.94"/px: the first,
    // scale-constrained attempt only sees chance alignments.
    let true_scale = 2.6;
    let (s, c) = 0.3f64.to_radians().sin_cos();
    let (rx, ry) = reference_pixel();

    for seed in [2u64, 11, 29, 57, 101] {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut catalog = Vec::new();
        let mut detected = Vec::new();
        for i in 0..40 {
            let px = -440.0 + 880.0 * rng.random::<f64>();
            let py = -340.0 + 680.0 * rng.random::<f64>();
            let xi = true_scale * (c * px - s * py);
            let eta = true_scale * (s * px + c * py);
            let (ra, dec) = deproject(xi, eta, CENTER.0, CENTER.1, PlaneUnits::Arcsec);
            let mag = 5.0 + 0.1 * i as f64;
            catalog.push(CatalogStar::new(format!("R{i}"), ra, dec, mag));
            detected.push(DetectedStar { x: rx + px, y: ry + py, mag });
        }

        let (result, attempts) = solve_recording(&detected, &catalog, &config());
        let sol = result.expect("solve failed");
        assert_eq!(attempts.len(), 2, "seed {seed}: {attempts:?}");
        assert!(attempts[0].1.scale.is_some());
        assert!(attempts[1].1.scale.is_none());

        assert_eq!(sol.matched_stars, 40, "seed {seed}");
        assert!(((sol.pixel_scale_arcsec - true_scale) / true_scale).abs() < 1e-3);
        let worst = max_residual_arcsec(&sol, &catalog, &detected);
        assert!(worst < 0.01, "seed {seed}: worst residual {worst}\"");
    }
}

#[test]
fn test_bright_spurious_stars_widen_pool() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();

    let (catalog, mut detected) = synthetic_field(30, 1.0003, 0.5, (2.0, -3.0));
    let real = detected.clone();
    // Twenty detections brighter than any real star and absent from the catalog.
    detected.extend(unrelated_stars(500..520, 1.0));

    let (result, attempts) = solve_recording(&detected, &catalog, &config());
    let sol = result.expect("solve failed");
    let last = attempts.len();
    assert!(last >= 3, "solved at attempt {last}");
    assert!(last <= MAX_ATTEMPTS);
    assert!(attempts.iter().map(|a| a.0).eq(1..=last));
    assert!(attempts[last - 1].1.n_candidates > 20);

    assert!(sol.matched_stars >= 28, "{} stars", sol.matched_stars);
    assert!((sol.rotation_deg() + 0.5).abs() < 0.01);
    assert!(max_residual_arcsec(&sol, &catalog, &real) < 0.01);
}

#[test]
fn test_unrelated_catalog_exhausts_attempts() {
    let (catalog, _) = synthetic_field(30, 1.0, 0.0, (0.0, 0.0));
    let detected = unrelated_stars(1000..1030, 6.0);

    // One star more per widening: the ladder is cut at the attempt bound.
    let cfg = SolveConfig {
        candidate_step: 1,
        ..config()
    };
    let (result, attempts) = solve_recording(&detected, &catalog, &cfg);
    match result {
        Err(SolveError::MatchNotFound { attempts: n, last }) => {
            assert_eq!(n, MAX_ATTEMPTS);
            assert!(matches!(last, MatchError::NoConsistentMatch(_)), "{last}");
        }
        other => panic!("expected MatchNotFound, got {other:?}"),
    }
    assert_eq!(attempts.len(), MAX_ATTEMPTS);
    assert_eq!(attempts[0].1.n_candidates, 20);
    assert_eq!(attempts[MAX_ATTEMPTS - 1].1.n_candidates, 24);

    let cfg = SolveConfig {
        max_attempts: 3,
        ..cfg
    };
    let (result, attempts) = solve_recording(&detected, &catalog, &cfg);
    assert!(matches!(result, Err(SolveError::MatchNotFound { attempts: 3, .. })));
    assert_eq!(attempts.len(), 3);
}

#[test]
fn test_implausible_geometry_is_reported() {
    let (catalog, mut detected) = synthetic_field(30, 1.0, 0.0, (0.0, 0.0));
    // 0.3% pixel aspect: triangles still vote, the fit is not a rotation.
    let (_, ry) = reference_pixel();
    for s in &mut detected {
        s.y = ry + 1.003 * (s.y - ry);
    }

    let strict = SolveConfig {
        affine_tolerance: 0.001,
        ..config()
    };
    let (result, attempts) = solve_recording(&detected, &catalog, &strict);
    assert!(
        matches!(result, Err(SolveError::GeometricImplausibility(_))),
        "{result:?}"
    );
    assert_eq!(attempts.len(), 4);

    let sol = solve_plate(&detected, &catalog, &config()).expect("solve failed");
    assert_eq!(sol.matched_stars, 30);
}

#[test]
fn test_too_few_stars() {
    let (catalog, detected) = synthetic_field(30, 1.0, 0.0, (0.0, 0.0));
    let err = solve_plate(&detected[..4], &catalog, &config()).unwrap_err();
    assert!(matches!(err, SolveError::InsufficientData(_)), "{err}");

    let err = solve_plate(&detected, &catalog[..3], &config()).unwrap_err();
    assert!(matches!(err, SolveError::InsufficientData(_)), "{err}");
}

#[test]
fn test_invalid_parameters() {
    let (catalog, detected) = synthetic_field(10, 1.0, 0.0, (0.0, 0.0));
    for cfg in [
        SolveConfig { focal_length_mm: 0.0, ..config() },
        SolveConfig { center: SkyPoint::new(0.0, 0.0), ..config() },
        SolveConfig { image_height: 0, ..config() },
    ] {
        assert!(matches!(
            solve_plate(&detected, &catalog, &cfg),
            Err(SolveError::InvalidInput(_))
        ));
    }
}

#[test]
fn test_cancel_from_observer() {
    let (catalog, detected) = synthetic_field(30, 1.0, 0.0, (0.0, 0.0));
    let mut calls = 0;
    let result = solve_plate_with(&detected, &catalog, &config(), |_| {
        calls += 1;
        ControlFlow::Break(())
    });
    assert_eq!(result, Err(SolveError::Cancelled));
    assert_eq!(calls, 1);

    // Cancelling during refinement.
    let cfg = SolveConfig {
        reference_offset: (50.0, 50.0),
        ..config()
    };
    let result = solve_plate_with(&detected, &catalog, &cfg, |stage| match stage {
        SolveStage::Converging { .. } => ControlFlow::Break(()),
        _ => ControlFlow::Continue(()),
    });
    assert_eq!(result, Err(SolveError::Cancelled));
}

#[test]
fn test_save_and_load_solution() {
    let (catalog, detected) = synthetic_field(30, 1.0, 0.25, (0.0, 0.0));
    let sol = solve_plate(&detected, &catalog, &config()).unwrap();

    let path = std::env::temp_dir().join(format!("starplate_solution_{}.rkyv", std::process::id()));
    let path = path.to_str().unwrap();
    sol.save_to_file(path).unwrap();
    let loaded = PlateSolution::load_from_file(path).unwrap();
    let _ = std::fs::remove_file(path);
    assert_eq!(loaded, sol);
}
