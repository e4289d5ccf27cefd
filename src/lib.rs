//! # starplate
//!
//! Stellar **PSF fitting** and **tangent-plane plate solving** in Rust.
//!
//! Given a window of pixels around a candidate star, `starplate` fits an
//! elliptical Gaussian point-spread function and reports sub-pixel position,
//! FWHM, magnitude and fit quality. Given a list of such stars and a
//! reference catalog around an approximate field centre, it registers the two
//! and returns the linear world coordinate system (CRPIX/CRVAL/CD) of the
//! image.
//!
//! ## Features
//!
//! - **PSF fitting**: axis-aligned and rotated elliptical Gaussians via
//!   Levenberg-Marquardt, with parameter uncertainties from the covariance
//! - **Photometry hook**: pluggable aperture photometry through
//!   [`AperturePhotometry`], with a circular-aperture implementation
//! - **Star matching**: similar-triangle voting between two star lists with
//!   robust (MAD-clipped) similarity, affine or homography fits
//! - **Plate solving**: retry ladder over candidate pool and scale bounds,
//!   iterative re-centring for offset reference pixels, cancellation
//! - **Persistence**: solutions serialize with [rkyv](https://docs.rs/rkyv)
//!
//! ## Example
//!
//! ```no_run
//! use starplate::{
//!     fit_stars, solve_plate, CatalogStar, DetectedStar, Frame, PsfConfig, SkyPoint,
//!     SolveConfig,
//! };
//!
//! // Fit stars at candidate peaks of a 16-bit image
//! let frame = Frame::mono(1000, 800, vec![0u16; 1000 * 800]).unwrap();
//! let candidates = vec![(120, 340), (512, 77)];
//! let stars = fit_stars(&frame, 0, &candidates, 8, 0.0, true, None, &PsfConfig::default());
//!
//! // Solve against catalog stars near the expected pointing
//! let catalog = vec![
//!     CatalogStar::new("HIP 26727", 85.1897, -1.9426, 1.77),
//!     // ... more catalog stars ...
//! ];
//! let detected: Vec<DetectedStar> = stars.iter().map(DetectedStar::from).collect();
//! let config = SolveConfig::new(1000, 800, SkyPoint::new(85.0, -2.0), 400.0, 3.76);
//!
//! match solve_plate(&detected, &catalog, &config) {
//!     Ok(solution) => println!(
//!         "centre ({:.5}, {:.5}), {:.3}\"/px, rotation {:.2}°",
//!         solution.image_center[0],
//!         solution.image_center[1],
//!         solution.pixel_scale_arcsec,
//!         solution.rotation_deg()
//!     ),
//!     Err(e) => eprintln!("no solution: {e}"),
//! }
//! ```
//!
//! ## Conventions
//!
//! - Image pixels are 0-based, `x` along columns, `y` along rows (+Y down).
//!   PSF window coordinates are 1-based; `crpix` is FITS 1-based.
//! - Sky coordinates are degrees; tangent-plane coordinates handed to the
//!   matcher are arcseconds.
//! - Magnitudes sort brightest (lowest) first everywhere.

pub mod error;
pub mod matching;
pub mod photometry;
pub mod pixels;
pub mod projection;
pub mod psf;
pub mod solver;
pub mod star;

pub use error::{MatchError, SolveError, WindowError};
pub use matching::{match_stars, Homography, MatchConfig, TransformKind};
pub use photometry::{AperturePhotometry, CircularAperture, Photometry};
pub use pixels::{Frame, PixelSource, Sample};
pub use projection::{deproject, project, PlaneUnits, SkyPoint};
pub use psf::{
    fit_star, fit_star_with, fit_stars, fwhm_to_arcsec, Calibration, FittedStar, GaussianModel,
    MagnitudeError, PixelWindow, PsfConfig, PsfParameters, Rect,
};
pub use solver::{solve_plate, solve_plate_with, PlateSolution, SolveConfig, SolveStage};
pub use star::{sort_by_brightness, CatalogStar, DetectedStar};
