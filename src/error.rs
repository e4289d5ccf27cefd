//! Error types for pixel sampling, star matching and plate solving.
//!
//! PSF fitting does not appear here: a failed fit is `None`, so batch callers
//! can skip a bad candidate without inspecting an error.

use thiserror::Error;

/// Failure to cut a [`PixelWindow`](crate::psf::PixelWindow) out of an image.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WindowError {
    #[error("layer {layer} out of range (image has {layers} layers)")]
    LayerOutOfRange { layer: usize, layers: usize },

    #[error("window does not overlap the {width}x{height} image")]
    Empty { width: usize, height: usize },

    #[error("window data is {got} samples, expected {expected}")]
    ShapeMismatch { got: usize, expected: usize },
}

/// Outcome of a failed call to [`match_stars`](crate::matching::match_stars).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    /// One of the lists is shorter than the required number of pairs.
    /// Raised before any geometric search takes place.
    #[error("too few stars: {found} available, {required} required")]
    TooFewStars { found: usize, required: usize },

    /// No set of consistent correspondences was found.
    #[error("no consistent match: {0}")]
    NoConsistentMatch(String),

    /// The matched pairs do not determine a transform (coincident or
    /// collinear points).
    #[error("degenerate transform: {0}")]
    Degenerate(String),
}

/// Fatal outcome of a plate-solve attempt.
///
/// Non-convergence of the refinement loop is not an error; it is reported
/// through [`PlateSolution::converged`](crate::solver::PlateSolution::converged).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolveError {
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("invalid solve parameters: {0}")]
    InvalidInput(String),

    #[error("no match found after {attempts} attempts: {last}")]
    MatchNotFound { attempts: usize, last: MatchError },

    #[error("transform rejected by sanity check: {0}")]
    GeometricImplausibility(String),

    #[error("solve cancelled")]
    Cancelled,
}
