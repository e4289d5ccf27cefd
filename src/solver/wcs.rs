//! Plate solution: the linear TAN world coordinate system of an image.

use rkyv::{Archive, Deserialize, Serialize};
use tracing::info;

use crate::projection::{PlaneUnits, SkyPoint};

/// World coordinate system found by [`solve_plate`](super::solve_plate).
///
/// Pixel axis 1 is the column index, pixel axis 2 the row index as stored
/// (+Y down); [`flip_rows`](Self::flip_rows) converts to bottom-up rows.
/// `cd` maps pixel offsets from `crpix` to tangent-plane `(ξ, η)` in degrees
/// at `crval`:
///
/// ```text
/// ξ = cd[0][0]·dx + cd[0][1]·dy
/// η = cd[1][0]·dx + cd[1][1]·dy
/// ```
///
/// `cd[i][j] == pc[i][j] * cdelt[j]`.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct PlateSolution {
    pub image_width: u32,
    pub image_height: u32,
    /// Reference pixel, FITS 1-based.
    pub crpix: [f64; 2],
    /// RA/Dec of the reference pixel, degrees.
    pub crval: [f64; 2],
    pub cd: [[f64; 2]; 2],
    pub cdelt: [f64; 2],
    pub pc: [[f64; 2]; 2],
    /// Mean plate scale, arcsec per pixel.
    pub pixel_scale_arcsec: f64,
    /// Focal length implied by the plate scale and the configured pixel size.
    pub focal_length_mm: f64,
    /// RA/Dec of the geometric image centre, degrees.
    pub image_center: [f64; 2],
    /// The transform includes a mirror flip relative to the sky.
    pub flipped: bool,
    /// `false` if the refinement loop ran out of trials before the reference
    /// coordinate settled. The solution is still usable.
    pub converged: bool,
    /// Star pairs in the final fit.
    pub matched_stars: u32,
    /// Pairs considered before outlier rejection.
    pub candidate_pairs: u32,
    /// RMS residual of the matched stars, arcsec.
    pub rms_arcsec: f64,
}

/// Split a CD matrix into per-axis scales and a unit-column PC matrix.
///
/// `cdelt[0]` takes the sign of the determinant, so `det(pc) > 0`.
pub(crate) fn decompose_cd(cd: &[[f64; 2]; 2]) -> ([f64; 2], [[f64; 2]; 2]) {
    let det = cd[0][0] * cd[1][1] - cd[0][1] * cd[1][0];
    let mut cdelt = [cd[0][0].hypot(cd[1][0]), cd[0][1].hypot(cd[1][1])];
    if det < 0.0 {
        cdelt[0] = -cdelt[0];
    }
    let col = |j: usize| if cdelt[j] != 0.0 { 1.0 / cdelt[j] } else { 0.0 };
    let pc = [
        [cd[0][0] * col(0), cd[0][1] * col(1)],
        [cd[1][0] * col(0), cd[1][1] * col(1)],
    ];
    (cdelt, pc)
}

impl PlateSolution {
    /// Assemble a solution from a CD matrix. `crpix` is FITS 1-based.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_cd(
        image_width: u32,
        image_height: u32,
        crpix: [f64; 2],
        crval: SkyPoint,
        cd: [[f64; 2]; 2],
        pixel_size_um: f64,
        converged: bool,
        matched_stars: u32,
        candidate_pairs: u32,
        rms_arcsec: f64,
    ) -> Self {
        let (cdelt, pc) = decompose_cd(&cd);
        let row_norm = |i: usize| cd[i][0].hypot(cd[i][1]) * 3600.0;
        let pixel_scale_arcsec = 0.5 * (row_norm(0) + row_norm(1));
        let focal_length_mm = if pixel_scale_arcsec > 0.0 {
            crate::psf::units::RADCONV * pixel_size_um / pixel_scale_arcsec
        } else {
            0.0
        };
        let det = cd[0][0] * cd[1][1] - cd[0][1] * cd[1][0];

        let mut solution = Self {
            image_width,
            image_height,
            crpix,
            crval: [crval.ra_deg, crval.dec_deg],
            cd,
            cdelt,
            pc,
            pixel_scale_arcsec,
            focal_length_mm,
            image_center: [crval.ra_deg, crval.dec_deg],
            flipped: det < 0.0,
            converged,
            matched_stars,
            candidate_pairs,
            rms_arcsec,
        };
        let (cx, cy) = solution.geometric_center();
        solution.image_center = match solution.pixel_to_world(cx, cy) {
            Some((ra, dec)) => [ra, dec],
            None => solution.crval,
        };
        solution
    }

    /// Centre of the image in 0-based pixels.
    fn geometric_center(&self) -> (f64, f64) {
        (
            (self.image_width as f64 - 1.0) / 2.0,
            (self.image_height as f64 - 1.0) / 2.0,
        )
    }

    pub fn crval_point(&self) -> SkyPoint {
        SkyPoint::new(self.crval[0], self.crval[1])
    }

    pub fn is_flipped(&self) -> bool {
        self.flipped
    }

    /// Rotation of the pixel axes on the sky, degrees in `(-180, 180]`,
    /// with the mirror (if any) factored out on pixel axis 2.
    pub fn rotation_deg(&self) -> f64 {
        let cd = &self.cd;
        let p = if self.flipped { -1.0 } else { 1.0 };
        (cd[1][0] - p * cd[0][1])
            .atan2(cd[0][0] + p * cd[1][1])
            .to_degrees()
    }

    /// Sky position (RA, Dec in degrees) of 0-based pixel `(x, y)`.
    pub fn pixel_to_world(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let dx = x - (self.crpix[0] - 1.0);
        let dy = y - (self.crpix[1] - 1.0);
        let xi = self.cd[0][0] * dx + self.cd[0][1] * dy;
        let eta = self.cd[1][0] * dx + self.cd[1][1] * dy;
        if !(xi.is_finite() && eta.is_finite()) {
            return None;
        }
        Some(self.crval_point().deproject(
            xi.to_radians(),
            eta.to_radians(),
            PlaneUnits::Radians,
        ))
    }

    /// 0-based pixel position of `(ra, dec)`. `None` if the point is behind
    /// the tangent plane or the CD matrix is singular.
    pub fn world_to_pixel(&self, ra_deg: f64, dec_deg: f64) -> Option<(f64, f64)> {
        let (xi, eta) = self.crval_point().project(ra_deg, dec_deg, PlaneUnits::Radians)?;
        let (xi, eta) = (xi.to_degrees(), eta.to_degrees());
        let cd = &self.cd;
        let det = cd[0][0] * cd[1][1] - cd[0][1] * cd[1][0];
        if det.abs() < 1e-300 {
            return None;
        }
        let dx = (cd[1][1] * xi - cd[0][1] * eta) / det;
        let dy = (-cd[1][0] * xi + cd[0][0] * eta) / det;
        Some((dx + self.crpix[0] - 1.0, dy + self.crpix[1] - 1.0))
    }

    /// The same solution for the image with its rows reversed (row `r`
    /// becomes `height - 1 - r`).
    pub fn flip_rows(&self, height: u32) -> PlateSolution {
        let mut out = self.clone();
        out.cd[0][1] = -self.cd[0][1];
        out.cd[1][1] = -self.cd[1][1];
        (out.cdelt, out.pc) = decompose_cd(&out.cd);
        out.crpix[1] = height as f64 + 1.0 - self.crpix[1];
        out.flipped = !self.flipped;
        out
    }

    // ── Serialization ───────────────────────────────────────────────────────

    pub fn to_rkyv_bytes(&self) -> Vec<u8> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .expect("rkyv serialization failed")
            .to_vec()
    }

    pub fn from_rkyv_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| anyhow::anyhow!("rkyv deserialization failed: {}", e))
    }

    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let bytes = self.to_rkyv_bytes();
        std::fs::write(path, &bytes)?;
        info!("Saved plate solution to {} ({} bytes)", path, bytes.len());
        Ok(())
    }

    pub fn load_from_file(path: &str) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_rkyv_bytes(&bytes)
    }
}
