use super::FittedStar;

/// Arcseconds per radian, scaled for pixel pitch in µm over focal length in mm.
pub const RADCONV: f64 = 206.264_806_247_096_36;

/// Optical and sensor metadata needed to express sizes on the sky.
///
/// Any zero or negative field means "unknown".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub focal_length_mm: f64,
    pub pixel_size_x_um: f64,
    pub pixel_size_y_um: f64,
    pub binning_x: f64,
    pub binning_y: f64,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            focal_length_mm: 0.0,
            pixel_size_x_um: 0.0,
            pixel_size_y_um: 0.0,
            binning_x: 1.0,
            binning_y: 1.0,
        }
    }
}

impl Calibration {
    pub fn new(focal_length_mm: f64, pixel_size_um: f64) -> Self {
        Self {
            focal_length_mm,
            pixel_size_x_um: pixel_size_um,
            pixel_size_y_um: pixel_size_um,
            ..Default::default()
        }
    }

    pub fn is_usable(&self) -> bool {
        [
            self.focal_length_mm,
            self.pixel_size_x_um,
            self.pixel_size_y_um,
            self.binning_x,
            self.binning_y,
        ]
        .iter()
        .all(|v| v.is_finite() && *v > 0.0)
    }

    /// Image scale in arcseconds per (binned) pixel along x and y.
    pub fn arcsec_per_pixel(&self) -> Option<[f64; 2]> {
        if !self.is_usable() {
            return None;
        }
        let k = RADCONV / self.focal_length_mm;
        Some([
            k * self.pixel_size_x_um * self.binning_x,
            k * self.pixel_size_y_um * self.binning_y,
        ])
    }
}

/// Fill in the arcsecond FWHM of a fitted star.
///
/// Unusable calibration leaves `fwhm_arcsec` as `None`.
pub fn fwhm_to_arcsec(star: &FittedStar, calibration: &Calibration) -> FittedStar {
    let mut out = star.clone();
    out.fwhm_arcsec = calibration
        .arcsec_per_pixel()
        .map(|[sx, sy]| [star.fwhm_x * sx, star.fwhm_y * sy]);
    out
}
