use nalgebra::DMatrix;

use crate::error::WindowError;
use crate::pixels::PixelSource;

/// Rectangle in 0-based source-image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Rect {
    pub fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Dense block of pixel intensities cut out around a candidate star.
///
/// `data` is `height × width` (rows × columns); `data[(r, c)]` is the source
/// pixel at `(rect.x + c, rect.y + r)`. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelWindow {
    rect: Rect,
    data: DMatrix<f64>,
}

impl PixelWindow {
    /// Copy `rect` from `layer` of `source`, clipped to the image bounds.
    pub fn sample<S: PixelSource + ?Sized>(
        source: &S,
        layer: usize,
        rect: Rect,
    ) -> Result<Self, WindowError> {
        if layer >= source.layers() {
            return Err(WindowError::LayerOutOfRange {
                layer,
                layers: source.layers(),
            });
        }
        let x1 = rect.x.saturating_add(rect.width).min(source.width());
        let y1 = rect.y.saturating_add(rect.height).min(source.height());
        if rect.x >= x1 || rect.y >= y1 {
            return Err(WindowError::Empty {
                width: source.width(),
                height: source.height(),
            });
        }
        let clipped = Rect::new(rect.x, rect.y, x1 - rect.x, y1 - rect.y);
        let data = DMatrix::from_fn(clipped.height, clipped.width, |r, c| {
            source.pixel(layer, clipped.x + c, clipped.y + r)
        });
        Ok(Self {
            rect: clipped,
            data,
        })
    }

    /// Square window of side `2 * radius + 1` centred on pixel `(x, y)`.
    pub fn around<S: PixelSource + ?Sized>(
        source: &S,
        layer: usize,
        x: usize,
        y: usize,
        radius: usize,
    ) -> Result<Self, WindowError> {
        let x0 = x.saturating_sub(radius);
        let y0 = y.saturating_sub(radius);
        let rect = Rect::new(x0, y0, x + radius + 1 - x0, y + radius + 1 - y0);
        Self::sample(source, layer, rect)
    }

    /// Wrap caller-owned samples; `data` must be `rect.height × rect.width`.
    pub fn from_matrix(rect: Rect, data: DMatrix<f64>) -> Result<Self, WindowError> {
        if data.nrows() != rect.height || data.ncols() != rect.width {
            return Err(WindowError::ShapeMismatch {
                got: data.len(),
                expected: rect.width * rect.height,
            });
        }
        Ok(Self { rect, data })
    }

    pub fn rect(&self) -> Rect {
        self.rect
    }

    pub fn data(&self) -> &DMatrix<f64> {
        &self.data
    }

    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    pub fn height(&self) -> usize {
        self.data.nrows()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Sample at 0-based window column `c`, row `r`.
    #[inline]
    pub fn at(&self, c: usize, r: usize) -> f64 {
        self.data[(r, c)]
    }

    /// Median of the 3×3 neighbourhood of `(c, r)`, clipped at the window edge.
    /// Used to locate the peak without being fooled by a single hot pixel.
    pub(crate) fn median3(&self, c: usize, r: usize) -> f64 {
        let mut vals = [0.0f64; 9];
        let mut n = 0;
        for rr in r.saturating_sub(1)..(r + 2).min(self.height()) {
            for cc in c.saturating_sub(1)..(c + 2).min(self.width()) {
                vals[n] = self.at(cc, rr);
                n += 1;
            }
        }
        let vals = &mut vals[..n];
        vals.sort_unstable_by(|a, b| a.total_cmp(b));
        if n % 2 == 1 {
            vals[n / 2]
        } else {
            0.5 * (vals[n / 2 - 1] + vals[n / 2])
        }
    }
}
