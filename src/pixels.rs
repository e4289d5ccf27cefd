//! Read-only pixel access over image buffers.
//!
//! The fitter never owns an image. It reads intensities through
//! [`PixelSource`], which hides whether the native storage is integer or
//! floating point. [`Frame`] is a minimal row-major implementation; with the
//! `image` feature enabled, `image::ImageBuffer` implements it too.

/// Intensity accessor for a multi-layer 2D image.
///
/// Coordinates are 0-based, `x` along columns and `y` along rows (+Y down).
/// Callers guarantee `x < width()`, `y < height()` and `layer < layers()`.
pub trait PixelSource {
    fn width(&self) -> usize;
    fn height(&self) -> usize;
    fn layers(&self) -> usize;
    fn pixel(&self, layer: usize, x: usize, y: usize) -> f64;
}

/// Native sample types a [`Frame`] can hold.
pub trait Sample: Copy {
    fn to_f64(self) -> f64;
}

macro_rules! impl_sample {
    ($($t:ty),*) => {
        $(impl Sample for $t {
            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }
        })*
    };
}

impl_sample!(u8, u16, u32, f32, f64);

/// Planar image buffer: `layers` planes of `width * height` samples, each
/// plane row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame<T> {
    width: usize,
    height: usize,
    layers: usize,
    data: Vec<T>,
}

impl<T: Sample> Frame<T> {
    /// Wrap planar data. Returns `None` if the length does not match the
    /// dimensions or any dimension is zero.
    pub fn new(width: usize, height: usize, layers: usize, data: Vec<T>) -> Option<Self> {
        if width == 0 || height == 0 || layers == 0 || data.len() != width * height * layers {
            return None;
        }
        Some(Self {
            width,
            height,
            layers,
            data,
        })
    }

    /// Single-layer frame built from row-major samples.
    pub fn mono(width: usize, height: usize, data: Vec<T>) -> Option<Self> {
        Self::new(width, height, 1, data)
    }

    /// Frame whose samples are produced by `f(x, y)` on a single layer.
    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            layers: 1,
            data,
        }
    }

    /// Mutable access to one sample, e.g. to paint synthetic stars.
    pub fn get_mut(&mut self, layer: usize, x: usize, y: usize) -> Option<&mut T> {
        if layer >= self.layers || x >= self.width || y >= self.height {
            return None;
        }
        let idx = (layer * self.height + y) * self.width + x;
        self.data.get_mut(idx)
    }
}

impl<T: Sample> PixelSource for Frame<T> {
    fn width(&self) -> usize {
        self.width
    }

    fn height(&self) -> usize {
        self.height
    }

    fn layers(&self) -> usize {
        self.layers
    }

    #[inline]
    fn pixel(&self, layer: usize, x: usize, y: usize) -> f64 {
        self.data[(layer * self.height + y) * self.width + x].to_f64()
    }
}

#[cfg(feature = "image")]
impl<P, C> PixelSource for image::ImageBuffer<P, C>
where
    P: image::Pixel,
    P::Subpixel: Into<f64>,
    C: std::ops::Deref<Target = [P::Subpixel]>,
{
    fn width(&self) -> usize {
        image::ImageBuffer::width(self) as usize
    }

    fn height(&self) -> usize {
        image::ImageBuffer::height(self) as usize
    }

    fn layers(&self) -> usize {
        P::CHANNEL_COUNT as usize
    }

    fn pixel(&self, layer: usize, x: usize, y: usize) -> f64 {
        use image::Pixel;
        self.get_pixel(x as u32, y as u32).channels()[layer].into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_rejects_bad_length() {
        assert!(Frame::<u16>::mono(4, 4, vec![0; 15]).is_none());
        assert!(Frame::<u16>::mono(0, 4, vec![]).is_none());
    }

    #[test]
    fn test_frame_planar_indexing() {
        let data: Vec<u16> = (0..2 * 3 * 2).collect();
        let frame = Frame::new(3, 2, 2, data).unwrap();
        assert_eq!(frame.pixel(0, 0, 0), 0.0);
        assert_eq!(frame.pixel(0, 2, 1), 5.0);
        assert_eq!(frame.pixel(1, 0, 0), 6.0);
        assert_eq!(frame.pixel(1, 2, 1), 11.0);
    }

    #[test]
    fn test_frame_from_fn_and_mutation() {
        let mut frame = Frame::from_fn(5, 4, |x, y| (x + 10 * y) as f32);
        assert_eq!(frame.pixel(0, 3, 2), 23.0);
        *frame.get_mut(0, 3, 2).unwrap() = -1.0;
        assert_eq!(frame.pixel(0, 3, 2), -1.0);
        assert!(frame.get_mut(0, 5, 0).is_none());
    }

    #[cfg(feature = "image")]
    #[test]
    fn test_image_buffer_source() {
        let img = image::ImageBuffer::from_fn(4, 3, |x, y| image::Luma([(x * 100 + y) as u16]));
        assert_eq!(PixelSource::width(&img), 4);
        assert_eq!(PixelSource::layers(&img), 1);
        assert_eq!(img.pixel(0, 2, 1), 201.0);
    }
}
