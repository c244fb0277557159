//! Image buffer type shared by every stage of the processing chain

use crate::error::{PolMathError, Result};
use ndarray::{Array2, Array3, Axis, Zip};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Pixel container for raw frames, per-angle images and derived maps
///
/// Color images are stored height x width x 3 in RGB order.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageBuffer {
    /// Single channel 8-bit image (raw mosaic or grayscale)
    Gray(Array2<u8>),
    /// Three channel 8-bit RGB image
    Color(Array3<u8>),
    /// Scalar float map (DoLP, AoLP, DoCP, ...), not meant for direct display
    Map(Array2<f32>),
}

impl ImageBuffer {
    /// (height, width)
    pub fn dims(&self) -> (usize, usize) {
        match self {
            ImageBuffer::Gray(a) => a.dim(),
            ImageBuffer::Color(a) => {
                let (h, w, _) = a.dim();
                (h, w)
            }
            ImageBuffer::Map(a) => a.dim(),
        }
    }

    pub fn width(&self) -> usize {
        self.dims().1
    }

    pub fn height(&self) -> usize {
        self.dims().0
    }

    pub fn channels(&self) -> usize {
        match self {
            ImageBuffer::Color(_) => 3,
            ImageBuffer::Gray(_) | ImageBuffer::Map(_) => 1,
        }
    }

    /// Number of array dimensions (2 for gray/maps, 3 for color)
    pub fn ndim(&self) -> usize {
        match self {
            ImageBuffer::Color(_) => 3,
            ImageBuffer::Gray(_) | ImageBuffer::Map(_) => 2,
        }
    }

    pub fn is_empty(&self) -> bool {
        let (h, w) = self.dims();
        h == 0 || w == 0
    }

    /// True for 8-bit images intended for display
    pub fn is_visual(&self) -> bool {
        !matches!(self, ImageBuffer::Map(_))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ImageBuffer::Gray(_) => "gray",
            ImageBuffer::Color(_) => "color",
            ImageBuffer::Map(_) => "map",
        }
    }

    /// Convert to a single channel 8-bit image (BT.601 luma for color input)
    pub fn to_gray(&self) -> Result<ImageBuffer> {
        match self {
            ImageBuffer::Gray(_) => Ok(self.clone()),
            ImageBuffer::Color(rgb) => {
                let (h, w, _) = rgb.dim();
                let mut gray = Array2::<u8>::zeros((h, w));
                Zip::from(&mut gray)
                    .and(rgb.lanes(Axis(2)))
                    .par_for_each(|g, px| {
                        let luma = 0.299 * f32::from(px[0])
                            + 0.587 * f32::from(px[1])
                            + 0.114 * f32::from(px[2]);
                        *g = luma.round().clamp(0.0, 255.0) as u8;
                    });
                Ok(ImageBuffer::Gray(gray))
            }
            ImageBuffer::Map(_) => Err(PolMathError::invalid_shape(
                "8-bit gray or color image",
                "float map",
            )),
        }
    }

    /// Grayscale intensities as f32, the working type for Stokes math
    pub fn gray_plane(&self) -> Result<Array2<f32>> {
        match self.to_gray()? {
            ImageBuffer::Gray(gray) => Ok(gray.mapv(f32::from)),
            other => Err(PolMathError::invalid_shape("gray image", other.kind_name())),
        }
    }

    /// Raw pixel bytes in row-major order, used for content hashing
    pub fn as_bytes(&self) -> Cow<'_, [u8]> {
        match self {
            ImageBuffer::Gray(a) => match a.as_slice() {
                Some(slice) => Cow::Borrowed(slice),
                None => Cow::Owned(a.iter().copied().collect()),
            },
            ImageBuffer::Color(a) => match a.as_slice() {
                Some(slice) => Cow::Borrowed(slice),
                None => Cow::Owned(a.iter().copied().collect()),
            },
            ImageBuffer::Map(a) => Cow::Owned(a.iter().flat_map(|v| v.to_le_bytes()).collect()),
        }
    }

    /// Pixel-wise average of same-shape 8-bit images, truncated to u8
    pub fn mean_merge(images: &[ImageBuffer]) -> Result<ImageBuffer> {
        let first = images
            .first()
            .ok_or_else(|| PolMathError::invalid_parameter("cannot merge an empty image list"))?;
        let dims = first.dims();
        for image in images {
            if image.dims() != dims {
                return Err(PolMathError::ShapeMismatch {
                    first: dims,
                    other: image.dims(),
                });
            }
        }
        let n = images.len() as u32;

        match first {
            ImageBuffer::Gray(_) => {
                let mut acc = Array2::<u32>::zeros(dims);
                for image in images {
                    match image {
                        ImageBuffer::Gray(g) => Zip::from(&mut acc)
                            .and(g)
                            .for_each(|a, &v| *a += u32::from(v)),
                        other => {
                            return Err(PolMathError::invalid_shape("gray image", other.kind_name()))
                        }
                    }
                }
                Ok(ImageBuffer::Gray(acc.mapv(|v| (v / n) as u8)))
            }
            ImageBuffer::Color(_) => {
                let mut acc = Array3::<u32>::zeros((dims.0, dims.1, 3));
                for image in images {
                    match image {
                        ImageBuffer::Color(c) => Zip::from(&mut acc)
                            .and(c)
                            .for_each(|a, &v| *a += u32::from(v)),
                        other => {
                            return Err(PolMathError::invalid_shape("color image", other.kind_name()))
                        }
                    }
                }
                Ok(ImageBuffer::Color(acc.mapv(|v| (v / n) as u8)))
            }
            ImageBuffer::Map(_) => Err(PolMathError::invalid_shape(
                "8-bit gray or color images",
                "float map",
            )),
        }
    }

    pub fn from_gray_image(img: &image::GrayImage) -> Self {
        let (w, h) = img.dimensions();
        ImageBuffer::Gray(Array2::from_shape_fn((h as usize, w as usize), |(y, x)| {
            img.get_pixel(x as u32, y as u32)[0]
        }))
    }

    pub fn from_rgb_image(img: &image::RgbImage) -> Self {
        let (w, h) = img.dimensions();
        ImageBuffer::Color(Array3::from_shape_fn(
            (h as usize, w as usize, 3),
            |(y, x, c)| img.get_pixel(x as u32, y as u32)[c],
        ))
    }

    /// Gray view for export; `None` for color images and maps
    pub fn to_gray_image(&self) -> Option<image::GrayImage> {
        match self {
            ImageBuffer::Gray(a) => {
                let (h, w) = a.dim();
                Some(image::GrayImage::from_fn(w as u32, h as u32, |x, y| {
                    image::Luma([a[[y as usize, x as usize]]])
                }))
            }
            _ => None,
        }
    }

    /// RGB view for export; gray images are expanded, maps return `None`
    pub fn to_rgb_image(&self) -> Option<image::RgbImage> {
        match self {
            ImageBuffer::Color(a) => {
                let (h, w, _) = a.dim();
                Some(image::RgbImage::from_fn(w as u32, h as u32, |x, y| {
                    let (x, y) = (x as usize, y as usize);
                    image::Rgb([a[[y, x, 0]], a[[y, x, 1]], a[[y, x, 2]]])
                }))
            }
            ImageBuffer::Gray(a) => {
                let (h, w) = a.dim();
                Some(image::RgbImage::from_fn(w as u32, h as u32, |x, y| {
                    let v = a[[y as usize, x as usize]];
                    image::Rgb([v, v, v])
                }))
            }
            ImageBuffer::Map(_) => None,
        }
    }
}

/// Rectangular region of interest in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Roi {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Roi {
    pub fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Intersect with an image of the given size; `None` if nothing overlaps
    pub fn clip(&self, image_width: usize, image_height: usize) -> Option<Roi> {
        if self.x >= image_width || self.y >= image_height {
            return None;
        }
        let width = self.width.min(image_width - self.x);
        let height = self.height.min(image_height - self.y);
        if width == 0 || height == 0 {
            return None;
        }
        Some(Roi::new(self.x, self.y, width, height))
    }
}
