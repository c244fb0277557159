//! Demosaicing of division-of-focal-plane polarization sensor frames
//!
//! Polarization sensors put a micro-polarizer over every pixel, repeating a
//! 2x2 block of four orientations:
//!
//! ```text
//!   90°  45°
//!  135°   0°
//! ```
//!
//! Color sensors additionally put each 2x2 polarizer block under one Bayer
//! filter, so the full repeating unit is a 4x4 super-pixel whose blocks follow
//! an RGGB layout. Both layouts are split into per-angle planes at half
//! resolution and brought back to the input resolution.

use crate::buffer::ImageBuffer;
use crate::error::{PolMathError, Result};
use ndarray::parallel::prelude::*;
use ndarray::{s, Array2, Array3, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Polarizer orientations in output order
pub const ANGLES: [u16; 4] = [0, 45, 90, 135];

/// Minimum mosaic edge length (one full color super-pixel)
pub const MIN_MOSAIC_SIZE: usize = 4;

/// (row, column) of each orientation inside a 2x2 polarizer block, in `ANGLES` order
const ANGLE_OFFSETS: [(usize, usize); 4] = [(1, 1), (0, 1), (0, 0), (1, 0)];

/// Sensor mosaic layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SensorLayout {
    /// Color polarization sensor (polarizer blocks under an RGGB Bayer filter)
    #[default]
    Color,
    /// Monochrome polarization sensor
    Mono,
}

/// Check a raw frame is a single channel mosaic with a usable shape
pub fn validate_mosaic(raw: &ImageBuffer) -> Result<ArrayView2<'_, u8>> {
    let mosaic = match raw {
        ImageBuffer::Gray(a) => a.view(),
        other => {
            return Err(PolMathError::invalid_shape(
                "single channel 8-bit mosaic",
                format!("{} image with {} channel(s)", other.kind_name(), other.channels()),
            ))
        }
    };

    let (height, width) = mosaic.dim();
    if height % MIN_MOSAIC_SIZE != 0 || width % MIN_MOSAIC_SIZE != 0 {
        return Err(PolMathError::NotMultipleOf {
            width,
            height,
            multiple: MIN_MOSAIC_SIZE,
        });
    }
    if height < MIN_MOSAIC_SIZE || width < MIN_MOSAIC_SIZE {
        return Err(PolMathError::TooSmall {
            width,
            height,
            min: MIN_MOSAIC_SIZE,
        });
    }
    Ok(mosaic)
}

/// Split a raw mosaic into four full-resolution images ordered 0°, 45°, 90°, 135°
///
/// Color layouts yield `ImageBuffer::Color`, mono layouts `ImageBuffer::Gray`.
pub fn demosaic(raw: &ImageBuffer, layout: SensorLayout) -> Result<[ImageBuffer; 4]> {
    let mosaic = validate_mosaic(raw)?;

    let planes = ANGLE_OFFSETS.map(|(dy, dx)| mosaic.slice(s![dy..;2, dx..;2]).to_owned());
    let images = planes.map(|plane| match layout {
        SensorLayout::Mono => ImageBuffer::Gray(upsample_gray(&plane)),
        SensorLayout::Color => ImageBuffer::Color(upsample_color(&bayer_bilinear(&plane))),
    });

    log::trace!(
        "Demosaiced {}x{} {:?} frame",
        mosaic.ncols(),
        mosaic.nrows(),
        layout
    );
    Ok(images)
}

/// Bayer channel (0=R, 1=G, 2=B) at a position of an RGGB plane
fn bayer_channel(y: usize, x: usize) -> usize {
    match (y % 2, x % 2) {
        (0, 0) => 0,
        (1, 1) => 2,
        _ => 1,
    }
}

/// Bilinear RGGB interpolation: missing channels are the mean of the same-color
/// samples in the 3x3 neighbourhood
fn bayer_bilinear(plane: &Array2<u8>) -> Array3<u8> {
    let (h, w) = plane.dim();
    let mut rgb = Array3::<u8>::zeros((h, w, 3));

    rgb.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(y, mut row)| {
            for x in 0..w {
                let mut sums = [0u32; 3];
                let mut counts = [0u32; 3];
                for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
                    for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                        let c = bayer_channel(ny, nx);
                        sums[c] += u32::from(plane[[ny, nx]]);
                        counts[c] += 1;
                    }
                }
                let own = bayer_channel(y, x);
                for c in 0..3 {
                    row[[x, c]] = if c == own {
                        plane[[y, x]]
                    } else if counts[c] > 0 {
                        ((sums[c] + counts[c] / 2) / counts[c]) as u8
                    } else {
                        0
                    };
                }
            }
        });

    rgb
}

fn upsample_gray(plane: &Array2<u8>) -> Array2<u8> {
    let (h, w) = plane.dim();
    Array2::from_shape_fn((h * 2, w * 2), |(y, x)| plane[[y / 2, x / 2]])
}

fn upsample_color(plane: &Array3<u8>) -> Array3<u8> {
    let (h, w, c) = plane.dim();
    Array3::from_shape_fn((h * 2, w * 2, c), |(y, x, ch)| plane[[y / 2, x / 2, ch]])
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Mosaic where every pixel under orientation `i` has `values[i]`
    fn uniform_mosaic(height: usize, width: usize, values: [u8; 4]) -> ImageBuffer {
        ImageBuffer::Gray(Array2::from_shape_fn((height, width), |(y, x)| {
            let idx = ANGLE_OFFSETS
                .iter()
                .position(|&(dy, dx)| dy == y % 2 && dx == x % 2)
                .unwrap();
            values[idx]
        }))
    }

    #[test]
    fn test_rejects_non_multiple_of_four() {
        let raw = ImageBuffer::Gray(Array2::zeros((6, 8)));
        assert!(matches!(
            demosaic(&raw, SensorLayout::Mono),
            Err(PolMathError::NotMultipleOf { .. })
        ));
        let raw = ImageBuffer::Gray(Array2::zeros((8, 10)));
        assert!(demosaic(&raw, SensorLayout::Color).is_err());
    }

    #[test]
    fn test_rejects_too_small() {
        let raw = ImageBuffer::Gray(Array2::zeros((2, 2)));
        assert!(demosaic(&raw, SensorLayout::Mono).is_err());
        let raw = ImageBuffer::Gray(Array2::zeros((0, 8)));
        assert!(matches!(
            demosaic(&raw, SensorLayout::Mono),
            Err(PolMathError::TooSmall { .. })
        ));
    }

    #[test]
    fn test_rejects_color_and_maps() {
        let raw = ImageBuffer::Color(Array3::zeros((8, 8, 3)));
        assert!(matches!(
            demosaic(&raw, SensorLayout::Color),
            Err(PolMathError::InvalidShape { .. })
        ));
        let raw = ImageBuffer::Map(Array2::zeros((8, 8)));
        assert!(demosaic(&raw, SensorLayout::Mono).is_err());
    }

    #[test]
    fn test_mono_separates_orientations() {
        let raw = uniform_mosaic(8, 12, [200, 150, 100, 50]);
        let channels = demosaic(&raw, SensorLayout::Mono).unwrap();
        for (image, expected) in channels.iter().zip([200u8, 150, 100, 50]) {
            assert_eq!(image.dims(), (8, 12));
            match image {
                ImageBuffer::Gray(g) => assert!(g.iter().all(|&v| v == expected)),
                other => panic!("expected gray, got {}", other.kind_name()),
            }
        }
    }

    #[test]
    fn test_color_uniform_gray_scene_stays_gray() {
        let raw = uniform_mosaic(8, 8, [80, 80, 80, 80]);
        let channels = demosaic(&raw, SensorLayout::Color).unwrap();
        for image in &channels {
            assert_eq!(image.dims(), (8, 8));
            match image {
                ImageBuffer::Color(c) => assert!(c.iter().all(|&v| v == 80)),
                other => panic!("expected color, got {}", other.kind_name()),
            }
        }
    }

    #[test]
    fn test_color_recovers_bayer_channels() {
        // Red blocks bright, green mid, blue dark, identical for every orientation
        let raw = ImageBuffer::Gray(Array2::from_shape_fn((8, 8), |(y, x)| {
            match bayer_channel(y / 2, x / 2) {
                0 => 240,
                1 => 120,
                _ => 30,
            }
        }));
        let channels = demosaic(&raw, SensorLayout::Color).unwrap();
        match &channels[0] {
            ImageBuffer::Color(c) => {
                assert!(c.index_axis(Axis(2), 0).iter().all(|&v| v == 240));
                assert!(c.index_axis(Axis(2), 1).iter().all(|&v| v == 120));
                assert!(c.index_axis(Axis(2), 2).iter().all(|&v| v == 30));
            }
            other => panic!("expected color, got {}", other.kind_name()),
        }
    }
}
