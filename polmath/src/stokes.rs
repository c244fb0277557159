//! Stokes parameters and derived polarization maps
//!
//! From four intensity images behind polarizers at 0°, 45°, 90° and 135°:
//!
//! - `S0 = (I0 + I90 + I45 + I135) / 2`
//! - `S1 = I0 - I90`
//! - `S2 = I45 - I135`
//! - `S3 = (I45 + I135) - (I0 + I90)`
//!
//! S3 is only meaningful with a quarter-wave plate in the optical path; without
//! one the DoCP map is a best-effort approximation.

use crate::buffer::ImageBuffer;
use crate::error::{PolMathError, Result};
use ndarray::{Array2, Zip};

/// Replacement for zero total intensity before dividing by S0
pub const S0_EPSILON: f32 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub struct StokesParameters {
    pub s0: Array2<f32>,
    pub s1: Array2<f32>,
    pub s2: Array2<f32>,
    pub s3: Array2<f32>,
}

/// Degree of linear polarization, angle of linear polarization (degrees) and
/// degree of circular polarization
#[derive(Debug, Clone, PartialEq)]
pub struct PolarizationMaps {
    /// In [0, 1]
    pub dolp: Array2<f32>,
    /// In [0, 180)
    pub aolp: Array2<f32>,
    /// In [0, 1]
    pub docp: Array2<f32>,
}

impl PolarizationMaps {
    /// `[dolp, aolp, docp]` as float map buffers
    pub fn into_images(self) -> [ImageBuffer; 3] {
        [
            ImageBuffer::Map(self.dolp),
            ImageBuffer::Map(self.aolp),
            ImageBuffer::Map(self.docp),
        ]
    }
}

/// Compute S0..S3 from the four angle images (0°, 45°, 90°, 135° order)
///
/// Color images are reduced to grayscale first; all inputs must share one size.
pub fn stokes_parameters(images: &[ImageBuffer]) -> Result<StokesParameters> {
    if images.len() != 4 {
        return Err(PolMathError::ChannelMismatch {
            expected: 4,
            actual: images.len(),
        });
    }
    let dims = images[0].dims();
    for image in images {
        if !image.is_visual() {
            return Err(PolMathError::invalid_shape(
                "8-bit angle image",
                image.kind_name(),
            ));
        }
        if image.dims() != dims {
            return Err(PolMathError::ShapeMismatch {
                first: dims,
                other: image.dims(),
            });
        }
    }

    let i000 = images[0].gray_plane()?;
    let i045 = images[1].gray_plane()?;
    let i090 = images[2].gray_plane()?;
    let i135 = images[3].gray_plane()?;

    let s0 = Zip::from(&i000)
        .and(&i045)
        .and(&i090)
        .and(&i135)
        .par_map_collect(|&a, &b, &c, &d| (a + c + b + d) / 2.0);
    let s1 = Zip::from(&i000).and(&i090).par_map_collect(|&a, &c| a - c);
    let s2 = Zip::from(&i045).and(&i135).par_map_collect(|&b, &d| b - d);
    let s3 = Zip::from(&i000)
        .and(&i045)
        .and(&i090)
        .and(&i135)
        .par_map_collect(|&a, &b, &c, &d| (b + d) - (a + c));

    Ok(StokesParameters { s0, s1, s2, s3 })
}

impl StokesParameters {
    pub fn polarization_maps(&self) -> PolarizationMaps {
        let s0 = self.s0.mapv(|v| if v == 0.0 { S0_EPSILON } else { v });

        let dolp = Zip::from(&self.s1)
            .and(&self.s2)
            .and(&s0)
            .par_map_collect(|&s1, &s2, &s0| ((s1 * s1 + s2 * s2).sqrt() / s0).clamp(0.0, 1.0));
        let aolp = Zip::from(&self.s1)
            .and(&self.s2)
            .par_map_collect(|&s1, &s2| aolp_degrees(s1, s2));
        let docp = Zip::from(&self.s3)
            .and(&s0)
            .par_map_collect(|&s3, &s0| (s3.abs() / (2.0 * s0)).clamp(0.0, 1.0));

        PolarizationMaps { dolp, aolp, docp }
    }
}

/// Stokes parameters followed by DoLP/AoLP/DoCP in one call
pub fn polarization_maps(images: &[ImageBuffer]) -> Result<PolarizationMaps> {
    Ok(stokes_parameters(images)?.polarization_maps())
}

/// Half the Stokes angle in degrees, shifted by 90 and wrapped into [0, 180)
fn aolp_degrees(s1: f32, s2: f32) -> f32 {
    let degrees = (s2.atan2(s1) / 2.0).to_degrees() + 90.0;
    let wrapped = degrees.rem_euclid(180.0);
    // rem_euclid can round up to exactly 180 for tiny negative inputs
    if wrapped >= 180.0 {
        0.0
    } else {
        wrapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn constant_images(values: [u8; 4]) -> Vec<ImageBuffer> {
        values
            .iter()
            .map(|&v| ImageBuffer::Gray(Array2::from_elem((4, 4), v)))
            .collect()
    }

    #[test]
    fn test_known_intensities() {
        let stokes = stokes_parameters(&constant_images([200, 150, 100, 50])).unwrap();
        assert_abs_diff_eq!(stokes.s0[[0, 0]], 250.0);
        assert_abs_diff_eq!(stokes.s1[[0, 0]], 100.0);
        assert_abs_diff_eq!(stokes.s2[[0, 0]], 100.0);
        assert_abs_diff_eq!(stokes.s3[[0, 0]], -100.0);

        let maps = stokes.polarization_maps();
        assert_abs_diff_eq!(maps.dolp[[1, 1]], 2f32.sqrt() * 100.0 / 250.0, epsilon = 1e-5);
        assert_abs_diff_eq!(maps.aolp[[1, 1]], 112.5, epsilon = 1e-4);
        assert_abs_diff_eq!(maps.docp[[1, 1]], 0.2, epsilon = 1e-6);
    }

    #[test]
    fn test_fully_polarized_dolp_clamps_to_one() {
        // Only the 0° polarizer passes light
        let maps = polarization_maps(&constant_images([255, 0, 0, 0])).unwrap();
        assert_abs_diff_eq!(maps.dolp[[0, 0]], 1.0);
        assert_abs_diff_eq!(maps.aolp[[0, 0]], 90.0, epsilon = 1e-3);
    }

    #[test]
    fn test_degenerate_inputs_stay_in_range() {
        for values in [[0, 0, 0, 0], [255, 255, 255, 255], [0, 255, 0, 0], [0, 0, 255, 0]] {
            let maps = polarization_maps(&constant_images(values)).unwrap();
            for &v in maps.dolp.iter().chain(maps.docp.iter()) {
                assert!(v.is_finite() && (0.0..=1.0).contains(&v), "{values:?} -> {v}");
            }
            for &v in maps.aolp.iter() {
                assert!((0.0..180.0).contains(&v), "{values:?} -> {v}");
            }
        }
    }

    #[test]
    fn test_aolp_wraps_half_open_range() {
        // S2 = 0, S1 < 0 puts atan2 at +pi, which must land on 0 rather than 180
        assert_abs_diff_eq!(aolp_degrees(-10.0, 0.0), 0.0, epsilon = 1e-3);
        assert_abs_diff_eq!(aolp_degrees(-10.0, -0.0), 0.0, epsilon = 1e-3);
        assert_abs_diff_eq!(aolp_degrees(0.0, 0.0), 90.0, epsilon = 1e-3);
        assert!(aolp_degrees(-10.0, -1e-7) < 180.0);
    }

    #[test]
    fn test_color_inputs_are_reduced_to_gray() {
        let color: Vec<ImageBuffer> = [200u8, 150, 100, 50]
            .iter()
            .map(|&v| ImageBuffer::Color(ndarray::Array3::from_elem((4, 4, 3), v)))
            .collect();
        let maps = polarization_maps(&color).unwrap();
        assert_abs_diff_eq!(maps.aolp[[0, 0]], 112.5, epsilon = 1e-4);
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let three = &constant_images([1, 2, 3, 4])[..3];
        assert!(matches!(
            stokes_parameters(three),
            Err(PolMathError::ChannelMismatch { expected: 4, actual: 3 })
        ));

        let mut mixed = constant_images([1, 2, 3, 4]);
        mixed[2] = ImageBuffer::Gray(Array2::zeros((4, 8)));
        assert!(matches!(
            stokes_parameters(&mixed),
            Err(PolMathError::ShapeMismatch { .. })
        ));

        let mut with_map = constant_images([1, 2, 3, 4]);
        with_map[0] = ImageBuffer::Map(Array2::zeros((4, 4)));
        assert!(stokes_parameters(&with_map).is_err());
    }
}
