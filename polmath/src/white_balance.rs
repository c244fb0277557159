//! White-balance gain estimation and application

use crate::buffer::{ImageBuffer, Roi};
use crate::error::{PolMathError, Result};
use ndarray::{ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};

/// Per-channel multipliers (one for gray images, R/G/B for color)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelGains(Vec<f32>);

impl ChannelGains {
    pub fn new(gains: Vec<f32>) -> Self {
        Self(gains)
    }

    pub fn unity(channels: usize) -> Self {
        Self(vec![1.0; channels])
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WhiteBalanceOptions {
    /// Mean brightness every channel is pulled towards
    pub target: f32,
    /// Fraction of darkest and brightest pixels ignored on each side
    pub trim_fraction: f32,
    pub min_gain: f32,
    pub max_gain: f32,
}

impl Default for WhiteBalanceOptions {
    fn default() -> Self {
        Self {
            target: 128.0,
            trim_fraction: 0.05,
            min_gain: 0.1,
            max_gain: 3.0,
        }
    }
}

impl WhiteBalanceOptions {
    pub fn validate(&self) -> Result<()> {
        if !(self.target > 0.0 && self.target.is_finite()) {
            return Err(PolMathError::invalid_parameter(format!(
                "white balance target must be positive, got {}",
                self.target
            )));
        }
        if !(0.0..0.5).contains(&self.trim_fraction) {
            return Err(PolMathError::invalid_parameter(format!(
                "trim fraction must be in [0, 0.5), got {}",
                self.trim_fraction
            )));
        }
        if !(self.min_gain > 0.0 && self.min_gain <= self.max_gain) {
            return Err(PolMathError::invalid_parameter(format!(
                "gain range [{}, {}] is empty or non-positive",
                self.min_gain, self.max_gain
            )));
        }
        Ok(())
    }
}

/// Estimate gains that pull each channel's trimmed mean towards `options.target`
///
/// Only pixels inside `roi` are sampled when it is given; an ROI that misses
/// the image entirely falls back to the whole frame.
pub fn estimate_gains(
    image: &ImageBuffer,
    roi: Option<Roi>,
    options: &WhiteBalanceOptions,
) -> Result<ChannelGains> {
    options.validate()?;
    let (height, width) = image.dims();
    let region = roi
        .and_then(|r| r.clip(width, height))
        .unwrap_or_else(|| Roi::new(0, 0, width, height));

    let means: Vec<f32> = match image {
        ImageBuffer::Gray(gray) => vec![trimmed_mean(
            &histogram(region_view(gray.view(), region)),
            options.trim_fraction,
        )],
        ImageBuffer::Color(rgb) => (0..3)
            .map(|c| {
                let plane = rgb.index_axis(Axis(2), c);
                trimmed_mean(&histogram(region_view(plane, region)), options.trim_fraction)
            })
            .collect(),
        ImageBuffer::Map(_) => {
            return Err(PolMathError::invalid_shape(
                "8-bit gray or color image",
                "float map",
            ))
        }
    };

    // Equivalent to normalising each channel against the mean of all channels
    // and then scaling that mean to the target
    let gains = means
        .iter()
        .map(|&mean| {
            if mean > 0.0 {
                (options.target / mean).clamp(options.min_gain, options.max_gain)
            } else {
                1.0
            }
        })
        .collect();
    Ok(ChannelGains(gains))
}

/// Multiply every channel by its gain, saturating at 255
pub fn apply_gains(image: &ImageBuffer, gains: &ChannelGains) -> Result<ImageBuffer> {
    if gains.len() != image.channels() {
        return Err(PolMathError::ChannelMismatch {
            expected: image.channels(),
            actual: gains.len(),
        });
    }
    let scale = |v: u8, g: f32| (f32::from(v) * g).round().clamp(0.0, 255.0) as u8;

    match image {
        ImageBuffer::Gray(gray) => {
            let g = gains.0[0];
            Ok(ImageBuffer::Gray(gray.mapv(|v| scale(v, g))))
        }
        ImageBuffer::Color(rgb) => {
            let mut out = rgb.clone();
            Zip::from(out.lanes_mut(Axis(2))).par_for_each(|mut px| {
                for (c, v) in px.iter_mut().enumerate() {
                    *v = scale(*v, gains.0[c]);
                }
            });
            Ok(ImageBuffer::Color(out))
        }
        ImageBuffer::Map(_) => Err(PolMathError::invalid_shape(
            "8-bit gray or color image",
            "float map",
        )),
    }
}

fn region_view(plane: ArrayView2<'_, u8>, roi: Roi) -> ArrayView2<'_, u8> {
    plane.slice_move(ndarray::s![roi.y..roi.y + roi.height, roi.x..roi.x + roi.width])
}

fn histogram(plane: ArrayView2<'_, u8>) -> [u64; 256] {
    let mut hist = [0u64; 256];
    for &v in plane.iter() {
        hist[v as usize] += 1;
    }
    hist
}

/// Mean of the histogram with `trim` of the samples dropped from each end
fn trimmed_mean(hist: &[u64; 256], trim: f32) -> f32 {
    let total: u64 = hist.iter().sum();
    if total == 0 {
        return 0.0;
    }
    let cut = (total as f64 * f64::from(trim)).floor() as u64;
    let (start, end) = if total > 2 * cut {
        (cut, total - cut)
    } else {
        (0, total)
    };

    let mut rank = 0u64;
    let mut sum = 0f64;
    let mut count = 0u64;
    for (value, &n) in hist.iter().enumerate() {
        let lo = rank.max(start);
        let hi = (rank + n).min(end);
        if hi > lo {
            sum += value as f64 * (hi - lo) as f64;
            count += hi - lo;
        }
        rank += n;
    }
    (sum / count as f64) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, Array3};

    #[test]
    fn test_gains_pull_channels_to_target() {
        let mut rgb = Array3::<u8>::zeros((4, 4, 3));
        rgb.index_axis_mut(Axis(2), 0).fill(64);
        rgb.index_axis_mut(Axis(2), 1).fill(128);
        rgb.index_axis_mut(Axis(2), 2).fill(100);
        let gains = estimate_gains(&ImageBuffer::Color(rgb), None, &WhiteBalanceOptions::default())
            .unwrap();
        assert_eq!(gains.len(), 3);
        assert_abs_diff_eq!(gains.as_slice()[0], 2.0);
        assert_abs_diff_eq!(gains.as_slice()[1], 1.0);
        assert_abs_diff_eq!(gains.as_slice()[2], 1.28, epsilon = 1e-6);
    }

    #[test]
    fn test_gains_are_clamped() {
        let dark = ImageBuffer::Gray(Array2::from_elem((4, 4), 10));
        let gains = estimate_gains(&dark, None, &WhiteBalanceOptions::default()).unwrap();
        assert_abs_diff_eq!(gains.as_slice()[0], 3.0);

        let black = ImageBuffer::Gray(Array2::zeros((4, 4)));
        let gains = estimate_gains(&black, None, &WhiteBalanceOptions::default()).unwrap();
        assert_abs_diff_eq!(gains.as_slice()[0], 1.0);
    }

    #[test]
    fn test_trimming_ignores_outliers() {
        // 95 mid-gray pixels and 5 saturated hot pixels
        let mut values = vec![100u8; 95];
        values.extend([255u8; 5]);
        let image = ImageBuffer::Gray(Array2::from_shape_vec((10, 10), values).unwrap());

        let trimmed = estimate_gains(&image, None, &WhiteBalanceOptions::default()).unwrap();
        assert_abs_diff_eq!(trimmed.as_slice()[0], 1.28, epsilon = 1e-5);

        let untrimmed = WhiteBalanceOptions {
            trim_fraction: 0.0,
            ..Default::default()
        };
        let raw = estimate_gains(&image, None, &untrimmed).unwrap();
        assert!(raw.as_slice()[0] < trimmed.as_slice()[0]);
    }

    #[test]
    fn test_roi_restricts_sampling() {
        let mut gray = Array2::<u8>::from_elem((8, 8), 200);
        gray.slice_mut(ndarray::s![0..4, 0..4]).fill(64);
        let image = ImageBuffer::Gray(gray);
        let gains = estimate_gains(
            &image,
            Some(Roi::new(0, 0, 4, 4)),
            &WhiteBalanceOptions::default(),
        )
        .unwrap();
        assert_abs_diff_eq!(gains.as_slice()[0], 2.0);

        // Fully outside: whole frame is used
        let fallback = estimate_gains(
            &image,
            Some(Roi::new(100, 100, 4, 4)),
            &WhiteBalanceOptions::default(),
        )
        .unwrap();
        assert!(fallback.as_slice()[0] < 1.0);
    }

    #[test]
    fn test_apply_gains_saturates() {
        let image = ImageBuffer::Gray(ndarray::array![[100, 200]]);
        let out = apply_gains(&image, &ChannelGains::new(vec![1.5])).unwrap();
        assert_eq!(out, ImageBuffer::Gray(ndarray::array![[150, 255]]));

        assert!(matches!(
            apply_gains(&image, &ChannelGains::unity(3)),
            Err(PolMathError::ChannelMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_options() {
        let image = ImageBuffer::Gray(Array2::zeros((4, 4)));
        let options = WhiteBalanceOptions {
            trim_fraction: 0.6,
            ..Default::default()
        };
        assert!(estimate_gains(&image, None, &options).is_err());
        let options = WhiteBalanceOptions {
            min_gain: 2.0,
            max_gain: 1.0,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }
}
