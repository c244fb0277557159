//! Brightness, contrast, sharpening and denoising
//!
//! Steps run in that order on each channel as an f32 plane. 8-bit images are
//! clamped to [0, 255] after every step; float maps use a full scale of 1.0
//! and are left unclamped.

use crate::buffer::ImageBuffer;
use ndarray::{Array2, Axis, Zip};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnhanceSettings {
    /// 1.0 leaves the image unchanged; each 0.1 adds a tenth of full scale
    pub brightness: f32,
    /// Multiplier applied before the brightness offset
    pub contrast: f32,
    /// 1.0 is the classic 3x3 sharpen kernel (9 centre, -1 around)
    pub sharpness: f32,
    /// Blend factor towards the 3x3 box mean, clamped to [0, 1]
    pub denoise: f32,
}

impl Default for EnhanceSettings {
    fn default() -> Self {
        Self {
            brightness: 1.0,
            contrast: 1.0,
            sharpness: 0.0,
            denoise: 0.0,
        }
    }
}

impl EnhanceSettings {
    pub fn is_identity(&self) -> bool {
        self.brightness == 1.0 && self.contrast == 1.0 && self.sharpness <= 0.0 && self.denoise <= 0.0
    }
}

pub fn enhance(image: &ImageBuffer, settings: &EnhanceSettings) -> ImageBuffer {
    if settings.is_identity() {
        return image.clone();
    }

    match image {
        ImageBuffer::Gray(gray) => {
            let plane = enhance_plane(gray.mapv(f32::from), settings, 255.0, true);
            ImageBuffer::Gray(plane.mapv(|v| v.round() as u8))
        }
        ImageBuffer::Color(rgb) => {
            let mut out = rgb.clone();
            for c in 0..3 {
                let plane = enhance_plane(
                    rgb.index_axis(Axis(2), c).mapv(f32::from),
                    settings,
                    255.0,
                    true,
                );
                Zip::from(out.index_axis_mut(Axis(2), c))
                    .and(&plane)
                    .for_each(|o, &v| *o = v.round() as u8);
            }
            ImageBuffer::Color(out)
        }
        ImageBuffer::Map(map) => ImageBuffer::Map(enhance_plane(map.clone(), settings, 1.0, false)),
    }
}

fn enhance_plane(
    mut plane: Array2<f32>,
    settings: &EnhanceSettings,
    full_scale: f32,
    clamp: bool,
) -> Array2<f32> {
    let limit = move |v: f32| if clamp { v.clamp(0.0, full_scale) } else { v };

    if settings.brightness != 1.0 || settings.contrast != 1.0 {
        let offset = (settings.brightness - 1.0) * full_scale;
        let contrast = settings.contrast;
        plane.par_mapv_inplace(|v| limit(v * contrast + offset));
    }

    if settings.sharpness > 0.0 {
        let strength = settings.sharpness;
        let sums = box_sum3x3(&plane);
        Zip::from(&mut plane)
            .and(&sums)
            .par_for_each(|p, &sum| *p = limit(*p + strength * (9.0 * *p - sum)));
    }

    if settings.denoise > 0.0 {
        let d = settings.denoise.min(1.0);
        let sums = box_sum3x3(&plane);
        Zip::from(&mut plane)
            .and(&sums)
            .par_for_each(|p, &sum| *p = limit((1.0 - d) * *p + d * sum / 9.0));
    }

    plane
}

/// Sum over each pixel's 3x3 neighbourhood, replicating edge pixels
fn box_sum3x3(plane: &Array2<f32>) -> Array2<f32> {
    let (h, w) = plane.dim();
    let mut sums = Array2::<f32>::zeros((h, w));
    if h == 0 || w == 0 {
        return sums;
    }
    let (max_y, max_x) = (h as isize - 1, w as isize - 1);

    Zip::indexed(&mut sums).par_for_each(|(y, x), s| {
        let mut acc = 0.0;
        for dy in -1isize..=1 {
            let ny = (y as isize + dy).clamp(0, max_y) as usize;
            for dx in -1isize..=1 {
                let nx = (x as isize + dx).clamp(0, max_x) as usize;
                acc += plane[[ny, nx]];
            }
        }
        *s = acc;
    });
    sums
}
