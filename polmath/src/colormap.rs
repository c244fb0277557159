//! False-color rendering of polarization maps

use crate::buffer::ImageBuffer;
use crate::stokes::PolarizationMaps;
use ndarray::{Array2, Array3, Axis, Zip};

/// Piecewise-linear JET ramp for `t` in [0, 1]
fn jet(t: f32) -> [u8; 3] {
    let t = if t.is_finite() { t.clamp(0.0, 1.0) } else { 0.0 };
    let channel = |center: f32| ((1.5 - (4.0 * t - center).abs()).clamp(0.0, 1.0) * 255.0).round() as u8;
    [channel(3.0), channel(2.0), channel(1.0)]
}

/// Fully saturated hue wheel for `t` in [0, 1]
fn hue_wheel(t: f32) -> [u8; 3] {
    let t = if t.is_finite() { t.clamp(0.0, 1.0) } else { 0.0 };
    let h = t * 6.0;
    let x = 1.0 - (h % 2.0 - 1.0).abs();
    let (r, g, b) = match h as u32 {
        0 => (1.0, x, 0.0),
        1 => (x, 1.0, 0.0),
        2 => (0.0, 1.0, x),
        3 => (0.0, x, 1.0),
        4 => (x, 0.0, 1.0),
        _ => (1.0, 0.0, x),
    };
    let to_u8 = |v: f32| (v * 255.0).round() as u8;
    [to_u8(r), to_u8(g), to_u8(b)]
}

/// White at zero, fading to red for positive and blue for negative handedness
fn diverging(v: f32) -> [u8; 3] {
    let v = if v.is_finite() { v.clamp(-1.0, 1.0) } else { 0.0 };
    let fade = ((1.0 - v.abs()) * 255.0).round() as u8;
    if v > 0.0 {
        [255, fade, fade]
    } else if v < 0.0 {
        [fade, fade, 255]
    } else {
        [255, 255, 255]
    }
}

fn render(map: &Array2<f32>, palette: impl Fn(f32) -> [u8; 3] + Sync) -> ImageBuffer {
    let (h, w) = map.dim();
    let mut rgb = Array3::<u8>::zeros((h, w, 3));
    Zip::from(rgb.lanes_mut(Axis(2)))
        .and(map)
        .par_for_each(|mut px, &v| {
            let [r, g, b] = palette(v);
            px[0] = r;
            px[1] = g;
            px[2] = b;
        });
    ImageBuffer::Color(rgb)
}

/// DoLP in [0, 1] through the JET ramp
pub fn colorize_dolp(dolp: &Array2<f32>) -> ImageBuffer {
    render(dolp, jet)
}

/// AoLP in degrees [0, 180) onto the hue wheel
pub fn colorize_aolp(aolp: &Array2<f32>) -> ImageBuffer {
    render(aolp, |deg| hue_wheel(deg / 180.0))
}

/// DoCP in [-1, 1]; the sign encodes handedness when it is known
pub fn colorize_docp(docp: &Array2<f32>) -> ImageBuffer {
    render(docp, diverging)
}

pub fn colorize_maps(maps: &PolarizationMaps) -> [ImageBuffer; 3] {
    [
        colorize_dolp(&maps.dolp),
        colorize_aolp(&maps.aolp),
        colorize_docp(&maps.docp),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn pixel(image: &ImageBuffer, y: usize, x: usize) -> [u8; 3] {
        match image {
            ImageBuffer::Color(c) => [c[[y, x, 0]], c[[y, x, 1]], c[[y, x, 2]]],
            other => panic!("expected color, got {}", other.kind_name()),
        }
    }

    #[test]
    fn test_jet_endpoints() {
        let image = colorize_dolp(&array![[0.0, 0.5, 1.0]]);
        assert_eq!(image.dims(), (1, 3));
        assert_eq!(pixel(&image, 0, 0), [0, 0, 128]);
        assert_eq!(pixel(&image, 0, 1), [128, 255, 128]);
        assert_eq!(pixel(&image, 0, 2), [128, 0, 0]);
    }

    #[test]
    fn test_aolp_hue_wheel() {
        let image = colorize_aolp(&array![[0.0, 60.0, 120.0]]);
        assert_eq!(pixel(&image, 0, 0), [255, 0, 0]);
        assert_eq!(pixel(&image, 0, 1), [0, 255, 0]);
        assert_eq!(pixel(&image, 0, 2), [0, 0, 255]);
    }

    #[test]
    fn test_docp_handedness() {
        let image = colorize_docp(&array![[0.0, 1.0, -1.0, 0.5]]);
        assert_eq!(pixel(&image, 0, 0), [255, 255, 255]);
        assert_eq!(pixel(&image, 0, 1), [255, 0, 0]);
        assert_eq!(pixel(&image, 0, 2), [0, 0, 255]);
        assert_eq!(pixel(&image, 0, 3), [255, 128, 128]);
    }

    #[test]
    fn test_non_finite_values_do_not_panic() {
        let image = colorize_dolp(&array![[f32::NAN, f32::INFINITY]]);
        assert_eq!(pixel(&image, 0, 0), [0, 0, 128]);
    }
}
