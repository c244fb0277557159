//! Frame sources feeding the pipeline
//!
//! Camera drivers live outside this crate; they plug in through
//! [`FrameSource`] and [`CameraControl`]. Two sources ship here: a raw file
//! loader and a synthetic polarization scene for demos and tests.

use crate::error::{PolcamError, Result};
use crate::event_bus::EventBus;
use crate::events::EventPayload;
use ndarray::Array2;
use polmath::{validate_mosaic, ImageBuffer, MIN_MOSAIC_SIZE};
use std::path::{Path, PathBuf};

/// Anything that produces raw mosaic frames
pub trait FrameSource: Send {
    /// Next frame, or `None` if nothing is available right now
    fn get_frame(&mut self) -> Option<ImageBuffer>;

    fn is_connected(&self) -> bool;
}

/// Exposure, gain and white-balance controls of a camera
///
/// Calls may be slow; they are made from the caller's thread and never from
/// the pipeline worker.
pub trait CameraControl {
    fn exposure_time_us(&self) -> Result<f64>;
    fn set_exposure_time_us(&mut self, exposure_us: f64) -> Result<()>;
    fn set_exposure_auto(&mut self, auto: bool) -> Result<()>;

    fn gain_db(&self) -> Result<f64>;
    fn set_gain_db(&mut self, gain_db: f64) -> Result<()>;
    fn set_gain_auto(&mut self, auto: bool) -> Result<()>;

    fn set_white_balance_auto(&mut self, auto: bool) -> Result<()>;
}

/// Load one mosaic frame from disk
///
/// Files with a `.raw` extension are headerless 8-bit dumps and need
/// `dims = Some((width, height))`; anything else is decoded with the `image`
/// crate and reduced to 8-bit luma.
pub fn load_raw_frame<P: AsRef<Path>>(path: P, dims: Option<(usize, usize)>) -> Result<ImageBuffer> {
    let path = path.as_ref();
    let headerless = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("raw"));

    let frame = if headerless {
        let (width, height) = dims.ok_or_else(|| {
            PolcamError::validation(format!(
                "{} is a headerless raw file; width and height are required",
                path.display()
            ))
        })?;
        let expected = width.checked_mul(height).ok_or_else(|| {
            PolcamError::validation(format!("raw frame size {width}x{height} overflows"))
        })?;
        let bytes = std::fs::read(path)?;
        if bytes.len() != expected {
            return Err(PolcamError::validation(format!(
                "{} holds {} bytes, expected {}x{} = {}",
                path.display(),
                bytes.len(),
                width,
                height,
                expected
            )));
        }
        let pixels = Array2::from_shape_vec((height, width), bytes)
            .map_err(|e| PolcamError::validation(e.to_string()))?;
        ImageBuffer::Gray(pixels)
    } else {
        ImageBuffer::from_gray_image(&image::open(path)?.to_luma8())
    };

    validate_mosaic(&frame)?;
    Ok(frame)
}

/// Serves a frame loaded from disk once per `rewind`
pub struct RawFileSource {
    path: PathBuf,
    frame: ImageBuffer,
    pending: bool,
}

impl RawFileSource {
    /// Load the file and announce it with `RawFileLoaded`
    pub fn open<P: AsRef<Path>>(path: P, dims: Option<(usize, usize)>, bus: &EventBus) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let frame = load_raw_frame(&path, dims)?;
        log::info!(
            "Loaded raw frame {} ({}x{})",
            path.display(),
            frame.width(),
            frame.height()
        );
        bus.emit(EventPayload::RawFileLoaded {
            path: path.clone(),
            width: frame.width(),
            height: frame.height(),
        });
        Ok(Self {
            path,
            frame,
            pending: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frame(&self) -> &ImageBuffer {
        &self.frame
    }

    /// Make the frame available again
    pub fn rewind(&mut self) {
        self.pending = true;
    }
}

impl FrameSource for RawFileSource {
    fn get_frame(&mut self) -> Option<ImageBuffer> {
        if !self.pending {
            return None;
        }
        self.pending = false;
        Some(self.frame.clone())
    }

    /// Connected until its frame has been taken
    fn is_connected(&self) -> bool {
        self.pending
    }
}

/// Deterministic partially polarized scene
///
/// Every pixel sees light with the same degree and angle of polarization,
/// following Malus's law behind each micro-polarizer. The polarization angle
/// advances by `aolp_step` degrees per frame. Exposure and gain scale the
/// intensity like a real sensor would, saturating at 255.
pub struct SyntheticSource {
    width: usize,
    height: usize,
    /// Mean intensity at the reference exposure and 0 dB gain
    intensity: f64,
    dolp: f64,
    aolp_degrees: f64,
    aolp_step: f64,
    exposure_us: f64,
    gain_db: f64,
    frames: u64,
    max_frames: Option<u64>,
    connected: bool,
}

const REFERENCE_EXPOSURE_US: f64 = 10_000.0;

impl SyntheticSource {
    pub fn new(width: usize, height: usize) -> Result<Self> {
        if width < MIN_MOSAIC_SIZE
            || height < MIN_MOSAIC_SIZE
            || width % MIN_MOSAIC_SIZE != 0
            || height % MIN_MOSAIC_SIZE != 0
        {
            return Err(PolcamError::validation(format!(
                "synthetic frame {width}x{height} must be at least {MIN_MOSAIC_SIZE}x{MIN_MOSAIC_SIZE} and a multiple of {MIN_MOSAIC_SIZE}"
            )));
        }
        Ok(Self {
            width,
            height,
            intensity: 100.0,
            dolp: 0.5,
            aolp_degrees: 30.0,
            aolp_step: 0.0,
            exposure_us: REFERENCE_EXPOSURE_US,
            gain_db: 0.0,
            frames: 0,
            max_frames: None,
            connected: true,
        })
    }

    pub fn with_polarization(mut self, dolp: f64, aolp_degrees: f64) -> Self {
        self.dolp = dolp.clamp(0.0, 1.0);
        self.aolp_degrees = aolp_degrees;
        self
    }

    pub fn with_intensity(mut self, intensity: f64) -> Self {
        self.intensity = intensity.max(0.0);
        self
    }

    pub fn with_rotation(mut self, degrees_per_frame: f64) -> Self {
        self.aolp_step = degrees_per_frame;
        self
    }

    /// Disconnect after producing `frames` frames
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.max_frames = Some(frames);
        self
    }

    pub fn disconnect(&mut self) {
        self.connected = false;
    }

    pub fn frames_produced(&self) -> u64 {
        self.frames
    }

    /// Mosaic for the current frame without advancing the sequence
    pub fn render(&self) -> ImageBuffer {
        let scale = (self.exposure_us / REFERENCE_EXPOSURE_US) * 10f64.powf(self.gain_db / 20.0);
        let mean = self.intensity * scale;
        let phi = (self.aolp_degrees + self.aolp_step * self.frames as f64).to_radians();
        let sample = |theta_degrees: f64| -> u8 {
            let theta = theta_degrees.to_radians();
            let value = mean * (1.0 + self.dolp * (2.0 * (theta - phi)).cos());
            value.round().clamp(0.0, 255.0) as u8
        };
        // Same 2x2 orientation layout as the sensor
        let (i090, i045, i135, i000) = (sample(90.0), sample(45.0), sample(135.0), sample(0.0));

        ImageBuffer::Gray(Array2::from_shape_fn((self.height, self.width), |(y, x)| {
            match (y % 2, x % 2) {
                (0, 0) => i090,
                (0, 1) => i045,
                (1, 0) => i135,
                _ => i000,
            }
        }))
    }
}

impl FrameSource for SyntheticSource {
    fn get_frame(&mut self) -> Option<ImageBuffer> {
        if !self.is_connected() {
            return None;
        }
        let frame = self.render();
        self.frames += 1;
        if self.max_frames.is_some_and(|limit| self.frames >= limit) {
            self.connected = false;
        }
        Some(frame)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

impl CameraControl for SyntheticSource {
    fn exposure_time_us(&self) -> Result<f64> {
        Ok(self.exposure_us)
    }

    fn set_exposure_time_us(&mut self, exposure_us: f64) -> Result<()> {
        if !(exposure_us > 0.0 && exposure_us.is_finite()) {
            return Err(PolcamError::validation(format!(
                "exposure must be positive, got {exposure_us}"
            )));
        }
        self.exposure_us = exposure_us;
        Ok(())
    }

    fn set_exposure_auto(&mut self, auto: bool) -> Result<()> {
        if auto {
            self.exposure_us = REFERENCE_EXPOSURE_US;
        }
        Ok(())
    }

    fn gain_db(&self) -> Result<f64> {
        Ok(self.gain_db)
    }

    fn set_gain_db(&mut self, gain_db: f64) -> Result<()> {
        if !(0.0..=24.0).contains(&gain_db) {
            return Err(PolcamError::validation(format!(
                "gain must be within 0..=24 dB, got {gain_db}"
            )));
        }
        self.gain_db = gain_db;
        Ok(())
    }

    fn set_gain_auto(&mut self, auto: bool) -> Result<()> {
        if auto {
            self.gain_db = 0.0;
        }
        Ok(())
    }

    fn set_white_balance_auto(&mut self, _auto: bool) -> Result<()> {
        // The synthetic scene is achromatic
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventBusConfig;
    use crate::event_bus::{callback, Delivery};
    use crate::events::EventKind;
    use approx::assert_abs_diff_eq;
    use crossbeam::channel::unbounded;
    use polmath::{demosaic, polarization_maps, SensorLayout};
    use std::io::Write;

    fn first_pixel(image: &ImageBuffer) -> u8 {
        match image {
            ImageBuffer::Gray(g) => g[[0, 0]],
            other => panic!("expected gray, got {}", other.kind_name()),
        }
    }

    #[test]
    fn test_synthetic_scene_round_trips_through_math() {
        let mut source = SyntheticSource::new(16, 8).unwrap().with_polarization(0.5, 30.0);
        let frame = source.get_frame().unwrap();
        assert_eq!(frame.dims(), (8, 16));

        let channels = demosaic(&frame, SensorLayout::Mono).unwrap();
        let maps = polarization_maps(&channels).unwrap();
        assert_abs_diff_eq!(maps.dolp[[4, 4]], 0.5, epsilon = 0.01);
        // Reported angle carries the +90 degree offset
        assert_abs_diff_eq!(maps.aolp[[4, 4]], 120.0, epsilon = 0.5);
    }

    #[test]
    fn test_synthetic_exposure_and_gain_scale_intensity() {
        let mut source = SyntheticSource::new(4, 4).unwrap().with_polarization(0.0, 0.0);
        assert_eq!(first_pixel(&source.render()), 100);

        source.set_exposure_time_us(20_000.0).unwrap();
        assert_eq!(first_pixel(&source.render()), 200);
        source.set_gain_db(20.0).unwrap();
        assert_eq!(first_pixel(&source.render()), 255);

        assert!(source.set_exposure_time_us(0.0).is_err());
        assert!(source.set_gain_db(-1.0).is_err());
        source.set_gain_auto(true).unwrap();
        assert_eq!(source.gain_db().unwrap(), 0.0);
    }

    #[test]
    fn test_synthetic_frame_limit_disconnects() {
        let mut source = SyntheticSource::new(4, 4).unwrap().with_frame_limit(2);
        assert!(source.get_frame().is_some());
        assert!(source.is_connected());
        assert!(source.get_frame().is_some());
        assert!(!source.is_connected());
        assert!(source.get_frame().is_none());
        assert_eq!(source.frames_produced(), 2);
    }

    #[test]
    fn test_synthetic_rejects_bad_dims() {
        assert!(SyntheticSource::new(6, 8).is_err());
        assert!(SyntheticSource::new(0, 0).is_err());
    }

    #[test]
    fn test_headerless_raw_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.raw");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&(0..32u8).collect::<Vec<_>>()).unwrap();

        let frame = load_raw_frame(&path, Some((8, 4))).unwrap();
        assert_eq!(frame.dims(), (4, 8));
        match &frame {
            ImageBuffer::Gray(g) => assert_eq!(g[[1, 0]], 8),
            other => panic!("expected gray, got {}", other.kind_name()),
        }

        assert!(matches!(load_raw_frame(&path, None), Err(PolcamError::Validation(_))));
        assert!(matches!(
            load_raw_frame(&path, Some((8, 8))),
            Err(PolcamError::Validation(_))
        ));
        assert!(matches!(
            load_raw_frame(&path, Some((usize::MAX, 2))),
            Err(PolcamError::Validation(_))
        ));
    }

    #[test]
    fn test_encoded_file_and_bad_shape() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("frame.png");
        image::GrayImage::from_fn(8, 8, |x, y| image::Luma([(x * y) as u8]))
            .save(&good)
            .unwrap();
        assert_eq!(load_raw_frame(&good, None).unwrap().dims(), (8, 8));

        let bad = dir.path().join("odd.png");
        image::GrayImage::new(6, 8).save(&bad).unwrap();
        assert!(matches!(load_raw_frame(&bad, None), Err(PolcamError::Math(_))));

        assert!(load_raw_frame(dir.path().join("missing.png"), None).is_err());
    }

    #[test]
    fn test_raw_file_source_announces_and_serves_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.raw");
        std::fs::write(&path, vec![7u8; 64]).unwrap();

        let bus = EventBus::new(EventBusConfig::default()).unwrap();
        let (tx, rx) = unbounded();
        bus.subscribe(
            EventKind::RawFileLoaded,
            callback(move |event| {
                tx.send(event.clone())?;
                Ok(())
            }),
            Delivery::Sync,
        );

        let mut source = RawFileSource::open(&path, Some((8, 8)), &bus).unwrap();
        bus.flush();
        let event = rx.try_recv().unwrap();
        assert!(matches!(
            event.payload,
            EventPayload::RawFileLoaded { width: 8, height: 8, .. }
        ));

        assert!(source.is_connected());
        assert!(source.get_frame().is_some());
        assert!(source.get_frame().is_none());
        assert!(!source.is_connected());
        source.rewind();
        assert_eq!(source.get_frame().as_ref(), Some(source.frame()));
    }
}
