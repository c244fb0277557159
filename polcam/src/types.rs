//! Core value types shared by the pipeline, the event bus and frame sources

use crate::error::{PolcamError, Result};
use polmath::{EnhanceSettings, ImageBuffer, Roi};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

/// Display/processing mode; decides what a `ProcessingResult` contains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    #[default]
    Raw,
    SingleColor,
    SingleGray,
    MergedColor,
    MergedGray,
    QuadColor,
    QuadGray,
    Polarization,
}

impl ProcessingMode {
    /// All modes in display-index order
    pub const ALL: [ProcessingMode; 8] = [
        ProcessingMode::Raw,
        ProcessingMode::SingleColor,
        ProcessingMode::SingleGray,
        ProcessingMode::MergedColor,
        ProcessingMode::MergedGray,
        ProcessingMode::QuadColor,
        ProcessingMode::QuadGray,
        ProcessingMode::Polarization,
    ];

    /// Number of images a result in this mode carries
    pub fn output_count(self) -> usize {
        match self {
            ProcessingMode::Raw
            | ProcessingMode::SingleColor
            | ProcessingMode::SingleGray
            | ProcessingMode::MergedColor
            | ProcessingMode::MergedGray => 1,
            ProcessingMode::QuadColor | ProcessingMode::QuadGray | ProcessingMode::Polarization => 4,
        }
    }

    pub fn is_gray(self) -> bool {
        matches!(
            self,
            ProcessingMode::SingleGray | ProcessingMode::MergedGray | ProcessingMode::QuadGray
        )
    }

    /// Index used by mode selectors (0 = raw .. 7 = polarization)
    pub fn to_index(self) -> usize {
        self as usize
    }

    /// Unknown indices fall back to `Raw`
    pub fn from_index(index: usize) -> Self {
        Self::ALL.get(index).copied().unwrap_or_default()
    }

    pub fn description(self) -> &'static str {
        match self {
            ProcessingMode::Raw => "Raw sensor image",
            ProcessingMode::SingleColor => "Single polarization angle, color",
            ProcessingMode::SingleGray => "Single polarization angle, grayscale",
            ProcessingMode::MergedColor => "Merged angles, color",
            ProcessingMode::MergedGray => "Merged angles, grayscale",
            ProcessingMode::QuadColor => "All four angles, color",
            ProcessingMode::QuadGray => "All four angles, grayscale",
            ProcessingMode::Polarization => "Polarization analysis",
        }
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Polarizer orientation of one demosaiced channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PolarizationAngle {
    #[default]
    Deg0,
    Deg45,
    Deg90,
    Deg135,
}

impl PolarizationAngle {
    pub const ALL: [PolarizationAngle; 4] = [
        PolarizationAngle::Deg0,
        PolarizationAngle::Deg45,
        PolarizationAngle::Deg90,
        PolarizationAngle::Deg135,
    ];

    /// Position in the demosaic output
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn degrees(self) -> u16 {
        polmath::ANGLES[self.index()]
    }

    pub fn from_degrees(degrees: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|a| a.degrees() == degrees)
    }
}

/// Live processing parameters; tasks carry an immutable copy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingParameters {
    pub white_balance_auto: bool,
    pub white_balance_roi: Option<Roi>,
    pub brightness: f32,
    pub contrast: f32,
    pub sharpness: f32,
    pub denoise: f32,
    /// Channel shown in single-angle modes
    pub selected_angle: PolarizationAngle,
    /// Keep the merged polarization image in color
    pub polarization_color: bool,
    /// White-balance the merged polarization image
    pub polarization_white_balance: bool,
}

impl Default for ProcessingParameters {
    fn default() -> Self {
        Self {
            white_balance_auto: false,
            white_balance_roi: None,
            brightness: 1.0,
            contrast: 1.0,
            sharpness: 0.0,
            denoise: 0.0,
            selected_angle: PolarizationAngle::Deg0,
            polarization_color: true,
            polarization_white_balance: false,
        }
    }
}

impl ProcessingParameters {
    /// Apply an update, returning whether anything changed
    pub fn apply(&mut self, update: &ParameterUpdate) -> bool {
        fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
            if *slot == value {
                false
            } else {
                *slot = value;
                true
            }
        }

        match *update {
            ParameterUpdate::WhiteBalanceAuto(v) => replace(&mut self.white_balance_auto, v),
            ParameterUpdate::WhiteBalanceRoi(v) => replace(&mut self.white_balance_roi, v),
            ParameterUpdate::Brightness(v) => replace(&mut self.brightness, v),
            ParameterUpdate::Contrast(v) => replace(&mut self.contrast, v),
            ParameterUpdate::Sharpness(v) => replace(&mut self.sharpness, v),
            ParameterUpdate::Denoise(v) => replace(&mut self.denoise, v),
            ParameterUpdate::SelectedAngle(v) => replace(&mut self.selected_angle, v),
            ParameterUpdate::PolarizationColor(v) => replace(&mut self.polarization_color, v),
            ParameterUpdate::PolarizationWhiteBalance(v) => {
                replace(&mut self.polarization_white_balance, v)
            }
        }
    }

    pub fn enhance_settings(&self) -> EnhanceSettings {
        EnhanceSettings {
            brightness: self.brightness,
            contrast: self.contrast,
            sharpness: self.sharpness,
            denoise: self.denoise,
        }
    }

    /// Hashable identity of every field, used in result cache keys
    pub fn fingerprint(&self) -> ParameterFingerprint {
        ParameterFingerprint {
            white_balance_auto: self.white_balance_auto,
            white_balance_roi: self.white_balance_roi,
            enhance_bits: [
                self.brightness.to_bits(),
                self.contrast.to_bits(),
                self.sharpness.to_bits(),
                self.denoise.to_bits(),
            ],
            selected_angle: self.selected_angle,
            polarization_color: self.polarization_color,
            polarization_white_balance: self.polarization_white_balance,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParameterFingerprint {
    white_balance_auto: bool,
    white_balance_roi: Option<Roi>,
    enhance_bits: [u32; 4],
    selected_angle: PolarizationAngle,
    polarization_color: bool,
    polarization_white_balance: bool,
}

/// Immutable parameters captured when a task is submitted
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSnapshot(Arc<ProcessingParameters>);

impl ParameterSnapshot {
    pub fn new(params: ProcessingParameters) -> Self {
        Self(Arc::new(params))
    }
}

impl Deref for ParameterSnapshot {
    type Target = ProcessingParameters;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// One named parameter change
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ParameterUpdate {
    WhiteBalanceAuto(bool),
    WhiteBalanceRoi(Option<Roi>),
    Brightness(f32),
    Contrast(f32),
    Sharpness(f32),
    Denoise(f32),
    SelectedAngle(PolarizationAngle),
    PolarizationColor(bool),
    PolarizationWhiteBalance(bool),
}

impl ParameterUpdate {
    pub fn name(&self) -> &'static str {
        match self {
            ParameterUpdate::WhiteBalanceAuto(_) => "white_balance_auto",
            ParameterUpdate::WhiteBalanceRoi(_) => "white_balance_roi",
            ParameterUpdate::Brightness(_) => "brightness",
            ParameterUpdate::Contrast(_) => "contrast",
            ParameterUpdate::Sharpness(_) => "sharpness",
            ParameterUpdate::Denoise(_) => "denoise",
            ParameterUpdate::SelectedAngle(_) => "selected_angle",
            ParameterUpdate::PolarizationColor(_) => "polarization_color",
            ParameterUpdate::PolarizationWhiteBalance(_) => "polarization_white_balance",
        }
    }

    pub fn validate(&self) -> Result<()> {
        let (value, min) = match *self {
            ParameterUpdate::Brightness(v) => (v, f32::MIN),
            ParameterUpdate::Contrast(v)
            | ParameterUpdate::Sharpness(v)
            | ParameterUpdate::Denoise(v) => (v, 0.0),
            ParameterUpdate::WhiteBalanceRoi(Some(roi)) if roi.width == 0 || roi.height == 0 => {
                return Err(PolcamError::validation("white balance ROI must not be empty"))
            }
            _ => return Ok(()),
        };
        if !value.is_finite() {
            return Err(PolcamError::validation(format!(
                "{} must be finite, got {}",
                self.name(),
                value
            )));
        }
        if value < min {
            return Err(PolcamError::validation(format!(
                "{} must not be negative, got {}",
                self.name(),
                value
            )));
        }
        Ok(())
    }
}

/// What one image of a result shows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageLayer {
    Raw,
    Angle(PolarizationAngle),
    Merged,
    Dolp,
    Aolp,
    Docp,
}

/// Information downstream consumers use to label or save a result
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultMetadata {
    /// Channel shown in single-angle modes
    pub angle: Option<PolarizationAngle>,
    /// Channels shown in quad mode
    pub angles: Vec<PolarizationAngle>,
    pub white_balance: bool,
    pub color: bool,
    /// One label per image, same order as `ProcessingResult::images`
    pub layers: Vec<ImageLayer>,
}

/// Output of one processed task; shared read-only between cache and subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingResult {
    pub mode: ProcessingMode,
    pub images: Vec<ImageBuffer>,
    pub metadata: ResultMetadata,
    pub timestamp: SystemTime,
}

/// Unit of work for the pipeline worker
#[derive(Debug, Clone)]
pub struct ProcessingTask {
    pub frame: Arc<ImageBuffer>,
    pub mode: ProcessingMode,
    pub params: ParameterSnapshot,
    pub priority: i32,
    pub submitted_at: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_index_round_trip() {
        for (i, mode) in ProcessingMode::ALL.iter().enumerate() {
            assert_eq!(mode.to_index(), i);
            assert_eq!(ProcessingMode::from_index(i), *mode);
        }
        assert_eq!(ProcessingMode::from_index(42), ProcessingMode::Raw);
    }

    #[test]
    fn test_mode_output_counts() {
        let counts: Vec<usize> = ProcessingMode::ALL.iter().map(|m| m.output_count()).collect();
        assert_eq!(counts, vec![1, 1, 1, 1, 1, 4, 4, 4]);
        assert!(ProcessingMode::QuadGray.is_gray());
        assert!(!ProcessingMode::Polarization.is_gray());
    }

    #[test]
    fn test_angle_lookup() {
        assert_eq!(PolarizationAngle::Deg90.degrees(), 90);
        assert_eq!(PolarizationAngle::from_degrees(135), Some(PolarizationAngle::Deg135));
        assert_eq!(PolarizationAngle::from_degrees(30), None);
    }

    #[test]
    fn test_apply_reports_changes() {
        let mut params = ProcessingParameters::default();
        assert!(!params.apply(&ParameterUpdate::Brightness(1.0)));
        assert!(params.apply(&ParameterUpdate::Brightness(1.2)));
        assert_eq!(params.brightness, 1.2);
        assert!(params.apply(&ParameterUpdate::SelectedAngle(PolarizationAngle::Deg45)));
        assert!(!params.apply(&ParameterUpdate::SelectedAngle(PolarizationAngle::Deg45)));
    }

    #[test]
    fn test_fingerprint_tracks_every_field() {
        let base = ProcessingParameters::default();
        let mut changed = base.clone();
        changed.apply(&ParameterUpdate::Denoise(0.5));
        assert_ne!(base.fingerprint(), changed.fingerprint());
        assert_eq!(base.fingerprint(), ProcessingParameters::default().fingerprint());
    }

    #[test]
    fn test_update_validation() {
        assert!(ParameterUpdate::Contrast(-0.1).validate().is_err());
        assert!(ParameterUpdate::Sharpness(f32::NAN).validate().is_err());
        assert!(ParameterUpdate::Brightness(f32::INFINITY).validate().is_err());
        assert!(ParameterUpdate::WhiteBalanceRoi(Some(Roi::new(0, 0, 0, 4)))
            .validate()
            .is_err());
        assert!(ParameterUpdate::Brightness(0.5).validate().is_ok());
        assert!(ParameterUpdate::WhiteBalanceAuto(true).validate().is_ok());
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut live = ProcessingParameters::default();
        let snapshot = ParameterSnapshot::new(live.clone());
        live.apply(&ParameterUpdate::Contrast(2.0));
        assert_eq!(snapshot.contrast, 1.0);
    }
}
