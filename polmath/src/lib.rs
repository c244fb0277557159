//! Pure Rust polarization image math
//!
//! This crate turns raw mosaic frames from division-of-focal-plane polarization
//! sensors into per-angle images and derived polarization maps. Everything here
//! is a pure function over [`ImageBuffer`] values: no threads are owned and no
//! state is shared, so callers are free to run it from any worker.
//!
//! ```rust,ignore
//! use polmath::{demosaic, polarization_maps, ImageBuffer, SensorLayout};
//!
//! let raw = ImageBuffer::Gray(ndarray::Array2::zeros((8, 8)));
//! let channels = demosaic(&raw, SensorLayout::Mono)?;
//! let maps = polarization_maps(&channels)?;
//! assert!(maps.dolp.iter().all(|v| (0.0..=1.0).contains(v)));
//! ```

pub mod buffer;
pub mod colormap;
pub mod demosaic;
pub mod enhance;
pub mod error;
pub mod stokes;
pub mod white_balance;

pub use buffer::{ImageBuffer, Roi};
pub use colormap::{colorize_aolp, colorize_docp, colorize_dolp, colorize_maps};
pub use demosaic::{demosaic, validate_mosaic, SensorLayout, ANGLES, MIN_MOSAIC_SIZE};
pub use enhance::{enhance, EnhanceSettings};
pub use error::{PolMathError, Result};
pub use stokes::{polarization_maps, stokes_parameters, PolarizationMaps, StokesParameters};
pub use white_balance::{apply_gains, estimate_gains, ChannelGains, WhiteBalanceOptions};
