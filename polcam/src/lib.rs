//! Polarization Camera Processing
//!
//! Turns raw mosaic frames from a division-of-focal-plane polarization camera
//! into display images and polarization maps without blocking the caller.
//!
//! The pieces:
//! - [`EventBus`]: typed publish/subscribe hub with a dispatcher thread and a
//!   pool for asynchronous subscribers
//! - [`ProcessingPipeline`]: priority task queue drained by one worker, with
//!   result memoization, white-balance gain caching and an overrun watchdog
//! - [`StreamingSession`]: capture loop pulling from any [`FrameSource`]
//! - [`polmath`]: the pure image math (demosaic, Stokes, enhancement)
//!
//! ```rust,ignore
//! use polcam::{AppConfig, EventBus, ProcessingMode, ProcessingPipeline};
//! use std::sync::Arc;
//!
//! let config = AppConfig::default();
//! let bus = Arc::new(EventBus::new(config.event_bus.clone())?);
//! let pipeline = ProcessingPipeline::new(bus, config.pipeline.clone())?;
//! pipeline.set_mode(ProcessingMode::Polarization);
//! pipeline.process_frame(raw_frame, 0);
//! ```

pub mod config;
pub mod error;
pub mod event_bus;
pub mod events;
pub mod gain_cache;
pub mod pipeline;
pub mod source;
pub mod streaming;
pub mod task_queue;
pub mod types;

pub use polmath;

pub use config::{AppConfig, EnhancementPolicy, EventBusConfig, PipelineConfig, StreamingConfig};
pub use error::{PolcamError, Result};
pub use event_bus::{callback, Callback, Delivery, EventBus, EventBusStats};
pub use events::{Event, EventKind, EventPayload, ParameterChange};
pub use gain_cache::{GainKey, GainScope, TimedCache, WhiteBalanceCache};
pub use pipeline::{PipelineStats, ProcessingPipeline};
pub use source::{load_raw_frame, CameraControl, FrameSource, RawFileSource, SyntheticSource};
pub use streaming::{StreamingSession, StreamingStats};
pub use task_queue::TaskQueue;
pub use types::{
    ImageLayer, ParameterSnapshot, ParameterUpdate, PolarizationAngle, ProcessingMode,
    ProcessingParameters, ProcessingResult, ProcessingTask, ResultMetadata,
};

/// Install the `env_logger` backend, defaulting to `info`
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

/// Get library version information
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
