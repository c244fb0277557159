//! Runtime configuration, loadable from JSON

use crate::error::{PolcamError, Result};
use polmath::{ImageBuffer, SensorLayout, WhiteBalanceOptions};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Threads running asynchronous subscribers
    pub async_workers: usize,
    pub thread_name_prefix: String,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            async_workers: 4,
            thread_name_prefix: "event-bus".to_string(),
        }
    }
}

/// Which result images get brightness/contrast/sharpen/denoise applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnhancementPolicy {
    /// 8-bit images only; DoLP/AoLP/DoCP maps keep their physical values
    #[default]
    VisualOnly,
    /// Every image, including float maps
    AllImages,
}

impl EnhancementPolicy {
    pub fn applies_to(self, image: &ImageBuffer) -> bool {
        match self {
            EnhancementPolicy::VisualOnly => image.is_visual(),
            EnhancementPolicy::AllImages => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub sensor: SensorLayout,
    /// Maximum memoized results; 0 disables result caching
    pub result_cache_size: usize,
    pub result_ttl_ms: u64,
    pub gain_cache_ttl_ms: u64,
    pub gain_cache_permanent: bool,
    /// Overrun threshold reported by the watchdog; `None` disables it
    pub task_deadline_ms: Option<u64>,
    pub enhancement_policy: EnhancementPolicy,
    /// Priority used by `reprocess_last_frame`
    pub reprocess_priority: i32,
    pub white_balance: WhiteBalanceOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sensor: SensorLayout::Color,
            result_cache_size: 10,
            result_ttl_ms: 2000,
            gain_cache_ttl_ms: 2000,
            gain_cache_permanent: false,
            task_deadline_ms: Some(5000),
            enhancement_policy: EnhancementPolicy::VisualOnly,
            reprocess_priority: i32::MAX,
            white_balance: WhiteBalanceOptions::default(),
        }
    }
}

impl PipelineConfig {
    pub fn result_ttl(&self) -> Duration {
        Duration::from_millis(self.result_ttl_ms)
    }

    pub fn gain_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.gain_cache_ttl_ms)
    }

    pub fn task_deadline(&self) -> Option<Duration> {
        self.task_deadline_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.result_ttl_ms == 0 {
            return Err(PolcamError::config("result_ttl_ms must be greater than 0"));
        }
        if self.gain_cache_ttl_ms == 0 {
            return Err(PolcamError::config("gain_cache_ttl_ms must be greater than 0"));
        }
        if self.task_deadline_ms == Some(0) {
            return Err(PolcamError::config("task_deadline_ms must be greater than 0"));
        }
        self.white_balance
            .validate()
            .map_err(|e| PolcamError::config(format!("white_balance: {e}")))
    }
}

/// Capture loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub frame_interval_ms: u64,
    /// Frames are skipped while this many tasks are already queued
    pub max_pending_tasks: usize,
    pub priority: i32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: 33,
            max_pending_tasks: 4,
            priority: 0,
        }
    }
}

impl StreamingConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.frame_interval_ms == 0 {
            return Err(PolcamError::config("frame_interval_ms must be greater than 0"));
        }
        Ok(())
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub event_bus: EventBusConfig,
    pub pipeline: PipelineConfig,
    pub streaming: StreamingConfig,
}

impl AppConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: AppConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        log::debug!("Loaded config from {}", path.as_ref().display());
        Self::from_json_str(&contents)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_bus.async_workers == 0 {
            return Err(PolcamError::config("event_bus.async_workers must be at least 1"));
        }
        self.pipeline.validate()?;
        self.streaming.validate()
    }
}
