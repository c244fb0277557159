//! Priority-queue driven frame processing
//!
//! Producers call [`ProcessingPipeline::process_frame`], which snapshots the
//! current mode and parameters into a task and returns immediately. One worker
//! thread serves tasks by priority, consults the short-lived result cache,
//! dispatches on the mode and publishes the outcome on the event bus. A task
//! failure (error or panic) is reported as an `ErrorOccurred` event and the
//! worker moves on.

use crate::config::PipelineConfig;
use crate::error::{panic_message, PolcamError, Result};
use crate::event_bus::{Callback, Delivery, EventBus};
use crate::events::{EventKind, EventPayload, ParameterChange};
use crate::gain_cache::{GainKey, GainScope, TimedCache, WhiteBalanceCache};
use crate::task_queue::TaskQueue;
use crate::types::{
    ImageLayer, ParameterFingerprint, ParameterSnapshot, ParameterUpdate, PolarizationAngle,
    ProcessingMode, ProcessingParameters, ProcessingResult, ProcessingTask, ResultMetadata,
};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use polmath::{
    apply_gains, demosaic, enhance, estimate_gains, polarization_maps, ImageBuffer, Roi,
};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

/// Counters since the pipeline was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub submitted: u64,
    pub processed: u64,
    pub failed: u64,
    pub cache_hits: u64,
    pub cancelled: u64,
    pub overruns: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    cache_hits: AtomicU64,
    cancelled: AtomicU64,
    overruns: AtomicU64,
}

struct InFlight {
    mode: ProcessingMode,
    started: Instant,
    overrun_reported: bool,
}

/// Exact-memoization key: frame content, mode and every parameter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ResultKey {
    frame: [u8; 32],
    mode: ProcessingMode,
    params: ParameterFingerprint,
}

impl ResultKey {
    fn new(task: &ProcessingTask) -> Self {
        Self {
            frame: frame_digest(&task.frame),
            mode: task.mode,
            params: task.params.fingerprint(),
        }
    }
}

fn frame_digest(frame: &ImageBuffer) -> [u8; 32] {
    let (height, width) = frame.dims();
    let mut hasher = blake3::Hasher::new();
    hasher.update(frame.kind_name().as_bytes());
    hasher.update(&(height as u64).to_le_bytes());
    hasher.update(&(width as u64).to_le_bytes());
    hasher.update(&frame.as_bytes());
    *hasher.finalize().as_bytes()
}

struct PipelineShared {
    bus: Arc<EventBus>,
    config: PipelineConfig,
    queue: TaskQueue<ProcessingTask>,
    mode: Mutex<ProcessingMode>,
    params: Mutex<ProcessingParameters>,
    last_frame: Mutex<Option<Arc<ImageBuffer>>>,
    last_result: Mutex<Option<Arc<ProcessingResult>>>,
    results: Mutex<TimedCache<ResultKey, Arc<ProcessingResult>>>,
    gains: WhiteBalanceCache,
    in_flight: Mutex<Option<InFlight>>,
    counters: Counters,
}

pub struct ProcessingPipeline {
    shared: Arc<PipelineShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    watchdog: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
}

impl ProcessingPipeline {
    /// Create the pipeline and start its worker (and watchdog, if configured)
    pub fn new(bus: Arc<EventBus>, config: PipelineConfig) -> Result<Self> {
        let shared = Arc::new(PipelineShared::new(bus, config)?);

        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("polcam-worker".to_string())
                .spawn(move || shared.worker_loop())?
        };

        let watchdog = match shared.config.task_deadline() {
            Some(deadline) => {
                let (stop_tx, stop_rx) = bounded::<()>(1);
                let shared = Arc::clone(&shared);
                let handle = thread::Builder::new()
                    .name("polcam-watchdog".to_string())
                    .spawn(move || shared.watchdog_loop(deadline, stop_rx))?;
                Some((stop_tx, handle))
            }
            None => None,
        };

        log::info!(
            "Processing pipeline started ({:?} sensor, result cache {}, deadline {:?})",
            shared.config.sensor,
            shared.config.result_cache_size,
            shared.config.task_deadline()
        );

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
            watchdog: Mutex::new(watchdog),
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.shared.bus
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    /// Switch mode; drops queued tasks and announces the change
    ///
    /// A task already being processed still completes with its original mode.
    pub fn set_mode(&self, mode: ProcessingMode) {
        let mut current = self.shared.mode.lock();
        if *current == mode {
            return;
        }
        *current = mode;
        let dropped = self.shared.queue.drain();
        drop(current);

        self.shared
            .counters
            .cancelled
            .fetch_add(dropped as u64, Ordering::Relaxed);
        self.shared.results.lock().clear();
        log::info!("Display mode changed to {:?}, {} queued task(s) dropped", mode, dropped);
        self.shared.bus.emit(EventPayload::DisplayModeChanged { mode });
    }

    pub fn mode(&self) -> ProcessingMode {
        *self.shared.mode.lock()
    }

    /// Update one live parameter; returns whether the value changed
    ///
    /// Already queued tasks keep the parameters they were submitted with.
    pub fn set_parameter(&self, update: ParameterUpdate) -> Result<bool> {
        update.validate()?;
        let changed = self.shared.params.lock().apply(&update);
        if !changed {
            return Ok(false);
        }

        log::debug!("Parameter {} set to {:?}", update.name(), update);
        if let ParameterUpdate::WhiteBalanceRoi(roi) = update {
            // Gains estimated over the old region no longer apply
            self.shared.gains.clear_all();
            self.shared.bus.emit(EventPayload::RoiChanged { roi });
        }
        self.shared.bus.emit(EventPayload::ParameterChanged {
            change: ParameterChange::Updated(update),
        });
        Ok(true)
    }

    pub fn parameters(&self) -> ProcessingParameters {
        self.shared.params.lock().clone()
    }

    pub fn reset_parameters(&self) {
        *self.shared.params.lock() = ProcessingParameters::default();
        self.shared.gains.clear_all();
        self.shared.bus.emit(EventPayload::ParameterChanged {
            change: ParameterChange::Reset,
        });
    }

    /// Queue a frame for processing in the current mode
    ///
    /// `None` and empty frames are ignored. Returns false when nothing was
    /// queued.
    pub fn process_frame(&self, frame: impl Into<Option<ImageBuffer>>, priority: i32) -> bool {
        match frame.into() {
            Some(frame) => self.process_shared_frame(Arc::new(frame), priority),
            None => false,
        }
    }

    /// Like [`process_frame`](Self::process_frame) for a frame that is already shared
    pub fn process_shared_frame(&self, frame: Arc<ImageBuffer>, priority: i32) -> bool {
        if frame.is_empty() {
            log::debug!("Ignoring empty frame");
            return false;
        }
        *self.shared.last_frame.lock() = Some(Arc::clone(&frame));
        self.shared.submit(frame, priority)
    }

    /// Resubmit the most recent source frame ahead of everything queued
    pub fn reprocess_last_frame(&self) -> bool {
        let frame = self.shared.last_frame.lock().clone();
        match frame {
            Some(frame) => self.shared.submit(frame, self.shared.config.reprocess_priority),
            None => false,
        }
    }

    /// Drop every queued task; a task in progress is unaffected
    pub fn cancel_all_tasks(&self) -> usize {
        let dropped = self.shared.queue.drain();
        self.shared
            .counters
            .cancelled
            .fetch_add(dropped as u64, Ordering::Relaxed);
        if dropped > 0 {
            log::debug!("Cancelled {} queued task(s)", dropped);
        }
        dropped
    }

    pub fn task_count(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn is_processing(&self) -> bool {
        self.shared.in_flight.lock().is_some()
    }

    /// Bound the result cache; 0 disables result caching
    pub fn set_cache_size(&self, size: usize) {
        self.shared.results.lock().set_capacity(Some(size));
    }

    pub fn is_cache_enabled(&self) -> bool {
        self.shared.is_cache_enabled()
    }

    pub fn cache_len(&self) -> usize {
        self.shared.results.lock().len()
    }

    pub fn clear_cache(&self) {
        self.shared.results.lock().clear();
        *self.shared.last_result.lock() = None;
    }

    pub fn last_result(&self) -> Option<Arc<ProcessingResult>> {
        self.shared.last_result.lock().clone()
    }

    pub fn gain_cache(&self) -> &WhiteBalanceCache {
        &self.shared.gains
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.shared.counters;
        PipelineStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            processed: c.processed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            overruns: c.overruns.load(Ordering::Relaxed),
        }
    }

    pub fn subscribe_event(&self, kind: EventKind, callback: Callback, delivery: Delivery) -> bool {
        self.shared.bus.subscribe(kind, callback, delivery)
    }

    pub fn publish_event(&self, payload: EventPayload) -> bool {
        self.shared.bus.emit(payload)
    }

    /// Stop accepting tasks, let the current one finish and join the threads
    pub fn shutdown(&self) {
        self.shared.queue.close();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                log::error!("Processing worker panicked");
            }
        }
        if let Some((stop, handle)) = self.watchdog.lock().take() {
            let _ = stop.send(());
            if handle.join().is_err() {
                log::error!("Watchdog thread panicked");
            }
        }
    }
}

impl Drop for ProcessingPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PipelineShared {
    fn new(bus: Arc<EventBus>, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let gains = WhiteBalanceCache::new(config.gain_cache_ttl())?;
        if config.gain_cache_permanent {
            gains.set_permanent();
        }
        let results = TimedCache::with_capacity(config.result_ttl(), config.result_cache_size)?;

        Ok(Self {
            bus,
            config,
            queue: TaskQueue::new(),
            mode: Mutex::new(ProcessingMode::default()),
            params: Mutex::new(ProcessingParameters::default()),
            last_frame: Mutex::new(None),
            last_result: Mutex::new(None),
            results: Mutex::new(results),
            gains,
            in_flight: Mutex::new(None),
            counters: Counters::default(),
        })
    }

    fn is_cache_enabled(&self) -> bool {
        self.results.lock().capacity() != Some(0)
    }

    fn submit(&self, frame: Arc<ImageBuffer>, priority: i32) -> bool {
        // Holding the mode lock keeps set_mode from draining between snapshot and push
        let mode_guard = self.mode.lock();
        let mode = *mode_guard;
        let params = ParameterSnapshot::new(self.params.lock().clone());
        let submitted_at = Instant::now();
        let task = ProcessingTask {
            frame,
            mode,
            params,
            priority,
            submitted_at,
        };
        let queued = self.queue.push(task, priority);
        drop(mode_guard);

        if !queued {
            log::debug!("Pipeline is shut down, frame not queued");
            return false;
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.bus.emit(EventPayload::ProcessingStarted {
            mode,
            priority,
            submitted_at,
        });
        true
    }

    fn worker_loop(&self) {
        log::info!("Processing worker started");
        // Marked in flight before leaving the queue, so the pipeline never looks idle
        while let Some(task) = self.queue.pop_with(|task| self.mark_in_flight(task)) {
            self.run(task);
        }
        log::info!(
            "Processing worker stopped: {} processed, {} failed, {} cache hits",
            self.counters.processed.load(Ordering::Relaxed),
            self.counters.failed.load(Ordering::Relaxed),
            self.counters.cache_hits.load(Ordering::Relaxed)
        );
    }

    fn mark_in_flight(&self, task: &ProcessingTask) {
        *self.in_flight.lock() = Some(InFlight {
            mode: task.mode,
            started: Instant::now(),
            overrun_reported: false,
        });
    }

    /// Process one task and publish its outcome
    fn execute(&self, task: ProcessingTask) {
        self.mark_in_flight(&task);
        self.run(task);
    }

    /// Like `execute`, for a task already marked in flight
    fn run(&self, task: ProcessingTask) {
        let mode = task.mode;
        let started = Instant::now();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.process_task(&task)))
            .unwrap_or_else(|payload| {
                Err(PolcamError::processing(format!(
                    "task panicked: {}",
                    panic_message(payload.as_ref())
                )))
            });
        *self.in_flight.lock() = None;

        match outcome {
            Ok(result) => {
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                *self.last_result.lock() = Some(Arc::clone(&result));
                self.bus.emit(EventPayload::FrameProcessed {
                    result,
                    processing_time: started.elapsed(),
                });
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                log::error!("❌ Processing {:?} task failed: {}", mode, e);
                self.bus.emit(EventPayload::error("processing", e.to_string()));
            }
        }
        self.bus.emit(EventPayload::ProcessingCompleted { mode });

        let done = self.counters.processed.load(Ordering::Relaxed)
            + self.counters.failed.load(Ordering::Relaxed);
        if done % 100 == 0 {
            log::info!(
                "Processing worker: {} processed, {} failed, {} cache hits",
                self.counters.processed.load(Ordering::Relaxed),
                self.counters.failed.load(Ordering::Relaxed),
                self.counters.cache_hits.load(Ordering::Relaxed)
            );
        }
    }

    fn process_task(&self, task: &ProcessingTask) -> Result<Arc<ProcessingResult>> {
        let key = self.is_cache_enabled().then(|| ResultKey::new(task));
        if let Some(key) = &key {
            if let Some(hit) = self.results.lock().get(key).cloned() {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                log::trace!("Result cache hit for {:?}", task.mode);
                return Ok(hit);
            }
        }

        let (images, metadata) = self.render(task)?;
        let images = self.enhance_all(images, &task.params);
        let result = Arc::new(ProcessingResult {
            mode: task.mode,
            images,
            metadata,
            timestamp: SystemTime::now(),
        });

        if let Some(key) = key {
            self.results.lock().set(key, Arc::clone(&result));
        }
        Ok(result)
    }

    fn render(&self, task: &ProcessingTask) -> Result<(Vec<ImageBuffer>, ResultMetadata)> {
        let params = &task.params;
        let wb = params.white_balance_auto;
        let roi = params.white_balance_roi;
        let gray = task.mode.is_gray();
        let channels = || demosaic(&task.frame, self.config.sensor);

        let rendered = match task.mode {
            ProcessingMode::Raw => (
                vec![(*task.frame).clone()],
                ResultMetadata {
                    color: task.frame.channels() == 3,
                    layers: vec![ImageLayer::Raw],
                    ..Default::default()
                },
            ),
            ProcessingMode::SingleColor | ProcessingMode::SingleGray => {
                let angle = params.selected_angle;
                let [i000, i045, i090, i135] = channels()?;
                let image = match angle {
                    PolarizationAngle::Deg0 => i000,
                    PolarizationAngle::Deg45 => i045,
                    PolarizationAngle::Deg90 => i090,
                    PolarizationAngle::Deg135 => i135,
                };
                let image = self.finish(image, wb, GainScope::Single, GainKey::Angle(angle), roi, gray)?;
                (
                    vec![image],
                    ResultMetadata {
                        angle: Some(angle),
                        white_balance: wb,
                        color: !gray,
                        layers: vec![ImageLayer::Angle(angle)],
                        ..Default::default()
                    },
                )
            }
            ProcessingMode::MergedColor | ProcessingMode::MergedGray => {
                let merged = ImageBuffer::mean_merge(&channels()?)?;
                let image = self.finish(merged, wb, GainScope::Merged, GainKey::Combined, roi, gray)?;
                (
                    vec![image],
                    ResultMetadata {
                        white_balance: wb,
                        color: !gray,
                        layers: vec![ImageLayer::Merged],
                        ..Default::default()
                    },
                )
            }
            ProcessingMode::QuadColor | ProcessingMode::QuadGray => {
                let images = PolarizationAngle::ALL
                    .into_iter()
                    .zip(channels()?)
                    .map(|(angle, image)| {
                        self.finish(image, wb, GainScope::Quad, GainKey::Angle(angle), roi, gray)
                    })
                    .collect::<Result<Vec<_>>>()?;
                (
                    images,
                    ResultMetadata {
                        angles: PolarizationAngle::ALL.to_vec(),
                        white_balance: wb,
                        color: !gray,
                        layers: PolarizationAngle::ALL.map(ImageLayer::Angle).to_vec(),
                        ..Default::default()
                    },
                )
            }
            ProcessingMode::Polarization => {
                let channels = channels()?;
                let maps = polarization_maps(&channels)?;
                let mut merged = ImageBuffer::mean_merge(&channels)?;
                if !params.polarization_color {
                    merged = merged.to_gray()?;
                }
                if params.polarization_white_balance {
                    merged = self.white_balance(merged, GainScope::Polarization, GainKey::Combined, roi)?;
                }
                let [dolp, aolp, docp] = maps.into_images();
                (
                    vec![merged, dolp, aolp, docp],
                    ResultMetadata {
                        white_balance: params.polarization_white_balance,
                        color: params.polarization_color,
                        layers: vec![
                            ImageLayer::Merged,
                            ImageLayer::Dolp,
                            ImageLayer::Aolp,
                            ImageLayer::Docp,
                        ],
                        ..Default::default()
                    },
                )
            }
        };
        Ok(rendered)
    }

    /// White balance (in color, when enabled) and then the gray conversion
    fn finish(
        &self,
        image: ImageBuffer,
        wb: bool,
        scope: GainScope,
        key: GainKey,
        roi: Option<Roi>,
        gray: bool,
    ) -> Result<ImageBuffer> {
        let image = if wb {
            self.white_balance(image, scope, key, roi)?
        } else {
            image
        };
        if gray {
            Ok(image.to_gray()?)
        } else {
            Ok(image)
        }
    }

    fn white_balance(
        &self,
        image: ImageBuffer,
        scope: GainScope,
        key: GainKey,
        roi: Option<Roi>,
    ) -> Result<ImageBuffer> {
        let options = &self.config.white_balance;
        let gains = self
            .gains
            .get_or_compute(scope, key, image.channels(), || {
                estimate_gains(&image, roi, options)
            })?;
        Ok(apply_gains(&image, &gains)?)
    }

    fn enhance_all(&self, images: Vec<ImageBuffer>, params: &ParameterSnapshot) -> Vec<ImageBuffer> {
        let settings = params.enhance_settings();
        if settings.is_identity() {
            return images;
        }
        let policy = self.config.enhancement_policy;
        images
            .into_iter()
            .map(|image| {
                if policy.applies_to(&image) {
                    enhance(&image, &settings)
                } else {
                    image
                }
            })
            .collect()
    }

    fn watchdog_loop(&self, deadline: Duration, stop: Receiver<()>) {
        let tick = (deadline / 4).clamp(Duration::from_millis(5), Duration::from_millis(250));
        log::debug!("Watchdog started with {:?} deadline", deadline);
        loop {
            match stop.recv_timeout(tick) {
                Err(RecvTimeoutError::Timeout) => {
                    self.check_overrun(deadline, Instant::now());
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        log::debug!("Watchdog stopped");
    }

    /// Report the in-flight task once if it has run longer than `deadline`
    fn check_overrun(&self, deadline: Duration, now: Instant) -> bool {
        let overrun = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.as_mut() {
                Some(task) if !task.overrun_reported => {
                    let elapsed = now.saturating_duration_since(task.started);
                    if elapsed > deadline {
                        task.overrun_reported = true;
                        Some((task.mode, elapsed))
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };

        let Some((mode, elapsed)) = overrun else {
            return false;
        };
        self.counters.overruns.fetch_add(1, Ordering::Relaxed);
        log::warn!(
            "⚠️  {:?} task has been running for {:?} (deadline {:?})",
            mode,
            elapsed,
            deadline
        );
        self.bus.emit(EventPayload::error(
            "watchdog",
            format!("{mode:?} task exceeded its {deadline:?} deadline ({elapsed:?} elapsed)"),
        ));
        true
    }
}
