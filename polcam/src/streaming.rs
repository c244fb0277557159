//! Continuous capture from a [`FrameSource`] into the pipeline

use crate::config::StreamingConfig;
use crate::error::Result;
use crate::event_bus::EventBus;
use crate::events::EventPayload;
use crate::pipeline::ProcessingPipeline;
use crate::source::FrameSource;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamingStats {
    pub captured: u64,
    pub submitted: u64,
    /// Frames skipped because the pipeline was backed up
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    captured: AtomicU64,
    submitted: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> StreamingStats {
        StreamingStats {
            captured: self.captured.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Capture thread pulling frames at a fixed interval
///
/// The thread stops on [`stop`](Self::stop), on drop, or when the source
/// reports it is disconnected. `StreamingStarted` and `StreamingStopped`
/// bracket its lifetime on the bus.
pub struct StreamingSession {
    pipeline: Arc<ProcessingPipeline>,
    counters: Arc<Counters>,
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl StreamingSession {
    pub fn start<S>(source: S, pipeline: Arc<ProcessingPipeline>, config: StreamingConfig) -> Result<Self>
    where
        S: FrameSource + 'static,
    {
        config.validate()?;
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let counters = Arc::new(Counters::default());

        let handle = {
            let pipeline = Arc::clone(&pipeline);
            let counters = Arc::clone(&counters);
            thread::Builder::new()
                .name("polcam-capture".to_string())
                .spawn(move || capture_loop(source, &pipeline, &config, &counters, stop_rx))?
        };

        Ok(Self {
            pipeline,
            counters,
            stop_tx,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stats(&self) -> StreamingStats {
        self.counters.snapshot()
    }

    /// Stop capturing, join the thread and drop queued tasks
    pub fn stop(&mut self) -> StreamingStats {
        if let Some(handle) = self.handle.take() {
            // Fails only if the thread already exited
            let _ = self.stop_tx.try_send(());
            if handle.join().is_err() {
                log::error!("❌ Capture thread panicked");
            }
            self.pipeline.cancel_all_tasks();
        }
        self.stats()
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop<S: FrameSource>(
    mut source: S,
    pipeline: &ProcessingPipeline,
    config: &StreamingConfig,
    counters: &Counters,
    stop_rx: Receiver<()>,
) {
    let bus: &EventBus = pipeline.bus();
    let interval = config.frame_interval();
    log::info!("Streaming started ({:?} per frame)", interval);
    bus.emit(EventPayload::StreamingStarted);

    loop {
        if !source.is_connected() {
            log::warn!("⚠️ Frame source disconnected, stopping stream");
            bus.emit(EventPayload::CameraDisconnected);
            break;
        }

        if let Some(frame) = source.get_frame() {
            let frame = Arc::new(frame);
            let captured = counters.captured.fetch_add(1, Ordering::Relaxed) + 1;
            bus.emit(EventPayload::FrameCaptured {
                frame: Arc::clone(&frame),
            });

            if pipeline.task_count() >= config.max_pending_tasks {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Pipeline backed up, frame {} skipped", captured);
            } else if pipeline.process_shared_frame(frame, config.priority) {
                counters.submitted.fetch_add(1, Ordering::Relaxed);
            }

            if captured % 100 == 0 {
                let stats = counters.snapshot();
                log::info!(
                    "Captured {} frames ({} submitted, {} dropped)",
                    stats.captured,
                    stats.submitted,
                    stats.dropped
                );
            }
        }

        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    bus.emit(EventPayload::StreamingStopped);
    log::info!("Streaming stopped after {} frames", counters.captured.load(Ordering::Relaxed));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EventBusConfig, PipelineConfig};
    use crate::event_bus::{callback, Delivery};
    use crate::events::{Event, EventKind};
    use crate::source::SyntheticSource;
    use crossbeam::channel::unbounded;
    use polmath::SensorLayout;
    use std::time::{Duration, Instant};

    fn pipeline() -> Arc<ProcessingPipeline> {
        let _ = env_logger::builder().is_test(true).try_init();
        let bus = Arc::new(EventBus::new(EventBusConfig::default()).unwrap());
        let config = PipelineConfig {
            sensor: SensorLayout::Mono,
            task_deadline_ms: None,
            ..Default::default()
        };
        Arc::new(ProcessingPipeline::new(bus, config).unwrap())
    }

    fn record(pipeline: &ProcessingPipeline) -> Receiver<Event> {
        let (tx, rx) = unbounded();
        for kind in [
            EventKind::StreamingStarted,
            EventKind::FrameCaptured,
            EventKind::CameraDisconnected,
            EventKind::StreamingStopped,
        ] {
            let tx = tx.clone();
            pipeline.subscribe_event(
                kind,
                callback(move |event| {
                    tx.send(event.clone())?;
                    Ok(())
                }),
                Delivery::Sync,
            );
        }
        rx
    }

    fn wait_until_finished(session: &StreamingSession) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while session.is_running() {
            assert!(Instant::now() < deadline, "capture thread did not finish");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn fast() -> StreamingConfig {
        StreamingConfig {
            frame_interval_ms: 1,
            max_pending_tasks: 100,
            priority: 0,
        }
    }

    #[test]
    fn test_streams_until_source_disconnects() {
        let pipeline = pipeline();
        let rx = record(&pipeline);
        let source = SyntheticSource::new(8, 8).unwrap().with_frame_limit(3);

        let mut session = StreamingSession::start(source, Arc::clone(&pipeline), fast()).unwrap();
        wait_until_finished(&session);
        let stats = session.stop();
        assert_eq!(
            stats,
            StreamingStats {
                captured: 3,
                submitted: 3,
                dropped: 0
            }
        );

        pipeline.bus().flush();
        let kinds: Vec<EventKind> = rx.try_iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::StreamingStarted,
                EventKind::FrameCaptured,
                EventKind::FrameCaptured,
                EventKind::FrameCaptured,
                EventKind::CameraDisconnected,
                EventKind::StreamingStopped,
            ]
        );
    }

    #[test]
    fn test_backpressure_drops_frames() {
        let pipeline = pipeline();
        let source = SyntheticSource::new(8, 8).unwrap().with_frame_limit(5);
        let config = StreamingConfig {
            max_pending_tasks: 0,
            ..fast()
        };

        let mut session = StreamingSession::start(source, Arc::clone(&pipeline), config).unwrap();
        wait_until_finished(&session);
        let stats = session.stop();
        assert_eq!(stats.captured, 5);
        assert_eq!(stats.submitted, 0);
        assert_eq!(stats.dropped, 5);
        assert_eq!(pipeline.stats().submitted, 0);
    }

    #[test]
    fn test_stop_is_prompt_and_idempotent() {
        let pipeline = pipeline();
        let rx = record(&pipeline);
        let source = SyntheticSource::new(8, 8).unwrap();
        let config = StreamingConfig {
            frame_interval_ms: 5,
            ..fast()
        };

        let mut session = StreamingSession::start(source, Arc::clone(&pipeline), config).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert!(session.is_running());

        let first = session.stop();
        assert!(!session.is_running());
        assert!(first.captured >= 1);
        assert_eq!(session.stop(), first);
        assert_eq!(pipeline.task_count(), 0);

        pipeline.bus().flush();
        let stopped = rx
            .try_iter()
            .filter(|e| e.kind() == EventKind::StreamingStopped)
            .count();
        assert_eq!(stopped, 1);
    }

    #[test]
    fn test_rejects_zero_interval() {
        let source = SyntheticSource::new(8, 8).unwrap();
        let config = StreamingConfig {
            frame_interval_ms: 0,
            ..fast()
        };
        assert!(StreamingSession::start(source, pipeline(), config).is_err());
    }
}
