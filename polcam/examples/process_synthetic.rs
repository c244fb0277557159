/// Synthetic Processing Example
///
/// Streams a rotating, partially polarized synthetic scene through the
/// pipeline, cycles through every display mode and saves a colorized DoLP map.
///
/// Usage:
///   cargo run --release --example process_synthetic [output_path]
use polcam::polmath::{colorize_dolp, ImageBuffer};
use polcam::{
    callback, AppConfig, Delivery, EventBus, EventKind, EventPayload, ImageLayer, ProcessingMode,
    ProcessingPipeline, ProcessingResult, StreamingSession, SyntheticSource,
};
use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    polcam::init_logging();

    println!("📷 Polarization pipeline demo (polcam {})\n", polcam::version());

    let output_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "output_dolp.png".to_string());

    let config = AppConfig::default();
    let bus = Arc::new(EventBus::new(config.event_bus.clone())?);
    let pipeline = Arc::new(ProcessingPipeline::new(
        Arc::clone(&bus),
        config.pipeline.clone(),
    )?);

    let (tx, rx) = crossbeam::channel::unbounded::<(Arc<ProcessingResult>, Duration)>();
    pipeline.subscribe_event(
        EventKind::FrameProcessed,
        callback(move |event| {
            if let EventPayload::FrameProcessed {
                result,
                processing_time,
            } = &event.payload
            {
                tx.send((Arc::clone(result), *processing_time))?;
            }
            Ok(())
        }),
        Delivery::Async,
    );

    let source = SyntheticSource::new(640, 480)?
        .with_polarization(0.6, 20.0)
        .with_rotation(3.0);
    let mut session = StreamingSession::start(source, Arc::clone(&pipeline), config.streaming.clone())?;

    let mut dolp_saved = false;
    for mode in ProcessingMode::ALL {
        pipeline.set_mode(mode);
        let deadline = Instant::now() + Duration::from_secs(5);

        // Skip results still in flight from the previous mode
        while let Ok((result, elapsed)) = rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            if result.mode != mode {
                continue;
            }
            println!(
                "  {:<14} {} image(s) in {:>6.2}ms  {:?}",
                mode.to_string(),
                result.images.len(),
                elapsed.as_secs_f64() * 1000.0,
                result.metadata.layers
            );

            if mode == ProcessingMode::Polarization {
                let dolp = result
                    .metadata
                    .layers
                    .iter()
                    .position(|layer| *layer == ImageLayer::Dolp)
                    .and_then(|i| result.images.get(i));
                if let Some(ImageBuffer::Map(map)) = dolp {
                    if let Some(rgb) = colorize_dolp(map).to_rgb_image() {
                        rgb.save(&output_path)?;
                        dolp_saved = true;
                    }
                }
            }
            break;
        }
    }

    let stats = session.stop();
    pipeline.shutdown();

    println!("\n📊 Streaming: {} captured, {} submitted, {} dropped", stats.captured, stats.submitted, stats.dropped);
    let pipeline_stats = pipeline.stats();
    println!(
        "📊 Pipeline: {} processed, {} failed, {} cache hits, {} cancelled",
        pipeline_stats.processed, pipeline_stats.failed, pipeline_stats.cache_hits, pipeline_stats.cancelled
    );
    if dolp_saved {
        println!("💾 DoLP map saved to {}", output_path);
    }

    Ok(())
}
