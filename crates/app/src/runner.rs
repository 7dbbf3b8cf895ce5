//! Live run: ingest frames, drive the pipeline, broadcast results.
//!
//! The ingest loop plays the host's render thread. Every received frame is
//! published to the software backend's feed, followed by a resize check, a tick
//! keyed on the frame timestamp, and one render opportunity.

use std::{
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use ml_core::{CLASSIFIER_INPUT_EDGE, InferenceEngine, InferenceError, InputShape};
use tracing::{debug, error, info, warn};
use video_ingest::{CaptureError, Frame};
use vision::{
    Broadcaster, EventServer, FramePipeline, PipelineDriver, PipelineFactory, PipelineResources,
    RenderOutcome, ThrottledTaskQueue, VisionConfig,
    gpu::{SoftwareBackend, SourceFeed, SourceFrame},
    pipeline::{
        config::SourceKind,
        telemetry,
        watchdog::{HealthComponent, PipelineHealth, WatchdogState, spawn_watchdog},
    },
    timer::TesseractCli,
};

/// Frame rate of `testpattern:` when none is given.
const DEFAULT_PATTERN_FPS: u32 = 30;
/// Longest wait for a frame before offering an idle render opportunity.
const FRAME_WAIT: Duration = Duration::from_millis(100);
/// How long shutdown waits for the last OCR task.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub fn run(config: VisionConfig) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });

    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry);
    let _ = telemetry::init_metrics_recorder();
    let run_span = tracing::info_span!(
        "unite.live",
        source = %config.source_uri,
        width = config.width,
        height = config.height,
        classifier = config.model_path.is_some(),
        use_cpu = config.use_cpu
    );
    let _run_guard = run_span.enter();

    if config.model_path.is_some() && cfg!(not(feature = "with-tch")) {
        bail!("--model needs a build with the `with-tch` feature");
    }
    TesseractCli::new(&config.tessdata).context("OCR engine unavailable")?;

    let server = Arc::new(
        EventServer::spawn(config.broadcast_addr).context("Failed to start broadcast server")?,
    );
    info!(
        "Broadcasting results at http://{}/events (latest: /latest, metrics: /metrics)",
        server.local_addr()
    );
    let broadcaster: Arc<dyn Broadcaster> = server.clone();

    let queue = Arc::new(
        ThrottledTaskQueue::new("timer-ocr", config.queue_depth)
            .context("Failed to start OCR worker")?,
    );
    let health = Arc::new(PipelineHealth::new());
    let watchdog_state = Arc::new(WatchdogState::new());
    let watchdog_stop = Arc::new(AtomicBool::new(false));
    let watchdog = spawn_watchdog(
        health.clone(),
        queue.clone(),
        config.task_budget,
        watchdog_stop.clone(),
        watchdog_state.clone(),
    )
    .context("Failed to start watchdog")?;

    let feed = Arc::new(SourceFeed::new());
    let factory = pipeline_factory(config.clone(), feed.clone(), queue.clone(), broadcaster);
    let mut driver = PipelineDriver::new(factory).with_health(health.clone());

    let frames = open_source(&config)?;
    let outcome = ingest_loop(&frames, &feed, &mut driver, &health, &shutdown);

    debug!("Stopping pipeline");
    drop(driver);
    if !queue.wait_idle(DRAIN_TIMEOUT) {
        warn!("OCR task still running at shutdown");
    }
    queue.cancel_all();
    watchdog_stop.store(true, Ordering::SeqCst);
    telemetry::join_logged(watchdog, "watchdog");
    server.stop();

    let stats = queue.stats();
    info!(
        "OCR tasks: {} executed, {} cancelled, {} failed, {} panicked; watchdog trips: {}",
        stats.executed,
        stats.cancelled,
        stats.failed,
        stats.panicked,
        watchdog_state.trips()
    );
    outcome
}

fn ingest_loop(
    frames: &Receiver<Result<Frame, CaptureError>>,
    feed: &SourceFeed,
    driver: &mut PipelineDriver<SoftwareBackend>,
    health: &PipelineHealth,
    shutdown: &AtomicBool,
) -> Result<()> {
    let mut frame_count: u64 = 0;
    let mut last_instant = Instant::now();

    while !shutdown.load(Ordering::Relaxed) {
        let frame = match frames.recv_timeout(FRAME_WAIT) {
            Ok(Ok(frame)) => frame,
            Ok(Err(err)) => {
                error!("Capture error: {err}");
                return Err(err).context("Frame source failed");
            }
            Err(RecvTimeoutError::Timeout) => {
                driver.render_opportunity();
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => {
                info!("Frame source ended after {frame_count} frames");
                return Ok(());
            }
        };

        health.beat(HealthComponent::Capture);
        frame_count += 1;
        let now = Instant::now();
        metrics::histogram!("vision_capture_frame_interval_seconds")
            .record(now.duration_since(last_instant).as_secs_f64());
        last_instant = now;

        let (width, height, timestamp) = (frame.width, frame.height, frame.timestamp_us);
        feed.publish(SourceFrame {
            data: Arc::new(frame.data),
            width,
            height,
            timestamp_us: timestamp,
        });
        driver.resize(width, height);
        driver.tick(timestamp);
        if let RenderOutcome::Analyzed { cycle } = driver.render_opportunity() {
            if cycle % 300 == 0 {
                let label = driver
                    .pipeline()
                    .and_then(|pipeline| pipeline.context_label())
                    .unwrap_or("-");
                debug!("Cycle heartbeat: #{cycle}, context {label}");
            }
        }
    }
    info!("Shutdown requested");
    Ok(())
}

fn open_source(config: &VisionConfig) -> Result<Receiver<Result<Frame, CaptureError>>> {
    let size = (config.width, config.height);
    match config.source_kind {
        SourceKind::TestPattern => {
            let fps = config
                .source_uri
                .strip_prefix("testpattern:")
                .and_then(|rate| rate.parse().ok())
                .unwrap_or(DEFAULT_PATTERN_FPS);
            info!("Generating test pattern at {fps} fps");
            video_ingest::spawn_test_pattern(size, fps).context("Failed to start test pattern")
        }
        SourceKind::Rtsp | SourceKind::Device => {
            video_ingest::spawn_ffmpeg_reader(&config.source_uri, size)
                .with_context(|| format!("Failed to open {}", config.source_uri))
        }
    }
}

/// Builds a fresh pipeline, with its own backend, model and OCR engine, for
/// each source size.
fn pipeline_factory(
    config: VisionConfig,
    feed: Arc<SourceFeed>,
    queue: Arc<ThrottledTaskQueue>,
    broadcaster: Arc<dyn Broadcaster>,
) -> PipelineFactory<SoftwareBackend> {
    Box::new(move |width, height| {
        let pipeline_config = config.pipeline_config(width, height)?;
        let engine = load_engine(&config)?;
        let ocr = TesseractCli::new(&config.tessdata)?;
        FramePipeline::new(
            pipeline_config,
            PipelineResources {
                backend: SoftwareBackend::new(feed.clone()),
                engine,
                ocr: Box::new(ocr),
            },
            queue.clone(),
            broadcaster.clone(),
        )
    })
}

fn classifier_shape() -> InputShape {
    InputShape::new(3, CLASSIFIER_INPUT_EDGE, CLASSIFIER_INPUT_EDGE)
}

#[cfg(feature = "with-tch")]
pub(crate) fn load_engine(
    config: &VisionConfig,
) -> Result<Option<Box<dyn InferenceEngine>>, InferenceError> {
    use ml_core::{TorchScriptEngine, tch::Device};

    let Some(path) = config.model_path.as_ref() else {
        return Ok(None);
    };
    let device = if config.use_cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available()
    };
    let engine = TorchScriptEngine::load(path, device, classifier_shape())?;
    Ok(Some(Box::new(engine)))
}

#[cfg(not(feature = "with-tch"))]
pub(crate) fn load_engine(
    config: &VisionConfig,
) -> Result<Option<Box<dyn InferenceEngine>>, InferenceError> {
    match config.model_path.as_ref() {
        Some(path) => Err(InferenceError::ModelLoad {
            path: path.clone(),
            reason: "built without the with-tch feature".into(),
        }),
        None => Ok(None),
    }
}
