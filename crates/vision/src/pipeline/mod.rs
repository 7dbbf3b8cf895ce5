//! Per-frame analysis state machine.
//!
//! The host drives a [`FramePipeline`] from its render thread with
//! [`on_tick`](FramePipeline::on_tick) followed by
//! [`on_render_opportunity`](FramePipeline::on_render_opportunity). A render
//! opportunity after a strictly newer tick runs one analysis cycle:
//!
//! 1. sync the classifier readback staged last cycle and classify it in place;
//! 2. sync the timer readback, cancel the previous OCR task and queue a new one;
//! 3. render and stage both targets for the next cycle;
//! 4. publish the current context label.
//!
//! Every stage failure is logged and skipped so the previously published
//! results stay visible; nothing propagates to the driver.

pub mod config;
mod driver;
pub mod staging;
pub mod task_queue;
pub mod telemetry;
pub mod watchdog;

use std::{
    sync::{Arc, Mutex},
    time::Instant,
};

use anyhow::anyhow;
use ml_core::{ContextClassifier, DoubleBuffered, InferenceEngine};
use tracing::{debug, debug_span, info, trace, warn};

pub use driver::{PipelineDriver, PipelineFactory};

use crate::{
    error::PipelineError,
    gpu::{GraphicsBackend, RenderPass},
    server::Broadcaster,
    timer::{OcrEngine, TimerExtractionAdapter, TimerPreprocessor, TimerReading},
};
use config::PipelineConfig;
use staging::AsyncStagingReader;
use task_queue::{CancellationToken, ThrottledTaskQueue};

/// Topic carrying the classifier label.
pub const CONTEXT_TOPIC: &str = "context";
/// Topic carrying accepted timer readings.
pub const TIMER_TOPIC: &str = "timer";

/// Collaborators a pipeline instance owns exclusively.
pub struct PipelineResources<B> {
    pub backend: B,
    /// Context classifier model; `None` runs the timer stage only.
    pub engine: Option<Box<dyn InferenceEngine>>,
    pub ocr: Box<dyn OcrEngine>,
}

/// What a render opportunity did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    /// No new frame since the last cycle; the host redraws the last result.
    Redraw,
    /// A new analysis cycle ran.
    Analyzed { cycle: u64 },
}

struct TimerStage {
    adapter: TimerExtractionAdapter<Box<dyn OcrEngine>>,
    preprocess: TimerPreprocessor,
}

pub struct FramePipeline<B: GraphicsBackend> {
    config: Arc<PipelineConfig>,
    backend: B,
    classifier_target: B::Texture,
    classifier_reader: AsyncStagingReader<B>,
    classifier: Option<ContextClassifier<Box<dyn InferenceEngine>>>,
    timer_target: B::Texture,
    timer_reader: AsyncStagingReader<B>,
    timer_stage: Arc<Mutex<TimerStage>>,
    timer_result: Arc<DoubleBuffered<TimerReading>>,
    queue: Arc<ThrottledTaskQueue>,
    broadcaster: Arc<dyn Broadcaster>,
    last_seen_ts: Option<u64>,
    pending_new_frame: bool,
    pending_ocr: Option<CancellationToken>,
    cycles: u64,
}

impl<B: GraphicsBackend> FramePipeline<B> {
    /// Build a pipeline, allocating targets and staging rings for `config`.
    ///
    /// Fails when the config is inconsistent, the backend cannot allocate the
    /// surfaces, or the model input does not match the classifier target.
    pub fn new(
        config: Arc<PipelineConfig>,
        resources: PipelineResources<B>,
        queue: Arc<ThrottledTaskQueue>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let PipelineResources {
            mut backend,
            engine,
            ocr,
        } = resources;

        if let Some(engine) = engine.as_ref() {
            let expected = config.classifier_input_shape();
            let got = engine.input_shape();
            if got != expected {
                return Err(PipelineError::ModelShape { expected, got });
            }
        }

        let classifier_target = backend.create_render_target(config.classifier_target)?;
        let classifier_reader = AsyncStagingReader::new(
            &mut backend,
            "classifier",
            config.classifier_target,
            config.staging_slots,
        )?;
        let timer_target = backend.create_render_target(config.timer_target)?;
        let timer_reader =
            AsyncStagingReader::new(&mut backend, "timer", config.timer_target, config.staging_slots)?;

        let classifier = engine.map(|engine| {
            ContextClassifier::with_labels(engine, &ml_core::CONTEXT_LABELS, config.normalization)
        });
        if classifier.is_none() {
            info!("no classifier model configured, context stage disabled");
        }
        let timer_stage = TimerStage {
            adapter: TimerExtractionAdapter::new(ocr),
            preprocess: TimerPreprocessor::new(
                config.timer_target.width,
                config.timer_target.height,
                config.median_window,
            ),
        };

        debug!(
            "pipeline ready for {}x{} source ({} staging slots)",
            config.source_width, config.source_height, config.staging_slots
        );
        Ok(Self {
            config,
            backend,
            classifier_target,
            classifier_reader,
            classifier,
            timer_target,
            timer_reader,
            timer_stage: Arc::new(Mutex::new(timer_stage)),
            timer_result: Arc::new(DoubleBuffered::new(TimerReading::empty())),
            queue,
            broadcaster,
            last_seen_ts: None,
            pending_new_frame: false,
            pending_ocr: None,
            cycles: 0,
        })
    }

    /// Record a frame tick. Only a strictly newer timestamp arms the next cycle.
    ///
    /// Nothing has been seen before the first tick, so a first timestamp of
    /// `0` arms a cycle too; sources that start their clock at zero still get
    /// their first frame analyzed.
    pub fn on_tick(&mut self, timestamp: u64) {
        match self.last_seen_ts {
            Some(last) if timestamp <= last => {
                trace!(timestamp, last, "dropping stale tick");
                metrics::counter!("vision_ticks_dropped_total").increment(1);
            }
            _ => {
                self.last_seen_ts = Some(timestamp);
                self.pending_new_frame = true;
            }
        }
    }

    /// Run an analysis cycle if a new frame arrived since the last one.
    pub fn on_render_opportunity(&mut self) -> RenderOutcome {
        if !self.pending_new_frame {
            return RenderOutcome::Redraw;
        }
        self.pending_new_frame = false;
        self.cycles += 1;
        let cycle = self.cycles;
        let _span = debug_span!("pipeline.cycle", cycle).entered();
        metrics::counter!("vision_cycles_total").increment(1);

        self.classify_previous();
        self.dispatch_timer();
        self.capture_next();
        self.publish_context();

        RenderOutcome::Analyzed { cycle }
    }

    fn classify_previous(&mut self) {
        let Some(classifier) = self.classifier.as_mut() else {
            return;
        };
        let started = Instant::now();
        match self.classifier_reader.sync(&mut self.backend) {
            Ok(true) => {}
            Ok(false) => {
                trace!("no classifier readback yet");
                return;
            }
            Err(err) => {
                warn!("classifier readback failed: {err}");
                return;
            }
        }
        if let Err(err) = classifier.process(self.classifier_reader.buffer()) {
            warn!("classification skipped: {err}");
            return;
        }
        metrics::histogram!("vision_stage_latency_seconds", "stage" => "classify")
            .record(started.elapsed().as_secs_f64());
    }

    fn dispatch_timer(&mut self) {
        match self.timer_reader.sync(&mut self.backend) {
            Ok(true) => {}
            Ok(false) => {
                trace!("no timer readback yet");
                return;
            }
            Err(err) => {
                warn!("timer readback failed: {err}");
                return;
            }
        }

        // Only the most recent crop matters.
        if let Some(previous) = self.pending_ocr.take() {
            previous.cancel();
        }

        let pixels = self.timer_reader.buffer().clone();
        let stage = self.timer_stage.clone();
        let result = self.timer_result.clone();
        let broadcaster = self.broadcaster.clone();
        let token = self.queue.push(move |token| {
            token.ensure_active()?;
            let mut stage = stage
                .lock()
                .map_err(|_| anyhow!("timer stage poisoned by an earlier panic"))?;
            let binarized = stage.preprocess.prepare(&pixels)?;
            token.ensure_active()?;
            let reading = stage.adapter.read(&binarized)?;
            drop(stage);

            // A newer crop superseded this one while OCR ran.
            token.ensure_active()?;
            if reading.is_empty() {
                metrics::counter!("vision_timer_readings_total", "outcome" => "rejected")
                    .increment(1);
                return Ok(());
            }
            metrics::counter!("vision_timer_readings_total", "outcome" => "accepted").increment(1);
            broadcaster.publish(TIMER_TOPIC, reading.as_str());
            result.write(|slot| *slot = reading);
            Ok(())
        });
        self.pending_ocr = Some(token);
    }

    fn capture_next(&mut self) {
        let started = Instant::now();
        let letterbox = RenderPass::Letterbox {
            roi: self.config.classifier_roi,
            fill: self.config.letterbox_fill,
        };
        let crop = RenderPass::Crop {
            region: self.config.timer_region,
        };

        if self.classifier.is_some() {
            let classifier = self
                .backend
                .render_into(&mut self.classifier_target, &letterbox)
                .map_err(PipelineError::from)
                .and_then(|()| {
                    self.classifier_reader
                        .stage(&mut self.backend, &self.classifier_target)
                });
            if let Err(err) = classifier {
                warn!("classifier capture skipped: {err}");
            }
        }

        let timer = self
            .backend
            .render_into(&mut self.timer_target, &crop)
            .map_err(PipelineError::from)
            .and_then(|()| self.timer_reader.stage(&mut self.backend, &self.timer_target));
        if let Err(err) = timer {
            warn!("timer capture skipped: {err}");
        }

        metrics::histogram!("vision_stage_latency_seconds", "stage" => "capture")
            .record(started.elapsed().as_secs_f64());
    }

    fn publish_context(&self) {
        if let Some(label) = self.context_label() {
            self.broadcaster.publish(CONTEXT_TOPIC, label);
        }
    }

    /// Number of analysis cycles run so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Latest classifier label, once one has been computed.
    pub fn context_label(&self) -> Option<&'static str> {
        self.classifier
            .as_ref()
            .filter(|classifier| classifier.has_result())
            .map(|classifier| classifier.inferred_label())
    }

    /// Shared handle to the latest classifier scores, when a model is loaded.
    pub fn classifier_scores(&self) -> Option<Arc<DoubleBuffered<Vec<f32>>>> {
        self.classifier.as_ref().map(|classifier| classifier.scores())
    }

    /// Shared handle to the latest accepted timer reading.
    pub fn timer_result(&self) -> Arc<DoubleBuffered<TimerReading>> {
        self.timer_result.clone()
    }

    pub fn config(&self) -> &Arc<PipelineConfig> {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

impl<B: GraphicsBackend> Drop for FramePipeline<B> {
    fn drop(&mut self) {
        // Results of a discarded instance must not land after its replacement.
        if let Some(token) = self.pending_ocr.take() {
            token.cancel();
        }
    }
}
