use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    error::PipelineError,
    gpu::GraphicsBackend,
    pipeline::{
        FramePipeline, RenderOutcome,
        watchdog::{HealthComponent, PipelineHealth},
    },
};

/// Builds a pipeline for a `width` x `height` source.
pub type PipelineFactory<B> =
    Box<dyn FnMut(u32, u32) -> Result<FramePipeline<B>, PipelineError> + Send>;

/// Host-facing entry point: owns at most one pipeline and rebuilds it whenever
/// the source dimensions change.
///
/// `None` is the idle state (no sized source yet, or the last rebuild failed).
/// None of the driver's calls fail or panic; problems are logged and the
/// driver stays idle until the next resize.
pub struct PipelineDriver<B: GraphicsBackend> {
    factory: PipelineFactory<B>,
    pipeline: Option<FramePipeline<B>>,
    size: Option<(u32, u32)>,
    health: Option<Arc<PipelineHealth>>,
    rebuilds: u64,
}

impl<B: GraphicsBackend> PipelineDriver<B> {
    pub fn new(factory: PipelineFactory<B>) -> Self {
        Self {
            factory,
            pipeline: None,
            size: None,
            health: None,
            rebuilds: 0,
        }
    }

    /// Report render heartbeats to `health`.
    pub fn with_health(mut self, health: Arc<PipelineHealth>) -> Self {
        self.health = Some(health);
        self
    }

    /// Discard the current pipeline and build one for the new dimensions.
    ///
    /// Same-size calls are ignored, including after a failed build: only a
    /// real dimension change retries construction. A zero dimension returns
    /// to idle.
    pub fn resize(&mut self, width: u32, height: u32) {
        if self.size == Some((width, height)) {
            return;
        }
        self.size = Some((width, height));
        // The old instance goes first so its pending OCR is cancelled before
        // the replacement starts queueing work.
        self.pipeline = None;

        if width == 0 || height == 0 {
            info!("source has no size, pipeline idle");
            return;
        }

        match (self.factory)(width, height) {
            Ok(pipeline) => {
                self.rebuilds += 1;
                metrics::counter!("vision_pipeline_rebuilds_total", "outcome" => "built").increment(1);
                info!("pipeline rebuilt for {width}x{height}");
                self.pipeline = Some(pipeline);
            }
            Err(err) => {
                metrics::counter!("vision_pipeline_rebuilds_total", "outcome" => "failed")
                    .increment(1);
                warn!("failed to build pipeline for {width}x{height}: {err}");
            }
        }
    }

    pub fn tick(&mut self, timestamp: u64) {
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.on_tick(timestamp);
        }
    }

    pub fn render_opportunity(&mut self) -> RenderOutcome {
        if let Some(health) = self.health.as_ref() {
            health.beat(HealthComponent::Render);
        }
        match self.pipeline.as_mut() {
            Some(pipeline) => pipeline.on_render_opportunity(),
            None => RenderOutcome::Redraw,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.pipeline.is_some()
    }

    pub fn pipeline(&self) -> Option<&FramePipeline<B>> {
        self.pipeline.as_ref()
    }

    /// Successful constructions so far.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }
}
