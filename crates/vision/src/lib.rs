//! Frame-driven analysis pipeline: GPU staging readback, cancellable CPU work
//! queue, game-context classification, timer OCR, and result broadcasting.

pub mod error;
pub mod gpu;
pub mod pipeline;
pub mod server;
pub mod timer;

pub use error::PipelineError;
pub use pipeline::{
    FramePipeline, PipelineDriver, PipelineFactory, PipelineResources, RenderOutcome,
    config::{PipelineConfig, VisionCliArgs, VisionConfig},
    staging::AsyncStagingReader,
    task_queue::{CancellationToken, TaskCancelled, ThrottledTaskQueue},
};
pub use server::{Broadcaster, EventServer};
pub use timer::{TimerExtractionAdapter, TimerReading};
