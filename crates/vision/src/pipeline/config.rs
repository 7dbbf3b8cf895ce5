//! Configuration parsing for the analysis pipeline.
//!
//! CLI arguments are translated once into a [`VisionConfig`]; every pipeline
//! instance then receives an immutable [`PipelineConfig`] derived from it for the
//! concrete source dimensions. A resize builds a fresh `PipelineConfig`.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use anyhow::{Result, anyhow, bail};
use clap::Args;
use ml_core::{CLASSIFIER_INPUT_EDGE, InputShape, Normalization};

use crate::{
    error::PipelineError,
    gpu::{PixelFormat, Region, RoiRect, TextureDesc},
    pipeline::staging::MIN_STAGING_SLOTS,
    server::DEFAULT_BROADCAST_PORT,
};

/// Timer region of a 1920x1080 broadcast, as fractions of the frame.
pub const DEFAULT_TIMER_REGION: Region =
    Region::new(800.0 / 1920.0, 20.0 / 1080.0, 320.0 / 1920.0, 100.0 / 1080.0);
pub const DEFAULT_LETTERBOX_FILL: f32 = 0.5;
pub const DEFAULT_STAGING_SLOTS: usize = 2;
pub const DEFAULT_QUEUE_DEPTH: usize = 4;
pub const DEFAULT_TASK_BUDGET_MS: u64 = 2_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Ingress transport used to source frames.
pub enum SourceKind {
    /// Local V4L devices or pre-recorded files.
    Device,
    /// Real-time streaming protocol feeds.
    Rtsp,
    /// Generated frames, no external input.
    TestPattern,
}

impl SourceKind {
    /// Infer the transport kind from a URI.
    pub fn from_uri(uri: &str) -> Self {
        if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
            SourceKind::Rtsp
        } else if uri.starts_with("testpattern:") {
            SourceKind::TestPattern
        } else {
            SourceKind::Device
        }
    }
}

/// Optional telemetry knobs for tracing output.
#[derive(Clone, Debug, Default)]
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Raise the default log level to `debug`.
    pub verbose: bool,
}

/// Canonical configuration shared by every pipeline instance in the process.
#[derive(Clone, Debug)]
pub struct VisionConfig {
    /// Source URI or device identifier.
    pub source_uri: String,
    pub source_kind: SourceKind,
    /// Width frames are decoded at.
    pub width: u32,
    /// Height frames are decoded at.
    pub height: u32,
    /// TorchScript classifier; classification is disabled when absent.
    pub model_path: Option<PathBuf>,
    /// Tesseract data directory.
    pub tessdata: PathBuf,
    pub use_cpu: bool,
    pub timer_region: Region,
    pub letterbox_fill: f32,
    pub staging_slots: usize,
    pub median_window: usize,
    pub queue_depth: usize,
    pub task_budget: Duration,
    pub broadcast_addr: SocketAddr,
    pub telemetry: TelemetryOptions,
}

/// CLI arguments accepted by the `run` subcommand.
#[derive(Debug, Args)]
pub struct VisionCliArgs {
    /// Source URI, file path, `/dev/videoN`, or `testpattern:`.
    #[arg(value_name = "SOURCE")]
    pub source: Option<String>,
    /// Source flag (overrides positional).
    #[arg(long = "source", value_name = "URI")]
    pub source_flag: Option<String>,
    /// TorchScript classifier model.
    #[arg(long = "model", value_name = "PATH")]
    pub model_path: Option<PathBuf>,
    /// Tesseract data directory.
    #[arg(long = "tessdata", value_name = "DIR", env = "TESSDATA_PREFIX")]
    pub tessdata: Option<PathBuf>,
    /// Decode width in pixels.
    #[arg(long = "width", value_name = "PX", default_value_t = 1920)]
    pub width: u32,
    /// Decode height in pixels.
    #[arg(long = "height", value_name = "PX", default_value_t = 1080)]
    pub height: u32,
    /// Force CPU inference.
    #[arg(long = "cpu", action = clap::ArgAction::SetTrue)]
    pub use_cpu: bool,
    /// Timer region as fractions `x,y,w,h` of the frame.
    #[arg(long = "timer-region", value_name = "X,Y,W,H")]
    pub timer_region: Option<RegionArg>,
    /// Gray level (0-1) of the classifier letterbox bars.
    #[arg(long = "letterbox-fill", value_name = "LEVEL")]
    pub letterbox_fill: Option<f32>,
    /// Staging surfaces per readback ring.
    #[arg(long = "staging-slots", value_name = "N")]
    pub staging_slots: Option<usize>,
    /// Timer frames folded into the per-pixel median before OCR.
    #[arg(long = "median-window", value_name = "N")]
    pub median_window: Option<usize>,
    /// Maximum OCR tasks waiting on the worker.
    #[arg(long = "queue-depth", value_name = "N")]
    pub queue_depth: Option<usize>,
    /// Cancel a background task running longer than this.
    #[arg(long = "task-budget-ms", value_name = "MS")]
    pub task_budget_ms: Option<u64>,
    /// Broadcast server bind address.
    #[arg(long = "bind", value_name = "ADDR", default_value = "0.0.0.0")]
    pub bind: IpAddr,
    /// Broadcast server port.
    #[arg(long = "port", value_name = "PORT", default_value_t = DEFAULT_BROADCAST_PORT)]
    pub port: u16,
    /// Enable verbose logging.
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

/// `x,y,w,h` fractional region parsed from the command line.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RegionArg(pub Region);

impl FromStr for RegionArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts = value
            .split(',')
            .map(|part| part.trim().parse::<f32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| format!("invalid region {value:?}: {err}"))?;
        match parts.as_slice() {
            [x, y, w, h] => Ok(Self(Region::new(*x, *y, *w, *h))),
            _ => Err(format!("region {value:?} must have four components x,y,w,h")),
        }
    }
}

impl TryFrom<VisionCliArgs> for VisionConfig {
    type Error = anyhow::Error;

    fn try_from(args: VisionCliArgs) -> Result<Self> {
        let source_uri = args.source_flag.or(args.source).ok_or_else(|| {
            anyhow!("Missing source. Provide --source <uri> or positional <source>.")
        })?;
        let tessdata = args.tessdata.ok_or_else(|| {
            anyhow!("Missing OCR data. Provide --tessdata <dir> or set TESSDATA_PREFIX.")
        })?;

        if args.width == 0 || args.height == 0 {
            bail!("Capture width and height must be positive integers");
        }

        let timer_region = args
            .timer_region
            .map(|RegionArg(region)| region)
            .unwrap_or(DEFAULT_TIMER_REGION);
        if !timer_region.is_normalized() {
            bail!("--timer-region must have positive size and lie inside 0..1");
        }

        let letterbox_fill = args.letterbox_fill.unwrap_or(DEFAULT_LETTERBOX_FILL);
        if !(0.0..=1.0).contains(&letterbox_fill) {
            bail!("--letterbox-fill must be between 0 and 1");
        }

        let staging_slots = args.staging_slots.unwrap_or(DEFAULT_STAGING_SLOTS);
        if staging_slots < MIN_STAGING_SLOTS {
            bail!("--staging-slots must be at least {MIN_STAGING_SLOTS}");
        }

        let median_window = args.median_window.unwrap_or(1);
        if median_window == 0 {
            bail!("--median-window must be at least 1");
        }

        let queue_depth = args.queue_depth.unwrap_or(DEFAULT_QUEUE_DEPTH);
        if queue_depth == 0 {
            bail!("--queue-depth must be at least 1");
        }

        let task_budget_ms = args.task_budget_ms.unwrap_or(DEFAULT_TASK_BUDGET_MS);
        if task_budget_ms == 0 {
            bail!("--task-budget-ms must be positive");
        }

        let source_kind = SourceKind::from_uri(&source_uri);

        Ok(Self {
            source_uri,
            source_kind,
            width: args.width,
            height: args.height,
            model_path: args.model_path,
            tessdata,
            use_cpu: args.use_cpu,
            timer_region,
            letterbox_fill,
            staging_slots,
            median_window,
            queue_depth,
            task_budget: Duration::from_millis(task_budget_ms),
            broadcast_addr: SocketAddr::new(args.bind, args.port),
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
                verbose: args.verbose,
            },
        })
    }
}

impl VisionConfig {
    /// Immutable per-instance configuration for a `width` x `height` source.
    pub fn pipeline_config(
        &self,
        width: u32,
        height: u32,
    ) -> Result<Arc<PipelineConfig>, PipelineError> {
        let mut config = PipelineConfig::for_source(width, height)?;
        config.timer_region = self.timer_region;
        config.timer_target = timer_target(self.timer_region, width, height);
        config.letterbox_fill = self.letterbox_fill;
        config.staging_slots = self.staging_slots;
        config.median_window = self.median_window;
        config.model_path = self.model_path.clone();
        config.tessdata = Some(self.tessdata.clone());
        config.validate()?;
        Ok(Arc::new(config))
    }
}

/// Fixed-at-construction configuration of one pipeline instance.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub source_width: u32,
    pub source_height: u32,
    /// Classifier render target and staging surface.
    pub classifier_target: TextureDesc,
    /// Where the source lands inside the classifier target.
    pub classifier_roi: RoiRect,
    pub letterbox_fill: f32,
    pub normalization: Normalization,
    pub timer_region: Region,
    /// Timer crop render target, sized to the region's source pixels.
    pub timer_target: TextureDesc,
    pub staging_slots: usize,
    pub median_window: usize,
    pub model_path: Option<PathBuf>,
    pub tessdata: Option<PathBuf>,
}

impl PipelineConfig {
    /// Defaults for a `width` x `height` source.
    pub fn for_source(width: u32, height: u32) -> Result<Self, PipelineError> {
        if width == 0 || height == 0 {
            return Err(PipelineError::Config(format!(
                "source dimensions must be positive, got {width}x{height}"
            )));
        }
        let edge = CLASSIFIER_INPUT_EDGE as u32;
        Ok(Self {
            source_width: width,
            source_height: height,
            classifier_target: TextureDesc::new(edge, edge, PixelFormat::Bgrx),
            classifier_roi: RoiRect::letterbox(width, height, edge, edge),
            letterbox_fill: DEFAULT_LETTERBOX_FILL,
            normalization: Normalization::IMAGENET,
            timer_region: DEFAULT_TIMER_REGION,
            timer_target: timer_target(DEFAULT_TIMER_REGION, width, height),
            staging_slots: DEFAULT_STAGING_SLOTS,
            median_window: 1,
            model_path: None,
            tessdata: None,
        })
    }

    /// Model input shape matching the classifier target.
    pub fn classifier_input_shape(&self) -> InputShape {
        InputShape::new(
            3,
            self.classifier_target.height as usize,
            self.classifier_target.width as usize,
        )
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.staging_slots < MIN_STAGING_SLOTS {
            return Err(PipelineError::Config(format!(
                "staging ring needs at least {MIN_STAGING_SLOTS} slots"
            )));
        }
        if !self.timer_region.is_normalized() {
            return Err(PipelineError::Config(format!(
                "timer region {:?} is outside the frame",
                self.timer_region
            )));
        }
        if self.classifier_target.format != PixelFormat::Bgrx
            || self.timer_target.format != PixelFormat::Bgrx
        {
            return Err(PipelineError::Config(
                "analysis targets must be BGRX".into(),
            ));
        }
        Ok(())
    }
}

fn timer_target(region: Region, width: u32, height: u32) -> TextureDesc {
    let rect = region.to_pixels(width, height);
    TextureDesc::new(rect.width, rect.height, PixelFormat::Bgrx)
}
