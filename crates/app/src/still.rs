//! One-shot analysis of still images through the live pipeline's render and
//! preprocessing path.

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use image::RgbaImage;
use tracing::debug;
use vision::{
    TimerExtractionAdapter,
    gpu::{
        GraphicsBackend, PixelFormat, Region, RenderPass, SoftwareBackend, SourceFeed,
        SourceFrame, TextureDesc,
    },
    pipeline::{
        config::{DEFAULT_TIMER_REGION, TelemetryOptions},
        telemetry,
    },
    timer::TimerPreprocessor,
};

use crate::cli::TimerArgs;

/// OCR the timer of a screenshot and print the validated reading.
pub fn read_timer(args: TimerArgs) -> Result<()> {
    let _telemetry_guard = telemetry::enter_runtime(&TelemetryOptions::default());
    let image = load_rgba(&args.image)?;
    let region = if args.cropped {
        Region::new(0.0, 0.0, 1.0, 1.0)
    } else {
        args.timer_region
            .map(|region| region.0)
            .unwrap_or(DEFAULT_TIMER_REGION)
    };

    let pixels = region.to_pixels(image.width(), image.height());
    let desc = TextureDesc::new(pixels.width, pixels.height, PixelFormat::Bgrx);
    let crop = render_still(&image, desc, &RenderPass::Crop { region })?;

    let binarized = TimerPreprocessor::new(desc.width, desc.height, 1).prepare(&crop)?;
    let mut adapter = TimerExtractionAdapter::from_data_path(&args.tessdata)?;
    let reading = adapter.read(&binarized)?;
    if reading.is_empty() {
        println!("no valid timer found");
    } else {
        println!("{}", reading.as_str());
    }
    Ok(())
}

/// Classify a screenshot and print the label with per-class scores as JSON.
#[cfg(feature = "with-tch")]
pub fn classify(args: crate::cli::ClassifyArgs) -> Result<()> {
    use ml_core::{ContextClassifier, TorchScriptEngine, tch::Device};
    use vision::PipelineConfig;

    let _telemetry_guard = telemetry::enter_runtime(&TelemetryOptions::default());
    let image = load_rgba(&args.image)?;
    let config = PipelineConfig::for_source(image.width(), image.height())?;
    let letterboxed = render_still(
        &image,
        config.classifier_target,
        &RenderPass::Letterbox {
            roi: config.classifier_roi,
            fill: config.letterbox_fill,
        },
    )?;

    let device = if args.use_cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available()
    };
    let engine = TorchScriptEngine::load(&args.model_path, device, config.classifier_input_shape())?;
    let mut classifier = ContextClassifier::new(engine);
    classifier.process(&letterboxed)?;

    let result = classifier.result();
    let scores: serde_json::Map<String, serde_json::Value> = classifier
        .labels()
        .iter()
        .zip(&result.scores)
        .map(|(label, score)| (label.to_string(), serde_json::json!(score)))
        .collect();
    let report = serde_json::json!({ "label": result.label, "scores": scores });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn load_rgba(path: &Path) -> Result<RgbaImage> {
    let image = image::open(path)
        .with_context(|| format!("Failed to read image {}", path.display()))?
        .to_rgba8();
    debug!("loaded {} ({}x{})", path.display(), image.width(), image.height());
    Ok(image)
}

/// Render `pass` over `image` into a `desc` target and read it back.
fn render_still(image: &RgbaImage, desc: TextureDesc, pass: &RenderPass) -> Result<Vec<u8>> {
    let feed = Arc::new(SourceFeed::new());
    feed.publish(SourceFrame {
        data: Arc::new(rgba_to_bgra(image)),
        width: image.width(),
        height: image.height(),
        timestamp_us: 0,
    });

    let mut backend = SoftwareBackend::new(feed);
    let mut target = backend.create_render_target(desc)?;
    let mut staging = backend.create_staging(desc)?;
    backend.render_into(&mut target, pass)?;
    backend.copy_to_staging(&target, &mut staging)?;
    let mut out = vec![0u8; desc.byte_len()];
    backend.map_staging_for_read(&mut staging, &mut out)?;
    Ok(out)
}

fn rgba_to_bgra(image: &RgbaImage) -> Vec<u8> {
    let mut data = image.as_raw().clone();
    for px in data.chunks_exact_mut(4) {
        px.swap(0, 2);
    }
    data
}
