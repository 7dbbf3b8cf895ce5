use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc,
    },
    time::Duration,
};

use image::GrayImage;
use ml_core::{CONTEXT_LABELS, InferenceEngine, InferenceError, InputShape, Normalization};
use vision::{
    Broadcaster, FramePipeline, PipelineConfig, PipelineDriver, PipelineError, PipelineResources,
    RenderOutcome, ThrottledTaskQueue,
    gpu::{BackendError, GraphicsBackend, RenderPass, TextureDesc},
    pipeline::{CONTEXT_TOPIC, TIMER_TOPIC},
    timer::{OcrEngine, OcrError, PageSegMode},
};

const WAIT: Duration = Duration::from_secs(5);

/// Backend whose copies are only completed when the staging surface is
/// mapped, the way a GPU fence would be waited on.
#[derive(Clone, Default)]
struct DeferredBackend {
    fail_renders: Arc<AtomicBool>,
}

struct FakeTexture {
    desc: TextureDesc,
    renders: u8,
}

struct FakeStaging {
    in_flight: Option<u8>,
    landed: Option<u8>,
}

impl GraphicsBackend for DeferredBackend {
    type Texture = FakeTexture;
    type Staging = FakeStaging;

    fn create_render_target(&mut self, desc: TextureDesc) -> Result<FakeTexture, BackendError> {
        Ok(FakeTexture { desc, renders: 0 })
    }

    fn create_staging(&mut self, _desc: TextureDesc) -> Result<FakeStaging, BackendError> {
        Ok(FakeStaging {
            in_flight: None,
            landed: None,
        })
    }

    fn texture_desc(&self, texture: &FakeTexture) -> TextureDesc {
        texture.desc
    }

    fn render_into(
        &mut self,
        target: &mut FakeTexture,
        _pass: &RenderPass,
    ) -> Result<(), BackendError> {
        if self.fail_renders.load(Ordering::SeqCst) {
            return Err(BackendError::Device("device lost".into()));
        }
        target.renders += 1;
        Ok(())
    }

    fn copy_to_staging(
        &mut self,
        texture: &FakeTexture,
        staging: &mut FakeStaging,
    ) -> Result<(), BackendError> {
        staging.in_flight = Some(texture.renders);
        Ok(())
    }

    fn map_staging_for_read(
        &mut self,
        staging: &mut FakeStaging,
        out: &mut [u8],
    ) -> Result<(), BackendError> {
        if let Some(value) = staging.in_flight.take() {
            staging.landed = Some(value);
        }
        let value = staging.landed.ok_or(BackendError::NothingToMap)?;
        out.fill(value);
        Ok(())
    }
}

/// Engine replaying a script of winning label indices; `None` fails the call.
struct ScriptedEngine {
    shape: InputShape,
    script: Vec<Option<usize>>,
    first_inputs: Arc<Mutex<Vec<f32>>>,
}

impl ScriptedEngine {
    fn new(script: Vec<Option<usize>>) -> (Self, Arc<Mutex<Vec<f32>>>) {
        let first_inputs = Arc::new(Mutex::new(Vec::new()));
        let engine = Self {
            shape: InputShape::new(3, 224, 224),
            script,
            first_inputs: first_inputs.clone(),
        };
        (engine, first_inputs)
    }
}

impl InferenceEngine for ScriptedEngine {
    fn input_shape(&self) -> InputShape {
        self.shape
    }

    fn forward(&mut self, input: &[f32], output: &mut Vec<f32>) -> Result<(), InferenceError> {
        self.first_inputs.lock().expect("inputs lock").push(input[0]);
        let step = if self.script.is_empty() {
            Some(0)
        } else {
            self.script.remove(0)
        };
        let winner = step.ok_or_else(|| InferenceError::Forward("scripted failure".into()))?;
        output.clear();
        output.resize(CONTEXT_LABELS.len(), 0.0);
        output[winner] = 1.0;
        Ok(())
    }
}

/// OCR engine replaying canned strings, optionally holding its first call
/// until released.
struct ScriptedOcr {
    replies: Vec<&'static str>,
    calls: Arc<AtomicUsize>,
    first_call_gate: Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>,
}

impl ScriptedOcr {
    fn new(replies: Vec<&'static str>) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                replies,
                calls: calls.clone(),
                first_call_gate: None,
            },
            calls,
        )
    }
}

impl OcrEngine for ScriptedOcr {
    fn recognize(
        &mut self,
        image: &GrayImage,
        whitelist: &str,
        mode: PageSegMode,
    ) -> Result<String, OcrError> {
        assert_eq!(image.dimensions(), (320, 100));
        assert_eq!(whitelist, "0123456789:");
        assert_eq!(mode, PageSegMode::SingleLine);
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some((started, release)) = self.first_call_gate.take() {
            let _ = started.send(());
            let _ = release.recv_timeout(WAIT);
        }
        let reply = if self.replies.len() > 1 {
            self.replies.remove(0)
        } else {
            self.replies[0]
        };
        Ok(reply.to_string())
    }
}

#[derive(Default)]
struct RecordingBroadcaster {
    published: Mutex<Vec<(String, String)>>,
}

impl RecordingBroadcaster {
    fn payloads(&self, topic: &str) -> Vec<String> {
        self.published
            .lock()
            .expect("published lock")
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

impl Broadcaster for RecordingBroadcaster {
    fn publish(&self, topic: &str, payload: &str) {
        self.published
            .lock()
            .expect("published lock")
            .push((topic.to_string(), payload.to_string()));
    }
}

struct Harness {
    pipeline: FramePipeline<DeferredBackend>,
    queue: Arc<ThrottledTaskQueue>,
    broadcaster: Arc<RecordingBroadcaster>,
    engine_inputs: Arc<Mutex<Vec<f32>>>,
    ocr_calls: Arc<AtomicUsize>,
    backend: DeferredBackend,
}

fn harness(
    engine_script: Vec<Option<usize>>,
    ocr: ScriptedOcr,
    ocr_calls: Arc<AtomicUsize>,
) -> Harness {
    let config = Arc::new(PipelineConfig::for_source(1920, 1080).expect("config"));
    let queue = Arc::new(ThrottledTaskQueue::new("pipeline-test", 4).expect("queue"));
    let broadcaster = Arc::new(RecordingBroadcaster::default());
    let (engine, engine_inputs) = ScriptedEngine::new(engine_script);
    let backend = DeferredBackend::default();
    let pipeline = FramePipeline::new(
        config,
        PipelineResources {
            backend: backend.clone(),
            engine: Some(Box::new(engine)),
            ocr: Box::new(ocr),
        },
        queue.clone(),
        broadcaster.clone(),
    )
    .expect("pipeline");
    Harness {
        pipeline,
        queue,
        broadcaster,
        engine_inputs,
        ocr_calls,
        backend,
    }
}

fn normalized_red(value: u8) -> f32 {
    (f32::from(value) - Normalization::IMAGENET.mean[0]) / Normalization::IMAGENET.std[0]
}

#[test]
fn only_strictly_newer_ticks_trigger_cycles() {
    let (ocr, calls) = ScriptedOcr::new(vec!["0 1 : 3 0"]);
    let mut h = harness(vec![Some(1), Some(4)], ocr, calls);

    let mut outcomes = Vec::new();
    for ts in [1, 1, 2, 3] {
        h.pipeline.on_tick(ts);
        outcomes.push(h.pipeline.on_render_opportunity());
    }
    assert_eq!(
        outcomes,
        vec![
            RenderOutcome::Analyzed { cycle: 1 },
            RenderOutcome::Redraw,
            RenderOutcome::Analyzed { cycle: 2 },
            RenderOutcome::Analyzed { cycle: 3 },
        ]
    );
    assert_eq!(h.pipeline.cycles(), 3);

    // Cycle 1 had nothing staged yet; cycles 2 and 3 classify the previous
    // cycle's capture.
    let inputs = h.engine_inputs.lock().expect("inputs").clone();
    assert_eq!(inputs.len(), 2);
    assert!((inputs[0] - normalized_red(1)).abs() < 1e-5);
    assert!((inputs[1] - normalized_red(2)).abs() < 1e-5);

    assert_eq!(
        h.broadcaster.payloads(CONTEXT_TOPIC),
        vec!["LanePhase".to_string(), "PreparationPhase".to_string()]
    );
    assert_eq!(h.pipeline.context_label(), Some("PreparationPhase"));

    assert!(h.queue.wait_idle(WAIT));
    assert!(h.ocr_calls.load(Ordering::SeqCst) >= 1);
    assert_eq!(h.pipeline.timer_result().read().as_str(), "01:30");
    assert!(h.broadcaster.payloads(TIMER_TOPIC).iter().all(|p| p == "01:30"));
}

#[test]
fn out_of_order_ticks_are_dropped() {
    let (ocr, calls) = ScriptedOcr::new(vec!["01:00"]);
    let mut h = harness(vec![], ocr, calls);
    h.pipeline.on_tick(10);
    assert!(matches!(h.pipeline.on_render_opportunity(), RenderOutcome::Analyzed { .. }));
    h.pipeline.on_tick(9);
    h.pipeline.on_tick(10);
    assert_eq!(h.pipeline.on_render_opportunity(), RenderOutcome::Redraw);
    assert_eq!(h.pipeline.on_render_opportunity(), RenderOutcome::Redraw);
    assert_eq!(h.pipeline.cycles(), 1);
}

#[test]
fn first_tick_at_zero_starts_a_cycle() {
    let (ocr, calls) = ScriptedOcr::new(vec!["01:00"]);
    let mut h = harness(vec![], ocr, calls);
    h.pipeline.on_tick(0);
    assert_eq!(h.pipeline.on_render_opportunity(), RenderOutcome::Analyzed { cycle: 1 });
    h.pipeline.on_tick(0);
    assert_eq!(h.pipeline.on_render_opportunity(), RenderOutcome::Redraw);
    h.pipeline.on_tick(1);
    assert_eq!(h.pipeline.on_render_opportunity(), RenderOutcome::Analyzed { cycle: 2 });
}

#[test]
fn newer_timer_crop_supersedes_pending_ocr() {
    let (mut ocr, calls) = ScriptedOcr::new(vec!["09:59", "02:00"]);
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    ocr.first_call_gate = Some((started_tx, release_rx));
    let mut h = harness(vec![], ocr, calls);

    h.pipeline.on_tick(1);
    h.pipeline.on_render_opportunity();
    h.pipeline.on_tick(2);
    h.pipeline.on_render_opportunity();
    started_rx.recv_timeout(WAIT).expect("first OCR started");

    // While the first OCR is stuck, three newer crops arrive.
    for ts in 3..=5 {
        h.pipeline.on_tick(ts);
        h.pipeline.on_render_opportunity();
    }
    release_tx.send(()).expect("release OCR");
    assert!(h.queue.wait_idle(WAIT));

    // The stuck task finished OCR but was stale; the two middle crops never ran.
    assert_eq!(h.ocr_calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.broadcaster.payloads(TIMER_TOPIC), vec!["02:00".to_string()]);
    assert_eq!(h.pipeline.timer_result().read().as_str(), "02:00");
    assert_eq!(h.queue.stats().cancelled, 3);
}

#[test]
fn rejected_timer_text_publishes_nothing() {
    let (ocr, calls) = ScriptedOcr::new(vec!["GG:99"]);
    let mut h = harness(vec![], ocr, calls);
    for ts in 1..=2 {
        h.pipeline.on_tick(ts);
        h.pipeline.on_render_opportunity();
    }
    assert!(h.queue.wait_idle(WAIT));
    assert_eq!(h.ocr_calls.load(Ordering::SeqCst), 1);
    assert!(h.broadcaster.payloads(TIMER_TOPIC).is_empty());
    assert!(h.pipeline.timer_result().read().is_empty());
}

#[test]
fn transient_failures_keep_last_published_label() {
    let (ocr, calls) = ScriptedOcr::new(vec!["00:10"]);
    let mut h = harness(vec![Some(5), None, Some(7)], ocr, calls);

    for ts in 1..=3 {
        h.pipeline.on_tick(ts);
        h.pipeline.on_render_opportunity();
    }
    assert_eq!(
        h.broadcaster.payloads(CONTEXT_TOPIC),
        vec!["ResultScreen".to_string(), "ResultScreen".to_string()]
    );

    // Rendering fails for a cycle: the readback of the previous capture still
    // classifies, and the cycle after that has nothing new to read.
    h.backend.fail_renders.store(true, Ordering::SeqCst);
    h.pipeline.on_tick(4);
    assert_eq!(
        h.pipeline.on_render_opportunity(),
        RenderOutcome::Analyzed { cycle: 4 }
    );
    h.pipeline.on_tick(5);
    assert_eq!(
        h.pipeline.on_render_opportunity(),
        RenderOutcome::Analyzed { cycle: 5 }
    );
    assert_eq!(h.pipeline.context_label(), Some("SecondaryObjectiveFight"));
    assert_eq!(h.engine_inputs.lock().expect("inputs").len(), 3);
}

#[test]
fn model_with_wrong_input_shape_is_refused() {
    let config = Arc::new(PipelineConfig::for_source(1280, 720).expect("config"));
    let queue = Arc::new(ThrottledTaskQueue::new("shape-test", 4).expect("queue"));
    let (mut engine, _) = ScriptedEngine::new(vec![]);
    engine.shape = InputShape::new(3, 32, 32);
    let (ocr, _) = ScriptedOcr::new(vec!["01:00"]);
    let err = FramePipeline::new(
        config,
        PipelineResources {
            backend: DeferredBackend::default(),
            engine: Some(Box::new(engine)),
            ocr: Box::new(ocr),
        },
        queue,
        Arc::new(RecordingBroadcaster::default()),
    )
    .err()
    .expect("construction must fail");
    assert!(matches!(err, PipelineError::ModelShape { .. }));
}

#[test]
fn driver_rebuilds_on_resize_and_idles_on_failure() {
    let queue = Arc::new(ThrottledTaskQueue::new("driver-test", 4).expect("queue"));
    let broadcaster: Arc<dyn Broadcaster> = Arc::new(RecordingBroadcaster::default());
    let built = Arc::new(Mutex::new(Vec::new()));
    let factory_built = built.clone();
    let mut driver = PipelineDriver::new(Box::new(move |width, height| {
        factory_built.lock().expect("built lock").push((width, height));
        if width == 999 {
            return Err(PipelineError::Config("unsupported width".into()));
        }
        let config = Arc::new(PipelineConfig::for_source(width, height)?);
        let (engine, _) = ScriptedEngine::new(vec![]);
        let (ocr, _) = ScriptedOcr::new(vec!["01:00"]);
        FramePipeline::new(
            config,
            PipelineResources {
                backend: DeferredBackend::default(),
                engine: Some(Box::new(engine)),
                ocr: Box::new(ocr),
            },
            queue.clone(),
            broadcaster.clone(),
        )
    }));

    driver.tick(1);
    assert_eq!(driver.render_opportunity(), RenderOutcome::Redraw);
    assert!(!driver.is_ready());

    driver.resize(1920, 1080);
    assert!(driver.is_ready());
    driver.tick(1);
    assert_eq!(driver.render_opportunity(), RenderOutcome::Analyzed { cycle: 1 });

    driver.resize(1920, 1080);
    assert_eq!(driver.rebuilds(), 1);

    driver.resize(1280, 720);
    assert_eq!(driver.rebuilds(), 2);
    let pipeline = driver.pipeline().expect("rebuilt");
    assert_eq!(pipeline.cycles(), 0);
    assert_eq!(pipeline.config().source_width, 1280);
    assert_eq!(pipeline.config().timer_target.width, 213);

    // The host resizes every frame; a failed size is not rebuilt again.
    for ts in 2..32 {
        driver.resize(999, 720);
        driver.tick(ts);
        assert_eq!(driver.render_opportunity(), RenderOutcome::Redraw);
    }
    assert!(!driver.is_ready());
    assert_eq!(driver.rebuilds(), 2);

    driver.resize(0, 0);
    assert!(!driver.is_ready());
    assert_eq!(
        *built.lock().expect("built lock"),
        vec![(1920, 1080), (1280, 720), (999, 720)]
    );
}

#[test]
fn pipeline_without_model_only_reads_the_timer() {
    let config = Arc::new(PipelineConfig::for_source(1920, 1080).expect("config"));
    let queue = Arc::new(ThrottledTaskQueue::new("timer-only", 4).expect("queue"));
    let broadcaster = Arc::new(RecordingBroadcaster::default());
    let (ocr, calls) = ScriptedOcr::new(vec!["00:45"]);
    let mut pipeline = FramePipeline::new(
        config,
        PipelineResources {
            backend: DeferredBackend::default(),
            engine: None,
            ocr: Box::new(ocr),
        },
        queue.clone(),
        broadcaster.clone(),
    )
    .expect("pipeline");

    for ts in 1..=3 {
        pipeline.on_tick(ts);
        pipeline.on_render_opportunity();
    }
    assert!(queue.wait_idle(WAIT));
    assert!(calls.load(Ordering::SeqCst) >= 1);
    assert_eq!(pipeline.context_label(), None);
    assert!(pipeline.classifier_scores().is_none());
    assert!(broadcaster.payloads(CONTEXT_TOPIC).is_empty());
    assert_eq!(pipeline.timer_result().read().as_str(), "00:45");
}
