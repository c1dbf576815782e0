//! 测试用的 mock：帧源、检测器、结果接收端，以及常量输出模型

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use image::{ImageOutputFormat, RgbImage};

use super::classifier::{ClassificationResult, CARD_CLASSES};
use super::error::{CaptureError, ErrorKind};
use super::frame::{DetectedObject, Frame, FrameSource, ObjectDetector, ResultSink};
use super::model::ModelCandidate;

pub const CONSTANT_MODEL_SIDE: usize = 70;

pub fn encode_blank_png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::new(width, height);
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageOutputFormat::Png).unwrap();
    buf.into_inner()
}

/// Flatten -> Dense with a zero kernel, so the bias is the output whatever
/// the frame. `class` gets `probability`, the rest share the remainder.
pub fn constant_model_candidate(class: usize, probability: f32) -> ModelCandidate {
    constant_model_with_classes(CARD_CLASSES.len(), class, probability)
}

pub fn constant_model_with_classes(classes: usize, class: usize, probability: f32) -> ModelCandidate {
    let side = CONSTANT_MODEL_SIDE;
    let descriptor = format!(
        r#"{{
            "format": "layers-model",
            "modelTopology": {{"model_config": {{"class_name": "Sequential", "config": {{"layers": [
                {{"class_name": "Flatten", "config": {{"name": "flatten", "batch_input_shape": [null, {side}, {side}, 1]}}}},
                {{"class_name": "Dense", "config": {{"name": "dense", "units": {classes}, "activation": "linear"}}}}
            ]}}}}}},
            "weightsManifest": [{{"paths": ["group1-shard1of1.bin"], "weights": [
                {{"name": "dense/kernel", "shape": [{inputs}, {classes}], "dtype": "float32"}},
                {{"name": "dense/bias", "shape": [{classes}], "dtype": "float32"}}
            ]}}]
        }}"#,
        side = side,
        classes = classes,
        inputs = side * side,
    );

    let mut weights = vec![0u8; side * side * classes * 4];
    weights.extend(class_probabilities(classes, class, probability).iter().flat_map(|p| p.to_le_bytes()));
    ModelCandidate::new("constant", descriptor.into_bytes(), vec![weights])
}

/// Graph model with two signature outputs: `output_0` is the 52-class
/// constant vector, `output_1` the reshaped [1, 1] input.
pub fn two_output_graph_candidate(class: usize, probability: f32) -> ModelCandidate {
    let classes = CARD_CLASSES.len();
    let descriptor = format!(
        r#"{{
            "format": "graph-model",
            "signature": {{
                "inputs": {{"image": {{"name": "input:0",
                    "tensorShape": {{"dim": [{{"size": "-1"}}, {{"size": "1"}}, {{"size": "1"}}, {{"size": "1"}}]}}}}}},
                "outputs": {{
                    "output_0": {{"name": "probs:0"}},
                    "output_1": {{"name": "flat:0"}}
                }}
            }},
            "modelTopology": {{"node": [
                {{"name": "input", "op": "Placeholder"}},
                {{"name": "flat/shape", "op": "Const"}},
                {{"name": "kernel", "op": "Const"}},
                {{"name": "bias", "op": "Const"}},
                {{"name": "flat", "op": "Reshape", "input": ["input", "flat/shape"]}},
                {{"name": "logits", "op": "MatMul", "input": ["flat", "kernel"]}},
                {{"name": "probs", "op": "BiasAdd", "input": ["logits", "bias"]}}
            ]}},
            "weightsManifest": [{{"paths": ["group1-shard1of1.bin"], "weights": [
                {{"name": "flat/shape", "shape": [2], "dtype": "int32"}},
                {{"name": "kernel", "shape": [1, {classes}], "dtype": "float32"}},
                {{"name": "bias", "shape": [{classes}], "dtype": "float32"}}
            ]}}]
        }}"#,
        classes = classes,
    );

    let mut weights: Vec<u8> = [-1i32, 1].iter().flat_map(|v| v.to_le_bytes()).collect();
    weights.extend(vec![0u8; classes * 4]);
    weights.extend(class_probabilities(classes, class, probability).iter().flat_map(|p| p.to_le_bytes()));
    ModelCandidate::new("two_outputs", descriptor.into_bytes(), vec![weights])
}

fn class_probabilities(classes: usize, class: usize, probability: f32) -> Vec<f32> {
    let rest = (1.0 - probability) / (classes - 1) as f32;
    (0..classes).map(|i| if i == class { probability } else { rest }).collect()
}

pub struct MockFrameSource {
    frame: Option<Frame>,
    error: Box<dyn Fn() -> CaptureError + Send + Sync>,
    calls: AtomicUsize,
}

impl MockFrameSource {
    pub fn with_frame(frame: Frame) -> Self {
        Self {
            frame: Some(frame),
            error: Box::new(|| CaptureError::NoFrame),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: impl Fn() -> CaptureError + Send + Sync + 'static) -> Self {
        Self {
            frame: None,
            error: Box::new(error),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FrameSource for MockFrameSource {
    fn capture_frame(&self) -> Result<Frame, CaptureError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.frame.clone().ok_or_else(|| (self.error)())
    }
}

pub struct MockObjectDetector {
    objects: Vec<DetectedObject>,
}

impl MockObjectDetector {
    pub fn fixed(objects: Vec<DetectedObject>) -> Self {
        Self { objects }
    }
}

impl ObjectDetector for MockObjectDetector {
    fn detect(&self, _bytes: &[u8]) -> Vec<DetectedObject> {
        self.objects.clone()
    }
}

#[derive(Default)]
pub struct RecordingSink {
    results: Mutex<Vec<ClassificationResult>>,
    errors: Mutex<Vec<(ErrorKind, String)>>,
}

impl RecordingSink {
    pub fn labels(&self) -> Vec<String> {
        self.results.lock().unwrap().iter().map(|r| r.label.clone()).collect()
    }

    pub fn errors(&self) -> Vec<ErrorKind> {
        self.errors.lock().unwrap().iter().map(|(k, _)| *k).collect()
    }
}

impl ResultSink for RecordingSink {
    fn on_result(&self, result: &ClassificationResult) {
        self.results.lock().unwrap().push(result.clone());
    }

    fn on_error(&self, kind: ErrorKind, message: &str) {
        self.errors.lock().unwrap().push((kind, message.to_string()));
    }
}
