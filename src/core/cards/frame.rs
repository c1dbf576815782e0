use std::time::Duration;

use super::classifier::ClassificationResult;
use super::error::{CaptureError, ErrorKind};

/// 相机帧：编码后的图像字节 + 采集时间
#[derive(Debug, Clone)]
pub struct Frame {
    pub bytes: Vec<u8>,
    pub timestamp: Duration,
}

impl Frame {
    pub fn new(bytes: Vec<u8>, timestamp_ms: u64) -> Self {
        Self {
            bytes,
            timestamp: Duration::from_millis(timestamp_ms),
        }
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp.as_millis() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectedObject {
    pub bbox: BoundingBox,
    pub label: String,
    pub score: f32,
}

impl DetectedObject {
    pub fn new(bbox: BoundingBox, label: impl Into<String>, score: f32) -> Self {
        Self {
            bbox,
            label: label.into(),
            score,
        }
    }
}

pub trait FrameSource: Send + Sync {
    fn capture_frame(&self) -> Result<Frame, CaptureError>;
}

/// Optional detector whose boxes drive change gating.
pub trait ObjectDetector: Send + Sync {
    fn detect(&self, bytes: &[u8]) -> Vec<DetectedObject>;
}

pub trait ResultSink: Send + Sync {
    fn on_result(&self, result: &ClassificationResult);

    fn on_error(&self, kind: ErrorKind, message: &str);
}
