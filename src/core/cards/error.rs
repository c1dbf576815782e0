use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("No frame available")]
    NoFrame,
    #[error("Camera not ready: {0}")]
    NotReady(String),
}

/// 单次 (候选, 策略) 加载失败
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid model descriptor: {0}")]
    Descriptor(#[from] serde_json::Error),
    #[error("Unsupported model format: {0}")]
    UnsupportedFormat(String),
    #[error("Weight error: {0}")]
    Weights(String),
    #[error("Unsupported operation: {0}")]
    UnsupportedOp(String),
    #[error("Shape error: {0}")]
    Shape(String),
}

#[derive(Debug, Error)]
#[error("Model load failed after {exhausted_candidates} candidate(s): {last_error}")]
pub struct ModelLoadError {
    pub exhausted_candidates: usize,
    pub last_error: String,
}

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("Image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("Unsupported target shape {height}x{width}x{channels}")]
    UnsupportedShape {
        height: usize,
        width: usize,
        channels: usize,
    },
    #[error("Worker pool error: {0}")]
    Pool(String),
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("Inference failed: {0}")]
    Inference(#[from] ModelError),
    #[error("Model returned no outputs")]
    NoOutput,
    #[error("Input shape mismatch: expected {expected:?}, got {actual:?}")]
    InputShape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("Output shape mismatch: expected {expected} classes, got shape {actual:?}")]
    OutputShape { expected: usize, actual: Vec<usize> },
    #[error("Output dtype mismatch: expected float32, got {0}")]
    OutputType(&'static str),
    #[error("Output contains non-finite probability at index {0}")]
    NonFinite(usize),
}

/// 单帧错误，均不终止流水线
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error(transparent)]
    Classify(#[from] ClassifyError),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Capture(_) => ErrorKind::Capture,
            PipelineError::Preprocess(_) => ErrorKind::Preprocess,
            PipelineError::Classify(_) => ErrorKind::Classify,
        }
    }
}

/// Error taxonomy reported to a `ResultSink`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Capture,
    ModelLoad,
    Preprocess,
    Classify,
}
