use serde::{Deserialize, Serialize};

use crate::core::cards::error::{ErrorKind, PipelineError, PreprocessError};
use crate::core::cards::{BoundingBox, ClassificationResult, DetectedObject, PipelineStatus};

/// 识别结果，FRB 友好的扁平结构
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardPrediction {
    pub label: String,
    pub index: u32,
    /// 0-100
    pub confidence: f32,
    pub top_k: Vec<CardCandidate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardCandidate {
    pub label: String,
    pub probability: f32,
}

impl From<ClassificationResult> for CardPrediction {
    fn from(result: ClassificationResult) -> Self {
        Self {
            label: result.label,
            index: result.index as u32,
            confidence: result.confidence,
            top_k: result
                .top_k
                .into_iter()
                .map(|p| CardCandidate {
                    label: p.label,
                    probability: p.probability,
                })
                .collect(),
        }
    }
}

/// Dart 侧检测框
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CardBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub score: f32,
}

impl From<CardBox> for DetectedObject {
    fn from(b: CardBox) -> Self {
        DetectedObject::new(BoundingBox::new(b.x, b.y, b.w, b.h), "card", b.score)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecognizerState {
    Loading,
    Ready,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognizerStatus {
    pub state: RecognizerState,
    pub reason: Option<String>,
}

impl From<PipelineStatus> for RecognizerStatus {
    fn from(status: PipelineStatus) -> Self {
        match status {
            PipelineStatus::Loading => Self {
                state: RecognizerState::Loading,
                reason: None,
            },
            PipelineStatus::Ready => Self {
                state: RecognizerState::Ready,
                reason: None,
            },
            PipelineStatus::Failed(reason) => Self {
                state: RecognizerState::Failed,
                reason: Some(reason),
            },
        }
    }
}

/// 识别错误，FRB 友好的设计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognizerError {
    pub error_type: String,
    pub message: String,
}

impl RecognizerError {
    fn new(kind: ErrorKind, message: String) -> Self {
        Self {
            error_type: format!("{:?}", kind),
            message,
        }
    }
}

impl From<PipelineError> for RecognizerError {
    fn from(e: PipelineError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<PreprocessError> for RecognizerError {
    fn from(e: PreprocessError) -> Self {
        Self::new(ErrorKind::Preprocess, e.to_string())
    }
}

impl std::fmt::Display for RecognizerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.error_type, self.message)
    }
}

impl std::error::Error for RecognizerError {}
