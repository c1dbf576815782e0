use log::debug;
use serde::{Deserialize, Serialize};

use super::error::ClassifyError;
use super::model::ModelHandle;
use super::tensor::Tensor;

/// 52 张牌，点数为主序、花色为次序
pub const CARD_CLASSES: [&str; 52] = [
    "ace of clubs", "ace of diamonds", "ace of hearts", "ace of spades",
    "two of clubs", "two of diamonds", "two of hearts", "two of spades",
    "three of clubs", "three of diamonds", "three of hearts", "three of spades",
    "four of clubs", "four of diamonds", "four of hearts", "four of spades",
    "five of clubs", "five of diamonds", "five of hearts", "five of spades",
    "six of clubs", "six of diamonds", "six of hearts", "six of spades",
    "seven of clubs", "seven of diamonds", "seven of hearts", "seven of spades",
    "eight of clubs", "eight of diamonds", "eight of hearts", "eight of spades",
    "nine of clubs", "nine of diamonds", "nine of hearts", "nine of spades",
    "ten of clubs", "ten of diamonds", "ten of hearts", "ten of spades",
    "jack of clubs", "jack of diamonds", "jack of hearts", "jack of spades",
    "queen of clubs", "queen of diamonds", "queen of hearts", "queen of spades",
    "king of clubs", "king of diamonds", "king of hearts", "king of spades",
];

pub const DEFAULT_TOP_K: usize = 3;

pub fn card_label(index: usize) -> Option<&'static str> {
    CARD_CLASSES.get(index).copied()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub index: usize,
    pub label: String,
    pub probability: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub label: String,
    pub index: usize,
    /// 0-100，保留两位小数
    pub confidence: f32,
    pub top_k: Vec<Prediction>,
}

pub struct Classifier {
    top_k: usize,
}

impl Classifier {
    pub fn new() -> Self {
        Self::with_top_k(DEFAULT_TOP_K)
    }

    pub fn with_top_k(top_k: usize) -> Self {
        Self { top_k }
    }

    /// Runs the model on `input` and ranks the first output. Both tensors are
    /// dropped before returning, on success and on error.
    pub fn classify(&self, model: &ModelHandle, input: Tensor) -> Result<ClassificationResult, ClassifyError> {
        if input.shape() != model.input_shape() {
            return Err(ClassifyError::InputShape {
                expected: model.input_shape().to_vec(),
                actual: input.shape().to_vec(),
            });
        }
        if model.output_class_count() != CARD_CLASSES.len() {
            return Err(ClassifyError::OutputShape {
                expected: CARD_CLASSES.len(),
                actual: vec![model.output_class_count()],
            });
        }

        let outputs = model.run(&input)?;
        drop(input);

        let first = outputs.into_iter().next().ok_or(ClassifyError::NoOutput)?;
        let probabilities = Self::extract_probabilities(first, CARD_CLASSES.len())?;
        self.rank(&probabilities)
    }

    fn extract_probabilities(output: Tensor, classes: usize) -> Result<Vec<f32>, ClassifyError> {
        let flat = match output.shape() {
            [n] => *n == classes,
            [1, n] => *n == classes,
            _ => false,
        };
        if !flat {
            return Err(ClassifyError::OutputShape {
                expected: classes,
                actual: output.shape().to_vec(),
            });
        }
        match output {
            Tensor::Float32(values) => Ok(values.iter().copied().collect()),
            other => Err(ClassifyError::OutputType(other.dtype().name())),
        }
    }

    /// Picks the arg-max (lowest index on ties) and the top-K diagnostics
    /// from a 52-entry probability vector.
    pub fn rank(&self, probabilities: &[f32]) -> Result<ClassificationResult, ClassifyError> {
        if probabilities.len() != CARD_CLASSES.len() {
            return Err(ClassifyError::OutputShape {
                expected: CARD_CLASSES.len(),
                actual: vec![probabilities.len()],
            });
        }
        if let Some(i) = probabilities.iter().position(|p| !p.is_finite()) {
            return Err(ClassifyError::NonFinite(i));
        }

        let mut best = 0usize;
        for (i, &p) in probabilities.iter().enumerate() {
            if p > probabilities[best] {
                best = i;
            }
        }

        let mut order: Vec<usize> = (0..probabilities.len()).collect();
        order.sort_by(|&a, &b| probabilities[b].total_cmp(&probabilities[a]).then(a.cmp(&b)));
        let top_k = order
            .into_iter()
            .take(self.top_k)
            .map(|i| Prediction {
                index: i,
                label: CARD_CLASSES[i].to_string(),
                probability: probabilities[i],
            })
            .collect();

        let result = ClassificationResult {
            label: CARD_CLASSES[best].to_string(),
            index: best,
            confidence: to_confidence(probabilities[best]),
            top_k,
        };
        debug!("🃏 {} ({:.2}%)", result.label, result.confidence);
        Ok(result)
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

fn to_confidence(probability: f32) -> f32 {
    ((probability * 10_000.0).round() / 100.0).clamp(0.0, 100.0)
}
