pub mod artifact;
pub mod graph;
pub mod layers;
pub mod loader;
pub mod ops;

pub use artifact::{discover_candidates, ModelCandidate, ModelDescriptor, WeightStore};
pub use graph::GraphModel;
pub use layers::LayeredModel;
pub use loader::{load_model, LoaderKind};

use log::debug;

use super::error::ModelError;
use super::tensor::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Layered,
    Graph,
}

impl ModelKind {
    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::Layered => "layers-model",
            ModelKind::Graph => "graph-model",
        }
    }
}

/// 两种模型形态，加载时确定，调用方不再区分
#[derive(Debug)]
pub enum InferenceModel {
    Layered(LayeredModel),
    Graph(GraphModel),
}

impl InferenceModel {
    pub fn kind(&self) -> ModelKind {
        match self {
            InferenceModel::Layered(_) => ModelKind::Layered,
            InferenceModel::Graph(_) => ModelKind::Graph,
        }
    }

    pub fn declared_input(&self) -> &[Option<i64>] {
        match self {
            InferenceModel::Layered(m) => m.declared_input(),
            InferenceModel::Graph(m) => m.declared_input(),
        }
    }

    pub fn run(&self, input: &Tensor) -> Result<Vec<Tensor>, ModelError> {
        match self {
            InferenceModel::Layered(m) => Ok(vec![Tensor::Float32(m.run(input.to_f32())?)]),
            InferenceModel::Graph(m) => m.run(input),
        }
    }
}

/// 探测输入上限，约 256MB 的 f32
const MAX_INPUT_ELEMENTS: usize = 1 << 26;

/// Non-positive or absent dimensions default to 1.
pub fn effective_shape(declared: &[Option<i64>]) -> Vec<usize> {
    declared
        .iter()
        .map(|d| match d {
            Some(v) if *v > 0 => *v as usize,
            _ => 1,
        })
        .collect()
}

/// 加载成功的模型，加载后不可变
#[derive(Debug)]
pub struct ModelHandle {
    model: InferenceModel,
    input_shape: Vec<usize>,
    output_class_count: usize,
    candidate: String,
}

impl ModelHandle {
    /// Derives the effective input shape and probes the model once with an
    /// all-zero tensor to measure the output class count.
    pub fn introspect(model: InferenceModel, candidate: impl Into<String>) -> Result<Self, ModelError> {
        let input_shape = effective_shape(model.declared_input());
        if input_shape.len() != 4 {
            return Err(ModelError::Shape(format!(
                "expected NHWC image input, model declares {:?}",
                model.declared_input()
            )));
        }
        let elements = input_shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d));
        if !elements.is_some_and(|n| n <= MAX_INPUT_ELEMENTS) {
            return Err(ModelError::Shape(format!("input shape {:?} is too large", input_shape)));
        }

        let probe = model.run(&Tensor::zeros(&input_shape))?;
        let first = probe
            .first()
            .ok_or_else(|| ModelError::Shape("probe produced no outputs".into()))?;
        let output_class_count = first.shape().last().copied().unwrap_or(0);
        if output_class_count == 0 {
            return Err(ModelError::Shape(format!("probe output shape {:?}", first.shape())));
        }
        debug!(
            "🔍 {} input {:?} -> {} classes",
            model.kind().name(),
            input_shape,
            output_class_count
        );

        Ok(Self {
            model,
            input_shape,
            output_class_count,
            candidate: candidate.into(),
        })
    }

    pub fn kind(&self) -> ModelKind {
        self.model.kind()
    }

    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    /// (height, width, channels) of the NHWC input
    pub fn input_dims(&self) -> (usize, usize, usize) {
        (self.input_shape[1], self.input_shape[2], self.input_shape[3])
    }

    pub fn output_class_count(&self) -> usize {
        self.output_class_count
    }

    pub fn candidate(&self) -> &str {
        &self.candidate
    }

    pub fn run(&self, input: &Tensor) -> Result<Vec<Tensor>, ModelError> {
        self.model.run(input)
    }
}
