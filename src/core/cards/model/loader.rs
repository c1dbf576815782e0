use log::{debug, error, info};
use serde::{Deserialize, Serialize};

use super::artifact::ModelCandidate;
use super::{GraphModel, InferenceModel, LayeredModel, ModelHandle};
use crate::core::cards::error::{ModelError, ModelLoadError};

/// 加载策略，按顺序尝试
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoaderKind {
    Layered,
    Graph,
}

impl LoaderKind {
    pub fn all() -> Vec<LoaderKind> {
        vec![LoaderKind::Layered, LoaderKind::Graph]
    }

    pub fn load(&self, candidate: &ModelCandidate) -> Result<ModelHandle, ModelError> {
        let descriptor = candidate.descriptor()?;
        let weights = candidate.decode_weights(&descriptor)?;
        let model = match self {
            LoaderKind::Layered => InferenceModel::Layered(LayeredModel::from_descriptor(&descriptor, &weights)?),
            LoaderKind::Graph => InferenceModel::Graph(GraphModel::from_descriptor(&descriptor, &weights)?),
        };
        ModelHandle::introspect(model, candidate.name.clone())
    }
}

/// Tries every (candidate, strategy) pair in order; the first that loads and
/// passes introspection wins.
pub fn load_model(
    candidates: &[ModelCandidate],
    strategies: &[LoaderKind],
) -> Result<ModelHandle, ModelLoadError> {
    info!(
        "🔧 Loading model from {} candidate(s) with strategies {:?}",
        candidates.len(),
        strategies
    );

    let mut last_error = if candidates.is_empty() {
        "no model candidates".to_string()
    } else {
        "no loader strategies".to_string()
    };

    for candidate in candidates {
        for strategy in strategies {
            match strategy.load(candidate) {
                Ok(handle) => {
                    info!(
                        "✅ Model loaded: {} via {:?} ({} shard(s), input {:?}, {} classes)",
                        candidate.name,
                        strategy,
                        candidate.shard_count(),
                        handle.input_shape(),
                        handle.output_class_count()
                    );
                    return Ok(handle);
                }
                Err(e) => {
                    debug!("{} via {:?} failed: {}", candidate.name, strategy, e);
                    last_error = format!("{} via {:?}: {}", candidate.name, strategy, e);
                }
            }
        }
    }

    error!("❌ No model candidate could be loaded: {}", last_error);
    Err(ModelLoadError {
        exhausted_candidates: candidates.len(),
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cards::model::ModelKind;

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Flatten -> Dense(3), 输入 [null, 2, 2, 1]
    fn layered_candidate(name: &str) -> ModelCandidate {
        let descriptor = br#"{
            "format": "layers-model",
            "modelTopology": {"config": {"layers": [
                {"class_name": "Flatten", "config": {"name": "flatten", "batch_input_shape": [null, 2, 2, 1]}},
                {"class_name": "Dense", "config": {"name": "dense", "units": 3, "activation": "softmax"}}
            ]}},
            "weightsManifest": [{"paths": ["group1-shard1of1.bin"], "weights": [
                {"name": "dense/kernel", "shape": [4, 3]},
                {"name": "dense/bias", "shape": [3]}
            ]}]
        }"#
        .to_vec();
        ModelCandidate::new(name, descriptor, vec![f32_bytes(&[0.0; 15])])
    }

    /// Placeholder -> Reshape -> MatMul, 输入 [-1, 2, 2, 1]
    fn graph_candidate(name: &str) -> ModelCandidate {
        let descriptor = br#"{
            "format": "graph-model",
            "modelTopology": {"node": [
                {"name": "input", "op": "Placeholder", "attr": {"shape": {"shape": {"dim": [
                    {"size": "-1"}, {"size": "2"}, {"size": "2"}, {"size": "1"}]}}}},
                {"name": "shape", "op": "Const"},
                {"name": "kernel", "op": "Const"},
                {"name": "flat", "op": "Reshape", "input": ["input", "shape"]},
                {"name": "out", "op": "MatMul", "input": ["flat", "kernel"]}
            ]},
            "weightsManifest": [{"paths": ["group1-shard1of2.bin", "group1-shard2of2.bin"], "weights": [
                {"name": "shape", "shape": [2], "dtype": "int32"},
                {"name": "kernel", "shape": [4, 5], "dtype": "float32"}
            ]}]
        }"#
        .to_vec();
        let mut bytes: Vec<u8> = [1i32, 4].iter().flat_map(|v| v.to_le_bytes()).collect();
        bytes.extend(f32_bytes(&[0.0; 20]));
        let (a, b) = bytes.split_at(8);
        ModelCandidate::new(name, descriptor, vec![a.to_vec(), b.to_vec()])
    }

    #[test]
    fn test_first_pair_wins() {
        let handle = load_model(&[layered_candidate("a")], &LoaderKind::all()).unwrap();
        assert_eq!(handle.kind(), ModelKind::Layered);
        assert_eq!(handle.input_shape(), &[1, 2, 2, 1]);
        assert_eq!(handle.output_class_count(), 3);
        assert_eq!(handle.candidate(), "a");
    }

    #[test]
    fn test_fallback_across_candidates_and_strategies() {
        let mut broken = layered_candidate("broken");
        broken.descriptor = b"not json".to_vec();

        let handle = load_model(
            &[broken, graph_candidate("graph")],
            &[LoaderKind::Layered, LoaderKind::Graph],
        )
        .unwrap();

        assert_eq!(handle.candidate(), "graph");
        assert_eq!(handle.kind(), ModelKind::Graph);
        assert_eq!(handle.input_shape(), &[1, 2, 2, 1]);
        assert_eq!(handle.output_class_count(), 5);
    }

    #[test]
    fn test_exhausted_reports_last_error() {
        let mut truncated = graph_candidate("truncated");
        truncated.shards.pop();

        let err = load_model(&[layered_candidate("l"), truncated], &[LoaderKind::Graph]).unwrap_err();
        assert_eq!(err.exhausted_candidates, 2);
        assert!(err.last_error.contains("truncated"));
    }

    #[test]
    fn test_oversized_weight_shape_falls_back() {
        let mut oversized = graph_candidate("oversized");
        oversized.descriptor = br#"{
            "format": "graph-model",
            "modelTopology": {"node": [{"name": "input", "op": "Placeholder"}]},
            "weightsManifest": [{"paths": ["group1-shard1of1.bin"], "weights": [
                {"name": "huge", "shape": [4611686018427387904, 8], "dtype": "float32"}
            ]}]
        }"#
        .to_vec();

        let handle = load_model(&[oversized, graph_candidate("graph")], &LoaderKind::all()).unwrap();
        assert_eq!(handle.candidate(), "graph");
    }

    #[test]
    fn test_empty_inputs() {
        let err = load_model(&[], &LoaderKind::all()).unwrap_err();
        assert_eq!(err.exhausted_candidates, 0);
        assert!(load_model(&[layered_candidate("a")], &[]).is_err());
    }

    #[test]
    fn test_loader_kind_serde() {
        let kinds: Vec<LoaderKind> = serde_json::from_str(r#"["graph", "layered"]"#).unwrap();
        assert_eq!(kinds, vec![LoaderKind::Graph, LoaderKind::Layered]);
    }
}
