//! Layered (Sequential) model form.

use ndarray::ArrayD;
use serde_json::Value;

use super::artifact::{ModelDescriptor, WeightStore};
use super::ops::{self, Activation, Padding};
use crate::core::cards::error::ModelError;

#[derive(Debug)]
enum Layer {
    Conv2D {
        kernel: ArrayD<f32>,
        bias: Option<ArrayD<f32>>,
        strides: (usize, usize),
        padding: Padding,
        activation: Activation,
    },
    MaxPool {
        pool: (usize, usize),
        strides: (usize, usize),
        padding: Padding,
    },
    Flatten,
    Dense {
        kernel: ArrayD<f32>,
        bias: Option<ArrayD<f32>>,
        activation: Activation,
    },
    Activation(Activation),
    /// InputLayer / Dropout 推理时直接透传
    Passthrough,
}

#[derive(Debug)]
pub struct LayeredModel {
    declared_input: Vec<Option<i64>>,
    layers: Vec<Layer>,
}

impl LayeredModel {
    pub fn from_descriptor(
        descriptor: &ModelDescriptor,
        weights: &WeightStore,
    ) -> Result<Self, ModelError> {
        if let Some(format) = descriptor.format.as_deref() {
            if format != "layers-model" {
                return Err(ModelError::UnsupportedFormat(format.to_string()));
            }
        }

        let specs = layer_specs(&descriptor.model_topology)?;
        if specs.is_empty() {
            return Err(ModelError::UnsupportedFormat("layered model has no layers".into()));
        }

        let mut declared_input = None;
        let mut layers = Vec::with_capacity(specs.len());
        for spec in specs {
            let class_name = spec
                .get("class_name")
                .and_then(Value::as_str)
                .ok_or_else(|| ModelError::UnsupportedFormat("layer without class_name".into()))?;
            let config = spec.get("config").unwrap_or(&Value::Null);

            if declared_input.is_none() {
                declared_input = config
                    .get("batch_input_shape")
                    .or_else(|| config.get("batch_shape"))
                    .and_then(Value::as_array)
                    .map(|dims| dims.iter().map(Value::as_i64).collect::<Vec<_>>());
            }

            layers.push(build_layer(class_name, config, weights)?);
        }

        let declared_input = declared_input
            .ok_or_else(|| ModelError::Shape("layered model declares no input shape".into()))?;

        Ok(Self {
            declared_input,
            layers,
        })
    }

    pub fn declared_input(&self) -> &[Option<i64>] {
        &self.declared_input
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn run(&self, input: ArrayD<f32>) -> Result<ArrayD<f32>, ModelError> {
        let mut x = input;
        for layer in &self.layers {
            x = match layer {
                Layer::Conv2D {
                    kernel,
                    bias,
                    strides,
                    padding,
                    activation,
                } => {
                    let mut y = ops::conv2d(&x, kernel, *strides, *padding)?;
                    if let Some(b) = bias {
                        y = ops::bias_add(y, b)?;
                    }
                    activation.apply(y)
                }
                Layer::MaxPool {
                    pool,
                    strides,
                    padding,
                } => ops::max_pool(&x, *pool, *strides, *padding)?,
                Layer::Flatten => ops::flatten(x)?,
                Layer::Dense {
                    kernel,
                    bias,
                    activation,
                } => {
                    let flat = if x.ndim() == 2 { x } else { ops::flatten(x)? };
                    let mut y = ops::matmul(&flat, kernel)?;
                    if let Some(b) = bias {
                        y = ops::bias_add(y, b)?;
                    }
                    activation.apply(y)
                }
                Layer::Activation(activation) => activation.apply(x),
                Layer::Passthrough => x,
            };
        }
        Ok(x)
    }
}

/// 兼容三种拓扑写法: {model_config: {...}}, {config: {layers}}, {config: [layers]}
fn layer_specs(topology: &Value) -> Result<&Vec<Value>, ModelError> {
    let model = topology.get("model_config").unwrap_or(topology);
    let config = model
        .get("config")
        .ok_or_else(|| ModelError::UnsupportedFormat("topology has no layer config".into()))?;
    config
        .get("layers")
        .unwrap_or(config)
        .as_array()
        .ok_or_else(|| ModelError::UnsupportedFormat("layer config is not a list".into()))
}

fn build_layer(class_name: &str, config: &Value, weights: &WeightStore) -> Result<Layer, ModelError> {
    let name = config.get("name").and_then(Value::as_str).unwrap_or_default();
    let activation = || -> Result<Activation, ModelError> {
        Activation::parse(config.get("activation").and_then(Value::as_str).unwrap_or("linear"))
    };
    let padding = || -> Result<Padding, ModelError> {
        Padding::parse(config.get("padding").and_then(Value::as_str).unwrap_or("valid"))
    };

    match class_name {
        "Conv2D" => {
            let kernel = float_param(weights, name, "kernel")?;
            Ok(Layer::Conv2D {
                kernel,
                bias: optional_bias(weights, name, config)?,
                strides: pair(config.get("strides"), (1, 1)),
                padding: padding()?,
                activation: activation()?,
            })
        }
        "MaxPooling2D" | "MaxPool2D" => {
            let pool = pair(config.get("pool_size"), (2, 2));
            Ok(Layer::MaxPool {
                pool,
                strides: pair(config.get("strides"), pool),
                padding: padding()?,
            })
        }
        "Flatten" => Ok(Layer::Flatten),
        "Dense" => Ok(Layer::Dense {
            kernel: float_param(weights, name, "kernel")?,
            bias: optional_bias(weights, name, config)?,
            activation: activation()?,
        }),
        "Activation" => Ok(Layer::Activation(activation()?)),
        "Softmax" => Ok(Layer::Activation(Activation::Softmax)),
        "ReLU" => Ok(Layer::Activation(Activation::Relu)),
        "InputLayer" | "Dropout" => Ok(Layer::Passthrough),
        other => Err(ModelError::UnsupportedOp(format!("layer {}", other))),
    }
}

fn float_param(weights: &WeightStore, layer: &str, param: &str) -> Result<ArrayD<f32>, ModelError> {
    weights
        .param(layer, param)
        .map(|t| t.to_f32())
        .ok_or_else(|| ModelError::Weights(format!("missing weight {}/{}", layer, param)))
}

fn optional_bias(
    weights: &WeightStore,
    layer: &str,
    config: &Value,
) -> Result<Option<ArrayD<f32>>, ModelError> {
    let use_bias = config.get("use_bias").and_then(Value::as_bool).unwrap_or(true);
    if use_bias {
        float_param(weights, layer, "bias").map(Some)
    } else {
        Ok(None)
    }
}

fn pair(value: Option<&Value>, default: (usize, usize)) -> (usize, usize) {
    match value {
        Some(Value::Array(items)) if items.len() == 2 => {
            let a = items[0].as_u64().map(|v| v as usize).unwrap_or(default.0);
            let b = items[1].as_u64().map(|v| v as usize).unwrap_or(default.1);
            (a, b)
        }
        Some(Value::Number(n)) => n.as_u64().map(|v| (v as usize, v as usize)).unwrap_or(default),
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cards::model::artifact::ModelCandidate;
    use ndarray::IxDyn;

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn tiny_cnn() -> ModelCandidate {
        let descriptor = br#"{
            "format": "layers-model",
            "modelTopology": {"model_config": {"class_name": "Sequential", "config": {"layers": [
                {"class_name": "Conv2D", "config": {"name": "conv2d", "filters": 1, "kernel_size": [1, 1],
                    "strides": [1, 1], "padding": "valid", "activation": "relu",
                    "batch_input_shape": [null, 2, 2, 1]}},
                {"class_name": "MaxPooling2D", "config": {"name": "pool", "pool_size": [2, 2]}},
                {"class_name": "Flatten", "config": {"name": "flatten"}},
                {"class_name": "Dropout", "config": {"name": "dropout", "rate": 0.5}},
                {"class_name": "Dense", "config": {"name": "dense", "units": 2, "activation": "linear"}}
            ]}}},
            "weightsManifest": [{"paths": ["group1-shard1of1.bin"], "weights": [
                {"name": "conv2d/kernel", "shape": [1, 1, 1, 1], "dtype": "float32"},
                {"name": "conv2d/bias", "shape": [1], "dtype": "float32"},
                {"name": "dense/kernel", "shape": [1, 2], "dtype": "float32"},
                {"name": "dense/bias", "shape": [2], "dtype": "float32"}
            ]}]
        }"#
        .to_vec();
        let weights = f32_bytes(&[2.0, 0.0, 1.0, -1.0, 0.0, 10.0]);
        ModelCandidate::new("tiny", descriptor, vec![weights])
    }

    fn load(candidate: &ModelCandidate) -> Result<LayeredModel, ModelError> {
        let descriptor = candidate.descriptor()?;
        let weights = candidate.decode_weights(&descriptor)?;
        LayeredModel::from_descriptor(&descriptor, &weights)
    }

    #[test]
    fn test_layered_model_forward() {
        let model = load(&tiny_cnn()).unwrap();
        assert_eq!(model.layer_count(), 5);
        assert_eq!(model.declared_input(), &[None, Some(2), Some(2), Some(1)]);

        let input = ArrayD::from_shape_vec(IxDyn(&[1, 2, 2, 1]), vec![0.1, 0.4, 0.2, 0.3]).unwrap();
        let out = model.run(input).unwrap();
        assert_eq!(out.shape(), &[1, 2]);
        // relu(2x) 的最大值 0.8，再经过 dense: [0.8, -0.8 + 10]
        assert!((out[[0, 0]] - 0.8).abs() < 1e-6);
        assert!((out[[0, 1]] - 9.2).abs() < 1e-6);
    }

    #[test]
    fn test_layered_model_rejects_graph_format() {
        let mut candidate = tiny_cnn();
        candidate.descriptor = br#"{"format": "graph-model", "modelTopology": {"node": []}}"#.to_vec();
        assert!(matches!(load(&candidate), Err(ModelError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_layered_model_missing_weight() {
        let mut candidate = tiny_cnn();
        candidate.shards = vec![f32_bytes(&[2.0, 0.0])];
        assert!(load(&candidate).is_err());
    }

    #[test]
    fn test_pair_parsing() {
        assert_eq!(pair(Some(&serde_json::json!([3, 2])), (1, 1)), (3, 2));
        assert_eq!(pair(Some(&serde_json::json!(4)), (1, 1)), (4, 4));
        assert_eq!(pair(None, (2, 2)), (2, 2));
    }
}
