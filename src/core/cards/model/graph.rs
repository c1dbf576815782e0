//! Graph model form: a node list wired by name, executed in dependency order.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ndarray::ArrayD;
use serde_json::Value;

use super::artifact::{ModelDescriptor, WeightStore};
use super::ops::{self, Activation, Padding};
use crate::core::cards::error::ModelError;
use crate::core::cards::tensor::Tensor;

#[derive(Debug)]
enum GraphOp {
    Placeholder,
    Const(Tensor),
    Identity,
    Conv2D {
        strides: (usize, usize),
        padding: Padding,
        fused: Vec<FusedOp>,
    },
    MaxPool {
        ksize: (usize, usize),
        strides: (usize, usize),
        padding: Padding,
    },
    MatMul {
        transpose_a: bool,
        transpose_b: bool,
        fused: Vec<FusedOp>,
    },
    BiasAdd,
    Add,
    Activation(Activation),
    Reshape,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FusedOp {
    BiasAdd,
    Activation(Activation),
}

#[derive(Debug)]
struct GraphNode {
    name: String,
    op: GraphOp,
    inputs: Vec<usize>,
}

#[derive(Debug)]
pub struct GraphModel {
    /// 拓扑序
    nodes: Vec<GraphNode>,
    input: usize,
    outputs: Vec<usize>,
    declared_input: Vec<Option<i64>>,
}

impl GraphModel {
    pub fn from_descriptor(
        descriptor: &ModelDescriptor,
        weights: &WeightStore,
    ) -> Result<Self, ModelError> {
        if let Some(format) = descriptor.format.as_deref() {
            if format != "graph-model" {
                return Err(ModelError::UnsupportedFormat(format.to_string()));
            }
        }

        let raw_nodes = descriptor
            .model_topology
            .get("node")
            .and_then(Value::as_array)
            .ok_or_else(|| ModelError::UnsupportedFormat("graph topology has no node list".into()))?;
        if raw_nodes.is_empty() {
            return Err(ModelError::UnsupportedFormat("graph topology is empty".into()));
        }

        let mut index = HashMap::with_capacity(raw_nodes.len());
        for (i, node) in raw_nodes.iter().enumerate() {
            let name = node
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| ModelError::UnsupportedFormat("graph node without name".into()))?;
            index.insert(name.to_string(), i);
        }

        let mut parsed = Vec::with_capacity(raw_nodes.len());
        for node in raw_nodes {
            parsed.push(parse_node(node, &index, weights)?);
        }

        let order = topological_order(&parsed)?;
        let mut remap = vec![0usize; parsed.len()];
        for (new, &old) in order.iter().enumerate() {
            remap[old] = new;
        }
        let mut slots: Vec<Option<GraphNode>> = parsed.into_iter().map(Some).collect();
        let nodes: Vec<GraphNode> = order
            .iter()
            .filter_map(|&old| slots[old].take())
            .map(|mut node| {
                node.inputs.iter_mut().for_each(|i| *i = remap[*i]);
                node
            })
            .collect();
        let lookup = |name: &str| index.get(strip_ref(name)).map(|&old| remap[old]);

        let signature = descriptor.signature.as_ref();
        let signature_input = signature
            .and_then(|s| s.get("inputs"))
            .and_then(Value::as_object)
            .and_then(|m| m.values().next());

        let input = signature_input
            .and_then(|i| i.get("name"))
            .and_then(Value::as_str)
            .and_then(lookup)
            .or_else(|| nodes.iter().position(|n| matches!(n.op, GraphOp::Placeholder)))
            .ok_or_else(|| ModelError::UnsupportedFormat("graph has no input placeholder".into()))?;

        let declared_input = signature_input
            .and_then(|i| i.get("tensorShape"))
            .and_then(dims_of)
            .or_else(|| {
                raw_nodes
                    .iter()
                    .find(|n| n.get("name").and_then(Value::as_str) == Some(nodes[input].name.as_str()))
                    .and_then(|n| n.get("attr"))
                    .and_then(|a| a.get("shape"))
                    .and_then(|s| s.get("shape"))
                    .and_then(dims_of)
            })
            .ok_or_else(|| ModelError::Shape("graph input declares no shape".into()))?;

        let mut outputs: Vec<usize> = signature
            .and_then(|s| s.get("outputs"))
            .and_then(Value::as_object)
            .map(|m| {
                m.values()
                    .filter_map(|o| o.get("name").and_then(Value::as_str))
                    .filter_map(lookup)
                    .collect()
            })
            .unwrap_or_default();
        if outputs.is_empty() {
            let last = nodes
                .iter()
                .rposition(|n| !matches!(n.op, GraphOp::Const(_) | GraphOp::Placeholder))
                .ok_or_else(|| ModelError::UnsupportedFormat("graph has no compute nodes".into()))?;
            outputs.push(last);
        }

        Ok(Self {
            nodes,
            input,
            outputs,
            declared_input,
        })
    }

    pub fn declared_input(&self) -> &[Option<i64>] {
        &self.declared_input
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn run(&self, input: &Tensor) -> Result<Vec<Tensor>, ModelError> {
        let mut values: Vec<Option<Tensor>> = Vec::with_capacity(self.nodes.len());
        values.resize_with(self.nodes.len(), || None);

        for (i, node) in self.nodes.iter().enumerate() {
            let computed = if i == self.input {
                Some(input.clone())
            } else {
                match &node.op {
                    GraphOp::Placeholder => {
                        return Err(ModelError::Shape(format!("unbound placeholder {}", node.name)))
                    }
                    GraphOp::Const(_) => None,
                    op => Some(self.eval(node, op, &values)?),
                }
            };
            values[i] = computed;
        }

        self.outputs
            .iter()
            .map(|&i| self.value(i, &values).cloned())
            .collect()
    }

    fn value<'a>(&'a self, index: usize, values: &'a [Option<Tensor>]) -> Result<&'a Tensor, ModelError> {
        if let GraphOp::Const(t) = &self.nodes[index].op {
            return Ok(t);
        }
        values[index]
            .as_ref()
            .ok_or_else(|| ModelError::Shape(format!("node {} has no value", self.nodes[index].name)))
    }

    fn arg(&self, node: &GraphNode, n: usize, values: &[Option<Tensor>]) -> Result<ArrayD<f32>, ModelError> {
        let index = *node
            .inputs
            .get(n)
            .ok_or_else(|| ModelError::Shape(format!("{} missing input {}", node.name, n)))?;
        Ok(self.value(index, values)?.to_f32())
    }

    fn eval(&self, node: &GraphNode, op: &GraphOp, values: &[Option<Tensor>]) -> Result<Tensor, ModelError> {
        let out = match op {
            GraphOp::Identity => return self.value(node.inputs[0], values).cloned(),
            GraphOp::Conv2D {
                strides,
                padding,
                fused,
            } => {
                let y = ops::conv2d(&self.arg(node, 0, values)?, &self.arg(node, 1, values)?, *strides, *padding)?;
                self.apply_fused(node, y, fused, values)?
            }
            GraphOp::MaxPool {
                ksize,
                strides,
                padding,
            } => ops::max_pool(&self.arg(node, 0, values)?, *ksize, *strides, *padding)?,
            GraphOp::MatMul {
                transpose_a,
                transpose_b,
                fused,
            } => {
                let mut a = self.arg(node, 0, values)?;
                let mut b = self.arg(node, 1, values)?;
                if *transpose_a {
                    a = a.reversed_axes();
                }
                if *transpose_b {
                    b = b.reversed_axes();
                }
                let y = ops::matmul(&a, &b)?;
                self.apply_fused(node, y, fused, values)?
            }
            GraphOp::BiasAdd => ops::bias_add(self.arg(node, 0, values)?, &self.arg(node, 1, values)?)?,
            GraphOp::Add => ops::add(self.arg(node, 0, values)?, &self.arg(node, 1, values)?)?,
            GraphOp::Activation(a) => a.apply(self.arg(node, 0, values)?),
            GraphOp::Reshape => {
                let x = self.arg(node, 0, values)?;
                let target: Vec<i64> = self
                    .arg(node, 1, values)?
                    .iter()
                    .map(|&v| v as i64)
                    .collect();
                let shape = ops::resolve_shape(&target, x.len())?;
                ops::reshape(x, &shape)?
            }
            GraphOp::Placeholder | GraphOp::Const(_) => {
                return Err(ModelError::Shape(format!("{} is not computable", node.name)))
            }
        };
        Ok(Tensor::Float32(out))
    }

    fn apply_fused(
        &self,
        node: &GraphNode,
        mut y: ArrayD<f32>,
        fused: &[FusedOp],
        values: &[Option<Tensor>],
    ) -> Result<ArrayD<f32>, ModelError> {
        let mut extra = 2;
        for op in fused {
            y = match op {
                FusedOp::BiasAdd => {
                    let bias = self.arg(node, extra, values)?;
                    extra += 1;
                    ops::bias_add(y, &bias)?
                }
                FusedOp::Activation(a) => a.apply(y),
            };
        }
        Ok(y)
    }
}

fn strip_ref(name: &str) -> &str {
    let name = name.trim_start_matches('^');
    match name.rsplit_once(':') {
        Some((base, port)) if port.chars().all(|c| c.is_ascii_digit()) => base,
        _ => name,
    }
}

fn parse_node(
    node: &Value,
    index: &HashMap<String, usize>,
    weights: &WeightStore,
) -> Result<GraphNode, ModelError> {
    let name = node.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
    let op_name = node.get("op").and_then(Value::as_str).unwrap_or_default();

    let mut inputs = Vec::new();
    for input in node.get("input").and_then(Value::as_array).into_iter().flatten() {
        let Some(input) = input.as_str() else { continue };
        // 控制依赖不参与数据流
        if input.starts_with('^') {
            continue;
        }
        let i = index
            .get(strip_ref(input))
            .ok_or_else(|| ModelError::UnsupportedFormat(format!("{} references unknown {}", name, input)))?;
        inputs.push(*i);
    }

    let padding = || -> Result<Padding, ModelError> {
        Padding::parse(&attr_str(node, "padding").unwrap_or_else(|| "VALID".to_string()))
    };
    let spatial = |key: &str, default: (usize, usize)| -> (usize, usize) {
        match attr_ints(node, key).as_deref() {
            Some([_, h, w, _]) => (*h as usize, *w as usize),
            _ => default,
        }
    };

    let op = match op_name {
        "Placeholder" => GraphOp::Placeholder,
        "Const" => {
            let tensor = weights
                .get(&name)
                .cloned()
                .ok_or_else(|| ModelError::Weights(format!("missing const {}", name)))?;
            GraphOp::Const(tensor)
        }
        "Identity" | "StopGradient" | "NoOp" => GraphOp::Identity,
        "Conv2D" | "_FusedConv2D" => GraphOp::Conv2D {
            strides: spatial("strides", (1, 1)),
            padding: padding()?,
            fused: fused_ops(node)?,
        },
        "MaxPool" => GraphOp::MaxPool {
            ksize: spatial("ksize", (2, 2)),
            strides: spatial("strides", (2, 2)),
            padding: padding()?,
        },
        "MatMul" | "_FusedMatMul" => GraphOp::MatMul {
            transpose_a: attr_bool(node, "transpose_a"),
            transpose_b: attr_bool(node, "transpose_b"),
            fused: fused_ops(node)?,
        },
        "BiasAdd" => GraphOp::BiasAdd,
        "Add" | "AddV2" => GraphOp::Add,
        "Relu" | "Relu6" | "Sigmoid" | "Tanh" | "Softmax" => GraphOp::Activation(Activation::parse(op_name)?),
        "Reshape" => GraphOp::Reshape,
        other => return Err(ModelError::UnsupportedOp(format!("graph op {}", other))),
    };

    let required = match &op {
        GraphOp::Placeholder | GraphOp::Const(_) => 0,
        GraphOp::Identity | GraphOp::MaxPool { .. } | GraphOp::Activation(_) => 1,
        GraphOp::Conv2D { fused, .. } | GraphOp::MatMul { fused, .. } => {
            2 + fused.iter().filter(|f| **f == FusedOp::BiasAdd).count()
        }
        GraphOp::BiasAdd | GraphOp::Add | GraphOp::Reshape => 2,
    };
    if inputs.len() < required {
        return Err(ModelError::UnsupportedFormat(format!(
            "{} ({}) needs {} inputs, has {}",
            name,
            op_name,
            required,
            inputs.len()
        )));
    }

    Ok(GraphNode { name, op, inputs })
}

fn fused_ops(node: &Value) -> Result<Vec<FusedOp>, ModelError> {
    attr_strs(node, "fused_ops")
        .unwrap_or_default()
        .iter()
        .map(|s| match s.as_str() {
            "BiasAdd" => Ok(FusedOp::BiasAdd),
            other => Activation::parse(other).map(FusedOp::Activation),
        })
        .collect()
}

fn topological_order(nodes: &[GraphNode]) -> Result<Vec<usize>, ModelError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        Visiting,
        Done,
    }

    fn visit(i: usize, nodes: &[GraphNode], marks: &mut [Mark], order: &mut Vec<usize>) -> Result<(), ModelError> {
        match marks[i] {
            Mark::Done => return Ok(()),
            Mark::Visiting => {
                return Err(ModelError::UnsupportedFormat(format!("cycle at {}", nodes[i].name)))
            }
            Mark::Unvisited => {}
        }
        marks[i] = Mark::Visiting;
        for &dep in &nodes[i].inputs {
            visit(dep, nodes, marks, order)?;
        }
        marks[i] = Mark::Done;
        order.push(i);
        Ok(())
    }

    let mut marks = vec![Mark::Unvisited; nodes.len()];
    let mut order = Vec::with_capacity(nodes.len());
    for i in 0..nodes.len() {
        visit(i, nodes, &mut marks, &mut order)?;
    }
    Ok(order)
}

fn attr<'a>(node: &'a Value, key: &str) -> Option<&'a Value> {
    node.get("attr").and_then(|a| a.get(key))
}

fn attr_bool(node: &Value, key: &str) -> bool {
    attr(node, key).and_then(|v| v.get("b")).and_then(Value::as_bool).unwrap_or(false)
}

fn attr_ints(node: &Value, key: &str) -> Option<Vec<i64>> {
    attr(node, key)?
        .get("list")?
        .get("i")?
        .as_array()?
        .iter()
        .map(json_int)
        .collect()
}

fn attr_str(node: &Value, key: &str) -> Option<String> {
    attr(node, key)?.get("s")?.as_str().map(decode_attr_string)
}

fn attr_strs(node: &Value, key: &str) -> Option<Vec<String>> {
    Some(
        attr(node, key)?
            .get("list")?
            .get("s")?
            .as_array()?
            .iter()
            .filter_map(Value::as_str)
            .map(decode_attr_string)
            .collect(),
    )
}

/// 转换器把字符串属性编码为 base64，手写的描述文件可能直接写明文
fn decode_attr_string(raw: &str) -> String {
    STANDARD
        .decode(raw)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .filter(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or_else(|| raw.to_string())
}

fn json_int(v: &Value) -> Option<i64> {
    v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

/// `{"dim": [{"size": "-1"}, {"size": "70"}, ...]}`
fn dims_of(shape: &Value) -> Option<Vec<Option<i64>>> {
    let dims = shape.get("dim")?.as_array()?;
    Some(dims.iter().map(|d| d.get("size").and_then(json_int)).collect())
}
