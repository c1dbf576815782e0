//! CPU kernels shared by both model kinds. Layout is NHWC, kernels HWIO.

use ndarray::{Array2, ArrayD, Axis, Ix2, IxDyn};
use rayon::prelude::*;

use crate::core::cards::error::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    Same,
    Valid,
}

impl Padding {
    pub fn parse(s: &str) -> Result<Self, ModelError> {
        match s.to_ascii_lowercase().as_str() {
            "same" => Ok(Padding::Same),
            "valid" => Ok(Padding::Valid),
            other => Err(ModelError::UnsupportedOp(format!("padding {}", other))),
        }
    }

    /// (output size, padding before) along one spatial axis
    fn output(&self, input: usize, window: usize, stride: usize) -> Result<(usize, usize), ModelError> {
        let stride = stride.max(1);
        match self {
            Padding::Same => {
                let out = input.div_ceil(stride);
                let needed = ((out.saturating_sub(1)) * stride + window).saturating_sub(input);
                Ok((out, needed / 2))
            }
            Padding::Valid => {
                if input < window {
                    return Err(ModelError::Shape(format!(
                        "window {} larger than input {}",
                        window, input
                    )));
                }
                Ok(((input - window) / stride + 1, 0))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Linear,
    Relu,
    Relu6,
    Sigmoid,
    Tanh,
    Softmax,
}

impl Activation {
    pub fn parse(s: &str) -> Result<Self, ModelError> {
        match s.to_ascii_lowercase().as_str() {
            "linear" | "identity" | "" => Ok(Activation::Linear),
            "relu" => Ok(Activation::Relu),
            "relu6" => Ok(Activation::Relu6),
            "sigmoid" => Ok(Activation::Sigmoid),
            "tanh" => Ok(Activation::Tanh),
            "softmax" => Ok(Activation::Softmax),
            other => Err(ModelError::UnsupportedOp(format!("activation {}", other))),
        }
    }

    pub fn apply(&self, mut x: ArrayD<f32>) -> ArrayD<f32> {
        match self {
            Activation::Linear => x,
            Activation::Relu => {
                x.mapv_inplace(|v| v.max(0.0));
                x
            }
            Activation::Relu6 => {
                x.mapv_inplace(|v| v.clamp(0.0, 6.0));
                x
            }
            Activation::Sigmoid => {
                x.mapv_inplace(|v| 1.0 / (1.0 + (-v).exp()));
                x
            }
            Activation::Tanh => {
                x.mapv_inplace(f32::tanh);
                x
            }
            Activation::Softmax => softmax(x),
        }
    }
}

fn dims4(shape: &[usize], what: &str) -> Result<[usize; 4], ModelError> {
    match shape {
        [a, b, c, d] => Ok([*a, *b, *c, *d]),
        _ => Err(ModelError::Shape(format!("{} expects rank 4, got {:?}", what, shape))),
    }
}

pub fn conv2d(
    input: &ArrayD<f32>,
    kernel: &ArrayD<f32>,
    strides: (usize, usize),
    padding: Padding,
) -> Result<ArrayD<f32>, ModelError> {
    let [n, h, w, c] = dims4(input.shape(), "conv2d input")?;
    let [kh, kw, kc, oc] = dims4(kernel.shape(), "conv2d kernel")?;
    if kc != c {
        return Err(ModelError::Shape(format!(
            "conv2d kernel expects {} channels, input has {}",
            kc, c
        )));
    }

    let (oh, pad_top) = padding.output(h, kh, strides.0)?;
    let (ow, pad_left) = padding.output(w, kw, strides.1)?;

    let src = input.as_standard_layout();
    let src = src.as_slice().ok_or_else(|| ModelError::Shape("non-contiguous input".into()))?;
    let k = kernel.as_standard_layout();
    let k = k.as_slice().ok_or_else(|| ModelError::Shape("non-contiguous kernel".into()))?;

    let row_len = ow * oc;
    let mut out = vec![0f32; n * oh * row_len];
    if row_len == 0 {
        return ArrayD::from_shape_vec(IxDyn(&[n, oh, ow, oc]), out)
            .map_err(|e| ModelError::Shape(e.to_string()));
    }

    out.par_chunks_mut(row_len).enumerate().for_each(|(row, dst)| {
        let b = row / oh;
        let oy = row % oh;
        for ox in 0..ow {
            let acc = &mut dst[ox * oc..(ox + 1) * oc];
            for ky in 0..kh {
                let iy = (oy * strides.0 + ky) as isize - pad_top as isize;
                if iy < 0 || iy >= h as isize {
                    continue;
                }
                for kx in 0..kw {
                    let ix = (ox * strides.1 + kx) as isize - pad_left as isize;
                    if ix < 0 || ix >= w as isize {
                        continue;
                    }
                    let pixel = ((b * h + iy as usize) * w + ix as usize) * c;
                    for ci in 0..c {
                        let v = src[pixel + ci];
                        if v == 0.0 {
                            continue;
                        }
                        let krow = ((ky * kw + kx) * c + ci) * oc;
                        for (a, &kv) in acc.iter_mut().zip(&k[krow..krow + oc]) {
                            *a += v * kv;
                        }
                    }
                }
            }
        }
    });

    ArrayD::from_shape_vec(IxDyn(&[n, oh, ow, oc]), out).map_err(|e| ModelError::Shape(e.to_string()))
}

pub fn max_pool(
    input: &ArrayD<f32>,
    pool: (usize, usize),
    strides: (usize, usize),
    padding: Padding,
) -> Result<ArrayD<f32>, ModelError> {
    let [n, h, w, c] = dims4(input.shape(), "max_pool input")?;
    let (oh, pad_top) = padding.output(h, pool.0, strides.0)?;
    let (ow, pad_left) = padding.output(w, pool.1, strides.1)?;

    let src = input.as_standard_layout();
    let src = src.as_slice().ok_or_else(|| ModelError::Shape("non-contiguous input".into()))?;

    let mut out = vec![f32::NEG_INFINITY; n * oh * ow * c];
    for b in 0..n {
        for oy in 0..oh {
            for ox in 0..ow {
                let dst = ((b * oh + oy) * ow + ox) * c;
                for py in 0..pool.0 {
                    let iy = (oy * strides.0 + py) as isize - pad_top as isize;
                    if iy < 0 || iy >= h as isize {
                        continue;
                    }
                    for px in 0..pool.1 {
                        let ix = (ox * strides.1 + px) as isize - pad_left as isize;
                        if ix < 0 || ix >= w as isize {
                            continue;
                        }
                        let pixel = ((b * h + iy as usize) * w + ix as usize) * c;
                        for ci in 0..c {
                            out[dst + ci] = out[dst + ci].max(src[pixel + ci]);
                        }
                    }
                }
            }
        }
    }

    ArrayD::from_shape_vec(IxDyn(&[n, oh, ow, c]), out).map_err(|e| ModelError::Shape(e.to_string()))
}

/// Collapses every axis after the batch axis.
pub fn flatten(input: ArrayD<f32>) -> Result<ArrayD<f32>, ModelError> {
    let n = input.shape().first().copied().unwrap_or(1);
    let rest: usize = input.shape().iter().skip(1).product();
    reshape(input, &[n, rest])
}

pub fn reshape(input: ArrayD<f32>, shape: &[usize]) -> Result<ArrayD<f32>, ModelError> {
    let input = input.as_standard_layout().into_owned();
    input
        .into_shape_with_order(IxDyn(shape))
        .map_err(|e| ModelError::Shape(format!("reshape to {:?}: {}", shape, e)))
}

/// Resolves a reshape target that may contain a single -1.
pub fn resolve_shape(target: &[i64], total: usize) -> Result<Vec<usize>, ModelError> {
    let known: usize = target.iter().filter(|&&d| d > 0).map(|&d| d as usize).product();
    let wildcards = target.iter().filter(|&&d| d < 0).count();
    match wildcards {
        0 => Ok(target.iter().map(|&d| d.max(0) as usize).collect()),
        1 if known > 0 && total % known == 0 => Ok(target
            .iter()
            .map(|&d| if d < 0 { total / known } else { d as usize })
            .collect()),
        _ => Err(ModelError::Shape(format!(
            "cannot reshape {} elements to {:?}",
            total, target
        ))),
    }
}

pub fn matmul(input: &ArrayD<f32>, kernel: &ArrayD<f32>) -> Result<ArrayD<f32>, ModelError> {
    let a = input
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| ModelError::Shape(format!("matmul input must be rank 2, got {:?}", input.shape())))?;
    let b = kernel
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| ModelError::Shape(format!("matmul kernel must be rank 2, got {:?}", kernel.shape())))?;
    if a.ncols() != b.nrows() {
        return Err(ModelError::Shape(format!(
            "matmul {:?} x {:?}",
            a.shape(),
            b.shape()
        )));
    }
    let out: Array2<f32> = a.dot(&b);
    Ok(out.into_dyn())
}

pub fn bias_add(mut input: ArrayD<f32>, bias: &ArrayD<f32>) -> Result<ArrayD<f32>, ModelError> {
    let last = input.ndim().checked_sub(1).ok_or_else(|| ModelError::Shape("bias_add on scalar".into()))?;
    if bias.len() != input.shape()[last] {
        return Err(ModelError::Shape(format!(
            "bias of {} for {} channels",
            bias.len(),
            input.shape()[last]
        )));
    }
    let bias = bias.view().into_shape_with_order(bias.len()).map_err(|e| ModelError::Shape(e.to_string()))?;
    for mut lane in input.lanes_mut(Axis(last)) {
        lane += &bias;
    }
    Ok(input)
}

pub fn add(a: ArrayD<f32>, b: &ArrayD<f32>) -> Result<ArrayD<f32>, ModelError> {
    if a.shape() == b.shape() {
        return Ok(a + b);
    }
    bias_add(a, b)
}

pub fn softmax(mut x: ArrayD<f32>) -> ArrayD<f32> {
    let Some(last) = x.ndim().checked_sub(1) else {
        return x;
    };
    for mut lane in x.lanes_mut(Axis(last)) {
        let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        if sum > 0.0 {
            lane /= sum;
        }
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arr(shape: &[usize], data: Vec<f32>) -> ArrayD<f32> {
        ArrayD::from_shape_vec(IxDyn(shape), data).unwrap()
    }

    #[test]
    fn test_conv2d_identity_kernel() {
        let input = arr(&[1, 2, 2, 1], vec![1.0, 2.0, 3.0, 4.0]);
        let kernel = arr(&[1, 1, 1, 1], vec![2.0]);
        let out = conv2d(&input, &kernel, (1, 1), Padding::Valid).unwrap();
        assert_eq!(out.shape(), &[1, 2, 2, 1]);
        assert_eq!(out.as_slice().unwrap(), &[2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_conv2d_same_padding_keeps_size() {
        let input = arr(&[1, 3, 3, 1], vec![1.0; 9]);
        let kernel = arr(&[3, 3, 1, 2], vec![1.0; 18]);
        let out = conv2d(&input, &kernel, (1, 1), Padding::Same).unwrap();
        assert_eq!(out.shape(), &[1, 3, 3, 2]);
        // 中心像素覆盖全部 9 个输入，角落只覆盖 4 个
        assert_eq!(out[[0, 1, 1, 0]], 9.0);
        assert_eq!(out[[0, 0, 0, 1]], 4.0);
    }

    #[test]
    fn test_max_pool() {
        let input = arr(&[1, 2, 2, 1], vec![1.0, 5.0, 3.0, 2.0]);
        let out = max_pool(&input, (2, 2), (2, 2), Padding::Valid).unwrap();
        assert_eq!(out.shape(), &[1, 1, 1, 1]);
        assert_eq!(out[[0, 0, 0, 0]], 5.0);
    }

    #[test]
    fn test_matmul_and_bias() {
        let x = arr(&[1, 2], vec![1.0, 2.0]);
        let k = arr(&[2, 3], vec![1.0, 0.0, 1.0, 0.0, 1.0, 1.0]);
        let b = arr(&[3], vec![0.5, 0.5, 0.5]);
        let out = bias_add(matmul(&x, &k).unwrap(), &b).unwrap();
        assert_eq!(out.as_slice().unwrap(), &[1.5, 2.5, 3.5]);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let out = softmax(arr(&[1, 3], vec![1.0, 2.0, 3.0]));
        let sum: f32 = out.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(out[[0, 2]] > out[[0, 1]]);
    }

    #[test]
    fn test_resolve_shape_wildcard() {
        assert_eq!(resolve_shape(&[-1, 4], 8).unwrap(), vec![2, 4]);
        assert!(resolve_shape(&[-1, 3], 8).is_err());
    }
}
