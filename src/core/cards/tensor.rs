use ndarray::{ArrayD, IxDyn};

use super::error::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    Float32,
    Int32,
}

impl DType {
    pub fn name(&self) -> &'static str {
        match self {
            DType::Float32 => "float32",
            DType::Int32 => "int32",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "float32" | "DT_FLOAT" => Some(DType::Float32),
            "int32" | "DT_INT32" => Some(DType::Int32),
            _ => None,
        }
    }
}

/// 单次推理周期内的数值张量，不跨周期保留
#[derive(Debug, Clone, PartialEq)]
pub enum Tensor {
    Float32(ArrayD<f32>),
    Int32(ArrayD<i32>),
}

impl Tensor {
    pub fn from_f32(shape: &[usize], data: Vec<f32>) -> Result<Self, ModelError> {
        ArrayD::from_shape_vec(IxDyn(shape), data)
            .map(Tensor::Float32)
            .map_err(|e| ModelError::Shape(format!("{:?}: {}", shape, e)))
    }

    pub fn from_i32(shape: &[usize], data: Vec<i32>) -> Result<Self, ModelError> {
        ArrayD::from_shape_vec(IxDyn(shape), data)
            .map(Tensor::Int32)
            .map_err(|e| ModelError::Shape(format!("{:?}: {}", shape, e)))
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Tensor::Float32(ArrayD::zeros(IxDyn(shape)))
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Tensor::Float32(a) => a.shape(),
            Tensor::Int32(a) => a.shape(),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Tensor::Float32(_) => DType::Float32,
            Tensor::Int32(_) => DType::Int32,
        }
    }

    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_f32(&self) -> Option<&ArrayD<f32>> {
        match self {
            Tensor::Float32(a) => Some(a),
            Tensor::Int32(_) => None,
        }
    }

    /// Float view of the tensor; int32 values are widened.
    pub fn to_f32(&self) -> ArrayD<f32> {
        match self {
            Tensor::Float32(a) => a.clone(),
            Tensor::Int32(a) => a.mapv(|v| v as f32),
        }
    }

    pub fn into_f32(self) -> ArrayD<f32> {
        match self {
            Tensor::Float32(a) => a,
            Tensor::Int32(a) => a.mapv(|v| v as f32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_shape_and_dtype() {
        let t = Tensor::from_f32(&[1, 2, 3], vec![0.0; 6]).unwrap();
        assert_eq!(t.shape(), &[1, 2, 3]);
        assert_eq!(t.dtype(), DType::Float32);
        assert_eq!(t.len(), 6);

        let i = Tensor::from_i32(&[2], vec![4, 5]).unwrap();
        assert_eq!(i.dtype(), DType::Int32);
        assert!(i.as_f32().is_none());
        assert_eq!(i.to_f32().as_slice().unwrap(), &[4.0, 5.0]);
    }

    #[test]
    fn test_tensor_rejects_bad_shape() {
        assert!(Tensor::from_f32(&[2, 2], vec![0.0; 3]).is_err());
    }

    #[test]
    fn test_dtype_parse() {
        assert_eq!(DType::parse("float32"), Some(DType::Float32));
        assert_eq!(DType::parse("DT_INT32"), Some(DType::Int32));
        assert_eq!(DType::parse("uint8"), None);
    }
}
