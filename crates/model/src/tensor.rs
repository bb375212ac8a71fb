//! In-memory tensor container used between loading and export

use std::collections::BTreeMap;
use std::fmt;

use half::{bf16, f16};

use crate::error::{ModelError, Result};

/// Checkpoint contents keyed by tensor name
pub type TensorMap = BTreeMap<String, Tensor>;

/// Tensor element type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F64,
    F32,
    F16,
    BF16,
    I64,
    I32,
    I16,
    I8,
    U32,
    U8,
    Bool,
}

impl DType {
    pub fn size_bytes(&self) -> usize {
        match self {
            DType::F64 | DType::I64 => 8,
            DType::F32 | DType::I32 | DType::U32 => 4,
            DType::F16 | DType::BF16 | DType::I16 => 2,
            DType::I8 | DType::U8 | DType::Bool => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DType::F64 => "f64",
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::I64 => "i64",
            DType::I32 => "i32",
            DType::I16 => "i16",
            DType::I8 => "i8",
            DType::U32 => "u32",
            DType::U8 => "u8",
            DType::Bool => "bool",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<DType> for safetensors::Dtype {
    fn from(dtype: DType) -> Self {
        match dtype {
            DType::F64 => safetensors::Dtype::F64,
            DType::F32 => safetensors::Dtype::F32,
            DType::F16 => safetensors::Dtype::F16,
            DType::BF16 => safetensors::Dtype::BF16,
            DType::I64 => safetensors::Dtype::I64,
            DType::I32 => safetensors::Dtype::I32,
            DType::I16 => safetensors::Dtype::I16,
            DType::I8 => safetensors::Dtype::I8,
            DType::U32 => safetensors::Dtype::U32,
            DType::U8 => safetensors::Dtype::U8,
            DType::Bool => safetensors::Dtype::BOOL,
        }
    }
}

impl TryFrom<safetensors::Dtype> for DType {
    type Error = ModelError;

    fn try_from(dtype: safetensors::Dtype) -> Result<Self> {
        match dtype {
            safetensors::Dtype::F64 => Ok(DType::F64),
            safetensors::Dtype::F32 => Ok(DType::F32),
            safetensors::Dtype::F16 => Ok(DType::F16),
            safetensors::Dtype::BF16 => Ok(DType::BF16),
            safetensors::Dtype::I64 => Ok(DType::I64),
            safetensors::Dtype::I32 => Ok(DType::I32),
            safetensors::Dtype::I16 => Ok(DType::I16),
            safetensors::Dtype::I8 => Ok(DType::I8),
            safetensors::Dtype::U32 => Ok(DType::U32),
            safetensors::Dtype::U8 => Ok(DType::U8),
            safetensors::Dtype::BOOL => Ok(DType::Bool),
            dt => Err(ModelError::UnsupportedDtype(format!("{:?}", dt))),
        }
    }
}

/// Tensor contents: shape, element type and little-endian row-major bytes
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    dtype: DType,
    data: Vec<u8>,
}

impl Tensor {
    /// Create a tensor from raw bytes, checking the byte length against the shape
    pub fn new(shape: Vec<usize>, dtype: DType, data: Vec<u8>) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * dtype.size_bytes();
        if data.len() != expected {
            return Err(ModelError::InvalidFormat(format!(
                "{} tensor of shape {:?} needs {} bytes, got {}",
                dtype,
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, dtype, data })
    }

    /// Create an f32 tensor
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(shape, DType::F32, data)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Get the number of elements
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Decode every element to f32
    pub fn to_f32_vec(&self) -> Vec<f32> {
        let data = &self.data;
        match self.dtype {
            DType::F32 => data
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            DType::F16 => data
                .chunks_exact(2)
                .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect(),
            DType::BF16 => data
                .chunks_exact(2)
                .map(|b| bf16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect(),
            DType::F64 => data
                .chunks_exact(8)
                .map(|b| {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(b);
                    f64::from_le_bytes(bytes) as f32
                })
                .collect(),
            DType::I64 => data
                .chunks_exact(8)
                .map(|b| {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(b);
                    i64::from_le_bytes(bytes) as f32
                })
                .collect(),
            DType::I32 => data
                .chunks_exact(4)
                .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32)
                .collect(),
            DType::I16 => data
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32)
                .collect(),
            DType::I8 => data.iter().map(|&b| b as i8 as f32).collect(),
            DType::U32 => data
                .chunks_exact(4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32)
                .collect(),
            DType::U8 => data.iter().map(|&b| b as f32).collect(),
            DType::Bool => data.iter().map(|&b| if b != 0 { 1.0 } else { 0.0 }).collect(),
        }
    }

    /// Cast to a floating point element type
    pub fn to_dtype(&self, target: DType) -> Result<Self> {
        if target == self.dtype {
            return Ok(self.clone());
        }

        if self.dtype == DType::F64 {
            return self.f64_to_dtype(target);
        }

        let values = self.to_f32_vec();
        let data: Vec<u8> = match target {
            DType::F32 => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            DType::F16 => values
                .iter()
                .flat_map(|&v| f16::from_f32(v).to_le_bytes())
                .collect(),
            DType::BF16 => values
                .iter()
                .flat_map(|&v| bf16::from_f32(v).to_le_bytes())
                .collect(),
            DType::F64 => values
                .iter()
                .flat_map(|&v| (v as f64).to_le_bytes())
                .collect(),
            other => {
                return Err(ModelError::UnsupportedDtype(format!(
                    "cannot cast {} to {}",
                    self.dtype, other
                )));
            }
        };

        Self::new(self.shape.clone(), target, data)
    }

    /// Narrow f64 values in a single rounding step
    fn f64_to_dtype(&self, target: DType) -> Result<Self> {
        let values = self.data.chunks_exact(8).map(|b| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(b);
            f64::from_le_bytes(bytes)
        });
        let data: Vec<u8> = match target {
            DType::F32 => values.flat_map(|v| (v as f32).to_le_bytes()).collect(),
            DType::F16 => values.flat_map(|v| f16::from_f64(v).to_le_bytes()).collect(),
            DType::BF16 => values.flat_map(|v| bf16::from_f64(v).to_le_bytes()).collect(),
            other => {
                return Err(ModelError::UnsupportedDtype(format!(
                    "cannot cast {} to {}",
                    self.dtype, other
                )));
            }
        };

        Self::new(self.shape.clone(), target, data)
    }

    /// Drop every dimension of size 1
    pub fn squeeze(self) -> Self {
        let shape = self.shape.iter().copied().filter(|&d| d != 1).collect();
        Self {
            shape,
            dtype: self.dtype,
            data: self.data,
        }
    }

    /// Apply `f` to every element, producing an f32 tensor of the same shape
    pub fn map_f32(&self, f: impl Fn(f32) -> f32) -> Result<Self> {
        let values: Vec<f32> = self.to_f32_vec().into_iter().map(f).collect();
        Self::from_f32(self.shape.clone(), &values)
    }
}

/// One line of the conversion listing
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TensorSummary {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: String,
}

impl TensorSummary {
    pub fn new(name: &str, tensor: &Tensor) -> Self {
        Self {
            name: name.to_string(),
            shape: tensor.shape().to_vec(),
            dtype: tensor.dtype().to_string(),
        }
    }

    /// Summaries for a whole map, in name order
    pub fn from_map(tensors: &TensorMap) -> Vec<Self> {
        tensors
            .iter()
            .map(|(name, tensor)| Self::new(name, tensor))
            .collect()
    }
}

impl fmt::Display for TensorSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, shape {:?}, type {}", self.name, self.shape, self.dtype)
    }
}
