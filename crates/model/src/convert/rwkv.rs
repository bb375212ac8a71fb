//! RWKV checkpoint rewriting
//!
//! The time-mixing parameters are stored as `[1, 1, C]` in training
//! checkpoints and squeezed to `[C]`. `time_decay` is stored as `w` while the
//! recurrence uses `-exp(w)`, so the exponential is taken once here.

use serde::{Deserialize, Serialize};

use super::{cast_for_storage, Architecture};
use crate::config::RwkvOptions;
use crate::error::{ModelError, Result};
use crate::tensor::{DType, Tensor, TensorMap};

const EMBEDDING: &str = "emb.weight";
const LN0_WEIGHT: &str = "blocks.0.ln0.weight";
const LN0_BIAS: &str = "blocks.0.ln0.bias";
const LAYER_MARKER: &str = ".ln1.weight";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RwkvHparams {
    pub vocab_size: usize,
    pub embed_dim: usize,
    pub num_layers: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Rwkv {
    options: RwkvOptions,
}

impl Rwkv {
    pub fn new(options: RwkvOptions) -> Self {
        Self { options }
    }

    /// Replace `emb.weight` by its ln0-normalized rows and drop ln0
    fn fold_ln0(&self, tensors: &mut TensorMap) -> Result<()> {
        let take = |tensors: &mut TensorMap, name: &str| {
            tensors
                .remove(name)
                .ok_or_else(|| ModelError::MissingTensor(name.to_string()))
        };
        let emb = take(tensors, EMBEDDING)?;
        let weight = take(tensors, LN0_WEIGHT)?;
        let bias = take(tensors, LN0_BIAS)?;

        tracing::info!("Folding {} and {} into {}", LN0_WEIGHT, LN0_BIAS, EMBEDDING);
        let folded = layer_norm_rows(EMBEDDING, &emb, &weight, &bias, self.options.ln_eps)?;
        tensors.insert(EMBEDDING.to_string(), folded);
        Ok(())
    }
}

/// Layer norm over the last dimension of `input`, computed in f32
pub fn layer_norm_rows(
    name: &str,
    input: &Tensor,
    weight: &Tensor,
    bias: &Tensor,
    eps: f32,
) -> Result<Tensor> {
    let width = input.shape().last().copied().unwrap_or(1);
    for (param, label) in [(weight, "weight"), (bias, "bias")] {
        if param.numel() != width {
            return Err(ModelError::ShapeMismatch {
                name: format!("{name} ({label})"),
                expected: vec![width],
                got: param.shape().to_vec(),
            });
        }
    }
    if width == 0 {
        return input.to_dtype(DType::F32);
    }

    let gamma = weight.to_f32_vec();
    let beta = bias.to_f32_vec();
    let mut values = input.to_f32_vec();

    for row in values.chunks_exact_mut(width) {
        let n = width as f32;
        let mean = row.iter().sum::<f32>() / n;
        let var = row.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / n;
        let inv_std = 1.0 / (var + eps).sqrt();
        for ((x, g), b) in row.iter_mut().zip(&gamma).zip(&beta) {
            *x = (*x - mean) * inv_std * g + b;
        }
    }

    Tensor::from_f32(input.shape().to_vec(), &values)
}

impl Architecture for Rwkv {
    const NAME: &'static str = "RWKV";

    type Hparams = RwkvHparams;

    fn transform(&self, mut tensors: TensorMap) -> Result<TensorMap> {
        if self.options.fold_ln0 {
            self.fold_ln0(&mut tensors)?;
        }

        let mut out = TensorMap::new();
        for (name, mut tensor) in tensors {
            if name.contains(".time_") {
                tensor = tensor.squeeze();
            }
            if name.contains(".time_decay") {
                tensor = tensor.map_f32(|w| -w.exp())?;
            }
            let tensor = cast_for_storage(&tensor, self.options.precision)?;
            out.insert(name, tensor);
        }

        Ok(out)
    }

    fn hparams(&self, tensors: &TensorMap) -> Result<RwkvHparams> {
        let embedding = tensors
            .get(EMBEDDING)
            .ok_or_else(|| ModelError::MissingTensor(EMBEDDING.to_string()))?;

        let (vocab_size, embed_dim) = match embedding.shape() {
            &[vocab_size, embed_dim] => (vocab_size, embed_dim),
            other => {
                return Err(ModelError::ShapeMismatch {
                    name: EMBEDDING.to_string(),
                    expected: vec![0, 0],
                    got: other.to_vec(),
                });
            }
        };

        Ok(RwkvHparams {
            vocab_size,
            embed_dim,
            num_layers: tensors.keys().filter(|k| k.ends_with(LAYER_MARKER)).count(),
        })
    }
}
