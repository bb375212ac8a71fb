//! GPT-NeoX (Pythia, StableLM) checkpoint rewriting

use serde::{Deserialize, Serialize};

use super::{cast_for_storage, Architecture};
use crate::config::GptNeoXOptions;
use crate::error::{ModelError, Result};
use crate::tensor::TensorMap;

const KEY_PREFIX: &str = "gpt_neox.";

/// Buffers HuggingFace saves next to the weights; the runtime rebuilds them
const PRUNED_SUFFIXES: [&str; 3] = [".masked_bias", "attention.bias", ".inv_freq"];

const EMBEDDING: &str = "embed_in.weight";
const LAYER_MARKER: &str = ".input_layernorm.weight";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GptNeoXHparams {
    pub vocab_size: usize,
    pub embed_dim: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub num_rot: usize,
}

#[derive(Debug, Clone, Default)]
pub struct GptNeoX {
    options: GptNeoXOptions,
}

impl GptNeoX {
    pub fn new(options: GptNeoXOptions) -> Self {
        Self { options }
    }
}

fn is_pruned(name: &str) -> bool {
    PRUNED_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

impl Architecture for GptNeoX {
    const NAME: &'static str = "GPT-NeoX";

    type Hparams = GptNeoXHparams;

    fn transform(&self, tensors: TensorMap) -> Result<TensorMap> {
        let mut out = TensorMap::new();

        for (name, tensor) in tensors {
            let name = name.strip_prefix(KEY_PREFIX).map(str::to_string).unwrap_or(name);
            if is_pruned(&name) {
                tracing::debug!("Pruning {}", name);
                continue;
            }
            let tensor = cast_for_storage(&tensor, self.options.precision)?;
            out.insert(name, tensor);
        }

        Ok(out)
    }

    fn hparams(&self, tensors: &TensorMap) -> Result<GptNeoXHparams> {
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

        let num_layers = tensors.keys().filter(|k| k.ends_with(LAYER_MARKER)).count();

        Ok(GptNeoXHparams {
            vocab_size,
            embed_dim,
            num_layers,
            num_heads: self.options.num_heads,
            num_rot: self.options.num_rot,
        })
    }
}
