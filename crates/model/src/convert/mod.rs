//! Checkpoint conversion pipeline
//!
//! Every converter follows the same steps: load the checkpoint, rewrite the
//! tensor map for the target runtime, derive the hyperparameters, then write
//! a safetensors file whose `__metadata__` holds `{"hparams": "<json>"}`.

mod gpt_neox;
mod rwkv;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::Precision;
use crate::error::{ModelError, Result};
use crate::loader::load_checkpoint;
use crate::tensor::{DType, Tensor, TensorMap, TensorSummary};
use crate::writer::save_safetensors;

pub use gpt_neox::{GptNeoX, GptNeoXHparams};
pub use rwkv::{layer_norm_rows, Rwkv, RwkvHparams};

/// Metadata key holding the JSON-encoded hyperparameters
pub const HPARAMS_KEY: &str = "hparams";

/// A model family that knows how to rewrite its own checkpoints
pub trait Architecture {
    /// Name used in log lines
    const NAME: &'static str;

    type Hparams: Serialize;

    /// Rename, prune and cast the loaded tensors
    fn transform(&self, tensors: TensorMap) -> Result<TensorMap>;

    /// Hyperparameters of the transformed checkpoint
    fn hparams(&self, tensors: &TensorMap) -> Result<Self::Hparams>;
}

/// Outcome of a file conversion
#[derive(Debug, Clone)]
pub struct ConversionReport {
    pub source: PathBuf,
    pub output: PathBuf,
    /// One entry per written tensor, in name order
    pub tensors: Vec<TensorSummary>,
    pub metadata: HashMap<String, String>,
}

/// Wrap hyperparameters into the safetensors metadata map
pub fn build_metadata<H: Serialize>(hparams: &H) -> Result<HashMap<String, String>> {
    let mut metadata = HashMap::new();
    metadata.insert(HPARAMS_KEY.to_string(), serde_json::to_string(hparams)?);
    Ok(metadata)
}

/// Run an architecture over an in-memory checkpoint
pub fn convert_tensors<A: Architecture>(
    arch: &A,
    tensors: TensorMap,
) -> Result<(TensorMap, HashMap<String, String>)> {
    let tensors = arch.transform(tensors)?;
    let hparams = arch.hparams(&tensors)?;
    let metadata = build_metadata(&hparams)?;
    Ok((tensors, metadata))
}

/// Convert `source` and write the result to `output`
pub fn convert_file<A: Architecture>(
    arch: &A,
    source: impl AsRef<Path>,
    output: impl AsRef<Path>,
) -> Result<ConversionReport> {
    let source = source.as_ref();
    let output = output.as_ref();

    if same_file(source, output) {
        return Err(ModelError::OutputOverwritesInput(output.display().to_string()));
    }

    let tensors = load_checkpoint(source)?;

    tracing::info!("Converting {} checkpoint", A::NAME);
    let (tensors, metadata) = convert_tensors(arch, tensors)?;

    tracing::info!("Saving to {}", output.display());
    save_safetensors(output, &tensors, Some(metadata.clone()))?;

    Ok(ConversionReport {
        source: source.to_path_buf(),
        output: output.to_path_buf(),
        tensors: TensorSummary::from_map(&tensors),
        metadata,
    })
}

/// Same base name as the checkpoint, with a `.safetensors` extension
pub fn default_output_path(source: impl AsRef<Path>) -> PathBuf {
    source.as_ref().with_extension("safetensors")
}

/// Matrices take the requested precision, vectors and scalars stay f32
pub fn cast_for_storage(tensor: &Tensor, precision: Precision) -> Result<Tensor> {
    let target = if tensor.ndim() > 1 {
        precision.dtype()
    } else {
        DType::F32
    };
    tensor.to_dtype(target)
}

fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_output_path() {
        assert_eq!(
            default_output_path("weights/RWKV-4-Pile-169M-20220807-8023.pth"),
            PathBuf::from("weights/RWKV-4-Pile-169M-20220807-8023.safetensors")
        );
        assert_eq!(
            default_output_path("pytorch_model.bin"),
            PathBuf::from("pytorch_model.safetensors")
        );
        assert_eq!(default_output_path("ckpt"), PathBuf::from("ckpt.safetensors"));
    }

    #[test]
    fn test_cast_for_storage() {
        let matrix = Tensor::from_f32(vec![2, 2], &[1.0; 4]).unwrap();
        let vector = Tensor::from_f32(vec![4], &[1.0; 4])
            .unwrap()
            .to_dtype(DType::BF16)
            .unwrap();

        assert_eq!(
            cast_for_storage(&matrix, Precision::F16).unwrap().dtype(),
            DType::F16
        );
        assert_eq!(
            cast_for_storage(&vector, Precision::F16).unwrap().dtype(),
            DType::F32
        );
    }

    #[test]
    fn test_refuses_to_overwrite_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        std::fs::write(&path, b"x").unwrap();

        let err = convert_file(&GptNeoX::default(), &path, &path).unwrap_err();
        assert!(matches!(err, ModelError::OutputOverwritesInput(_)));
    }

    #[test]
    fn test_build_metadata() {
        let hparams = RwkvHparams {
            vocab_size: 50277,
            embed_dim: 768,
            num_layers: 12,
        };
        let metadata = build_metadata(&hparams).unwrap();
        assert_eq!(
            metadata[HPARAMS_KEY],
            r#"{"vocab_size":50277,"embed_dim":768,"num_layers":12}"#
        );
    }
}
