//! Safetensors export and inspection

use std::collections::HashMap;
use std::path::Path;

use memmap2::Mmap;
use safetensors::tensor::TensorView;
use safetensors::SafeTensors;

use crate::error::{ModelError, Result};
use crate::tensor::{DType, TensorMap, TensorSummary};

/// Contents of a safetensors file as seen by a reader
#[derive(Debug, Clone)]
pub struct SafetensorsSummary {
    /// Tensor listing, sorted by name
    pub tensors: Vec<TensorSummary>,
    /// `__metadata__` entries, if any
    pub metadata: Option<HashMap<String, String>>,
}

/// Write tensors and optional metadata to a safetensors file
pub fn save_safetensors(
    path: impl AsRef<Path>,
    tensors: &TensorMap,
    metadata: Option<HashMap<String, String>>,
) -> Result<()> {
    let path = path.as_ref();

    let mut views = Vec::with_capacity(tensors.len());
    for (name, tensor) in tensors {
        let view = TensorView::new(tensor.dtype().into(), tensor.shape().to_vec(), tensor.as_bytes())
            .map_err(|e| ModelError::Safetensors(format!("{}: {}", name, e)))?;
        views.push((name.as_str(), view));
    }

    safetensors::tensor::serialize_to_file(views, &metadata, path)?;

    tracing::debug!("Wrote {} tensors to {}", tensors.len(), path.display());
    Ok(())
}

/// List the tensors and metadata of a safetensors file
pub fn inspect_safetensors(path: impl AsRef<Path>) -> Result<SafetensorsSummary> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(ModelError::ModelNotFound(path.display().to_string()));
    }

    let file = std::fs::File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };

    let (_, header) = SafeTensors::read_metadata(&mmap)
        .map_err(|e| ModelError::InvalidFormat(format!("{}: {}", path.display(), e)))?;
    let safetensors = SafeTensors::deserialize(&mmap)
        .map_err(|e| ModelError::InvalidFormat(format!("{}: {}", path.display(), e)))?;

    let mut tensors = Vec::new();
    for (name, view) in safetensors.tensors() {
        let dtype = DType::try_from(view.dtype())?;
        tensors.push(TensorSummary {
            name,
            shape: view.shape().to_vec(),
            dtype: dtype.to_string(),
        });
    }
    tensors.sort();

    Ok(SafetensorsSummary {
        tensors,
        metadata: header.metadata().clone(),
    })
}
