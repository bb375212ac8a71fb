//! stconv model conversion
//!
//! Loads GPT-NeoX and RWKV checkpoints, rewrites their state dicts for the
//! ggml runtime and exports them as safetensors with an `hparams` header.

mod config;
pub mod convert;
mod error;
mod loader;
mod tensor;
mod writer;

pub use config::{GptNeoXConfig, GptNeoXOptions, Precision, RwkvOptions};
pub use convert::{
    build_metadata, cast_for_storage, convert_file, convert_tensors, default_output_path,
    Architecture, ConversionReport, GptNeoX, GptNeoXHparams, Rwkv, RwkvHparams, HPARAMS_KEY,
};
pub use error::{ModelError, Result};
pub use loader::{load_checkpoint, load_pytorch, load_safetensors, CheckpointFormat};
pub use tensor::{DType, Tensor, TensorMap, TensorSummary};
pub use writer::{inspect_safetensors, save_safetensors, SafetensorsSummary};
