//! Conversion error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Safetensors error: {0}")]
    Safetensors(String),

    #[error("PyTorch checkpoint error: {0}")]
    Pickle(String),

    #[error("Checkpoint not found at path: {0}")]
    ModelNotFound(String),

    #[error("Invalid checkpoint format: {0}")]
    InvalidFormat(String),

    #[error("Missing tensor: {0}")]
    MissingTensor(String),

    #[error("Tensor shape mismatch for {name}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Unsupported data type: {0}")]
    UnsupportedDtype(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Refusing to overwrite the source checkpoint: {0}")]
    OutputOverwritesInput(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;

impl From<safetensors::SafeTensorError> for ModelError {
    fn from(err: safetensors::SafeTensorError) -> Self {
        ModelError::Safetensors(err.to_string())
    }
}

impl From<candle_core::Error> for ModelError {
    fn from(err: candle_core::Error) -> Self {
        ModelError::Pickle(err.to_string())
    }
}

impl From<zip::result::ZipError> for ModelError {
    fn from(err: zip::result::ZipError) -> Self {
        ModelError::Pickle(err.to_string())
    }
}
