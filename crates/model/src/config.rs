//! Conversion options and upstream model configuration

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::tensor::DType;

/// Target precision for multi-dimensional tensors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Precision {
    #[default]
    F32,
    F16,
}

impl Precision {
    pub fn dtype(&self) -> DType {
        match self {
            Precision::F32 => DType::F32,
            Precision::F16 => DType::F16,
        }
    }
}

impl FromStr for Precision {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "f32" => Ok(Precision::F32),
            "f16" => Ok(Precision::F16),
            other => Err(ModelError::Config(format!(
                "unknown mtype '{}', expected f32 or f16",
                other
            ))),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dtype().as_str())
    }
}

/// GPT-NeoX configuration (the fields of a HuggingFace config.json we need)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GptNeoXConfig {
    /// Hidden size (embedding dimension)
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,

    /// Number of attention heads
    #[serde(default = "default_num_attention_heads")]
    pub num_attention_heads: usize,

    /// Fraction of each head that gets rotary embeddings
    #[serde(default = "default_rotary_pct")]
    pub rotary_pct: f64,
}

fn default_hidden_size() -> usize { 768 }
fn default_num_attention_heads() -> usize { 12 }
fn default_rotary_pct() -> f64 { 0.25 }

impl Default for GptNeoXConfig {
    fn default() -> Self {
        Self {
            hidden_size: default_hidden_size(),
            num_attention_heads: default_num_attention_heads(),
            rotary_pct: default_rotary_pct(),
        }
    }
}

impl GptNeoXConfig {
    /// Load config from a JSON file (config.json from HuggingFace)
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Head dimension
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Number of rotary dimensions per head
    pub fn rotary_dims(&self) -> usize {
        (self.head_dim() as f64 * self.rotary_pct) as usize
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(ModelError::Config(format!(
                "hidden_size ({}) must be divisible by num_attention_heads ({})",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if !(self.rotary_pct > 0.0 && self.rotary_pct <= 1.0) {
            return Err(ModelError::Config(format!(
                "rotary_pct ({}) must be in (0, 1]",
                self.rotary_pct
            )));
        }
        Ok(())
    }
}

/// GPT-NeoX conversion options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptNeoXOptions {
    pub precision: Precision,
    /// Written to the hparams metadata as `num_heads`
    pub num_heads: usize,
    /// Written to the hparams metadata as `num_rot`
    pub num_rot: usize,
}

impl Default for GptNeoXOptions {
    fn default() -> Self {
        Self {
            precision: Precision::F32,
            num_heads: 8,
            num_rot: 2,
        }
    }
}

impl GptNeoXOptions {
    pub fn from_config(config: &GptNeoXConfig, precision: Precision) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            precision,
            num_heads: config.num_attention_heads,
            num_rot: config.rotary_dims(),
        })
    }
}

/// RWKV conversion options
#[derive(Debug, Clone, PartialEq)]
pub struct RwkvOptions {
    pub precision: Precision,
    /// Fold `blocks.0.ln0` into `emb.weight`
    pub fold_ln0: bool,
    pub ln_eps: f32,
}

impl Default for RwkvOptions {
    fn default() -> Self {
        Self {
            precision: Precision::F32,
            fold_ln0: false,
            ln_eps: 1e-5,
        }
    }
}
