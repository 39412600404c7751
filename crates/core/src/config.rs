use std::fmt;
use std::str::FromStr;

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::checkpoint::FormatError;

/// Shape of a LLaMA-family model.
///
/// Field names follow the HuggingFace `config.json` spelling so a community
/// checkpoint's config file deserializes directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    #[serde(default = "default_rms_norm_eps", alias = "layer_norm_epsilon")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_rope_theta() -> f64 {
    10000.0
}

fn default_max_position_embeddings() -> usize {
    2048
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::llama_7b()
    }
}

impl ModelConfig {
    pub fn llama_7b() -> Self {
        Self {
            vocab_size: 32000,
            hidden_size: 4096,
            num_hidden_layers: 32,
            num_attention_heads: 32,
            intermediate_size: 11008,
            rms_norm_eps: default_rms_norm_eps(),
            rope_theta: default_rope_theta(),
            max_position_embeddings: default_max_position_embeddings(),
        }
    }

    pub fn llama_13b() -> Self {
        Self {
            hidden_size: 5120,
            num_hidden_layers: 40,
            num_attention_heads: 40,
            intermediate_size: 13824,
            ..Self::llama_7b()
        }
    }

    pub fn llama_30b() -> Self {
        Self {
            hidden_size: 6656,
            num_hidden_layers: 60,
            num_attention_heads: 52,
            intermediate_size: 17920,
            ..Self::llama_7b()
        }
    }

    /// Look up a preset by its short name (`7b`, `13b`, `30b`).
    pub fn preset(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "7b" | "llama-7b" => Some(Self::llama_7b()),
            "13b" | "llama-13b" => Some(Self::llama_13b()),
            "30b" | "llama-30b" => Some(Self::llama_30b()),
            _ => None,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Reject shapes no checkpoint can have.
    pub fn validate(&self) -> Result<(), FormatError> {
        let invalid = |reason: String| Err(FormatError::InvalidModelConfig(reason));
        if self.num_hidden_layers == 0 {
            return invalid("num_hidden_layers must be > 0".to_string());
        }
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return invalid(format!(
                "hidden_size {} is not divisible into {} heads",
                self.hidden_size, self.num_attention_heads
            ));
        }
        if self.head_dim() % 2 != 0 {
            return invalid(format!("head_dim {} must be even for rotary", self.head_dim()));
        }
        Ok(())
    }
}

/// Numeric precision that weights are cast to when loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
    Bf16,
}

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Self::Fp32 => DType::F32,
            Self::Fp16 => DType::F16,
            Self::Bf16 => DType::BF16,
        }
    }
}

impl FromStr for Precision {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fp32" | "f32" | "float32" => Ok(Self::Fp32),
            "fp16" | "f16" | "float16" | "half" => Ok(Self::Fp16),
            "bf16" | "bfloat16" => Ok(Self::Bf16),
            other => Err(FormatError::UnknownToken {
                kind: "precision",
                token: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fp32 => "fp32",
            Self::Fp16 => "fp16",
            Self::Bf16 => "bf16",
        };
        f.write_str(s)
    }
}

/// Execution layout shared by every participant of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of pipeline stages the layers are partitioned over.
    pub num_stages: usize,
    /// Micro-batches in flight per stage; sizes each block's cache ring.
    pub micro_batch_num: usize,
    /// Dropout probability, applied only when a stage runs in training mode.
    pub dropout: f32,
    pub precision: Precision,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            num_stages: 1,
            micro_batch_num: 1,
            dropout: 0.0,
            precision: Precision::Fp32,
        }
    }
}

impl PipelineConfig {
    pub fn new(num_stages: usize, micro_batch_num: usize) -> Self {
        assert!(num_stages > 0, "num_stages must be > 0");
        assert!(micro_batch_num > 0, "micro_batch_num must be > 0");
        Self {
            num_stages,
            micro_batch_num,
            ..Self::default()
        }
    }
}
