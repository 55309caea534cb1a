//! Model metadata consumed by the cache.
//!
//! The cache needs only a thin slice of the model description: layer count,
//! per-layer K/V embedding widths, the architecture class, and (for Mamba or
//! RWKV class models) the recurrent-state widths. Loaded from a config.json
//! or built from a preset.

use serde::Deserialize;

use crate::backend::MemoryDomain;
use crate::error::Result;

/// Architecture class, as far as the cache cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    /// Transformer-family models (Llama, Mistral, ...).
    Llama,
    /// DeepSeek models using multi-head latent attention. Positional shifts
    /// cannot be folded into RoPE for these, so `can_shift` is off.
    DeepseekMla,
    /// Mamba-family state-space models.
    Mamba,
    /// RWKV-family models.
    Rwkv,
}

impl Architecture {
    /// Whether the architecture keeps a single recurrent state per sequence
    /// instead of one cache cell per token.
    pub fn is_recurrent(self) -> bool {
        matches!(self, Architecture::Mamba | Architecture::Rwkv)
    }
}

/// The model hyperparameters the cache reads.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelMetadata {
    /// Architecture class.
    pub architecture: Architecture,

    /// Number of transformer (or state-space) layers.
    pub n_layer: usize,

    /// Number of key-value heads (GQA). Zero for purely recurrent models.
    #[serde(default)]
    pub n_head_kv: usize,

    /// Dimension of each attention head.
    #[serde(default)]
    pub head_dim: usize,

    /// Convolution kernel width of the state-space block (recurrent only).
    #[serde(default)]
    pub ssm_d_conv: usize,

    /// Inner dimension of the state-space block (recurrent only).
    #[serde(default)]
    pub ssm_d_inner: usize,

    /// State dimension of the state-space block (recurrent only).
    #[serde(default)]
    pub ssm_d_state: usize,

    /// Device index per layer, consulted when the cache is offloaded.
    /// Layers beyond the end of this list fall back to device 0.
    #[serde(default)]
    pub layer_devices: Vec<usize>,
}

impl ModelMetadata {
    /// Whether this model stores one recurrent state per sequence.
    pub fn is_recurrent(&self) -> bool {
        self.architecture.is_recurrent()
    }

    /// K embedding width of one cache column for `layer`, attention part.
    pub fn n_embd_k_gqa(&self, _layer: usize) -> usize {
        self.n_head_kv * self.head_dim
    }

    /// V embedding width of one cache column for `layer`, attention part.
    pub fn n_embd_v_gqa(&self, _layer: usize) -> usize {
        self.n_head_kv * self.head_dim
    }

    /// Width of the convolution state stored per sequence (recurrent only).
    pub fn n_embd_k_s(&self) -> usize {
        self.ssm_d_conv.saturating_sub(1) * self.ssm_d_inner
    }

    /// Width of the recurrence state stored per sequence (recurrent only).
    pub fn n_embd_v_s(&self) -> usize {
        self.ssm_d_state * self.ssm_d_inner
    }

    /// Memory domain holding `layer`'s weights, used when offloading the
    /// cache so K/V land next to the layer that reads them.
    pub fn dev_layer(&self, layer: usize) -> MemoryDomain {
        MemoryDomain::Device(self.layer_devices.get(layer).copied().unwrap_or(0))
    }

    /// Load metadata from a config.json file.
    pub fn from_json_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let meta: ModelMetadata = serde_json::from_str(&text)?;
        Ok(meta)
    }

    /// Preset for Llama 3 8B (32 layers, 8 KV heads of dim 128).
    pub fn llama3_8b() -> Self {
        ModelMetadata {
            architecture: Architecture::Llama,
            n_layer: 32,
            n_head_kv: 8,
            head_dim: 128,
            ssm_d_conv: 0,
            ssm_d_inner: 0,
            ssm_d_state: 0,
            layer_devices: Vec::new(),
        }
    }

    /// Preset for Mamba 130M (24 layers, conv width 4, inner dim 1536).
    pub fn mamba_130m() -> Self {
        ModelMetadata {
            architecture: Architecture::Mamba,
            n_layer: 24,
            n_head_kv: 0,
            head_dim: 0,
            ssm_d_conv: 4,
            ssm_d_inner: 1536,
            ssm_d_state: 16,
            layer_devices: Vec::new(),
        }
    }
}
