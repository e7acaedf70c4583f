//! Load-time options and generation configuration.
//!
//! [`LoadOptions`] is the mutable bag a family loader wires quantization and
//! attention settings into before the model is constructed. The resolution
//! pipeline itself never inspects which quantization family it is serving;
//! it only forwards the bag to the loader the catalog selected.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{AttnImplementation, DeviceSpec, Dtype};

/// Options handed to the loader selected by the catalog.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Weight placement.
    pub device: DeviceSpec,

    /// Quantization wiring, if any. Family loaders may rewrite or drop this
    /// when the checkpoint ships its own quantization metadata.
    pub quantization: Option<QuantizationConfig>,

    /// Attention backend override.
    pub attn_implementation: AttnImplementation,

    /// Keep host memory usage low while weights stream to the device.
    pub low_mem: bool,

    /// Whether the model is being prepared for adapter training rather than
    /// inference. Extension fail-fast checks only apply in this mode.
    pub training: bool,
}

impl LoadOptions {
    /// Options for inference with automatic device placement.
    pub fn inference() -> Self {
        Self {
            low_mem: true,
            ..Self::default()
        }
    }

    pub fn with_quantization(mut self, quant: QuantizationConfig) -> Self {
        self.quantization = Some(quant);
        self
    }

    pub fn with_device(mut self, device: DeviceSpec) -> Self {
        self.device = device;
        self
    }
}

/// The three supported quantization families.
///
/// Which one applies is a fact about the catalog entry's bound loader
/// arguments, not a pipeline branch.
#[derive(Debug, Clone, PartialEq)]
pub enum QuantizationConfig {
    /// Weight-only 4/8-bit scheme configured before construction.
    BitsAndBytes {
        load_in_8bit: bool,
        load_in_4bit: bool,
        /// Defaults to the resolved checkpoint dtype when unset.
        compute_dtype: Option<Dtype>,
        quant_type: String,
        double_quant: bool,
        /// Module names excluded from int8 conversion.
        skip_modules: Vec<String>,
    },
    /// Calibration-based integer scheme. Needs the `gptq` runtime extension
    /// when preparing for training.
    Gptq { bits: u8, exllama: bool },
    /// Activation-aware weight-only scheme. Needs the `awq` runtime
    /// extension when preparing for training.
    Awq,
}

impl QuantizationConfig {
    pub fn bnb_4bit(compute_dtype: Option<Dtype>) -> Self {
        Self::BitsAndBytes {
            load_in_8bit: false,
            load_in_4bit: true,
            compute_dtype,
            quant_type: "nf4".to_string(),
            double_quant: true,
            skip_modules: Vec::new(),
        }
    }

    pub fn bnb_8bit() -> Self {
        Self::BitsAndBytes {
            load_in_8bit: true,
            load_in_4bit: false,
            compute_dtype: None,
            quant_type: "nf4".to_string(),
            double_quant: false,
            skip_modules: Vec::new(),
        }
    }

    pub fn is_bits_and_bytes(&self) -> bool {
        matches!(self, Self::BitsAndBytes { .. })
    }
}

/// End-of-sequence token ids as they appear in `generation_config.json`;
/// some checkpoints declare one id, some a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EosIds {
    Single(u32),
    Multiple(Vec<u32>),
}

impl EosIds {
    pub fn contains(&self, id: u32) -> bool {
        match self {
            Self::Single(eos) => *eos == id,
            Self::Multiple(ids) => ids.contains(&id),
        }
    }
}

/// Sampling defaults shipped with a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default)]
    pub max_new_tokens: Option<usize>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub do_sample: bool,
    #[serde(default)]
    pub repetition_penalty: Option<f32>,
    #[serde(default)]
    pub eos_token_id: Option<EosIds>,
    #[serde(default)]
    pub pad_token_id: Option<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: None,
            temperature: None,
            top_p: None,
            top_k: None,
            do_sample: false,
            repetition_penalty: None,
            eos_token_id: None,
            pad_token_id: None,
        }
    }
}

impl GenerationConfig {
    /// Read `generation_config.json` from a checkpoint directory.
    pub fn from_dir(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join("generation_config.json");
        if !path.is_file() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Some checkpoints ship a sampling temperature while sampling is
    /// disabled. Callers treat that as a legacy inconsistency and enable
    /// sampling; returns true when the correction applied.
    pub fn reconcile_sampling(&mut self) -> bool {
        if let Some(t) = self.temperature {
            if t > 0.0 && t < 1.0 && !self.do_sample {
                self.do_sample = true;
                return true;
            }
        }
        false
    }
}
