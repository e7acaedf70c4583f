//! Common type definitions shared across the catalog and the pipeline.

use std::fmt;

use candle_core::DType;
use serde::{Deserialize, Serialize};

/// Numeric precision a checkpoint is loaded with.
///
/// Mirrors the `torch_dtype` field of checkpoint metadata; the resolution
/// pipeline maps it onto the runtime's dtype when weights are materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    F16,
    BF16,
    F32,
}

impl Dtype {
    /// Parse the string form used in `config.json` (`"float16"` etc.).
    pub fn from_config_str(s: &str) -> Option<Self> {
        match s {
            "float16" | "fp16" | "half" => Some(Self::F16),
            "bfloat16" | "bf16" => Some(Self::BF16),
            "float32" | "fp32" | "float" => Some(Self::F32),
            _ => None,
        }
    }

    /// The string form written back into checkpoint metadata.
    pub fn config_str(&self) -> &'static str {
        match self {
            Self::F16 => "float16",
            Self::BF16 => "bfloat16",
            Self::F32 => "float32",
        }
    }

    pub fn to_dtype(self) -> DType {
        match self {
            Self::F16 => DType::F16,
            Self::BF16 => DType::BF16,
            Self::F32 => DType::F32,
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::F16 => "f16",
            Self::BF16 => "bf16",
            Self::F32 => "f32",
        };
        write!(f, "{s}")
    }
}

/// Where model weights are placed when loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSpec {
    /// Pick CUDA when available, CPU otherwise.
    #[default]
    Auto,
    Cpu,
    /// A specific CUDA ordinal.
    Cuda(usize),
}

/// Attention backend wired into the model configuration before construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttnImplementation {
    /// Let the family loader decide based on capability flags.
    #[default]
    Auto,
    Eager,
    FlashAttention2,
}

/// Identity of a load-time patch.
///
/// Patches wrap the backend of one resolved model instead of mutating shared
/// runtime state; the ledger on the model handle guarantees each id is
/// applied at most once per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchId {
    /// Baichuan-2 ships an lm-head that must be evaluated in full precision.
    LmHeadFullPrecision,
    /// GPTQ linear layers misreport gradient support while training.
    GptqTrainingGuard,
    /// Checkpoint serialization convention shim for newer runtimes.
    CheckpointSignature,
}

impl fmt::Display for PatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LmHeadFullPrecision => "lm-head-full-precision",
            Self::GptqTrainingGuard => "gptq-training-guard",
            Self::CheckpointSignature => "checkpoint-signature",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_roundtrip() {
        for dtype in [Dtype::F16, Dtype::BF16, Dtype::F32] {
            assert_eq!(Dtype::from_config_str(dtype.config_str()), Some(dtype));
        }
        assert_eq!(Dtype::from_config_str("int8"), None);
    }

    #[test]
    fn test_dtype_to_runtime() {
        assert_eq!(Dtype::BF16.to_dtype(), DType::BF16);
    }

    #[test]
    fn test_device_default_is_auto() {
        assert_eq!(DeviceSpec::default(), DeviceSpec::Auto);
    }
}
