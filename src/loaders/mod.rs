//! Loader function registry.
//!
//! A catalog entry names one [`LoaderKey`] plus the arguments bound to it at
//! registration time. Many entries share one key; the bound arguments are
//! what distinguish, say, a GPTQ variant from the plain chat model of the
//! same family.

use std::path::Path;

use crate::config::LoadOptions;
use crate::error::Result;
use crate::model::{ModelConfigData, ModelHandle, TokenizerHandle};
use crate::requirements::RuntimeEnv;
use crate::runtime::BackendFactory;
use crate::types::Dtype;

pub mod base;
pub mod families;
pub mod patches;

/// Which loader procedure a catalog entry resolves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderKey {
    /// Plain repository load with no family fixes.
    Repo,
    /// Repository load with attention-backend wiring.
    FlashAttn,
    /// Llama-2 lineage (tensor-parallel config fix).
    Llama,
    /// First-generation qwen base checkpoints (eos ships wrong).
    QwenBase,
    /// First-generation qwen chat checkpoints.
    QwenChat,
    /// Qwen-1.5 lineage, including its GPTQ/AWQ variants.
    Qwen2,
    ChatGlm,
    Baichuan2,
    /// Baichuan-2 checkpoints that ship their own quantization.
    Baichuan2Quantized,
}

/// Arguments pre-bound to a loader at registration time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoaderArgs {
    /// Family-level flash-attention default; `None` lets the load options
    /// decide.
    pub use_flash_attn: Option<bool>,
    /// Non-zero for calibration-quantized checkpoints.
    pub gptq_bits: u8,
    /// Activation-aware quantized checkpoint.
    pub awq: bool,
    /// End-of-sequence token forced by the loader rather than the catalog.
    pub eos_token: Option<String>,
}

impl LoaderArgs {
    pub fn gptq(bits: u8) -> Self {
        Self {
            gptq_bits: bits,
            ..Self::default()
        }
    }

    pub fn awq() -> Self {
        Self {
            awq: true,
            ..Self::default()
        }
    }
}

/// Everything a loader needs for one resolution call.
pub struct LoaderContext<'a> {
    pub key: &'a str,
    pub dir: &'a Path,
    pub dtype: Dtype,
    pub options: &'a mut LoadOptions,
    pub load_model: bool,
    pub args: &'a LoaderArgs,
    pub env: &'a RuntimeEnv,
    pub factory: &'a dyn BackendFactory,
    /// Caller-supplied configuration, already read from disk otherwise.
    pub config: Option<ModelConfigData>,
    /// Caller-injected tokenizer instance.
    pub tokenizer: Option<TokenizerHandle>,
}

/// What a loader hands back to the pipeline.
pub struct LoadedPair {
    pub model: Option<ModelHandle>,
    pub tokenizer: TokenizerHandle,
}

impl std::fmt::Debug for LoadedPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPair")
            .field("model", &self.model.is_some())
            .field("tokenizer", &self.tokenizer)
            .finish()
    }
}

/// Invoke the loader a catalog entry is bound to.
pub(crate) fn dispatch(loader: LoaderKey, ctx: LoaderContext<'_>) -> Result<LoadedPair> {
    match loader {
        LoaderKey::Repo => base::load_repo(ctx),
        LoaderKey::FlashAttn => families::load_flash_attn(ctx),
        LoaderKey::Llama => families::load_llama(ctx),
        LoaderKey::QwenBase => families::load_qwen_base(ctx),
        LoaderKey::QwenChat => families::load_qwen_chat(ctx),
        LoaderKey::Qwen2 => families::load_qwen2(ctx),
        LoaderKey::ChatGlm => families::load_chatglm(ctx),
        LoaderKey::Baichuan2 => families::load_baichuan2(ctx),
        LoaderKey::Baichuan2Quantized => families::load_baichuan2_quantized(ctx),
    }
}
