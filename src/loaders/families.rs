//! Family-specific loaders.
//!
//! Each one mutates the configuration, options bag or tokenizer the way its
//! family needs before (or after) delegating to the shared repository
//! loader. The mutations here are the load-time fixes that produce wrong
//! generations rather than crashes when missed.

use serde_json::json;
use tracing::info;

use crate::config::QuantizationConfig;
use crate::error::Result;
use crate::model::ModelConfigData;
use crate::types::{AttnImplementation, PatchId};

use super::base::{load_repo_with, take_config};
use super::{LoadedPair, LoaderContext};

/// Write the attention-backend choice into the configuration. Newer
/// runtimes read `_attn_implementation`; older ones only understand the
/// boolean flag, so the key is picked per version.
fn wire_flash_attn(config: &mut ModelConfigData, ctx: &LoaderContext<'_>) {
    let use_flash = ctx.args.use_flash_attn.unwrap_or(matches!(
        ctx.options.attn_implementation,
        AttnImplementation::FlashAttention2
    ));
    if ctx.env.at_least("candle", "0.5") {
        if use_flash {
            config.set("_attn_implementation", json!("flash_attention_2"));
        }
    } else {
        config.set("_flash_attn_2_enabled", json!(use_flash));
    }
}

pub(crate) fn load_flash_attn(mut ctx: LoaderContext<'_>) -> Result<LoadedPair> {
    let mut config = take_config(&mut ctx)?;
    wire_flash_attn(&mut config, &ctx);
    load_repo_with(ctx, config)
}

/// Llama-2 checkpoints ship a tensor-parallel degree that breaks
/// single-process loads; pin it to one before construction.
pub(crate) fn load_llama(mut ctx: LoaderContext<'_>) -> Result<LoadedPair> {
    let mut config = take_config(&mut ctx)?;
    config.set("pretraining_tp", json!(1));
    wire_flash_attn(&mut config, &ctx);
    load_repo_with(ctx, config)
}

/// First-generation qwen encodes its precision as three mutually exclusive
/// boolean flags instead of `torch_dtype`.
fn load_qwen_common(mut ctx: LoaderContext<'_>) -> Result<LoadedPair> {
    let mut config = take_config(&mut ctx)?;
    for (flag, dtype) in [
        ("fp16", crate::types::Dtype::F16),
        ("bf16", crate::types::Dtype::BF16),
        ("fp32", crate::types::Dtype::F32),
    ] {
        config.set(flag, json!(dtype == ctx.dtype));
    }
    match ctx.args.use_flash_attn {
        Some(enabled) => config.set("use_flash_attn", json!(enabled)),
        None => config.set("use_flash_attn", json!("auto")),
    }
    load_repo_with(ctx, config)
}

pub(crate) fn load_qwen_chat(ctx: LoaderContext<'_>) -> Result<LoadedPair> {
    load_qwen_common(ctx)
}

/// Base qwen checkpoints declare no eos; the end-of-document token is the
/// one generation must stop on.
pub(crate) fn load_qwen_base(ctx: LoaderContext<'_>) -> Result<LoadedPair> {
    let mut pair = load_qwen_common(ctx)?;
    pair.tokenizer.set_eos_token("<|endoftext|>");
    Ok(pair)
}

/// Qwen-1.5 and its GPTQ/AWQ variants. Chat turns end at `<|im_end|>`, not
/// at the eos the tokenizer files declare.
pub(crate) fn load_qwen2(mut ctx: LoaderContext<'_>) -> Result<LoadedPair> {
    let mut config = take_config(&mut ctx)?;
    wire_flash_attn(&mut config, &ctx);
    let eos = ctx.args.eos_token.clone();
    let mut pair = load_repo_with(ctx, config)?;
    pair.tokenizer
        .set_eos_token(eos.as_deref().unwrap_or("<|im_end|>"));
    Ok(pair)
}

/// ChatGLM: its output head must be kept out of int8 conversion, and older
/// checkpoints leave the eos slot empty.
pub(crate) fn load_chatglm(mut ctx: LoaderContext<'_>) -> Result<LoadedPair> {
    if let Some(QuantizationConfig::BitsAndBytes { skip_modules, .. }) = &mut ctx.options.quantization
    {
        if !skip_modules.iter().any(|m| m == "output_layer") {
            skip_modules.push("output_layer".to_string());
        }
    }
    let mut pair = load_flash_attn(ctx)?;
    if pair.tokenizer.eos_token().is_none() {
        pair.tokenizer.set_eos_token("</s>");
    }
    Ok(pair)
}

/// Baichuan-2: default the z-loss weight the config may omit, and route the
/// lm-head through full precision.
pub(crate) fn load_baichuan2(mut ctx: LoaderContext<'_>) -> Result<LoadedPair> {
    let mut config = take_config(&mut ctx)?;
    config.set_default("z_loss_weight", json!(0));
    let mut pair = load_repo_with(ctx, config)?;
    if let Some(model) = &mut pair.model {
        model.apply_patch(PatchId::LmHeadFullPrecision);
    }
    Ok(pair)
}

/// Baichuan-2 4-bit checkpoints carry their own quantization metadata; a
/// caller-supplied quantization config would double-quantize.
pub(crate) fn load_baichuan2_quantized(mut ctx: LoaderContext<'_>) -> Result<LoadedPair> {
    if ctx.options.quantization.take().is_some() {
        info!(key = ctx.key, "checkpoint ships its own quantization, ignoring caller config");
    }
    let mut pair = load_baichuan2(ctx)?;
    if let Some(model) = &mut pair.model {
        model.set_quantization(crate::model::QuantMarker::BitsAndBytes);
    }
    Ok(pair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoadOptions;
    use crate::loaders::{LoaderArgs, LoaderContext};
    use crate::model::tests::tiny_tokenizer;
    use crate::model::QuantMarker;
    use crate::requirements::RuntimeEnv;
    use crate::runtime::testing::StaticFactory;
    use crate::types::Dtype;
    use std::fs;

    fn fake_checkpoint(dir: &std::path::Path, arch: &str) {
        fs::write(
            dir.join("config.json"),
            serde_json::json!({
                "architectures": [arch],
                "torch_dtype": "bfloat16",
                "max_position_embeddings": 8192,
            })
            .to_string(),
        )
        .unwrap();
    }

    struct Fixture {
        dir: tempfile::TempDir,
        options: LoadOptions,
        env: RuntimeEnv,
        args: LoaderArgs,
        factory: StaticFactory,
    }

    impl Fixture {
        fn new(arch: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            fake_checkpoint(dir.path(), arch);
            Self {
                dir,
                options: LoadOptions::default(),
                env: RuntimeEnv::empty().with_component("candle", "0.7.2"),
                args: LoaderArgs::default(),
                factory: StaticFactory {
                    logits: vec![0.5, 0.25],
                },
            }
        }

        fn ctx(&mut self, load_model: bool) -> LoaderContext<'_> {
            LoaderContext {
                key: "test-key",
                dir: self.dir.path(),
                dtype: Dtype::BF16,
                options: &mut self.options,
                load_model,
                args: &self.args,
                env: &self.env,
                factory: &self.factory,
                config: None,
                tokenizer: Some(tiny_tokenizer()),
            }
        }
    }

    #[test]
    fn test_llama_pins_tensor_parallel() {
        let mut fx = Fixture::new("LlamaForCausalLM");
        let pair = load_llama(fx.ctx(true)).unwrap();
        let model = pair.model.unwrap();
        assert_eq!(model.config().get_u64("pretraining_tp"), Some(1));
    }

    #[test]
    fn test_flash_attn_key_is_version_gated() {
        let mut fx = Fixture::new("LlamaForCausalLM");
        fx.args.use_flash_attn = Some(true);
        let pair = load_flash_attn(fx.ctx(true)).unwrap();
        let model = pair.model.unwrap();
        assert_eq!(
            model.config().get_str("_attn_implementation"),
            Some("flash_attention_2")
        );

        let mut old = Fixture::new("LlamaForCausalLM");
        old.env = RuntimeEnv::empty().with_component("candle", "0.4.0");
        old.args.use_flash_attn = Some(true);
        let pair = load_flash_attn(old.ctx(true)).unwrap();
        let model = pair.model.unwrap();
        assert!(model.config().get_str("_attn_implementation").is_none());
        assert_eq!(
            model.config().get("_flash_attn_2_enabled"),
            Some(&serde_json::json!(true))
        );
    }

    #[test]
    fn test_qwen_dtype_flags() {
        let mut fx = Fixture::new("QWenLMHeadModel");
        let pair = load_qwen_chat(fx.ctx(true)).unwrap();
        let config = pair.model.unwrap();
        let config = config.config();
        assert_eq!(config.get("bf16"), Some(&serde_json::json!(true)));
        assert_eq!(config.get("fp16"), Some(&serde_json::json!(false)));
        assert_eq!(config.get("fp32"), Some(&serde_json::json!(false)));
        assert_eq!(config.get("use_flash_attn"), Some(&serde_json::json!("auto")));
    }

    #[test]
    fn test_qwen_base_eos_fix() {
        let mut fx = Fixture::new("QWenLMHeadModel");
        let pair = load_qwen_base(fx.ctx(false)).unwrap();
        assert_eq!(pair.tokenizer.eos_token(), Some("<|endoftext|>"));
    }

    #[test]
    fn test_qwen2_forces_im_end() {
        let mut fx = Fixture::new("Qwen2ForCausalLM");
        let pair = load_qwen2(fx.ctx(false)).unwrap();
        assert_eq!(pair.tokenizer.eos_token(), Some("<|im_end|>"));
    }

    #[test]
    fn test_chatglm_skips_output_layer() {
        let mut fx = Fixture::new("ChatGLMModel");
        fx.options.quantization = Some(QuantizationConfig::bnb_8bit());
        let _ = load_chatglm(fx.ctx(false)).unwrap();
        match &fx.options.quantization {
            Some(QuantizationConfig::BitsAndBytes { skip_modules, .. }) => {
                assert_eq!(skip_modules, &["output_layer".to_string()]);
            }
            other => panic!("unexpected quantization: {other:?}"),
        }
    }

    #[test]
    fn test_baichuan2_patch_and_default() {
        let mut fx = Fixture::new("BaichuanForCausalLM");
        let pair = load_baichuan2(fx.ctx(true)).unwrap();
        let model = pair.model.unwrap();
        assert_eq!(model.config().get_u64("z_loss_weight"), Some(0));
        assert_eq!(model.patches(), &[PatchId::LmHeadFullPrecision]);
    }

    #[test]
    fn test_baichuan2_quantized_drops_caller_config() {
        let mut fx = Fixture::new("BaichuanForCausalLM");
        fx.options.quantization = Some(QuantizationConfig::bnb_4bit(None));
        let pair = load_baichuan2_quantized(fx.ctx(true)).unwrap();
        assert!(fx.options.quantization.is_none());
        assert_eq!(
            pair.model.unwrap().quantization(),
            Some(QuantMarker::BitsAndBytes)
        );
    }
}
