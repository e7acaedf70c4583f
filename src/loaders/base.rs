//! Shared repository loader every family builds on.

use tracing::{debug, info};

use crate::config::QuantizationConfig;
use crate::error::{LoaderError, Result};
use crate::model::{Architecture, ModelConfigData, ModelHandle, QuantMarker, TokenizerHandle};
use crate::runtime::{select_device, BackendRequest};
use crate::types::PatchId;

use super::{LoadedPair, LoaderContext};

/// Take the configuration out of the context, reading it from the
/// checkpoint when the caller did not supply one.
pub(crate) fn take_config(ctx: &mut LoaderContext<'_>) -> Result<ModelConfigData> {
    match ctx.config.take() {
        Some(config) => Ok(config),
        None => ModelConfigData::from_dir(ctx.dir),
    }
}

/// Load tokenizer and (optionally) model straight from the checkpoint
/// directory, applying the quantization wiring the bound arguments ask for.
pub(crate) fn load_repo(mut ctx: LoaderContext<'_>) -> Result<LoadedPair> {
    let config = take_config(&mut ctx)?;
    load_repo_with(ctx, config)
}

pub(crate) fn load_repo_with(
    mut ctx: LoaderContext<'_>,
    mut config: ModelConfigData,
) -> Result<LoadedPair> {
    check_quant_extensions(&mut ctx)?;

    config.set_torch_dtype(ctx.dtype);

    let mut tokenizer = match ctx.tokenizer.take() {
        Some(t) => t,
        None => TokenizerHandle::load(ctx.dir)?,
    };
    if let Some(eos) = &ctx.args.eos_token {
        tokenizer.set_eos_token(eos);
    }

    let model = if ctx.load_model {
        Some(build_model(&ctx, config)?)
    } else {
        debug!(key = ctx.key, "tokenizer-only resolution");
        None
    };

    Ok(LoadedPair { model, tokenizer })
}

/// Fail fast when a quantization family needs a runtime extension that is
/// not available. The checks only fire when preparing for training;
/// inference on pre-quantized weights has no extension dependency.
fn check_quant_extensions(ctx: &mut LoaderContext<'_>) -> Result<()> {
    if !ctx.options.training {
        return Ok(());
    }
    if ctx.args.awq && !ctx.env.has_extension("awq") {
        return Err(LoaderError::MissingExtension {
            key: ctx.key.to_string(),
            extension: "awq".to_string(),
        });
    }
    if ctx.args.gptq_bits > 0 {
        if !ctx.env.has_extension("gptq") {
            return Err(LoaderError::MissingExtension {
                key: ctx.key.to_string(),
                extension: "gptq".to_string(),
            });
        }
        if ctx.options.quantization.is_some() {
            return Err(LoaderError::LoaderIncompatible {
                key: ctx.key.to_string(),
                reason: "quantization config already set for a GPTQ checkpoint".to_string(),
            });
        }
        ctx.options.quantization = Some(QuantizationConfig::Gptq {
            bits: ctx.args.gptq_bits,
            exllama: false,
        });
    }
    Ok(())
}

fn build_model(ctx: &LoaderContext<'_>, config: ModelConfigData) -> Result<ModelHandle> {
    let arch = Architecture::from_config(&config);
    let device = select_device(ctx.options.device)?;
    info!(key = ctx.key, dtype = %ctx.dtype, ?arch, "loading model");

    let backend = ctx.factory.build(&BackendRequest {
        key: ctx.key,
        arch: &arch,
        dir: ctx.dir,
        config: &config,
        dtype: ctx.dtype,
        device: &device,
        options: ctx.options,
    })?;

    let mut model = ModelHandle::new(ctx.key, ctx.dir, arch, config, ctx.dtype, device, backend);

    if ctx.args.awq {
        model.set_quantization(QuantMarker::Awq);
    } else if ctx.args.gptq_bits > 0 {
        model.set_quantization(QuantMarker::Gptq {
            bits: ctx.args.gptq_bits,
        });
        if ctx.options.training {
            model.apply_patch(PatchId::GptqTrainingGuard);
        }
    } else if matches!(
        ctx.options.quantization,
        Some(QuantizationConfig::BitsAndBytes { .. })
    ) {
        model.set_quantization(QuantMarker::BitsAndBytes);
    }

    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoadOptions;
    use crate::loaders::LoaderArgs;
    use crate::model::tests::tiny_tokenizer;
    use crate::requirements::RuntimeEnv;
    use crate::runtime::testing::StaticFactory;
    use crate::types::Dtype;
    use std::fs;

    fn fake_checkpoint(dir: &std::path::Path) {
        fs::write(
            dir.join("config.json"),
            serde_json::json!({
                "architectures": ["LlamaForCausalLM"],
                "torch_dtype": "float16",
                "max_position_embeddings": 4096,
            })
            .to_string(),
        )
        .unwrap();
    }

    fn run(
        dir: &std::path::Path,
        args: &LoaderArgs,
        options: &mut LoadOptions,
        env: &RuntimeEnv,
        load_model: bool,
    ) -> Result<LoadedPair> {
        let factory = StaticFactory {
            logits: vec![0.0, 1.0],
        };
        load_repo(LoaderContext {
            key: "test-model",
            dir,
            dtype: Dtype::F16,
            options,
            load_model,
            args,
            env,
            factory: &factory,
            config: None,
            tokenizer: Some(tiny_tokenizer()),
        })
    }

    #[test]
    fn test_tokenizer_only_load() {
        let dir = tempfile::tempdir().unwrap();
        fake_checkpoint(dir.path());
        let mut options = LoadOptions::default();
        let env = RuntimeEnv::empty();
        let pair = run(dir.path(), &LoaderArgs::default(), &mut options, &env, false).unwrap();
        assert!(pair.model.is_none());
    }

    #[test]
    fn test_bound_eos_token_applies() {
        let dir = tempfile::tempdir().unwrap();
        fake_checkpoint(dir.path());
        let mut options = LoadOptions::default();
        let env = RuntimeEnv::empty();
        let args = LoaderArgs {
            eos_token: Some("</s>".to_string()),
            ..Default::default()
        };
        let pair = run(dir.path(), &args, &mut options, &env, false).unwrap();
        assert_eq!(pair.tokenizer.eos_token(), Some("</s>"));
    }

    #[test]
    fn test_awq_training_needs_extension() {
        let dir = tempfile::tempdir().unwrap();
        fake_checkpoint(dir.path());
        let mut options = LoadOptions {
            training: true,
            ..Default::default()
        };
        let env = RuntimeEnv::empty();
        let err = run(dir.path(), &LoaderArgs::awq(), &mut options, &env, false).unwrap_err();
        assert!(matches!(err, LoaderError::MissingExtension { .. }));
        assert!(err.to_string().contains("awq"));
    }

    #[test]
    fn test_awq_inference_skips_extension_check() {
        let dir = tempfile::tempdir().unwrap();
        fake_checkpoint(dir.path());
        let mut options = LoadOptions::default();
        let env = RuntimeEnv::empty();
        assert!(run(dir.path(), &LoaderArgs::awq(), &mut options, &env, false).is_ok());
    }

    #[test]
    fn test_gptq_training_wires_quant_config() {
        let dir = tempfile::tempdir().unwrap();
        fake_checkpoint(dir.path());
        let mut options = LoadOptions {
            training: true,
            ..Default::default()
        };
        let env = RuntimeEnv::empty().with_extension("gptq");
        let pair = run(dir.path(), &LoaderArgs::gptq(4), &mut options, &env, true).unwrap();
        assert_eq!(
            options.quantization,
            Some(QuantizationConfig::Gptq {
                bits: 4,
                exllama: false
            })
        );
        let model = pair.model.unwrap();
        assert!(model.has_patch(PatchId::GptqTrainingGuard));
        assert_eq!(model.quantization(), Some(QuantMarker::Gptq { bits: 4 }));
    }

    #[test]
    fn test_model_load_records_arch() {
        let dir = tempfile::tempdir().unwrap();
        fake_checkpoint(dir.path());
        let mut options = LoadOptions::default();
        let env = RuntimeEnv::empty();
        let pair = run(dir.path(), &LoaderArgs::default(), &mut options, &env, true).unwrap();
        let model = pair.model.unwrap();
        assert_eq!(*model.arch(), Architecture::Llama);
        assert_eq!(model.config().torch_dtype(), Some(Dtype::F16));
    }
}
