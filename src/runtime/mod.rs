//! Seam to the model runtime.
//!
//! The resolution pipeline never touches tensor math directly; it builds a
//! [`ModelBackend`] through a [`BackendFactory`] and hands the boxed backend
//! to the model wrapper. The default factory constructs candle models for
//! the architectures the runtime ships; tests plug in their own factory.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::llama::{Cache as LlamaCache, Config as LlamaRunConfig, Llama, LlamaConfig};
use candle_transformers::models::mistral;
use candle_transformers::models::qwen2;
use serde_json::Value;

use crate::config::LoadOptions;
use crate::error::{LoaderError, Result};
use crate::model::{Architecture, ModelConfigData};
use crate::types::{AttnImplementation, DeviceSpec, Dtype};

/// One loaded model as the runtime sees it: a stateful forward pass over
/// token tensors. Sampling, patching and adapter routing all live above
/// this trait.
pub trait ModelBackend: Send {
    /// Run the forward pass for `input` starting at `index_pos` and return
    /// the logits for the last position.
    fn forward(&mut self, input: &Tensor, index_pos: usize) -> candle_core::Result<Tensor>;

    /// Drop any cached attention state.
    fn reset(&mut self);
}

/// Everything a factory needs to construct a backend.
pub struct BackendRequest<'a> {
    pub key: &'a str,
    pub arch: &'a Architecture,
    pub dir: &'a Path,
    pub config: &'a ModelConfigData,
    pub dtype: Dtype,
    pub device: &'a Device,
    pub options: &'a LoadOptions,
}

/// Constructs backends. The pipeline owns one of these behind `Arc`.
pub trait BackendFactory: Send + Sync {
    fn build(&self, request: &BackendRequest<'_>) -> Result<Box<dyn ModelBackend>>;
}

/// Map a device request onto an actual device.
pub fn select_device(spec: DeviceSpec) -> Result<Device> {
    let device = match spec {
        DeviceSpec::Auto => Device::cuda_if_available(0)?,
        DeviceSpec::Cpu => Device::Cpu,
        DeviceSpec::Cuda(ordinal) => Device::new_cuda(ordinal)?,
    };
    Ok(device)
}

/// Collect the safetensors shards of a checkpoint, honoring the sharded
/// index file when present.
pub fn weight_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let index = dir.join("model.safetensors.index.json");
    if index.is_file() {
        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&index)?)?;
        let map = raw
            .get("weight_map")
            .and_then(Value::as_object)
            .ok_or_else(|| LoaderError::invalid_checkpoint(dir, "malformed safetensors index"))?;
        let shards: BTreeSet<&str> = map.values().filter_map(Value::as_str).collect();
        return Ok(shards.iter().map(|s| dir.join(s)).collect());
    }
    let single = dir.join("model.safetensors");
    if single.is_file() {
        return Ok(vec![single]);
    }
    Err(LoaderError::invalid_checkpoint(dir, "no safetensors weights found"))
}

/// Default factory over the candle model implementations.
#[derive(Debug, Default)]
pub struct CandleFactory;

enum CandleArch {
    Llama {
        model: Llama,
        cache: LlamaCache,
        config: LlamaRunConfig,
        dtype: Dtype,
        device: Device,
    },
    Mistral(mistral::Model),
    Qwen2(qwen2::ModelForCausalLM),
}

/// Candle-backed [`ModelBackend`].
pub struct CandleBackend {
    arch: CandleArch,
}

impl BackendFactory for CandleFactory {
    fn build(&self, req: &BackendRequest<'_>) -> Result<Box<dyn ModelBackend>> {
        let files = weight_files(req.dir)?;
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&files, req.dtype.to_dtype(), req.device)?
        };
        let use_flash_attn = wants_flash_attn(req.config, req.options);

        let arch = match req.arch {
            Architecture::Llama => {
                let cfg: LlamaConfig = serde_json::from_value(req.config.to_value())?;
                let cfg = cfg.into_config(use_flash_attn);
                let cache = LlamaCache::new(true, req.dtype.to_dtype(), &cfg, req.device)?;
                let model = Llama::load(vb, &cfg)?;
                CandleArch::Llama {
                    model,
                    cache,
                    config: cfg,
                    dtype: req.dtype,
                    device: req.device.clone(),
                }
            }
            Architecture::Mistral => {
                let cfg: mistral::Config = serde_json::from_value(req.config.to_value())?;
                CandleArch::Mistral(mistral::Model::new(&cfg, vb)?)
            }
            Architecture::Qwen2 => {
                let cfg: qwen2::Config = serde_json::from_value(req.config.to_value())?;
                CandleArch::Qwen2(qwen2::ModelForCausalLM::new(&cfg, vb)?)
            }
            other => {
                return Err(LoaderError::LoaderIncompatible {
                    key: req.key.to_string(),
                    reason: format!("architecture {other:?} has no runtime implementation"),
                })
            }
        };
        Ok(Box::new(CandleBackend { arch }))
    }
}

fn wants_flash_attn(config: &ModelConfigData, options: &LoadOptions) -> bool {
    if !cfg!(feature = "flash-attn") {
        return false;
    }
    match options.attn_implementation {
        AttnImplementation::FlashAttention2 => true,
        AttnImplementation::Eager => false,
        AttnImplementation::Auto => {
            config.get_str("_attn_implementation") == Some("flash_attention_2")
                || config.get("_flash_attn_2_enabled").and_then(Value::as_bool) == Some(true)
        }
    }
}

impl ModelBackend for CandleBackend {
    fn forward(&mut self, input: &Tensor, index_pos: usize) -> candle_core::Result<Tensor> {
        match &mut self.arch {
            CandleArch::Llama { model, cache, .. } => model.forward(input, index_pos, cache),
            CandleArch::Mistral(model) => model.forward(input, index_pos),
            CandleArch::Qwen2(model) => model.forward(input, index_pos),
        }
    }

    fn reset(&mut self) {
        match &mut self.arch {
            CandleArch::Llama {
                cache,
                config,
                dtype,
                device,
                ..
            } => {
                // The llama cache has no clear call; rebuild it.
                if let Ok(fresh) = LlamaCache::new(true, dtype.to_dtype(), config, device) {
                    *cache = fresh;
                }
            }
            CandleArch::Mistral(model) => model.clear_kv_cache(),
            CandleArch::Qwen2(model) => model.clear_kv_cache(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_weight_files_prefers_index() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("model.safetensors.index.json"),
            r#"{"weight_map": {"a.weight": "model-00001-of-00002.safetensors",
                               "b.weight": "model-00002-of-00002.safetensors",
                               "c.weight": "model-00001-of-00002.safetensors"}}"#,
        )
        .unwrap();
        let files = weight_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("model-00001-of-00002.safetensors"));
    }

    #[test]
    fn test_weight_files_single_shard() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("model.safetensors"), b"").unwrap();
        let files = weight_files(dir.path()).unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_weight_files_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(weight_files(dir.path()).is_err());
    }

    #[test]
    fn test_select_cpu_device() {
        let device = select_device(DeviceSpec::Cpu).unwrap();
        assert!(device.is_cpu());
    }

    #[test]
    fn test_static_backend_counts_calls() {
        use testing::StaticBackend;

        let mut backend = StaticBackend::new(vec![0.0, 1.0, 0.5]);
        let device = Device::Cpu;
        let input = Tensor::new(&[1u32, 2], &device).unwrap();
        backend.forward(&input, 0).unwrap();
        backend.forward(&input, 1).unwrap();
        assert_eq!(backend.forward_calls, 2);
    }
}
