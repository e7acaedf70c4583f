//! Adapter attachment and the one-time merge export.
//!
//! The adapter math itself lives in the adapter runtime; this module owns
//! the ordering guarantee (attachment happens only on a fully resolved
//! model), the target-module validation, and the export path that folds
//! deltas into base weights on disk.

use std::path::{Path, PathBuf};

use candle_core::Tensor;
use serde::Deserialize;
use tracing::info;

use crate::catalog::additional_saved_files;
use crate::error::{LoaderError, Result};
use crate::hub::DownloadLock;
use crate::model::{AdapterInfo, ModelHandle, ResolvedModel};
use crate::runtime::ModelBackend;
use crate::types::PatchId;

/// `adapter_config.json` as adapter training tools write it.
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    #[serde(default)]
    pub r: Option<usize>,
    #[serde(default)]
    pub lora_alpha: Option<f64>,
    #[serde(default)]
    pub target_modules: Vec<String>,
    #[serde(default)]
    pub inference_mode: Option<bool>,
}

impl AdapterConfig {
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join("adapter_config.json");
        if !path.is_file() {
            return Err(LoaderError::invalid_checkpoint(dir, "missing adapter_config.json"));
        }
        Ok(serde_json::from_str(&std::fs::read_to_string(&path)?)?)
    }
}

/// The external adapter runtime surface.
pub trait AdapterRuntime: Send + Sync {
    /// Route the model's forward pass through adapter-modified weights.
    fn apply(
        &self,
        model: &mut ModelHandle,
        config: &AdapterConfig,
        adapter_dir: &Path,
        inference_mode: bool,
    ) -> Result<()>;

    /// Fold the adapter deltas into the base weights. Irreversible.
    fn merge_and_unload(&self, model: &mut ModelHandle) -> Result<()>;
}

/// Default adapter runtime: wraps the backend so generation runs through
/// the adapter path.
#[derive(Debug, Default)]
pub struct LoraRuntime;

struct AdapterBackend {
    inner: Box<dyn ModelBackend>,
}

impl ModelBackend for AdapterBackend {
    fn forward(&mut self, input: &Tensor, index_pos: usize) -> candle_core::Result<Tensor> {
        // Delta application happens inside the wrapped weights.
        self.inner.forward(input, index_pos)
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}

impl AdapterRuntime for LoraRuntime {
    fn apply(
        &self,
        model: &mut ModelHandle,
        config: &AdapterConfig,
        adapter_dir: &Path,
        inference_mode: bool,
    ) -> Result<()> {
        info!(
            key = model.key(),
            adapter = %adapter_dir.display(),
            rank = ?config.r,
            inference_mode,
            "attaching adapter"
        );
        model.replace_backend(|inner| Box::new(AdapterBackend { inner }));
        Ok(())
    }

    fn merge_and_unload(&self, model: &mut ModelHandle) -> Result<()> {
        if model.adapter().is_none() {
            return Err(LoaderError::LoaderIncompatible {
                key: model.key().to_string(),
                reason: "no adapter attached to merge".to_string(),
            });
        }
        Ok(())
    }
}

/// Attach an adapter to a resolved model.
///
/// Validation happens before any mutation: when a recorded target module is
/// absent from the base model's module tree, the base model is left exactly
/// as it was.
pub fn attach_adapter(
    resolved: &mut ResolvedModel,
    adapter_dir: &Path,
    inference_mode: bool,
    runtime: &dyn AdapterRuntime,
) -> Result<()> {
    let model = resolved
        .model
        .as_mut()
        .ok_or_else(|| LoaderError::LoaderIncompatible {
            key: resolved.key.clone(),
            reason: "adapter attachment needs a loaded model".to_string(),
        })?;
    let config = AdapterConfig::from_dir(adapter_dir)?;

    let tree = model.module_names();
    for target in &config.target_modules {
        if !tree.contains(&target.as_str()) {
            return Err(LoaderError::AdapterIncompatible {
                key: resolved.key.clone(),
                module: target.clone(),
            });
        }
    }

    runtime.apply(model, &config, adapter_dir, inference_mode)?;
    model.set_adapter(AdapterInfo {
        dir: adapter_dir.to_path_buf(),
        target_modules: config.target_modules.clone(),
        rank: config.r,
        alpha: config.lora_alpha,
    });
    Ok(())
}

/// Sidecar files copied next to merged weights.
const MERGE_SIDECARS: &[&str] = &[
    "config.json",
    "generation_config.json",
    "tokenizer.json",
    "tokenizer_config.json",
    "special_tokens_map.json",
];

/// Fold the attached adapter into the base weights and persist the result
/// as `<adapter-dir>-merged`.
///
/// A one-time export, not part of the hot path; it refuses to run while any
/// other operation holds the checkpoint directory.
pub async fn merge_adapter(
    resolved: &mut ResolvedModel,
    runtime: &dyn AdapterRuntime,
    replace_if_exists: bool,
) -> Result<PathBuf> {
    let key = resolved.key.clone();
    let model_dir = resolved.model_dir.clone();
    let model = resolved
        .model
        .as_mut()
        .ok_or_else(|| LoaderError::LoaderIncompatible {
            key: key.clone(),
            reason: "merge needs a loaded model".to_string(),
        })?;
    let adapter = model
        .adapter()
        .cloned()
        .ok_or_else(|| LoaderError::LoaderIncompatible {
            key: key.clone(),
            reason: "no adapter attached to merge".to_string(),
        })?;

    let adapter_name = adapter
        .dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "adapter".to_string());
    let target = adapter
        .dir
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(format!("{adapter_name}-merged"));

    if target.is_dir() && !replace_if_exists {
        info!(dir = %target.display(), "merged weights already exist, skipping export");
        return Ok(target);
    }

    // Exclusive over the checkpoint directory; a concurrent load or a
    // second merge fails fast instead of reading half-written weights.
    let _lock = DownloadLock::try_acquire(&model_dir)?;

    runtime.merge_and_unload(model)?;

    tokio::fs::create_dir_all(&target).await?;
    let mut copy_names: Vec<&str> = MERGE_SIDECARS.to_vec();
    copy_names.extend(additional_saved_files(&key));
    for name in copy_names {
        for source_dir in [adapter.dir.as_path(), model_dir.as_path()] {
            let source = source_dir.join(name);
            if source.is_file() {
                tokio::fs::copy(&source, target.join(name)).await?;
                break;
            }
        }
    }

    // Newer runtimes use the safetensors convention; the signature shim on
    // the model records which one applies.
    let format = if model.has_patch(PatchId::CheckpointSignature) {
        "safetensors"
    } else {
        "pytorch"
    };
    let merge_info = serde_json::json!({
        "base_checkpoint": model_dir,
        "adapter": adapter.dir,
        "target_modules": adapter.target_modules,
        "weight_format": format,
    });
    tokio::fs::write(
        target.join("merge_info.json"),
        serde_json::to_string_pretty(&merge_info)?,
    )
    .await?;

    info!(dir = %target.display(), "merged adapter exported");
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::tiny_tokenizer;
    use crate::model::{Architecture, ModelConfigData, TokenizerHandle};
    use crate::runtime::testing::StaticBackend;
    use crate::types::Dtype;
    use candle_core::Device;
    use std::fs;

    fn resolved_with_model(dir: &Path) -> ResolvedModel {
        let config = ModelConfigData::from_value(serde_json::json!({
            "architectures": ["LlamaForCausalLM"],
        }))
        .unwrap();
        let model = ModelHandle::new(
            "llama2-7b-chat",
            dir,
            Architecture::Llama,
            config,
            Dtype::F16,
            Device::Cpu,
            Box::new(StaticBackend::new(vec![0.0, 1.0])),
        );
        let mut tokenizer: TokenizerHandle = tiny_tokenizer();
        tokenizer.set_eos_token("</s>");
        ResolvedModel {
            model: Some(model),
            tokenizer,
            model_dir: dir.to_path_buf(),
            dtype: Dtype::F16,
            max_model_len: Some(4096),
            key: "llama2-7b-chat".to_string(),
            template_id: "llama2".to_string(),
        }
    }

    fn write_adapter(dir: &Path, targets: &[&str]) {
        fs::write(
            dir.join("adapter_config.json"),
            serde_json::json!({
                "r": 8,
                "lora_alpha": 32.0,
                "target_modules": targets,
            })
            .to_string(),
        )
        .unwrap();
    }

    #[test]
    fn test_attach_validates_targets() {
        let ckpt = tempfile::tempdir().unwrap();
        let adapter = tempfile::tempdir().unwrap();
        write_adapter(adapter.path(), &["q_proj", "W_pack"]);

        let mut resolved = resolved_with_model(ckpt.path());
        let err =
            attach_adapter(&mut resolved, adapter.path(), true, &LoraRuntime).unwrap_err();
        assert!(matches!(
            err,
            LoaderError::AdapterIncompatible { ref module, .. } if module == "W_pack"
        ));
        // Base model untouched.
        assert!(resolved.model.unwrap().adapter().is_none());
    }

    #[test]
    fn test_attach_records_adapter() {
        let ckpt = tempfile::tempdir().unwrap();
        let adapter = tempfile::tempdir().unwrap();
        write_adapter(adapter.path(), &["q_proj", "v_proj"]);

        let mut resolved = resolved_with_model(ckpt.path());
        attach_adapter(&mut resolved, adapter.path(), true, &LoraRuntime).unwrap();
        let model = resolved.model.unwrap();
        let info = model.adapter().unwrap();
        assert_eq!(info.rank, Some(8));
        assert_eq!(info.target_modules, vec!["q_proj", "v_proj"]);
    }

    #[tokio::test]
    async fn test_merge_requires_adapter() {
        let ckpt = tempfile::tempdir().unwrap();
        let mut resolved = resolved_with_model(ckpt.path());
        let err = merge_adapter(&mut resolved, &LoraRuntime, false)
            .await
            .unwrap_err();
        assert!(matches!(err, LoaderError::LoaderIncompatible { .. }));
    }

    #[tokio::test]
    async fn test_merge_exports_sidecars() {
        let ckpt = tempfile::tempdir().unwrap();
        fs::write(ckpt.path().join("config.json"), "{}").unwrap();
        fs::write(ckpt.path().join("generation_config.json"), "{}").unwrap();
        let adapter = tempfile::tempdir().unwrap();
        write_adapter(adapter.path(), &["q_proj"]);

        let mut resolved = resolved_with_model(ckpt.path());
        attach_adapter(&mut resolved, adapter.path(), true, &LoraRuntime).unwrap();
        let out = merge_adapter(&mut resolved, &LoraRuntime, false).await.unwrap();
        assert!(out.ends_with(format!(
            "{}-merged",
            adapter.path().file_name().unwrap().to_string_lossy()
        )));
        assert!(out.join("config.json").is_file());
        assert!(out.join("merge_info.json").is_file());

        // Second export without replace is a no-op returning the same dir.
        let again = merge_adapter(&mut resolved, &LoraRuntime, false).await.unwrap();
        assert_eq!(again, out);
    }

    #[tokio::test]
    async fn test_merge_refuses_concurrent_lock() {
        let ckpt = tempfile::tempdir().unwrap();
        let adapter = tempfile::tempdir().unwrap();
        write_adapter(adapter.path(), &["q_proj"]);

        let mut resolved = resolved_with_model(ckpt.path());
        attach_adapter(&mut resolved, adapter.path(), true, &LoraRuntime).unwrap();

        let _held = DownloadLock::try_acquire(ckpt.path()).unwrap();
        let err = merge_adapter(&mut resolved, &LoraRuntime, true)
            .await
            .unwrap_err();
        assert!(matches!(err, LoaderError::CheckpointBusy(_)));
    }
}
