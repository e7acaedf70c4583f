//! The resolution pipeline.
//!
//! `key -> ResolvedModel`, in order: catalog lookup, constraint check,
//! checkpoint materialization, precision determination, loader invocation,
//! universal post-load fixups. Each step can fail; nothing escapes half
//! built.

use std::sync::Arc;

use tracing::{info, warn};

use crate::catalog::{default_catalog, CatalogEntry, ModelCatalog};
use crate::config::{GenerationConfig, LoadOptions, QuantizationConfig};
use crate::error::{LoaderError, Result};
use crate::hub::{self, CheckpointProvider, HubConfig};
use crate::loaders::{self, LoaderContext};
use crate::model::{ModelConfigData, ModelHandle, ResolvedModel, TokenizerHandle};
use crate::requirements::RuntimeEnv;
use crate::runtime::{BackendFactory, CandleFactory};
use crate::types::Dtype;

/// One resolution call's inputs.
pub struct ResolveRequest {
    pub key: String,
    /// Requested precision; `None` defers to the catalog and the checkpoint.
    pub dtype: Option<Dtype>,
    /// `false` resolves the tokenizer only.
    pub load_model: bool,
    /// Explicit local path or repository id, overriding the catalog default.
    pub location: Option<String>,
    pub revision: Option<String>,
    /// Caller cap on the context length. Must not exceed the model's own
    /// declared limit.
    pub max_length: Option<usize>,
    pub options: LoadOptions,
    /// Injected tokenizer instance, skipping the on-disk one.
    pub tokenizer: Option<TokenizerHandle>,
    /// Injected model configuration, skipping `config.json`.
    pub config: Option<ModelConfigData>,
}

impl ResolveRequest {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            dtype: None,
            load_model: true,
            location: None,
            revision: None,
            max_length: None,
            options: LoadOptions::inference(),
            tokenizer: None,
            config: None,
        }
    }

    pub fn tokenizer_only(mut self) -> Self {
        self.load_model = false;
        self
    }

    pub fn dtype(mut self, dtype: Dtype) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn max_length(mut self, len: usize) -> Self {
        self.max_length = Some(len);
        self
    }

    pub fn options(mut self, options: LoadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_tokenizer(mut self, tokenizer: TokenizerHandle) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }
}

/// Builder for [`Resolver`].
pub struct ResolverBuilder {
    catalog: Option<Arc<ModelCatalog>>,
    env: Option<RuntimeEnv>,
    factory: Option<Arc<dyn BackendFactory>>,
    hub: Option<HubConfig>,
    provider: Option<Arc<dyn CheckpointProvider>>,
}

impl ResolverBuilder {
    pub fn new() -> Self {
        Self {
            catalog: None,
            env: None,
            factory: None,
            hub: None,
            provider: None,
        }
    }

    pub fn with_catalog(mut self, catalog: Arc<ModelCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_env(mut self, env: RuntimeEnv) -> Self {
        self.env = Some(env);
        self
    }

    pub fn with_factory(mut self, factory: Arc<dyn BackendFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_hub(mut self, hub: HubConfig) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Pin the checkpoint provider instead of reading the environment
    /// toggle per call.
    pub fn with_provider(mut self, provider: Arc<dyn CheckpointProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn build(self) -> Resolver {
        Resolver {
            catalog: self.catalog.unwrap_or_else(default_catalog),
            env: self.env.unwrap_or_else(RuntimeEnv::detect),
            factory: self.factory.unwrap_or_else(|| Arc::new(CandleFactory)),
            hub: self.hub.unwrap_or_default(),
            provider: self.provider,
        }
    }
}

impl Default for ResolverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs resolutions against one catalog. Holds the catalog read-only; every
/// call produces a fresh [`ResolvedModel`] owned by the caller, and nothing
/// is cached here.
pub struct Resolver {
    catalog: Arc<ModelCatalog>,
    env: RuntimeEnv,
    factory: Arc<dyn BackendFactory>,
    hub: HubConfig,
    provider: Option<Arc<dyn CheckpointProvider>>,
}

impl Resolver {
    /// Resolver over the builtin catalog with the default runtime.
    pub fn new() -> Self {
        ResolverBuilder::new().build()
    }

    pub fn builder() -> ResolverBuilder {
        ResolverBuilder::new()
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Resolve with per-call defaults.
    pub async fn resolve_key(&self, key: &str) -> Result<ResolvedModel> {
        self.resolve(ResolveRequest::new(key)).await
    }

    /// Run the full pipeline for one request.
    pub async fn resolve(&self, request: ResolveRequest) -> Result<ResolvedModel> {
        // Lookup precedes any filesystem or network access.
        let entry = self
            .catalog
            .get(&request.key)
            .ok_or_else(|| LoaderError::UnknownModel(request.key.clone()))?;

        // Constraints fail before a byte is downloaded.
        for requirement in &entry.requirements {
            self.env.check(&entry.key, requirement)?;
        }

        let model_dir = hub::materialize(
            &entry,
            request.location.as_deref(),
            request.revision.as_deref(),
            &self.hub,
            self.provider.as_deref(),
        )
        .await?;

        let config = match request.config {
            Some(config) => config,
            None => ModelConfigData::from_dir(&model_dir)?,
        };

        let mut options = request.options;
        let dtype = determine_dtype(&entry, &config, request.dtype, &mut options)?;

        let loaded = loaders::dispatch(
            entry.loader,
            LoaderContext {
                key: &entry.key,
                dir: &model_dir,
                dtype,
                options: &mut options,
                load_model: request.load_model,
                args: &entry.loader_args,
                env: &self.env,
                factory: self.factory.as_ref(),
                config: Some(config.clone()),
                tokenizer: request.tokenizer,
            },
        )?;
        let mut model = loaded.model;
        let mut tokenizer = loaded.tokenizer;

        let max_model_len = self.apply_fixups(
            &entry,
            &config,
            &model_dir,
            request.max_length,
            &mut model,
            &mut tokenizer,
        )?;

        Ok(ResolvedModel {
            model,
            tokenizer,
            model_dir,
            dtype,
            max_model_len,
            key: entry.key.clone(),
            template_id: entry.template_id.clone(),
        })
    }

    /// The post-load fixups every family gets.
    fn apply_fixups(
        &self,
        entry: &CatalogEntry,
        config: &ModelConfigData,
        model_dir: &std::path::Path,
        requested_max_length: Option<usize>,
        model: &mut Option<ModelHandle>,
        tokenizer: &mut TokenizerHandle,
    ) -> Result<Option<usize>> {
        // Context-length discovery, then the caller override check.
        let mut max_model_len = config.max_model_len();
        if let Some(requested) = requested_max_length {
            if let Some(limit) = max_model_len {
                if requested > limit {
                    return Err(LoaderError::ContextLengthExceeded {
                        requested,
                        supported: limit,
                    });
                }
            }
            max_model_len = Some(requested);
        }
        if let Some(m) = model.as_mut() {
            m.set_max_model_len(max_model_len);
            info!(key = %entry.key, max_model_len = ?max_model_len, "context limit resolved");
        }

        // Structural shims for the hosting runtime version.
        if let Some(m) = model.as_mut() {
            loaders::patches::apply_runtime_shims(&self.env, m);
        }

        // End-of-sequence reconciliation; pad defaults to eos.
        if let Some(eos) = &entry.eos_override {
            tokenizer.set_eos_token(eos);
        }
        let eos = tokenizer
            .eos_token()
            .map(str::to_string)
            .ok_or_else(|| LoaderError::MissingEos(entry.key.clone()))?;
        if tokenizer.pad_token().is_none() {
            tokenizer.set_pad_token(&eos);
        }
        tokenizer.attach_origin(&entry.key, model_dir);

        // Generation-config sidecar plus the legacy sampling fix.
        if let Some(m) = model.as_mut() {
            if m.generation_config.is_none() {
                m.generation_config = GenerationConfig::from_dir(model_dir)?;
            }
            if let Some(generation) = m.generation_config.as_mut() {
                if generation.reconcile_sampling() {
                    warn!(key = %entry.key, "sampling temperature set while do_sample was off, enabling sampling");
                }
            }
        }

        Ok(max_model_len)
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Precision selection.
///
/// A catalog-declared dtype is binding. Otherwise the caller's choice wins,
/// and absent both the checkpoint's own declaration is used, with full f32
/// downgraded to f16 as the default space/throughput trade-off.
fn determine_dtype(
    entry: &CatalogEntry,
    config: &ModelConfigData,
    requested: Option<Dtype>,
    options: &mut LoadOptions,
) -> Result<Dtype> {
    if let Some(declared) = entry.declared_dtype {
        if let Some(requested) = requested {
            if requested != declared {
                return Err(LoaderError::PrecisionMismatch {
                    key: entry.key.clone(),
                    declared,
                    requested,
                });
            }
        }
        return Ok(declared);
    }
    if let Some(requested) = requested {
        return Ok(requested);
    }

    let inspected = config.torch_dtype().unwrap_or(Dtype::F32);
    let resolved = if inspected == Dtype::F32 {
        warn!(key = %entry.key, "checkpoint declares f32, defaulting to f16");
        Dtype::F16
    } else {
        inspected
    };
    // A bits-and-bytes config without a compute dtype follows the resolved
    // one.
    if let Some(QuantizationConfig::BitsAndBytes { compute_dtype, .. }) = &mut options.quantization
    {
        if compute_dtype.is_none() {
            info!(key = %entry.key, dtype = %resolved, "defaulting quantization compute dtype");
            *compute_dtype = Some(resolved);
        }
    }
    Ok(resolved)
}
