//! Model catalog: the process-wide table mapping a model-type key to its
//! checkpoint locations, loader binding and declared constraints.
//!
//! The catalog is an explicit, injectable object. The builtin table is
//! registered once at startup and read-only afterwards; tests build their
//! own instances instead of mutating the shared one.

use std::collections::HashMap;
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{LoaderError, Result};
use crate::loaders::{LoaderArgs, LoaderKey};
use crate::requirements::Requirement;
use crate::types::Dtype;

mod builtin;

/// Declarative capability facts about one catalog entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub flash_attn: bool,
    /// Usable from the high-throughput batched serving backend.
    pub batched_serving: bool,
    pub gradient_checkpointing: bool,
    /// Modality and domain tags (`vision`, `audio`, `coding`, ...).
    pub tags: Vec<String>,
}

/// One registered model type.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub key: String,
    /// Repository id on the primary hub.
    pub hub_id: Option<String>,
    /// Repository id on the alternate registry, when it differs.
    pub mirror_id: Option<String>,
    /// Module patterns adapter training targets by default.
    pub adapter_targets: Vec<String>,
    /// Prompt-template id, opaque to this crate.
    pub template_id: String,
    pub loader: LoaderKey,
    pub loader_args: LoaderArgs,
    pub requirements: Vec<Requirement>,
    /// When set, a caller-requested precision must match exactly.
    pub declared_dtype: Option<Dtype>,
    /// File patterns excluded when materializing the checkpoint.
    pub ignore_patterns: Vec<String>,
    /// Default revision on the hub.
    pub revision: String,
    /// Forces the tokenizer eos after load.
    pub eos_override: Option<String>,
    pub caps: Capabilities,
}

impl CatalogEntry {
    pub fn new(key: impl Into<String>, loader: LoaderKey) -> Self {
        Self {
            key: key.into(),
            hub_id: None,
            mirror_id: None,
            adapter_targets: Vec::new(),
            template_id: "default".to_string(),
            loader,
            loader_args: LoaderArgs::default(),
            requirements: Vec::new(),
            declared_dtype: None,
            ignore_patterns: Vec::new(),
            revision: "main".to_string(),
            eos_override: None,
            caps: Capabilities {
                gradient_checkpointing: true,
                ..Capabilities::default()
            },
        }
    }

    pub fn hub(mut self, id: &str) -> Self {
        self.hub_id = Some(id.to_string());
        self
    }

    pub fn mirror(mut self, id: &str) -> Self {
        self.mirror_id = Some(id.to_string());
        self
    }

    pub fn adapter_targets(mut self, targets: &[&str]) -> Self {
        self.adapter_targets = targets.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn template(mut self, id: &str) -> Self {
        self.template_id = id.to_string();
        self
    }

    pub fn args(mut self, args: LoaderArgs) -> Self {
        self.loader_args = args;
        self
    }

    /// Add a dependency constraint. Invalid constraint strings are dropped
    /// with a log line; the builtin table is covered by a test that would
    /// catch one.
    pub fn requires(mut self, constraint: &str) -> Self {
        match Requirement::parse(constraint) {
            Some(req) => self.requirements.push(req),
            None => debug!(key = %self.key, constraint, "ignoring unparseable requirement"),
        }
        self
    }

    pub fn dtype(mut self, dtype: Dtype) -> Self {
        self.declared_dtype = Some(dtype);
        self
    }

    pub fn ignore(mut self, pattern: &str) -> Self {
        self.ignore_patterns.push(pattern.to_string());
        self
    }

    pub fn revision(mut self, rev: &str) -> Self {
        self.revision = rev.to_string();
        self
    }

    pub fn eos(mut self, token: &str) -> Self {
        self.eos_override = Some(token.to_string());
        self
    }

    pub fn flash_attn(mut self) -> Self {
        self.caps.flash_attn = true;
        self
    }

    pub fn serving(mut self) -> Self {
        self.caps.batched_serving = true;
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.caps.tags.push(tag.to_string());
        self
    }

    /// The repository id used by the given provider side, falling back to
    /// the other side's id when only one is declared.
    pub fn location(&self, mirror: bool) -> Option<&str> {
        if mirror {
            self.mirror_id.as_deref().or(self.hub_id.as_deref())
        } else {
            self.hub_id.as_deref().or(self.mirror_id.as_deref())
        }
    }
}

/// Associates a list of entries with the one loader they share, making the
/// many-keys-to-one-loader mapping inspectable.
pub struct FamilyRegistration {
    loader: LoaderKey,
    entries: Vec<CatalogEntry>,
}

impl FamilyRegistration {
    pub fn new(loader: LoaderKey) -> Self {
        Self {
            loader,
            entries: Vec::new(),
        }
    }

    /// Add an entry; its loader is forced to the family's.
    pub fn entry(mut self, mut entry: CatalogEntry) -> Self {
        entry.loader = self.loader;
        self.entries.push(entry);
        self
    }

    pub fn install(self, catalog: &ModelCatalog) -> Result<()> {
        for entry in self.entries {
            catalog.register(entry)?;
        }
        Ok(())
    }
}

/// The registry itself.
pub struct ModelCatalog {
    entries: RwLock<HashMap<String, CatalogEntry>>,
}

impl ModelCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// A catalog pre-populated with every known model type.
    pub fn builtin() -> Self {
        let catalog = Self::new();
        builtin::install(&catalog).expect("builtin catalog registers without duplicates");
        catalog
    }

    /// Register an entry. Fails on a duplicate key.
    pub fn register(&self, entry: CatalogEntry) -> Result<()> {
        self.register_with(entry, false)
    }

    /// Register an entry, optionally replacing an existing key
    /// (last write wins).
    pub fn register_with(&self, entry: CatalogEntry, allow_override: bool) -> Result<()> {
        let mut entries = self.entries.write();
        if !allow_override && entries.contains_key(&entry.key) {
            return Err(LoaderError::DuplicateKey(entry.key));
        }
        entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<CatalogEntry> {
        self.entries.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Default prompt-template id for a key.
    pub fn default_template_id(&self, key: &str) -> Option<String> {
        self.get(key).map(|e| e.template_id)
    }

    /// Default adapter target modules for a key.
    pub fn default_adapter_targets(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).map(|e| e.adapter_targets)
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Family-specific sidecar files the export path must carry along.
pub fn additional_saved_files(key: &str) -> &'static [&'static str] {
    if key.contains("qwen-vl") {
        &["SimSun.ttf"]
    } else if key.contains("qwen-audio") {
        &["mel_filters.npz"]
    } else if key.contains("yi-vl") {
        &["vit"]
    } else {
        &[]
    }
}

lazy_static! {
    static ref DEFAULT_CATALOG: Arc<ModelCatalog> = Arc::new(ModelCatalog::builtin());
}

/// The process-wide default catalog, built once on first use.
pub fn default_catalog() -> Arc<ModelCatalog> {
    DEFAULT_CATALOG.clone()
}
