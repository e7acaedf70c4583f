//! Checkpoint materialization.
//!
//! Two interchangeable providers can turn a repository id into a local
//! directory; an environment toggle picks one per call. Concurrent
//! materializations of the same repository are serialized by a lock file so
//! cooperating processes do not download the same checkpoint twice. The
//! lock covers materialization only, never model construction.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::catalog::CatalogEntry;
use crate::error::{LoaderError, Result};

pub mod huggingface;
pub mod mirror;

pub use huggingface::HuggingFaceProvider;
pub use mirror::MirrorProvider;

/// Environment toggle selecting the provider: `hf` (default) or `mirror`.
pub const HUB_ENV: &str = "LLM_LOADER_HUB";
/// Environment toggle enabling concurrent file downloads.
pub const FAST_DOWNLOAD_ENV: &str = "LLM_LOADER_FAST_DOWNLOAD";
/// Overrides the cache root (default `~/.cache/llm-loader`).
pub const CACHE_ENV: &str = "LLM_LOADER_CACHE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    HuggingFace,
    Mirror,
}

/// Turns a remote repository id into a local checkpoint directory. Both
/// implementations resume partially downloaded content without re-fetching
/// complete files.
#[async_trait]
pub trait CheckpointProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn fetch(&self, repo_id: &str, revision: &str, ignore: &[Regex]) -> Result<PathBuf>;
}

/// Read the provider toggle. Called once per materialization.
pub fn provider_from_env() -> ProviderKind {
    match std::env::var(HUB_ENV).as_deref() {
        Ok("mirror") => ProviderKind::Mirror,
        _ => ProviderKind::HuggingFace,
    }
}

pub fn fast_download_enabled() -> bool {
    matches!(
        std::env::var(FAST_DOWNLOAD_ENV).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

/// Where downloaded checkpoints live.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub cache_dir: PathBuf,
}

impl Default for HubConfig {
    fn default() -> Self {
        let cache_dir = std::env::var(CACHE_ENV)
            .map(PathBuf::from)
            .ok()
            .or_else(|| dirs::home_dir().map(|h| h.join(".cache").join("llm-loader")))
            .unwrap_or_else(|| PathBuf::from(".llm-loader-cache"));
        Self { cache_dir }
    }
}

/// Cross-process mutual exclusion around one checkpoint directory.
///
/// Backed by a `create_new` lock file next to the guarded path; releasing is
/// deleting the file. Held for the duration of a download or of a merge
/// export, never for a model construction.
#[derive(Debug)]
pub struct DownloadLock {
    path: PathBuf,
}

impl DownloadLock {
    /// Lock file path guarding `target`.
    pub fn lock_path(target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "checkpoint".to_string());
        target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(format!("{name}.lock"))
    }

    /// Take the lock or fail immediately with `CheckpointBusy`.
    pub fn try_acquire(target: &Path) -> Result<Self> {
        let path = Self::lock_path(target);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(_) => Ok(Self { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(LoaderError::CheckpointBusy(target.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Wait until the lock can be taken. Downloads are long-running, so
    /// there is no timeout; a stale lock file has to be removed by hand.
    pub async fn acquire(target: &Path) -> Result<Self> {
        let mut waiting_logged = false;
        loop {
            match Self::try_acquire(target) {
                Ok(lock) => return Ok(lock),
                Err(LoaderError::CheckpointBusy(_)) => {
                    if !waiting_logged {
                        info!(target = %target.display(), "waiting for concurrent download");
                        waiting_logged = true;
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for DownloadLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release download lock");
        }
    }
}

pub(crate) fn compile_ignore(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                debug!(pattern = %p, error = %e, "skipping invalid ignore pattern");
                None
            }
        })
        .collect()
}

pub(crate) fn is_ignored(path: &str, ignore: &[Regex]) -> bool {
    ignore.iter().any(|re| re.is_match(path))
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn sanitize(id: &str) -> String {
    id.replace('/', "--")
}

/// Resolve a local checkpoint directory for a catalog entry, downloading
/// when needed.
///
/// An explicit location that exists locally is used as-is with no provider
/// involved. Otherwise the entry's declared repository id for the selected
/// provider is fetched under the materialization lock.
pub async fn materialize(
    entry: &CatalogEntry,
    explicit: Option<&str>,
    revision: Option<&str>,
    config: &HubConfig,
    provider_override: Option<&dyn CheckpointProvider>,
) -> Result<PathBuf> {
    if let Some(loc) = explicit {
        let path = expand_tilde(loc);
        if path.is_dir() {
            info!(key = %entry.key, dir = %path.display(), "using local checkpoint");
            return Ok(path);
        }
    }

    // Both toggles are read here, once per call.
    let kind = provider_override
        .map(|p| p.kind())
        .unwrap_or_else(provider_from_env);

    let repo_id = match explicit {
        Some(id) => id.to_string(),
        None => entry
            .location(kind == ProviderKind::Mirror)
            .ok_or_else(|| LoaderError::Download {
                file: entry.key.clone(),
                reason: "no checkpoint location declared".to_string(),
            })?
            .to_string(),
    };
    let revision = revision.unwrap_or(entry.revision.as_str());
    let ignore = compile_ignore(&entry.ignore_patterns);

    let built;
    let provider: &dyn CheckpointProvider = match provider_override {
        Some(p) => p,
        None => {
            built = build_provider(kind, config)?;
            built.as_ref()
        }
    };

    info!(key = %entry.key, repo_id = %repo_id, revision, ?kind, "materializing checkpoint");
    let lock_target = config
        .cache_dir
        .join("locks")
        .join(format!("{}@{}", sanitize(&repo_id), revision));
    let _lock = DownloadLock::acquire(&lock_target).await?;
    provider.fetch(&repo_id, revision, &ignore).await
}

fn build_provider(kind: ProviderKind, config: &HubConfig) -> Result<Box<dyn CheckpointProvider>> {
    Ok(match kind {
        ProviderKind::HuggingFace => Box::new(HuggingFaceProvider::new(&config.cache_dir)?),
        ProviderKind::Mirror => Box::new(MirrorProvider::new(&config.cache_dir)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loaders::LoaderKey;

    #[test]
    fn test_env_toggles() {
        // One test body so the env mutations cannot race each other.
        std::env::remove_var(HUB_ENV);
        assert_eq!(provider_from_env(), ProviderKind::HuggingFace);
        std::env::set_var(HUB_ENV, "mirror");
        assert_eq!(provider_from_env(), ProviderKind::Mirror);
        std::env::set_var(HUB_ENV, "hf");
        assert_eq!(provider_from_env(), ProviderKind::HuggingFace);
        std::env::remove_var(HUB_ENV);

        std::env::remove_var(FAST_DOWNLOAD_ENV);
        assert!(!fast_download_enabled());
        std::env::set_var(FAST_DOWNLOAD_ENV, "1");
        assert!(fast_download_enabled());
        std::env::remove_var(FAST_DOWNLOAD_ENV);
    }

    #[test]
    fn test_lock_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("ckpt");
        let first = DownloadLock::try_acquire(&target).unwrap();
        let second = DownloadLock::try_acquire(&target);
        assert!(matches!(second, Err(LoaderError::CheckpointBusy(_))));
        drop(first);
        assert!(DownloadLock::try_acquire(&target).is_ok());
    }

    #[test]
    fn test_lock_path_keeps_dots() {
        let p = DownloadLock::lock_path(Path::new("/cache/Qwen1.5-7B-Chat"));
        assert_eq!(p, PathBuf::from("/cache/Qwen1.5-7B-Chat.lock"));
    }

    #[test]
    fn test_ignore_patterns() {
        let ignore = compile_ignore(&[r".+\.bin$".to_string()]);
        assert!(is_ignored("pytorch_model-00001.bin", &ignore));
        assert!(!is_ignored("model.safetensors", &ignore));
    }

    #[tokio::test]
    async fn test_materialize_prefers_local_path() {
        let dir = tempfile::tempdir().unwrap();
        let entry = CatalogEntry::new("m", LoaderKey::Repo);
        let config = HubConfig {
            cache_dir: dir.path().join("cache"),
        };
        let resolved = materialize(
            &entry,
            Some(dir.path().to_str().unwrap()),
            None,
            &config,
            None,
        )
        .await
        .unwrap();
        assert_eq!(resolved, dir.path());
    }

    #[tokio::test]
    async fn test_materialize_without_location_fails() {
        let dir = tempfile::tempdir().unwrap();
        let entry = CatalogEntry::new("m", LoaderKey::Repo);
        let config = HubConfig {
            cache_dir: dir.path().to_path_buf(),
        };
        let err = materialize(&entry, None, None, &config, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LoaderError::Download { .. }));
    }
}
