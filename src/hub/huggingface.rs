//! Primary hub provider.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use hf_hub::api::tokio::{Api, ApiBuilder};
use hf_hub::{Repo, RepoType};
use regex::Regex;
use tracing::{debug, info};

use crate::error::{LoaderError, Result};

use super::{fast_download_enabled, is_ignored, CheckpointProvider, ProviderKind};

/// How many files download concurrently on the fast path.
const FAST_CONCURRENCY: usize = 8;

/// Hub provider backed by the hub's own client, which caches complete files
/// and resumes partial ones.
pub struct HuggingFaceProvider {
    api: Api,
}

impl HuggingFaceProvider {
    /// Build the provider. Picks up a bearer token from `HF_TOKEN` or
    /// `HUGGING_FACE_HUB_TOKEN` when present.
    pub fn new(cache_dir: &Path) -> Result<Self> {
        let token = std::env::var("HF_TOKEN")
            .or_else(|_| std::env::var("HUGGING_FACE_HUB_TOKEN"))
            .ok()
            .filter(|t| !t.is_empty());
        if token.is_some() {
            debug!("using hub token from environment");
        }
        let api = ApiBuilder::new()
            .with_cache_dir(cache_dir.join("hub"))
            .with_token(token)
            .build()?;
        Ok(Self { api })
    }

    fn repo(&self, repo_id: &str, revision: &str) -> hf_hub::api::tokio::ApiRepo {
        self.api.repo(Repo::with_revision(
            repo_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ))
    }
}

#[async_trait]
impl CheckpointProvider for HuggingFaceProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::HuggingFace
    }

    async fn fetch(&self, repo_id: &str, revision: &str, ignore: &[Regex]) -> Result<PathBuf> {
        let repo = self.repo(repo_id, revision);
        let info = repo.info().await?;
        let files: Vec<String> = info
            .siblings
            .into_iter()
            .map(|s| s.rfilename)
            .filter(|f| !is_ignored(f, ignore))
            .collect();
        if files.is_empty() {
            return Err(LoaderError::Download {
                file: repo_id.to_string(),
                reason: "repository lists no files".to_string(),
            });
        }
        info!(repo_id, revision, files = files.len(), "pulling checkpoint");

        let mut last: Option<PathBuf> = None;
        if fast_download_enabled() {
            let results: Vec<std::result::Result<PathBuf, hf_hub::api::tokio::ApiError>> =
                stream::iter(files.clone())
                    .map(|f| {
                        let repo = self.repo(repo_id, revision);
                        async move { repo.get(&f).await }
                    })
                    .buffer_unordered(FAST_CONCURRENCY)
                    .collect()
                    .await;
            for result in results {
                last = Some(result?);
            }
        } else {
            for f in &files {
                last = Some(repo.get(f).await?);
            }
        }

        last.and_then(|p| p.parent().map(Path::to_path_buf))
            .ok_or_else(|| LoaderError::Download {
                file: repo_id.to_string(),
                reason: "provider returned no local path".to_string(),
            })
    }
}
