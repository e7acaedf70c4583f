//! Alternate-registry provider.
//!
//! Talks the same HTTP surface as the primary hub but through a
//! configurable base URL, with byte-range resume for interrupted transfers.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{LoaderError, Result};

use super::{is_ignored, CheckpointProvider, ProviderKind};

/// Overrides the mirror base URL.
pub const MIRROR_URL_ENV: &str = "LLM_LOADER_MIRROR_URL";

const DEFAULT_MIRROR_URL: &str = "https://hf-mirror.com";

/// Progress template for files with a known size.
const PB_TEMPLATE: &str =
    "{wide_msg}\n[{bar:40.cyan/blue}] {bytes}/{total_bytes}  {bytes_per_sec}  ETA {eta}";

/// One entry of the repository tree listing.
#[derive(Debug, Deserialize)]
struct TreeEntry {
    path: String,
    size: Option<u64>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

pub struct MirrorProvider {
    client: reqwest::Client,
    base: String,
    cache_dir: PathBuf,
}

impl MirrorProvider {
    pub fn new(cache_dir: &Path) -> Result<Self> {
        let base = std::env::var(MIRROR_URL_ENV).unwrap_or_else(|_| DEFAULT_MIRROR_URL.to_string());
        let client = reqwest::Client::builder()
            .user_agent(concat!("llm-loader/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| LoaderError::Download {
                file: "<http client>".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            base,
            cache_dir: cache_dir.to_path_buf(),
        })
    }

    async fn list_files(&self, repo_id: &str, revision: &str) -> Result<Vec<TreeEntry>> {
        let url = format!("{}/api/models/{}/tree/{}?recursive=true", self.base, repo_id, revision);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| LoaderError::Download {
                file: repo_id.to_string(),
                reason: format!("tree listing failed: {e}"),
            })?;
        resp.json().await.map_err(|e| LoaderError::Download {
            file: repo_id.to_string(),
            reason: format!("malformed tree listing: {e}"),
        })
    }

    /// Download one file, resuming a partial transfer when a `.part` file
    /// from a previous attempt is present.
    async fn download_file(
        &self,
        repo_id: &str,
        revision: &str,
        entry: &TreeEntry,
        target_dir: &Path,
    ) -> Result<()> {
        let final_path = target_dir.join(&entry.path);
        if let Some(size) = entry.size {
            if final_path.is_file()
                && final_path.metadata().map(|m| m.len()).unwrap_or(0) == size
            {
                debug!(file = %entry.path, "already complete");
                return Ok(());
            }
        } else if final_path.is_file() {
            return Ok(());
        }
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let part_path = target_dir.join(format!("{}.part", entry.path));
        let resume_from = tokio::fs::metadata(&part_path).await.map(|m| m.len()).unwrap_or(0);

        let url = format!("{}/{}/resolve/{}/{}", self.base, repo_id, revision, entry.path);
        let mut request = self.client.get(&url);
        if resume_from > 0 {
            request = request.header(RANGE, format!("bytes={resume_from}-"));
        }
        let resp = request.send().await.map_err(|e| LoaderError::Download {
            file: entry.path.clone(),
            reason: e.to_string(),
        })?;

        let status = resp.status();
        let append = match status {
            StatusCode::PARTIAL_CONTENT => true,
            StatusCode::OK => false,
            StatusCode::RANGE_NOT_SATISFIABLE => {
                // The part file already holds the whole object.
                tokio::fs::rename(&part_path, &final_path).await?;
                return Ok(());
            }
            other => {
                return Err(LoaderError::Download {
                    file: entry.path.clone(),
                    reason: format!("unexpected status {other}"),
                })
            }
        };

        let pb = entry.size.map(|size| {
            let pb = ProgressBar::new(size);
            if let Ok(style) = ProgressStyle::with_template(PB_TEMPLATE) {
                pb.set_style(style);
            }
            pb.set_message(entry.path.clone());
            pb.set_position(if append { resume_from } else { 0 });
            pb
        });

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(append)
            .write(true)
            .truncate(!append)
            .open(&part_path)
            .await?;

        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| LoaderError::Download {
                file: entry.path.clone(),
                reason: e.to_string(),
            })?;
            file.write_all(&chunk).await?;
            if let Some(pb) = &pb {
                pb.inc(chunk.len() as u64);
            }
        }
        file.flush().await?;
        drop(file);
        if let Some(pb) = pb {
            pb.finish_and_clear();
        }

        tokio::fs::rename(&part_path, &final_path).await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointProvider for MirrorProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Mirror
    }

    async fn fetch(&self, repo_id: &str, revision: &str, ignore: &[Regex]) -> Result<PathBuf> {
        let entries = self.list_files(repo_id, revision).await?;
        let files: Vec<TreeEntry> = entries
            .into_iter()
            .filter(|e| e.kind.as_deref() != Some("directory"))
            .filter(|e| !is_ignored(&e.path, ignore))
            .collect();
        if files.is_empty() {
            return Err(LoaderError::Download {
                file: repo_id.to_string(),
                reason: "repository lists no files".to_string(),
            });
        }

        let target_dir = self
            .cache_dir
            .join("mirror")
            .join(repo_id.replace('/', "--"))
            .join(revision);
        tokio::fs::create_dir_all(&target_dir).await?;
        info!(repo_id, revision, files = files.len(), dir = %target_dir.display(), "pulling checkpoint from mirror");

        for entry in &files {
            self.download_file(repo_id, revision, entry, &target_dir).await?;
        }
        Ok(target_dir)
    }
}
