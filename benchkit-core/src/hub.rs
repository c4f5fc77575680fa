//! Model hub access.
//!
//! Resolves a model identifier to local files. A model identifier is either a local
//! directory (used as-is) or a hub repository id, in which case files are looked up in
//! the hub cache and downloaded into it with `hf-hub` when missing. The cache follows
//! the standard layout:
//!
//! ```text
//! <cache>/models--<org>--<name>/
//!     refs/<revision>            -> commit sha
//!     snapshots/<sha>/<file>     -> model files
//!     blobs/<etag>
//! ```

use crate::config::HubOptions;
use crate::error::{BackendError, Result};
use hf_hub::api::tokio::ApiBuilder;
use hf_hub::{Cache, Repo, RepoType};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const CONFIG_NAME: &str = "config.json";
pub const GENERATION_CONFIG_NAME: &str = "generation_config.json";
pub const SAFE_WEIGHTS_NAME: &str = "model.safetensors";
pub const SAFE_WEIGHTS_INDEX_NAME: &str = "model.safetensors.index.json";

/// Files making up a tokenizer / processor, copied next to synthesized checkpoints.
pub const PROCESSOR_FILES: &[&str] = &[
    "tokenizer.json",
    "tokenizer_config.json",
    "special_tokens_map.json",
    "tokenizer.model",
    "vocab.json",
    "vocab.txt",
    "merges.txt",
    "added_tokens.json",
    "preprocessor_config.json",
    "chat_template.json",
];

#[derive(Debug, Deserialize)]
struct WeightIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// Hub client bound to one set of [`HubOptions`].
#[derive(Debug, Clone)]
pub struct HubClient {
    options: HubOptions,
}

impl HubClient {
    pub fn new(options: HubOptions) -> Self {
        Self { options }
    }

    /// Same options, different cache directory.
    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.options.cache_dir = Some(cache_dir.into());
        self
    }

    pub fn options(&self) -> &HubOptions {
        &self.options
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.options.cache_dir()
    }

    fn repo(&self, model: &str) -> Repo {
        Repo::with_revision(
            model.to_string(),
            RepoType::Model,
            self.options.revision().to_string(),
        )
    }

    /// Fetch a file that must exist.
    pub async fn fetch(&self, model: &str, filename: &str) -> Result<PathBuf> {
        if is_local_model(model) {
            let path = Path::new(model).join(filename);
            if path.is_file() {
                return Ok(path);
            }
            return Err(BackendError::upstream(
                format!("{filename} of {model}"),
                std::io::Error::new(std::io::ErrorKind::NotFound, path.display().to_string()),
            ));
        }

        let cache = Cache::new(self.cache_dir());
        if let Some(path) = cache.repo(self.repo(model)).get(filename) {
            debug!(model, filename, "Hub cache hit");
            return Ok(path);
        }
        if self.options.offline {
            return Err(BackendError::upstream(
                format!("{filename} of {model}"),
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "not in the hub cache and offline mode is enabled",
                ),
            ));
        }

        debug!(model, filename, "Downloading from hub");
        let api = ApiBuilder::new()
            .with_cache_dir(self.cache_dir())
            .with_token(self.options.token.clone())
            .with_progress(false)
            .build()
            .map_err(|e| BackendError::upstream("hub client", e))?;
        api.repo(self.repo(model))
            .get(filename)
            .await
            .map_err(|e| BackendError::upstream(format!("{filename} of {model}"), e))
    }

    /// Fetch a file that may legitimately be absent.
    pub async fn fetch_optional(&self, model: &str, filename: &str) -> Result<Option<PathBuf>> {
        if is_local_model(model) {
            let path = Path::new(model).join(filename);
            return Ok(path.is_file().then_some(path));
        }
        match self.fetch(model, filename).await {
            Ok(path) => Ok(Some(path)),
            Err(e) => {
                debug!(model, filename, error = %e, "Optional hub file unavailable");
                Ok(None)
            }
        }
    }

    /// Fetch every safetensors shard of the model.
    pub async fn fetch_weights(&self, model: &str) -> Result<Vec<PathBuf>> {
        if let Some(index) = self.fetch_optional(model, SAFE_WEIGHTS_INDEX_NAME).await? {
            let content = std::fs::read_to_string(&index)?;
            let index: WeightIndex = serde_json::from_str(&content)?;
            let shards: BTreeSet<String> = index.weight_map.into_values().collect();
            let mut paths = Vec::with_capacity(shards.len());
            for shard in shards {
                paths.push(self.fetch(model, &shard).await?);
            }
            return Ok(paths);
        }

        if let Some(path) = self.fetch_optional(model, SAFE_WEIGHTS_NAME).await? {
            return Ok(vec![path]);
        }

        if is_local_model(model) {
            let mut paths: Vec<PathBuf> = std::fs::read_dir(model)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
                .collect();
            paths.sort();
            if !paths.is_empty() {
                return Ok(paths);
            }
        }

        Err(BackendError::upstream(
            format!("weights of {model}"),
            std::io::Error::new(std::io::ErrorKind::NotFound, "no safetensors weights found"),
        ))
    }

    /// Download config, generation config, processor files and weights into the cache.
    ///
    /// Returns the snapshot directory holding them.
    pub async fn snapshot_download(&self, model: &str) -> Result<PathBuf> {
        info!(model, cache = %self.cache_dir().display(), "Downloading pretrained model");
        let config = self.fetch(model, CONFIG_NAME).await?;
        self.fetch_optional(model, GENERATION_CONFIG_NAME).await?;
        for file in PROCESSOR_FILES {
            self.fetch_optional(model, file).await?;
        }
        self.fetch_weights(model).await?;

        config.parent().map(Path::to_path_buf).ok_or_else(|| {
            BackendError::upstream(
                format!("snapshot of {model}"),
                std::io::Error::other("config path has no parent"),
            )
        })
    }
}

/// A model identifier naming an existing directory is loaded from disk.
pub fn is_local_model(model: &str) -> bool {
    Path::new(model).is_dir()
}

/// Cache folder name of a model repository: `org/name` -> `models--org--name`.
pub fn repo_folder_name(model: &str) -> String {
    format!("models/{model}").replace('/', "--")
}

/// Snapshot directory of `model` at `revision` inside a hub cache.
///
/// This reads `refs/<revision>` to find the commit the revision points to, and is
/// therefore tied to the hub cache layout above. A revision that is already a
/// commit sha without a ref file maps straight to `snapshots/<sha>`.
pub fn snapshot_dir(cache_dir: &Path, model: &str, revision: &str) -> Result<PathBuf> {
    let repo_dir = cache_dir.join(repo_folder_name(model));
    let ref_file = repo_dir.join("refs").join(revision);

    let commit = match std::fs::read_to_string(&ref_file) {
        Ok(content) => content.trim().to_string(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && is_commit_sha(revision) => {
            revision.to_string()
        }
        Err(e) => {
            return Err(BackendError::upstream(
                format!("snapshot ref {}", ref_file.display()),
                e,
            ));
        }
    };

    Ok(repo_dir.join("snapshots").join(commit))
}

fn is_commit_sha(revision: &str) -> bool {
    revision.len() == 40 && revision.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Lay out a fake cached repository and return its snapshot directory.
    fn cached_repo(cache: &Path, model: &str, commit: &str, files: &[(&str, &str)]) -> PathBuf {
        let repo = cache.join(repo_folder_name(model));
        std::fs::create_dir_all(repo.join("refs")).unwrap();
        std::fs::write(repo.join("refs").join("main"), commit).unwrap();
        let snapshot = repo.join("snapshots").join(commit);
        std::fs::create_dir_all(&snapshot).unwrap();
        for (name, content) in files {
            std::fs::write(snapshot.join(name), content).unwrap();
        }
        snapshot
    }

    fn offline(cache: &Path) -> HubClient {
        HubClient::new(HubOptions {
            offline: true,
            ..HubOptions::default()
        })
        .with_cache_dir(cache)
    }

    #[test]
    fn test_repo_folder_name() {
        assert_eq!(repo_folder_name("org/tiny"), "models--org--tiny");
        assert_eq!(repo_folder_name("gpt2"), "models--gpt2");
    }

    #[test]
    fn test_snapshot_dir_follows_ref() {
        let dir = TempDir::new().unwrap();
        let snapshot = cached_repo(dir.path(), "org/tiny", "abc123", &[]);
        assert_eq!(snapshot_dir(dir.path(), "org/tiny", "main").unwrap(), snapshot);
    }

    #[test]
    fn test_snapshot_dir_commit_revision() {
        let dir = TempDir::new().unwrap();
        let sha = "0123456789abcdef0123456789abcdef01234567";
        let resolved = snapshot_dir(dir.path(), "org/tiny", sha).unwrap();
        assert!(resolved.ends_with(format!("snapshots/{sha}")));
    }

    #[test]
    fn test_snapshot_dir_missing_ref() {
        let dir = TempDir::new().unwrap();
        let err = snapshot_dir(dir.path(), "org/tiny", "dev").unwrap_err();
        assert!(matches!(err, BackendError::UpstreamLoad { .. }));
    }

    #[tokio::test]
    async fn test_fetch_from_local_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_NAME), "{}").unwrap();
        let client = HubClient::new(HubOptions::default());
        let model = dir.path().to_str().unwrap();

        assert!(client.fetch(model, CONFIG_NAME).await.is_ok());
        assert!(
            client
                .fetch_optional(model, GENERATION_CONFIG_NAME)
                .await
                .unwrap()
                .is_none()
        );
        assert!(client.fetch(model, "missing.json").await.is_err());
    }

    #[tokio::test]
    async fn test_fetch_weights_from_index() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(SAFE_WEIGHTS_INDEX_NAME),
            r#"{"metadata": {}, "weight_map": {"a": "model-00002.safetensors", "b": "model-00001.safetensors", "c": "model-00001.safetensors"}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("model-00001.safetensors"), b"").unwrap();
        std::fs::write(dir.path().join("model-00002.safetensors"), b"").unwrap();

        let client = HubClient::new(HubOptions::default());
        let weights = client
            .fetch_weights(dir.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(weights.len(), 2);
        assert!(weights[0].ends_with("model-00001.safetensors"));
    }

    #[tokio::test]
    async fn test_offline_cache_lookup() {
        let dir = TempDir::new().unwrap();
        let snapshot = cached_repo(
            dir.path(),
            "org/tiny",
            "abc123",
            &[(CONFIG_NAME, "{}"), (SAFE_WEIGHTS_NAME, "")],
        );
        let client = offline(dir.path());

        let config = client.fetch("org/tiny", CONFIG_NAME).await.unwrap();
        assert_eq!(config, snapshot.join(CONFIG_NAME));
        assert!(
            client
                .fetch_optional("org/tiny", "tokenizer.json")
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(client.snapshot_download("org/tiny").await.unwrap(), snapshot);
    }

    #[tokio::test]
    async fn test_offline_miss_is_upstream_error() {
        let dir = TempDir::new().unwrap();
        let client = offline(dir.path());
        let err = client.fetch("org/absent", CONFIG_NAME).await.unwrap_err();
        assert!(matches!(err, BackendError::UpstreamLoad { .. }));
    }
}
