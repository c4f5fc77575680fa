//! Tokenizer / processor files of a pretrained model.

use crate::error::{BackendError, Result};
use crate::hub::{HubClient, PROCESSOR_FILES};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokenizers::Tokenizer;
use tracing::debug;

const TOKENIZER_FILE: &str = "tokenizer.json";

/// The processor files found for a model, plus the parsed tokenizer when present.
#[derive(Clone, Default)]
pub struct PretrainedProcessor {
    files: Vec<PathBuf>,
    tokenizer: Option<Arc<Tokenizer>>,
}

impl std::fmt::Debug for PretrainedProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PretrainedProcessor")
            .field("files", &self.files)
            .field("has_tokenizer", &self.tokenizer.is_some())
            .finish()
    }
}

impl PretrainedProcessor {
    /// Collect whichever processor files the model ships.
    pub async fn load(hub: &HubClient, model: &str) -> Result<Self> {
        let mut files = Vec::new();
        for name in PROCESSOR_FILES {
            if let Some(path) = hub.fetch_optional(model, name).await? {
                files.push(path);
            }
        }
        Self::from_files(files)
    }

    /// Build from already-local files. `tokenizer.json` is parsed if present.
    pub fn from_files(files: Vec<PathBuf>) -> Result<Self> {
        let tokenizer = files
            .iter()
            .find(|p| p.file_name().is_some_and(|n| n == TOKENIZER_FILE))
            .map(|path| {
                Tokenizer::from_file(path).map_err(|e| {
                    BackendError::upstream(format!("tokenizer {}", path.display()), e)
                })
            })
            .transpose()?;
        Ok(Self {
            files,
            tokenizer: tokenizer.map(Arc::new),
        })
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn tokenizer(&self) -> Option<&Tokenizer> {
        self.tokenizer.as_deref()
    }

    fn require_tokenizer(&self) -> Result<&Tokenizer> {
        self.tokenizer()
            .ok_or_else(|| BackendError::Tokenizer(format!("model ships no {TOKENIZER_FILE}")))
    }

    /// Decode each row of token ids into text.
    pub fn batch_decode(&self, sequences: &[Vec<u32>]) -> Result<Vec<String>> {
        let tokenizer = self.require_tokenizer()?;
        let rows: Vec<&[u32]> = sequences.iter().map(Vec::as_slice).collect();
        tokenizer
            .decode_batch(&rows, true)
            .map_err(|e| BackendError::Tokenizer(e.to_string()))
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let tokenizer = self.require_tokenizer()?;
        let encoding = tokenizer
            .encode(text, true)
            .map_err(|e| BackendError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Copy every processor file into `dir`.
    pub fn save_pretrained(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        for file in &self.files {
            let Some(name) = file.file_name() else {
                continue;
            };
            std::fs::copy(file, dir.join(name))?;
        }
        debug!(dir = %dir.display(), files = self.files.len(), "Saved processor files");
        Ok(())
    }
}
