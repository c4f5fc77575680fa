//! Generation settings and the fixed-length patch applied before benchmarking.

use crate::error::Result;
use crate::hub::GENERATION_CONFIG_NAME;
use crate::persistence;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::info;

/// Token id no vocabulary contains. Generation never stops on it.
pub const SENTINEL_TOKEN_ID: i64 = -100;

/// One token id or a list of them, as found in `generation_config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TokenIds {
    Single(i64),
    Many(Vec<i64>),
}

impl TokenIds {
    /// Ids usable as vocabulary indices (negative sentinels are dropped).
    pub fn valid_ids(&self) -> Vec<u32> {
        let ids: &[i64] = match self {
            Self::Single(id) => std::slice::from_ref(id),
            Self::Many(ids) => ids,
        };
        ids.iter()
            .filter_map(|&id| u32::try_from(id).ok())
            .collect()
    }
}

/// `generation_config.json`. Unknown keys are preserved on save.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bos_token_id: Option<TokenIds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eos_token_id: Option<TokenIds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pad_token_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub do_sample: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_new_tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_implementation: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GenerationConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write `generation_config.json` into `dir`.
    pub fn save_pretrained(&self, dir: &Path) -> Result<PathBuf> {
        persistence::save_model_json(dir, GENERATION_CONFIG_NAME, self)
    }

    /// End-of-sequence ids usable by a decoding loop.
    pub fn eos_ids(&self) -> Vec<u32> {
        self.eos_token_id
            .as_ref()
            .map(TokenIds::valid_ids)
            .unwrap_or_default()
    }
}

/// Forces fixed-length, bias-free generation.
///
/// End-of-sequence and padding ids become [`SENTINEL_TOKEN_ID`], so a generation loop
/// always produces the requested number of tokens; sampling knobs are reset to
/// neutral values.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenerationConfigPatcher;

impl GenerationConfigPatcher {
    /// Patch in place.
    pub fn patch(&self, config: &mut GenerationConfig) {
        config.eos_token_id = Some(TokenIds::Single(SENTINEL_TOKEN_ID));
        config.pad_token_id = Some(SENTINEL_TOKEN_ID);
        config.temperature = Some(1.0);
        config.top_p = Some(1.0);
        config.top_k = Some(50);
    }

    /// Patch, then persist into `dir`.
    pub fn patch_and_save(&self, config: &mut GenerationConfig, dir: &Path) -> Result<PathBuf> {
        self.patch(config);
        info!(dir = %dir.display(), "Saving fixed-length generation config");
        config.save_pretrained(dir)
    }
}
