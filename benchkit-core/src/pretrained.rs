//! Pretrained model configuration and the artifact bundle loaded before any weights.

use crate::config::Library;
use crate::error::{BackendError, Result};
use crate::generation::GenerationConfig;
use crate::hub::{CONFIG_NAME, GENERATION_CONFIG_NAME, HubClient};
use crate::persistence;
use crate::processor::PretrainedProcessor;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A model's `config.json`, kept as a JSON object so unknown keys survive a save.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PretrainedConfig {
    inner: Map<String, Value>,
}

impl PretrainedConfig {
    pub fn new(inner: Map<String, Value>) -> Self {
        Self { inner }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&content)?;
        match value {
            Value::Object(inner) => Ok(Self { inner }),
            other => Err(BackendError::invalid_input(format!(
                "{} is not a JSON object: {other}",
                path.display()
            ))),
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.inner
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.inner.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.inner.insert(key.into(), value);
    }

    fn usize_field(&self, key: &str) -> Option<usize> {
        self.inner
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|v| usize::try_from(v).ok())
    }

    pub fn model_type(&self) -> Option<&str> {
        self.inner.get("model_type").and_then(Value::as_str)
    }

    pub fn architectures(&self) -> Vec<String> {
        self.inner
            .get("architectures")
            .and_then(Value::as_array)
            .map(|archs| {
                archs
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn hidden_size(&self) -> Option<usize> {
        self.usize_field("hidden_size")
    }

    pub fn intermediate_size(&self) -> Option<usize> {
        self.usize_field("intermediate_size")
    }

    pub fn num_hidden_layers(&self) -> Option<usize> {
        self.usize_field("num_hidden_layers")
    }

    pub fn num_attention_heads(&self) -> Option<usize> {
        self.usize_field("num_attention_heads")
    }

    /// Falls back to `num_attention_heads` like the llama family does.
    pub fn num_key_value_heads(&self) -> Option<usize> {
        self.usize_field("num_key_value_heads")
            .or_else(|| self.num_attention_heads())
    }

    pub fn vocab_size(&self) -> Option<usize> {
        self.usize_field("vocab_size")
    }

    /// The checkpoint's own quantization settings, if any.
    pub fn quantization_config(&self) -> Option<&Map<String, Value>> {
        self.inner
            .get("quantization_config")
            .and_then(Value::as_object)
    }

    pub fn set_quantization_config(&mut self, config: Map<String, Value>) {
        self.inner
            .insert("quantization_config".to_string(), Value::Object(config));
    }

    /// Write `config.json` into `dir`.
    pub fn save_pretrained(&self, dir: &Path) -> Result<PathBuf> {
        persistence::save_model_json(dir, CONFIG_NAME, &self.inner)
    }
}

/// Everything known about a model before its weights are touched.
#[derive(Debug, Clone, Default)]
pub struct PretrainedArtifacts {
    pub config: Option<PretrainedConfig>,
    pub generation_config: Option<GenerationConfig>,
    pub processor: PretrainedProcessor,
}

impl PretrainedArtifacts {
    /// Fetch config, generation config and processor files of `model`.
    ///
    /// `config.json` is mandatory for transformers checkpoints only; timm and
    /// diffusers repositories may lack one.
    pub async fn load(hub: &HubClient, model: &str, library: Library) -> Result<Self> {
        info!(model, %library, "Loading pretrained artifacts");

        let config = match library {
            Library::Transformers => {
                let path = hub.fetch(model, CONFIG_NAME).await?;
                Some(PretrainedConfig::from_file(&path)?)
            }
            Library::Timm | Library::Diffusers => hub
                .fetch_optional(model, CONFIG_NAME)
                .await?
                .map(|path| PretrainedConfig::from_file(&path))
                .transpose()?,
        };

        let generation_config = match hub.fetch_optional(model, GENERATION_CONFIG_NAME).await? {
            Some(path) => Some(GenerationConfig::from_file(&path)?),
            None => None,
        };

        let processor = PretrainedProcessor::load(hub, model).await?;
        debug!(
            model,
            has_config = config.is_some(),
            has_generation_config = generation_config.is_some(),
            processor_files = processor.files().len(),
            "Pretrained artifacts loaded"
        );

        Ok(Self {
            config,
            generation_config,
            processor,
        })
    }

    /// The model config, or a configuration error naming what needed it.
    pub fn require_config(&self, purpose: &str) -> Result<&PretrainedConfig> {
        self.config.as_ref().ok_or_else(|| {
            BackendError::configuration(format!("{purpose} requires the model's {CONFIG_NAME}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubOptions;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn llama_config() -> Value {
        json!({
            "architectures": ["LlamaForCausalLM"],
            "model_type": "llama",
            "hidden_size": 16,
            "intermediate_size": 32,
            "num_hidden_layers": 2,
            "num_attention_heads": 4,
            "vocab_size": 64,
            "torch_dtype": "float32"
        })
    }

    #[test]
    fn test_accessors() {
        let config: PretrainedConfig = serde_json::from_value(llama_config()).unwrap();
        assert_eq!(config.model_type(), Some("llama"));
        assert_eq!(config.architectures(), vec!["LlamaForCausalLM".to_string()]);
        assert_eq!(config.hidden_size(), Some(16));
        assert_eq!(config.num_key_value_heads(), Some(4));
        assert_eq!(config.vocab_size(), Some(64));
        assert!(config.quantization_config().is_none());
    }

    #[test]
    fn test_save_keeps_unknown_keys() {
        let dir = TempDir::new().unwrap();
        let mut config: PretrainedConfig = serde_json::from_value(llama_config()).unwrap();
        let mut quant = Map::new();
        quant.insert("quant_method".into(), json!("gptq"));
        config.set_quantization_config(quant);

        let path = config.save_pretrained(dir.path()).unwrap();
        let reloaded = PretrainedConfig::from_file(&path).unwrap();
        assert_eq!(reloaded.get("torch_dtype"), Some(&json!("float32")));
        assert_eq!(
            reloaded.quantization_config().unwrap()["quant_method"],
            "gptq"
        );
    }

    #[test]
    fn test_from_file_rejects_non_object() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_NAME);
        std::fs::write(&path, "[1, 2]").unwrap();
        assert!(PretrainedConfig::from_file(&path).is_err());
    }

    #[tokio::test]
    async fn test_load_artifacts_from_local_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_NAME), llama_config().to_string()).unwrap();
        std::fs::write(
            dir.path().join(GENERATION_CONFIG_NAME),
            r#"{"eos_token_id": 2}"#,
        )
        .unwrap();
        let hub = HubClient::new(HubOptions::default());
        let model = dir.path().to_str().unwrap();

        let artifacts = PretrainedArtifacts::load(&hub, model, Library::Transformers)
            .await
            .unwrap();
        assert!(artifacts.config.is_some());
        assert_eq!(artifacts.generation_config.unwrap().eos_ids(), vec![2]);
        assert!(artifacts.processor.tokenizer().is_none());
    }

    #[tokio::test]
    async fn test_config_optional_for_timm() {
        let dir = TempDir::new().unwrap();
        let hub = HubClient::new(HubOptions::default());
        let model = dir.path().to_str().unwrap();

        let artifacts = PretrainedArtifacts::load(&hub, model, Library::Timm)
            .await
            .unwrap();
        assert!(artifacts.config.is_none());
        assert!(artifacts.require_config("no-weights").unwrap_err().is_configuration());

        assert!(
            PretrainedArtifacts::load(&hub, model, Library::Transformers)
                .await
                .is_err()
        );
    }
}
