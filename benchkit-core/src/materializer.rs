//! Synthesized "no weights" checkpoints.
//!
//! Benchmarks that only care about shapes and kernels do not need trained weights.
//! [`WeightMaterializer`] writes a directory that looks like a pretrained checkpoint
//! to a loader: the model config, the processor files, a patched generation config and
//! a `model.safetensors` holding a single 1x1 linear layer. The loader then initializes
//! every missing tensor randomly.
//!
//! exllama v2 kernels additionally require a `g_idx` tensor on every quantized linear
//! module, so those are written as int32 ones of shape `[in_features]`.

use crate::error::Result;
use crate::generation::{GenerationConfig, GenerationConfigPatcher};
use crate::hub::SAFE_WEIGHTS_NAME;
use crate::pretrained::PretrainedConfig;
use crate::processor::PretrainedProcessor;
use safetensors::{Dtype, View};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Directory name of the synthesized checkpoint inside a backend's temp dir.
pub const NO_WEIGHTS_DIR: &str = "no_weights_model";

/// A linear module of an architecture, enumerated from its config alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearLayer {
    /// Module path, e.g. `model.layers.0.self_attn.q_proj`.
    pub name: String,
    pub in_features: usize,
}

impl LinearLayer {
    pub fn new(name: impl Into<String>, in_features: usize) -> Self {
        Self {
            name: name.into(),
            in_features,
        }
    }
}

/// A synthesized checkpoint on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoWeightsModel {
    dir: PathBuf,
}

impl NoWeightsModel {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn weights_path(&self) -> PathBuf {
        self.dir.join(SAFE_WEIGHTS_NAME)
    }

    /// The directory as a model identifier for hub-style loaders.
    pub fn model_id(&self) -> String {
        self.dir.to_string_lossy().into_owned()
    }
}

/// Little-endian tensor bytes ready for serialization.
struct PlaceholderTensor {
    dtype: Dtype,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl PlaceholderTensor {
    fn random_f32(shape: Vec<usize>) -> Self {
        let numel: usize = shape.iter().product();
        let data = (0..numel)
            .flat_map(|_| rand::random::<f32>().to_le_bytes())
            .collect();
        Self {
            dtype: Dtype::F32,
            shape,
            data,
        }
    }

    fn ones_i32(len: usize) -> Self {
        let data = std::iter::repeat_n(1i32.to_le_bytes(), len)
            .flatten()
            .collect();
        Self {
            dtype: Dtype::I32,
            shape: vec![len],
            data,
        }
    }
}

impl View for &PlaceholderTensor {
    fn dtype(&self) -> Dtype {
        self.dtype
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(&self.data)
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}

/// Inputs of one materialization.
#[derive(Debug, Clone, Copy)]
pub struct MaterializeRequest<'a> {
    pub config: &'a PretrainedConfig,
    /// Resolved quantization settings, embedded into the saved `config.json`.
    pub quantization_config: Option<&'a Map<String, Value>>,
    /// Modules that get an exllama v2 `g_idx` placeholder. Empty otherwise.
    pub g_idx_layers: &'a [LinearLayer],
    pub processor: &'a PretrainedProcessor,
    /// Saved patched when given. Only generation tasks pass one.
    pub generation_config: Option<&'a GenerationConfig>,
}

/// Writes no-weights checkpoints under a root directory.
#[derive(Debug, Clone)]
pub struct WeightMaterializer {
    root: PathBuf,
}

impl WeightMaterializer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn target_dir(&self) -> PathBuf {
        self.root.join(NO_WEIGHTS_DIR)
    }

    pub fn materialize(&self, request: MaterializeRequest<'_>) -> Result<NoWeightsModel> {
        let dir = self.target_dir();
        std::fs::create_dir_all(&dir)?;
        info!(dir = %dir.display(), "Creating no weights model");

        let weight = PlaceholderTensor::random_f32(vec![1, 1]);
        let bias = PlaceholderTensor::random_f32(vec![1]);
        let g_idx: Vec<(String, PlaceholderTensor)> = request
            .g_idx_layers
            .iter()
            .map(|layer| {
                (
                    format!("{}.g_idx", layer.name),
                    PlaceholderTensor::ones_i32(layer.in_features),
                )
            })
            .collect();
        if !g_idx.is_empty() {
            debug!(count = g_idx.len(), "Adding g_idx placeholders for exllama v2");
        }

        let mut tensors: Vec<(String, &PlaceholderTensor)> = vec![
            ("weight".to_string(), &weight),
            ("bias".to_string(), &bias),
        ];
        tensors.extend(g_idx.iter().map(|(name, tensor)| (name.clone(), tensor)));

        let metadata = Some(HashMap::from([("format".to_string(), "pt".to_string())]));
        let model = NoWeightsModel { dir: dir.clone() };
        safetensors::serialize_to_file(tensors, &metadata, &model.weights_path())?;

        let mut config = request.config.clone();
        if let Some(quantization_config) = request.quantization_config {
            config.set_quantization_config(quantization_config.clone());
        }
        config.save_pretrained(&dir)?;
        request.processor.save_pretrained(&dir)?;

        if let Some(generation_config) = request.generation_config {
            let mut patched = generation_config.clone();
            GenerationConfigPatcher.patch_and_save(&mut patched, &dir)?;
        }

        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{CONFIG_NAME, GENERATION_CONFIG_NAME};
    use pretty_assertions::assert_eq;
    use safetensors::SafeTensors;
    use serde_json::json;
    use tempfile::TempDir;

    fn config() -> PretrainedConfig {
        serde_json::from_value(json!({"model_type": "llama", "hidden_size": 8})).unwrap()
    }

    fn request<'a>(
        config: &'a PretrainedConfig,
        processor: &'a PretrainedProcessor,
    ) -> MaterializeRequest<'a> {
        MaterializeRequest {
            config,
            quantization_config: None,
            g_idx_layers: &[],
            processor,
            generation_config: None,
        }
    }

    #[test]
    fn test_checkpoint_holds_single_linear() {
        let dir = TempDir::new().unwrap();
        let config = config();
        let processor = PretrainedProcessor::default();
        let model = WeightMaterializer::new(dir.path())
            .materialize(request(&config, &processor))
            .unwrap();

        let bytes = std::fs::read(model.weights_path()).unwrap();
        let tensors = SafeTensors::deserialize(&bytes).unwrap();
        let mut names = tensors.names();
        names.sort();
        assert_eq!(names, vec!["bias", "weight"]);
        assert_eq!(tensors.tensor("weight").unwrap().shape(), &[1, 1]);
        assert_eq!(tensors.tensor("bias").unwrap().shape(), &[1]);
        assert_eq!(tensors.tensor("weight").unwrap().dtype(), Dtype::F32);

        let (_, metadata) = SafeTensors::read_metadata(&bytes).unwrap();
        assert_eq!(
            metadata.metadata().as_ref().unwrap().get("format"),
            Some(&"pt".to_string())
        );
        assert!(model.dir().join(CONFIG_NAME).is_file());
        assert!(!model.dir().join(GENERATION_CONFIG_NAME).exists());
        assert!(model.dir().ends_with(NO_WEIGHTS_DIR));
    }

    #[test]
    fn test_g_idx_placeholders() {
        let dir = TempDir::new().unwrap();
        let config = config();
        let processor = PretrainedProcessor::default();
        let layers = vec![
            LinearLayer::new("model.layers.0.self_attn.q_proj", 8),
            LinearLayer::new("model.layers.0.mlp.down_proj", 32),
        ];
        let mut quant = Map::new();
        quant.insert("quant_method".into(), json!("gptq"));
        quant.insert("exllama_config".into(), json!({"version": 2}));

        let model = WeightMaterializer::new(dir.path())
            .materialize(MaterializeRequest {
                quantization_config: Some(&quant),
                g_idx_layers: &layers,
                ..request(&config, &processor)
            })
            .unwrap();

        let bytes = std::fs::read(model.weights_path()).unwrap();
        let tensors = SafeTensors::deserialize(&bytes).unwrap();
        assert_eq!(tensors.len(), 4);
        let g_idx = tensors.tensor("model.layers.0.mlp.down_proj.g_idx").unwrap();
        assert_eq!(g_idx.dtype(), Dtype::I32);
        assert_eq!(g_idx.shape(), &[32]);
        assert!(
            g_idx
                .data()
                .chunks_exact(4)
                .all(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) == 1)
        );

        let saved = PretrainedConfig::from_file(&model.dir().join(CONFIG_NAME)).unwrap();
        assert_eq!(saved.quantization_config(), Some(&quant));
    }

    #[test]
    fn test_generation_config_is_patched() {
        let dir = TempDir::new().unwrap();
        let config = config();
        let processor = PretrainedProcessor::default();
        let generation: GenerationConfig =
            serde_json::from_str(r#"{"eos_token_id": 2, "temperature": 0.7}"#).unwrap();

        let model = WeightMaterializer::new(dir.path())
            .materialize(MaterializeRequest {
                generation_config: Some(&generation),
                ..request(&config, &processor)
            })
            .unwrap();

        let saved =
            GenerationConfig::from_file(&model.dir().join(GENERATION_CONFIG_NAME)).unwrap();
        assert_eq!(saved.pad_token_id, Some(-100));
        assert_eq!(saved.temperature, Some(1.0));
        assert_eq!(saved.top_p, Some(1.0));
    }
}
