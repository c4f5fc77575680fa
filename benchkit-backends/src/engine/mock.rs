//! Recording engine for tests.
//!
//! [`MockEngine`] advertises every capability, records each load request and model
//! transform in a shared [`MockEngineLog`], and produces deterministic outputs without
//! running any tensor math.

use super::{EngineCapabilities, EngineModel, LoadRequest, ModelEngine, WeightInit};
use crate::backend::{BackendInputs, BackendOutput, CallKwargs};
use crate::peft::PeftSpec;
use crate::training::{TrainingArguments, TrainingBatch};
use async_trait::async_trait;
use benchkit_core::hub::{CONFIG_NAME, GENERATION_CONFIG_NAME, SAFE_WEIGHTS_NAME};
use benchkit_core::{
    BackendError, Device, GenerationConfig, Library, LinearLayer, PretrainedConfig, Result,
};
use safetensors::tensor::TensorView;
use safetensors::Dtype;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// A load as seen by the engine.
#[derive(Debug, Clone)]
pub struct LoadRecord {
    pub request: LoadRequest,
    /// Files present in the model directory at load time, sorted. Empty for hub ids.
    pub model_files: Vec<String>,
}

/// Everything a [`MockEngine`] and its models did.
#[derive(Debug, Default)]
pub struct MockEngineLog {
    pub loads: Vec<LoadRecord>,
    /// Model transforms and engine calls in order (`to_device:cuda`, `eval`, `peft`, ...).
    pub events: Vec<String>,
    /// Models dropped so far.
    pub released: usize,
}

#[derive(Debug, Clone)]
pub struct MockEngine {
    capabilities: EngineCapabilities,
    vocab_size: usize,
    fail_load: bool,
    log: Arc<Mutex<MockEngineLog>>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(log: &Mutex<MockEngineLog>) -> MutexGuard<'_, MockEngineLog> {
    log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            capabilities: EngineCapabilities {
                libraries: vec![Library::Transformers, Library::Timm, Library::Diffusers],
                quantization: true,
                device_map: true,
                compile: true,
                peft: true,
                distributed_inference: true,
                autocast: true,
            },
            vocab_size: 8,
            fail_load: false,
            log: Arc::new(Mutex::new(MockEngineLog::default())),
        }
    }

    pub fn with_capabilities(mut self, capabilities: EngineCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Every load fails with an upstream error.
    pub fn failing(mut self) -> Self {
        self.fail_load = true;
        self
    }

    /// Shared handle on the log; stays valid after the engine moves into a backend.
    pub fn log(&self) -> Arc<Mutex<MockEngineLog>> {
        Arc::clone(&self.log)
    }

    fn record(&self, event: impl Into<String>) {
        lock(&self.log).events.push(event.into());
    }
}

#[async_trait]
impl ModelEngine for MockEngine {
    type Model = MockModel;

    fn name(&self) -> &str {
        "mock"
    }

    fn capabilities(&self) -> EngineCapabilities {
        self.capabilities.clone()
    }

    fn linear_layers(&self, config: &PretrainedConfig) -> Result<Vec<LinearLayer>> {
        let hidden = config.hidden_size().unwrap_or(4);
        let layers = config.num_hidden_layers().unwrap_or(1);
        Ok((0..layers)
            .map(|i| LinearLayer::new(format!("layers.{i}.proj"), hidden))
            .collect())
    }

    async fn load(&self, request: &LoadRequest) -> Result<MockModel> {
        let model_dir = Path::new(&request.model);
        let mut model_files: Vec<String> = match std::fs::read_dir(model_dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        };
        model_files.sort();
        lock(&self.log).loads.push(LoadRecord {
            request: request.clone(),
            model_files,
        });

        if self.fail_load {
            return Err(BackendError::upstream(
                format!("model {}", request.model),
                std::io::Error::other("mock load failure"),
            ));
        }

        let config = match request.hub.fetch_optional(&request.model, CONFIG_NAME).await? {
            Some(path) => PretrainedConfig::from_file(&path)?,
            None => PretrainedConfig::default(),
        };
        let generation_config = match request
            .hub
            .fetch_optional(&request.model, GENERATION_CONFIG_NAME)
            .await?
        {
            Some(path) => GenerationConfig::from_file(&path)?,
            None => GenerationConfig::default(),
        };
        if request.init == WeightInit::Pretrained {
            request.hub.fetch_weights(&request.model).await?;
        }

        Ok(MockModel {
            config,
            generation_config,
            vocab_size: self.vocab_size,
            device: if request.place_on_load {
                request.device
            } else {
                Device::Cpu
            },
            eval_mode: false,
            steps: 0,
            log: Arc::clone(&self.log),
        })
    }

    fn empty_cache(&self, device: Device, _ordinal: usize) -> Result<()> {
        self.record(format!("empty_cache:{device}"));
        Ok(())
    }
}

pub struct MockModel {
    config: PretrainedConfig,
    generation_config: GenerationConfig,
    vocab_size: usize,
    device: Device,
    eval_mode: bool,
    steps: usize,
    log: Arc<Mutex<MockEngineLog>>,
}

impl MockModel {
    pub fn generation_config(&self) -> &GenerationConfig {
        &self.generation_config
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn eval_mode(&self) -> bool {
        self.eval_mode
    }

    fn record(&self, event: impl Into<String>) {
        lock(&self.log).events.push(event.into());
    }

    fn batch_size(inputs: &BackendInputs) -> usize {
        inputs.values().map(|v| v.batch_size()).max().unwrap_or(0)
    }
}

impl Drop for MockModel {
    fn drop(&mut self) {
        lock(&self.log).released += 1;
    }
}

impl EngineModel for MockModel {
    type Inputs = BackendInputs;

    fn place_inputs(&self, inputs: BackendInputs) -> Result<BackendInputs> {
        Ok(inputs)
    }

    fn to_device(&mut self, device: Device, _ordinal: usize) -> Result<()> {
        self.record(format!("to_device:{device}"));
        self.device = device;
        Ok(())
    }

    fn generation_config_mut(&mut self) -> &mut GenerationConfig {
        &mut self.generation_config
    }

    fn set_eval_mode(&mut self, eval: bool) {
        self.record("eval");
        self.eval_mode = eval;
    }

    fn tie_weights(&mut self) -> Result<()> {
        self.record("tie_weights");
        Ok(())
    }

    fn apply_peft(&mut self, spec: &PeftSpec) -> Result<()> {
        self.record(format!("peft:{:?}", spec.kind));
        Ok(())
    }

    fn compile(&mut self, _options: &Map<String, Value>) -> Result<()> {
        self.record("compile");
        Ok(())
    }

    fn wrap_distributed(&mut self, _options: &Map<String, Value>) -> Result<()> {
        self.record("distributed");
        Ok(())
    }

    fn seed(&mut self, seed: u64) -> Result<()> {
        self.record(format!("seed:{seed}"));
        Ok(())
    }

    fn forward(&mut self, inputs: &BackendInputs, _kwargs: &CallKwargs) -> Result<BackendOutput> {
        let batch = Self::batch_size(inputs);
        Ok(BackendOutput::Logits(vec![vec![0.0; self.vocab_size]; batch]))
    }

    fn generate(&mut self, inputs: &BackendInputs, kwargs: &CallKwargs) -> Result<BackendOutput> {
        let batch = Self::batch_size(inputs);
        let tokens = kwargs.max_new_tokens.unwrap_or(1);
        Ok(BackendOutput::Tokens(vec![vec![0; tokens]; batch]))
    }

    fn training_step(&mut self, batch: &TrainingBatch, _args: &TrainingArguments) -> Result<f64> {
        if batch.input_ids.is_empty() {
            return Err(BackendError::invalid_input("empty training batch"));
        }
        self.steps += 1;
        Ok(1.0 / self.steps as f64)
    }

    fn save_pretrained(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let data: Vec<u8> = 0f32.to_le_bytes().repeat(self.vocab_size);
        let view = TensorView::new(Dtype::F32, vec![self.vocab_size], &data)?;
        let metadata = Some(HashMap::from([("format".to_string(), "pt".to_string())]));
        safetensors::serialize_to_file(
            [("lm_head.weight", view)],
            &metadata,
            &dir.join(SAFE_WEIGHTS_NAME),
        )?;
        self.config.save_pretrained(dir)?;
        self.generation_config.save_pretrained(dir)?;
        self.record(format!("save:{}", dir.display()));
        Ok(())
    }
}
