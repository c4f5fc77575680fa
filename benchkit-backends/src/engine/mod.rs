//! In-process model engines.
//!
//! [`ModelEngine`] is the seam between the backends and a tensor framework: it
//! resolves architectures, loads checkpoints and reports which optional features it
//! supports. [`EngineModel`] is the loaded model.

pub mod candle;
pub mod mock;

pub use candle::{CandleEngine, CandleModel};
pub use mock::{MockEngine, MockModel};

use crate::backend::{BackendInputs, BackendOutput, CallKwargs};
use crate::peft::PeftSpec;
use crate::quantization::QuantizationConfig;
use crate::training::{TrainingArguments, TrainingBatch};
use async_trait::async_trait;
use benchkit_core::{
    BackendError, Device, GenerationConfig, HubClient, Library, LinearLayer, Precision,
    PretrainedConfig, Result,
};
use serde_json::{Map, Value};
use std::path::Path;

/// Optional features an engine implements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineCapabilities {
    pub libraries: Vec<Library>,
    pub quantization: bool,
    pub device_map: bool,
    pub compile: bool,
    pub peft: bool,
    pub distributed_inference: bool,
    pub autocast: bool,
}

impl EngineCapabilities {
    pub fn supports_library(&self, library: Library) -> bool {
        self.libraries.contains(&library)
    }
}

/// How parameters missing from the checkpoint are initialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WeightInit {
    /// Every parameter must be present in the checkpoint.
    #[default]
    Pretrained,
    /// Missing parameters are drawn from the layers' default initializers.
    Random,
    /// Missing parameters are allocated without initialization.
    Empty,
}

/// Everything an engine needs to load one model.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    /// Hub id or local directory.
    pub model: String,
    pub hub: HubClient,
    pub library: Library,
    pub task: String,
    pub init: WeightInit,
    pub device: Device,
    pub device_ordinal: usize,
    /// Load straight onto `device`. Set for quantized or device-mapped loads.
    pub place_on_load: bool,
    pub device_map: Option<String>,
    pub dtype: Option<Precision>,
    pub quantization: Option<QuantizationConfig>,
    pub attn_implementation: Option<String>,
    pub low_cpu_mem_usage: Option<bool>,
}

#[async_trait]
pub trait ModelEngine: Send + Sync {
    type Model: EngineModel;

    fn name(&self) -> &str;

    fn capabilities(&self) -> EngineCapabilities;

    /// Configuration error unless the engine can build the architecture in `config`.
    fn check_architecture(&self, _config: &PretrainedConfig) -> Result<()> {
        Ok(())
    }

    /// Linear modules of the architecture described by `config`, without loading it.
    fn linear_layers(&self, config: &PretrainedConfig) -> Result<Vec<LinearLayer>>;

    async fn load(&self, request: &LoadRequest) -> Result<Self::Model>;

    /// Synchronize `device` and release cached allocations.
    fn empty_cache(&self, device: Device, ordinal: usize) -> Result<()>;
}

/// A loaded model.
///
/// Transforms an engine does not implement fail with a configuration error; the
/// backends only call them when the engine's capabilities advertise them.
pub trait EngineModel: Send {
    /// Inputs placed on the model's device.
    type Inputs: Send + Sync;

    fn place_inputs(&self, inputs: BackendInputs) -> Result<Self::Inputs>;

    fn to_device(&mut self, device: Device, ordinal: usize) -> Result<()>;

    fn generation_config_mut(&mut self) -> &mut GenerationConfig;

    fn set_eval_mode(&mut self, eval: bool);

    fn tie_weights(&mut self) -> Result<()> {
        Ok(())
    }

    fn apply_peft(&mut self, spec: &PeftSpec) -> Result<()> {
        Err(BackendError::configuration(format!(
            "PEFT {:?} is not supported by this engine",
            spec.kind
        )))
    }

    fn compile(&mut self, _options: &Map<String, Value>) -> Result<()> {
        Err(BackendError::configuration(
            "compilation is not supported by this engine",
        ))
    }

    fn wrap_distributed(&mut self, _options: &Map<String, Value>) -> Result<()> {
        Err(BackendError::configuration(
            "distributed inference is not supported by this engine",
        ))
    }

    fn seed(&mut self, seed: u64) -> Result<()>;

    fn forward(&mut self, inputs: &Self::Inputs, kwargs: &CallKwargs) -> Result<BackendOutput>;

    fn generate(&mut self, inputs: &Self::Inputs, kwargs: &CallKwargs) -> Result<BackendOutput>;

    /// One optimizer step. Returns the batch loss.
    fn training_step(&mut self, batch: &TrainingBatch, args: &TrainingArguments) -> Result<f64>;

    /// Write weights, config and generation config into `dir`.
    fn save_pretrained(&self, dir: &Path) -> Result<()>;
}
