//! In-process backend.
//!
//! [`LocalEngineBackend`] loads a model through a [`ModelEngine`] and runs every
//! benchmark call in the current process. Construction walks a fixed sequence:
//!
//! ```text
//! Uninitialized -> QuantizationResolved -> WeightsSourced -> Placed -> Transformed -> Ready
//! ```
//!
//! Every configuration problem that can be detected from the config and the engine's
//! capabilities is reported before the first file is fetched.

use crate::backend::{Backend, BackendInputs, BackendOutput, CallKwargs, WeightsSource};
use crate::engine::{CandleEngine, EngineModel, LoadRequest, ModelEngine, WeightInit};
use crate::overrides::ConfigOverride;
use crate::peft::PeftSpec;
use crate::quantization::QuantizationConfig;
use crate::session::ProcessSettings;
use crate::training::{
    DataCollator, Trainer, TrainerCallback, TrainerState, TrainingArguments, TrainingExample,
};
use async_trait::async_trait;
use benchkit_core::{
    BackendConfig, BackendError, HubClient, Library, MaterializeRequest, PretrainedArtifacts,
    Result, TaskKind, WeightMaterializer,
};
use tracing::{debug, info};

/// Construction progress of a [`LocalEngineBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Uninitialized,
    QuantizationResolved,
    WeightsSourced(WeightsSource),
    Placed,
    Transformed {
        compiled: bool,
        peft: bool,
        distributed: bool,
    },
    Ready,
}

/// Runs a model in-process through a [`ModelEngine`].
pub struct LocalEngineBackend<E: ModelEngine = CandleEngine> {
    config: BackendConfig,
    engine: E,
    settings: ProcessSettings,
    artifacts: PretrainedArtifacts,
    quantization: Option<QuantizationConfig>,
    state: LoadState,
    model: Option<E::Model>,
}

impl LocalEngineBackend<CandleEngine> {
    /// Build a backend on the candle engine.
    pub async fn new(config: BackendConfig) -> Result<Self> {
        Self::with_engine(config, CandleEngine::new()).await
    }
}

impl<E: ModelEngine> LocalEngineBackend<E> {
    pub async fn with_engine(config: BackendConfig, engine: E) -> Result<Self> {
        let (settings, peft) = validate(&config, &engine)?;
        settings.apply();

        info!(
            backend = %config.name,
            engine = engine.name(),
            model = %config.model,
            library = %config.library,
            "Building local backend"
        );

        let hub = HubClient::new(config.hub.clone());
        let artifacts = PretrainedArtifacts::load(&hub, &config.model, config.library).await?;
        if let Some(pretrained) = &artifacts.config {
            engine.check_architecture(pretrained)?;
        }

        let mut backend = Self {
            config,
            engine,
            settings,
            artifacts,
            quantization: None,
            state: LoadState::Uninitialized,
            model: None,
        };

        backend.resolve_quantization()?;
        backend.source_weights().await?;
        backend.place()?;
        backend.transform(peft.as_ref())?;
        backend.seed()?;
        backend.state = LoadState::Ready;
        info!(backend = %backend.config.name, "Local backend ready");
        Ok(backend)
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// The loaded model, until [`Backend::clean`] releases it.
    pub fn model(&self) -> Option<&E::Model> {
        self.model.as_ref()
    }

    pub fn quantization(&self) -> Option<&QuantizationConfig> {
        self.quantization.as_ref()
    }

    fn loaded_model(&self) -> Result<&E::Model> {
        self.model
            .as_ref()
            .ok_or_else(|| BackendError::NotLoaded(self.config.model.clone()))
    }

    fn loaded_model_mut(&mut self) -> Result<&mut E::Model> {
        self.model
            .as_mut()
            .ok_or_else(|| BackendError::NotLoaded(self.config.model.clone()))
    }

    fn resolve_quantization(&mut self) -> Result<()> {
        let local = &self.config.local;
        let quantization = QuantizationConfig::resolve(
            local.quantization_scheme.as_deref(),
            self.artifacts.config.as_ref(),
            &local.quantization_config,
        )?;

        if let Some(quantization) = &quantization {
            // The checkpoint itself may carry a scheme the entry checks could not see.
            if !self.engine.capabilities().quantization {
                return Err(BackendError::configuration(format!(
                    "engine {} does not support {} quantization",
                    self.engine.name(),
                    quantization.method
                )));
            }
            if local.distributed_inference {
                return Err(BackendError::configuration(
                    "distributed inference with quantization is not supported",
                ));
            }
            info!(method = %quantization.method, bits = ?quantization.bits(), "Quantization resolved");
        }

        self.quantization = quantization;
        self.state = LoadState::QuantizationResolved;
        Ok(())
    }

    async fn source_weights(&mut self) -> Result<()> {
        let source = if self.config.no_weights {
            self.load_synthesized().await?;
            WeightsSource::Synthesized
        } else {
            info!(model = %self.config.model, "Loading pretrained model");
            let request = load_request(
                &self.config,
                &self.settings,
                self.quantization.as_ref(),
                WeightInit::Pretrained,
            );
            self.model = Some(self.engine.load(&request).await?);
            WeightsSource::Pretrained
        };
        self.state = LoadState::WeightsSourced(source);
        Ok(())
    }

    async fn load_synthesized(&mut self) -> Result<()> {
        let tmpdir = tempfile::Builder::new().prefix("benchkit-").tempdir()?;
        let pretrained = self.artifacts.require_config("a no weights model")?;

        let g_idx_layers = match &self.quantization {
            Some(q) if q.uses_exllama_v2() => self.engine.linear_layers(pretrained)?,
            _ => Vec::new(),
        };
        let quantization_config = self.quantization.as_ref().map(QuantizationConfig::to_map);
        let generation_config = TaskKind::of(&self.config.task)
            .is_generation()
            .then_some(self.artifacts.generation_config.as_ref())
            .flatten();

        let no_weights = WeightMaterializer::new(tmpdir.path()).materialize(MaterializeRequest {
            config: pretrained,
            quantization_config: quantization_config.as_ref(),
            g_idx_layers: &g_idx_layers,
            processor: &self.artifacts.processor,
            generation_config,
        })?;

        // An uninitialized model is enough when a distributed engine takes over placement.
        let init = if self.config.local.distributed_inference {
            WeightInit::Empty
        } else {
            WeightInit::Random
        };
        info!(dir = %no_weights.dir().display(), ?init, "Loading no weights model");

        let guard = ConfigOverride::new(&mut self.config).model(no_weights.model_id());
        let request = load_request(&guard, &self.settings, self.quantization.as_ref(), init);
        let mut model = self.engine.load(&request).await?;
        drop(guard);

        if init == WeightInit::Empty {
            debug!("Tying weights of empty model");
            model.tie_weights()?;
        }
        self.model = Some(model);

        // The engine holds every tensor; the checkpoint only served the load.
        debug!(dir = %tmpdir.path().display(), "Removing no weights checkpoint");
        tmpdir.close()?;
        Ok(())
    }

    fn place(&mut self) -> Result<()> {
        let device = self.config.device;
        let ordinal = self.config.device_ordinal();
        let placed_on_load =
            self.quantization.is_some() || self.config.local.device_map.is_some();

        if placed_on_load {
            debug!("Model placed by the engine at load time");
        } else if device.is_accelerator() {
            info!(%device, ordinal, "Moving model to device");
            self.loaded_model_mut()?.to_device(device, ordinal)?;
        }
        self.state = LoadState::Placed;
        Ok(())
    }

    fn transform(&mut self, peft: Option<&PeftSpec>) -> Result<()> {
        let local = self.config.local.clone();
        let library = self.config.library;
        let model = self.loaded_model_mut()?;

        if let Some(cache) = &local.cache_implementation {
            info!(cache, "Setting cache implementation");
            model.generation_config_mut().cache_implementation = Some(cache.clone());
        }
        if local.eval_mode && library != Library::Diffusers {
            debug!("Switching model to eval mode");
            model.set_eval_mode(true);
        }
        if let Some(peft) = peft {
            info!(kind = ?peft.kind, "Applying PEFT adapter");
            model.apply_peft(peft)?;
        }
        if local.compile {
            info!("Compiling model");
            model.compile(&local.compile_config)?;
        }
        if local.distributed_inference {
            info!("Wrapping model for distributed inference");
            model.wrap_distributed(&local.distributed_inference_config)?;
        }

        self.state = LoadState::Transformed {
            compiled: local.compile,
            peft: peft.is_some(),
            distributed: local.distributed_inference,
        };
        Ok(())
    }
}

/// Entry checks. Returns the process settings and the resolved PEFT adapter, if any.
fn validate<E: ModelEngine>(
    config: &BackendConfig,
    engine: &E,
) -> Result<(ProcessSettings, Option<PeftSpec>)> {
    let capabilities = engine.capabilities();
    let local = &config.local;
    let unsupported = |feature: &str| {
        BackendError::configuration(format!(
            "engine {} does not support {feature}",
            engine.name()
        ))
    };

    if !capabilities.supports_library(config.library) {
        return Err(BackendError::configuration(format!(
            "library {} not supported by engine {}",
            config.library,
            engine.name()
        )));
    }
    if config.no_weights && matches!(config.library, Library::Diffusers | Library::Timm) {
        return Err(BackendError::configuration(format!(
            "no weights model not supported for library {}",
            config.library
        )));
    }
    if local.distributed_inference && local.quantization_scheme.is_some() {
        return Err(BackendError::configuration(
            "distributed inference with quantization is not supported",
        ));
    }
    let settings = ProcessSettings::from_config(config)?;
    if local.autocast_enabled && !capabilities.autocast {
        return Err(unsupported("autocast"));
    }
    if local.quantization_scheme.is_some() && !capabilities.quantization {
        return Err(unsupported("quantization"));
    }
    if local.device_map.is_some() && !capabilities.device_map {
        return Err(unsupported("device maps"));
    }
    if local.compile && !capabilities.compile {
        return Err(unsupported("compilation"));
    }
    if local.distributed_inference && !capabilities.distributed_inference {
        return Err(unsupported("distributed inference"));
    }
    let peft = PeftSpec::resolve(local.peft_type.as_deref(), &local.peft_config)?;
    if peft.is_some() && !capabilities.peft {
        return Err(unsupported("PEFT"));
    }
    Ok((settings, peft))
}

fn load_request(
    config: &BackendConfig,
    settings: &ProcessSettings,
    quantization: Option<&QuantizationConfig>,
    init: WeightInit,
) -> LoadRequest {
    LoadRequest {
        model: config.model.clone(),
        hub: HubClient::new(config.hub.clone()),
        library: config.library,
        task: config.task.clone(),
        init,
        device: config.device,
        device_ordinal: config.device_ordinal(),
        place_on_load: quantization.is_some() || config.local.device_map.is_some(),
        device_map: config.local.device_map.clone(),
        dtype: settings.compute_dtype(config.local.dtype),
        quantization: quantization.cloned(),
        attn_implementation: config.local.attn_implementation.clone(),
        low_cpu_mem_usage: config.local.low_cpu_mem_usage,
    }
}

#[async_trait]
impl<E: ModelEngine> Backend for LocalEngineBackend<E> {
    type Inputs = <E::Model as EngineModel>::Inputs;

    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn seed(&mut self) -> Result<()> {
        let seed = self.settings.seed;
        debug!(seed, "Seeding engine");
        self.loaded_model_mut()?.seed(seed)
    }

    fn prepare_inputs(&self, mut inputs: BackendInputs) -> Result<Self::Inputs> {
        let inputs = match self.config.library {
            Library::Diffusers => {
                let prompt = inputs.remove("prompt").ok_or_else(|| {
                    BackendError::invalid_input("diffusers inputs need a prompt")
                })?;
                BackendInputs::from([("prompt".to_string(), prompt)])
            }
            Library::Timm => {
                if let Some(pixels) = inputs.remove("pixel_values") {
                    inputs.insert("x".to_string(), pixels);
                }
                inputs
            }
            Library::Transformers => inputs,
        };
        self.loaded_model()?.place_inputs(inputs)
    }

    async fn forward(
        &mut self,
        inputs: &Self::Inputs,
        kwargs: &CallKwargs,
    ) -> Result<BackendOutput> {
        self.loaded_model_mut()?.forward(inputs, kwargs)
    }

    async fn prefill(
        &mut self,
        inputs: &Self::Inputs,
        kwargs: &CallKwargs,
    ) -> Result<BackendOutput> {
        self.loaded_model_mut()?.generate(inputs, kwargs)
    }

    async fn generate(
        &mut self,
        inputs: &Self::Inputs,
        kwargs: &CallKwargs,
    ) -> Result<BackendOutput> {
        self.loaded_model_mut()?.generate(inputs, kwargs)
    }

    async fn train(
        &mut self,
        dataset: Vec<TrainingExample>,
        args: &TrainingArguments,
        callbacks: Vec<Box<dyn TrainerCallback>>,
        collator: &dyn DataCollator,
    ) -> Result<TrainerState> {
        info!(samples = dataset.len(), "Training model");
        let model = self.loaded_model_mut()?;
        Trainer::new(model, args, callbacks, collator).train(&dataset)
    }

    async fn clean(&mut self) -> Result<()> {
        if self.model.take().is_some() {
            info!(backend = %self.config.name, "Released model");
            if self.config.device.is_accelerator() {
                self.engine
                    .empty_cache(self.config.device, self.config.device_ordinal())?;
            }
        }
        self.state = LoadState::Uninitialized;
        Ok(())
    }
}
