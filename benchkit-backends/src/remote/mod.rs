//! Backend proxying calls to a containerised inference server.
//!
//! Construction prepares weights on the host, then starts a server over them:
//!
//! ```text
//! Uninitialized -> WeightsPrepared{Pretrained|Synthesized} -> ServerLaunched -> Ready
//! ```
//!
//! Downloaded models go straight into the hub cache mounted as the first volume.
//! A no-weights model is written to a temporary directory, completed with randomly
//! initialized tensors by a [`ModelEngine`] (the servers refuse missing tensors) and
//! mounted at `/data` for the launch. The directory is removed once the server is
//! ready, since the server holds the weights in memory from then on.
//!
//! The task selects the server flavor. A task no server serves is not an error at
//! construction: nothing is launched and every call fails as unsupported.

pub mod client;
pub mod docker;
pub mod launcher;
pub mod mock;

pub use client::ServerClient;
pub use docker::{DockerLauncher, DockerServer};
pub use launcher::{
    GenerateParameters, InferenceServer, LaunchSpec, ServerFlavor, ServerLauncher,
};
pub use mock::{MockLauncher, MockServer, MockServerLog};

use crate::backend::{Backend, BackendInputs, BackendOutput, CallKwargs, WeightsSource};
use crate::engine::{CandleEngine, EngineModel, LoadRequest, ModelEngine, WeightInit};
use crate::overrides::ConfigOverride;
use async_trait::async_trait;
use benchkit_core::hub::{self, GENERATION_CONFIG_NAME};
use benchkit_core::{
    BackendConfig, BackendError, Device, GenerationConfig, GenerationConfigPatcher, HubClient,
    Library, MaterializeRequest, NO_WEIGHTS_DIR, PretrainedArtifacts, PretrainedProcessor,
    Result, TaskKind, VolumeMount, WeightMaterializer,
};
use tracing::{debug, info, warn};

/// Mount point of the temporary directory inside the server container.
pub const CONTAINER_DATA_DIR: &str = "/data";

/// Decoded inputs, shaped for the running server flavor.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerInputs {
    /// Prompts for a text-generation server.
    Prompt(Vec<String>),
    /// Texts for a text-embeddings server.
    Text(Vec<String>),
}

/// Construction progress of a [`RemoteServerBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    Uninitialized,
    WeightsPrepared(WeightsSource),
    ServerLaunched,
    Ready,
}

/// Runs a model inside a text-generation or text-embeddings server.
pub struct RemoteServerBackend<L: ServerLauncher = DockerLauncher, E: ModelEngine = CandleEngine> {
    config: BackendConfig,
    launcher: L,
    engine: E,
    processor: PretrainedProcessor,
    state: RemoteState,
    server: Option<L::Server>,
}

impl RemoteServerBackend<DockerLauncher, CandleEngine> {
    /// Build a backend launching containers with the `docker` CLI.
    pub async fn new(config: BackendConfig) -> Result<Self> {
        Self::with_parts(config, DockerLauncher::new(), CandleEngine::new()).await
    }
}

impl<L: ServerLauncher, E: ModelEngine> RemoteServerBackend<L, E> {
    pub async fn with_parts(config: BackendConfig, launcher: L, engine: E) -> Result<Self> {
        if config.library != Library::Transformers {
            return Err(BackendError::configuration(format!(
                "inference servers do not support library {}",
                config.library
            )));
        }
        if !config.no_weights && hub::is_local_model(&config.model) {
            return Err(BackendError::configuration(format!(
                "inference servers load hub models only, {} is a local directory",
                config.model
            )));
        }
        if config.remote.volumes.is_empty() {
            return Err(BackendError::configuration(
                "inference servers need at least one volume",
            ));
        }

        let mut backend = Self {
            config,
            launcher,
            engine,
            processor: PretrainedProcessor::default(),
            state: RemoteState::Uninitialized,
            server: None,
        };
        let Some(flavor) = backend.flavor() else {
            warn!(
                backend = %backend.config.name,
                task = %backend.config.task,
                "No inference server serves this task, nothing launched"
            );
            return Ok(backend);
        };

        info!(
            backend = %backend.config.name,
            model = %backend.config.model,
            %flavor,
            "Building remote server backend"
        );
        if backend.config.no_weights {
            backend.launch_synthesized(flavor).await?;
        } else {
            backend.launch_downloaded(flavor).await?;
        }
        backend.state = RemoteState::Ready;
        info!(backend = %backend.config.name, "Remote server backend ready");
        Ok(backend)
    }

    /// Server flavor serving the configured task, if any.
    pub fn flavor(&self) -> Option<ServerFlavor> {
        ServerFlavor::for_task(&self.config.task).ok()
    }

    pub fn state(&self) -> RemoteState {
        self.state
    }

    pub fn server(&self) -> Option<&L::Server> {
        self.server.as_ref()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    fn is_generation(&self) -> bool {
        TaskKind::of(&self.config.task).is_generation()
    }

    async fn launch_downloaded(&mut self, flavor: ServerFlavor) -> Result<()> {
        let volume = self.config.remote.volumes[0].host.clone();
        let hub = HubClient::new(self.config.hub.clone()).with_cache_dir(&volume);
        let model = self.config.model.clone();

        hub.snapshot_download(&model).await?;
        self.processor = PretrainedProcessor::load(&hub, &model).await?;

        if self.is_generation() {
            let snapshot = hub::snapshot_dir(&volume, &model, hub.options().revision())?;
            let mut generation_config =
                match hub.fetch_optional(&model, GENERATION_CONFIG_NAME).await? {
                    Some(path) => GenerationConfig::from_file(&path)?,
                    None => GenerationConfig::default(),
                };
            info!(snapshot = %snapshot.display(), "Patching generation config for fixed length generation");
            GenerationConfigPatcher.patch_and_save(&mut generation_config, &snapshot)?;
        }
        self.state = RemoteState::WeightsPrepared(WeightsSource::Pretrained);

        let spec = LaunchSpec::from_config(&self.config, flavor);
        self.server = Some(self.launcher.launch(&spec).await?);
        self.state = RemoteState::ServerLaunched;
        Ok(())
    }

    async fn launch_synthesized(&mut self, flavor: ServerFlavor) -> Result<()> {
        let hub = HubClient::new(self.config.hub.clone());
        let artifacts =
            PretrainedArtifacts::load(&hub, &self.config.model, self.config.library).await?;
        let pretrained = artifacts.require_config("a no weights model")?;
        self.engine.check_architecture(pretrained).map_err(|e| {
            BackendError::configuration(format!(
                "a no weights {flavor} server needs random weights from the {} engine: {e}",
                self.engine.name()
            ))
        })?;

        let tmpdir = tempfile::Builder::new().prefix("benchkit-").tempdir()?;

        let generation_config = self
            .is_generation()
            .then(|| artifacts.generation_config.clone().unwrap_or_default());
        let no_weights = WeightMaterializer::new(tmpdir.path()).materialize(MaterializeRequest {
            config: pretrained,
            quantization_config: None,
            g_idx_layers: &[],
            processor: &artifacts.processor,
            generation_config: generation_config.as_ref(),
        })?;
        self.processor = artifacts.processor.clone();

        info!(dir = %no_weights.dir().display(), "Materializing random weights for the server");
        let request = LoadRequest {
            model: no_weights.model_id(),
            hub,
            library: self.config.library,
            task: self.config.task.clone(),
            init: WeightInit::Random,
            device: Device::Cpu,
            device_ordinal: 0,
            place_on_load: false,
            device_map: None,
            dtype: None,
            quantization: None,
            attn_implementation: None,
            low_cpu_mem_usage: None,
        };
        let model = self.engine.load(&request).await?;
        model.save_pretrained(no_weights.dir())?;
        drop(model);
        self.engine.empty_cache(Device::Cpu, 0)?;

        if let Some(mut generation_config) = generation_config {
            // The engine's save rewrote generation_config.json.
            GenerationConfigPatcher.patch_and_save(&mut generation_config, no_weights.dir())?;
        }
        self.state = RemoteState::WeightsPrepared(WeightsSource::Synthesized);

        let guard = ConfigOverride::new(&mut self.config)
            .volumes(vec![VolumeMount::new(tmpdir.path(), CONTAINER_DATA_DIR)])
            .model(format!("{CONTAINER_DATA_DIR}/{NO_WEIGHTS_DIR}"));
        let spec = LaunchSpec::from_config(&guard, flavor);
        debug!(model = %spec.model, "Launching server on no weights model");
        let server = self.launcher.launch(&spec).await;
        drop(guard);

        self.server = Some(server?);
        self.state = RemoteState::ServerLaunched;

        debug!(dir = %tmpdir.path().display(), "Removing no weights checkpoint");
        tmpdir.close()?;
        Ok(())
    }

    fn running_server(&self) -> Result<&L::Server> {
        self.server
            .as_ref()
            .ok_or_else(|| BackendError::NotLoaded(self.config.model.clone()))
    }

    fn require_flavor(&self, flavor: ServerFlavor, operation: &str) -> Result<()> {
        let served = ServerFlavor::for_task(&self.config.task)?;
        if served != flavor {
            return Err(BackendError::unsupported(format!(
                "{operation} is not served by a {served} server (task {})",
                self.config.task
            )));
        }
        Ok(())
    }

    async fn generate_texts(
        &self,
        inputs: &ServerInputs,
        kwargs: &CallKwargs,
        operation: &str,
    ) -> Result<BackendOutput> {
        self.require_flavor(ServerFlavor::TextGeneration, operation)?;
        let ServerInputs::Prompt(prompts) = inputs else {
            return Err(BackendError::invalid_input(format!(
                "{operation} needs prompts"
            )));
        };
        let parameters = GenerateParameters::from(kwargs);
        let texts = self.running_server()?.generate(prompts, &parameters).await?;
        Ok(BackendOutput::Texts(texts))
    }
}

#[async_trait]
impl<L: ServerLauncher, E: ModelEngine> Backend for RemoteServerBackend<L, E> {
    type Inputs = ServerInputs;

    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn seed(&mut self) -> Result<()> {
        debug!(seed = self.config.seed, "Server sampling is not seedable, nothing to do");
        Ok(())
    }

    fn prepare_inputs(&self, mut inputs: BackendInputs) -> Result<ServerInputs> {
        let flavor = ServerFlavor::for_task(&self.config.task)?;
        let rows = inputs
            .remove("input_ids")
            .and_then(|value| value.as_tokens().map(<[Vec<u32>]>::to_vec))
            .ok_or_else(|| BackendError::invalid_input("inference servers need input_ids"))?;
        let texts = self.processor.batch_decode(&rows)?;
        Ok(match flavor {
            ServerFlavor::TextGeneration => ServerInputs::Prompt(texts),
            ServerFlavor::TextEmbedding => ServerInputs::Text(texts),
        })
    }

    async fn forward(
        &mut self,
        inputs: &ServerInputs,
        _kwargs: &CallKwargs,
    ) -> Result<BackendOutput> {
        self.require_flavor(ServerFlavor::TextEmbedding, "forward")?;
        let ServerInputs::Text(texts) = inputs else {
            return Err(BackendError::invalid_input("forward needs texts"));
        };
        let embeddings = self.running_server()?.embed(texts).await?;
        Ok(BackendOutput::Embeddings(embeddings))
    }

    async fn prefill(
        &mut self,
        inputs: &ServerInputs,
        kwargs: &CallKwargs,
    ) -> Result<BackendOutput> {
        self.generate_texts(inputs, kwargs, "prefill").await
    }

    async fn generate(
        &mut self,
        inputs: &ServerInputs,
        kwargs: &CallKwargs,
    ) -> Result<BackendOutput> {
        self.generate_texts(inputs, kwargs, "generate").await
    }

    async fn clean(&mut self) -> Result<()> {
        if let Some(mut server) = self.server.take() {
            info!(endpoint = server.endpoint(), "Stopping inference server");
            server.close().await?;
        }
        self.state = RemoteState::Uninitialized;
        Ok(())
    }
}
