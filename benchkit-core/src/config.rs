//! Configuration records for benchkit backends.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! A [`BackendConfig`] is owned by the caller and cloned into each backend at construction,
//! so a backend can temporarily rewrite its own copy without affecting anyone else.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Model library the checkpoint belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Library {
    #[default]
    Transformers,
    Timm,
    Diffusers,
}

impl Library {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transformers => "transformers",
            Self::Timm => "timm",
            Self::Diffusers => "diffusers",
        }
    }
}

impl std::fmt::Display for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution device family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Cuda,
    #[serde(alias = "mps")]
    Metal,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
            Self::Metal => "metal",
        }
    }

    pub fn is_accelerator(&self) -> bool {
        !matches!(self, Self::Cpu)
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Floating point precision for weights and compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Precision {
    #[serde(rename = "float32", alias = "fp32", alias = "f32")]
    Float32,
    #[serde(rename = "float16", alias = "fp16", alias = "f16", alias = "half")]
    Float16,
    #[serde(rename = "bfloat16", alias = "bf16")]
    BFloat16,
}

impl Precision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Float16 => "float16",
            Self::BFloat16 => "bfloat16",
        }
    }
}

/// Options forwarded to every hub lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HubOptions {
    /// Branch, tag or commit to resolve. Defaults to `main`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    /// Hub cache directory. Defaults to [`default_hub_cache`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    /// Access token for gated repositories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Only consult the local cache, never the network.
    #[serde(default)]
    pub offline: bool,
}

impl HubOptions {
    pub fn revision(&self) -> &str {
        self.revision.as_deref().unwrap_or("main")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(default_hub_cache)
    }
}

/// Configuration shared by every backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend name, used in log lines.
    #[serde(default = "default_backend_name")]
    pub name: String,
    /// Hub identifier (`org/name`) or local model directory.
    #[serde(default)]
    pub model: String,
    /// Task the model is benchmarked on (`text-generation`, `feature-extraction`, ...).
    #[serde(default = "default_task")]
    pub task: String,
    #[serde(default)]
    pub library: Library,
    #[serde(default)]
    pub device: Device,
    /// Comma separated accelerator ordinals (`"0,1"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_ids: Option<String>,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Load a randomly initialized model instead of the trained weights.
    #[serde(default)]
    pub no_weights: bool,
    #[serde(default)]
    pub hub: HubOptions,
    #[serde(default)]
    pub local: LocalEngineConfig,
    #[serde(default)]
    pub remote: RemoteServerConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name: default_backend_name(),
            model: String::new(),
            task: default_task(),
            library: Library::default(),
            device: Device::default(),
            device_ids: None,
            seed: default_seed(),
            no_weights: false,
            hub: HubOptions::default(),
            local: LocalEngineConfig::default(),
            remote: RemoteServerConfig::default(),
        }
    }
}

impl BackendConfig {
    /// Shorthand for tests and programmatic callers.
    pub fn new(model: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            task: task.into(),
            ..Self::default()
        }
    }

    /// First accelerator ordinal from `device_ids`, or 0.
    pub fn device_ordinal(&self) -> usize {
        self.device_ids
            .as_deref()
            .and_then(|ids| ids.split(',').next())
            .and_then(|id| id.trim().parse().ok())
            .unwrap_or(0)
    }
}

fn default_backend_name() -> String {
    "benchkit".to_string()
}

fn default_task() -> String {
    "text-generation".to_string()
}

fn default_seed() -> u64 {
    42
}

fn default_true() -> bool {
    true
}

/// Knobs of the in-process engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEngineConfig {
    /// Weight dtype requested at load time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<Precision>,
    /// Automatic device map (`"auto"`); the engine dispatches tensors itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_map: Option<String>,
    /// `gptq`, `awq` or `bnb`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization_scheme: Option<String>,
    /// Overrides merged on top of the checkpoint's own quantization config.
    #[serde(default)]
    pub quantization_config: Map<String, Value>,
    #[serde(default = "default_true")]
    pub eval_mode: bool,
    #[serde(default)]
    pub compile: bool,
    #[serde(default)]
    pub compile_config: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peft_type: Option<String>,
    #[serde(default)]
    pub peft_config: Map<String, Value>,
    /// Wrap the model in a distributed inference engine.
    #[serde(default)]
    pub distributed_inference: bool,
    #[serde(default)]
    pub distributed_inference_config: Map<String, Value>,
    /// KV-cache implementation stored on the generation config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_implementation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attn_implementation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_cpu_mem_usage: Option<bool>,
    #[serde(default)]
    pub autocast_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autocast_dtype: Option<Precision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inter_op_num_threads: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intra_op_num_threads: Option<usize>,
}

impl Default for LocalEngineConfig {
    fn default() -> Self {
        Self {
            dtype: None,
            device_map: None,
            quantization_scheme: None,
            quantization_config: Map::new(),
            eval_mode: true,
            compile: false,
            compile_config: Map::new(),
            peft_type: None,
            peft_config: Map::new(),
            distributed_inference: false,
            distributed_inference_config: Map::new(),
            cache_implementation: None,
            attn_implementation: None,
            low_cpu_mem_usage: None,
            autocast_enabled: false,
            autocast_dtype: None,
            inter_op_num_threads: None,
            intra_op_num_threads: None,
        }
    }
}

/// A host directory mounted into the server container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub host: PathBuf,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_mode")]
    pub mode: String,
}

impl VolumeMount {
    pub fn new(host: impl Into<PathBuf>, bind: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            bind: bind.into(),
            mode: default_mode(),
        }
    }
}

fn default_bind() -> String {
    "/data".to_string()
}

fn default_mode() -> String {
    "rw".to_string()
}

/// A container port published on the host. `host_port == 0` picks a free port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    #[serde(default = "default_container_port")]
    pub container_port: u16,
    #[serde(default = "default_host_ip")]
    pub host_ip: String,
    #[serde(default)]
    pub host_port: u16,
}

impl Default for PortMapping {
    fn default() -> Self {
        Self {
            container_port: default_container_port(),
            host_ip: default_host_ip(),
            host_port: 0,
        }
    }
}

fn default_container_port() -> u16 {
    80
}

fn default_host_ip() -> String {
    "127.0.0.1".to_string()
}

/// Knobs of the containerised inference server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteServerConfig {
    /// Container image used for generation tasks.
    #[serde(default = "default_generation_image")]
    pub generation_image: String,
    /// Container image used for embedding tasks.
    #[serde(default = "default_embedding_image")]
    pub embedding_image: String,
    /// Ordered volumes. The first one doubles as the model download cache.
    #[serde(default = "default_volumes")]
    pub volumes: Vec<VolumeMount>,
    #[serde(default = "default_ports")]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Value for `--gpus` (`"all"`, `"device=0"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpus: Option<String>,
    /// Host devices passed through (`/dev/kfd`, `/dev/dri`).
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharded: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantize: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_shard: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speculate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cuda_graphs: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_custom_kernels: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_remote_code: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_requests: Option<u32>,
    /// Embedding pooling (`cls`, `mean`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pooling: Option<String>,
    /// Upper bound on the wait for the server health check.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
}

impl Default for RemoteServerConfig {
    fn default() -> Self {
        Self {
            generation_image: default_generation_image(),
            embedding_image: default_embedding_image(),
            volumes: default_volumes(),
            ports: default_ports(),
            environment: BTreeMap::new(),
            gpus: None,
            devices: Vec::new(),
            dtype: None,
            sharded: None,
            quantize: None,
            num_shard: None,
            speculate: None,
            cuda_graphs: None,
            disable_custom_kernels: None,
            trust_remote_code: None,
            max_concurrent_requests: None,
            pooling: None,
            startup_timeout_secs: default_startup_timeout(),
        }
    }
}

fn default_generation_image() -> String {
    "ghcr.io/huggingface/text-generation-inference:latest".to_string()
}

fn default_embedding_image() -> String {
    "ghcr.io/huggingface/text-embeddings-inference:cpu-latest".to_string()
}

fn default_volumes() -> Vec<VolumeMount> {
    vec![VolumeMount::new(default_hub_cache(), default_bind())]
}

fn default_ports() -> Vec<PortMapping> {
    vec![PortMapping::default()]
}

fn default_startup_timeout() -> u64 {
    600
}

/// Hub cache directory: `HF_HUB_CACHE`, then `HF_HOME/hub`, then `~/.cache/huggingface/hub`.
pub fn default_hub_cache() -> PathBuf {
    if let Ok(dir) = std::env::var("HF_HUB_CACHE") {
        return PathBuf::from(dir);
    }
    if let Ok(home) = std::env::var("HF_HOME") {
        return PathBuf::from(home).join("hub");
    }
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".cache").join("huggingface").join("hub"))
        .unwrap_or_else(|| PathBuf::from(".cache/huggingface/hub"))
}

/// Load a backend configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `BENCHKIT_`, nested keys split on `__`)
/// 3. The TOML file at `path`, when given and present
/// 4. Built-in defaults
pub fn load_config(
    path: Option<&Path>,
    overrides: Option<&BackendConfig>,
) -> Result<BackendConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(BackendConfig::default()));

    if let Some(path) = path {
        if path.exists() {
            figment = figment.merge(Toml::file(path));
        }
    }

    // BENCHKIT_MODEL, BENCHKIT_LOCAL__DTYPE, BENCHKIT_REMOTE__NUM_SHARD, ...
    figment = figment.merge(Env::prefixed("BENCHKIT_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}
