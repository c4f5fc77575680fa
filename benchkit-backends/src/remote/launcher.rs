//! Server launch description and the launcher/server seams.

use crate::backend::CallKwargs;
use async_trait::async_trait;
use benchkit_core::{
    BackendConfig, BackendError, PortMapping, Result, TaskKind, VolumeMount,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Which inference server a task needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerFlavor {
    /// Text generation server (`/generate`).
    TextGeneration,
    /// Text embeddings server (`/embed`).
    TextEmbedding,
}

impl ServerFlavor {
    /// Flavor serving `task`, or an unsupported-operation error.
    pub fn for_task(task: &str) -> Result<Self> {
        match TaskKind::of(task) {
            TaskKind::TextGeneration => Ok(Self::TextGeneration),
            TaskKind::TextEmbedding => Ok(Self::TextEmbedding),
            TaskKind::Other => Err(BackendError::unsupported(format!(
                "inference servers do not support task {task}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TextGeneration => "text-generation",
            Self::TextEmbedding => "text-embedding",
        }
    }
}

impl std::fmt::Display for ServerFlavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to start one server container.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub flavor: ServerFlavor,
    pub image: String,
    /// Model identifier as seen from inside the container.
    pub model: String,
    /// Server arguments after the image name.
    pub args: Vec<String>,
    pub volumes: Vec<VolumeMount>,
    pub ports: Vec<PortMapping>,
    pub environment: BTreeMap<String, String>,
    pub gpus: Option<String>,
    pub devices: Vec<String>,
    pub startup_timeout: Duration,
}

impl LaunchSpec {
    pub fn from_config(config: &BackendConfig, flavor: ServerFlavor) -> Self {
        let remote = &config.remote;
        let mut args = vec!["--model-id".to_string(), config.model.clone()];
        let mut push = |flag: &str, value: Option<String>| {
            if let Some(value) = value {
                args.push(flag.to_string());
                args.push(value);
            }
        };

        let image = match flavor {
            ServerFlavor::TextGeneration => {
                push("--dtype", remote.dtype.clone());
                push("--sharded", remote.sharded.map(|s| s.to_string()));
                push("--quantize", remote.quantize.clone());
                push("--num-shard", remote.num_shard.map(|n| n.to_string()));
                push("--speculate", remote.speculate.map(|n| n.to_string()));
                push(
                    "--cuda-graphs",
                    remote.cuda_graphs.as_ref().map(|graphs| {
                        graphs
                            .iter()
                            .map(u32::to_string)
                            .collect::<Vec<_>>()
                            .join(",")
                    }),
                );
                push(
                    "--max-concurrent-requests",
                    remote.max_concurrent_requests.map(|n| n.to_string()),
                );
                if remote.disable_custom_kernels == Some(true) {
                    args.push("--disable-custom-kernels".to_string());
                }
                if remote.trust_remote_code == Some(true) {
                    args.push("--trust-remote-code".to_string());
                }
                remote.generation_image.clone()
            }
            ServerFlavor::TextEmbedding => {
                push("--dtype", remote.dtype.clone());
                push("--pooling", remote.pooling.clone());
                push(
                    "--max-concurrent-requests",
                    remote.max_concurrent_requests.map(|n| n.to_string()),
                );
                remote.embedding_image.clone()
            }
        };

        Self {
            flavor,
            image,
            model: config.model.clone(),
            args,
            volumes: remote.volumes.clone(),
            ports: remote.ports.clone(),
            environment: remote.environment.clone(),
            gpus: remote.gpus.clone(),
            devices: remote.devices.clone(),
            startup_timeout: Duration::from_secs(remote.startup_timeout_secs),
        }
    }
}

/// Parameters of a `/generate` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenerateParameters {
    pub do_sample: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_new_tokens: Option<usize>,
}

impl From<&CallKwargs> for GenerateParameters {
    fn from(kwargs: &CallKwargs) -> Self {
        Self {
            do_sample: kwargs.do_sample.unwrap_or(false),
            max_new_tokens: kwargs.max_new_tokens,
        }
    }
}

/// A running inference server.
#[async_trait]
pub trait InferenceServer: Send + Sync {
    /// Base URL of the server API.
    fn endpoint(&self) -> &str;

    /// One completion per prompt, in order.
    async fn generate(
        &self,
        prompts: &[String],
        parameters: &GenerateParameters,
    ) -> Result<Vec<String>>;

    /// One embedding per text, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Stop the server. Calling it again is a no-op.
    async fn close(&mut self) -> Result<()>;
}

/// Starts servers from a [`LaunchSpec`].
#[async_trait]
pub trait ServerLauncher: Send + Sync {
    type Server: InferenceServer;

    /// Start a server and wait until it reports healthy.
    async fn launch(&self, spec: &LaunchSpec) -> Result<Self::Server>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_flavor_for_task() {
        assert_eq!(
            ServerFlavor::for_task("text-generation").unwrap(),
            ServerFlavor::TextGeneration
        );
        assert_eq!(
            ServerFlavor::for_task("sentence-similarity").unwrap(),
            ServerFlavor::TextEmbedding
        );
        assert!(ServerFlavor::for_task("image-classification")
            .unwrap_err()
            .is_unsupported());
    }

    #[test]
    fn test_generation_args() {
        let mut config = BackendConfig::new("org/model", "text-generation");
        config.remote.dtype = Some("bfloat16".to_string());
        config.remote.num_shard = Some(2);
        config.remote.cuda_graphs = Some(vec![1, 2, 4]);
        config.remote.trust_remote_code = Some(true);
        config.remote.pooling = Some("mean".to_string());

        let spec = LaunchSpec::from_config(&config, ServerFlavor::TextGeneration);
        assert_eq!(
            spec.args,
            vec![
                "--model-id",
                "org/model",
                "--dtype",
                "bfloat16",
                "--num-shard",
                "2",
                "--cuda-graphs",
                "1,2,4",
                "--trust-remote-code",
            ]
        );
        assert!(spec.image.contains("text-generation-inference"));
        assert_eq!(spec.startup_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_embedding_args() {
        let mut config = BackendConfig::new("org/embedder", "feature-extraction");
        config.remote.pooling = Some("cls".to_string());
        config.remote.num_shard = Some(2);
        config.remote.max_concurrent_requests = Some(64);

        let spec = LaunchSpec::from_config(&config, ServerFlavor::TextEmbedding);
        assert_eq!(
            spec.args,
            vec![
                "--model-id",
                "org/embedder",
                "--pooling",
                "cls",
                "--max-concurrent-requests",
                "64",
            ]
        );
        assert!(spec.image.contains("text-embeddings-inference"));
    }

    #[test]
    fn test_generate_parameters_default_greedy() {
        let params = GenerateParameters::from(&CallKwargs::default());
        assert!(!params.do_sample);
        assert_eq!(
            serde_json::to_value(&params).unwrap(),
            serde_json::json!({"do_sample": false})
        );
    }
}
