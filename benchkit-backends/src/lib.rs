//! # benchkit-backends: model backends for the benchmark harness
//!
//! Two implementations of the [`Backend`] contract:
//!
//! - [`LocalEngineBackend`] loads a model in-process through a [`ModelEngine`]
//!   (candle by default) and runs forward, prefill, generate and training calls.
//! - [`RemoteServerBackend`] starts a text-generation or text-embeddings server in a
//!   container and proxies calls to it over HTTP.
//!
//! Both can benchmark a model without its trained weights: a tiny placeholder
//! checkpoint is written to a temporary directory and the architecture is loaded
//! with random initialization instead.

// Contract
pub mod backend;

// Construction helpers
pub mod overrides;
pub mod peft;
pub mod quantization;
pub mod session;

// Engines and training
pub mod engine;
pub mod training;

// Backends
pub mod local;
pub mod remote;

// Re-exports
pub use backend::{
    Backend, BackendInputs, BackendOutput, CallKwargs, InputValue, WeightsSource,
};
pub use engine::{
    CandleEngine, EngineCapabilities, EngineModel, LoadRequest, MockEngine, ModelEngine,
    WeightInit,
};
pub use local::{LoadState, LocalEngineBackend};
pub use overrides::ConfigOverride;
pub use peft::{PeftKind, PeftSpec};
pub use quantization::{QuantMethod, QuantizationConfig};
pub use remote::{
    DockerLauncher, InferenceServer, LaunchSpec, MockLauncher, RemoteServerBackend, RemoteState,
    ServerFlavor, ServerInputs, ServerLauncher,
};
pub use session::ProcessSettings;
pub use training::{
    DataCollator, DefaultDataCollator, TrainerCallback, TrainerState, TrainingArguments,
    TrainingExample,
};
