//! # benchkit-core
//!
//! Shared building blocks of the benchkit backends: configuration records and
//! layered loading, the error taxonomy, logging setup, hub access with the cache
//! layout it implies, pretrained artifacts (model config, generation config,
//! processor), and the two checkpoint helpers used by every backend:
//! [`GenerationConfigPatcher`] and [`WeightMaterializer`].

pub mod config;
pub mod error;
pub mod generation;
pub mod hub;
pub mod logging;
pub mod materializer;
pub mod persistence;
pub mod pretrained;
pub mod processor;
pub mod task;

// Re-export commonly used types at the crate root.
pub use config::{
    BackendConfig, Device, HubOptions, Library, LocalEngineConfig, PortMapping, Precision,
    RemoteServerConfig, VolumeMount, load_config,
};
pub use error::{BackendError, Result};
pub use generation::{GenerationConfig, GenerationConfigPatcher, SENTINEL_TOKEN_ID, TokenIds};
pub use hub::HubClient;
pub use materializer::{
    LinearLayer, MaterializeRequest, NO_WEIGHTS_DIR, NoWeightsModel, WeightMaterializer,
};
pub use pretrained::{PretrainedArtifacts, PretrainedConfig};
pub use processor::PretrainedProcessor;
pub use task::TaskKind;
