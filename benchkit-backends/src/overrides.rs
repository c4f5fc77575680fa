//! Temporary substitution of configuration fields.

use benchkit_core::{BackendConfig, VolumeMount};
use std::ops::Deref;
use tracing::debug;

/// Swaps fields of a [`BackendConfig`] and puts the originals back on drop.
///
/// Loaders read the model identifier and volumes from the config, so pointing them at
/// a synthesized checkpoint means rewriting those fields for the duration of a load.
/// The guard restores them on every exit path, including `?` and panics.
pub struct ConfigOverride<'a> {
    config: &'a mut BackendConfig,
    original_model: Option<String>,
    original_volumes: Option<Vec<VolumeMount>>,
}

impl<'a> ConfigOverride<'a> {
    pub fn new(config: &'a mut BackendConfig) -> Self {
        Self {
            config,
            original_model: None,
            original_volumes: None,
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        let original = std::mem::replace(&mut self.config.model, model.into());
        self.original_model.get_or_insert(original);
        self
    }

    pub fn volumes(mut self, volumes: Vec<VolumeMount>) -> Self {
        let original = std::mem::replace(&mut self.config.remote.volumes, volumes);
        self.original_volumes.get_or_insert(original);
        self
    }
}

impl Deref for ConfigOverride<'_> {
    type Target = BackendConfig;

    fn deref(&self) -> &BackendConfig {
        self.config
    }
}

impl Drop for ConfigOverride<'_> {
    fn drop(&mut self) {
        if let Some(model) = self.original_model.take() {
            debug!(model, "Restoring model identifier");
            self.config.model = model;
        }
        if let Some(volumes) = self.original_volumes.take() {
            self.config.remote.volumes = volumes;
        }
    }
}
