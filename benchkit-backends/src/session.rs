//! Process-scoped settings applied while a backend is built.
//!
//! Thread counts and the autocast dtype are process-wide: they affect every model in
//! the process, not just the backend that set them. They are gathered here so that
//! construction applies them in one visible place.

use benchkit_core::{BackendConfig, BackendError, Device, Precision, Result};
use tracing::{info, warn};

/// Environment variable read by the CPU kernels' thread pool.
pub const INTRA_OP_THREADS_VAR: &str = "RAYON_NUM_THREADS";

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSettings {
    pub intra_op_threads: Option<usize>,
    pub inter_op_threads: Option<usize>,
    /// Compute dtype forced by autocast, when enabled.
    pub autocast_dtype: Option<Precision>,
    pub autocast_enabled: bool,
    pub seed: u64,
}

impl ProcessSettings {
    /// Collect and validate the process-wide knobs of `config`.
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        let local = &config.local;
        if local.autocast_enabled
            && local.autocast_dtype.is_some()
            && !matches!(config.device, Device::Cpu | Device::Cuda)
        {
            return Err(BackendError::configuration(format!(
                "device {} not supported for autocast",
                config.device
            )));
        }

        Ok(Self {
            intra_op_threads: local.intra_op_num_threads,
            inter_op_threads: local.inter_op_num_threads,
            autocast_dtype: local.autocast_dtype.filter(|_| local.autocast_enabled),
            autocast_enabled: local.autocast_enabled,
            seed: config.seed,
        })
    }

    /// Apply the thread settings to the current process.
    pub fn apply(&self) {
        if let Some(threads) = self.intra_op_threads {
            info!(threads, "Setting intra-op thread count");
            // SAFETY: called during backend construction, before the engine spawns
            // its worker threads.
            unsafe { std::env::set_var(INTRA_OP_THREADS_VAR, threads.to_string()) };
        }
        if let Some(threads) = self.inter_op_threads {
            warn!(
                threads,
                "Inter-op thread count has no effect on this engine, ignoring"
            );
        }
        if self.autocast_enabled {
            info!(dtype = ?self.autocast_dtype, "Enabling automatic mixed precision");
        }
    }

    /// The dtype a model should be loaded with: explicit dtype first, then autocast.
    pub fn compute_dtype(&self, requested: Option<Precision>) -> Option<Precision> {
        requested.or(self.autocast_dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_autocast_rejected_on_metal() {
        let mut config = BackendConfig::new("m", "text-generation");
        config.device = Device::Metal;
        config.local.autocast_enabled = true;
        config.local.autocast_dtype = Some(Precision::Float16);
        assert!(ProcessSettings::from_config(&config).unwrap_err().is_configuration());

        config.device = Device::Cuda;
        let settings = ProcessSettings::from_config(&config).unwrap();
        assert_eq!(settings.compute_dtype(None), Some(Precision::Float16));
        assert_eq!(
            settings.compute_dtype(Some(Precision::Float32)),
            Some(Precision::Float32)
        );
    }

    #[test]
    fn test_autocast_dtype_ignored_when_disabled() {
        let mut config = BackendConfig::new("m", "text-generation");
        config.local.autocast_dtype = Some(Precision::BFloat16);
        let settings = ProcessSettings::from_config(&config).unwrap();
        assert_eq!(settings.compute_dtype(None), None);
    }

    #[test]
    fn test_apply_sets_intra_op_threads() {
        let mut config = BackendConfig::new("m", "text-generation");
        config.local.intra_op_num_threads = Some(2);
        config.local.inter_op_num_threads = Some(4);
        ProcessSettings::from_config(&config).unwrap().apply();
        assert_eq!(std::env::var(INTRA_OP_THREADS_VAR).unwrap(), "2");
    }
}
