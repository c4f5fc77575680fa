//! Fine-tuning loop driven through [`EngineModel::training_step`].

pub mod callbacks;

pub use callbacks::{
    AnomalyDetectionCallback, CallbackAction, CheckpointCallback, EarlyStoppingCallback,
    TrainerCallback,
};

use crate::engine::EngineModel;
use benchkit_core::{BackendError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info};

/// Hyperparameters of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingArguments {
    #[serde(default = "default_epochs")]
    pub num_train_epochs: usize,
    /// Overrides `num_train_epochs` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub per_device_train_batch_size: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_logging_steps")]
    pub logging_steps: usize,
    /// Checkpoints requested by callbacks are written under this directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
}

impl Default for TrainingArguments {
    fn default() -> Self {
        Self {
            num_train_epochs: default_epochs(),
            max_steps: None,
            per_device_train_batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            logging_steps: default_logging_steps(),
            output_dir: None,
        }
    }
}

fn default_epochs() -> usize {
    1
}

fn default_batch_size() -> usize {
    1
}

fn default_learning_rate() -> f64 {
    5e-5
}

fn default_logging_steps() -> usize {
    1
}

/// One tokenized training sample. Labels default to the inputs (causal LM).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub input_ids: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<u32>>,
}

impl TrainingExample {
    pub fn new(input_ids: Vec<u32>) -> Self {
        Self {
            input_ids,
            labels: None,
        }
    }
}

/// A rectangular batch ready for a training step.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingBatch {
    pub input_ids: Vec<Vec<u32>>,
    pub labels: Vec<Vec<u32>>,
}

/// Turns samples into a batch.
pub trait DataCollator: Send + Sync {
    fn collate(&self, examples: &[TrainingExample]) -> Result<TrainingBatch>;
}

/// Stacks samples of equal length; no padding.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDataCollator;

impl DataCollator for DefaultDataCollator {
    fn collate(&self, examples: &[TrainingExample]) -> Result<TrainingBatch> {
        let Some(first) = examples.first() else {
            return Err(BackendError::invalid_input("cannot collate an empty batch"));
        };
        let len = first.input_ids.len();
        let mut batch = TrainingBatch {
            input_ids: Vec::with_capacity(examples.len()),
            labels: Vec::with_capacity(examples.len()),
        };
        for example in examples {
            let labels = example.labels.as_ref().unwrap_or(&example.input_ids);
            if example.input_ids.len() != len || labels.len() != len {
                return Err(BackendError::invalid_input(format!(
                    "all samples must have length {len}, got {} inputs / {} labels",
                    example.input_ids.len(),
                    labels.len()
                )));
            }
            batch.input_ids.push(example.input_ids.clone());
            batch.labels.push(labels.clone());
        }
        Ok(batch)
    }
}

/// A logged training step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub step: usize,
    pub epoch: f64,
    pub loss: f64,
}

/// Progress of a training run, returned once it finishes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    pub global_step: usize,
    pub max_steps: usize,
    pub epoch: f64,
    pub log_history: Vec<LogEntry>,
    pub best_loss: Option<f64>,
    pub should_training_stop: bool,
    pub train_runtime_secs: f64,
}

/// Runs the optimization loop over a dataset.
pub struct Trainer<'a, M: EngineModel> {
    model: &'a mut M,
    args: &'a TrainingArguments,
    callbacks: Vec<Box<dyn TrainerCallback>>,
    collator: &'a dyn DataCollator,
}

impl<'a, M: EngineModel> Trainer<'a, M> {
    pub fn new(
        model: &'a mut M,
        args: &'a TrainingArguments,
        callbacks: Vec<Box<dyn TrainerCallback>>,
        collator: &'a dyn DataCollator,
    ) -> Self {
        Self {
            model,
            args,
            callbacks,
            collator,
        }
    }

    pub fn train(mut self, dataset: &[TrainingExample]) -> Result<TrainerState> {
        if dataset.is_empty() {
            return Err(BackendError::invalid_input("training dataset is empty"));
        }
        let batch_size = self.args.per_device_train_batch_size.max(1);
        let steps_per_epoch = dataset.len().div_ceil(batch_size);
        let max_steps = self
            .args
            .max_steps
            .unwrap_or(steps_per_epoch * self.args.num_train_epochs);
        let epochs = max_steps.div_ceil(steps_per_epoch);

        let mut state = TrainerState {
            max_steps,
            ..TrainerState::default()
        };
        let started = Instant::now();
        info!(
            samples = dataset.len(),
            batch_size, max_steps, epochs, "Starting training"
        );
        for cb in &mut self.callbacks {
            cb.on_train_begin(self.args, &state);
        }

        'epochs: for epoch in 0..epochs {
            let mut epoch_loss = 0.0;
            let mut epoch_steps = 0usize;

            for (i, chunk) in dataset.chunks(batch_size).enumerate() {
                if state.global_step >= max_steps {
                    break 'epochs;
                }
                let batch = self.collator.collate(chunk)?;
                let loss = self.model.training_step(&batch, self.args)?;

                state.global_step += 1;
                state.epoch = epoch as f64 + (i + 1) as f64 / steps_per_epoch as f64;
                epoch_loss += loss;
                epoch_steps += 1;
                if state.best_loss.is_none_or(|best| loss < best) {
                    state.best_loss = Some(loss);
                }
                if state.global_step % self.args.logging_steps.max(1) == 0 {
                    debug!(step = state.global_step, epoch = state.epoch, loss, "Training step");
                    state.log_history.push(LogEntry {
                        step: state.global_step,
                        epoch: state.epoch,
                        loss,
                    });
                }

                let action = self
                    .callbacks
                    .iter_mut()
                    .fold(CallbackAction::Continue, |acc, cb| {
                        acc.merge(cb.on_step_end(&state, loss))
                    });
                if self.handle(action, &mut state)? {
                    break 'epochs;
                }
            }

            let mean_loss = epoch_loss / epoch_steps.max(1) as f64;
            let action = self
                .callbacks
                .iter_mut()
                .fold(CallbackAction::Continue, |acc, cb| {
                    acc.merge(cb.on_epoch_end(&state, mean_loss))
                });
            if self.handle(action, &mut state)? {
                break;
            }
        }

        state.train_runtime_secs = started.elapsed().as_secs_f64();
        for cb in &mut self.callbacks {
            cb.on_train_end(&state);
        }
        info!(
            steps = state.global_step,
            runtime_secs = state.train_runtime_secs,
            "Finished training"
        );
        Ok(state)
    }

    /// Apply a callback request. Returns true when training must stop.
    fn handle(&mut self, action: CallbackAction, state: &mut TrainerState) -> Result<bool> {
        match action {
            CallbackAction::Continue => Ok(false),
            CallbackAction::Checkpoint => {
                if let Some(output_dir) = &self.args.output_dir {
                    let dir = output_dir.join(format!("checkpoint-{}", state.global_step));
                    info!(dir = %dir.display(), "Saving checkpoint");
                    self.model.save_pretrained(&dir)?;
                }
                Ok(false)
            }
            CallbackAction::Stop => {
                info!(step = state.global_step, "Training stopped by callback");
                state.should_training_stop = true;
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_collator_uses_inputs_as_labels() {
        let batch = DefaultDataCollator
            .collate(&[TrainingExample::new(vec![1, 2]), TrainingExample::new(vec![3, 4])])
            .unwrap();
        assert_eq!(batch.labels, vec![vec![1, 2], vec![3, 4]]);
    }

    #[test]
    fn test_default_collator_rejects_ragged() {
        let err = DefaultDataCollator
            .collate(&[TrainingExample::new(vec![1, 2]), TrainingExample::new(vec![3])])
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidInput(_)));
        assert!(DefaultDataCollator.collate(&[]).is_err());
    }

    #[test]
    fn test_arguments_defaults_from_json() {
        let args: TrainingArguments = serde_json::from_str(r#"{"max_steps": 3}"#).unwrap();
        assert_eq!(args.max_steps, Some(3));
        assert_eq!(args.per_device_train_batch_size, 1);
        assert_eq!(args.learning_rate, 5e-5);
    }

    async fn mock_model(dir: &std::path::Path) -> crate::engine::MockModel {
        use crate::engine::{LoadRequest, MockEngine, ModelEngine, WeightInit};
        use benchkit_core::{Device, HubClient, HubOptions, Library};

        std::fs::write(dir.join("config.json"), r#"{"model_type": "llama"}"#).unwrap();
        MockEngine::new()
            .load(&LoadRequest {
                model: dir.to_string_lossy().into_owned(),
                hub: HubClient::new(HubOptions::default()),
                library: Library::Transformers,
                task: "text-generation".to_string(),
                init: WeightInit::Random,
                device: Device::Cpu,
                device_ordinal: 0,
                place_on_load: false,
                device_map: None,
                dtype: None,
                quantization: None,
                attn_implementation: None,
                low_cpu_mem_usage: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_trainer_runs_epochs_and_checkpoints() {
        let model_dir = tempfile::TempDir::new().unwrap();
        let output_dir = tempfile::TempDir::new().unwrap();
        let mut model = mock_model(model_dir.path()).await;
        let args = TrainingArguments {
            num_train_epochs: 2,
            per_device_train_batch_size: 2,
            output_dir: Some(output_dir.path().to_path_buf()),
            ..TrainingArguments::default()
        };
        let dataset: Vec<TrainingExample> =
            (0..4).map(|i| TrainingExample::new(vec![i, i + 1])).collect();

        let state = Trainer::new(
            &mut model,
            &args,
            vec![Box::new(CheckpointCallback::new(1))],
            &DefaultDataCollator,
        )
        .train(&dataset)
        .unwrap();

        assert_eq!(state.global_step, 4);
        assert_eq!(state.max_steps, 4);
        assert_eq!(state.epoch, 2.0);
        assert_eq!(state.log_history.len(), 4);
        assert_eq!(state.best_loss, Some(0.25));
        assert!(!state.should_training_stop);
        assert!(output_dir.path().join("checkpoint-2").join("model.safetensors").is_file());
        assert!(output_dir.path().join("checkpoint-4").join("config.json").is_file());
    }

    #[tokio::test]
    async fn test_trainer_stops_on_callback() {
        struct StopAfterFirstStep;
        impl TrainerCallback for StopAfterFirstStep {
            fn on_step_end(&mut self, _state: &TrainerState, _loss: f64) -> CallbackAction {
                CallbackAction::Stop
            }
        }

        let model_dir = tempfile::TempDir::new().unwrap();
        let mut model = mock_model(model_dir.path()).await;
        let args = TrainingArguments {
            max_steps: Some(10),
            ..TrainingArguments::default()
        };
        let dataset = vec![TrainingExample::new(vec![1, 2]); 5];
        let state = Trainer::new(
            &mut model,
            &args,
            vec![Box::new(StopAfterFirstStep)],
            &DefaultDataCollator,
        )
        .train(&dataset)
        .unwrap();
        assert_eq!(state.global_step, 1);
        assert!(state.should_training_stop);
    }
}
