//! Training callbacks: early stopping, anomaly detection and checkpointing.

use super::{TrainerState, TrainingArguments};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::warn;

/// Action a callback can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
    Checkpoint,
}

impl CallbackAction {
    /// Combine two requests; stopping wins over checkpointing.
    pub fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::Stop, _) | (_, Self::Stop) => Self::Stop,
            (Self::Checkpoint, _) | (_, Self::Checkpoint) => Self::Checkpoint,
            _ => Self::Continue,
        }
    }
}

/// Hooks invoked by the trainer. Every hook defaults to doing nothing.
pub trait TrainerCallback: Send {
    fn on_train_begin(&mut self, _args: &TrainingArguments, _state: &TrainerState) {}

    /// Called after every optimizer step with the step's loss.
    fn on_step_end(&mut self, _state: &TrainerState, _loss: f64) -> CallbackAction {
        CallbackAction::Continue
    }

    /// Called at the end of each epoch with the epoch's mean loss.
    fn on_epoch_end(&mut self, _state: &TrainerState, _loss: f64) -> CallbackAction {
        CallbackAction::Continue
    }

    fn on_train_end(&mut self, _state: &TrainerState) {}
}

/// Stops once the epoch loss has not improved by `min_delta` for `patience` epochs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyStoppingCallback {
    pub patience: usize,
    pub min_delta: f64,
    #[serde(skip)]
    stale_epochs: usize,
    #[serde(skip)]
    best_loss: Option<f64>,
}

impl EarlyStoppingCallback {
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            min_delta,
            stale_epochs: 0,
            best_loss: None,
        }
    }
}

impl TrainerCallback for EarlyStoppingCallback {
    fn on_epoch_end(&mut self, _state: &TrainerState, loss: f64) -> CallbackAction {
        let improved = self.best_loss.is_none_or(|best| loss < best - self.min_delta);
        if improved {
            self.best_loss = Some(loss);
            self.stale_epochs = 0;
            return CallbackAction::Continue;
        }
        self.stale_epochs += 1;
        if self.stale_epochs >= self.patience {
            CallbackAction::Stop
        } else {
            CallbackAction::Continue
        }
    }
}

/// Stops training on a non-finite loss or a loss spike above `threshold` x the recent mean.
#[derive(Debug, Clone)]
pub struct AnomalyDetectionCallback {
    pub threshold: f64,
    recent: VecDeque<f64>,
    window_size: usize,
}

impl AnomalyDetectionCallback {
    /// Spikes are only judged once this many step losses have been seen.
    const MIN_HISTORY: usize = 3;

    pub fn new(threshold: f64, window_size: usize) -> Self {
        Self {
            threshold,
            recent: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
        }
    }
}

impl TrainerCallback for AnomalyDetectionCallback {
    fn on_step_end(&mut self, state: &TrainerState, loss: f64) -> CallbackAction {
        if !loss.is_finite() {
            warn!(step = state.global_step, loss, "Non-finite training loss");
            return CallbackAction::Stop;
        }
        if self.recent.len() == self.window_size {
            self.recent.pop_front();
        }
        self.recent.push_back(loss);

        if self.recent.len() < Self::MIN_HISTORY {
            return CallbackAction::Continue;
        }
        let mean = self.recent.iter().sum::<f64>() / self.recent.len() as f64;
        if loss > mean * self.threshold {
            warn!(step = state.global_step, loss, mean, "Training loss spike");
            return CallbackAction::Stop;
        }
        CallbackAction::Continue
    }
}

/// Requests a checkpoint every `frequency` epochs.
#[derive(Debug, Clone)]
pub struct CheckpointCallback {
    pub frequency: usize,
    epochs_seen: usize,
}

impl CheckpointCallback {
    pub fn new(frequency: usize) -> Self {
        Self {
            frequency: frequency.max(1),
            epochs_seen: 0,
        }
    }
}

impl TrainerCallback for CheckpointCallback {
    fn on_epoch_end(&mut self, _state: &TrainerState, _loss: f64) -> CallbackAction {
        self.epochs_seen += 1;
        if self.epochs_seen % self.frequency == 0 {
            CallbackAction::Checkpoint
        } else {
            CallbackAction::Continue
        }
    }
}
