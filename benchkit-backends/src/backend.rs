//! The contract every benchkit backend implements.
//!
//! A benchmark drives a backend through the same sequence regardless of where the
//! model runs: build it from a [`BackendConfig`], turn raw inputs into engine inputs
//! once with [`Backend::prepare_inputs`], then time [`Backend::forward`],
//! [`Backend::prefill`] or [`Backend::generate`] calls, and finally [`Backend::clean`].

use crate::training::{
    DataCollator, TrainerCallback, TrainerState, TrainingArguments, TrainingExample,
};
use async_trait::async_trait;
use benchkit_core::{BackendConfig, BackendError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One named input of a benchmark batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputValue {
    /// Token ids, one row per batch element.
    Tokens(Vec<Vec<u32>>),
    /// Dense image batch in row-major order.
    Pixels { shape: Vec<usize>, data: Vec<f32> },
    Texts(Vec<String>),
}

impl InputValue {
    pub fn as_tokens(&self) -> Option<&[Vec<u32>]> {
        match self {
            Self::Tokens(rows) => Some(rows),
            _ => None,
        }
    }

    pub fn batch_size(&self) -> usize {
        match self {
            Self::Tokens(rows) => rows.len(),
            Self::Pixels { shape, .. } => shape.first().copied().unwrap_or(0),
            Self::Texts(texts) => texts.len(),
        }
    }
}

/// Raw inputs keyed by name (`input_ids`, `attention_mask`, `pixel_values`, `prompt`, ...).
pub type BackendInputs = BTreeMap<String, InputValue>;

/// Per-call knobs forwarded to the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallKwargs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_new_tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_new_tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub do_sample: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_cache: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CallKwargs {
    /// Fixed-length generation of `tokens` new tokens.
    pub fn fixed_length(tokens: usize) -> Self {
        Self {
            max_new_tokens: Some(tokens),
            min_new_tokens: Some(tokens),
            ..Self::default()
        }
    }
}

/// Result of one backend call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendOutput {
    /// Next-token logits, one row per batch element.
    Logits(Vec<Vec<f32>>),
    /// Newly generated token ids, one row per batch element.
    Tokens(Vec<Vec<u32>>),
    Texts(Vec<String>),
    Embeddings(Vec<Vec<f32>>),
}

impl BackendOutput {
    pub fn batch_size(&self) -> usize {
        match self {
            Self::Logits(rows) | Self::Embeddings(rows) => rows.len(),
            Self::Tokens(rows) => rows.len(),
            Self::Texts(texts) => texts.len(),
        }
    }
}

/// Where a backend's weights came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightsSource {
    /// The trained checkpoint.
    Pretrained,
    /// A no-weights checkpoint written by the weight materializer.
    Synthesized,
}

/// A configured model ready to be benchmarked.
#[async_trait]
pub trait Backend: Send {
    /// Engine-ready inputs produced by [`Backend::prepare_inputs`].
    type Inputs: Send + Sync;

    fn name(&self) -> &str;

    /// The backend's private copy of its configuration.
    fn config(&self) -> &BackendConfig;

    /// Re-apply the configured seed to process-wide and engine RNG state.
    fn seed(&mut self) -> Result<()>;

    fn prepare_inputs(&self, inputs: BackendInputs) -> Result<Self::Inputs>;

    async fn forward(
        &mut self,
        inputs: &Self::Inputs,
        kwargs: &CallKwargs,
    ) -> Result<BackendOutput>;

    async fn prefill(
        &mut self,
        inputs: &Self::Inputs,
        kwargs: &CallKwargs,
    ) -> Result<BackendOutput>;

    async fn generate(
        &mut self,
        inputs: &Self::Inputs,
        kwargs: &CallKwargs,
    ) -> Result<BackendOutput>;

    /// Fine-tune the loaded model. Backends that cannot train keep this default.
    async fn train(
        &mut self,
        _dataset: Vec<TrainingExample>,
        _args: &TrainingArguments,
        _callbacks: Vec<Box<dyn TrainerCallback>>,
        _collator: &dyn DataCollator,
    ) -> Result<TrainerState> {
        Err(BackendError::unsupported(format!(
            "backend {} does not support training",
            self.name()
        )))
    }

    /// Release the model and every resource created at construction.
    ///
    /// Calling it again is a no-op.
    async fn clean(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_call_kwargs_extra_fields() {
        let kwargs: CallKwargs =
            serde_json::from_str(r#"{"max_new_tokens": 8, "num_beams": 1}"#).unwrap();
        assert_eq!(kwargs.max_new_tokens, Some(8));
        assert_eq!(kwargs.extra["num_beams"], 1);
        assert_eq!(CallKwargs::fixed_length(1).min_new_tokens, Some(1));
    }

    #[test]
    fn test_batch_sizes() {
        let pixels = InputValue::Pixels {
            shape: vec![2, 3, 4, 4],
            data: vec![0.0; 96],
        };
        assert_eq!(pixels.batch_size(), 2);
        assert_eq!(InputValue::Tokens(vec![vec![1], vec![2]]).batch_size(), 2);
        assert_eq!(BackendOutput::Texts(vec!["a".into()]).batch_size(), 1);
    }
}
