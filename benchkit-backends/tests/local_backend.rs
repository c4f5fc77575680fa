//! Local backend integration tests.
//!
//! The recording engine covers the construction sequence; a tiny random llama runs
//! through the candle engine end to end.

use benchkit_backends::engine::MockEngine;
use benchkit_backends::{
    Backend, BackendInputs, BackendOutput, CallKwargs, DefaultDataCollator, InputValue,
    LoadState, LocalEngineBackend, TrainingArguments, TrainingExample, WeightInit,
};
use benchkit_core::{BackendConfig, Device, GenerationConfig, SENTINEL_TOKEN_ID, TokenIds};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::path::Path;
use tempfile::TempDir;

fn tiny_llama() -> serde_json::Value {
    json!({
        "architectures": ["LlamaForCausalLM"],
        "model_type": "llama",
        "hidden_size": 16,
        "intermediate_size": 32,
        "num_hidden_layers": 2,
        "num_attention_heads": 2,
        "num_key_value_heads": 2,
        "vocab_size": 12,
        "rms_norm_eps": 1e-5,
        "max_position_embeddings": 64,
        "tie_word_embeddings": false
    })
}

fn model_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("config.json"), tiny_llama().to_string()).unwrap();
    std::fs::write(
        dir.path().join("generation_config.json"),
        json!({"bos_token_id": 1, "eos_token_id": 2, "pad_token_id": 0, "temperature": 0.6})
            .to_string(),
    )
    .unwrap();
    dir
}

fn no_weights_config(dir: &TempDir) -> BackendConfig {
    let mut config =
        BackendConfig::new(dir.path().to_string_lossy().into_owned(), "text-generation");
    config.no_weights = true;
    config
}

fn tokens(rows: Vec<Vec<u32>>) -> BackendInputs {
    BackendInputs::from([("input_ids".to_string(), InputValue::Tokens(rows))])
}

#[tokio::test]
async fn test_no_weights_loads_materialized_checkpoint() {
    let dir = model_dir();
    let config = no_weights_config(&dir);
    let original_model = config.model.clone();
    let engine = MockEngine::new();
    let log = engine.log();

    let backend = LocalEngineBackend::with_engine(config, engine).await.unwrap();
    let load = log.lock().unwrap().loads[0].clone();

    let loaded_from = Path::new(&load.request.model);
    assert_eq!(loaded_from.file_name().unwrap(), "no_weights_model");
    assert_eq!(load.request.init, WeightInit::Random);
    assert_eq!(
        load.model_files,
        vec!["config.json", "generation_config.json", "model.safetensors"]
    );
    assert_eq!(backend.config().model, original_model);
    assert_eq!(backend.state(), LoadState::Ready);
}

#[tokio::test]
async fn test_no_weights_checkpoint_removed_after_construction() {
    let dir = model_dir();
    let engine = MockEngine::new();
    let log = engine.log();

    let backend = LocalEngineBackend::with_engine(no_weights_config(&dir), engine)
        .await
        .unwrap();
    let model = log.lock().unwrap().loads[0].request.model.clone();
    let tmpdir = Path::new(&model).parent().unwrap();
    assert!(!tmpdir.exists());
    assert!(backend.model().is_some());
}

#[tokio::test]
async fn test_no_weights_generation_config_is_patched() {
    let dir = model_dir();
    let backend = LocalEngineBackend::with_engine(no_weights_config(&dir), MockEngine::new())
        .await
        .unwrap();
    let patched = backend.model().unwrap().generation_config();
    assert_eq!(patched.eos_token_id, Some(TokenIds::Single(SENTINEL_TOKEN_ID)));
    assert_eq!(patched.pad_token_id, Some(SENTINEL_TOKEN_ID));
    assert_eq!(patched.temperature, Some(1.0));
    assert_eq!(patched.top_p, Some(1.0));
    assert_eq!(patched.top_k, Some(50));
    // the model's own copy is untouched
    let original = GenerationConfig::from_file(&dir.path().join("generation_config.json")).unwrap();
    assert_eq!(original.eos_token_id, Some(TokenIds::Single(2)));
}

#[tokio::test]
async fn test_clean_is_idempotent() {
    let dir = model_dir();
    let mut config = no_weights_config(&dir);
    config.device = Device::Cuda;
    let engine = MockEngine::new();
    let log = engine.log();

    let mut backend = LocalEngineBackend::with_engine(config, engine).await.unwrap();
    backend.clean().await.unwrap();
    assert!(backend.model().is_none());
    assert_eq!(backend.state(), LoadState::Uninitialized);
    backend.clean().await.unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log.released, 1);
    let empty_cache_calls = log
        .events
        .iter()
        .filter(|e| e.starts_with("empty_cache"))
        .count();
    assert_eq!(empty_cache_calls, 1);
}

#[tokio::test]
async fn test_pretrained_load_uses_model_directly() {
    let dir = model_dir();
    std::fs::write(dir.path().join("model.safetensors"), b"").unwrap();
    let model = dir.path().to_string_lossy().into_owned();
    let config = BackendConfig::new(model.clone(), "text-generation");
    let engine = MockEngine::new();
    let log = engine.log();

    LocalEngineBackend::with_engine(config, engine).await.unwrap();
    let load = log.lock().unwrap().loads[0].clone();
    assert_eq!(load.request.init, WeightInit::Pretrained);
    assert_eq!(load.request.model, model);
}

#[tokio::test]
async fn test_engine_load_failure_propagates() {
    let dir = model_dir();
    let config = no_weights_config(&dir);
    let err = LocalEngineBackend::with_engine(config, MockEngine::new().failing())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, benchkit_core::BackendError::UpstreamLoad { .. }));
}

#[tokio::test]
async fn test_mock_calls_and_training() {
    let dir = model_dir();
    let mut backend = LocalEngineBackend::with_engine(no_weights_config(&dir), MockEngine::new())
        .await
        .unwrap();
    let inputs = backend
        .prepare_inputs(tokens(vec![vec![1, 2, 3], vec![4, 5, 6]]))
        .unwrap();

    let out = backend.forward(&inputs, &CallKwargs::default()).await.unwrap();
    assert_eq!(out.batch_size(), 2);
    let out = backend
        .generate(&inputs, &CallKwargs::fixed_length(5))
        .await
        .unwrap();
    assert_eq!(out, BackendOutput::Tokens(vec![vec![0; 5]; 2]));

    let dataset = vec![TrainingExample::new(vec![1, 2]); 3];
    let state = backend
        .train(
            dataset,
            &TrainingArguments::default(),
            Vec::new(),
            &DefaultDataCollator,
        )
        .await
        .unwrap();
    assert_eq!(state.global_step, 3);
}

#[tokio::test]
async fn test_candle_no_weights_end_to_end() {
    let dir = model_dir();
    let mut backend = LocalEngineBackend::new(no_weights_config(&dir)).await.unwrap();
    assert_eq!(backend.state(), LoadState::Ready);

    let inputs = backend
        .prepare_inputs(tokens(vec![vec![1, 2, 3], vec![3, 4, 5]]))
        .unwrap();
    match backend.forward(&inputs, &CallKwargs::default()).await.unwrap() {
        BackendOutput::Logits(rows) => {
            assert_eq!(rows.len(), 2);
            assert_eq!(rows[0].len(), 12);
        }
        other => panic!("expected logits, got {other:?}"),
    }

    // the patched generation config has no usable eos, so generation runs to length
    let out = backend
        .generate(&inputs, &CallKwargs::fixed_length(4))
        .await
        .unwrap();
    match out {
        BackendOutput::Tokens(rows) => assert!(rows.iter().all(|r| r.len() == 4)),
        other => panic!("expected tokens, got {other:?}"),
    }
    let out = backend
        .prefill(&inputs, &CallKwargs::fixed_length(1))
        .await
        .unwrap();
    assert_eq!(out.batch_size(), 2);

    backend.clean().await.unwrap();
    assert!(backend.model().is_none());
}
