//! Candle engine for llama-family causal language models.
//!
//! Parameters always live in a [`VarMap`]: the architecture is instantiated with its
//! default initializers and checkpoint tensors are then copied over the matching
//! variables. A pretrained load overwrites everything; a no-weights checkpoint matches
//! nothing and leaves the random initialization in place. Keeping variables (rather
//! than memory-mapped tensors) is what makes device moves, saving and training steps
//! possible on the same model.

use super::{EngineCapabilities, EngineModel, LoadRequest, ModelEngine, WeightInit};
use crate::backend::{BackendInputs, BackendOutput, CallKwargs};
use crate::training::{TrainingArguments, TrainingBatch};
use async_trait::async_trait;
use benchkit_core::hub::{CONFIG_NAME, GENERATION_CONFIG_NAME, SAFE_WEIGHTS_NAME};
use benchkit_core::{
    BackendError, Device, GenerationConfig, Library, LinearLayer, Precision, PretrainedConfig,
    Result,
};
use candle_core::{DType, Device as CandleDevice, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::llama::{Cache, Config, Llama, LlamaConfig};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const SUPPORTED_MODEL_TYPES: &[&str] = &["llama"];
const DEFAULT_MAX_NEW_TOKENS: usize = 20;

fn tensor_err(e: candle_core::Error) -> BackendError {
    BackendError::tensor(e)
}

/// Resolve a configured device to a candle device.
pub fn candle_device(device: Device, ordinal: usize) -> Result<CandleDevice> {
    match device {
        Device::Cpu => Ok(CandleDevice::Cpu),
        Device::Cuda => CandleDevice::new_cuda(ordinal)
            .map_err(|e| BackendError::upstream(format!("cuda device {ordinal}"), e)),
        Device::Metal => CandleDevice::new_metal(ordinal)
            .map_err(|e| BackendError::upstream(format!("metal device {ordinal}"), e)),
    }
}

pub fn candle_dtype(precision: Precision) -> DType {
    match precision {
        Precision::Float32 => DType::F32,
        Precision::Float16 => DType::F16,
        Precision::BFloat16 => DType::BF16,
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CandleEngine;

impl CandleEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ModelEngine for CandleEngine {
    type Model = CandleModel;

    fn name(&self) -> &str {
        "candle"
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            libraries: vec![Library::Transformers],
            autocast: true,
            ..EngineCapabilities::default()
        }
    }

    fn check_architecture(&self, config: &PretrainedConfig) -> Result<()> {
        check_model_type(config)
    }

    fn linear_layers(&self, config: &PretrainedConfig) -> Result<Vec<LinearLayer>> {
        check_model_type(config)?;
        let field = |name: &str, value: Option<usize>| {
            value.ok_or_else(|| BackendError::configuration(format!("{CONFIG_NAME} lacks {name}")))
        };
        let hidden = field("hidden_size", config.hidden_size())?;
        let intermediate = field("intermediate_size", config.intermediate_size())?;
        let layers = field("num_hidden_layers", config.num_hidden_layers())?;

        let mut linear = Vec::with_capacity(layers * 7 + 1);
        for i in 0..layers {
            let prefix = format!("model.layers.{i}");
            for proj in ["q_proj", "k_proj", "v_proj", "o_proj"] {
                linear.push(LinearLayer::new(format!("{prefix}.self_attn.{proj}"), hidden));
            }
            for proj in ["gate_proj", "up_proj"] {
                linear.push(LinearLayer::new(format!("{prefix}.mlp.{proj}"), hidden));
            }
            linear.push(LinearLayer::new(
                format!("{prefix}.mlp.down_proj"),
                intermediate,
            ));
        }
        linear.push(LinearLayer::new("lm_head", hidden));
        Ok(linear)
    }

    async fn load(&self, request: &LoadRequest) -> Result<CandleModel> {
        if request.library != Library::Transformers {
            return Err(BackendError::configuration(format!(
                "candle engine cannot load {} models",
                request.library
            )));
        }
        if request.quantization.is_some() || request.device_map.is_some() {
            return Err(BackendError::configuration(
                "candle engine supports neither quantization nor device maps",
            ));
        }
        match request.attn_implementation.as_deref() {
            None | Some("eager") | Some("sdpa") => {}
            Some(other) => {
                return Err(BackendError::configuration(format!(
                    "attention implementation {other} is not available in the candle engine"
                )));
            }
        }
        if let Some(low_cpu_mem_usage) = request.low_cpu_mem_usage {
            debug!(low_cpu_mem_usage, "low_cpu_mem_usage has no effect on candle, ignoring");
        }

        let config_path = request.hub.fetch(&request.model, CONFIG_NAME).await?;
        let pretrained_config = PretrainedConfig::from_file(&config_path)?;
        check_model_type(&pretrained_config)?;
        let llama_config: LlamaConfig =
            serde_json::from_value(Value::Object(pretrained_config.as_map().clone())).map_err(
                |e| BackendError::upstream(format!("llama config of {}", request.model), e),
            )?;
        let config = llama_config.into_config(false);

        let generation_config = match request
            .hub
            .fetch_optional(&request.model, GENERATION_CONFIG_NAME)
            .await?
        {
            Some(path) => GenerationConfig::from_file(&path)?,
            None => GenerationConfig::default(),
        };

        let weight_files = match request.init {
            WeightInit::Pretrained => request.hub.fetch_weights(&request.model).await?,
            WeightInit::Random | WeightInit::Empty => request
                .hub
                .fetch_optional(&request.model, SAFE_WEIGHTS_NAME)
                .await?
                .into_iter()
                .collect(),
        };

        let device = if request.place_on_load {
            candle_device(request.device, request.device_ordinal)?
        } else {
            CandleDevice::Cpu
        };
        let dtype = request.dtype.map(candle_dtype).unwrap_or(DType::F32);
        info!(
            model = %request.model,
            init = ?request.init,
            dtype = ?dtype,
            files = weight_files.len(),
            "Loading llama model with candle"
        );

        let tensors = read_tensors(&weight_files, &device)?;
        let (varmap, llama) = build(&config, &device, dtype, &tensors, request.init)?;

        Ok(CandleModel {
            varmap,
            llama,
            config,
            pretrained_config,
            generation_config,
            device,
            dtype,
            seed: 0,
            eval_mode: false,
            optimizer: None,
        })
    }

    fn empty_cache(&self, device: Device, ordinal: usize) -> Result<()> {
        if device.is_accelerator() {
            candle_device(device, ordinal)?
                .synchronize()
                .map_err(tensor_err)?;
        }
        Ok(())
    }
}

fn check_model_type(config: &PretrainedConfig) -> Result<()> {
    match config.model_type() {
        Some(model_type) if SUPPORTED_MODEL_TYPES.contains(&model_type) => Ok(()),
        other => Err(BackendError::configuration(format!(
            "candle engine does not support model type {}",
            other.unwrap_or("<missing>")
        ))),
    }
}

fn read_tensors(files: &[PathBuf], device: &CandleDevice) -> Result<HashMap<String, Tensor>> {
    let mut tensors = HashMap::new();
    for file in files {
        let loaded = candle_core::safetensors::load(file, device)
            .map_err(|e| BackendError::upstream(format!("weights {}", file.display()), e))?;
        tensors.extend(loaded);
    }
    Ok(tensors)
}

/// Instantiate the architecture on `device` and copy `tensors` over its variables.
fn build(
    config: &Config,
    device: &CandleDevice,
    dtype: DType,
    tensors: &HashMap<String, Tensor>,
    init: WeightInit,
) -> Result<(VarMap, Llama)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, dtype, device);
    let llama = Llama::load(vb, config).map_err(tensor_err)?;

    let vars = varmap
        .data()
        .lock()
        .map_err(|_| BackendError::engine("parameter map lock poisoned"))?;
    let mut assigned = 0usize;
    for (name, tensor) in tensors {
        let Some(var) = vars.get(name) else {
            debug!(name, "Ignoring tensor unknown to the architecture");
            continue;
        };
        if var.shape() != tensor.shape() {
            return Err(BackendError::engine(format!(
                "tensor {name} has shape {:?}, expected {:?}",
                tensor.shape(),
                var.shape()
            )));
        }
        let value = tensor
            .to_dtype(var.dtype())
            .and_then(|t| t.to_device(var.device()))
            .map_err(tensor_err)?;
        var.set(&value).map_err(tensor_err)?;
        assigned += 1;
    }

    let missing = vars.len().saturating_sub(assigned);
    match init {
        WeightInit::Pretrained if missing > 0 => {
            warn!(missing, "Parameters missing from the checkpoint were randomly initialized");
        }
        _ => debug!(assigned, missing, "Checkpoint tensors assigned"),
    }
    drop(vars);

    Ok((varmap, llama))
}

/// Token ids placed on the model's device.
#[derive(Debug, Clone)]
pub struct CandleInputs {
    pub input_ids: Tensor,
    rows: Vec<Vec<u32>>,
}

impl CandleInputs {
    pub fn batch_size(&self) -> usize {
        self.rows.len()
    }
}

/// A llama model loaded by [`CandleEngine`].
pub struct CandleModel {
    varmap: VarMap,
    llama: Llama,
    config: Config,
    pretrained_config: PretrainedConfig,
    generation_config: GenerationConfig,
    device: CandleDevice,
    dtype: DType,
    seed: u64,
    eval_mode: bool,
    optimizer: Option<AdamW>,
}

impl CandleModel {
    pub fn device(&self) -> &CandleDevice {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn eval_mode(&self) -> bool {
        self.eval_mode
    }

    pub fn num_parameters(&self) -> usize {
        self.varmap
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().elem_count())
            .sum()
    }

    fn snapshot(&self) -> Result<HashMap<String, Tensor>> {
        let vars = self
            .varmap
            .data()
            .lock()
            .map_err(|_| BackendError::engine("parameter map lock poisoned"))?;
        Ok(vars
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect())
    }

    fn tokens_tensor(&self, rows: &[Vec<u32>]) -> Result<Tensor> {
        let width = rows.first().map(Vec::len).unwrap_or(0);
        let flat: Vec<u32> = rows.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (rows.len(), width), &self.device).map_err(tensor_err)
    }

    fn new_cache(&self, use_kv_cache: bool) -> Result<Cache> {
        Cache::new(use_kv_cache, self.dtype, &self.config, &self.device).map_err(tensor_err)
    }

    fn sampling(&self, kwargs: &CallKwargs) -> Sampling {
        let generation = &self.generation_config;
        if !kwargs.do_sample.or(generation.do_sample).unwrap_or(false) {
            return Sampling::ArgMax;
        }
        let temperature = kwargs.temperature.or(generation.temperature).unwrap_or(1.0);
        let top_k = kwargs
            .top_k
            .or(generation.top_k.map(|k| k as usize))
            .filter(|&k| k > 0);
        let top_p = kwargs.top_p.or(generation.top_p).filter(|&p| p < 1.0);
        match (top_k, top_p) {
            (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
            (Some(k), None) => Sampling::TopK { k, temperature },
            (None, Some(p)) => Sampling::TopP { p, temperature },
            (None, None) => Sampling::All { temperature },
        }
    }
}

impl EngineModel for CandleModel {
    type Inputs = CandleInputs;

    fn place_inputs(&self, mut inputs: BackendInputs) -> Result<CandleInputs> {
        let rows = match inputs.remove("input_ids") {
            Some(crate::backend::InputValue::Tokens(rows)) => rows,
            Some(_) => return Err(BackendError::invalid_input("input_ids must hold token ids")),
            None => return Err(BackendError::invalid_input("input_ids is required")),
        };
        let width = rows.first().map(Vec::len).unwrap_or(0);
        if rows.is_empty() || width == 0 || rows.iter().any(|r| r.len() != width) {
            return Err(BackendError::invalid_input(
                "input_ids must be a non-empty rectangular batch",
            ));
        }
        if let Some(extra) = inputs.keys().next() {
            debug!(input = %extra, "Ignoring input not used by causal LMs");
        }
        let input_ids = self.tokens_tensor(&rows)?;
        Ok(CandleInputs { input_ids, rows })
    }

    fn to_device(&mut self, device: Device, ordinal: usize) -> Result<()> {
        let target = candle_device(device, ordinal)?;
        if target.same_device(&self.device) {
            return Ok(());
        }
        info!(%device, ordinal, "Moving model to device");
        let tensors = self.snapshot()?;
        let (varmap, llama) = build(
            &self.config,
            &target,
            self.dtype,
            &tensors,
            WeightInit::Pretrained,
        )?;
        self.varmap = varmap;
        self.llama = llama;
        self.device = target;
        self.optimizer = None;
        Ok(())
    }

    fn generation_config_mut(&mut self) -> &mut GenerationConfig {
        &mut self.generation_config
    }

    fn set_eval_mode(&mut self, eval: bool) {
        self.eval_mode = eval;
    }

    fn seed(&mut self, seed: u64) -> Result<()> {
        self.seed = seed;
        if !self.device.is_cpu() {
            self.device.set_seed(seed).map_err(tensor_err)?;
        }
        Ok(())
    }

    fn forward(&mut self, inputs: &CandleInputs, _kwargs: &CallKwargs) -> Result<BackendOutput> {
        let mut cache = self.new_cache(false)?;
        let logits = self
            .llama
            .forward(&inputs.input_ids, 0, &mut cache)
            .and_then(|l| l.to_dtype(DType::F32))
            .and_then(|l| l.to_vec2::<f32>())
            .map_err(tensor_err)?;
        Ok(BackendOutput::Logits(logits))
    }

    fn generate(&mut self, inputs: &CandleInputs, kwargs: &CallKwargs) -> Result<BackendOutput> {
        let max_new_tokens = kwargs
            .max_new_tokens
            .or(self.generation_config.max_new_tokens)
            .unwrap_or(DEFAULT_MAX_NEW_TOKENS);
        let min_new_tokens = kwargs.min_new_tokens.unwrap_or(0).min(max_new_tokens);
        let use_cache = kwargs.use_cache.unwrap_or(true);
        let eos = self.generation_config.eos_ids();
        let sampling = self.sampling(kwargs);
        let batch = inputs.batch_size();

        let mut processors: Vec<LogitsProcessor> = (0..batch)
            .map(|row| {
                LogitsProcessor::from_sampling(self.seed.wrapping_add(row as u64), sampling.clone())
            })
            .collect();
        let mut sequences = inputs.rows.clone();
        let mut generated = vec![Vec::with_capacity(max_new_tokens); batch];
        let mut finished = vec![false; batch];

        let mut cache = self.new_cache(use_cache)?;
        let mut next_input = inputs.input_ids.clone();
        let mut index_pos = 0usize;

        for step in 0..max_new_tokens {
            let logits = if use_cache {
                let logits = self
                    .llama
                    .forward(&next_input, index_pos, &mut cache)
                    .map_err(tensor_err)?;
                index_pos += next_input.dim(1).map_err(tensor_err)?;
                logits
            } else {
                let mut fresh = self.new_cache(false)?;
                let full = self.tokens_tensor(&sequences)?;
                self.llama.forward(&full, 0, &mut fresh).map_err(tensor_err)?
            };
            let logits = logits.to_dtype(DType::F32).map_err(tensor_err)?;

            let mut next_tokens = Vec::with_capacity(batch);
            for (row, processor) in processors.iter_mut().enumerate() {
                let row_logits = logits.get(row).map_err(tensor_err)?;
                let token = processor.sample(&row_logits).map_err(tensor_err)?;
                sequences[row].push(token);
                next_tokens.push(token);
                if finished[row] {
                    continue;
                }
                generated[row].push(token);
                if step + 1 >= min_new_tokens && eos.contains(&token) {
                    finished[row] = true;
                }
            }
            if finished.iter().all(|f| *f) {
                debug!(step, "All sequences reached end of sequence");
                break;
            }
            next_input = Tensor::from_vec(next_tokens, (batch, 1), &self.device)
                .map_err(tensor_err)?;
        }

        Ok(BackendOutput::Tokens(generated))
    }

    fn training_step(&mut self, batch: &TrainingBatch, args: &TrainingArguments) -> Result<f64> {
        let width = batch.input_ids.first().map(Vec::len).unwrap_or(0);
        if width < 2 {
            return Err(BackendError::invalid_input(
                "training samples need at least two tokens",
            ));
        }
        let context: Vec<Vec<u32>> = batch
            .input_ids
            .iter()
            .map(|row| row[..width - 1].to_vec())
            .collect();
        let targets: Vec<u32> = batch
            .labels
            .iter()
            .map(|row| row.get(width - 1).copied())
            .collect::<Option<_>>()
            .ok_or_else(|| BackendError::invalid_input("labels are shorter than input_ids"))?;

        let input = self.tokens_tensor(&context)?;
        let targets = Tensor::new(targets.as_slice(), &self.device).map_err(tensor_err)?;
        let mut cache = self.new_cache(false)?;
        let logits = self
            .llama
            .forward(&input, 0, &mut cache)
            .map_err(tensor_err)?;
        let loss = candle_nn::loss::cross_entropy(&logits, &targets).map_err(tensor_err)?;

        if self.optimizer.is_none() {
            let params = ParamsAdamW {
                lr: args.learning_rate,
                weight_decay: args.weight_decay,
                ..ParamsAdamW::default()
            };
            let optimizer = AdamW::new(self.varmap.all_vars(), params).map_err(tensor_err)?;
            self.optimizer = Some(optimizer);
        }
        if let Some(optimizer) = self.optimizer.as_mut() {
            optimizer.set_learning_rate(args.learning_rate);
            optimizer.backward_step(&loss).map_err(tensor_err)?;
        }

        let loss = loss
            .to_dtype(DType::F32)
            .and_then(|l| l.to_scalar::<f32>())
            .map_err(tensor_err)?;
        Ok(f64::from(loss))
    }

    fn save_pretrained(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let tensors = self.snapshot()?;
        let metadata = Some(HashMap::from([("format".to_string(), "pt".to_string())]));
        safetensors::serialize_to_file(
            tensors.iter().map(|(name, tensor)| (name.as_str(), tensor)),
            &metadata,
            &dir.join(SAFE_WEIGHTS_NAME),
        )?;
        self.pretrained_config.save_pretrained(dir)?;
        self.generation_config.save_pretrained(dir)?;
        info!(dir = %dir.display(), tensors = tensors.len(), "Saved model");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::InputValue;
    use benchkit_core::{HubClient, HubOptions};
    use serde_json::json;
    use tempfile::TempDir;

    /// A llama small enough to run in unit tests.
    pub(crate) fn tiny_llama_config() -> serde_json::Value {
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

    fn tiny_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_NAME), tiny_llama_config().to_string()).unwrap();
        dir
    }

    fn request(model: &Path, init: WeightInit) -> LoadRequest {
        LoadRequest {
            model: model.to_string_lossy().into_owned(),
            hub: HubClient::new(HubOptions::default()),
            library: Library::Transformers,
            task: "text-generation".to_string(),
            init,
            device: Device::Cpu,
            device_ordinal: 0,
            place_on_load: false,
            device_map: None,
            dtype: None,
            quantization: None,
            attn_implementation: None,
            low_cpu_mem_usage: None,
        }
    }

    fn inputs(model: &CandleModel, rows: Vec<Vec<u32>>) -> CandleInputs {
        let mut raw = BackendInputs::new();
        raw.insert("input_ids".to_string(), InputValue::Tokens(rows));
        model.place_inputs(raw).unwrap()
    }

    #[test]
    fn test_linear_layers() {
        let config: PretrainedConfig = serde_json::from_value(tiny_llama_config()).unwrap();
        let layers = CandleEngine.linear_layers(&config).unwrap();
        assert_eq!(layers.len(), 2 * 7 + 1);
        assert!(
            layers.contains(&LinearLayer::new("model.layers.1.mlp.down_proj", 32))
        );
        assert_eq!(layers.last().unwrap().name, "lm_head");
    }

    #[test]
    fn test_unsupported_model_type() {
        let config: PretrainedConfig =
            serde_json::from_value(json!({"model_type": "bert"})).unwrap();
        assert!(CandleEngine.linear_layers(&config).unwrap_err().is_configuration());
        assert!(CandleEngine.check_architecture(&config).unwrap_err().is_configuration());

        let llama: PretrainedConfig = serde_json::from_value(tiny_llama_config()).unwrap();
        assert!(CandleEngine.check_architecture(&llama).is_ok());
    }

    #[tokio::test]
    async fn test_random_load_forward_and_generate() {
        let dir = tiny_dir();
        let mut model = CandleEngine
            .load(&request(dir.path(), WeightInit::Random))
            .await
            .unwrap();
        assert!(model.num_parameters() > 0);

        let batch = inputs(&model, vec![vec![1, 2, 3], vec![4, 5, 6]]);
        let BackendOutput::Logits(logits) = model.forward(&batch, &CallKwargs::default()).unwrap()
        else {
            panic!("expected logits");
        };
        assert_eq!(logits.len(), 2);
        assert_eq!(logits[0].len(), 12);

        for use_cache in [true, false] {
            let kwargs = CallKwargs {
                use_cache: Some(use_cache),
                ..CallKwargs::fixed_length(4)
            };
            let BackendOutput::Tokens(tokens) = model.generate(&batch, &kwargs).unwrap() else {
                panic!("expected tokens");
            };
            assert_eq!(tokens.len(), 2);
            assert!(tokens.iter().all(|row| row.len() == 4));
            assert!(tokens.iter().flatten().all(|&t| t < 12));
        }
    }

    #[tokio::test]
    async fn test_pretrained_load_requires_weights() {
        let dir = tiny_dir();
        let err = CandleEngine
            .load(&request(dir.path(), WeightInit::Pretrained))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BackendError::UpstreamLoad { .. }));
    }

    #[tokio::test]
    async fn test_save_and_reload_preserves_weights() {
        let dir = tiny_dir();
        let out = TempDir::new().unwrap();
        let mut model = CandleEngine
            .load(&request(dir.path(), WeightInit::Random))
            .await
            .unwrap();
        model.save_pretrained(out.path()).unwrap();
        assert!(out.path().join(GENERATION_CONFIG_NAME).is_file());

        let mut reloaded = CandleEngine
            .load(&request(out.path(), WeightInit::Pretrained))
            .await
            .unwrap();
        let batch = inputs(&model, vec![vec![3, 1, 4]]);
        let a = model.forward(&batch, &CallKwargs::default()).unwrap();
        let b = reloaded.forward(&batch, &CallKwargs::default()).unwrap();
        let (BackendOutput::Logits(a), BackendOutput::Logits(b)) = (a, b) else {
            panic!("expected logits");
        };
        for (x, y) in a[0].iter().zip(&b[0]) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[tokio::test]
    async fn test_training_step_returns_finite_loss() {
        let dir = tiny_dir();
        let mut model = CandleEngine
            .load(&request(dir.path(), WeightInit::Random))
            .await
            .unwrap();
        let batch = TrainingBatch {
            input_ids: vec![vec![1, 2, 3, 4]],
            labels: vec![vec![1, 2, 3, 4]],
        };
        let loss = model
            .training_step(&batch, &TrainingArguments::default())
            .unwrap();
        assert!(loss.is_finite());
        assert!(model.optimizer.is_some());
    }

    #[tokio::test]
    async fn test_flash_attention_rejected() {
        let dir = tiny_dir();
        let mut req = request(dir.path(), WeightInit::Random);
        req.attn_implementation = Some("flash_attention_2".to_string());
        assert!(CandleEngine.load(&req).await.err().unwrap().is_configuration());
    }

    #[tokio::test]
    async fn test_place_inputs_rejects_ragged_batch() {
        let dir = tiny_dir();
        let model = CandleEngine
            .load(&request(dir.path(), WeightInit::Random))
            .await
            .unwrap();
        let mut raw = BackendInputs::new();
        raw.insert(
            "input_ids".to_string(),
            InputValue::Tokens(vec![vec![1, 2], vec![3]]),
        );
        assert!(matches!(
            model.place_inputs(raw).unwrap_err(),
            BackendError::InvalidInput(_)
        ));
    }
}
