//! Quantization scheme resolution.
//!
//! A model is quantized when the user asks for a scheme or when the checkpoint's
//! `config.json` already carries a `quantization_config.quant_method`. The checkpoint's
//! settings are merged with user overrides (user wins) into one typed config.

use benchkit_core::{BackendError, PretrainedConfig, Result};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuantMethod {
    Gptq,
    Awq,
    BitsAndBytes,
}

impl QuantMethod {
    pub fn parse(method: &str) -> Result<Self> {
        match method.to_ascii_lowercase().as_str() {
            "gptq" => Ok(Self::Gptq),
            "awq" => Ok(Self::Awq),
            "bnb" | "bitsandbytes" => Ok(Self::BitsAndBytes),
            other => Err(BackendError::configuration(format!(
                "quantization scheme {other} not recognized"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gptq => "gptq",
            Self::Awq => "awq",
            Self::BitsAndBytes => "bitsandbytes",
        }
    }
}

impl fmt::Display for QuantMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Merged quantization settings of a model.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizationConfig {
    pub method: QuantMethod,
    params: Map<String, Value>,
    exllama_v2: bool,
}

fn asks_exllama_v2(params: &Map<String, Value>) -> bool {
    params
        .get("exllama_config")
        .and_then(|c| c.get("version"))
        .and_then(Value::as_u64)
        == Some(2)
}

impl QuantizationConfig {
    /// Resolve the effective quantization config, or `None` for a full precision model.
    ///
    /// The user's `scheme` takes precedence over the checkpoint's `quant_method`.
    pub fn resolve(
        scheme: Option<&str>,
        pretrained: Option<&PretrainedConfig>,
        overrides: &Map<String, Value>,
    ) -> Result<Option<Self>> {
        let checkpoint = pretrained.and_then(PretrainedConfig::quantization_config);
        let checkpoint_method = checkpoint
            .and_then(|c| c.get("quant_method"))
            .and_then(Value::as_str);

        let Some(method) = scheme.or(checkpoint_method) else {
            return Ok(None);
        };
        let method = QuantMethod::parse(method)?;

        // Either the checkpoint or the user can select the v2 kernels, whichever
        // of the two names a gptq or awq scheme.
        let checkpoint_scheme = checkpoint_method.and_then(|m| QuantMethod::parse(m).ok());
        let exllama_family = [Some(method), checkpoint_scheme]
            .into_iter()
            .flatten()
            .any(|m| matches!(m, QuantMethod::Gptq | QuantMethod::Awq));
        let exllama_v2 = exllama_family
            && (checkpoint.is_some_and(asks_exllama_v2) || asks_exllama_v2(overrides));

        let mut params = checkpoint.cloned().unwrap_or_default();
        for (key, value) in overrides {
            params.insert(key.clone(), value.clone());
        }
        params.insert(
            "quant_method".to_string(),
            Value::String(method.as_str().to_string()),
        );

        Ok(Some(Self {
            method,
            params,
            exllama_v2,
        }))
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    pub fn bits(&self) -> Option<u64> {
        self.params.get("bits").and_then(Value::as_u64)
    }

    /// GPTQ/AWQ checkpoints run by the exllama v2 kernels need `g_idx` tensors.
    pub fn uses_exllama_v2(&self) -> bool {
        self.exllama_v2
    }

    /// The config as embedded in a saved `config.json`.
    pub fn to_map(&self) -> Map<String, Value> {
        self.params.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn pretrained(quant: Value) -> PretrainedConfig {
        serde_json::from_value(json!({"model_type": "llama", "quantization_config": quant}))
            .unwrap()
    }

    #[test]
    fn test_not_quantized() {
        let config: PretrainedConfig = serde_json::from_value(json!({})).unwrap();
        assert!(
            QuantizationConfig::resolve(None, Some(&config), &Map::new())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_checkpoint_method_detected() {
        let config = pretrained(json!({"quant_method": "awq", "bits": 4}));
        let resolved = QuantizationConfig::resolve(None, Some(&config), &Map::new())
            .unwrap()
            .unwrap();
        assert_eq!(resolved.method, QuantMethod::Awq);
        assert_eq!(resolved.bits(), Some(4));
    }

    #[test]
    fn test_user_overrides_win() {
        let config = pretrained(json!({"quant_method": "gptq", "bits": 4, "group_size": 128}));
        let overrides = json!({"bits": 8, "exllama_config": {"version": 2}});
        let resolved =
            QuantizationConfig::resolve(None, Some(&config), overrides.as_object().unwrap())
                .unwrap()
                .unwrap();
        assert_eq!(resolved.bits(), Some(8));
        assert_eq!(resolved.params()["group_size"], 128);
        assert!(resolved.uses_exllama_v2());
    }

    #[test]
    fn test_scheme_without_checkpoint_config() {
        let resolved = QuantizationConfig::resolve(Some("bnb"), None, &Map::new())
            .unwrap()
            .unwrap();
        assert_eq!(resolved.method, QuantMethod::BitsAndBytes);
        assert!(!resolved.uses_exllama_v2());
        assert_eq!(resolved.to_map()["quant_method"], "bitsandbytes");
    }

    #[test]
    fn test_unknown_scheme_is_configuration_error() {
        let err = QuantizationConfig::resolve(Some("hqq"), None, &Map::new()).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_exllama_v1_needs_no_g_idx() {
        let config = pretrained(json!({"quant_method": "gptq", "exllama_config": {"version": 1}}));
        let resolved = QuantizationConfig::resolve(None, Some(&config), &Map::new())
            .unwrap()
            .unwrap();
        assert!(!resolved.uses_exllama_v2());
    }

    #[test]
    fn test_checkpoint_exllama_v2_survives_user_exllama_config() {
        let config = pretrained(json!({"quant_method": "gptq", "exllama_config": {"version": 2}}));
        let overrides = json!({"exllama_config": {"version": 1}});
        let resolved =
            QuantizationConfig::resolve(None, Some(&config), overrides.as_object().unwrap())
                .unwrap()
                .unwrap();
        // the saved config carries the user's value, g_idx still follows the checkpoint
        assert_eq!(resolved.params()["exllama_config"], json!({"version": 1}));
        assert!(resolved.uses_exllama_v2());
    }

    #[test]
    fn test_exllama_v2_of_checkpoint_scheme_under_user_scheme() {
        let config = pretrained(json!({"quant_method": "awq", "exllama_config": {"version": 2}}));
        let resolved = QuantizationConfig::resolve(Some("bnb"), Some(&config), &Map::new())
            .unwrap()
            .unwrap();
        assert_eq!(resolved.method, QuantMethod::BitsAndBytes);
        assert!(resolved.uses_exllama_v2());
    }

    #[test]
    fn test_exllama_config_ignored_for_bitsandbytes() {
        let overrides = json!({"exllama_config": {"version": 2}});
        let resolved =
            QuantizationConfig::resolve(Some("bnb"), None, overrides.as_object().unwrap())
                .unwrap()
                .unwrap();
        assert!(!resolved.uses_exllama_v2());
    }
}
