//! Parameter-efficient fine-tuning adapters requested through the config.

use benchkit_core::{BackendError, Result};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeftKind {
    Lora,
    AdaLora,
    Ia3,
    PromptTuning,
    PrefixTuning,
}

impl PeftKind {
    pub fn parse(peft_type: &str) -> Result<Self> {
        match peft_type.to_ascii_lowercase().replace('-', "_").as_str() {
            "lora" => Ok(Self::Lora),
            "adalora" => Ok(Self::AdaLora),
            "ia3" => Ok(Self::Ia3),
            "prompt_tuning" => Ok(Self::PromptTuning),
            "prefix_tuning" => Ok(Self::PrefixTuning),
            other => Err(BackendError::configuration(format!(
                "PEFT type {other} not recognized"
            ))),
        }
    }
}

/// An adapter kind plus its options (`r`, `lora_alpha`, `target_modules`, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct PeftSpec {
    pub kind: PeftKind,
    pub config: Map<String, Value>,
}

impl PeftSpec {
    pub fn resolve(peft_type: Option<&str>, config: &Map<String, Value>) -> Result<Option<Self>> {
        peft_type
            .map(|t| {
                Ok(Self {
                    kind: PeftKind::parse(t)?,
                    config: config.clone(),
                })
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        assert!(PeftSpec::resolve(None, &Map::new()).unwrap().is_none());
        let spec = PeftSpec::resolve(Some("LoRA"), &Map::new()).unwrap().unwrap();
        assert_eq!(spec.kind, PeftKind::Lora);
        assert_eq!(PeftKind::parse("prefix-tuning").unwrap(), PeftKind::PrefixTuning);
        assert!(PeftKind::parse("dora").unwrap_err().is_configuration());
    }
}
