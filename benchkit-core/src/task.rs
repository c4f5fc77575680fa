//! Task classification.

/// Tasks served by text-generation engines.
pub const TEXT_GENERATION_TASKS: &[&str] = &[
    "image-to-text",
    "conversational",
    "text-generation",
    "text2text-generation",
    "automatic-speech-recognition",
];

/// Tasks served by text-embedding engines.
pub const TEXT_EMBEDDING_TASKS: &[&str] = &["feature-extraction", "sentence-similarity"];

/// Coarse task family used to pick server flavors and request shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    TextGeneration,
    TextEmbedding,
    Other,
}

impl TaskKind {
    pub fn of(task: &str) -> Self {
        if TEXT_GENERATION_TASKS.contains(&task) {
            Self::TextGeneration
        } else if TEXT_EMBEDDING_TASKS.contains(&task) {
            Self::TextEmbedding
        } else {
            Self::Other
        }
    }

    pub fn is_generation(&self) -> bool {
        matches!(self, Self::TextGeneration)
    }
}
