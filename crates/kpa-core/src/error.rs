use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Unknown backend name, missing credentials or an unusable config file.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Every backend in the `auto` preference order was tried and none is usable.
    #[error("no generation backend available: {0}")]
    NoBackendAvailable(String),

    /// The selected backend failed its readiness probe.
    #[error("backend {backend} is not available: {hint}")]
    BackendUnavailable { backend: String, hint: String },

    /// A single file mutation failed.
    #[error("failed to mutate {}: {reason}", path.display())]
    Mutation { path: PathBuf, reason: String },

    #[error("cancelled by user")]
    Cancelled,

    #[error("prompt error: {0}")]
    Prompt(#[from] kpa_pm::PmError),

    #[error("invalid config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// A short hint telling the user how to get out of this failure.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            Self::Configuration(_) => Some(
                "Check --backend (auto, ollama, openai, groq) and .kpa/config.yaml.",
            ),
            Self::NoBackendAvailable(_) | Self::BackendUnavailable { .. } => Some(
                "Start Ollama (https://ollama.ai/download) or set GROQ_API_KEY / OPENAI_API_KEY.",
            ),
            _ => None,
        }
    }
}
