use std::path::PathBuf;

use thiserror::Error;

/// Failures raised while loading or rendering prompt templates.
#[derive(Debug, Error)]
pub enum PmError {
    #[error("prompt template not found: {0}")]
    TemplateNotFound(String),

    #[error("failed to render prompt '{name}': {reason}")]
    Render { name: String, reason: String },

    #[error("prompt template '{name}' does not parse: {reason}")]
    InvalidTemplate { name: String, reason: String },

    #[error("cannot read prompt templates from {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
