use std::path::PathBuf;

use crate::variant::EngineVariant;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The caller supplied an unusable request (missing image, missing prompt, ...).
    #[error("Invalid input: {0}")]
    Input(String),

    #[error("No template for engine variant '{variant}' at {}", path.display())]
    TemplateNotFound {
        variant: EngineVariant,
        path: PathBuf,
    },

    #[error("Template {} is malformed: {reason}", path.display())]
    TemplateMalformed { path: PathBuf, reason: String },

    /// The template does not expose a node or field the binder requires.
    #[error("Binding error: {0}")]
    Binding(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
