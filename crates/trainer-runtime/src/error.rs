//! Runtime composition error types

use trainer_common::crd::RuntimeKind;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("{kind} '{name}' not found")]
    RuntimeNotFound {
        kind: RuntimeKind,
        namespace: Option<String>,
        name: String,
    },

    #[error("{plugin}: trainer container not found in runtime template")]
    MissingTrainerContainer { plugin: &'static str },

    #[error("plugin '{0}' registered more than once")]
    DuplicatePlugin(String),

    #[error("ssh key generation failed: {0}")]
    KeyGeneration(String),

    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Common(#[from] trainer_common::Error),
}

impl RuntimeError {
    /// Whether the error was caused by a missing runtime reference
    pub fn is_runtime_not_found(&self) -> bool {
        matches!(self, Self::RuntimeNotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
