//! Controller error types

use trainer_runtime::RuntimeError;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TrainJob {0} has no namespace")]
    MissingNamespace(String),
}
