//! Common types for the trainer controller: CRDs, errors, quantities and well-known names

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod quantity;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of the trainer CRDs
pub const TRAINER_GROUP: &str = "trainer.kubeflow.org";

/// `apiVersion` of the trainer CRDs
pub const TRAINER_API_VERSION: &str = "trainer.kubeflow.org/v1alpha1";

/// Label carried by replicated-job templates naming their logical role
pub const LABEL_TRAINJOB_ANCESTOR: &str = "trainer.kubeflow.org/trainjob-ancestor-step";

/// Label marking the support status of a runtime
pub const LABEL_SUPPORT: &str = "trainer.kubeflow.org/support";

/// Value of [`LABEL_SUPPORT`] for runtimes scheduled for removal
pub const SUPPORT_DEPRECATED: &str = "deprecated";

/// Ancestor value and job/container name of the dataset initializer
pub const DATASET_INITIALIZER: &str = "dataset-initializer";

/// Ancestor value and job/container name of the model initializer
pub const MODEL_INITIALIZER: &str = "model-initializer";

/// Ancestor value of the trainer replicated job
pub const ANCESTOR_TRAINER: &str = "trainer";

/// Name of the trainer replicated job and of its main container
pub const NODE: &str = "node";

/// Name of the MPI launcher replicated job and container
pub const LAUNCHER: &str = "launcher";

/// Rendezvous port exposed by every trainer container
pub const CONTAINER_TRAINER_PORT: i32 = 29500;

/// Downward-API path of the per-pod completion index set by indexed Jobs
pub const JOB_COMPLETION_INDEX_FIELD_PATH: &str =
    "metadata.annotations['batch.kubernetes.io/job-completion-index']";

/// Env var read by initializers for the source location
pub const INITIALIZER_ENV_STORAGE_URI: &str = "STORAGE_URI";

/// Field manager used for server-side apply
pub const DEFAULT_FIELD_MANAGER: &str = "trainer-controller";
