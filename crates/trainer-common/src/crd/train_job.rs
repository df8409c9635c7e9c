//! TrainJob CRD types
//!
//! A `TrainJob` requests one execution of a training runtime. It names the
//! runtime to use and carries per-job overrides for the trainer, the
//! initializers and individual pod templates.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{
    Affinity, EnvVar, LocalObjectReference, PodSchedulingGate, ResourceRequirements, Toleration,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::gen::SchemaGenerator;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Value of `spec.managedBy` for jobs reconciled by this controller
pub const TRAINJOB_CONTROLLER_MANAGER: &str = "trainer.kubeflow.org/trainjob-controller";

// =============================================================================
// Runtime reference
// =============================================================================

/// Kind of runtime a TrainJob refers to
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RuntimeKind {
    /// Namespaced runtime in the job's namespace
    TrainingRuntime,
    /// Cluster-scoped runtime
    #[default]
    ClusterTrainingRuntime,
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TrainingRuntime => write!(f, "TrainingRuntime"),
            Self::ClusterTrainingRuntime => write!(f, "ClusterTrainingRuntime"),
        }
    }
}

/// Reference to the runtime template a job is built from
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeRef {
    /// Runtime name
    pub name: String,
    /// API group of the runtime, `trainer.kubeflow.org` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    /// Runtime kind
    #[serde(default)]
    pub kind: RuntimeKind,
}

// =============================================================================
// Process-per-node directive
// =============================================================================

/// Number of processes per node: an explicit count or one of `auto`, `cpu`, `gpu`
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum NumProcPerNode {
    /// Explicit process count
    Int(i32),
    /// Symbolic directive resolved from node resources
    Str(String),
}

impl NumProcPerNode {
    /// The `auto` directive
    pub fn auto() -> Self {
        Self::Str("auto".to_string())
    }

    /// The `cpu` directive
    pub fn cpu() -> Self {
        Self::Str("cpu".to_string())
    }

    /// Whether this is the literal `auto` directive
    pub fn is_auto(&self) -> bool {
        matches!(self, Self::Str(s) if s == "auto")
    }

    /// Whether this is the literal `cpu` directive
    pub fn is_cpu(&self) -> bool {
        matches!(self, Self::Str(s) if s == "cpu")
    }

    /// Explicit count, if any
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(n) => Some(*n),
            Self::Str(_) => None,
        }
    }
}

impl fmt::Display for NumProcPerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}

impl JsonSchema for NumProcPerNode {
    fn schema_name() -> String {
        "NumProcPerNode".to_string()
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        IntOrString::json_schema(gen)
    }
}

// =============================================================================
// Trainer and initializers
// =============================================================================

/// Per-job overrides of the trainer replicated job
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Trainer {
    /// Trainer container image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Entrypoint override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    /// Arguments override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    /// Extra environment for the trainer container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    /// Number of training nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_nodes: Option<i32>,
    /// Resources of each training node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources_per_node: Option<ResourceRequirements>,
    /// Processes per node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_proc_per_node: Option<NumProcPerNode>,
}

/// Dataset or model initializer settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitializerSource {
    /// Location to fetch from, e.g. `hf://org/model`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_uri: Option<String>,
    /// Extra environment for the initializer container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    /// Secret exposed to the initializer as environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<LocalObjectReference>,
}

/// Initializers run before training
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Initializer {
    /// Dataset initializer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<InitializerSource>,
    /// Model initializer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<InitializerSource>,
}

// =============================================================================
// Pod spec overrides
// =============================================================================

/// Replicated job targeted by an override
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSpecOverrideTargetJob {
    /// Replicated job name
    pub name: String,
}

/// Per-container override merged by container name
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerOverride {
    /// Container name
    pub name: String,
    /// Environment upserted by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    /// Volume mounts upserted by mount path
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
}

/// Override applied to the pod templates of selected replicated jobs
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSpecOverride {
    /// Replicated jobs this override applies to
    pub target_jobs: Vec<PodSpecOverrideTargetJob>,
    /// Controller that owns this override, informational
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager: Option<String>,
    /// Service account override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    /// Node selector entries merged into the template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
    /// Affinity replacement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    /// Tolerations appended to the template
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    /// Volumes upserted by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    /// Init container overrides
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<ContainerOverride>,
    /// Container overrides
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<ContainerOverride>,
    /// Scheduling gates upserted by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scheduling_gates: Vec<PodSchedulingGate>,
}

impl PodSpecOverride {
    /// Whether the override targets the given replicated job
    pub fn targets(&self, job: &str) -> bool {
        self.target_jobs.iter().any(|t| t.name == job)
    }
}

// =============================================================================
// CRD
// =============================================================================

/// A request to run one training job from a runtime template
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trainer.kubeflow.org",
    version = "v1alpha1",
    kind = "TrainJob",
    plural = "trainjobs",
    namespaced,
    status = "TrainJobStatus",
    printcolumn = r#"{"name":"Runtime","type":"string","jsonPath":".spec.runtimeRef.name"}"#,
    printcolumn = r#"{"name":"Suspended","type":"boolean","jsonPath":".spec.suspend"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TrainJobSpec {
    /// Runtime template to build from
    pub runtime_ref: RuntimeRef,

    /// Dataset and model initializers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initializer: Option<Initializer>,

    /// Trainer overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trainer: Option<Trainer>,

    /// Labels propagated to the produced JobSet, overriding template labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,

    /// Annotations propagated to the produced JobSet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    /// Pod template overrides keyed by replicated job
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_spec_overrides: Vec<PodSpecOverride>,

    /// Suspend the job; produced objects are only mutated while suspended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,

    /// Controller responsible for this job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_by: Option<String>,
}

impl TrainJob {
    /// Whether `spec.suspend` is set
    pub fn is_suspended(&self) -> bool {
        self.spec.suspend.unwrap_or(false)
    }

    /// Whether this controller should reconcile the job
    pub fn is_managed_here(&self) -> bool {
        self.spec
            .managed_by
            .as_deref()
            .map_or(true, |m| m == TRAINJOB_CONTROLLER_MANAGER)
    }

    /// Trainer env, empty when no trainer overrides are set
    pub fn trainer_env(&self) -> &[EnvVar] {
        self.spec
            .trainer
            .as_ref()
            .map(|t| t.env.as_slice())
            .unwrap_or_default()
    }
}

// =============================================================================
// Status
// =============================================================================

/// Condition types recorded on a TrainJob
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrainJobConditionType {
    /// Objects were built and applied
    Created,
    /// Job is suspended
    Suspended,
    /// Training finished successfully
    Complete,
    /// Training failed
    Failed,
}

impl fmt::Display for TrainJobConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Suspended => write!(f, "Suspended"),
            Self::Complete => write!(f, "Complete"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Observed TrainJob state
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrainJobStatus {
    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl TrainJobStatus {
    /// Find a condition by type
    pub fn condition(&self, kind: TrainJobConditionType) -> Option<&Condition> {
        let kind = kind.to_string();
        self.conditions.iter().find(|c| c.type_ == kind)
    }

    /// Whether the job reached `Complete` or `Failed`
    pub fn is_finished(&self) -> bool {
        [TrainJobConditionType::Complete, TrainJobConditionType::Failed]
            .into_iter()
            .any(|k| self.condition(k).is_some_and(|c| c.status == "True"))
    }
}
