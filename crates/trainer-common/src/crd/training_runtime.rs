//! TrainingRuntime and ClusterTrainingRuntime CRD types
//!
//! A runtime is a reusable JobSet template plus the ML and gang-scheduling
//! policies used to specialise it for each TrainJob.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::autoscaling::v2::MetricSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::jobset::JobSetSpec;
use super::train_job::NumProcPerNode;
use crate::Error;

// =============================================================================
// ML policy
// =============================================================================

/// Elastic training bounds for torchrun
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TorchElasticPolicy {
    /// Restarts tolerated before the job fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_restarts: Option<i32>,
    /// Lower bound on nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_nodes: Option<i32>,
    /// Upper bound on nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_nodes: Option<i32>,
    /// Autoscaling metrics; an HPA is produced when non-empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<MetricSpec>,
}

/// PyTorch distributed policy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TorchMLPolicySource {
    /// Default processes per node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_proc_per_node: Option<NumProcPerNode>,
    /// Elastic training settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elastic_policy: Option<TorchElasticPolicy>,
}

/// MPI distribution in use
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MPIImplementation {
    /// Open MPI
    #[default]
    OpenMPI,
    /// Intel MPI
    IntelMPI,
    /// MPICH
    MPICH,
}

impl fmt::Display for MPIImplementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenMPI => write!(f, "OpenMPI"),
            Self::IntelMPI => write!(f, "IntelMPI"),
            Self::MPICH => write!(f, "MPICH"),
        }
    }
}

/// MPI policy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MPIMLPolicySource {
    /// Slots per node in the hostfile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_proc_per_node: Option<i32>,
    /// MPI distribution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mpi_implementation: Option<MPIImplementation>,
    /// Where the SSH key material is mounted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_auth_mount_path: Option<String>,
    /// Whether the launcher also runs a training process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_launcher_as_node: Option<bool>,
}

/// JAX distributed policy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct JAXMLPolicySource {}

/// XGBoost distributed policy coordinated through a Rabit tracker
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct XGBoostMLPolicySource {}

/// Flux Framework policy: trainer pods form an HPC cluster that runs the job
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FluxMLPolicySource {
    /// Tasks per node handed to the Flux broker; at least 1
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_proc_per_node: Option<i32>,
}

/// ML policy selecting how trainer pods are wired together
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MLPolicy {
    /// Default number of training nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_nodes: Option<i32>,
    /// torchrun settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub torch: Option<TorchMLPolicySource>,
    /// MPI settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mpi: Option<MPIMLPolicySource>,
    /// JAX settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jax: Option<JAXMLPolicySource>,
    /// XGBoost settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xgboost: Option<XGBoostMLPolicySource>,
    /// Flux settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flux: Option<FluxMLPolicySource>,
}

/// The single active ML policy variant
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MLPolicySource<'a> {
    /// No framework wiring
    PlainML,
    /// torchrun
    Torch(&'a TorchMLPolicySource),
    /// MPI launcher and workers
    Mpi(&'a MPIMLPolicySource),
    /// JAX distributed
    Jax(&'a JAXMLPolicySource),
    /// XGBoost with a Rabit tracker
    XGBoost(&'a XGBoostMLPolicySource),
    /// Flux Framework cluster
    Flux(&'a FluxMLPolicySource),
}

impl MLPolicy {
    /// The active variant; an empty policy is plain ML
    pub fn source(&self) -> MLPolicySource<'_> {
        if let Some(torch) = &self.torch {
            MLPolicySource::Torch(torch)
        } else if let Some(mpi) = &self.mpi {
            MLPolicySource::Mpi(mpi)
        } else if let Some(jax) = &self.jax {
            MLPolicySource::Jax(jax)
        } else if let Some(xgboost) = &self.xgboost {
            MLPolicySource::XGBoost(xgboost)
        } else if let Some(flux) = &self.flux {
            MLPolicySource::Flux(flux)
        } else {
            MLPolicySource::PlainML
        }
    }

    /// Reject policies that set more than one variant
    pub fn validate(&self) -> Result<(), Error> {
        let set = [
            self.torch.is_some(),
            self.mpi.is_some(),
            self.jax.is_some(),
            self.xgboost.is_some(),
            self.flux.is_some(),
        ]
            .into_iter()
            .filter(|s| *s)
            .count();
        if set > 1 {
            return Err(Error::validation_for_field(
                "runtime",
                "spec.mlPolicy",
                "only one of torch, mpi, jax, xgboost or flux may be set",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Pod group policy
// =============================================================================

/// scheduler-plugins coscheduling settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CoschedulingPodGroupPolicySource {
    /// Seconds to wait for the whole gang before giving up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_timeout_seconds: Option<i32>,
}

/// Volcano hyper-node topology constraint
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkTopology {
    /// `hard` or `soft`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Highest network tier pods may span
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highest_tier_allowed: Option<i32>,
}

/// Volcano gang-scheduling settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolcanoPodGroupPolicySource {
    /// Topology constraint copied into the PodGroup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_topology: Option<NetworkTopology>,
}

/// KAI scheduler settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KAISchedulerPodGroupPolicySource {
    /// Scheduling queue; empty or unset falls back to the scheduler default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
}

/// Gang-scheduling policy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodGroupPolicy {
    /// scheduler-plugins coscheduling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coscheduling: Option<CoschedulingPodGroupPolicySource>,
    /// Volcano
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volcano: Option<VolcanoPodGroupPolicySource>,
    /// NVIDIA KAI scheduler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kai_scheduler: Option<KAISchedulerPodGroupPolicySource>,
}

/// The active pod group variant
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PodGroupPolicySource<'a> {
    /// scheduler-plugins coscheduling
    Coscheduling(&'a CoschedulingPodGroupPolicySource),
    /// Volcano
    Volcano(&'a VolcanoPodGroupPolicySource),
    /// KAI scheduler
    KAIScheduler(&'a KAISchedulerPodGroupPolicySource),
}

impl PodGroupPolicy {
    /// The active variant, if any
    pub fn source(&self) -> Option<PodGroupPolicySource<'_>> {
        if let Some(c) = &self.coscheduling {
            Some(PodGroupPolicySource::Coscheduling(c))
        } else if let Some(v) = &self.volcano {
            Some(PodGroupPolicySource::Volcano(v))
        } else {
            self.kai_scheduler.as_ref().map(PodGroupPolicySource::KAIScheduler)
        }
    }
}

// =============================================================================
// Template
// =============================================================================

/// Labels and annotations of the runtime template
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    /// Labels propagated to the JobSet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    /// Annotations propagated to the JobSet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// JobSet template of a runtime
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobSetTemplateSpec {
    /// Template metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TemplateMetadata>,
    /// JobSet spec
    pub spec: JobSetSpec,
}

// =============================================================================
// CRDs
// =============================================================================

/// Namespaced runtime template
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trainer.kubeflow.org",
    version = "v1alpha1",
    kind = "TrainingRuntime",
    plural = "trainingruntimes",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct TrainingRuntimeSpec {
    /// ML policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ml_policy: Option<MLPolicy>,
    /// Gang-scheduling policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_group_policy: Option<PodGroupPolicy>,
    /// JobSet template
    pub template: JobSetTemplateSpec,
}

/// Cluster-scoped runtime template sharing the namespaced runtime's schema
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trainer.kubeflow.org",
    version = "v1alpha1",
    kind = "ClusterTrainingRuntime",
    plural = "clustertrainingruntimes"
)]
pub struct ClusterTrainingRuntimeSpec {
    /// Runtime fields
    #[serde(flatten)]
    pub runtime: TrainingRuntimeSpec,
}
