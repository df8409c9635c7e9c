//! JobSet serialization types
//!
//! Typed representation of `jobset.x-k8s.io/v1alpha2` JobSet resources.
//! The spec is embedded verbatim in runtime templates, so it also derives
//! `JsonSchema` for the runtime CRDs.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::JobTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, ObjectMeta};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// `apiVersion` of JobSet objects
pub const JOBSET_API_VERSION: &str = "jobset.x-k8s.io/v1alpha2";

/// Kind of JobSet objects
pub const JOBSET_KIND: &str = "JobSet";

/// JobSet resource (`jobset.x-k8s.io/v1alpha2` Kind: JobSet)
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobSet {
    /// Always [`JOBSET_API_VERSION`]
    pub api_version: String,
    /// Always [`JOBSET_KIND`]
    pub kind: String,
    /// Object metadata
    pub metadata: ObjectMeta,
    /// Desired state
    pub spec: JobSetSpec,
    /// Observed state, only present on live objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobSetStatus>,
}

impl JobSet {
    /// Create a JobSet with the given identity and spec
    pub fn new(name: &str, namespace: &str, spec: JobSetSpec) -> Self {
        Self {
            api_version: JOBSET_API_VERSION.to_string(),
            kind: JOBSET_KIND.to_string(),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    /// Whether the live object is suspended
    pub fn is_suspended(&self) -> bool {
        self.spec.suspend.unwrap_or(false)
    }
}

/// JobSet spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobSetSpec {
    /// Groups of identical batch Jobs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replicated_jobs: Vec<ReplicatedJob>,

    /// Pod networking (headless service subdomain)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<Network>,

    /// When the JobSet is considered successful
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_policy: Option<SuccessPolicy>,

    /// How failures are handled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<FailurePolicy>,

    /// Order in which replicated jobs are started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_policy: Option<StartupPolicy>,

    /// Suspend all Jobs of the set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,

    /// Controller managing this JobSet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_by: Option<String>,

    /// Cleanup delay once the JobSet finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i32>,
}

impl JobSetSpec {
    /// Find a replicated job by name
    pub fn replicated_job(&self, name: &str) -> Option<&ReplicatedJob> {
        self.replicated_jobs.iter().find(|r| r.name == name)
    }

    /// Mutable lookup of a replicated job by name
    pub fn replicated_job_mut(&mut self, name: &str) -> Option<&mut ReplicatedJob> {
        self.replicated_jobs.iter_mut().find(|r| r.name == name)
    }

    /// Headless service subdomain, defaulting to the owning job name
    pub fn subdomain<'a>(&'a self, job_name: &'a str) -> &'a str {
        self.network
            .as_ref()
            .and_then(|n| n.subdomain.as_deref())
            .unwrap_or(job_name)
    }
}

/// A named group of identical Jobs
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatedJob {
    /// Replicated job name; pods are named `<jobset>-<name>-<replica>-<index>`
    pub name: String,

    /// Number of Job replicas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Job template
    pub template: JobTemplateSpec,

    /// Replicated jobs that must reach a status before this one starts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<DependsOn>,
}

impl ReplicatedJob {
    /// Labels of the job template
    pub fn labels(&self) -> Option<&BTreeMap<String, String>> {
        self.template.metadata.as_ref().and_then(|m| m.labels.as_ref())
    }

    /// Pod spec of the job template, if present
    pub fn pod_spec(&self) -> Option<&k8s_openapi::api::core::v1::PodSpec> {
        self.template
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
    }

    /// Mutable pod spec of the job template, if present
    pub fn pod_spec_mut(&mut self) -> Option<&mut k8s_openapi::api::core::v1::PodSpec> {
        self.template
            .spec
            .as_mut()
            .and_then(|s| s.template.spec.as_mut())
    }
}

/// Dependency on another replicated job
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DependsOn {
    /// Replicated job name
    pub name: String,
    /// Required status (`Ready` or `Complete`)
    pub status: String,
}

/// JobSet network configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    /// Create a headless service for pod DNS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_dns_hostnames: Option<bool>,
    /// Subdomain of the headless service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    /// Publish DNS records for pods that are not ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_not_ready_addresses: Option<bool>,
}

/// JobSet success policy
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SuccessPolicy {
    /// `All` or `Any`
    pub operator: String,
    /// Replicated jobs considered for success
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_replicated_jobs: Vec<String>,
}

/// JobSet failure policy
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FailurePolicy {
    /// Restarts allowed before the JobSet fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_restarts: Option<i32>,
}

/// JobSet startup policy
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartupPolicy {
    /// `AnyOrder` or `InOrder`
    pub startup_policy_order: String,
}

/// Observed JobSet state
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobSetStatus {
    /// Status conditions (`Completed`, `Failed`, `Suspended`, ...)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Number of times the JobSet restarted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restarts: Option<i32>,
}
