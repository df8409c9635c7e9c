//! Intermediate model shared by every plugin during one composition pass
//!
//! An [`Info`] is built fresh from the resolved runtime, mutated in place by
//! the policy plugins and read by the component builders. Pod sets mirror the
//! replicated jobs of the template and are written back to it by name with
//! [`Info::sync_pod_sets_to_template_spec`].

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{self as corev1, ContainerPort, EnvVar, PodSpec, Volume, VolumeMount};
use trainer_common::crd::{JobSetSpec, MLPolicy, PodGroupPolicy};
use trainer_common::quantity::{pod_requests, ResourceList};
use trainer_common::{ANCESTOR_TRAINER, NODE};

use crate::apply;
use crate::error::Result;

/// Policies selected by the runtime
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuntimePolicy {
    pub ml_policy: Option<MLPolicy>,
    pub pod_group_policy: Option<PodGroupPolicy>,
}

/// Mergeable template of the produced workload, tagged by object kind
#[derive(Clone, Debug, Default, PartialEq)]
pub enum TemplatePatch {
    #[default]
    None,
    JobSet(JobSetSpec),
}

/// Types that can occupy the [`TemplatePatch`] slot
pub trait TemplateObject: Sized {
    fn from_patch(patch: &TemplatePatch) -> Option<&Self>;
    fn from_patch_mut(patch: &mut TemplatePatch) -> Option<&mut Self>;
}

impl TemplateObject for JobSetSpec {
    fn from_patch(patch: &TemplatePatch) -> Option<&Self> {
        match patch {
            TemplatePatch::JobSet(spec) => Some(spec),
            TemplatePatch::None => None,
        }
    }

    fn from_patch_mut(patch: &mut TemplatePatch) -> Option<&mut Self> {
        match patch {
            TemplatePatch::JobSet(spec) => Some(spec),
            TemplatePatch::None => None,
        }
    }
}

impl From<JobSetSpec> for TemplatePatch {
    fn from(spec: JobSetSpec) -> Self {
        Self::JobSet(spec)
    }
}

/// Template patch plus the pod sets derived from it
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TemplateSpec {
    pub object: TemplatePatch,
    pub pod_sets: Vec<PodSet>,
}

/// One replica group of pods with identical templates
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PodSet {
    /// Name of the replicated job this set mirrors
    pub name: String,
    /// Logical role from the ancestor label, if any
    pub ancestor: Option<String>,
    /// Pod count; `None` keeps the template default
    pub count: Option<i32>,
    pub containers: Vec<Container>,
    pub init_containers: Vec<Container>,
    pub volumes: Vec<Volume>,
    /// Effective requests of one pod of the set
    pub single_pod_requests: ResourceList,
}

impl PodSet {
    pub fn container(&self, name: &str) -> Option<&Container> {
        self.containers.iter().find(|c| c.name == name)
    }

    pub fn container_mut(&mut self, name: &str) -> Option<&mut Container> {
        self.containers.iter_mut().find(|c| c.name == name)
    }

    fn is_trainer(&self) -> bool {
        match self.ancestor.as_deref() {
            Some(ancestor) => ancestor == ANCESTOR_TRAINER,
            None => self.name == NODE,
        }
    }
}

/// Container fields plugins may contribute to
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Container {
    pub name: String,
    pub env: Vec<EnvVar>,
    pub ports: Vec<ContainerPort>,
    pub volume_mounts: Vec<VolumeMount>,
    /// Computed entrypoint override
    pub command: Option<Vec<String>>,
    /// Computed arguments override
    pub args: Option<Vec<String>>,
}

impl From<&corev1::Container> for Container {
    fn from(c: &corev1::Container) -> Self {
        Self {
            name: c.name.clone(),
            env: c.env.clone().unwrap_or_default(),
            ports: c.ports.clone().unwrap_or_default(),
            volume_mounts: c.volume_mounts.clone().unwrap_or_default(),
            command: None,
            args: None,
        }
    }
}

/// Total requests of one pod set
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TotalResourceRequest {
    pub replicas: i32,
    pub pod_requests: ResourceList,
}

/// Scheduling data gathered for gang scheduling
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Scheduler {
    /// Labels stamped onto every pod template
    pub pod_labels: BTreeMap<String, String>,
    pub total_requests: BTreeMap<String, TotalResourceRequest>,
}

#[derive(Clone, Debug)]
struct PodSpecReplica {
    name: String,
    ancestor: Option<String>,
    count: Option<i32>,
    pod_spec: PodSpec,
}

/// Construction options for [`Info::new`]
#[derive(Clone, Debug, Default)]
pub struct InfoOptions {
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    runtime_policy: RuntimePolicy,
    object: TemplatePatch,
    replicas: Vec<PodSpecReplica>,
}

impl InfoOptions {
    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_annotations(mut self, annotations: BTreeMap<String, String>) -> Self {
        self.annotations = annotations;
        self
    }

    pub fn with_ml_policy(mut self, policy: Option<MLPolicy>) -> Self {
        self.runtime_policy.ml_policy = policy;
        self
    }

    pub fn with_pod_group_policy(mut self, policy: Option<PodGroupPolicy>) -> Self {
        self.runtime_policy.pod_group_policy = policy;
        self
    }

    pub fn with_template_object(mut self, object: impl Into<TemplatePatch>) -> Self {
        self.object = object.into();
        self
    }

    /// Add a pod set; calls keep their order
    pub fn with_pod_spec_replicas(
        mut self,
        name: &str,
        ancestor: Option<&str>,
        count: Option<i32>,
        pod_spec: &PodSpec,
    ) -> Self {
        self.replicas.push(PodSpecReplica {
            name: name.to_string(),
            ancestor: ancestor.map(str::to_string),
            count,
            pod_spec: pod_spec.clone(),
        });
        self
    }
}

/// Per-pass composition state
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Info {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub runtime_policy: RuntimePolicy,
    pub template_spec: TemplateSpec,
    pub scheduler: Scheduler,
}

impl Info {
    pub fn new(options: InfoOptions) -> Result<Self> {
        let mut pod_sets = Vec::with_capacity(options.replicas.len());
        let mut total_requests = BTreeMap::new();

        for replica in options.replicas {
            let single_pod_requests = pod_requests(&replica.pod_spec)?;
            total_requests.insert(
                replica.name.clone(),
                TotalResourceRequest {
                    replicas: replica.count.unwrap_or(1),
                    pod_requests: single_pod_requests.clone(),
                },
            );
            let spec = &replica.pod_spec;
            pod_sets.push(PodSet {
                name: replica.name,
                ancestor: replica.ancestor,
                count: replica.count,
                containers: spec.containers.iter().map(Container::from).collect(),
                init_containers: spec
                    .init_containers
                    .iter()
                    .flatten()
                    .map(Container::from)
                    .collect(),
                volumes: spec.volumes.clone().unwrap_or_default(),
                single_pod_requests,
            });
        }

        Ok(Self {
            labels: options.labels,
            annotations: options.annotations,
            runtime_policy: options.runtime_policy,
            template_spec: TemplateSpec {
                object: options.object,
                pod_sets,
            },
            scheduler: Scheduler {
                pod_labels: BTreeMap::new(),
                total_requests,
            },
        })
    }

    /// Typed view of the template patch; `None` when another kind occupies it
    pub fn template_object<T: TemplateObject>(&self) -> Option<&T> {
        T::from_patch(&self.template_spec.object)
    }

    pub fn template_object_mut<T: TemplateObject>(&mut self) -> Option<&mut T> {
        T::from_patch_mut(&mut self.template_spec.object)
    }

    /// First pod set carrying the given ancestor; the trainer falls back to `node`
    pub fn find_pod_set_by_ancestor(&self, ancestor: &str) -> Option<&PodSet> {
        self.template_spec
            .pod_sets
            .iter()
            .find(|ps| matches_ancestor(ps, ancestor))
    }

    pub fn find_pod_set_by_ancestor_mut(&mut self, ancestor: &str) -> Option<&mut PodSet> {
        self.template_spec
            .pod_sets
            .iter_mut()
            .find(|ps| matches_ancestor(ps, ancestor))
    }

    pub fn find_pod_set_by_name(&self, name: &str) -> Option<&PodSet> {
        self.template_spec.pod_sets.iter().find(|ps| ps.name == name)
    }

    pub fn find_pod_set_by_name_mut(&mut self, name: &str) -> Option<&mut PodSet> {
        self.template_spec.pod_sets.iter_mut().find(|ps| ps.name == name)
    }

    pub fn find_container(&self, ancestor: &str, container: &str) -> Option<&Container> {
        self.find_pod_set_by_ancestor(ancestor)?.container(container)
    }

    pub fn find_container_mut(&mut self, ancestor: &str, container: &str) -> Option<&mut Container> {
        self.find_pod_set_by_ancestor_mut(ancestor)?.container_mut(container)
    }

    /// The `node` container of the trainer pod set
    pub fn trainer_container_mut(&mut self) -> Option<&mut Container> {
        self.find_container_mut(ANCESTOR_TRAINER, NODE)
    }

    /// Write pod set counts and container contributions back to the template.
    ///
    /// Pod sets are matched to replicated jobs by name; sets without a
    /// counterpart are skipped and unmatched replicated jobs keep their
    /// template values.
    pub fn sync_pod_sets_to_template_spec(&mut self) {
        if let TemplatePatch::JobSet(spec) = &mut self.template_spec.object {
            for ps in &self.template_spec.pod_sets {
                if let Some(rjob) = spec.replicated_job_mut(&ps.name) {
                    sync_replicated_job(ps, rjob);
                }
            }
        }

        for ps in &self.template_spec.pod_sets {
            let total = self.scheduler.total_requests.entry(ps.name.clone()).or_default();
            total.replicas = ps.count.unwrap_or(1);
            total.pod_requests = ps.single_pod_requests.clone();
        }
    }
}

fn matches_ancestor(ps: &PodSet, ancestor: &str) -> bool {
    if ancestor == ANCESTOR_TRAINER {
        ps.is_trainer()
    } else {
        ps.ancestor.as_deref() == Some(ancestor)
    }
}

fn sync_replicated_job(ps: &PodSet, rjob: &mut trainer_common::crd::ReplicatedJob) {
    let Some(job_spec) = rjob.template.spec.as_mut() else {
        return;
    };
    if let Some(count) = ps.count {
        job_spec.parallelism = Some(count);
        job_spec.completions = Some(count);
    }
    let Some(pod_spec) = job_spec.template.spec.as_mut() else {
        return;
    };
    if !ps.volumes.is_empty() {
        apply::upsert_volumes_opt(&mut pod_spec.volumes, ps.volumes.iter().cloned());
    }
    for container in &ps.containers {
        if let Some(target) = pod_spec.containers.iter_mut().find(|c| c.name == container.name) {
            sync_container(container, target);
        }
    }
    for container in &ps.init_containers {
        if let Some(target) = pod_spec
            .init_containers
            .iter_mut()
            .flatten()
            .find(|c| c.name == container.name)
        {
            sync_container(container, target);
        }
    }
}

fn sync_container(source: &Container, target: &mut corev1::Container) {
    if !source.env.is_empty() {
        apply::upsert_env_vars_opt(&mut target.env, source.env.iter().cloned());
    }
    if !source.ports.is_empty() {
        apply::upsert_ports(&mut target.ports, source.ports.iter().cloned());
    }
    if !source.volume_mounts.is_empty() {
        apply::upsert_volume_mounts_opt(&mut target.volume_mounts, source.volume_mounts.iter().cloned());
    }
    if let Some(command) = &source.command {
        target.command = Some(command.clone());
    }
    if let Some(args) = &source.args {
        target.args = Some(args.clone());
    }
}
