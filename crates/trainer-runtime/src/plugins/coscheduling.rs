//! scheduler-plugins coscheduling
//!
//! Labels every pod with the job's PodGroup and sizes the group so the
//! scheduler admits all replicas at once. Pod overhead depends on the
//! RuntimeClass and default requests on LimitRanges, so changes to either
//! requeue the suspended jobs they can affect.

use std::collections::BTreeSet;
use std::sync::Arc;

use trainer_common::crd::{
    ClusterTrainingRuntime, PodGroupPolicySource, RuntimeKind, TrainJob, TrainingRuntime, TrainingRuntimeSpec,
};
use trainer_podgroup::{
    compile_coscheduling, gang_size, CoschedulingPodGroup, GangMember, COSCHEDULING_API_VERSION,
    COSCHEDULING_POD_GROUP_LABEL, POD_GROUP_KIND,
};

use super::job_name;
use crate::error::Result;
use crate::framework::{
    BuildContext, Component, ComponentBuilderPlugin, EnforcePodGroupPolicyPlugin, Plugin, RuntimeObject,
    WatchExtensionPlugin, WatchedKind,
};
use crate::info::Info;

pub const NAME: &str = "Coscheduling";

pub struct Coscheduling;

impl Coscheduling {
    pub fn factory() -> Arc<dyn Plugin> {
        Arc::new(Self)
    }
}

fn schedule_timeout(info: &Info) -> Option<Option<i32>> {
    match info.runtime_policy.pod_group_policy.as_ref()?.source()? {
        PodGroupPolicySource::Coscheduling(c) => Some(c.schedule_timeout_seconds),
        PodGroupPolicySource::Volcano(_) | PodGroupPolicySource::KAIScheduler(_) => None,
    }
}

/// Gang members of every pod set, in pod set order
pub(crate) fn gang_members(info: &Info) -> Vec<GangMember> {
    info.template_spec
        .pod_sets
        .iter()
        .map(|ps| GangMember {
            name: ps.name.clone(),
            replicas: ps.count,
            pod_requests: ps.single_pod_requests.clone(),
        })
        .collect()
}

impl Plugin for Coscheduling {
    fn name(&self) -> &'static str {
        NAME
    }

    fn as_enforce_pod_group_policy(&self) -> Option<&dyn EnforcePodGroupPolicyPlugin> {
        Some(self)
    }

    fn as_component_builder(&self) -> Option<&dyn ComponentBuilderPlugin> {
        Some(self)
    }

    fn as_watch_extension(&self) -> Option<&dyn WatchExtensionPlugin> {
        Some(self)
    }
}

impl EnforcePodGroupPolicyPlugin for Coscheduling {
    fn enforce_pod_group_policy(&self, info: Option<&mut Info>, job: &TrainJob) -> Result<()> {
        let Some(info) = info else { return Ok(()) };
        if schedule_timeout(info).is_none() {
            return Ok(());
        }
        info.scheduler
            .pod_labels
            .insert(COSCHEDULING_POD_GROUP_LABEL.to_string(), job_name(job).to_string());
        Ok(())
    }
}

impl ComponentBuilderPlugin for Coscheduling {
    fn build(&self, ctx: &BuildContext<'_>, info: Option<&Info>, job: &TrainJob) -> Result<Vec<RuntimeObject>> {
        let Some(info) = info else { return Ok(Vec::new()) };
        let Some(timeout) = schedule_timeout(info) else {
            return Ok(Vec::new());
        };
        let size = gang_size(&gang_members(info))?;
        let desired = compile_coscheduling(job, &size, timeout);
        Ok(gate(desired, ctx.live.coscheduling_pod_group.as_ref(), job.is_suspended())
            .into_iter()
            .collect())
    }
}

fn gate(desired: CoschedulingPodGroup, live: Option<&CoschedulingPodGroup>, suspended: bool) -> Option<RuntimeObject> {
    match live {
        None => Some(RuntimeObject::create(Component::CoschedulingPodGroup(desired))),
        Some(live) if suspended && desired.differs_from(live) => {
            Some(RuntimeObject::update(Component::CoschedulingPodGroup(desired)))
        }
        Some(_) => None,
    }
}

impl WatchExtensionPlugin for Coscheduling {
    fn watched_kinds(&self) -> Vec<WatchedKind> {
        vec![
            WatchedKind::owns(COSCHEDULING_API_VERSION, POD_GROUP_KIND),
            WatchedKind::watches("v1", "LimitRange"),
            WatchedKind::watches("node.k8s.io/v1", "RuntimeClass"),
        ]
    }
}

// =============================================================================
// Requeue mappings
// =============================================================================

/// Namespace and name of a TrainJob to requeue
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct JobKey {
    pub namespace: String,
    pub name: String,
}

impl JobKey {
    fn of(job: &TrainJob) -> Self {
        Self {
            namespace: job.metadata.namespace.clone().unwrap_or_default(),
            name: job_name(job).to_string(),
        }
    }
}

fn uses_runtime_class(spec: &TrainingRuntimeSpec, runtime_class: &str) -> bool {
    spec.template
        .spec
        .replicated_jobs
        .iter()
        .filter_map(|rjob| rjob.pod_spec())
        .any(|pod| pod.runtime_class_name.as_deref() == Some(runtime_class))
}

/// Suspended jobs whose runtime schedules pods with the given RuntimeClass
pub fn requeue_for_runtime_class(
    runtime_class: &str,
    training_runtimes: &[TrainingRuntime],
    cluster_runtimes: &[ClusterTrainingRuntime],
    jobs: &[TrainJob],
) -> Vec<JobKey> {
    let namespaced: BTreeSet<(String, String)> = training_runtimes
        .iter()
        .filter(|rt| uses_runtime_class(&rt.spec, runtime_class))
        .map(|rt| {
            (
                rt.metadata.namespace.clone().unwrap_or_default(),
                rt.metadata.name.clone().unwrap_or_default(),
            )
        })
        .collect();
    let cluster: BTreeSet<String> = cluster_runtimes
        .iter()
        .filter(|rt| uses_runtime_class(&rt.spec.runtime, runtime_class))
        .filter_map(|rt| rt.metadata.name.clone())
        .collect();

    jobs.iter()
        .filter(|job| job.is_suspended())
        .filter(|job| {
            let runtime = &job.spec.runtime_ref;
            match runtime.kind {
                RuntimeKind::TrainingRuntime => namespaced.contains(&(
                    job.metadata.namespace.clone().unwrap_or_default(),
                    runtime.name.clone(),
                )),
                RuntimeKind::ClusterTrainingRuntime => cluster.contains(&runtime.name),
            }
        })
        .map(JobKey::of)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Suspended jobs in the LimitRange's namespace
pub fn requeue_for_limit_range(namespace: &str, jobs: &[TrainJob]) -> Vec<JobKey> {
    jobs.iter()
        .filter(|job| job.is_suspended() && job.metadata.namespace.as_deref() == Some(namespace))
        .map(JobKey::of)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
