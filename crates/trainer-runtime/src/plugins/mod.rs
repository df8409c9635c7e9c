//! Built-in plugins
//!
//! ML policies: [`plainml`], [`torch`], [`mpi`], [`jax`], [`xgboost`], [`flux`].
//! Gang scheduling: [`coscheduling`], [`volcano`], [`kai`].
//! Workload: [`jobset`].

pub mod coscheduling;
pub mod flux;
pub mod jax;
pub mod jobset;
pub mod kai;
pub mod mpi;
pub mod plainml;
pub mod torch;
pub mod volcano;
pub mod xgboost;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use trainer_common::crd::{JobSetSpec, MLPolicySource, TrainJob};
use trainer_common::{ANCESTOR_TRAINER, NODE, TRAINER_API_VERSION};

use crate::info::Info;

/// Active ML policy variant of an Info, if any policy is set
pub(crate) fn ml_policy_source(info: &Info) -> Option<MLPolicySource<'_>> {
    info.runtime_policy.ml_policy.as_ref().map(|p| p.source())
}

pub(crate) fn job_name(job: &TrainJob) -> &str {
    job.metadata.name.as_deref().unwrap_or_default()
}

pub(crate) fn job_namespace(job: &TrainJob) -> &str {
    job.metadata.namespace.as_deref().unwrap_or("default")
}

/// Replicated job name of the trainer pod set, `node` when there is none
pub(crate) fn trainer_pod_set_name(info: &Info) -> String {
    info.find_pod_set_by_ancestor(ANCESTOR_TRAINER)
        .map_or_else(|| NODE.to_string(), |ps| ps.name.clone())
}

/// Headless service subdomain of the produced JobSet
pub(crate) fn job_subdomain(info: &Info, job: &TrainJob) -> String {
    let name = job_name(job);
    info.template_object::<JobSetSpec>()
        .map_or(name, |spec| spec.subdomain(name))
        .to_string()
}

/// DNS name of the first trainer pod, used as rendezvous host
pub(crate) fn first_trainer_host(info: &Info, job: &TrainJob) -> String {
    format!(
        "{}-{}-0-0.{}",
        job_name(job),
        trainer_pod_set_name(info),
        job_subdomain(info, job)
    )
}

/// Node count requested by the job
pub(crate) fn job_num_nodes(job: &TrainJob) -> Option<i32> {
    job.spec.trainer.as_ref().and_then(|t| t.num_nodes)
}

/// Controller reference from a produced object to its TrainJob
pub(crate) fn owner_reference(job: &TrainJob) -> OwnerReference {
    OwnerReference {
        api_version: TRAINER_API_VERSION.to_string(),
        kind: "TrainJob".to_string(),
        name: job_name(job).to_string(),
        uid: job.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}
