//! Per-node resource math for distributed training
//!
//! Derives the process count per node from a directive and the node's
//! resource requirements, and counts accelerators for the fine-tuning path.

use k8s_openapi::api::core::v1::ResourceRequirements;
use trainer_common::crd::{JobSetSpec, NumProcPerNode, TrainJob};
use trainer_common::quantity::{parse_quantity, ResourceList};
use trainer_common::{ANCESTOR_TRAINER, LABEL_TRAINJOB_ANCESTOR, NODE};

use crate::error::Result;
use crate::info::Info;

/// Whether a resource name denotes an accelerator, regardless of vendor prefix
pub fn is_gpu_resource(name: &str) -> bool {
    name.to_ascii_lowercase().contains("gpu")
}

/// Count of the first GPU-named resource in a list, zero when none
pub fn num_gpu(list: &ResourceList) -> Result<i64> {
    match list.iter().find(|(name, _)| is_gpu_resource(name)) {
        Some((_, q)) => Ok(parse_quantity(q)?.ceil_units()),
        None => Ok(0),
    }
}

/// GPUs per node, read from requests first and then limits
pub fn gpu_per_node(resources: Option<&ResourceRequirements>) -> Result<i64> {
    let Some(resources) = resources else {
        return Ok(0);
    };
    let requested = match &resources.requests {
        Some(requests) => num_gpu(requests)?,
        None => 0,
    };
    if requested > 0 {
        return Ok(requested);
    }
    match &resources.limits {
        Some(limits) => num_gpu(limits),
        None => Ok(0),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Directive {
    Auto,
    Cpu,
}

fn cpu_count(list: &ResourceList) -> Result<i32> {
    let cpus = match list.get("cpu") {
        Some(q) => parse_quantity(q)?.ceil_units(),
        None => 0,
    };
    Ok(i32::try_from(cpus).unwrap_or(i32::MAX).max(1))
}

/// Process count computed from one side of the requirements, plus whether a GPU was seen
fn per_side(directive: Directive, list: &ResourceList) -> Result<(NumProcPerNode, bool)> {
    match directive {
        Directive::Auto if list.keys().any(|k| is_gpu_resource(k)) => Ok((NumProcPerNode::auto(), true)),
        Directive::Auto | Directive::Cpu => Ok((NumProcPerNode::Int(cpu_count(list)?), false)),
    }
}

/// Resolve a process-per-node directive against per-node resources.
///
/// Explicit counts and `gpu` pass through. `auto` keeps `auto` whenever a GPU
/// is listed on either side and otherwise counts CPUs; `cpu` always counts
/// CPUs. When both limits and requests are given, limits win a disagreement.
pub fn proc_per_node(
    directive: &NumProcPerNode,
    resources: Option<&ResourceRequirements>,
) -> Result<NumProcPerNode> {
    let directive = if directive.is_auto() {
        Directive::Auto
    } else if directive.is_cpu() {
        Directive::Cpu
    } else {
        return Ok(directive.clone());
    };

    let requests = resources.and_then(|r| r.requests.as_ref());
    let limits = resources.and_then(|r| r.limits.as_ref());

    let from_requests = requests.map(|l| per_side(directive, l)).transpose()?;
    let from_limits = limits.map(|l| per_side(directive, l)).transpose()?;

    Ok(match (from_requests, from_limits) {
        (None, None) => NumProcPerNode::Int(1),
        (Some((npp, _)), None) | (None, Some((npp, _))) => npp,
        (Some((req, req_gpu)), Some((lim, lim_gpu))) => {
            let ints_disagree = matches!((&req, &lim), (NumProcPerNode::Int(a), NumProcPerNode::Int(b)) if a != b);
            if (!req_gpu && lim_gpu) || (!req_gpu && !lim_gpu && ints_disagree) {
                lim
            } else {
                req
            }
        }
    })
}

/// Resources of the trainer `node` container in the runtime template
pub fn template_resources_per_node(spec: &JobSetSpec) -> Option<&ResourceRequirements> {
    spec.replicated_jobs
        .iter()
        .filter(|rjob| {
            rjob.name == NODE
                || rjob
                    .labels()
                    .and_then(|l| l.get(LABEL_TRAINJOB_ANCESTOR))
                    .is_some_and(|a| a == ANCESTOR_TRAINER)
        })
        .filter_map(|rjob| rjob.pod_spec())
        .flat_map(|pod| pod.containers.iter())
        .find(|c| c.name == NODE)
        .and_then(|c| c.resources.as_ref())
}

/// Effective per-node resources: the job's override, else the template's
pub fn resources_per_node<'a>(info: &'a Info, job: &'a TrainJob) -> Option<&'a ResourceRequirements> {
    job.spec
        .trainer
        .as_ref()
        .and_then(|t| t.resources_per_node.as_ref())
        .or_else(|| info.template_object::<JobSetSpec>().and_then(template_resources_per_node))
}
