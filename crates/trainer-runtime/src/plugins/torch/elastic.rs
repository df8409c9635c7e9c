//! HorizontalPodAutoscaler for elastic torchrun jobs

use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec, MetricSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use trainer_common::crd::{TorchElasticPolicy, TrainJob};
use trainer_common::TRAINER_API_VERSION;

use crate::framework::{Component, RuntimeObject};
use crate::plugins::{job_name, job_namespace, owner_reference};

/// Keep only the source matching the metric type; unknown types yield `None`
pub fn translate_metric(metric: &MetricSpec) -> Option<MetricSpec> {
    let mut out = MetricSpec {
        type_: metric.type_.clone(),
        ..Default::default()
    };
    match metric.type_.as_str() {
        "Object" => out.object = Some(metric.object.clone()?),
        "Pods" => out.pods = Some(metric.pods.clone()?),
        "Resource" => out.resource = Some(metric.resource.clone()?),
        "ContainerResource" => out.container_resource = Some(metric.container_resource.clone()?),
        "External" => out.external = Some(metric.external.clone()?),
        _ => return None,
    }
    Some(out)
}

/// Desired autoscaler, `None` when the policy declares no metrics
pub fn desired_hpa(policy: &TorchElasticPolicy, job: &TrainJob) -> Option<HorizontalPodAutoscaler> {
    if policy.metrics.is_empty() {
        return None;
    }
    let name = job_name(job);
    let min_replicas = policy.min_nodes;
    let max_replicas = policy.max_nodes.or(min_replicas).unwrap_or(1);

    Some(HorizontalPodAutoscaler {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(job_namespace(job).to_string()),
            owner_references: Some(vec![owner_reference(job)]),
            ..Default::default()
        },
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some(TRAINER_API_VERSION.to_string()),
                kind: "TrainJob".to_string(),
                name: name.to_string(),
            },
            min_replicas,
            max_replicas,
            metrics: Some(policy.metrics.iter().filter_map(translate_metric).collect()),
            behavior: None,
        }),
        status: None,
    })
}

/// Create when missing, update when the spec drifted, otherwise nothing
pub fn gate(desired: HorizontalPodAutoscaler, live: Option<&HorizontalPodAutoscaler>) -> Option<RuntimeObject> {
    match live {
        None => Some(RuntimeObject::create(Component::HorizontalPodAutoscaler(Box::new(desired)))),
        Some(live) if live.spec != desired.spec => {
            Some(RuntimeObject::update(Component::HorizontalPodAutoscaler(Box::new(desired))))
        }
        Some(_) => None,
    }
}
