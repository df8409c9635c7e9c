//! Runtime composition engine for TrainJobs
//!
//! Merges a training runtime template with a TrainJob's overrides and turns
//! the result into the objects the job needs:
//! - [`info`]: the per-pass build context plugins mutate
//! - [`framework`]: capability traits, registry and dispatch
//! - [`plugins`]: ML policies, gang scheduling and the JobSet builder
//! - [`core`]: runtime resolution and the [`RuntimeEngine`] pipeline
//!
//! Everything here is synchronous and performs no I/O; callers fetch live
//! objects and apply the produced ones.

pub mod apply;
pub mod core;
pub mod error;
pub mod framework;
pub mod info;
pub mod plugins;
pub mod resources;
pub mod validation;

pub use crate::core::{build_info, resolve_runtime, ResolvedRuntime, RuntimeEngine, RuntimeLookup, RuntimeStore};
pub use error::{Result, RuntimeError};
pub use framework::{Component, LiveObjects, ObjectAction, RuntimeObject, WatchRelation, WatchedKind};
pub use info::Info;
pub use validation::{FieldError, FieldErrorKind, ValidationResult, Warnings};

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;

    use k8s_openapi::api::batch::v1::{JobSpec, JobTemplateSpec};
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use trainer_common::crd::{
        JobSetSpec, JobSetTemplateSpec, MLPolicy, ReplicatedJob, TrainJob, TrainJobSpec, Trainer,
        TrainingRuntimeSpec,
    };
    use trainer_common::{ANCESTOR_TRAINER, LABEL_TRAINJOB_ANCESTOR, NODE};

    use crate::info::Info;

    fn runtime(policy: Option<MLPolicy>, cpu: Option<&str>) -> TrainingRuntimeSpec {
        let resources = cpu.map(|cpu| ResourceRequirements {
            requests: Some(BTreeMap::from([("cpu".to_string(), Quantity(cpu.to_string()))])),
            ..Default::default()
        });
        let node = ReplicatedJob {
            name: NODE.to_string(),
            replicas: Some(1),
            template: JobTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(BTreeMap::from([(
                        LABEL_TRAINJOB_ANCESTOR.to_string(),
                        ANCESTOR_TRAINER.to_string(),
                    )])),
                    ..Default::default()
                }),
                spec: Some(JobSpec {
                    template: PodTemplateSpec {
                        metadata: None,
                        spec: Some(PodSpec {
                            containers: vec![Container {
                                name: NODE.to_string(),
                                image: Some("trainer:latest".to_string()),
                                resources,
                                ..Default::default()
                            }],
                            ..Default::default()
                        }),
                    },
                    ..Default::default()
                }),
            },
            depends_on: Vec::new(),
        };
        TrainingRuntimeSpec {
            ml_policy: policy,
            pod_group_policy: None,
            template: JobSetTemplateSpec {
                metadata: None,
                spec: JobSetSpec {
                    replicated_jobs: vec![node],
                    ..Default::default()
                },
            },
        }
    }

    /// Single `node` replicated job without resources
    pub fn node_runtime(policy: Option<MLPolicy>) -> TrainingRuntimeSpec {
        runtime(policy, None)
    }

    /// Single `node` replicated job requesting `cpu`
    pub fn node_runtime_with(policy: Option<MLPolicy>, cpu: &str) -> TrainingRuntimeSpec {
        runtime(policy, Some(cpu))
    }

    pub fn runtime_from_yaml(yaml: &str) -> TrainingRuntimeSpec {
        serde_yaml::from_str(yaml).expect("runtime yaml")
    }

    pub fn info_for(spec: &TrainingRuntimeSpec) -> Info {
        crate::core::build_info(&TrainJob::new("job", TrainJobSpec::default()), spec).expect("info")
    }

    /// Job `default/job` with the given trainer overrides
    pub fn train_job(trainer: Trainer) -> TrainJob {
        let mut job = TrainJob::new(
            "job",
            TrainJobSpec {
                trainer: Some(trainer),
                ..Default::default()
            },
        );
        job.metadata.namespace = Some("default".to_string());
        job.metadata.uid = Some("uid".to_string());
        job
    }
}
