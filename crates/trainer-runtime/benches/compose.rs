//! Criterion benchmarks for runtime composition
//!
//! Measures one full pass (resolve, Info construction, plugin phases and
//! builders) for growing numbers of replicated jobs.

use std::collections::BTreeMap;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use k8s_openapi::api::batch::v1::{JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use trainer_common::crd::{
    ClusterTrainingRuntime, ClusterTrainingRuntimeSpec, CoschedulingPodGroupPolicySource, JobSetSpec,
    JobSetTemplateSpec, MLPolicy, PodGroupPolicy, ReplicatedJob, RuntimeKind, RuntimeRef, TorchMLPolicySource,
    TrainJob, TrainJobSpec, Trainer, TrainingRuntimeSpec,
};
use trainer_common::{ANCESTOR_TRAINER, LABEL_TRAINJOB_ANCESTOR, NODE};
use trainer_runtime::{build_info, LiveObjects, RuntimeEngine, RuntimeStore};

// =============================================================================
// Fixtures
// =============================================================================

fn replicated_job(name: &str, ancestor: Option<&str>) -> ReplicatedJob {
    ReplicatedJob {
        name: name.to_string(),
        replicas: Some(1),
        template: JobTemplateSpec {
            metadata: ancestor.map(|a| ObjectMeta {
                labels: Some(BTreeMap::from([(LABEL_TRAINJOB_ANCESTOR.to_string(), a.to_string())])),
                ..Default::default()
            }),
            spec: Some(JobSpec {
                parallelism: Some(1),
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: name.to_string(),
                            image: Some("pytorch/pytorch".to_string()),
                            resources: Some(ResourceRequirements {
                                requests: Some(BTreeMap::from([
                                    ("cpu".to_string(), Quantity("2".to_string())),
                                    ("memory".to_string(), Quantity("8Gi".to_string())),
                                ])),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
        },
        depends_on: Vec::new(),
    }
}

/// Torch runtime with coscheduling, a trainer job and `sidecars` extra jobs
fn runtime(sidecars: usize) -> TrainingRuntimeSpec {
    let mut replicated_jobs = vec![replicated_job(NODE, Some(ANCESTOR_TRAINER))];
    replicated_jobs.extend((0..sidecars).map(|i| replicated_job(&format!("aux-{i}"), None)));
    TrainingRuntimeSpec {
        ml_policy: Some(MLPolicy {
            num_nodes: Some(8),
            torch: Some(TorchMLPolicySource::default()),
            ..Default::default()
        }),
        pod_group_policy: Some(PodGroupPolicy {
            coscheduling: Some(CoschedulingPodGroupPolicySource {
                schedule_timeout_seconds: Some(60),
            }),
            volcano: None,
        }),
        template: JobSetTemplateSpec {
            metadata: None,
            spec: JobSetSpec {
                replicated_jobs,
                ..Default::default()
            },
        },
    }
}

fn job() -> TrainJob {
    let mut job = TrainJob::new(
        "bench",
        TrainJobSpec {
            runtime_ref: RuntimeRef {
                name: "torch".to_string(),
                api_group: None,
                kind: RuntimeKind::ClusterTrainingRuntime,
            },
            trainer: Some(Trainer {
                num_nodes: Some(16),
                ..Default::default()
            }),
            ..Default::default()
        },
    );
    job.metadata.namespace = Some("default".to_string());
    job.metadata.uid = Some("bench-uid".to_string());
    job
}

// =============================================================================
// Benchmarks
// =============================================================================

fn bench_build_info(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_info");
    let job = job();
    for size in [0usize, 8, 64] {
        let spec = runtime(size);
        group.throughput(Throughput::Elements(size as u64 + 1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &spec, |b, spec| {
            b.iter(|| build_info(black_box(&job), black_box(spec)))
        });
    }
    group.finish();
}

fn bench_new_objects(c: &mut Criterion) {
    let mut group = c.benchmark_group("new_objects");
    let engine = RuntimeEngine::with_default_plugins().expect("default plugins");
    let job = job();
    let live = LiveObjects::default();
    for size in [0usize, 8, 64] {
        let store = RuntimeStore::new().with_cluster_training_runtime(ClusterTrainingRuntime::new(
            "torch",
            ClusterTrainingRuntimeSpec { runtime: runtime(size) },
        ));
        group.throughput(Throughput::Elements(size as u64 + 1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &store, |b, store| {
            b.iter(|| engine.new_objects(black_box(&job), store, &live))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_build_info, bench_new_objects);
criterion_main!(benches);
