//! End-to-end composition scenarios through the public engine API

use trainer_common::crd::{
    ClusterTrainingRuntime, ClusterTrainingRuntimeSpec, NumProcPerNode, RuntimeKind, RuntimeRef, TrainJob,
    TrainJobSpec, Trainer, TrainingRuntimeSpec,
};
use trainer_podgroup::CoschedulingPodGroup;
use trainer_runtime::{Component, LiveObjects, ObjectAction, RuntimeEngine, RuntimeObject, RuntimeStore};

// =============================================================================
// Fixtures
// =============================================================================

const GANG_RUNTIME: &str = r#"
mlPolicy:
  numNodes: 10
podGroupPolicy:
  coscheduling:
    scheduleTimeoutSeconds: 120
template:
  spec:
    replicatedJobs:
      - name: init
        template:
          metadata:
            labels:
              trainer.kubeflow.org/trainjob-ancestor-step: dataset-initializer
          spec:
            parallelism: 1
            template:
              spec:
                containers:
                  - name: dataset-initializer
                    resources:
                      requests:
                        cpu: "1"
      - name: node
        template:
          metadata:
            labels:
              trainer.kubeflow.org/trainjob-ancestor-step: trainer
          spec:
            template:
              spec:
                containers:
                  - name: node
                    image: pytorch/pytorch
                    resources:
                      requests:
                        cpu: "1"
"#;

const TORCH_RUNTIME: &str = r#"
mlPolicy:
  numNodes: 1
  torch:
    numProcPerNode: auto
template:
  spec:
    replicatedJobs:
      - name: node
        template:
          metadata:
            labels:
              trainer.kubeflow.org/trainjob-ancestor-step: trainer
          spec:
            template:
              spec:
                containers:
                  - name: node
                    image: pytorch/pytorch
                    resources:
                      requests:
                        cpu: 2500m
"#;

fn store(name: &str, yaml: &str) -> RuntimeStore {
    let spec: TrainingRuntimeSpec = serde_yaml::from_str(yaml).unwrap();
    RuntimeStore::new()
        .with_cluster_training_runtime(ClusterTrainingRuntime::new(name, ClusterTrainingRuntimeSpec { runtime: spec }))
}

fn job(runtime: &str, trainer: Trainer) -> TrainJob {
    let mut job = TrainJob::new(
        "train",
        TrainJobSpec {
            runtime_ref: RuntimeRef {
                name: runtime.to_string(),
                api_group: None,
                kind: RuntimeKind::ClusterTrainingRuntime,
            },
            trainer: Some(trainer),
            ..Default::default()
        },
    );
    job.metadata.namespace = Some("ml".to_string());
    job.metadata.uid = Some("5f1c".to_string());
    job
}

fn compose(store: &RuntimeStore, job: &TrainJob, live: &LiveObjects) -> Vec<RuntimeObject> {
    RuntimeEngine::with_default_plugins()
        .unwrap()
        .new_objects(job, store, live)
        .unwrap()
}

fn trainer_env(objects: &[RuntimeObject], name: &str) -> Option<String> {
    objects.iter().find_map(|o| match &o.object {
        Component::JobSet(js) => js
            .spec
            .replicated_job("node")?
            .pod_spec()?
            .containers
            .iter()
            .find(|c| c.name == "node")?
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)?
            .value
            .clone(),
        _ => None,
    })
}

fn pod_group(objects: &[RuntimeObject]) -> Option<&CoschedulingPodGroup> {
    objects.iter().find_map(|o| match &o.object {
        Component::CoschedulingPodGroup(pg) => Some(pg),
        _ => None,
    })
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn gang_counts_every_replica() {
    let objects = compose(&store("gang", GANG_RUNTIME), &job("gang", Trainer::default()), &LiveObjects::default());

    let pg = pod_group(&objects).expect("pod group");
    assert_eq!(pg.spec.min_member, 11);
    assert_eq!(pg.spec.min_resources["cpu"].0, "11");
    assert_eq!(pg.spec.schedule_timeout_seconds, Some(120));

    let Component::JobSet(js) = &objects[0].object else {
        panic!("JobSet is built first");
    };
    for rjob in &js.spec.replicated_jobs {
        let labels = rjob.template.spec.as_ref().unwrap().template.metadata.as_ref().unwrap().labels.as_ref().unwrap();
        assert_eq!(labels["scheduling.x-k8s.io/pod-group"], "train");
    }
    let node = js.spec.replicated_job("node").unwrap().template.spec.as_ref().unwrap();
    assert_eq!((node.parallelism, node.completions), (Some(10), Some(10)));
}

#[test]
fn auto_directive_rounds_cpu_up() {
    let objects = compose(&store("torch", TORCH_RUNTIME), &job("torch", Trainer::default()), &LiveObjects::default());
    assert_eq!(trainer_env(&objects, "PET_NPROC_PER_NODE").as_deref(), Some("3"));
}

#[test]
fn explicit_directive_is_kept() {
    let trainer = Trainer {
        num_proc_per_node: Some(NumProcPerNode::Int(3)),
        ..Default::default()
    };
    let objects = compose(&store("torch", TORCH_RUNTIME), &job("torch", trainer), &LiveObjects::default());
    assert_eq!(trainer_env(&objects, "PET_NPROC_PER_NODE").as_deref(), Some("3"));
}

#[test]
fn single_device_lora_fine_tuning() {
    let trainer = Trainer {
        command: Some(vec!["tune".to_string(), "run".to_string()]),
        args: Some(vec!["model.lora_rank=8".to_string()]),
        num_nodes: Some(1),
        num_proc_per_node: Some(NumProcPerNode::Int(1)),
        ..Default::default()
    };
    let runtime = "torchtune-llama3.2-1b";
    let objects = compose(&store(runtime, TORCH_RUNTIME), &job(runtime, trainer), &LiveObjects::default());

    let Component::JobSet(js) = &objects[0].object else {
        panic!("expected JobSet");
    };
    let node = &js.spec.replicated_job("node").unwrap().pod_spec().unwrap().containers[0];
    let command = node.command.as_ref().unwrap();
    assert!(command.iter().any(|c| c == "lora_finetune_single_device"));
    assert!(command.iter().any(|c| c.ends_with("_lora_single_device.yaml")));
}

#[test]
fn running_job_is_left_alone() {
    let store = store("gang", GANG_RUNTIME);
    let running = job("gang", Trainer::default());
    let created = compose(&store, &running, &LiveObjects::default());

    let mut live = LiveObjects::default();
    for object in created {
        match object.object {
            Component::JobSet(js) => live.jobset = Some(*js),
            Component::CoschedulingPodGroup(pg) => live.coscheduling_pod_group = Some(pg),
            other => panic!("unexpected {}", other.kind()),
        }
    }

    let drifted = job(
        "gang",
        Trainer {
            image: Some("pytorch/pytorch:next".to_string()),
            num_nodes: Some(4),
            ..Default::default()
        },
    );
    assert!(compose(&store, &drifted, &live).is_empty());

    let mut suspended = drifted.clone();
    suspended.spec.suspend = Some(true);
    let objects = compose(&store, &suspended, &live);
    assert_eq!(objects.len(), 2);
    assert!(objects.iter().all(|o| o.action == ObjectAction::Update));
}

#[test]
fn resume_updates_suspended_jobset() {
    let store = store("gang", GANG_RUNTIME);
    let mut suspended = job("gang", Trainer::default());
    suspended.spec.suspend = Some(true);
    let Component::JobSet(js) = compose(&store, &suspended, &LiveObjects::default()).remove(0).object else {
        panic!("expected JobSet");
    };
    let live = LiveObjects {
        jobset: Some(*js),
        ..Default::default()
    };

    let resumed = job("gang", Trainer::default());
    let objects = compose(&store, &resumed, &live);
    let Component::JobSet(js) = &objects[0].object else {
        panic!("expected JobSet");
    };
    assert_eq!(objects[0].action, ObjectAction::Update);
    assert_eq!(js.spec.suspend, None);
}

#[test]
fn composition_is_idempotent() {
    let store = store("torch", TORCH_RUNTIME);
    let job = job("torch", Trainer::default());
    let first = compose(&store, &job, &LiveObjects::default());
    let second = compose(&store, &job, &LiveObjects::default());
    assert_eq!(first, second);
}

#[test]
fn kai_queue_reaches_every_pod_template() {
    let yaml = GANG_RUNTIME.replace(
        "  coscheduling:\n    scheduleTimeoutSeconds: 120\n",
        "  kaiScheduler:\n    queue: research\n",
    );
    let objects = compose(&store("kai", &yaml), &job("kai", Trainer::default()), &LiveObjects::default());
    assert_eq!(objects.len(), 1);

    let Component::JobSet(js) = &objects[0].object else {
        panic!("expected JobSet");
    };
    for rjob in &js.spec.replicated_jobs {
        let labels = rjob.template.spec.as_ref().unwrap().template.metadata.as_ref().unwrap().labels.as_ref().unwrap();
        assert_eq!(labels["kai.scheduler/queue"], "research");
    }
}

#[test]
fn xgboost_workers_find_the_tracker() {
    let yaml = TORCH_RUNTIME.replace("  torch:\n    numProcPerNode: auto\n", "  xgboost: {}\n");
    let trainer = Trainer {
        num_nodes: Some(3),
        ..Default::default()
    };
    let objects = compose(&store("xgboost", &yaml), &job("xgboost", trainer), &LiveObjects::default());
    assert_eq!(trainer_env(&objects, "DMLC_TRACKER_URI").as_deref(), Some("train-node-0-0.train"));
    assert_eq!(trainer_env(&objects, "DMLC_NUM_WORKER").as_deref(), Some("3"));
}

#[test]
fn flux_cluster_objects() {
    let yaml = TORCH_RUNTIME.replace("  torch:\n    numProcPerNode: auto\n", "  flux:\n    numProcPerNode: 2\n");
    let trainer = Trainer {
        command: Some(vec!["lmp".to_string()]),
        args: Some(vec!["-in".to_string(), "in.lj".to_string()]),
        ..Default::default()
    };
    let objects = compose(&store("flux", &yaml), &job("flux", trainer), &LiveObjects::default());
    let kinds: Vec<_> = objects.iter().map(|o| o.object.kind()).collect();
    assert_eq!(kinds, ["JobSet", "ConfigMap", "Secret"]);

    let Component::JobSet(js) = &objects[0].object else {
        panic!("expected JobSet");
    };
    let pod = js.spec.replicated_job("node").unwrap().pod_spec().unwrap();
    let node = &pod.containers[0];
    assert_eq!(node.command.as_ref().unwrap(), &["/bin/bash", "/etc/flux-config/entrypoint.sh"]);
    assert_eq!(node.args.as_deref(), Some(&[][..]));
    assert_eq!(pod.init_containers.as_ref().unwrap()[0].name, "flux-installer");

    let Component::ConfigMap(cm) = &objects[1].object else {
        panic!("expected ConfigMap");
    };
    assert!(cm.data.as_ref().unwrap()["entrypoint.sh"].contains("command=\"lmp -in in.lj\""));
}
