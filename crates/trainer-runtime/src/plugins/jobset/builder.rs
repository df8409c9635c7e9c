//! JobSetBuilder: layers job overrides onto a synchronized JobSet template
//!
//! Each step targets replicated jobs by ancestor label or by name and merges
//! by name at every level, so running the builder twice on the same inputs
//! produces the same JobSet.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, PodSpec};
use trainer_common::crd::{ContainerOverride, InitializerSource, JobSet, JobSetSpec, ReplicatedJob, TrainJob};
use trainer_common::{
    ANCESTOR_TRAINER, DATASET_INITIALIZER, INITIALIZER_ENV_STORAGE_URI, LABEL_TRAINJOB_ANCESTOR, MODEL_INITIALIZER,
    NODE,
};

use crate::apply::{self, env};
use crate::info::Info;
use crate::plugins::{job_name, job_namespace, owner_reference};

fn ancestor(rjob: &ReplicatedJob) -> Option<&str> {
    rjob.labels()?.get(LABEL_TRAINJOB_ANCESTOR).map(String::as_str)
}

fn is_trainer(rjob: &ReplicatedJob) -> bool {
    match ancestor(rjob) {
        Some(a) => a == ANCESTOR_TRAINER,
        None => rjob.name == NODE,
    }
}

fn container_mut<'a>(pod: &'a mut PodSpec, name: &str) -> Option<&'a mut Container> {
    pod.containers.iter_mut().find(|c| c.name == name)
}

fn merge_container(container: &mut Container, patch: &ContainerOverride) {
    if !patch.env.is_empty() {
        apply::upsert_env_vars_opt(&mut container.env, patch.env.iter().cloned());
    }
    if !patch.volume_mounts.is_empty() {
        apply::upsert_volume_mounts_opt(&mut container.volume_mounts, patch.volume_mounts.iter().cloned());
    }
}

fn merge_containers(containers: &mut [Container], patches: &[ContainerOverride]) {
    for patch in patches {
        if let Some(container) = containers.iter_mut().find(|c| c.name == patch.name) {
            merge_container(container, patch);
        }
    }
}

pub struct JobSetBuilder {
    name: String,
    namespace: String,
    spec: JobSetSpec,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
}

impl JobSetBuilder {
    /// Start from a template already synchronized with the Info pod sets
    pub fn new(job: &TrainJob, spec: JobSetSpec) -> Self {
        Self {
            name: job_name(job).to_string(),
            namespace: job_namespace(job).to_string(),
            spec,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    fn for_each_pod(&mut self, select: impl Fn(&ReplicatedJob) -> bool, mut f: impl FnMut(&mut PodSpec)) {
        self.spec
            .replicated_jobs
            .iter_mut()
            .filter(|rjob| select(rjob))
            .filter_map(ReplicatedJob::pod_spec_mut)
            .for_each(|pod| f(pod));
    }

    fn initializer_step(&mut self, step: &str, source: &InitializerSource) {
        let selects = |rjob: &ReplicatedJob| ancestor(rjob).map_or(rjob.name == step, |a| a == step);
        self.for_each_pod(selects, |pod| {
            let Some(container) = container_mut(pod, step) else {
                return;
            };
            if let Some(uri) = &source.storage_uri {
                apply::upsert_env_vars_opt(&mut container.env, [env(INITIALIZER_ENV_STORAGE_URI, uri.clone())]);
            }
            if !source.env.is_empty() {
                apply::upsert_env_vars_opt(&mut container.env, source.env.iter().cloned());
            }
            if let Some(secret) = &source.secret_ref {
                apply::upsert_secret_env_from(&mut container.env_from, &secret.name);
            }
        });
    }

    /// Storage URI, env and secret of the dataset and model initializers
    pub fn initializer(mut self, job: &TrainJob) -> Self {
        let Some(initializer) = &job.spec.initializer else {
            return self;
        };
        if let Some(dataset) = &initializer.dataset {
            self.initializer_step(DATASET_INITIALIZER, dataset);
        }
        if let Some(model) = &initializer.model {
            self.initializer_step(MODEL_INITIALIZER, model);
        }
        self
    }

    /// Trainer overrides on the `node` container.
    ///
    /// Command and args computed by an ML policy were already synced into the
    /// template and take precedence over the job's own values.
    pub fn trainer(mut self, info: &Info, job: &TrainJob) -> Self {
        let Some(trainer) = &job.spec.trainer else {
            return self;
        };
        let computed = info.find_container(ANCESTOR_TRAINER, NODE);
        let computed_command = computed.is_some_and(|c| c.command.is_some());
        let computed_args = computed.is_some_and(|c| c.args.is_some());

        self.for_each_pod(is_trainer, |pod| {
            let Some(container) = container_mut(pod, NODE) else {
                return;
            };
            if let Some(image) = &trainer.image {
                container.image = Some(image.clone());
            }
            if !computed_command && trainer.command.is_some() {
                container.command = trainer.command.clone();
            }
            if !computed_args && trainer.args.is_some() {
                container.args = trainer.args.clone();
            }
            if !trainer.env.is_empty() {
                apply::upsert_env_vars_opt(&mut container.env, trainer.env.iter().cloned());
            }
            if let Some(resources) = &trainer.resources_per_node {
                container.resources = Some(resources.clone());
            }
        });
        self
    }

    /// Per replicated job pod template overrides, in declaration order
    pub fn pod_spec_overrides(mut self, job: &TrainJob) -> Self {
        for patch in &job.spec.pod_spec_overrides {
            self.for_each_pod(|rjob| patch.targets(&rjob.name), |pod| {
                if let Some(sa) = &patch.service_account_name {
                    pod.service_account_name = Some(sa.clone());
                }
                if let Some(selector) = &patch.node_selector {
                    pod.node_selector
                        .get_or_insert_with(BTreeMap::new)
                        .extend(selector.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                if let Some(affinity) = &patch.affinity {
                    pod.affinity = Some(affinity.clone());
                }
                if !patch.tolerations.is_empty() {
                    apply::append_tolerations(&mut pod.tolerations, &patch.tolerations);
                }
                if !patch.volumes.is_empty() {
                    apply::upsert_volumes_opt(&mut pod.volumes, patch.volumes.iter().cloned());
                }
                if !patch.scheduling_gates.is_empty() {
                    apply::upsert_scheduling_gates(&mut pod.scheduling_gates, patch.scheduling_gates.iter().cloned());
                }
                merge_containers(&mut pod.containers, &patch.containers);
                if let Some(init) = pod.init_containers.as_mut() {
                    merge_containers(init, &patch.init_containers);
                }
            });
        }
        self
    }

    /// Stamp scheduler labels onto every pod template
    pub fn pod_labels(mut self, labels: &BTreeMap<String, String>) -> Self {
        if labels.is_empty() {
            return self;
        }
        for rjob in &mut self.spec.replicated_jobs {
            let Some(job_spec) = rjob.template.spec.as_mut() else {
                continue;
            };
            job_spec
                .template
                .metadata
                .get_or_insert_with(Default::default)
                .labels
                .get_or_insert_with(BTreeMap::new)
                .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        self
    }

    pub fn suspend(mut self, suspend: Option<bool>) -> Self {
        self.spec.suspend = suspend;
        self
    }

    pub fn labels(mut self, labels: &BTreeMap<String, String>) -> Self {
        self.labels = labels.clone();
        self
    }

    pub fn annotations(mut self, annotations: &BTreeMap<String, String>) -> Self {
        self.annotations = annotations.clone();
        self
    }

    /// Finish the JobSet, owned by the given TrainJob
    pub fn build(self, owner: &TrainJob) -> JobSet {
        let mut jobset = JobSet::new(&self.name, &self.namespace, self.spec);
        if !self.labels.is_empty() {
            jobset.metadata.labels = Some(self.labels);
        }
        if !self.annotations.is_empty() {
            jobset.metadata.annotations = Some(self.annotations);
        }
        jobset.metadata.owner_references = Some(vec![owner_reference(owner)]);
        jobset
    }
}
