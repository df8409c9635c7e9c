//! Runtime resolution and the composition pipeline
//!
//! [`RuntimeEngine`] resolves a TrainJob's runtime reference, builds the
//! per-pass [`Info`], and runs the plugin phases in order:
//! ML policy, pod group policy, then component builders.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::PodSpec;
use tracing::{debug, info, instrument};
use trainer_common::crd::{
    ClusterTrainingRuntime, RuntimeKind, TrainJob, TrainingRuntime, TrainingRuntimeSpec,
};
use trainer_common::{ANCESTOR_TRAINER, LABEL_SUPPORT, LABEL_TRAINJOB_ANCESTOR, NODE, SUPPORT_DEPRECATED, TRAINER_GROUP};

use crate::error::{Result, RuntimeError};
use crate::framework::{BuildContext, Framework, LiveObjects, Registry, RuntimeObject, WatchedKind};
use crate::info::{Info, InfoOptions};
use crate::plugins::{job_name, job_namespace};
use crate::validation::{FieldError, FieldPath, ValidationResult, Warnings};

/// JobSet TTLs below this many seconds draw an admission warning
pub const MIN_TTL_SECONDS_AFTER_FINISHED: i32 = 60;

// =============================================================================
// Runtime lookup
// =============================================================================

/// Read access to the runtimes a job may reference
pub trait RuntimeLookup: Send + Sync {
    fn training_runtime(&self, namespace: &str, name: &str) -> Option<&TrainingRuntime>;

    fn cluster_training_runtime(&self, name: &str) -> Option<&ClusterTrainingRuntime>;
}

/// In-memory [`RuntimeLookup`] filled by the caller
#[derive(Clone, Debug, Default)]
pub struct RuntimeStore {
    training: BTreeMap<(String, String), TrainingRuntime>,
    cluster: BTreeMap<String, ClusterTrainingRuntime>,
}

impl RuntimeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_training_runtime(&mut self, runtime: TrainingRuntime) {
        let key = (
            runtime.metadata.namespace.clone().unwrap_or_default(),
            runtime.metadata.name.clone().unwrap_or_default(),
        );
        self.training.insert(key, runtime);
    }

    pub fn insert_cluster_training_runtime(&mut self, runtime: ClusterTrainingRuntime) {
        let key = runtime.metadata.name.clone().unwrap_or_default();
        self.cluster.insert(key, runtime);
    }

    pub fn with_training_runtime(mut self, runtime: TrainingRuntime) -> Self {
        self.insert_training_runtime(runtime);
        self
    }

    pub fn with_cluster_training_runtime(mut self, runtime: ClusterTrainingRuntime) -> Self {
        self.insert_cluster_training_runtime(runtime);
        self
    }
}

impl RuntimeLookup for RuntimeStore {
    fn training_runtime(&self, namespace: &str, name: &str) -> Option<&TrainingRuntime> {
        self.training.get(&(namespace.to_string(), name.to_string()))
    }

    fn cluster_training_runtime(&self, name: &str) -> Option<&ClusterTrainingRuntime> {
        self.cluster.get(name)
    }
}

/// A runtime reference resolved to its spec
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedRuntime {
    pub kind: RuntimeKind,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub spec: TrainingRuntimeSpec,
}

impl ResolvedRuntime {
    pub fn is_deprecated(&self) -> bool {
        self.labels.get(LABEL_SUPPORT).is_some_and(|v| v == SUPPORT_DEPRECATED)
    }
}

/// Resolve `spec.runtimeRef` of a job
pub fn resolve_runtime(job: &TrainJob, lookup: &dyn RuntimeLookup) -> Result<ResolvedRuntime> {
    let runtime_ref = &job.spec.runtime_ref;
    let namespace = job_namespace(job);
    let not_found = || RuntimeError::RuntimeNotFound {
        kind: runtime_ref.kind,
        namespace: match runtime_ref.kind {
            RuntimeKind::TrainingRuntime => Some(namespace.to_string()),
            RuntimeKind::ClusterTrainingRuntime => None,
        },
        name: runtime_ref.name.clone(),
    };

    if runtime_ref.api_group.as_deref().is_some_and(|g| g != TRAINER_GROUP) {
        return Err(not_found());
    }

    let (labels, spec) = match runtime_ref.kind {
        RuntimeKind::TrainingRuntime => {
            let rt = lookup
                .training_runtime(namespace, &runtime_ref.name)
                .ok_or_else(not_found)?;
            (rt.metadata.labels.clone(), rt.spec.clone())
        }
        RuntimeKind::ClusterTrainingRuntime => {
            let rt = lookup
                .cluster_training_runtime(&runtime_ref.name)
                .ok_or_else(not_found)?;
            (rt.metadata.labels.clone(), rt.spec.runtime.clone())
        }
    };

    Ok(ResolvedRuntime {
        kind: runtime_ref.kind,
        name: runtime_ref.name.clone(),
        labels: labels.unwrap_or_default(),
        spec,
    })
}

// =============================================================================
// Info construction
// =============================================================================

fn merged(template: Option<&BTreeMap<String, String>>, job: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
    let mut out = template.cloned().unwrap_or_default();
    if let Some(job) = job {
        out.extend(job.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    out
}

/// Build the Info of one pass from a runtime spec and a job.
///
/// Template labels and annotations are overridden by the job's. The trainer
/// pod set starts at the policy's node count, every other pod set at the
/// template parallelism.
pub fn build_info(job: &TrainJob, runtime: &TrainingRuntimeSpec) -> Result<Info> {
    let template = &runtime.template;
    let metadata = template.metadata.as_ref();
    let default_pod = PodSpec::default();

    let mut options = InfoOptions::default()
        .with_labels(merged(metadata.and_then(|m| m.labels.as_ref()), job.spec.labels.as_ref()))
        .with_annotations(merged(
            metadata.and_then(|m| m.annotations.as_ref()),
            job.spec.annotations.as_ref(),
        ))
        .with_ml_policy(runtime.ml_policy.clone())
        .with_pod_group_policy(runtime.pod_group_policy.clone())
        .with_template_object(template.spec.clone());

    for rjob in &template.spec.replicated_jobs {
        let ancestor = rjob.labels().and_then(|l| l.get(LABEL_TRAINJOB_ANCESTOR)).map(String::as_str);
        let is_trainer = match ancestor {
            Some(a) => a == ANCESTOR_TRAINER,
            None => rjob.name == NODE,
        };
        let parallelism = rjob.template.spec.as_ref().and_then(|s| s.parallelism);
        let count = if is_trainer {
            runtime.ml_policy.as_ref().and_then(|p| p.num_nodes).or(parallelism)
        } else {
            parallelism
        };
        let pod_spec = rjob.pod_spec().unwrap_or(&default_pod);
        options = options.with_pod_spec_replicas(&rjob.name, ancestor, count, pod_spec);
    }

    Info::new(options)
}

// =============================================================================
// Engine
// =============================================================================

/// The composition engine, shareable across concurrent reconciles
#[derive(Clone)]
pub struct RuntimeEngine {
    framework: Arc<Framework>,
}

impl RuntimeEngine {
    pub fn new(framework: Arc<Framework>) -> Self {
        Self { framework }
    }

    /// Engine over the built-in plugins in their default order
    pub fn with_default_plugins() -> Result<Self> {
        Ok(Self::new(Arc::new(Framework::new(Registry::default())?)))
    }

    pub fn framework(&self) -> &Framework {
        &self.framework
    }

    /// Resolve the job's runtime and build the objects the job needs
    pub fn new_objects(
        &self,
        job: &TrainJob,
        lookup: &dyn RuntimeLookup,
        live: &LiveObjects,
    ) -> Result<Vec<RuntimeObject>> {
        let runtime = resolve_runtime(job, lookup)?;
        self.build_objects(job, &runtime, live)
    }

    /// Run the plugin pipeline against an already resolved runtime
    #[instrument(skip_all, fields(job = %job_name(job), runtime = %runtime.name))]
    pub fn build_objects(
        &self,
        job: &TrainJob,
        runtime: &ResolvedRuntime,
        live: &LiveObjects,
    ) -> Result<Vec<RuntimeObject>> {
        let mut job = job.clone();
        let mut info = build_info(&job, &runtime.spec)?;

        self.framework
            .run_enforce_ml_policy_plugins(Some(&mut info), &mut job)?;
        self.framework
            .run_enforce_pod_group_policy_plugins(Some(&mut info), &job)?;
        let objects = self
            .framework
            .run_component_builder_plugins(&BuildContext { live }, Some(&info), &job)?;

        info!(objects = objects.len(), "composed runtime objects");
        Ok(objects)
    }

    /// Admission checks for a created or updated job
    #[instrument(skip_all, fields(job = %job_name(new)))]
    pub fn validate_objects(
        &self,
        old: Option<&TrainJob>,
        new: &TrainJob,
        lookup: &dyn RuntimeLookup,
    ) -> ValidationResult {
        let runtime_ref_path = FieldPath::new("spec").child("runtimeRef");
        let runtime = match resolve_runtime(new, lookup) {
            Ok(runtime) => runtime,
            Err(err) => {
                debug!(error = %err, "runtime reference did not resolve");
                return (
                    Warnings::default(),
                    vec![FieldError::invalid(&runtime_ref_path, err.to_string())],
                );
            }
        };

        let mut warnings = Warnings::default();
        let mut errors = Vec::new();

        if runtime.is_deprecated() {
            warnings.push(format!(
                "{} '{}' is deprecated and will be removed in a future release",
                runtime.kind, runtime.name
            ));
        }
        if let Some(ttl) = runtime.spec.template.spec.ttl_seconds_after_finished {
            if ttl < MIN_TTL_SECONDS_AFTER_FINISHED {
                warnings.push(format!(
                    "{} '{}' sets ttlSecondsAfterFinished to {ttl}s; finished JobSets may be removed before their status is observed",
                    runtime.kind, runtime.name
                ));
            }
        }
        if let Some(policy) = &runtime.spec.ml_policy {
            if let Err(err) = policy.validate() {
                errors.push(FieldError::invalid(&runtime_ref_path, err.to_string()));
                return (warnings, errors);
            }
        }

        let info = match build_info(new, &runtime.spec) {
            Ok(info) => info,
            Err(err) => {
                errors.push(FieldError::invalid(&runtime_ref_path, err.to_string()));
                return (warnings, errors);
            }
        };
        let (plugin_warnings, plugin_errors) = self
            .framework
            .run_custom_validation_plugins(Some(&info), old, new);
        warnings.extend(plugin_warnings);
        errors.extend(plugin_errors);
        (warnings, errors)
    }

    pub fn watched_kinds(&self) -> Vec<WatchedKind> {
        self.framework.watched_kinds()
    }
}
