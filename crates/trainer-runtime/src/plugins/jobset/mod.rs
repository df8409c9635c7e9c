//! JobSet component builder
//!
//! Produces the primary workload object. Once a JobSet is live it is only
//! rewritten while the TrainJob is suspended, or when a suspended JobSet is
//! being resumed.

mod builder;

pub use builder::JobSetBuilder;

use std::sync::Arc;

use tracing::debug;
use trainer_common::crd::{JobSet as JobSetObject, JobSetSpec, TrainJob, JOBSET_API_VERSION, JOBSET_KIND};
use trainer_common::{DATASET_INITIALIZER, MODEL_INITIALIZER};

use super::job_name;
use crate::error::Result;
use crate::framework::{
    BuildContext, Component, ComponentBuilderPlugin, CustomValidationPlugin, Plugin, RuntimeObject,
    WatchExtensionPlugin, WatchedKind,
};
use crate::info::Info;
use crate::validation::{FieldError, FieldPath, ValidationResult, Warnings};

pub const NAME: &str = "JobSet";

pub struct JobSet;

impl JobSet {
    pub fn factory() -> Arc<dyn Plugin> {
        Arc::new(Self)
    }
}

impl Plugin for JobSet {
    fn name(&self) -> &'static str {
        NAME
    }

    fn as_component_builder(&self) -> Option<&dyn ComponentBuilderPlugin> {
        Some(self)
    }

    fn as_custom_validation(&self) -> Option<&dyn CustomValidationPlugin> {
        Some(self)
    }

    fn as_watch_extension(&self) -> Option<&dyn WatchExtensionPlugin> {
        Some(self)
    }
}

impl ComponentBuilderPlugin for JobSet {
    fn build(&self, ctx: &BuildContext<'_>, info: Option<&Info>, job: &TrainJob) -> Result<Vec<RuntimeObject>> {
        let Some(info) = info else { return Ok(Vec::new()) };
        let Some(spec) = info.template_object::<JobSetSpec>() else {
            return Ok(Vec::new());
        };

        let desired = JobSetBuilder::new(job, spec.clone())
            .initializer(job)
            .trainer(info, job)
            .pod_spec_overrides(job)
            .pod_labels(&info.scheduler.pod_labels)
            .suspend(job.spec.suspend)
            .labels(&info.labels)
            .annotations(&info.annotations)
            .build(job);

        let object = gate(desired, ctx.live.jobset.as_ref(), job.is_suspended());
        if object.is_none() {
            debug!(job = %job_name(job), "live JobSet is running, update withheld");
        }
        Ok(object.into_iter().collect())
    }
}

fn differs(desired: &JobSetObject, live: &JobSetObject) -> bool {
    desired.spec != live.spec
        || desired.metadata.labels != live.metadata.labels
        || desired.metadata.annotations != live.metadata.annotations
}

/// Create, resume, or update while suspended; anything else is withheld
pub fn gate(desired: JobSetObject, live: Option<&JobSetObject>, job_suspended: bool) -> Option<RuntimeObject> {
    let Some(live) = live else {
        return Some(RuntimeObject::create(Component::JobSet(Box::new(desired))));
    };
    let resuming = live.is_suspended() && !desired.is_suspended();
    if resuming || (job_suspended && differs(&desired, live)) {
        return Some(RuntimeObject::update(Component::JobSet(Box::new(desired))));
    }
    None
}

impl CustomValidationPlugin for JobSet {
    fn validate(&self, info: Option<&Info>, _old: Option<&TrainJob>, new: &TrainJob) -> ValidationResult {
        let mut errors = Vec::new();
        let (Some(info), Some(initializer)) = (info, new.spec.initializer.as_ref()) else {
            return (Warnings::default(), errors);
        };
        let Some(spec) = info.template_object::<JobSetSpec>() else {
            return (Warnings::default(), errors);
        };
        let path = FieldPath::new("spec").child("runtimeRef");

        let steps = [
            (DATASET_INITIALIZER, initializer.dataset.is_some()),
            (MODEL_INITIALIZER, initializer.model.is_some()),
        ];
        for (step, configured) in steps {
            if !configured {
                continue;
            }
            match spec.replicated_job(step) {
                None => errors.push(FieldError::invalid(
                    &path,
                    format!("must have {step} job when the {step} is configured"),
                )),
                Some(rjob) => {
                    let has_container = rjob
                        .pod_spec()
                        .is_some_and(|pod| pod.containers.iter().any(|c| c.name == step));
                    if !has_container {
                        errors.push(FieldError::invalid(
                            &path,
                            format!("must have container with name - {step} in the {step} job"),
                        ));
                    }
                }
            }
        }
        (Warnings::default(), errors)
    }
}

impl WatchExtensionPlugin for JobSet {
    fn watched_kinds(&self) -> Vec<WatchedKind> {
        vec![WatchedKind::owns(JOBSET_API_VERSION, JOBSET_KIND)]
    }
}
