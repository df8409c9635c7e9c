//! TrainJob status conditions
//!
//! Pure functions computing the next status from the job, the outcome of the
//! build and the live JobSet. Transition times only move when a condition
//! flips, so an unchanged job produces an identical status.

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use trainer_common::crd::{JobSet, TrainJob, TrainJobConditionType, TrainJobStatus};
use trainer_runtime::RuntimeError;

pub const REASON_CREATED: &str = "JobsCreationSucceeded";
pub const REASON_RUNTIME_NOT_FOUND: &str = "RuntimeNotFound";
pub const REASON_BUILD_FAILED: &str = "BuildFailed";
pub const REASON_SUSPENDED: &str = "Suspended";
pub const REASON_RESUMED: &str = "Resumed";

const MESSAGE_CREATED: &str = "Succeeded to create Jobs";
const MESSAGE_SUSPENDED: &str = "TrainJob is suspended";
const MESSAGE_RESUMED: &str = "TrainJob is resumed";

/// JobSet condition types mirrored onto the TrainJob
const JOBSET_TERMINAL: [(&str, TrainJobConditionType); 2] = [
    ("Completed", TrainJobConditionType::Complete),
    ("Failed", TrainJobConditionType::Failed),
];

/// Insert or update a condition, keeping its transition time unless the status flips
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    kind: TrainJobConditionType,
    status: bool,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) {
    let kind = kind.to_string();
    let status = if status { "True" } else { "False" };
    match conditions.iter_mut().find(|c| c.type_ == kind) {
        Some(existing) => {
            if existing.status != status {
                existing.last_transition_time = Time(Utc::now());
            }
            existing.status = status.to_string();
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = observed_generation;
        }
        None => conditions.push(Condition {
            type_: kind,
            status: status.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: Time(Utc::now()),
            observed_generation,
        }),
    }
}

/// Status after one reconcile pass
pub fn next_status(job: &TrainJob, build: Result<(), &RuntimeError>, jobset: Option<&JobSet>) -> TrainJobStatus {
    let mut status = job.status.clone().unwrap_or_default();
    let generation = job.metadata.generation;
    let conditions = &mut status.conditions;

    if job.is_suspended() {
        set_condition(
            conditions,
            TrainJobConditionType::Suspended,
            true,
            REASON_SUSPENDED,
            MESSAGE_SUSPENDED,
            generation,
        );
    } else if status_is(conditions, TrainJobConditionType::Suspended, "True") {
        set_condition(
            conditions,
            TrainJobConditionType::Suspended,
            false,
            REASON_RESUMED,
            MESSAGE_RESUMED,
            generation,
        );
    }

    match build {
        Ok(()) => set_condition(
            conditions,
            TrainJobConditionType::Created,
            true,
            REASON_CREATED,
            MESSAGE_CREATED,
            generation,
        ),
        Err(error) => {
            let reason = if error.is_runtime_not_found() {
                REASON_RUNTIME_NOT_FOUND
            } else {
                REASON_BUILD_FAILED
            };
            set_condition(
                conditions,
                TrainJobConditionType::Created,
                false,
                reason,
                &error.to_string(),
                generation,
            );
        }
    }

    let jobset_conditions = jobset
        .and_then(|js| js.status.as_ref())
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();
    for (jobset_type, kind) in JOBSET_TERMINAL {
        if let Some(c) = jobset_conditions
            .iter()
            .find(|c| c.type_ == jobset_type && c.status == "True")
        {
            set_condition(conditions, kind, true, &c.reason, &c.message, generation);
        }
    }

    status
}

fn status_is(conditions: &[Condition], kind: TrainJobConditionType, value: &str) -> bool {
    let kind = kind.to_string();
    conditions.iter().any(|c| c.type_ == kind && c.status == value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use trainer_common::crd::{JobSetSpec, JobSetStatus, RuntimeKind, TrainJobSpec};

    fn job(suspend: Option<bool>) -> TrainJob {
        let mut job = TrainJob::new(
            "job",
            TrainJobSpec {
                suspend,
                ..Default::default()
            },
        );
        job.metadata.generation = Some(3);
        job
    }

    fn find(status: &TrainJobStatus, kind: TrainJobConditionType) -> &Condition {
        status.condition(kind).expect("condition present")
    }

    #[test]
    fn successful_build_marks_created() {
        let status = next_status(&job(None), Ok(()), None);
        let created = find(&status, TrainJobConditionType::Created);
        assert_eq!(created.status, "True");
        assert_eq!(created.reason, REASON_CREATED);
        assert_eq!(created.observed_generation, Some(3));
        assert!(status.condition(TrainJobConditionType::Suspended).is_none());
    }

    #[test]
    fn missing_runtime_is_reported() {
        let error = RuntimeError::RuntimeNotFound {
            kind: RuntimeKind::ClusterTrainingRuntime,
            namespace: None,
            name: "torch".to_string(),
        };
        let status = next_status(&job(None), Err(&error), None);
        let created = find(&status, TrainJobConditionType::Created);
        assert_eq!(created.status, "False");
        assert_eq!(created.reason, REASON_RUNTIME_NOT_FOUND);
        assert!(created.message.contains("torch"));

        let error = RuntimeError::DuplicatePlugin("Torch".to_string());
        let status = next_status(&job(None), Err(&error), None);
        assert_eq!(find(&status, TrainJobConditionType::Created).reason, REASON_BUILD_FAILED);
    }

    #[test]
    fn suspend_then_resume() {
        let mut suspended = job(Some(true));
        let status = next_status(&suspended, Ok(()), None);
        assert_eq!(find(&status, TrainJobConditionType::Suspended).status, "True");

        suspended.status = Some(status);
        suspended.spec.suspend = Some(false);
        let status = next_status(&suspended, Ok(()), None);
        let cond = find(&status, TrainJobConditionType::Suspended);
        assert_eq!((cond.status.as_str(), cond.reason.as_str()), ("False", REASON_RESUMED));
    }

    #[test]
    fn jobset_terminal_conditions_are_mirrored() {
        let mut js = JobSet::new("job", "default", JobSetSpec::default());
        js.status = Some(JobSetStatus {
            conditions: vec![
                Condition {
                    type_: "Completed".to_string(),
                    status: "True".to_string(),
                    reason: "AllJobsCompleted".to_string(),
                    message: "jobset completed successfully".to_string(),
                    last_transition_time: Time(Utc::now()),
                    observed_generation: None,
                },
                Condition {
                    type_: "Failed".to_string(),
                    status: "False".to_string(),
                    reason: String::new(),
                    message: String::new(),
                    last_transition_time: Time(Utc::now()),
                    observed_generation: None,
                },
            ],
            restarts: None,
        });
        let status = next_status(&job(None), Ok(()), Some(&js));
        let complete = find(&status, TrainJobConditionType::Complete);
        assert_eq!(complete.reason, "AllJobsCompleted");
        assert!(status.condition(TrainJobConditionType::Failed).is_none());
        assert!(status.is_finished());
    }

    #[test]
    fn unchanged_pass_is_stable() {
        let mut job = job(None);
        job.status = Some(next_status(&job, Ok(()), None));
        let again = next_status(&job, Ok(()), None);
        assert_eq!(Some(&again), job.status.as_ref());
    }
}
