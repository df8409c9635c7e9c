//! XGBoost distributed training over the DMLC Rabit tracker
//!
//! The first trainer pod hosts the tracker; every pod learns its address, its
//! task id from the completion index and the total worker count. On GPU nodes
//! each GPU runs one worker.

use std::sync::Arc;

use trainer_common::crd::{MLPolicySource, TrainJob};
use trainer_common::{ANCESTOR_TRAINER, CONTAINER_TRAINER_PORT, JOB_COMPLETION_INDEX_FIELD_PATH};

use super::{first_trainer_host, job_num_nodes, ml_policy_source};
use crate::apply::{self, env, env_from_field};
use crate::error::{Result, RuntimeError};
use crate::framework::{CustomValidationPlugin, EnforceMLPolicyPlugin, Plugin};
use crate::info::Info;
use crate::resources::{gpu_per_node, resources_per_node};
use crate::validation::{FieldError, FieldPath, ValidationResult, Warnings};

pub const NAME: &str = "XGBoost";

pub const ENV_TRACKER_URI: &str = "DMLC_TRACKER_URI";
pub const ENV_TRACKER_PORT: &str = "DMLC_TRACKER_PORT";
pub const ENV_TASK_ID: &str = "DMLC_TASK_ID";
pub const ENV_NUM_WORKER: &str = "DMLC_NUM_WORKER";

const RESERVED_ENV_NAMES: [&str; 4] = [ENV_TRACKER_URI, ENV_TRACKER_PORT, ENV_TASK_ID, ENV_NUM_WORKER];

pub struct XGBoost;

impl XGBoost {
    pub fn factory() -> Arc<dyn Plugin> {
        Arc::new(Self)
    }
}

fn is_xgboost(info: &Info) -> bool {
    matches!(ml_policy_source(info), Some(MLPolicySource::XGBoost(_)))
}

impl Plugin for XGBoost {
    fn name(&self) -> &'static str {
        NAME
    }

    fn as_enforce_ml_policy(&self) -> Option<&dyn EnforceMLPolicyPlugin> {
        Some(self)
    }

    fn as_custom_validation(&self) -> Option<&dyn CustomValidationPlugin> {
        Some(self)
    }
}

impl EnforceMLPolicyPlugin for XGBoost {
    fn enforce_ml_policy(&self, info: Option<&mut Info>, job: &mut TrainJob) -> Result<()> {
        let Some(info) = info else { return Ok(()) };
        if !is_xgboost(info) {
            return Ok(());
        }

        let num_nodes = match info.find_pod_set_by_ancestor_mut(ANCESTOR_TRAINER) {
            Some(ps) => {
                if let Some(n) = job_num_nodes(job) {
                    ps.count = Some(n);
                }
                ps.count.unwrap_or(1)
            }
            None => 1,
        };
        let workers_per_node = gpu_per_node(resources_per_node(info, job))?.max(1);
        let num_workers = i64::from(num_nodes).saturating_mul(workers_per_node);
        let tracker = first_trainer_host(info, job);

        let container = info
            .trainer_container_mut()
            .ok_or(RuntimeError::MissingTrainerContainer { plugin: NAME })?;
        apply::upsert_env_vars(
            &mut container.env,
            [
                env(ENV_TRACKER_URI, tracker),
                env(ENV_TRACKER_PORT, CONTAINER_TRAINER_PORT.to_string()),
                env_from_field(ENV_TASK_ID, JOB_COMPLETION_INDEX_FIELD_PATH),
                env(ENV_NUM_WORKER, num_workers.to_string()),
            ],
        );
        apply::upsert_port(&mut container.ports, apply::container_port(CONTAINER_TRAINER_PORT));

        info.sync_pod_sets_to_template_spec();
        Ok(())
    }
}

impl CustomValidationPlugin for XGBoost {
    fn validate(&self, info: Option<&Info>, _old: Option<&TrainJob>, new: &TrainJob) -> ValidationResult {
        let mut errors = Vec::new();
        if !info.is_some_and(is_xgboost) {
            return (Warnings::default(), errors);
        }
        let env_path = FieldPath::new("spec").child("trainer").child("env");
        for (i, var) in new.trainer_env().iter().enumerate() {
            if RESERVED_ENV_NAMES.contains(&var.name.as_str()) {
                errors.push(FieldError::forbidden(
                    env_path.index(i),
                    format!("{} is reserved for the XGBoost runtime", var.name),
                ));
            }
        }
        (Warnings::default(), errors)
    }
}
