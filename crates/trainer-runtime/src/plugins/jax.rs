//! JAX distributed policy

use std::sync::Arc;

use trainer_common::crd::{MLPolicySource, TrainJob};
use trainer_common::{ANCESTOR_TRAINER, CONTAINER_TRAINER_PORT, JOB_COMPLETION_INDEX_FIELD_PATH};

use super::{first_trainer_host, job_num_nodes, ml_policy_source};
use crate::apply::{self, env, env_from_field};
use crate::error::{Result, RuntimeError};
use crate::framework::{EnforceMLPolicyPlugin, Plugin};
use crate::info::Info;

pub const NAME: &str = "JAX";

pub const ENV_NUM_PROCESSES: &str = "JAX_NUM_PROCESSES";
pub const ENV_PROCESS_ID: &str = "JAX_PROCESS_ID";
pub const ENV_COORDINATOR_ADDRESS: &str = "JAX_COORDINATOR_ADDRESS";
pub const ENV_COORDINATOR_PORT: &str = "JAX_COORDINATOR_PORT";

pub struct Jax;

impl Jax {
    pub fn factory() -> Arc<dyn Plugin> {
        Arc::new(Self)
    }
}

impl Plugin for Jax {
    fn name(&self) -> &'static str {
        NAME
    }

    fn as_enforce_ml_policy(&self) -> Option<&dyn EnforceMLPolicyPlugin> {
        Some(self)
    }
}

impl EnforceMLPolicyPlugin for Jax {
    fn enforce_ml_policy(&self, info: Option<&mut Info>, job: &mut TrainJob) -> Result<()> {
        let Some(info) = info else { return Ok(()) };
        if !matches!(ml_policy_source(info), Some(MLPolicySource::Jax(_))) {
            return Ok(());
        }
        let coordinator = first_trainer_host(info, job);

        let num_processes = match info.find_pod_set_by_ancestor_mut(ANCESTOR_TRAINER) {
            Some(ps) => {
                if let Some(n) = job_num_nodes(job) {
                    ps.count = Some(n);
                }
                ps.count.unwrap_or(1)
            }
            None => 1,
        };

        let container = info
            .trainer_container_mut()
            .ok_or(RuntimeError::MissingTrainerContainer { plugin: NAME })?;
        apply::upsert_env_vars(
            &mut container.env,
            [
                env(ENV_NUM_PROCESSES, num_processes.to_string()),
                env_from_field(ENV_PROCESS_ID, JOB_COMPLETION_INDEX_FIELD_PATH),
                env(
                    ENV_COORDINATOR_ADDRESS,
                    format!("{coordinator}:{CONTAINER_TRAINER_PORT}"),
                ),
                env(ENV_COORDINATOR_PORT, CONTAINER_TRAINER_PORT.to_string()),
            ],
        );
        apply::upsert_port(&mut container.ports, apply::container_port(CONTAINER_TRAINER_PORT));

        info.sync_pod_sets_to_template_spec();
        Ok(())
    }
}
