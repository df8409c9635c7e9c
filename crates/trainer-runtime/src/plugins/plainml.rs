//! Plain ML policy: no framework wiring beyond node count and user env

use std::sync::Arc;

use trainer_common::crd::{MLPolicySource, TrainJob};

use super::{job_num_nodes, ml_policy_source};
use crate::apply;
use crate::error::Result;
use crate::framework::{EnforceMLPolicyPlugin, Plugin};
use crate::info::Info;

pub const NAME: &str = "PlainML";

pub struct PlainML;

impl PlainML {
    pub fn factory() -> Arc<dyn Plugin> {
        Arc::new(Self)
    }
}

impl Plugin for PlainML {
    fn name(&self) -> &'static str {
        NAME
    }

    fn as_enforce_ml_policy(&self) -> Option<&dyn EnforceMLPolicyPlugin> {
        Some(self)
    }
}

impl EnforceMLPolicyPlugin for PlainML {
    fn enforce_ml_policy(&self, info: Option<&mut Info>, job: &mut TrainJob) -> Result<()> {
        let Some(info) = info else { return Ok(()) };
        if ml_policy_source(info) != Some(MLPolicySource::PlainML) {
            return Ok(());
        }

        if let Some(trainer) = info.find_pod_set_by_ancestor_mut(trainer_common::ANCESTOR_TRAINER) {
            if let Some(n) = job_num_nodes(job) {
                trainer.count = Some(n);
            }
        }
        if let Some(container) = info.trainer_container_mut() {
            apply::upsert_env_vars(&mut container.env, job.trainer_env().iter().cloned());
        }
        info.sync_pod_sets_to_template_spec();
        Ok(())
    }
}
