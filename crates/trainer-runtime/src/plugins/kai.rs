//! KAI scheduler gang scheduling
//!
//! KAI's pod-grouper builds the pod groups itself, so the plugin only routes
//! pods to a queue through a label.

use std::sync::Arc;

use trainer_common::crd::{KAISchedulerPodGroupPolicySource, PodGroupPolicySource, TrainJob};

use crate::error::Result;
use crate::framework::{EnforcePodGroupPolicyPlugin, Plugin};
use crate::info::Info;

pub const NAME: &str = "KAIScheduler";

/// Pod label read by the KAI pod-grouper to pick a scheduling queue
pub const QUEUE_LABEL: &str = "kai.scheduler/queue";

pub struct KaiScheduler;

impl KaiScheduler {
    pub fn factory() -> Arc<dyn Plugin> {
        Arc::new(Self)
    }
}

fn kai_policy(info: &Info) -> Option<&KAISchedulerPodGroupPolicySource> {
    match info.runtime_policy.pod_group_policy.as_ref()?.source()? {
        PodGroupPolicySource::KAIScheduler(k) => Some(k),
        PodGroupPolicySource::Coscheduling(_) | PodGroupPolicySource::Volcano(_) => None,
    }
}

impl Plugin for KaiScheduler {
    fn name(&self) -> &'static str {
        NAME
    }

    fn as_enforce_pod_group_policy(&self) -> Option<&dyn EnforcePodGroupPolicyPlugin> {
        Some(self)
    }
}

impl EnforcePodGroupPolicyPlugin for KaiScheduler {
    fn enforce_pod_group_policy(&self, info: Option<&mut Info>, _job: &TrainJob) -> Result<()> {
        let Some(info) = info else { return Ok(()) };
        let Some(queue) = kai_policy(info)
            .and_then(|k| k.queue.clone())
            .filter(|q| !q.is_empty())
        else {
            return Ok(());
        };
        info.scheduler.pod_labels.insert(QUEUE_LABEL.to_string(), queue);
        Ok(())
    }
}
