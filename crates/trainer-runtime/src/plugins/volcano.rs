//! Volcano gang scheduling

use std::sync::Arc;

use trainer_common::crd::{JobSetSpec, PodGroupPolicySource, TrainJob, VolcanoPodGroupPolicySource};
use trainer_podgroup::{
    compile_volcano, gang_size, VolcanoOptions, VolcanoPodGroup, POD_GROUP_KIND, VOLCANO_API_VERSION,
    VOLCANO_GROUP_NAME_LABEL, VOLCANO_QUEUE_ANNOTATION,
};

use super::coscheduling::gang_members;
use super::job_name;
use crate::error::Result;
use crate::framework::{
    BuildContext, Component, ComponentBuilderPlugin, EnforcePodGroupPolicyPlugin, Plugin, RuntimeObject,
    WatchExtensionPlugin, WatchedKind,
};
use crate::info::Info;

pub const NAME: &str = "Volcano";

pub struct Volcano;

impl Volcano {
    pub fn factory() -> Arc<dyn Plugin> {
        Arc::new(Self)
    }
}

fn volcano_policy(info: &Info) -> Option<&VolcanoPodGroupPolicySource> {
    match info.runtime_policy.pod_group_policy.as_ref()?.source()? {
        PodGroupPolicySource::Volcano(v) => Some(v),
        PodGroupPolicySource::Coscheduling(_) | PodGroupPolicySource::KAIScheduler(_) => None,
    }
}

/// Priority class of the last replicated job that sets one
fn priority_class_name(info: &Info) -> Option<String> {
    info.template_object::<JobSetSpec>()?
        .replicated_jobs
        .iter()
        .filter_map(|rjob| rjob.pod_spec()?.priority_class_name.clone())
        .last()
}

impl Plugin for Volcano {
    fn name(&self) -> &'static str {
        NAME
    }

    fn as_enforce_pod_group_policy(&self) -> Option<&dyn EnforcePodGroupPolicyPlugin> {
        Some(self)
    }

    fn as_component_builder(&self) -> Option<&dyn ComponentBuilderPlugin> {
        Some(self)
    }

    fn as_watch_extension(&self) -> Option<&dyn WatchExtensionPlugin> {
        Some(self)
    }
}

impl EnforcePodGroupPolicyPlugin for Volcano {
    fn enforce_pod_group_policy(&self, info: Option<&mut Info>, job: &TrainJob) -> Result<()> {
        let Some(info) = info else { return Ok(()) };
        if volcano_policy(info).is_none() {
            return Ok(());
        }
        info.scheduler
            .pod_labels
            .insert(VOLCANO_GROUP_NAME_LABEL.to_string(), job_name(job).to_string());
        Ok(())
    }
}

impl ComponentBuilderPlugin for Volcano {
    fn build(&self, ctx: &BuildContext<'_>, info: Option<&Info>, job: &TrainJob) -> Result<Vec<RuntimeObject>> {
        let Some(info) = info else { return Ok(Vec::new()) };
        let Some(policy) = volcano_policy(info) else {
            return Ok(Vec::new());
        };
        let size = gang_size(&gang_members(info))?;
        let options = VolcanoOptions {
            queue: info.annotations.get(VOLCANO_QUEUE_ANNOTATION).cloned(),
            priority_class_name: priority_class_name(info),
            network_topology: policy.network_topology.clone(),
        };
        let desired = compile_volcano(job, &size, options);
        Ok(gate(desired, ctx.live.volcano_pod_group.as_ref(), job.is_suspended())
            .into_iter()
            .collect())
    }
}

fn gate(desired: VolcanoPodGroup, live: Option<&VolcanoPodGroup>, suspended: bool) -> Option<RuntimeObject> {
    match live {
        None => Some(RuntimeObject::create(Component::VolcanoPodGroup(desired))),
        Some(live) if suspended && desired.differs_from(live) => {
            Some(RuntimeObject::update(Component::VolcanoPodGroup(desired)))
        }
        Some(_) => None,
    }
}

impl WatchExtensionPlugin for Volcano {
    fn watched_kinds(&self) -> Vec<WatchedKind> {
        vec![WatchedKind::owns(VOLCANO_API_VERSION, POD_GROUP_KIND)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::{LiveObjects, ObjectAction};
    use crate::testing::{info_for, runtime_from_yaml, train_job};
    use std::collections::BTreeMap;
    use trainer_common::crd::Trainer;

    const VOLCANO_RUNTIME: &str = r#"
mlPolicy:
  numNodes: 2
podGroupPolicy:
  volcano:
    networkTopology:
      mode: hard
      highestTierAllowed: 1
template:
  metadata:
    annotations:
      scheduling.volcano.sh/queue-name: research
  spec:
    replicatedJobs:
      - name: launcher
        template:
          spec:
            template:
              spec:
                priorityClassName: low
                containers:
                  - name: launcher
                    resources:
                      requests:
                        memory: 1Gi
      - name: node
        template:
          metadata:
            labels:
              trainer.kubeflow.org/trainjob-ancestor-step: trainer
          spec:
            template:
              spec:
                priorityClassName: high
                containers:
                  - name: node
                    resources:
                      requests:
                        memory: 2Gi
"#;

    fn build(info: &Info, job: &TrainJob, live: &LiveObjects) -> Vec<RuntimeObject> {
        Volcano.build(&BuildContext { live }, Some(info), job).unwrap()
    }

    fn pod_group(objects: &[RuntimeObject]) -> &VolcanoPodGroup {
        match &objects[0].object {
            Component::VolcanoPodGroup(pg) => pg,
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[test]
    fn compiles_queue_priority_and_topology() {
        let mut info = info_for(&runtime_from_yaml(VOLCANO_RUNTIME));
        let job = train_job(Trainer::default());
        Volcano.enforce_pod_group_policy(Some(&mut info), &job).unwrap();
        assert_eq!(info.scheduler.pod_labels[VOLCANO_GROUP_NAME_LABEL], "job");

        let objects = build(&info, &job, &LiveObjects::default());
        assert_eq!(objects[0].action, ObjectAction::Create);
        let pg = pod_group(&objects);
        assert_eq!(pg.spec.min_member, 3);
        assert_eq!(pg.spec.queue.as_deref(), Some("research"));
        assert_eq!(pg.spec.priority_class_name.as_deref(), Some("high"));
        let topology = pg.spec.network_topology.as_ref().unwrap();
        assert_eq!(topology.mode.as_deref(), Some("hard"));
        assert_eq!(topology.highest_tier_allowed, Some(1));
    }

    #[test]
    fn job_annotation_overrides_queue() {
        let runtime = runtime_from_yaml(VOLCANO_RUNTIME);
        let mut job = train_job(Trainer::default());
        job.spec.annotations = Some(BTreeMap::from([(
            VOLCANO_QUEUE_ANNOTATION.to_string(),
            "prod".to_string(),
        )]));
        let info = crate::core::build_info(&job, &runtime).unwrap();
        let objects = build(&info, &job, &LiveObjects::default());
        assert_eq!(pod_group(&objects).spec.queue.as_deref(), Some("prod"));
    }

    #[test]
    fn running_job_keeps_live_group() {
        let info = info_for(&runtime_from_yaml(VOLCANO_RUNTIME));
        let mut job = train_job(Trainer::default());
        let mut live = pod_group(&build(&info, &job, &LiveObjects::default())).clone();
        live.spec.queue = None;
        let live = LiveObjects {
            volcano_pod_group: Some(live),
            ..Default::default()
        };
        assert!(build(&info, &job, &live).is_empty());

        job.spec.suspend = Some(true);
        assert_eq!(build(&info, &job, &live)[0].action, ObjectAction::Update);
    }

    #[test]
    fn coscheduling_policy_is_ignored() {
        let yaml = VOLCANO_RUNTIME.replace(
            "  volcano:\n    networkTopology:\n      mode: hard\n      highestTierAllowed: 1\n",
            "  coscheduling: {}\n",
        );
        let mut info = info_for(&runtime_from_yaml(&yaml));
        let job = train_job(Trainer::default());
        Volcano.enforce_pod_group_policy(Some(&mut info), &job).unwrap();
        assert!(info.scheduler.pod_labels.is_empty());
        assert!(build(&info, &job, &LiveObjects::default()).is_empty());
    }
}
