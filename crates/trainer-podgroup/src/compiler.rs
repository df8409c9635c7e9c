//! PodGroup compilation from replica groups
//!
//! Every replica of every group is one gang member. The gang's resource floor
//! is the per-pod request of each group multiplied by its replica count.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use trainer_common::crd::{NetworkTopology, TrainJob};
use trainer_common::quantity::{add_resource_lists, scale_resource_list, ResourceList};
use trainer_common::{Result, TRAINER_API_VERSION};

use crate::types::{
    CoschedulingPodGroup, CoschedulingPodGroupSpec, PodGroupMetadata, VolcanoNetworkTopology,
    VolcanoPodGroup, VolcanoPodGroupSpec, COSCHEDULING_API_VERSION, POD_GROUP_KIND,
    VOLCANO_API_VERSION,
};
use crate::{COSCHEDULING_POD_GROUP_LABEL, VOLCANO_GROUP_NAME_LABEL};

/// One replica group contributing to the gang
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GangMember {
    /// Replica group name
    pub name: String,
    /// Replicas of the group; `None` counts as one
    pub replicas: Option<i32>,
    /// Requests of a single pod of the group
    pub pod_requests: ResourceList,
}

/// Aggregate gang requirements
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GangSize {
    /// Pods that must be schedulable together
    pub min_member: i32,
    /// Summed resource floor
    pub min_resources: ResourceList,
}

/// Volcano-specific inputs
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VolcanoOptions {
    pub queue: Option<String>,
    pub priority_class_name: Option<String>,
    pub network_topology: Option<NetworkTopology>,
}

/// Size a gang from its replica groups
pub fn gang_size(members: &[GangMember]) -> Result<GangSize> {
    let mut size = GangSize::default();
    for member in members {
        let replicas = member.replicas.unwrap_or(1).max(0);
        size.min_member = size.min_member.saturating_add(replicas);
        let scaled = scale_resource_list(&member.pod_requests, replicas)?;
        add_resource_lists(&mut size.min_resources, &scaled)?;
    }
    Ok(size)
}

/// Compile a scheduler-plugins PodGroup for a TrainJob
pub fn compile_coscheduling(
    job: &TrainJob,
    size: &GangSize,
    schedule_timeout_seconds: Option<i32>,
) -> CoschedulingPodGroup {
    CoschedulingPodGroup {
        api_version: COSCHEDULING_API_VERSION.to_string(),
        kind: POD_GROUP_KIND.to_string(),
        metadata: metadata(job, COSCHEDULING_POD_GROUP_LABEL),
        spec: CoschedulingPodGroupSpec {
            min_member: size.min_member,
            min_resources: size.min_resources.clone(),
            schedule_timeout_seconds,
        },
    }
}

/// Compile a Volcano PodGroup for a TrainJob
pub fn compile_volcano(job: &TrainJob, size: &GangSize, options: VolcanoOptions) -> VolcanoPodGroup {
    VolcanoPodGroup {
        api_version: VOLCANO_API_VERSION.to_string(),
        kind: POD_GROUP_KIND.to_string(),
        metadata: metadata(job, VOLCANO_GROUP_NAME_LABEL),
        spec: VolcanoPodGroupSpec {
            min_member: size.min_member,
            min_resources: size.min_resources.clone(),
            queue: options.queue,
            priority_class_name: options.priority_class_name,
            network_topology: options.network_topology.map(|t| VolcanoNetworkTopology {
                mode: t.mode,
                highest_tier_allowed: t.highest_tier_allowed,
            }),
        },
    }
}

fn metadata(job: &TrainJob, gang_label: &str) -> PodGroupMetadata {
    let name = job.metadata.name.as_deref().unwrap_or_default();
    let namespace = job.metadata.namespace.as_deref().unwrap_or("default");
    let uid = job.metadata.uid.as_deref().unwrap_or_default();

    PodGroupMetadata {
        name: name.to_string(),
        namespace: namespace.to_string(),
        labels: BTreeMap::from([(gang_label.to_string(), name.to_string())]),
        annotations: BTreeMap::new(),
        owner_references: vec![OwnerReference {
            api_version: TRAINER_API_VERSION.to_string(),
            kind: "TrainJob".to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use trainer_common::crd::TrainJobSpec;

    fn test_job() -> TrainJob {
        let mut job = TrainJob::new("test-job", TrainJobSpec::default());
        job.metadata.namespace = Some("default".to_string());
        job.metadata.uid = Some("test-uid-123".to_string());
        job
    }

    fn member(name: &str, replicas: Option<i32>, cpu: &str) -> GangMember {
        GangMember {
            name: name.to_string(),
            replicas,
            pod_requests: ResourceList::from([("cpu".to_string(), Quantity(cpu.to_string()))]),
        }
    }

    #[test]
    fn gang_counts_every_replica() {
        let size = gang_size(&[member("init", Some(1), "1"), member("node", Some(10), "1")]).unwrap();
        assert_eq!(size.min_member, 11);
        assert_eq!(size.min_resources["cpu"], Quantity("11".to_string()));
    }

    #[test]
    fn unset_replicas_count_as_one() {
        let size = gang_size(&[member("a", None, "500m"), member("b", Some(2), "250m")]).unwrap();
        assert_eq!(size.min_member, 3);
        assert_eq!(size.min_resources["cpu"], Quantity("1".to_string()));
    }

    #[test]
    fn missing_kinds_sum_as_zero() {
        let mut gpu = member("node", Some(2), "2");
        gpu.pod_requests
            .insert("nvidia.com/gpu".to_string(), Quantity("1".to_string()));
        let size = gang_size(&[member("init", Some(1), "1"), gpu]).unwrap();
        assert_eq!(size.min_resources["cpu"], Quantity("5".to_string()));
        assert_eq!(size.min_resources["nvidia.com/gpu"], Quantity("2".to_string()));
    }

    #[test]
    fn negative_replicas_add_nothing() {
        let size = gang_size(&[member("a", Some(-3), "1"), member("b", Some(2), "1")]).unwrap();
        assert_eq!(size.min_member, 2);
        assert_eq!(size.min_resources["cpu"], Quantity("2".to_string()));
    }

    #[test]
    fn member_count_saturates() {
        let huge = |name: &str| GangMember {
            name: name.to_string(),
            replicas: Some(i32::MAX),
            pod_requests: ResourceList::new(),
        };
        let size = gang_size(&[huge("a"), huge("b")]).unwrap();
        assert_eq!(size.min_member, i32::MAX);
    }

    #[test]
    fn empty_gang() {
        let size = gang_size(&[]).unwrap();
        assert_eq!(size.min_member, 0);
        assert!(size.min_resources.is_empty());
    }

    #[test]
    fn coscheduling_pod_group() {
        let size = gang_size(&[member("node", Some(2), "1")]).unwrap();
        let pg = compile_coscheduling(&test_job(), &size, Some(120));

        assert_eq!(pg.api_version, COSCHEDULING_API_VERSION);
        assert_eq!(pg.kind, "PodGroup");
        assert_eq!(pg.metadata.name, "test-job");
        assert_eq!(pg.metadata.labels[COSCHEDULING_POD_GROUP_LABEL], "test-job");
        assert_eq!(pg.spec.min_member, 2);
        assert_eq!(pg.spec.schedule_timeout_seconds, Some(120));

        let owner = &pg.metadata.owner_references[0];
        assert_eq!(owner.kind, "TrainJob");
        assert_eq!(owner.uid, "test-uid-123");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn volcano_pod_group() {
        let size = gang_size(&[member("node", Some(4), "2")]).unwrap();
        let pg = compile_volcano(
            &test_job(),
            &size,
            VolcanoOptions {
                queue: Some("research".to_string()),
                priority_class_name: Some("high".to_string()),
                network_topology: Some(NetworkTopology {
                    mode: Some("hard".to_string()),
                    highest_tier_allowed: Some(2),
                }),
            },
        );

        assert_eq!(pg.api_version, VOLCANO_API_VERSION);
        assert_eq!(pg.metadata.labels[VOLCANO_GROUP_NAME_LABEL], "test-job");
        assert_eq!(pg.spec.min_member, 4);
        assert_eq!(pg.spec.min_resources["cpu"], Quantity("8".to_string()));
        assert_eq!(pg.spec.queue.as_deref(), Some("research"));
        assert_eq!(pg.spec.priority_class_name.as_deref(), Some("high"));
        assert_eq!(
            pg.spec.network_topology.unwrap().highest_tier_allowed,
            Some(2)
        );
    }
}
