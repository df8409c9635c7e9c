//! PodGroup serialization types
//!
//! Typed representations of the scheduler-plugins `scheduling.x-k8s.io/v1alpha1`
//! and Volcano `scheduling.volcano.sh/v1beta1` PodGroup resources. Unknown
//! fields of live objects (status, resourceVersion) are ignored on read.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::{Deserialize, Serialize};
use trainer_common::quantity::ResourceList;

/// `apiVersion` of scheduler-plugins PodGroups
pub const COSCHEDULING_API_VERSION: &str = "scheduling.x-k8s.io/v1alpha1";

/// `apiVersion` of Volcano PodGroups
pub const VOLCANO_API_VERSION: &str = "scheduling.volcano.sh/v1beta1";

/// Kind shared by both PodGroup flavours
pub const POD_GROUP_KIND: &str = "PodGroup";

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodGroupMetadata {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
}

impl PodGroupMetadata {
    fn same_content(&self, other: &Self) -> bool {
        self.labels == other.labels && self.annotations == other.annotations
    }
}

/// scheduler-plugins PodGroup (`scheduling.x-k8s.io/v1alpha1` Kind: PodGroup)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CoschedulingPodGroup {
    pub api_version: String,
    pub kind: String,
    pub metadata: PodGroupMetadata,
    pub spec: CoschedulingPodGroupSpec,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CoschedulingPodGroupSpec {
    pub min_member: i32,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub min_resources: ResourceList,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_timeout_seconds: Option<i32>,
}

impl CoschedulingPodGroup {
    /// Whether spec, labels or annotations differ from a live object
    pub fn differs_from(&self, live: &Self) -> bool {
        self.spec != live.spec || !self.metadata.same_content(&live.metadata)
    }
}

/// Volcano PodGroup (`scheduling.volcano.sh/v1beta1` Kind: PodGroup)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolcanoPodGroup {
    pub api_version: String,
    pub kind: String,
    pub metadata: PodGroupMetadata,
    pub spec: VolcanoPodGroupSpec,
}

/// Volcano PodGroup spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolcanoPodGroupSpec {
    pub min_member: i32,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub min_resources: ResourceList,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_topology: Option<VolcanoNetworkTopology>,
}

/// Hyper-node topology constraint
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolcanoNetworkTopology {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highest_tier_allowed: Option<i32>,
}

impl VolcanoPodGroup {
    /// Whether spec, labels or annotations differ from a live object
    pub fn differs_from(&self, live: &Self) -> bool {
        self.spec != live.spec || !self.metadata.same_content(&live.metadata)
    }
}
