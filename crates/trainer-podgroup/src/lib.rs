//! Gang-scheduling PodGroup compiler for TrainJobs
//!
//! Sizes and compiles scheduler-plugins and Volcano `PodGroup` resources from
//! the replica groups of a job. Pure compilation crate, no controller logic.

mod compiler;
mod types;

pub use compiler::{
    compile_coscheduling, compile_volcano, gang_size, GangMember, GangSize, VolcanoOptions,
};
pub use types::{
    CoschedulingPodGroup, CoschedulingPodGroupSpec, PodGroupMetadata, VolcanoNetworkTopology,
    VolcanoPodGroup, VolcanoPodGroupSpec, COSCHEDULING_API_VERSION, POD_GROUP_KIND,
    VOLCANO_API_VERSION,
};

/// Pod label joining pods to a scheduler-plugins PodGroup
pub const COSCHEDULING_POD_GROUP_LABEL: &str = "scheduling.x-k8s.io/pod-group";

/// Pod label joining pods to a Volcano PodGroup
pub const VOLCANO_GROUP_NAME_LABEL: &str = "scheduling.k8s.io/group-name";

/// Annotation selecting the Volcano queue of a job
pub const VOLCANO_QUEUE_ANNOTATION: &str = "scheduling.volcano.sh/queue-name";
