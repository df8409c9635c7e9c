//! Capability-based plugin framework
//!
//! A plugin implements [`Plugin`] and opts into any number of capabilities by
//! overriding the matching `as_*` accessor. The [`Framework`] queries each
//! plugin once and runs every capability in registration order.
//!
//! All plugins share one guard: a missing [`Info`], a missing policy or a
//! policy of another variant is a no-op that returns `Ok`.

mod registry;

pub use registry::{Framework, PluginFactory, Registry};

use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use serde::Serialize;
use trainer_common::crd::{JobSet, TrainJob};
use trainer_podgroup::{CoschedulingPodGroup, VolcanoPodGroup};

use crate::error::Result;
use crate::info::Info;
use crate::validation::ValidationResult;

// =============================================================================
// Plugin traits
// =============================================================================

/// Base trait of every plugin
pub trait Plugin: Send + Sync {
    /// Unique registry name
    fn name(&self) -> &'static str;

    fn as_enforce_ml_policy(&self) -> Option<&dyn EnforceMLPolicyPlugin> {
        None
    }

    fn as_enforce_pod_group_policy(&self) -> Option<&dyn EnforcePodGroupPolicyPlugin> {
        None
    }

    fn as_component_builder(&self) -> Option<&dyn ComponentBuilderPlugin> {
        None
    }

    fn as_custom_validation(&self) -> Option<&dyn CustomValidationPlugin> {
        None
    }

    fn as_watch_extension(&self) -> Option<&dyn WatchExtensionPlugin> {
        None
    }
}

/// Applies an ML policy: pod counts, topology env, ports
pub trait EnforceMLPolicyPlugin: Send + Sync {
    fn enforce_ml_policy(&self, info: Option<&mut Info>, job: &mut TrainJob) -> Result<()>;
}

/// Applies a gang-scheduling policy, typically by stamping pod labels
pub trait EnforcePodGroupPolicyPlugin: Send + Sync {
    fn enforce_pod_group_policy(&self, info: Option<&mut Info>, job: &TrainJob) -> Result<()>;
}

/// Produces zero or more objects, or withholds them under the update gate
pub trait ComponentBuilderPlugin: Send + Sync {
    fn build(&self, ctx: &BuildContext<'_>, info: Option<&Info>, job: &TrainJob) -> Result<Vec<RuntimeObject>>;
}

/// Admission checks on create and update
pub trait CustomValidationPlugin: Send + Sync {
    fn validate(&self, info: Option<&Info>, old: Option<&TrainJob>, new: &TrainJob) -> ValidationResult;
}

/// Declares the object kinds a plugin needs the controller to watch
pub trait WatchExtensionPlugin: Send + Sync {
    fn watched_kinds(&self) -> Vec<WatchedKind>;
}

// =============================================================================
// Watches
// =============================================================================

/// How the controller relates to a watched kind
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchRelation {
    /// Objects are owned by the TrainJob; changes requeue the owner
    Owns,
    /// Changes requeue jobs selected by a plugin-specific mapping
    Watches,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchedKind {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub relation: WatchRelation,
}

impl WatchedKind {
    pub const fn owns(api_version: &'static str, kind: &'static str) -> Self {
        Self {
            api_version,
            kind,
            relation: WatchRelation::Owns,
        }
    }

    pub const fn watches(api_version: &'static str, kind: &'static str) -> Self {
        Self {
            api_version,
            kind,
            relation: WatchRelation::Watches,
        }
    }
}

// =============================================================================
// Build inputs and outputs
// =============================================================================

/// Live objects fetched by the caller before a build
#[derive(Clone, Debug, Default)]
pub struct LiveObjects {
    pub jobset: Option<JobSet>,
    pub coscheduling_pod_group: Option<CoschedulingPodGroup>,
    pub volcano_pod_group: Option<VolcanoPodGroup>,
    pub hpa: Option<HorizontalPodAutoscaler>,
    pub mpi_ssh_secret: Option<Secret>,
    pub mpi_hostfile: Option<ConfigMap>,
    pub flux_entrypoint: Option<ConfigMap>,
    pub flux_curve: Option<Secret>,
}

/// Read-only context passed to component builders
#[derive(Clone, Copy, Debug)]
pub struct BuildContext<'a> {
    pub live: &'a LiveObjects,
}

/// What the caller should do with a produced object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectAction {
    Create,
    Update,
}

/// Concrete object produced by a builder
#[derive(Clone, Debug, PartialEq)]
pub enum Component {
    JobSet(Box<JobSet>),
    CoschedulingPodGroup(CoschedulingPodGroup),
    VolcanoPodGroup(VolcanoPodGroup),
    HorizontalPodAutoscaler(Box<HorizontalPodAutoscaler>),
    Secret(Secret),
    ConfigMap(ConfigMap),
}

impl Component {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JobSet(_) => "JobSet",
            Self::CoschedulingPodGroup(_) | Self::VolcanoPodGroup(_) => "PodGroup",
            Self::HorizontalPodAutoscaler(_) => "HorizontalPodAutoscaler",
            Self::Secret(_) => "Secret",
            Self::ConfigMap(_) => "ConfigMap",
        }
    }

    pub fn api_version(&self) -> &'static str {
        match self {
            Self::JobSet(_) => trainer_common::crd::JOBSET_API_VERSION,
            Self::CoschedulingPodGroup(_) => trainer_podgroup::COSCHEDULING_API_VERSION,
            Self::VolcanoPodGroup(_) => trainer_podgroup::VOLCANO_API_VERSION,
            Self::HorizontalPodAutoscaler(_) => "autoscaling/v2",
            Self::Secret(_) | Self::ConfigMap(_) => "v1",
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::JobSet(js) => js.metadata.name.as_deref().unwrap_or_default(),
            Self::CoschedulingPodGroup(pg) => &pg.metadata.name,
            Self::VolcanoPodGroup(pg) => &pg.metadata.name,
            Self::HorizontalPodAutoscaler(hpa) => hpa.metadata.name.as_deref().unwrap_or_default(),
            Self::Secret(s) => s.metadata.name.as_deref().unwrap_or_default(),
            Self::ConfigMap(cm) => cm.metadata.name.as_deref().unwrap_or_default(),
        }
    }

    /// Serialized form suitable for server-side apply
    pub fn to_json(&self) -> Result<serde_json::Value> {
        fn value<T: Serialize>(obj: &T) -> Result<serde_json::Value> {
            Ok(serde_json::to_value(obj)?)
        }
        match self {
            Self::JobSet(js) => value(js.as_ref()),
            Self::CoschedulingPodGroup(pg) => value(pg),
            Self::VolcanoPodGroup(pg) => value(pg),
            Self::HorizontalPodAutoscaler(hpa) => value(hpa.as_ref()),
            Self::Secret(s) => value(s),
            Self::ConfigMap(cm) => value(cm),
        }
    }
}

/// A produced object and the action the update gate chose for it
#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeObject {
    pub action: ObjectAction,
    pub object: Component,
}

impl RuntimeObject {
    pub fn create(object: Component) -> Self {
        Self {
            action: ObjectAction::Create,
            object,
        }
    }

    pub fn update(object: Component) -> Self {
        Self {
            action: ObjectAction::Update,
            object,
        }
    }

    /// `Create` when nothing is live, `Update` otherwise
    pub fn for_live<T>(live: Option<&T>, object: Component) -> Self {
        match live {
            None => Self::create(object),
            Some(_) => Self::update(object),
        }
    }
}
