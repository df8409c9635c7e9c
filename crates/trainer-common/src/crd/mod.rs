//! Custom resource definitions and the JobSet types they embed

mod jobset;
mod train_job;
mod training_runtime;

pub use jobset::{
    DependsOn, FailurePolicy, JobSet, JobSetSpec, JobSetStatus, Network, ReplicatedJob,
    StartupPolicy, SuccessPolicy, JOBSET_API_VERSION, JOBSET_KIND,
};
pub use train_job::{
    ContainerOverride, Initializer, InitializerSource, NumProcPerNode, PodSpecOverride,
    PodSpecOverrideTargetJob, RuntimeKind, RuntimeRef, TrainJob, TrainJobConditionType,
    TrainJobSpec, TrainJobStatus, Trainer, TRAINJOB_CONTROLLER_MANAGER,
};
pub use training_runtime::{
    ClusterTrainingRuntime, ClusterTrainingRuntimeSpec, CoschedulingPodGroupPolicySource,
    FluxMLPolicySource, JAXMLPolicySource, JobSetTemplateSpec, KAISchedulerPodGroupPolicySource, MLPolicy,
    MLPolicySource, MPIImplementation, MPIMLPolicySource, NetworkTopology, PodGroupPolicy,
    PodGroupPolicySource, TemplateMetadata, TorchElasticPolicy, TorchMLPolicySource, TrainingRuntime,
    TrainingRuntimeSpec, VolcanoPodGroupPolicySource, XGBoostMLPolicySource,
};
