//! TrainJob controller implementation
//!
//! Each pass fetches the referenced runtime and the live objects, runs the
//! composition engine, applies what it produced with server-side apply and
//! records the outcome as status conditions.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::{Client, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use trainer_common::crd::{
    ClusterTrainingRuntime, JobSet, RuntimeKind, TrainJob, TrainJobStatus, TrainingRuntime, JOBSET_API_VERSION,
    JOBSET_KIND,
};
use trainer_podgroup::{COSCHEDULING_API_VERSION, POD_GROUP_KIND, VOLCANO_API_VERSION};
use trainer_runtime::plugins::coscheduling::JobKey;
use trainer_runtime::plugins::flux::{curve_secret_name, entrypoint_config_map_name};
use trainer_runtime::plugins::mpi::{hostfile_name, ssh_auth_secret_name};
use trainer_runtime::{Component, LiveObjects, RuntimeEngine, RuntimeStore};

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::status::next_status;

/// Kubernetes operations needed by the reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TrainJobClient: Send + Sync {
    /// Get a namespaced runtime, `None` when it does not exist
    async fn get_training_runtime(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<TrainingRuntime>, ControllerError>;

    /// Get a cluster-scoped runtime, `None` when it does not exist
    async fn get_cluster_training_runtime(&self, name: &str)
        -> Result<Option<ClusterTrainingRuntime>, ControllerError>;

    /// Fetch every object a previous pass may have produced for the job
    async fn get_live_objects(&self, namespace: &str, job: &str) -> Result<LiveObjects, ControllerError>;

    /// Server-side apply a produced object
    async fn apply(&self, namespace: &str, object: &Component) -> Result<(), ControllerError>;

    /// Replace the status of a TrainJob
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &TrainJobStatus,
    ) -> Result<(), ControllerError>;
}

/// [`ApiResource`] for an `apiVersion`/`kind` pair
pub fn api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
    ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind))
}

/// Map a 404 to `None`
fn absent_on_not_found<T>(result: Result<T, kube::Error>) -> Result<Option<T>, kube::Error> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e),
    }
}

/// [`TrainJobClient`] backed by a live cluster
pub struct KubeClient {
    client: Client,
    field_manager: String,
}

impl KubeClient {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    async fn get_dynamic<T: DeserializeOwned>(
        &self,
        namespace: &str,
        api_version: &str,
        kind: &str,
        name: &str,
    ) -> Result<Option<T>, ControllerError> {
        let ar = api_resource(api_version, kind);
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        match absent_on_not_found(api.get(name).await)? {
            Some(obj) => Ok(Some(serde_json::from_value(serde_json::to_value(obj)?)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl TrainJobClient for KubeClient {
    async fn get_training_runtime(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<TrainingRuntime>, ControllerError> {
        let api: Api<TrainingRuntime> = Api::namespaced(self.client.clone(), namespace);
        Ok(absent_on_not_found(api.get(name).await)?)
    }

    async fn get_cluster_training_runtime(
        &self,
        name: &str,
    ) -> Result<Option<ClusterTrainingRuntime>, ControllerError> {
        let api: Api<ClusterTrainingRuntime> = Api::all(self.client.clone());
        Ok(absent_on_not_found(api.get(name).await)?)
    }

    async fn get_live_objects(&self, namespace: &str, job: &str) -> Result<LiveObjects, ControllerError> {
        let hpa: Api<HorizontalPodAutoscaler> = Api::namespaced(self.client.clone(), namespace);
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);

        Ok(LiveObjects {
            jobset: self.get_dynamic(namespace, JOBSET_API_VERSION, JOBSET_KIND, job).await?,
            coscheduling_pod_group: self
                .get_dynamic(namespace, COSCHEDULING_API_VERSION, POD_GROUP_KIND, job)
                .await?,
            volcano_pod_group: self
                .get_dynamic(namespace, VOLCANO_API_VERSION, POD_GROUP_KIND, job)
                .await?,
            hpa: absent_on_not_found(hpa.get(job).await)?,
            mpi_ssh_secret: absent_on_not_found(secrets.get(&ssh_auth_secret_name(job)).await)?,
            mpi_hostfile: absent_on_not_found(config_maps.get(&hostfile_name(job)).await)?,
            flux_entrypoint: absent_on_not_found(config_maps.get(&entrypoint_config_map_name(job)).await)?,
            flux_curve: absent_on_not_found(secrets.get(&curve_secret_name(job)).await)?,
        })
    }

    async fn apply(&self, namespace: &str, object: &Component) -> Result<(), ControllerError> {
        let ar = api_resource(object.api_version(), object.kind());
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        let params = PatchParams::apply(&self.field_manager).force();
        api.patch(object.name(), &params, &Patch::Apply(&object.to_json()?))
            .await?;
        Ok(())
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &TrainJobStatus,
    ) -> Result<(), ControllerError> {
        let api: Api<TrainJob> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(
            name,
            &PatchParams::apply(&self.field_manager),
            &Patch::Merge(&json!({ "status": status })),
        )
        .await?;
        Ok(())
    }
}

/// Shared state for every reconcile
pub struct JobContext {
    pub client: Arc<dyn TrainJobClient>,
    pub engine: RuntimeEngine,
    pub config: ControllerConfig,
}

impl JobContext {
    /// Context backed by a live cluster and the default plugin set
    pub fn new(client: Client, config: ControllerConfig) -> Result<Self, ControllerError> {
        let kube = KubeClient::new(client, config.field_manager.clone());
        Ok(Self::from_parts(
            Arc::new(kube),
            RuntimeEngine::with_default_plugins()?,
            config,
        ))
    }

    pub fn from_parts(client: Arc<dyn TrainJobClient>, engine: RuntimeEngine, config: ControllerConfig) -> Self {
        Self { client, engine, config }
    }
}

async fn fetch_runtime(
    client: &dyn TrainJobClient,
    job: &TrainJob,
    namespace: &str,
) -> Result<RuntimeStore, ControllerError> {
    let mut store = RuntimeStore::new();
    let name = &job.spec.runtime_ref.name;
    match job.spec.runtime_ref.kind {
        RuntimeKind::TrainingRuntime => {
            if let Some(runtime) = client.get_training_runtime(namespace, name).await? {
                store.insert_training_runtime(runtime);
            }
        }
        RuntimeKind::ClusterTrainingRuntime => {
            if let Some(runtime) = client.get_cluster_training_runtime(name).await? {
                store.insert_cluster_training_runtime(runtime);
            }
        }
    }
    Ok(store)
}

/// Reconcile a TrainJob
#[instrument(skip(job, ctx), fields(job = %job.name_any()))]
pub async fn reconcile(job: Arc<TrainJob>, ctx: Arc<JobContext>) -> Result<Action, ControllerError> {
    let name = job.name_any();
    let namespace = job
        .namespace()
        .ok_or_else(|| ControllerError::MissingNamespace(name.clone()))?;

    if !job.is_managed_here() {
        debug!(managed_by = ?job.spec.managed_by, "job is managed by another controller");
        return Ok(Action::await_change());
    }
    if job.status.as_ref().is_some_and(TrainJobStatus::is_finished) {
        debug!("job already finished");
        return Ok(Action::await_change());
    }

    let store = fetch_runtime(ctx.client.as_ref(), &job, &namespace).await?;
    let live = ctx.client.get_live_objects(&namespace, &name).await?;

    let (built, action) = match ctx.engine.new_objects(&job, &store, &live) {
        Ok(objects) => {
            for object in &objects {
                info!(
                    kind = object.object.kind(),
                    object = object.object.name(),
                    action = ?object.action,
                    "applying object"
                );
                ctx.client.apply(&namespace, &object.object).await?;
            }
            (Ok(()), Action::requeue(ctx.config.requeue))
        }
        Err(e) => {
            warn!(error = %e, "failed to build objects");
            (Err(e), Action::requeue(ctx.config.error_requeue))
        }
    };

    let status = next_status(&job, built.as_ref().map(|_| ()), live.jobset.as_ref());
    if job.status.as_ref() != Some(&status) {
        ctx.client.patch_status(&namespace, &name, &status).await?;
    }
    Ok(action)
}

/// Error policy for the controller
pub fn error_policy(job: Arc<TrainJob>, error: &ControllerError, ctx: Arc<JobContext>) -> Action {
    error!(?error, job = %job.name_any(), "TrainJob reconciliation failed");
    Action::requeue(ctx.config.error_requeue)
}

/// Object references for jobs selected by a requeue mapping
pub fn job_refs(keys: Vec<JobKey>) -> Vec<ObjectRef<TrainJob>> {
    keys.into_iter()
        .map(|key| ObjectRef::new(&key.name).within(&key.namespace))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use kube::core::ErrorResponse;
    use trainer_common::crd::{
        ClusterTrainingRuntimeSpec, JobSetSpec, RuntimeRef, TrainJobConditionType, TrainJobSpec, TrainingRuntimeSpec,
    };
    use trainer_common::crd::TRAINJOB_CONTROLLER_MANAGER;

    use crate::status::{REASON_CREATED, REASON_RUNTIME_NOT_FOUND};

    const RUNTIME: &str = r#"
mlPolicy:
  numNodes: 2
  torch:
    numProcPerNode: 1
template:
  spec:
    replicatedJobs:
      - name: node
        template:
          metadata:
            labels:
              trainer.kubeflow.org/trainjob-ancestor-step: trainer
          spec:
            template:
              spec:
                containers:
                  - name: node
                    image: pytorch/pytorch
"#;

    fn runtime() -> ClusterTrainingRuntime {
        let spec: TrainingRuntimeSpec = serde_yaml::from_str(RUNTIME).unwrap();
        ClusterTrainingRuntime::new("torch", ClusterTrainingRuntimeSpec { runtime: spec })
    }

    fn job() -> TrainJob {
        let mut job = TrainJob::new(
            "mnist",
            TrainJobSpec {
                runtime_ref: RuntimeRef {
                    name: "torch".to_string(),
                    api_group: None,
                    kind: RuntimeKind::ClusterTrainingRuntime,
                },
                ..Default::default()
            },
        );
        job.metadata.namespace = Some("ml".to_string());
        job.metadata.uid = Some("0f3a".to_string());
        job
    }

    fn not_found() -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        })
    }

    fn context(mock: MockTrainJobClient) -> Arc<JobContext> {
        Arc::new(JobContext::from_parts(
            Arc::new(mock),
            RuntimeEngine::with_default_plugins().unwrap(),
            ControllerConfig::default(),
        ))
    }

    /// Captures the last patched status
    #[derive(Clone, Default)]
    struct StatusCapture(Arc<Mutex<Option<TrainJobStatus>>>);

    impl StatusCapture {
        fn last(&self) -> Option<TrainJobStatus> {
            self.0.lock().unwrap().clone()
        }
    }

    fn mock_with_runtime(runtime: Option<ClusterTrainingRuntime>, capture: &StatusCapture) -> MockTrainJobClient {
        let mut mock = MockTrainJobClient::new();
        mock.expect_get_cluster_training_runtime()
            .returning(move |_| Ok(runtime.clone()));
        mock.expect_get_live_objects()
            .returning(|_, _| Ok(LiveObjects::default()));
        let capture = capture.clone();
        mock.expect_patch_status().returning(move |_, _, status| {
            *capture.0.lock().unwrap() = Some(status.clone());
            Ok(())
        });
        mock
    }

    #[tokio::test]
    async fn new_job_applies_jobset_and_marks_created() {
        let capture = StatusCapture::default();
        let mut mock = mock_with_runtime(Some(runtime()), &capture);
        let applied = Arc::new(Mutex::new(Vec::new()));
        let sink = applied.clone();
        mock.expect_apply().returning(move |ns, object| {
            sink.lock().unwrap().push((ns.to_string(), object.kind()));
            Ok(())
        });

        let action = reconcile(Arc::new(job()), context(mock)).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(15)));
        assert_eq!(*applied.lock().unwrap(), vec![("ml".to_string(), "JobSet")]);
        let status = capture.last().expect("status patched");
        let created = status.condition(TrainJobConditionType::Created).unwrap();
        assert_eq!((created.status.as_str(), created.reason.as_str()), ("True", REASON_CREATED));
    }

    #[tokio::test]
    async fn missing_runtime_sets_condition_without_applying() {
        let capture = StatusCapture::default();
        let mut mock = mock_with_runtime(None, &capture);
        mock.expect_apply().never();

        let action = reconcile(Arc::new(job()), context(mock)).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
        let status = capture.last().expect("status patched");
        let created = status.condition(TrainJobConditionType::Created).unwrap();
        assert_eq!(created.status, "False");
        assert_eq!(created.reason, REASON_RUNTIME_NOT_FOUND);
    }

    #[tokio::test]
    async fn running_job_with_live_jobset_is_not_reapplied() {
        let capture = StatusCapture::default();
        let mut mock = MockTrainJobClient::new();
        mock.expect_get_cluster_training_runtime()
            .returning(|_| Ok(Some(runtime())));
        mock.expect_get_live_objects().returning(|ns, name| {
            Ok(LiveObjects {
                jobset: Some(JobSet::new(name, ns, JobSetSpec::default())),
                ..Default::default()
            })
        });
        mock.expect_apply().never();
        let sink = capture.clone();
        mock.expect_patch_status().returning(move |_, _, status| {
            *sink.0.lock().unwrap() = Some(status.clone());
            Ok(())
        });

        reconcile(Arc::new(job()), context(mock)).await.unwrap();
        assert!(capture.last().is_some());
    }

    #[tokio::test]
    async fn unchanged_status_is_not_patched() {
        let mut job = job();
        job.status = Some(next_status(&job, Ok(()), None));

        let mut mock = MockTrainJobClient::new();
        mock.expect_get_cluster_training_runtime()
            .returning(|_| Ok(Some(runtime())));
        mock.expect_get_live_objects()
            .returning(|_, _| Ok(LiveObjects::default()));
        mock.expect_apply().returning(|_, _| Ok(()));
        mock.expect_patch_status().never();

        reconcile(Arc::new(job), context(mock)).await.unwrap();
    }

    #[tokio::test]
    async fn foreign_and_finished_jobs_are_skipped() {
        let mut foreign = job();
        foreign.spec.managed_by = Some("kueue.x-k8s.io/multikueue".to_string());
        let mut mock = MockTrainJobClient::new();
        mock.expect_get_cluster_training_runtime().never();
        let action = reconcile(Arc::new(foreign), context(mock)).await.unwrap();
        assert_eq!(action, Action::await_change());

        let mut finished = job();
        finished.spec.managed_by = Some(TRAINJOB_CONTROLLER_MANAGER.to_string());
        let mut status = TrainJobStatus::default();
        crate::status::set_condition(
            &mut status.conditions,
            TrainJobConditionType::Complete,
            true,
            "AllJobsCompleted",
            "done",
            None,
        );
        finished.status = Some(status);
        let mut mock = MockTrainJobClient::new();
        mock.expect_get_live_objects().never();
        let action = reconcile(Arc::new(finished), context(mock)).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn apply_failure_is_returned() {
        let capture = StatusCapture::default();
        let mut mock = mock_with_runtime(Some(runtime()), &capture);
        mock.expect_apply()
            .returning(|_, _| Err(ControllerError::Kube(not_found())));

        let result = reconcile(Arc::new(job()), context(mock)).await;
        assert!(matches!(result, Err(ControllerError::Kube(_))));
        assert!(capture.last().is_none());
    }

    #[tokio::test]
    async fn job_without_namespace_fails() {
        let mut job = job();
        job.metadata.namespace = None;
        let result = reconcile(Arc::new(job), context(MockTrainJobClient::new())).await;
        assert!(matches!(result, Err(ControllerError::MissingNamespace(_))));
    }

    #[test]
    fn error_policy_uses_error_requeue() {
        let ctx = context(MockTrainJobClient::new());
        let action = error_policy(Arc::new(job()), &ControllerError::MissingNamespace("x".into()), ctx);
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    }

    #[test]
    fn not_found_maps_to_none() {
        assert!(absent_on_not_found::<()>(Err(not_found())).unwrap().is_none());
        assert_eq!(absent_on_not_found(Ok(1)).unwrap(), Some(1));
        let forbidden = kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "forbidden".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        });
        assert!(absent_on_not_found::<()>(Err(forbidden)).is_err());
    }

    #[test]
    fn api_resources_for_produced_kinds() {
        let ar = api_resource(JOBSET_API_VERSION, JOBSET_KIND);
        assert_eq!((ar.group.as_str(), ar.version.as_str()), ("jobset.x-k8s.io", "v1alpha2"));
        assert_eq!(ar.plural, "jobsets");

        let ar = api_resource("v1", "ConfigMap");
        assert_eq!(ar.group, "");
        assert_eq!(ar.api_version, "v1");
        assert_eq!(ar.plural, "configmaps");
    }

    #[test]
    fn job_keys_become_namespaced_refs() {
        let refs = job_refs(vec![JobKey {
            namespace: "ml".to_string(),
            name: "mnist".to_string(),
        }]);
        assert_eq!(refs, vec![ObjectRef::new("mnist").within("ml")]);
    }
}
