//! Trainer controller - reconciles TrainJobs into JobSets and PodGroups

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::core::v1::LimitRange;
use k8s_openapi::api::node::v1::RuntimeClass;
use kube::api::DynamicObject;
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client, CustomResourceExt, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use trainer_common::crd::{ClusterTrainingRuntime, TrainJob, TrainingRuntime};
use trainer_controller::{api_resource, error_policy, job_refs, reconcile, Cli, ControllerConfig, JobContext};
use trainer_runtime::plugins::coscheduling::{requeue_for_limit_range, requeue_for_runtime_class};
use trainer_runtime::{WatchRelation, WatchedKind};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        for crd in [
            TrainJob::crd(),
            TrainingRuntime::crd(),
            ClusterTrainingRuntime::crd(),
        ] {
            println!("---");
            print!("{}", serde_yaml::to_string(&crd)?);
        }
        return Ok(());
    }

    init_tracing(cli.log_json);

    let client = Client::try_default().await?;
    let ctx = Arc::new(JobContext::new(client.clone(), ControllerConfig::from(&cli))?);
    let watched = ctx.engine.watched_kinds();

    let training_runtimes = reflect(Api::<TrainingRuntime>::all(client.clone()));
    let cluster_runtimes = reflect(Api::<ClusterTrainingRuntime>::all(client.clone()));

    let mut controller = Controller::new(Api::<TrainJob>::all(client.clone()), WatcherConfig::default());
    let jobs = controller.store();

    for kind in watched.iter().filter(|k| k.relation == WatchRelation::Owns) {
        tracing::info!(api_version = kind.api_version, kind = kind.kind, "- owns");
        let ar = api_resource(kind.api_version, kind.kind);
        controller = controller.owns_with(
            Api::<DynamicObject>::all_with(client.clone(), &ar),
            ar,
            WatcherConfig::default(),
        );
    }

    if is_watched(&watched, "RuntimeClass") {
        tracing::info!("- watches RuntimeClass");
        let jobs = jobs.clone();
        let training_runtimes = training_runtimes.clone();
        let cluster_runtimes = cluster_runtimes.clone();
        controller = controller.watches(
            Api::<RuntimeClass>::all(client.clone()),
            WatcherConfig::default(),
            move |runtime_class| {
                job_refs(requeue_for_runtime_class(
                    &runtime_class.name_any(),
                    &snapshot(&training_runtimes),
                    &snapshot(&cluster_runtimes),
                    &snapshot(&jobs),
                ))
            },
        );
    }

    if is_watched(&watched, "LimitRange") {
        tracing::info!("- watches LimitRange");
        let jobs = jobs.clone();
        controller = controller.watches(
            Api::<LimitRange>::all(client.clone()),
            WatcherConfig::default(),
            move |limit_range| {
                let namespace = limit_range.namespace().unwrap_or_default();
                job_refs(requeue_for_limit_range(&namespace, &snapshot(&jobs)))
            },
        );
    }

    tracing::info!("Starting TrainJob controller");
    controller
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| {
            match result {
                Ok(action) => tracing::debug!(?action, "TrainJob reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "TrainJob reconciliation error"),
            }
            std::future::ready(())
        })
        .await;

    tracing::info!("TrainJob controller stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn is_watched(kinds: &[WatchedKind], kind: &str) -> bool {
    kinds
        .iter()
        .any(|k| k.relation == WatchRelation::Watches && k.kind == kind)
}

/// Cache of `K` kept current by a background watch
fn reflect<K>(api: Api<K>) -> Store<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    let (reader, writer) = reflector::store();
    let stream = reflector::reflector(writer, watcher::watcher(api, WatcherConfig::default()))
        .default_backoff()
        .applied_objects()
        .for_each(|result| {
            if let Err(e) = result {
                tracing::warn!(error = %e, "runtime watch error");
            }
            std::future::ready(())
        });
    tokio::spawn(stream);
    reader
}

fn snapshot<K>(store: &Store<K>) -> Vec<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    store.state().iter().map(|obj| obj.as_ref().clone()).collect()
}
