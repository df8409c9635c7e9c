//! Plugin registry and capability dispatch

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, instrument};
use trainer_common::crd::TrainJob;

use super::{BuildContext, Plugin, RuntimeObject, WatchedKind};
use crate::error::{Result, RuntimeError};
use crate::info::Info;
use crate::plugins;
use crate::validation::{ValidationResult, Warnings};

/// Constructor of a plugin instance
pub type PluginFactory = fn() -> Arc<dyn Plugin>;

/// Ordered list of plugins to instantiate
#[derive(Clone)]
pub struct Registry {
    entries: Vec<(&'static str, PluginFactory)>,
}

impl Registry {
    pub fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn register(mut self, name: &'static str, factory: PluginFactory) -> Self {
        self.entries.push((name, factory));
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(name, _)| *name)
    }
}

impl Default for Registry {
    /// Builders run in this order, so the JobSet comes first
    fn default() -> Self {
        Self::empty()
            .register(plugins::jobset::NAME, plugins::jobset::JobSet::factory)
            .register(plugins::plainml::NAME, plugins::plainml::PlainML::factory)
            .register(plugins::torch::NAME, plugins::torch::Torch::factory)
            .register(plugins::mpi::NAME, plugins::mpi::Mpi::factory)
            .register(plugins::jax::NAME, plugins::jax::Jax::factory)
            .register(plugins::xgboost::NAME, plugins::xgboost::XGBoost::factory)
            .register(plugins::flux::NAME, plugins::flux::Flux::factory)
            .register(plugins::coscheduling::NAME, plugins::coscheduling::Coscheduling::factory)
            .register(plugins::volcano::NAME, plugins::volcano::Volcano::factory)
            .register(plugins::kai::NAME, plugins::kai::KaiScheduler::factory)
    }
}

/// Instantiated plugins grouped by capability, each list in registry order
pub struct Framework {
    enforce_ml_policy: Vec<Arc<dyn Plugin>>,
    enforce_pod_group_policy: Vec<Arc<dyn Plugin>>,
    component_builders: Vec<Arc<dyn Plugin>>,
    custom_validation: Vec<Arc<dyn Plugin>>,
    watch_extensions: Vec<Arc<dyn Plugin>>,
}

impl Framework {
    pub fn new(registry: Registry) -> Result<Self> {
        let mut seen = BTreeSet::new();
        let mut framework = Self {
            enforce_ml_policy: Vec::new(),
            enforce_pod_group_policy: Vec::new(),
            component_builders: Vec::new(),
            custom_validation: Vec::new(),
            watch_extensions: Vec::new(),
        };

        for (name, factory) in registry.entries {
            if !seen.insert(name) {
                return Err(RuntimeError::DuplicatePlugin(name.to_string()));
            }
            let plugin = factory();
            if plugin.as_enforce_ml_policy().is_some() {
                framework.enforce_ml_policy.push(plugin.clone());
            }
            if plugin.as_enforce_pod_group_policy().is_some() {
                framework.enforce_pod_group_policy.push(plugin.clone());
            }
            if plugin.as_component_builder().is_some() {
                framework.component_builders.push(plugin.clone());
            }
            if plugin.as_custom_validation().is_some() {
                framework.custom_validation.push(plugin.clone());
            }
            if plugin.as_watch_extension().is_some() {
                framework.watch_extensions.push(plugin);
            }
        }
        Ok(framework)
    }

    #[instrument(skip_all, fields(job = job.metadata.name.as_deref().unwrap_or_default()))]
    pub fn run_enforce_ml_policy_plugins(&self, mut info: Option<&mut Info>, job: &mut TrainJob) -> Result<()> {
        for plugin in &self.enforce_ml_policy {
            if let Some(p) = plugin.as_enforce_ml_policy() {
                debug!(plugin = plugin.name(), "enforcing ML policy");
                p.enforce_ml_policy(info.as_deref_mut(), job)?;
            }
        }
        Ok(())
    }

    #[instrument(skip_all, fields(job = job.metadata.name.as_deref().unwrap_or_default()))]
    pub fn run_enforce_pod_group_policy_plugins(&self, mut info: Option<&mut Info>, job: &TrainJob) -> Result<()> {
        for plugin in &self.enforce_pod_group_policy {
            if let Some(p) = plugin.as_enforce_pod_group_policy() {
                debug!(plugin = plugin.name(), "enforcing pod group policy");
                p.enforce_pod_group_policy(info.as_deref_mut(), job)?;
            }
        }
        Ok(())
    }

    #[instrument(skip_all, fields(job = job.metadata.name.as_deref().unwrap_or_default()))]
    pub fn run_component_builder_plugins(
        &self,
        ctx: &BuildContext<'_>,
        info: Option<&Info>,
        job: &TrainJob,
    ) -> Result<Vec<RuntimeObject>> {
        let mut objects = Vec::new();
        for plugin in &self.component_builders {
            if let Some(p) = plugin.as_component_builder() {
                let built = p.build(ctx, info, job)?;
                for obj in &built {
                    debug!(
                        plugin = plugin.name(),
                        kind = obj.object.kind(),
                        name = obj.object.name(),
                        action = ?obj.action,
                        "built object"
                    );
                }
                objects.extend(built);
            }
        }
        Ok(objects)
    }

    pub fn run_custom_validation_plugins(
        &self,
        info: Option<&Info>,
        old: Option<&TrainJob>,
        new: &TrainJob,
    ) -> ValidationResult {
        let mut warnings = Warnings::default();
        let mut errors = Vec::new();
        for plugin in &self.custom_validation {
            if let Some(p) = plugin.as_custom_validation() {
                let (w, e) = p.validate(info, old, new);
                warnings.extend(w);
                errors.extend(e);
            }
        }
        (warnings, errors)
    }

    /// Kinds every watch-extension plugin asks for, deduplicated in first-seen order
    pub fn watched_kinds(&self) -> Vec<WatchedKind> {
        let mut kinds: Vec<WatchedKind> = Vec::new();
        for plugin in &self.watch_extensions {
            if let Some(p) = plugin.as_watch_extension() {
                for kind in p.watched_kinds() {
                    if !kinds.contains(&kind) {
                        kinds.push(kind);
                    }
                }
            }
        }
        kinds
    }

    pub fn component_builder_names(&self) -> Vec<&'static str> {
        self.component_builders.iter().map(|p| p.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::{EnforceMLPolicyPlugin, WatchExtensionPlugin};
    use trainer_common::crd::TrainJobSpec;

    struct Counter;

    impl Plugin for Counter {
        fn name(&self) -> &'static str {
            "Counter"
        }

        fn as_enforce_ml_policy(&self) -> Option<&dyn EnforceMLPolicyPlugin> {
            Some(self)
        }

        fn as_watch_extension(&self) -> Option<&dyn WatchExtensionPlugin> {
            Some(self)
        }
    }

    impl EnforceMLPolicyPlugin for Counter {
        fn enforce_ml_policy(&self, info: Option<&mut Info>, _job: &mut TrainJob) -> Result<()> {
            if let Some(info) = info {
                let n = info.labels.len();
                info.labels.insert(format!("seen-{n}"), "true".to_string());
            }
            Ok(())
        }
    }

    impl WatchExtensionPlugin for Counter {
        fn watched_kinds(&self) -> Vec<WatchedKind> {
            vec![WatchedKind::watches("v1", "LimitRange")]
        }
    }

    fn counter() -> Arc<dyn Plugin> {
        Arc::new(Counter)
    }

    #[test]
    fn duplicate_names_rejected() {
        let registry = Registry::empty().register("a", counter).register("a", counter);
        assert!(matches!(
            Framework::new(registry),
            Err(RuntimeError::DuplicatePlugin(name)) if name == "a"
        ));
    }

    #[test]
    fn capabilities_run_once_per_plugin() {
        let framework = Framework::new(Registry::empty().register("a", counter).register("b", counter)).unwrap();
        let mut info = Info::default();
        let mut job = TrainJob::new("job", TrainJobSpec::default());
        framework.run_enforce_ml_policy_plugins(Some(&mut info), &mut job).unwrap();
        assert_eq!(info.labels.len(), 2);
        framework.run_enforce_ml_policy_plugins(None, &mut job).unwrap();

        assert!(framework.component_builder_names().is_empty());
        assert_eq!(framework.watched_kinds().len(), 1);
    }

    #[test]
    fn default_registry_order() {
        let names: Vec<_> = Registry::default().names().collect();
        assert_eq!(
            names,
            ["JobSet", "PlainML", "Torch", "MPI", "JAX", "XGBoost", "Flux", "Coscheduling", "Volcano", "KAIScheduler"]
        );

        let framework = Framework::new(Registry::default()).unwrap();
        assert_eq!(
            framework.component_builder_names(),
            ["JobSet", "Torch", "MPI", "Flux", "Coscheduling", "Volcano"]
        );
        assert_eq!(framework.watched_kinds().iter().filter(|k| k.kind == "Secret").count(), 1);
    }

    #[test]
    fn framework_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Framework>();
    }
}
