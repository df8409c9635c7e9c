//! PyTorch distributed (torchrun) policy
//!
//! Sets the trainer node count, injects the `PET_*` rendezvous variables read
//! by torchrun, rewrites `tune run` commands for fine-tuning runtimes and,
//! for elastic policies with metrics, produces an autoscaler.

pub mod elastic;
pub mod torchtune;

use std::collections::BTreeSet;
use std::sync::Arc;

use trainer_common::crd::{JobSetSpec, MLPolicySource, NumProcPerNode, TorchMLPolicySource, TrainJob};
use trainer_common::{ANCESTOR_TRAINER, CONTAINER_TRAINER_PORT, JOB_COMPLETION_INDEX_FIELD_PATH, NODE};

use super::{first_trainer_host, job_name, job_num_nodes, ml_policy_source};
use crate::apply::{self, env, env_from_field};
use crate::error::{Result, RuntimeError};
use crate::framework::{
    BuildContext, ComponentBuilderPlugin, CustomValidationPlugin, EnforceMLPolicyPlugin, Plugin, RuntimeObject,
};
use crate::info::Info;
use crate::resources::{gpu_per_node, proc_per_node, resources_per_node};
use crate::validation::{FieldError, FieldPath, ValidationResult, Warnings};

pub const NAME: &str = "Torch";

pub const ENV_NUM_NODES: &str = "PET_NNODES";
pub const ENV_NUM_PROC_PER_NODE: &str = "PET_NPROC_PER_NODE";
pub const ENV_NODE_RANK: &str = "PET_NODE_RANK";
pub const ENV_MASTER_ADDR: &str = "PET_MASTER_ADDR";
pub const ENV_MASTER_PORT: &str = "PET_MASTER_PORT";
pub const ENV_MAX_RESTARTS: &str = "PET_MAX_RESTARTS";

/// Variables set by the plugin that users may not supply
pub const RESERVED_ENV_NAMES: [&str; 6] = [
    ENV_NUM_NODES,
    ENV_NUM_PROC_PER_NODE,
    ENV_NODE_RANK,
    ENV_MASTER_ADDR,
    ENV_MASTER_PORT,
    ENV_MAX_RESTARTS,
];

const ALLOWED_NUM_PROC_PER_NODE: [&str; 3] = ["auto", "cpu", "gpu"];

pub struct Torch;

impl Torch {
    pub fn factory() -> Arc<dyn Plugin> {
        Arc::new(Self)
    }
}

fn torch_policy(info: &Info) -> Option<TorchMLPolicySource> {
    match ml_policy_source(info)? {
        MLPolicySource::Torch(torch) => Some(torch.clone()),
        _ => None,
    }
}

impl Plugin for Torch {
    fn name(&self) -> &'static str {
        NAME
    }

    fn as_enforce_ml_policy(&self) -> Option<&dyn EnforceMLPolicyPlugin> {
        Some(self)
    }

    fn as_component_builder(&self) -> Option<&dyn ComponentBuilderPlugin> {
        Some(self)
    }

    fn as_custom_validation(&self) -> Option<&dyn CustomValidationPlugin> {
        Some(self)
    }
}

impl EnforceMLPolicyPlugin for Torch {
    fn enforce_ml_policy(&self, info: Option<&mut Info>, job: &mut TrainJob) -> Result<()> {
        let Some(info) = info else { return Ok(()) };
        let Some(torch) = torch_policy(info) else { return Ok(()) };
        let name = job_name(job).to_string();
        let elastic = torch.elastic_policy.as_ref();

        let num_nodes = match info.find_pod_set_by_ancestor_mut(ANCESTOR_TRAINER) {
            Some(ps) => {
                if let Some(n) = job_num_nodes(job).or_else(|| elastic.and_then(|e| e.min_nodes)) {
                    ps.count = Some(n);
                }
                ps.count.unwrap_or(1)
            }
            None => 1,
        };

        let directive = job
            .spec
            .trainer
            .as_ref()
            .and_then(|t| t.num_proc_per_node.clone())
            .or_else(|| torch.num_proc_per_node.clone())
            .unwrap_or_else(NumProcPerNode::auto);
        let resources = resources_per_node(info, job).cloned();
        let num_proc_per_node = proc_per_node(&directive, resources.as_ref())?;

        let master_host = first_trainer_host(info, job);

        let tune = if torchtune::is_torchtune(job) {
            let runtime_command = info
                .template_object::<JobSetSpec>()
                .and_then(trainer_template_command)
                .unwrap_or_default();
            let user_args = job
                .spec
                .trainer
                .as_ref()
                .and_then(|t| t.args.clone())
                .unwrap_or_default();
            Some(torchtune::rewrite(&torchtune::TuneInputs {
                job_name: &name,
                rdzv_host: &master_host,
                runtime_name: &job.spec.runtime_ref.name,
                runtime_command: &runtime_command,
                user_args: &user_args,
                num_nodes,
                num_proc_per_node: &num_proc_per_node,
                gpus_per_node: gpu_per_node(resources.as_ref())?,
            })?)
        } else {
            None
        };

        let container = info
            .trainer_container_mut()
            .ok_or(RuntimeError::MissingTrainerContainer { plugin: NAME })?;

        apply::upsert_env_vars(&mut container.env, job.trainer_env().iter().cloned());

        let nnodes = match elastic.map(|e| (e.min_nodes, e.max_nodes)) {
            Some((Some(min), Some(max))) => format!("{min}:{max}"),
            _ => num_nodes.to_string(),
        };
        let mut vars = vec![
            env(ENV_NUM_NODES, nnodes),
            env(ENV_NUM_PROC_PER_NODE, num_proc_per_node.to_string()),
            env_from_field(ENV_NODE_RANK, JOB_COMPLETION_INDEX_FIELD_PATH),
        ];
        if let Some(restarts) = elastic.and_then(|e| e.max_restarts) {
            vars.push(env(ENV_MAX_RESTARTS, restarts.to_string()));
        }
        match tune {
            None => {
                vars.push(env(ENV_MASTER_ADDR, master_host));
                vars.push(env(ENV_MASTER_PORT, CONTAINER_TRAINER_PORT.to_string()));
            }
            Some(tune) => {
                container.command = Some(tune.command);
                container.args = Some(tune.args);
            }
        }
        apply::upsert_env_vars(&mut container.env, vars);
        apply::upsert_port(&mut container.ports, apply::container_port(CONTAINER_TRAINER_PORT));

        info.sync_pod_sets_to_template_spec();
        Ok(())
    }
}

/// Command of the runtime's trainer `node` container
fn trainer_template_command(spec: &JobSetSpec) -> Option<Vec<String>> {
    spec.replicated_jobs
        .iter()
        .filter_map(|rjob| rjob.pod_spec())
        .flat_map(|pod| pod.containers.iter())
        .find(|c| c.name == NODE)
        .and_then(|c| c.command.clone())
}

impl ComponentBuilderPlugin for Torch {
    fn build(&self, ctx: &BuildContext<'_>, info: Option<&Info>, job: &TrainJob) -> Result<Vec<RuntimeObject>> {
        let Some(info) = info else { return Ok(Vec::new()) };
        let Some(elastic) = torch_policy(info).and_then(|t| t.elastic_policy) else {
            return Ok(Vec::new());
        };
        Ok(elastic::desired_hpa(&elastic, job)
            .and_then(|hpa| elastic::gate(hpa, ctx.live.hpa.as_ref()))
            .into_iter()
            .collect())
    }
}

impl CustomValidationPlugin for Torch {
    fn validate(&self, info: Option<&Info>, _old: Option<&TrainJob>, new: &TrainJob) -> ValidationResult {
        let mut errors = Vec::new();
        let Some(torch) = info.and_then(torch_policy) else {
            return (Warnings::default(), errors);
        };
        let spec = FieldPath::new("spec");

        if let Some(elastic) = &torch.elastic_policy {
            if let (Some(min), Some(max)) = (elastic.min_nodes, elastic.max_nodes) {
                if min > max {
                    errors.push(FieldError::invalid(
                        spec.child("runtimeRef"),
                        format!("elastic policy minNodes ({min}) must not exceed maxNodes ({max})"),
                    ));
                }
            }
        }

        let Some(trainer) = &new.spec.trainer else {
            return (Warnings::default(), errors);
        };
        let trainer_path = spec.child("trainer");

        if let Some(NumProcPerNode::Str(value)) = &trainer.num_proc_per_node {
            if !ALLOWED_NUM_PROC_PER_NODE.contains(&value.as_str()) {
                errors.push(FieldError::invalid(
                    trainer_path.child("numProcPerNode"),
                    format!("must have an int value or one of {ALLOWED_NUM_PROC_PER_NODE:?}, got '{value}'"),
                ));
            }
        }

        let reserved: BTreeSet<&str> = trainer
            .env
            .iter()
            .map(|e| e.name.as_str())
            .filter(|name| RESERVED_ENV_NAMES.contains(name))
            .collect();
        if !reserved.is_empty() {
            errors.push(FieldError::invalid(
                trainer_path.child("env"),
                format!("must not have reserved envs, invalid envs configured: {reserved:?}"),
            ));
        }

        if torchtune::is_torchtune(new) {
            let num_nodes = trainer
                .num_nodes
                .or_else(|| info.and_then(|i| i.find_pod_set_by_ancestor(ANCESTOR_TRAINER)?.count))
                .unwrap_or(1);
            errors.extend(torchtune::validate(
                &new.spec.runtime_ref.name,
                num_nodes,
                trainer.args.as_deref().unwrap_or_default(),
            ));
        }

        (Warnings::default(), errors)
    }
}
