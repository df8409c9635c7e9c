//! `tune run` command rewriting for LLM fine-tuning runtimes
//!
//! The user submits the bare `tune run` entrypoint plus config overrides as
//! args. The rewrite picks a recipe and config from the job topology and the
//! runtime's model, adds a rendezvous endpoint for distributed runs and pins
//! the paths the runtime owns.

use trainer_common::crd::{NumProcPerNode, TrainJob};
use trainer_common::{Error, CONTAINER_TRAINER_PORT};

use crate::validation::{FieldError, FieldPath};

/// Entrypoint that triggers the rewrite
pub const TORCHTUNE_ENTRYPOINT: [&str; 2] = ["tune", "run"];

const ARG_RDZV_ENDPOINT: &str = "--rdzv_endpoint";
const ARG_CONFIG: &str = "--config";

/// Overrides owned by the runtime; user args with these keys are dropped
const IMMUTABLE_OVERRIDE_KEYS: [&str; 3] = ["output_dir", "tokenizer.path", "checkpointer.checkpoint_dir"];

const LORA_ARG_PREFIX: &str = "model.lora_";
const QLORA_ARG: &str = "model.quantize_base=True";

/// Runtime name to torchtune model config directory and size prefix
const SUPPORTED_MODELS: [(&str, &str); 4] = [
    ("torchtune-llama3.2-1b", "llama3_2/1B"),
    ("torchtune-llama3.2-3b", "llama3_2/3B"),
    ("torchtune-llama3.3-70b", "llama3_3/70B"),
    ("torchtune-qwen2.5-1.5b", "qwen2_5/1.5B"),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Topology {
    SingleDevice,
    MultiDevice,
    MultiNode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Tuning {
    Full,
    Lora,
    QLora,
}

/// Rewritten trainer command and filtered args
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TuneCommand {
    pub command: Vec<String>,
    pub args: Vec<String>,
}

/// Whether the job runs the fine-tuning entrypoint
pub fn is_torchtune(job: &TrainJob) -> bool {
    job.spec
        .trainer
        .as_ref()
        .and_then(|t| t.command.as_deref())
        .is_some_and(|cmd| cmd.iter().map(String::as_str).eq(TORCHTUNE_ENTRYPOINT))
}

fn model_dir(runtime_name: &str) -> Option<&'static str> {
    SUPPORTED_MODELS
        .iter()
        .find(|(name, _)| *name == runtime_name)
        .map(|(_, dir)| *dir)
}

fn topology(num_nodes: i32, npp: &NumProcPerNode, gpus: i64) -> Topology {
    if num_nodes > 1 {
        return Topology::MultiNode;
    }
    let devices = match npp {
        NumProcPerNode::Int(n) => i64::from(*n),
        NumProcPerNode::Str(_) => gpus,
    };
    if devices > 1 {
        Topology::MultiDevice
    } else {
        Topology::SingleDevice
    }
}

fn tuning(args: &[String]) -> Tuning {
    if !args.iter().any(|a| a.starts_with(LORA_ARG_PREFIX)) {
        Tuning::Full
    } else if args.iter().any(|a| a == QLORA_ARG) {
        Tuning::QLora
    } else {
        Tuning::Lora
    }
}

/// Recipe and config suffix; `None` for LoRA across nodes
fn recipe(topology: Topology, tuning: Tuning) -> Option<(&'static str, &'static str)> {
    Some(match (topology, tuning) {
        (Topology::SingleDevice, Tuning::Full) => ("full_finetune_single_device", "_full_single_device"),
        (Topology::SingleDevice, Tuning::Lora) => ("lora_finetune_single_device", "_lora_single_device"),
        (Topology::SingleDevice, Tuning::QLora) => ("lora_finetune_single_device", "_qlora_single_device"),
        (Topology::MultiDevice, Tuning::Full) => ("full_finetune_distributed", "_full"),
        (Topology::MultiDevice, Tuning::Lora) => ("lora_finetune_distributed", "_lora"),
        (Topology::MultiDevice, Tuning::QLora) => ("lora_finetune_distributed", "_qlora"),
        (Topology::MultiNode, Tuning::Full) => ("full_finetune_distributed", "_full_multinode"),
        (Topology::MultiNode, Tuning::Lora | Tuning::QLora) => return None,
    })
}

fn override_key(arg: &str) -> &str {
    arg.split_once('=').map_or(arg, |(key, _)| key)
}

/// Inputs gathered by the Torch plugin before rewriting
#[derive(Clone, Copy, Debug)]
pub struct TuneInputs<'a> {
    pub job_name: &'a str,
    /// DNS name of the first trainer pod
    pub rdzv_host: &'a str,
    pub runtime_name: &'a str,
    /// Command of the runtime's own trainer container
    pub runtime_command: &'a [String],
    pub user_args: &'a [String],
    pub num_nodes: i32,
    pub num_proc_per_node: &'a NumProcPerNode,
    pub gpus_per_node: i64,
}

/// Build the full `tune run` command line.
///
/// The result is a pure function of its inputs, so rewriting twice yields
/// the same command.
pub fn rewrite(inputs: &TuneInputs<'_>) -> Result<TuneCommand, Error> {
    let model = model_dir(inputs.runtime_name).ok_or_else(|| {
        Error::validation_for_field(
            inputs.job_name,
            "spec.runtimeRef.name",
            format!("unsupported fine-tuning runtime '{}'", inputs.runtime_name),
        )
    })?;
    let topology = topology(inputs.num_nodes, inputs.num_proc_per_node, inputs.gpus_per_node);
    let (recipe, suffix) = recipe(topology, tuning(inputs.user_args)).ok_or_else(|| {
        Error::validation_for_field(
            inputs.job_name,
            "spec.trainer.numNodes",
            "LoRA and QLoRA fine-tuning support a single node only",
        )
    })?;

    let mut command: Vec<String> = TORCHTUNE_ENTRYPOINT.iter().map(|s| s.to_string()).collect();
    if topology != Topology::SingleDevice {
        command.push(format!("{ARG_RDZV_ENDPOINT}={}:{CONTAINER_TRAINER_PORT}", inputs.rdzv_host));
    }
    command.push(recipe.to_string());
    command.push(ARG_CONFIG.to_string());
    command.push(format!("{model}{suffix}.yaml"));
    command.extend(
        inputs
            .runtime_command
            .iter()
            .filter(|arg| IMMUTABLE_OVERRIDE_KEYS.contains(&override_key(arg)))
            .cloned(),
    );

    let args = inputs
        .user_args
        .iter()
        .filter(|arg| !IMMUTABLE_OVERRIDE_KEYS.contains(&override_key(arg)))
        .cloned()
        .collect();

    Ok(TuneCommand { command, args })
}

/// Admission checks for fine-tuning jobs
pub fn validate(runtime_name: &str, num_nodes: i32, user_args: &[String]) -> Vec<FieldError> {
    let mut errors = Vec::new();
    let spec = FieldPath::new("spec");
    if model_dir(runtime_name).is_none() {
        errors.push(FieldError::not_supported(
            spec.child("runtimeRef").child("name"),
            format!(
                "fine-tuning runtime '{runtime_name}' is not supported, expected one of {:?}",
                SUPPORTED_MODELS.map(|(name, _)| name)
            ),
        ));
    }
    if num_nodes > 1 && tuning(user_args) != Tuning::Full {
        errors.push(FieldError::invalid(
            spec.child("trainer").child("numNodes"),
            "LoRA and QLoRA fine-tuning support a single node only",
        ));
    }
    errors
}
