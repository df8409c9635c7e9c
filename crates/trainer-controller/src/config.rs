//! Command line and environment configuration

use std::time::Duration;

use clap::Parser;
use trainer_common::DEFAULT_FIELD_MANAGER;

/// Trainer controller - composes TrainJobs into JobSets and PodGroups
#[derive(Parser, Debug, Clone)]
#[command(name = "trainer-controller", version, about, long_about = None)]
pub struct Cli {
    /// Field manager used for server-side apply
    #[arg(long, env = "TRAINER_FIELD_MANAGER", default_value = DEFAULT_FIELD_MANAGER)]
    pub field_manager: String,

    /// Seconds between periodic reconciles of a healthy job
    #[arg(long, env = "TRAINER_REQUEUE_SECS", default_value_t = 15)]
    pub requeue_secs: u64,

    /// Seconds before retrying a failed reconcile
    #[arg(long, env = "TRAINER_ERROR_REQUEUE_SECS", default_value_t = 30)]
    pub error_requeue_secs: u64,

    /// Emit logs as JSON lines
    #[arg(long, env = "TRAINER_LOG_JSON")]
    pub log_json: bool,

    /// Print the CRD manifests and exit
    #[arg(long)]
    pub crd: bool,
}

/// Settings shared by every reconcile
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    pub field_manager: String,
    pub requeue: Duration,
    pub error_requeue: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            requeue: Duration::from_secs(15),
            error_requeue: Duration::from_secs(30),
        }
    }
}

impl From<&Cli> for ControllerConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            field_manager: cli.field_manager.clone(),
            requeue: Duration::from_secs(cli.requeue_secs),
            error_requeue: Duration::from_secs(cli.error_requeue_secs),
        }
    }
}
