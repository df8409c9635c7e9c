//! TrainJob reconciler
//!
//! Glue between the cluster and the synchronous composition engine in
//! `trainer-runtime`: fetch inputs, build, apply, record conditions.

pub mod config;
pub mod controller;
pub mod error;
pub mod status;

pub use config::{Cli, ControllerConfig};
pub use controller::{api_resource, error_policy, job_refs, reconcile, JobContext, KubeClient, TrainJobClient};
pub use error::ControllerError;
