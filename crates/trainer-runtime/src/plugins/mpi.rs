//! MPI policy: launcher plus worker nodes wired over SSH
//!
//! The launcher reads a hostfile listing every worker and reaches them over
//! SSH with a per-job key pair. Both are produced here as a Secret and a
//! ConfigMap and mounted into the pod templates.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, EnvVar, KeyToPath, Secret, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use rcgen::KeyPair;
use tracing::debug;
use trainer_common::crd::{MLPolicySource, MPIImplementation, MPIMLPolicySource, NumProcPerNode, TrainJob};
use trainer_common::{ANCESTOR_TRAINER, LAUNCHER};

use super::{
    job_name, job_namespace, job_num_nodes, job_subdomain, ml_policy_source, owner_reference, trainer_pod_set_name,
};
use crate::apply::{self, env};
use crate::error::{Result, RuntimeError};
use crate::framework::{
    BuildContext, Component, ComponentBuilderPlugin, CustomValidationPlugin, EnforceMLPolicyPlugin, Plugin,
    RuntimeObject,
};
use crate::info::{Info, PodSet};
use crate::validation::{FieldError, FieldPath, ValidationResult, Warnings};

pub const NAME: &str = "MPI";

pub const DEFAULT_SSH_AUTH_MOUNT_PATH: &str = "/root/.ssh";
pub const HOSTFILE_MOUNT_PATH: &str = "/etc/mpi";
pub const HOSTFILE_KEY: &str = "hostfile";

const SSH_AUTH_VOLUME: &str = "mpi-ssh-auth";
const HOSTFILE_VOLUME: &str = "mpi-hostfile";
const SSH_AUTH_SECRET_TYPE: &str = "kubernetes.io/ssh-auth";
const SSH_PRIVATE_KEY: &str = "ssh-privatekey";
const SSH_PUBLIC_KEY: &str = "ssh-publickey";
const SSH_KEY_TYPE: &str = "ecdsa-sha2-nistp256";
const SSH_CURVE: &str = "nistp256";

pub fn ssh_auth_secret_name(job: &str) -> String {
    format!("{job}-mpi-ssh-auth")
}

pub fn hostfile_name(job: &str) -> String {
    format!("{job}-mpi-hostfile")
}

pub struct Mpi;

impl Mpi {
    pub fn factory() -> Arc<dyn Plugin> {
        Arc::new(Self)
    }
}

fn mpi_policy(info: &Info) -> Option<MPIMLPolicySource> {
    match ml_policy_source(info)? {
        MLPolicySource::Mpi(mpi) => Some(mpi.clone()),
        _ => None,
    }
}

/// Resolved MPI settings for one job
#[derive(Clone, Debug, PartialEq, Eq)]
struct MpiSettings {
    implementation: MPIImplementation,
    slots: i32,
    ssh_auth_mount_path: String,
    run_launcher_as_node: bool,
    total_nodes: i32,
}

impl MpiSettings {
    fn resolve(policy: &MPIMLPolicySource, info: &Info, job: &TrainJob) -> Self {
        let job_slots = job
            .spec
            .trainer
            .as_ref()
            .and_then(|t| t.num_proc_per_node.as_ref())
            .and_then(NumProcPerNode::as_int);
        let total_nodes = job_num_nodes(job)
            .or_else(|| info.runtime_policy.ml_policy.as_ref().and_then(|p| p.num_nodes))
            .unwrap_or(1);
        Self {
            implementation: policy.mpi_implementation.unwrap_or_default(),
            slots: job_slots.or(policy.num_proc_per_node).unwrap_or(1),
            ssh_auth_mount_path: policy
                .ssh_auth_mount_path
                .clone()
                .unwrap_or_else(|| DEFAULT_SSH_AUTH_MOUNT_PATH.to_string()),
            run_launcher_as_node: policy.run_launcher_as_node.unwrap_or(false),
            total_nodes,
        }
    }

    /// Pods of the `node` replicated job
    fn worker_count(&self) -> i32 {
        if self.run_launcher_as_node {
            (self.total_nodes - 1).max(0)
        } else {
            self.total_nodes
        }
    }
}

/// Hostfile listing the launcher (when it trains) and every pod of the
/// `workers` replicated job
fn hostfile(job: &str, workers: &str, subdomain: &str, settings: &MpiSettings) -> String {
    let mut hosts = Vec::new();
    if settings.run_launcher_as_node {
        hosts.push(format!("{job}-{LAUNCHER}-0-0.{subdomain}"));
    }
    hosts.extend((0..settings.worker_count()).map(|i| format!("{job}-{workers}-0-{i}.{subdomain}")));

    let mut out = String::new();
    for host in hosts {
        // writing to a String cannot fail
        let _ = match settings.implementation {
            MPIImplementation::OpenMPI => writeln!(out, "{host} slots={}", settings.slots),
            MPIImplementation::IntelMPI | MPIImplementation::MPICH => writeln!(out, "{host}:{}", settings.slots),
        };
    }
    out
}

fn launcher_env(settings: &MpiSettings) -> Vec<EnvVar> {
    let hostfile = format!("{HOSTFILE_MOUNT_PATH}/{HOSTFILE_KEY}");
    match settings.implementation {
        MPIImplementation::OpenMPI => vec![
            env("OMPI_MCA_orte_keep_fqdn_hostnames", "true"),
            env("OMPI_MCA_orte_default_hostfile", hostfile),
            env("OMPI_MCA_plm_rsh_args", "-o ConnectionAttempts=10"),
            env("OMPI_MCA_orte_set_default_slots", settings.slots.to_string()),
        ],
        MPIImplementation::IntelMPI => vec![env("I_MPI_HYDRA_HOST_FILE", hostfile)],
        MPIImplementation::MPICH => vec![env("HYDRA_HOST_FILE", hostfile)],
    }
}

fn key_to_path(key: &str, path: &str) -> KeyToPath {
    KeyToPath {
        key: key.to_string(),
        path: path.to_string(),
        mode: None,
    }
}

fn ssh_auth_volume(job: &str) -> Volume {
    Volume {
        name: SSH_AUTH_VOLUME.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(ssh_auth_secret_name(job)),
            items: Some(vec![
                key_to_path(SSH_PRIVATE_KEY, "id_rsa"),
                key_to_path(SSH_PUBLIC_KEY, "id_rsa.pub"),
                key_to_path(SSH_PUBLIC_KEY, "authorized_keys"),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn hostfile_volume(job: &str) -> Volume {
    Volume {
        name: HOSTFILE_VOLUME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: hostfile_name(job),
            items: Some(vec![key_to_path(HOSTFILE_KEY, HOSTFILE_KEY)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(volume: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: volume.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn wire_pod_set(ps: &mut PodSet, volumes: Vec<Volume>, mounts: &[VolumeMount], env: &[EnvVar]) {
    apply::upsert_volumes(&mut ps.volumes, volumes);
    for container in &mut ps.containers {
        apply::upsert_volume_mounts(&mut container.volume_mounts, mounts.iter().cloned());
        apply::upsert_env_vars(&mut container.env, env.iter().cloned());
    }
}

impl Plugin for Mpi {
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

impl EnforceMLPolicyPlugin for Mpi {
    fn enforce_ml_policy(&self, info: Option<&mut Info>, job: &mut TrainJob) -> Result<()> {
        let Some(info) = info else { return Ok(()) };
        let Some(policy) = mpi_policy(info) else { return Ok(()) };
        let settings = MpiSettings::resolve(&policy, info, job);
        let name = job_name(job).to_string();
        let ssh_mount = mount(SSH_AUTH_VOLUME, &settings.ssh_auth_mount_path);

        if let Some(node) = info.find_pod_set_by_ancestor_mut(ANCESTOR_TRAINER) {
            node.count = Some(settings.worker_count());
            wire_pod_set(node, vec![ssh_auth_volume(&name)], &[ssh_mount.clone()], job.trainer_env());
        }
        if let Some(launcher) = info.find_pod_set_by_name_mut(LAUNCHER) {
            launcher.count = Some(1);
            wire_pod_set(
                launcher,
                vec![ssh_auth_volume(&name), hostfile_volume(&name)],
                &[ssh_mount, mount(HOSTFILE_VOLUME, HOSTFILE_MOUNT_PATH)],
                &launcher_env(&settings),
            );
        }
        debug!(job = %name, workers = settings.worker_count(), slots = settings.slots, "wired MPI job");
        info.sync_pod_sets_to_template_spec();
        Ok(())
    }
}

/// PKCS#8 private key and OpenSSH public key for a fresh P-256 key pair
pub fn generate_ssh_key_pair() -> Result<(String, String)> {
    let key_pair = KeyPair::generate().map_err(|e| RuntimeError::KeyGeneration(e.to_string()))?;
    let private_pem = key_pair.serialize_pem();

    let mut wire = Vec::new();
    for field in [SSH_KEY_TYPE.as_bytes(), SSH_CURVE.as_bytes(), key_pair.public_key_raw()] {
        let len = u32::try_from(field.len()).map_err(|e| RuntimeError::KeyGeneration(e.to_string()))?;
        wire.extend_from_slice(&len.to_be_bytes());
        wire.extend_from_slice(field);
    }
    let public = format!("{SSH_KEY_TYPE} {}", STANDARD.encode(wire));
    Ok((private_pem, public))
}

fn ssh_auth_secret(job: &TrainJob) -> Result<Secret> {
    let (private_key, public_key) = generate_ssh_key_pair()?;
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(ssh_auth_secret_name(job_name(job))),
            namespace: Some(job_namespace(job).to_string()),
            owner_references: Some(vec![owner_reference(job)]),
            ..Default::default()
        },
        type_: Some(SSH_AUTH_SECRET_TYPE.to_string()),
        data: Some(BTreeMap::from([
            (SSH_PRIVATE_KEY.to_string(), ByteString(private_key.into_bytes())),
            (SSH_PUBLIC_KEY.to_string(), ByteString(public_key.into_bytes())),
        ])),
        immutable: Some(true),
        ..Default::default()
    })
}

fn hostfile_config_map(job: &TrainJob, contents: String) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(hostfile_name(job_name(job))),
            namespace: Some(job_namespace(job).to_string()),
            owner_references: Some(vec![owner_reference(job)]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(HOSTFILE_KEY.to_string(), contents)])),
        ..Default::default()
    }
}

impl ComponentBuilderPlugin for Mpi {
    fn build(&self, ctx: &BuildContext<'_>, info: Option<&Info>, job: &TrainJob) -> Result<Vec<RuntimeObject>> {
        let Some(info) = info else { return Ok(Vec::new()) };
        let Some(policy) = mpi_policy(info) else { return Ok(Vec::new()) };
        let settings = MpiSettings::resolve(&policy, info, job);
        let name = job_name(job);
        let contents = hostfile(name, &trainer_pod_set_name(info), &job_subdomain(info, job), &settings);

        let mut objects = Vec::new();
        if ctx.live.mpi_ssh_secret.is_none() {
            objects.push(RuntimeObject::create(Component::Secret(ssh_auth_secret(job)?)));
        }

        let desired = hostfile_config_map(job, contents);
        match &ctx.live.mpi_hostfile {
            None => objects.push(RuntimeObject::create(Component::ConfigMap(desired))),
            Some(live) if live.data != desired.data => {
                objects.push(RuntimeObject::update(Component::ConfigMap(desired)));
            }
            Some(_) => {}
        }
        Ok(objects)
    }
}

impl CustomValidationPlugin for Mpi {
    fn validate(&self, info: Option<&Info>, _old: Option<&TrainJob>, new: &TrainJob) -> ValidationResult {
        let mut errors = Vec::new();
        if info.and_then(mpi_policy).is_none() {
            return (Warnings::default(), errors);
        }
        if let Some(NumProcPerNode::Str(value)) = new.spec.trainer.as_ref().and_then(|t| t.num_proc_per_node.as_ref()) {
            errors.push(FieldError::invalid(
                FieldPath::new("spec").child("trainer").child("numProcPerNode"),
                format!("must have an int value for MPI jobs, got '{value}'"),
            ));
        }
        (Warnings::default(), errors)
    }
}
