//! Flux framework HPC cluster bootstrapped inside the trainer pods
//!
//! An init container copies a prebuilt Flux view into a shared volume and
//! writes the broker configuration; the trainer container then starts a
//! broker on every pod and the lead broker submits the job's own command.
//! Brokers authenticate with a CURVE certificate derived from the job UID.
//!
//! Broker settings default to [`DEFAULT_VIEW_IMAGE`], [`DEFAULT_NETWORK_DEVICE`]
//! and [`DEFAULT_QUEUE_POLICY`], each overridable through a trainer env var
//! of the same name as its `ENV_*` constant.

use std::collections::BTreeMap;
use std::sync::Arc;

use aws_lc_rs::agreement::{PrivateKey, X25519};
use aws_lc_rs::digest::{digest, SHA256};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, Secret, SecretVolumeSource, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use minijinja::{context, Environment};
use tracing::debug;
use trainer_common::crd::{FluxMLPolicySource, JobSetSpec, MLPolicySource, Network, TrainJob};
use trainer_common::{ANCESTOR_TRAINER, NODE};

use super::{
    job_name, job_namespace, job_num_nodes, job_subdomain, ml_policy_source, owner_reference, trainer_pod_set_name,
};
use crate::apply;
use crate::error::{Result, RuntimeError};
use crate::framework::{
    BuildContext, Component, ComponentBuilderPlugin, CustomValidationPlugin, EnforceMLPolicyPlugin, Plugin,
    RuntimeObject, WatchExtensionPlugin, WatchedKind,
};
use crate::info::Info;
use crate::validation::{FieldError, FieldPath, ValidationResult, Warnings};

pub const NAME: &str = "Flux";

pub const ENV_VIEW_IMAGE: &str = "FLUX_VIEW_IMAGE";
pub const ENV_NETWORK_DEVICE: &str = "FLUX_NETWORK_DEVICE";
pub const ENV_QUEUE_POLICY: &str = "FLUX_QUEUE_POLICY";

pub const DEFAULT_VIEW_IMAGE: &str = "ghcr.io/converged-computing/flux-view-ubuntu:tag-jammy";
pub const DEFAULT_NETWORK_DEVICE: &str = "eth0";
pub const DEFAULT_QUEUE_POLICY: &str = "fcfs";

pub const INSTALLER_CONTAINER: &str = "flux-installer";
pub const ENTRYPOINT_KEY: &str = "entrypoint.sh";
pub const INIT_KEY: &str = "init.sh";
pub const CURVE_KEY: &str = "curve.cert";

const FLUX_INSTALL_VOLUME: &str = "flux-install";
const SPACK_INSTALL_VOLUME: &str = "spack-install";
const CURVE_VOLUME: &str = "flux-curve";
const FLUX_MOUNT_PATH: &str = "/mnt/flux";
const SOFTWARE_MOUNT_PATH: &str = "/opt/software";
const CONFIG_MOUNT_PATH: &str = "/etc/flux-config";
const CURVE_MOUNT_PATH: &str = "/curve";
const VIEW_ROOT: &str = "/opt/view";
const BROKER_PORT: u16 = 8050;

const BROKER_TEMPLATE: &str = include_str!("../../templates/flux/broker.toml");
const INIT_TEMPLATE: &str = include_str!("../../templates/flux/init.sh");
const ENTRYPOINT_TEMPLATE: &str = include_str!("../../templates/flux/entrypoint.sh");

const Z85_CHARSET: &[u8; 85] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ.-:+=^!/*?&<>()[]{}@%$#";

pub fn entrypoint_config_map_name(job: &str) -> String {
    format!("{job}-flux-entrypoint")
}

pub fn curve_secret_name(job: &str) -> String {
    format!("{job}-flux-curve")
}

pub struct Flux;

impl Flux {
    pub fn factory() -> Arc<dyn Plugin> {
        Arc::new(Self)
    }
}

fn flux_policy(info: &Info) -> Option<FluxMLPolicySource> {
    match ml_policy_source(info)? {
        MLPolicySource::Flux(flux) => Some(flux.clone()),
        _ => None,
    }
}

/// Broker settings after trainer env overrides
#[derive(Clone, Debug, PartialEq, Eq)]
struct BrokerSettings {
    view_image: String,
    network_device: String,
    queue_policy: String,
}

impl BrokerSettings {
    fn from_job(job: &TrainJob) -> Self {
        let mut settings = Self {
            view_image: DEFAULT_VIEW_IMAGE.to_string(),
            network_device: DEFAULT_NETWORK_DEVICE.to_string(),
            queue_policy: DEFAULT_QUEUE_POLICY.to_string(),
        };
        for var in job.trainer_env() {
            let value = var.value.clone().unwrap_or_default();
            match var.name.as_str() {
                ENV_VIEW_IMAGE => settings.view_image = value,
                ENV_NETWORK_DEVICE => settings.network_device = value,
                ENV_QUEUE_POLICY => settings.queue_policy = value,
                _ => {}
            }
        }
        settings
    }
}

fn mount(volume: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: volume.to_string(),
        mount_path: path.to_string(),
        read_only: read_only.then_some(true),
        ..Default::default()
    }
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn volumes(job: &str) -> Vec<Volume> {
    let config_map = entrypoint_config_map_name(job);
    vec![
        empty_dir(SPACK_INSTALL_VOLUME),
        empty_dir(FLUX_INSTALL_VOLUME),
        Volume {
            name: config_map.clone(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map,
                default_mode: Some(0o755),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: CURVE_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(curve_secret_name(job)),
                // the broker rejects a certificate readable by anyone else
                default_mode: Some(0o400),
                ..Default::default()
            }),
            ..Default::default()
        },
    ]
}

fn trainer_mounts(job: &str) -> [VolumeMount; 4] {
    [
        mount(FLUX_INSTALL_VOLUME, FLUX_MOUNT_PATH, false),
        mount(SPACK_INSTALL_VOLUME, SOFTWARE_MOUNT_PATH, false),
        mount(&entrypoint_config_map_name(job), CONFIG_MOUNT_PATH, true),
        mount(CURVE_VOLUME, CURVE_MOUNT_PATH, true),
    ]
}

fn installer(job: &str, settings: &BrokerSettings) -> Container {
    Container {
        name: INSTALLER_CONTAINER.to_string(),
        image: Some(settings.view_image.clone()),
        command: Some(vec!["/bin/bash".to_string(), format!("{CONFIG_MOUNT_PATH}/{INIT_KEY}")]),
        volume_mounts: Some(vec![
            mount(FLUX_INSTALL_VOLUME, FLUX_MOUNT_PATH, false),
            mount(&entrypoint_config_map_name(job), CONFIG_MOUNT_PATH, true),
        ]),
        ..Default::default()
    }
}

/// Headless service with a subdomain so brokers can reach each other by name
fn ensure_network(spec: &mut JobSetSpec, job: &str) {
    let network = spec.network.get_or_insert_with(Network::default);
    network.enable_dns_hostnames = Some(true);
    if network.subdomain.as_deref().map_or(true, str::is_empty) {
        network.subdomain = Some(job.to_string());
    }
}

impl Plugin for Flux {
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

    fn as_watch_extension(&self) -> Option<&dyn WatchExtensionPlugin> {
        Some(self)
    }
}

impl EnforceMLPolicyPlugin for Flux {
    fn enforce_ml_policy(&self, info: Option<&mut Info>, job: &mut TrainJob) -> Result<()> {
        let Some(info) = info else { return Ok(()) };
        if flux_policy(info).is_none() {
            return Ok(());
        }
        let name = job_name(job).to_string();
        let settings = BrokerSettings::from_job(job);

        if let Some(trainer) = info.find_pod_set_by_ancestor_mut(ANCESTOR_TRAINER) {
            if let Some(n) = job_num_nodes(job) {
                trainer.count = Some(n);
            }
            apply::upsert_volumes(&mut trainer.volumes, volumes(&name));
        }

        let container = info
            .trainer_container_mut()
            .ok_or(RuntimeError::MissingTrainerContainer { plugin: NAME })?;
        // the job's command and args are baked into the entrypoint script
        container.command = Some(vec!["/bin/bash".to_string(), format!("{CONFIG_MOUNT_PATH}/{ENTRYPOINT_KEY}")]);
        container.args = Some(Vec::new());
        apply::upsert_volume_mounts(&mut container.volume_mounts, trainer_mounts(&name));

        let trainer_set = trainer_pod_set_name(info);
        info.sync_pod_sets_to_template_spec();

        let Some(spec) = info.template_object_mut::<JobSetSpec>() else {
            return Ok(());
        };
        ensure_network(spec, &name);
        if let Some(pod) = spec.replicated_job_mut(&trainer_set).and_then(|rjob| rjob.pod_spec_mut()) {
            let init_containers = pod.init_containers.get_or_insert_with(Vec::new);
            if !init_containers.iter().any(|c| c.name == INSTALLER_CONTAINER) {
                init_containers.push(installer(&name, &settings));
            }
            if let Some(node) = pod.containers.iter_mut().find(|c| c.name == NODE) {
                node.tty = Some(true);
                node.stdin = Some(true);
            }
        }
        debug!(job = %name, image = %settings.view_image, "wired Flux cluster");
        Ok(())
    }
}

/// The job's command and args as one shell command line
fn original_command(job: &TrainJob) -> String {
    let Some(trainer) = &job.spec.trainer else {
        return String::new();
    };
    let parts: Vec<&str> = trainer
        .command
        .iter()
        .flatten()
        .chain(trainer.args.iter().flatten())
        .map(String::as_str)
        .collect();
    parts.join(" ").trim().to_string()
}

/// Index range in Flux hostlist notation
fn host_range(size: i32, start: i32) -> String {
    if size == 1 {
        start.to_string()
    } else {
        format!("{start}-{}", start + size - 1)
    }
}

fn hostlist(job: &str, trainer_set: &str, size: i32) -> String {
    format!("{job}-{trainer_set}-0-[{}]", host_range(size, 0))
}

fn render(name: &'static str, source: &'static str, ctx: minijinja::Value) -> Result<String> {
    let mut env = Environment::new();
    env.set_keep_trailing_newline(true);
    env.add_template(name, source)?;
    Ok(env.get_template(name)?.render(ctx)?)
}

fn entrypoint_config_map(info: &Info, job: &TrainJob, policy: &FluxMLPolicySource) -> Result<ConfigMap> {
    let name = job_name(job);
    let settings = BrokerSettings::from_job(job);
    let trainer_set = trainer_pod_set_name(info);
    let nodes = info
        .find_pod_set_by_ancestor(ANCESTOR_TRAINER)
        .and_then(|ps| ps.count)
        .unwrap_or(1)
        .max(1);
    let tasks = nodes.saturating_mul(policy.num_proc_per_node.unwrap_or(1).max(1));
    let hosts = hostlist(name, &trainer_set, nodes);
    let main_host = format!("{name}-{trainer_set}-0-0");

    let broker_config = render(
        "broker.toml",
        BROKER_TEMPLATE,
        context! {
            port => BROKER_PORT,
            network_device => settings.network_device,
            fqdn => format!("{}.{}.svc.cluster.local", job_subdomain(info, job), job_namespace(job)),
            hosts => hosts,
            queue_policy => settings.queue_policy,
        },
    )?;
    let init = render(
        INIT_KEY,
        INIT_TEMPLATE,
        context! {
            flux_root => VIEW_ROOT,
            main_host => main_host,
            hosts => hosts,
            broker_config => broker_config,
        },
    )?;
    let entrypoint = render(
        ENTRYPOINT_KEY,
        ENTRYPOINT_TEMPLATE,
        context! {
            command => original_command(job),
            main_host => main_host,
            submit_flags => format!("-N{nodes} -n{tasks}"),
        },
    )?;

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(entrypoint_config_map_name(name)),
            namespace: Some(job_namespace(job).to_string()),
            owner_references: Some(vec![owner_reference(job)]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            (ENTRYPOINT_KEY.to_string(), entrypoint),
            (INIT_KEY.to_string(), init),
        ])),
        ..Default::default()
    })
}

/// Z85 encoding; `None` unless the input length is a multiple of four
fn encode_z85(data: &[u8]) -> Option<String> {
    if data.len() % 4 != 0 {
        return None;
    }
    let mut out = String::with_capacity(data.len() / 4 * 5);
    for chunk in data.chunks_exact(4) {
        let value = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        for divisor in [52_200_625, 614_125, 7_225, 85, 1] {
            out.push(char::from(Z85_CHARSET[(value / divisor % 85) as usize]));
        }
    }
    Some(out)
}

fn curve_public_key(secret: &[u8]) -> Result<Vec<u8>> {
    let key_error = |e: aws_lc_rs::error::Unspecified| RuntimeError::KeyGeneration(e.to_string());
    let private = PrivateKey::from_private_key(&X25519, secret).map_err(|e| RuntimeError::KeyGeneration(e.to_string()))?;
    Ok(private.compute_public_key().map_err(key_error)?.as_ref().to_vec())
}

/// ZeroMQ CURVE certificate whose key pair is derived from the job UID
fn curve_certificate(job: &TrainJob) -> Result<String> {
    let uid = job.metadata.uid.as_deref().unwrap_or_default();
    let seed = digest(&SHA256, uid.as_bytes());
    let public = curve_public_key(seed.as_ref())?;
    let z85 = |bytes: &[u8]| {
        encode_z85(bytes).ok_or_else(|| RuntimeError::KeyGeneration("curve key is not a multiple of 4 bytes".into()))
    };
    Ok(format!(
        "#  ZeroMQ CURVE Secret Certificate\n\
         #  Generated by Kubeflow Trainer\n\n\
         metadata\n    name = \"{}\"\n\
         curve\n    public-key = \"{}\"\n    secret-key = \"{}\"\n",
        job_name(job),
        z85(&public)?,
        z85(seed.as_ref())?,
    ))
}

fn curve_secret(job: &TrainJob) -> Result<Secret> {
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(curve_secret_name(job_name(job))),
            namespace: Some(job_namespace(job).to_string()),
            owner_references: Some(vec![owner_reference(job)]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            CURVE_KEY.to_string(),
            ByteString(curve_certificate(job)?.into_bytes()),
        )])),
        ..Default::default()
    })
}

impl ComponentBuilderPlugin for Flux {
    fn build(&self, ctx: &BuildContext<'_>, info: Option<&Info>, job: &TrainJob) -> Result<Vec<RuntimeObject>> {
        let Some(info) = info else { return Ok(Vec::new()) };
        let Some(policy) = flux_policy(info) else { return Ok(Vec::new()) };

        let mut objects = Vec::new();
        let desired = entrypoint_config_map(info, job, &policy)?;
        match &ctx.live.flux_entrypoint {
            None => objects.push(RuntimeObject::create(Component::ConfigMap(desired))),
            Some(live) if live.data != desired.data => {
                objects.push(RuntimeObject::update(Component::ConfigMap(desired)));
            }
            Some(_) => {}
        }
        // the certificate is a pure function of the UID
        if ctx.live.flux_curve.is_none() {
            objects.push(RuntimeObject::create(Component::Secret(curve_secret(job)?)));
        }
        Ok(objects)
    }
}

impl CustomValidationPlugin for Flux {
    fn validate(&self, info: Option<&Info>, _old: Option<&TrainJob>, _new: &TrainJob) -> ValidationResult {
        let mut errors = Vec::new();
        let Some(info) = info else {
            return (Warnings::default(), errors);
        };
        let Some(policy) = flux_policy(info) else {
            return (Warnings::default(), errors);
        };
        let trainer = FieldPath::new("spec").child("trainer");

        if let Some(n) = policy.num_proc_per_node.filter(|n| *n < 1) {
            errors.push(FieldError::invalid(
                trainer.child("numProcPerNode"),
                format!("must be greater than or equal to 1 for Flux TrainJob, got {n}"),
            ));
        }
        let reserved = info
            .find_pod_set_by_ancestor(ANCESTOR_TRAINER)
            .is_some_and(|ps| ps.init_containers.iter().any(|c| c.name == INSTALLER_CONTAINER));
        if reserved {
            errors.push(FieldError::invalid(
                trainer.child("initContainers").index(0).child("name"),
                format!("init container name '{INSTALLER_CONTAINER}' is reserved for Flux"),
            ));
        }
        (Warnings::default(), errors)
    }
}

impl WatchExtensionPlugin for Flux {
    fn watched_kinds(&self) -> Vec<WatchedKind> {
        vec![WatchedKind::owns("v1", "ConfigMap"), WatchedKind::owns("v1", "Secret")]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::{LiveObjects, ObjectAction};
    use crate::testing::{info_for, runtime_from_yaml, train_job};
    use trainer_common::crd::Trainer;

    const FLUX_RUNTIME: &str = r#"
mlPolicy:
  numNodes: 2
  flux:
    numProcPerNode: 4
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
                    image: lammps:latest
"#;

    fn lammps_job() -> TrainJob {
        train_job(Trainer {
            command: Some(vec!["lmp".to_string(), "-in".to_string()]),
            args: Some(vec!["in.reaxff.hns".to_string()]),
            ..Default::default()
        })
    }

    fn enforced(job: &mut TrainJob) -> Info {
        let mut info = info_for(&runtime_from_yaml(FLUX_RUNTIME));
        Flux.enforce_ml_policy(Some(&mut info), job).unwrap();
        info
    }

    fn build(info: &Info, job: &TrainJob, live: &LiveObjects) -> Vec<RuntimeObject> {
        Flux.build(&BuildContext { live }, Some(info), job).unwrap()
    }

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn enforce_wires_installer_and_entrypoint() {
        let mut job = lammps_job();
        let info = enforced(&mut job);

        let spec = info.template_object::<JobSetSpec>().unwrap();
        let network = spec.network.as_ref().unwrap();
        assert_eq!(network.enable_dns_hostnames, Some(true));
        assert_eq!(network.subdomain.as_deref(), Some("job"));

        let pod = spec.replicated_job(NODE).unwrap().pod_spec().unwrap();
        let init = pod.init_containers.as_ref().unwrap();
        assert_eq!(init.len(), 1);
        assert_eq!(init[0].name, INSTALLER_CONTAINER);
        assert_eq!(init[0].image.as_deref(), Some(DEFAULT_VIEW_IMAGE));

        let node = &pod.containers[0];
        assert_eq!(node.command.as_ref().unwrap(), &["/bin/bash", "/etc/flux-config/entrypoint.sh"]);
        assert_eq!(node.tty, Some(true));
        assert_eq!(node.stdin, Some(true));
        let mounts: Vec<_> = node.volume_mounts.iter().flatten().map(|m| m.mount_path.as_str()).collect();
        assert_eq!(mounts, ["/mnt/flux", "/opt/software", "/etc/flux-config", "/curve"]);

        let volumes: Vec<_> = pod.volumes.iter().flatten().map(|v| v.name.as_str()).collect();
        assert_eq!(volumes, ["spack-install", "flux-install", "job-flux-entrypoint", "flux-curve"]);
        let curve = pod.volumes.iter().flatten().find(|v| v.name == CURVE_VOLUME).unwrap();
        assert_eq!(curve.secret.as_ref().unwrap().default_mode, Some(0o400));
    }

    #[test]
    fn trainer_env_overrides_broker_settings() {
        let mut job = train_job(Trainer {
            env: vec![
                apply::env(ENV_VIEW_IMAGE, "ghcr.io/converged-computing/flux-view-rocky:tag-9"),
                apply::env(ENV_QUEUE_POLICY, "easy"),
            ],
            ..Default::default()
        });
        let settings = BrokerSettings::from_job(&job);
        assert_eq!(settings.network_device, DEFAULT_NETWORK_DEVICE);
        assert_eq!(settings.queue_policy, "easy");

        let info = enforced(&mut job);
        let spec = info.template_object::<JobSetSpec>().unwrap();
        let pod = spec.replicated_job(NODE).unwrap().pod_spec().unwrap();
        assert_eq!(
            pod.init_containers.as_ref().unwrap()[0].image.as_deref(),
            Some("ghcr.io/converged-computing/flux-view-rocky:tag-9")
        );
    }

    #[test]
    fn existing_subdomain_is_kept() {
        let yaml = FLUX_RUNTIME.replace("    replicatedJobs:", "    network:\n      subdomain: hpc\n    replicatedJobs:");
        let mut info = info_for(&runtime_from_yaml(&yaml));
        Flux.enforce_ml_policy(Some(&mut info), &mut lammps_job()).unwrap();
        let network = info.template_object::<JobSetSpec>().unwrap().network.clone().unwrap();
        assert_eq!(network.subdomain.as_deref(), Some("hpc"));
        assert_eq!(network.enable_dns_hostnames, Some(true));
    }

    #[test]
    fn enforcement_is_idempotent() {
        let mut job = lammps_job();
        let mut info = enforced(&mut job);
        let once = info.clone();
        Flux.enforce_ml_policy(Some(&mut info), &mut job).unwrap();
        assert_eq!(info, once);
    }

    #[test]
    fn missing_trainer_container_is_an_error() {
        let yaml = FLUX_RUNTIME.replace("- name: node\n                    image", "- name: main\n                    image");
        let mut info = info_for(&runtime_from_yaml(&yaml));
        let err = Flux.enforce_ml_policy(Some(&mut info), &mut lammps_job()).unwrap_err();
        assert!(matches!(err, RuntimeError::MissingTrainerContainer { plugin: "Flux" }));
    }

    #[test]
    fn builds_scripts_and_curve_secret() {
        let mut job = lammps_job();
        let info = enforced(&mut job);
        let objects = build(&info, &job, &LiveObjects::default());
        let kinds: Vec<_> = objects.iter().map(|o| o.object.kind()).collect();
        assert_eq!(kinds, ["ConfigMap", "Secret"]);

        let Component::ConfigMap(cm) = &objects[0].object else {
            panic!("expected config map");
        };
        assert_eq!(cm.metadata.name.as_deref(), Some("job-flux-entrypoint"));
        assert_eq!(cm.metadata.owner_references.as_ref().unwrap()[0].controller, Some(true));
        let data = cm.data.as_ref().unwrap();
        let init = &data[INIT_KEY];
        assert!(init.starts_with("#!/bin/sh\nfluxroot=/opt/view\nmainHost=job-node-0-0\n"));
        assert!(init.contains("hosts=\"job-node-0-[0-1]\""));
        assert!(init.contains("default_port = 8050"));
        assert!(init.contains("default_bind = \"tcp://eth0:%p\""));
        assert!(init.contains("default_connect = \"tcp://%h.job.default.svc.cluster.local:%p\""));
        assert!(init.contains("queue-policy = \"fcfs\""));
        let entrypoint = &data[ENTRYPOINT_KEY];
        assert!(entrypoint.contains("command=\"lmp -in in.reaxff.hns\""));
        assert!(entrypoint.contains("mainHost=\"job-node-0-0\""));
        assert!(entrypoint.contains("flux submit -N2 -n8 --quiet --watch"));

        let Component::Secret(secret) = &objects[1].object else {
            panic!("expected secret");
        };
        assert_eq!(secret.metadata.name.as_deref(), Some("job-flux-curve"));
        let cert = String::from_utf8(secret.data.as_ref().unwrap()[CURVE_KEY].0.clone()).unwrap();
        assert!(cert.starts_with("#  ZeroMQ CURVE Secret Certificate\n"));
        assert!(cert.contains("    name = \"job\"\n"));
    }

    #[test]
    fn build_follows_live_state() {
        let mut job = lammps_job();
        let info = enforced(&mut job);
        let objects = build(&info, &job, &LiveObjects::default());
        let (Component::ConfigMap(cm), Component::Secret(secret)) = (&objects[0].object, &objects[1].object) else {
            panic!("expected config map and secret");
        };

        let live = LiveObjects {
            flux_entrypoint: Some(cm.clone()),
            flux_curve: Some(secret.clone()),
            ..Default::default()
        };
        assert!(build(&info, &job, &live).is_empty());

        let mut stale = cm.clone();
        stale.data = Some(BTreeMap::new());
        let live = LiveObjects {
            flux_entrypoint: Some(stale),
            flux_curve: Some(secret.clone()),
            ..Default::default()
        };
        let objects = build(&info, &job, &live);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].action, ObjectAction::Update);
    }

    #[test]
    fn curve_certificate_is_deterministic_per_uid() {
        let job = lammps_job();
        let first = curve_certificate(&job).unwrap();
        assert_eq!(first, curve_certificate(&job).unwrap());

        let mut other = lammps_job();
        other.metadata.uid = Some("other-uid".to_string());
        assert_ne!(first, curve_certificate(&other).unwrap());

        let key = |line: &str| first.lines().find(|l| l.trim_start().starts_with(line)).unwrap().to_string();
        // 32-byte keys encode to 40 characters plus the quoted assignment
        assert_eq!(key("public-key").trim().len(), "public-key = \"\"".len() + 40);
        assert_eq!(key("secret-key").trim().len(), "secret-key = \"\"".len() + 40);
    }

    #[test]
    fn x25519_public_key_matches_rfc7748() {
        let secret = hex("77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a");
        assert_eq!(
            curve_public_key(&secret).unwrap(),
            hex("8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a")
        );
    }

    #[test]
    fn z85_matches_reference_vector() {
        assert_eq!(
            encode_z85(&[0x86, 0x4F, 0xD2, 0x6F, 0xB5, 0x59, 0xF7, 0x5B]).as_deref(),
            Some("HelloWorld")
        );
        assert_eq!(encode_z85(&[1, 2, 3]), None);
    }

    #[test]
    fn original_command_joins_and_trims() {
        assert_eq!(original_command(&lammps_job()), "lmp -in in.reaxff.hns");
        let job = train_job(Trainer {
            command: Some(vec!["  python  ".to_string()]),
            args: Some(vec![" script.py ".to_string()]),
            ..Default::default()
        });
        assert_eq!(original_command(&job), "python    script.py");
        assert_eq!(original_command(&train_job(Trainer::default())), "");
    }

    #[test]
    fn hostlist_ranges() {
        assert_eq!(hostlist("lammps", NODE, 1), "lammps-node-0-[0]");
        assert_eq!(hostlist("lammps", "worker", 4), "lammps-worker-0-[0-3]");
        assert_eq!(host_range(3, 2), "2-4");
    }

    #[test]
    fn validation_rejects_process_count_and_reserved_init_container() {
        let yaml = FLUX_RUNTIME.replace("numProcPerNode: 4", "numProcPerNode: 0").replace(
            "                containers:",
            "                initContainers:\n                  - name: flux-installer\n                    image: busybox\n                containers:",
        );
        let info = info_for(&runtime_from_yaml(&yaml));
        let (_, errors) = Flux.validate(Some(&info), None, &lammps_job());
        let paths: Vec<_> = errors.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, ["spec.trainer.numProcPerNode", "spec.trainer.initContainers[0].name"]);

        let info = info_for(&runtime_from_yaml(FLUX_RUNTIME));
        assert!(Flux.validate(Some(&info), None, &lammps_job()).1.is_empty());
    }

    #[test]
    fn watches_owned_scripts_and_secret() {
        let kinds = Flux.watched_kinds();
        assert_eq!(kinds.len(), 2);
        assert!(kinds.iter().all(|k| k.relation == crate::framework::WatchRelation::Owns));
    }
}
