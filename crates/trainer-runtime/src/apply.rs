//! Keyed upserts for container and pod fields
//!
//! Every helper replaces a matching entry in place and appends otherwise, so
//! list order stays stable across repeated reconciles.

use k8s_openapi::api::core::v1::{
    ContainerPort, EnvFromSource, EnvVar, EnvVarSource, ObjectFieldSelector, PodSchedulingGate,
    SecretEnvSource, Toleration, Volume, VolumeMount,
};

fn upsert_by<T>(list: &mut Vec<T>, item: T, same: impl Fn(&T, &T) -> bool) {
    match list.iter_mut().find(|existing| same(existing, &item)) {
        Some(existing) => *existing = item,
        None => list.push(item),
    }
}

/// Upsert environment variables by name
pub fn upsert_env_vars(env: &mut Vec<EnvVar>, items: impl IntoIterator<Item = EnvVar>) {
    for item in items {
        upsert_by(env, item, |a, b| a.name == b.name);
    }
}

/// Upsert into an optional list, creating it when absent
pub fn upsert_env_vars_opt(env: &mut Option<Vec<EnvVar>>, items: impl IntoIterator<Item = EnvVar>) {
    upsert_env_vars(env.get_or_insert_with(Vec::new), items);
}

/// Upsert a container port, matching by port number or by name
pub fn upsert_port(ports: &mut Vec<ContainerPort>, port: ContainerPort) {
    upsert_by(ports, port, |a, b| {
        a.container_port == b.container_port
            || matches!((&a.name, &b.name), (Some(x), Some(y)) if x == y)
    });
}

pub fn upsert_ports(ports: &mut Option<Vec<ContainerPort>>, items: impl IntoIterator<Item = ContainerPort>) {
    let ports = ports.get_or_insert_with(Vec::new);
    for item in items {
        upsert_port(ports, item);
    }
}

/// Upsert volume mounts by mount path
pub fn upsert_volume_mounts(mounts: &mut Vec<VolumeMount>, items: impl IntoIterator<Item = VolumeMount>) {
    for item in items {
        upsert_by(mounts, item, |a, b| a.mount_path == b.mount_path);
    }
}

pub fn upsert_volume_mounts_opt(
    mounts: &mut Option<Vec<VolumeMount>>,
    items: impl IntoIterator<Item = VolumeMount>,
) {
    upsert_volume_mounts(mounts.get_or_insert_with(Vec::new), items);
}

/// Upsert volumes by name
pub fn upsert_volumes(volumes: &mut Vec<Volume>, items: impl IntoIterator<Item = Volume>) {
    for item in items {
        upsert_by(volumes, item, |a, b| a.name == b.name);
    }
}

pub fn upsert_volumes_opt(volumes: &mut Option<Vec<Volume>>, items: impl IntoIterator<Item = Volume>) {
    upsert_volumes(volumes.get_or_insert_with(Vec::new), items);
}

pub fn upsert_scheduling_gates(
    gates: &mut Option<Vec<PodSchedulingGate>>,
    items: impl IntoIterator<Item = PodSchedulingGate>,
) {
    let gates = gates.get_or_insert_with(Vec::new);
    for item in items {
        upsert_by(gates, item, |a, b| a.name == b.name);
    }
}

/// Append tolerations that are not already present
pub fn append_tolerations(tolerations: &mut Option<Vec<Toleration>>, items: &[Toleration]) {
    let tolerations = tolerations.get_or_insert_with(Vec::new);
    for item in items {
        if !tolerations.contains(item) {
            tolerations.push(item.clone());
        }
    }
}

/// Append a secret env source unless the same secret is already referenced
pub fn upsert_secret_env_from(env_from: &mut Option<Vec<EnvFromSource>>, secret: &str) {
    let env_from = env_from.get_or_insert_with(Vec::new);
    let present = env_from
        .iter()
        .any(|e| e.secret_ref.as_ref().is_some_and(|s| s.name == secret));
    if !present {
        env_from.push(EnvFromSource {
            secret_ref: Some(SecretEnvSource {
                name: secret.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
}

/// Plain `name=value` variable
pub fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

/// Variable resolved through the downward API
pub fn env_from_field(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                api_version: None,
            }),
            ..Default::default()
        }),
    }
}

pub fn container_port(port: i32) -> ContainerPort {
    ContainerPort {
        container_port: port,
        ..Default::default()
    }
}
