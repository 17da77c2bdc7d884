//! Pod spec construction for a Sandbox.
//!
//! A pure function from `(Sandbox, RuntimeEnvironment, Option<SandboxProfile>)`
//! to a `k8s_openapi::api::core::v1::Pod` — no I/O, so it is exercised
//! directly by unit tests without a cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, Pod, PodSecurityContext, PodSpec, ResourceRequirements,
    SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use crate::crd::{RuntimeEnvironmentSpec, SandboxProfileSpec, SandboxSpec, SecurityLevel};

pub const GVISOR_RUNTIME_CLASS: &str = "gvisor";
pub const SANDBOX_CONTAINER_NAME: &str = "sandbox";
pub const ENTRY_WRAPPER: &str = "/opt/llmsafespace/entrypoint.sh";

/// Builds the pod spec for a cold-created Sandbox. `profile` supplies
/// resource/filesystem/seccomp defaults when `spec.resources`/`filesystem`
/// fields are unset; `spec` always wins when both are present.
pub fn build_pod(
    sandbox_name: &str,
    sandbox_uid: &str,
    namespace: &str,
    spec: &SandboxSpec,
    runtime: &RuntimeEnvironmentSpec,
    profile: Option<&SandboxProfileSpec>,
) -> Pod {
    let pod_name = format!("sandbox-{sandbox_name}");

    let mut labels = BTreeMap::new();
    labels.insert("llmsafespace.dev/sandbox-id".to_string(), sandbox_name.to_string());
    labels.insert("llmsafespace.dev/component".to_string(), "sandbox".to_string());
    labels.insert("llmsafespace.dev/runtime".to_string(), sanitize_label(&spec.runtime));

    let resources = resolve_resources(spec, profile);
    let writable_paths = resolve_writable_paths(spec, profile);
    let read_only_root = spec.filesystem.read_only_root.unwrap_or(true);
    let seccomp_path = spec
        .security_context
        .seccomp
        .clone()
        .or_else(|| profile.and_then(|p| p.seccomp_profile_path.clone()));

    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    for (i, path) in writable_paths.iter().enumerate() {
        let vol_name = format!("writable-{i}");
        volumes.push(Volume {
            name: vol_name.clone(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: vol_name,
            mount_path: path.clone(),
            ..Default::default()
        });
    }

    let container = Container {
        name: SANDBOX_CONTAINER_NAME.to_string(),
        image: Some(runtime.image.clone()),
        command: Some(vec![ENTRY_WRAPPER.to_string()]),
        resources: Some(resources),
        security_context: Some(SecurityContext {
            run_as_user: spec.security_context.uid,
            run_as_group: spec.security_context.gid,
            read_only_root_filesystem: Some(read_only_root),
            allow_privilege_escalation: Some(false),
            ..Default::default()
        }),
        volume_mounts: if mounts.is_empty() { None } else { Some(mounts) },
        ..Default::default()
    };

    let runtime_class_name = if spec.security_level == SecurityLevel::High {
        Some(GVISOR_RUNTIME_CLASS.to_string())
    } else {
        None
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            owner_references: Some(vec![OwnerReference {
                api_version: "llmsafespace.dev/v1".to_string(),
                kind: "Sandbox".to_string(),
                name: sandbox_name.to_string(),
                uid: sandbox_uid.to_string(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]),
            annotations: seccomp_annotation(seccomp_path),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            volumes: if volumes.is_empty() { None } else { Some(volumes) },
            runtime_class_name,
            security_context: Some(PodSecurityContext {
                run_as_user: spec.security_context.uid,
                run_as_group: spec.security_context.gid,
                ..Default::default()
            }),
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

/// Builds the backing pod for a prewarmed `WarmPod`. Unlike [`build_pod`]
/// there is no `Sandbox` yet to own it — the pod is owned by the `WarmPod`
/// instead — and it runs the pool's `preloadPackages`/`preloadScripts` as
/// init containers before the long-lived sandbox container starts. The
/// runtime image is responsible for touching the readiness sentinel once
/// warm-up inside the main container completes; the WarmPod reconciler polls
/// for it via exec rather than a Kubernetes readiness probe, so the pool can
/// tell "pod Running" apart from "pod Running and actually warmed up".
pub fn build_warm_pod_pod(
    warm_pod_name: &str,
    warm_pod_uid: &str,
    namespace: &str,
    pool: &crate::crd::WarmPoolSpec,
    runtime: &RuntimeEnvironmentSpec,
    profile: Option<&SandboxProfileSpec>,
) -> Pod {
    let pod_name = format!("warmpod-{warm_pod_name}");

    let mut labels = BTreeMap::new();
    labels.insert("llmsafespace.dev/component".to_string(), "warmpod".to_string());
    labels.insert("llmsafespace.dev/runtime".to_string(), sanitize_label(&pool.runtime));
    labels.insert(
        "llmsafespace.dev/security-level".to_string(),
        sanitize_label(&format!("{:?}", pool.security_level).to_lowercase()),
    );

    let mut init_containers = Vec::new();
    if !pool.preload_packages.is_empty() {
        init_containers.push(Container {
            name: "preload-packages".to_string(),
            image: Some(runtime.image.clone()),
            command: Some(vec!["sh".to_string(), "-c".to_string()]),
            args: Some(vec![package_install_command(runtime, &pool.preload_packages)]),
            ..Default::default()
        });
    }
    for (i, script) in pool.preload_scripts.iter().enumerate() {
        init_containers.push(Container {
            name: format!("preload-script-{i}"),
            image: Some(runtime.image.clone()),
            command: Some(vec!["sh".to_string(), "-c".to_string()]),
            args: Some(vec![script.clone()]),
            ..Default::default()
        });
    }

    let resources_spec = profile.map(|p| &p.default_resources).cloned().unwrap_or(pool.resources.clone());
    let mut limits = BTreeMap::new();
    if let Some(cpu) = &resources_spec.cpu {
        limits.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &resources_spec.memory {
        limits.insert("memory".to_string(), Quantity(memory.clone()));
    }

    let container = Container {
        name: SANDBOX_CONTAINER_NAME.to_string(),
        image: Some(runtime.image.clone()),
        command: Some(vec![ENTRY_WRAPPER.to_string()]),
        resources: Some(ResourceRequirements {
            limits: if limits.is_empty() { None } else { Some(limits.clone()) },
            requests: if limits.is_empty() { None } else { Some(limits) },
            claims: None,
        }),
        security_context: Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    };

    let runtime_class_name = if pool.security_level == SecurityLevel::High {
        Some(GVISOR_RUNTIME_CLASS.to_string())
    } else {
        None
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            owner_references: Some(vec![OwnerReference {
                api_version: "llmsafespace.dev/v1".to_string(),
                kind: "WarmPod".to_string(),
                name: warm_pod_name.to_string(),
                uid: warm_pod_uid.to_string(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            init_containers: if init_containers.is_empty() { None } else { Some(init_containers) },
            containers: vec![container],
            runtime_class_name,
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

/// Shells out to the runtime's declared package manager, defaulting to `pip`
/// when the catalog entry doesn't name one (most of the corpus's runtime
/// images are Python).
fn package_install_command(runtime: &RuntimeEnvironmentSpec, packages: &[String]) -> String {
    let manager = runtime.package_manager.as_deref().unwrap_or("pip");
    let joined = packages.join(" ");
    match manager {
        "npm" => format!("npm install -g {joined}"),
        "apt" => format!("apt-get update && apt-get install -y {joined}"),
        _ => format!("pip install --no-cache-dir {joined}"),
    }
}

fn seccomp_annotation(path: Option<String>) -> Option<BTreeMap<String, String>> {
    path.map(|p| {
        let mut m = BTreeMap::new();
        m.insert("llmsafespace.dev/seccomp-profile".to_string(), p);
        m
    })
}

fn resolve_resources(spec: &SandboxSpec, profile: Option<&SandboxProfileSpec>) -> ResourceRequirements {
    let cpu = spec
        .resources
        .cpu
        .clone()
        .or_else(|| profile.and_then(|p| p.default_resources.cpu.clone()));
    let memory = spec
        .resources
        .memory
        .clone()
        .or_else(|| profile.and_then(|p| p.default_resources.memory.clone()));
    let ephemeral = spec
        .resources
        .ephemeral_storage
        .clone()
        .or_else(|| profile.and_then(|p| p.default_resources.ephemeral_storage.clone()));

    let mut limits = BTreeMap::new();
    if let Some(cpu) = &cpu {
        limits.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &memory {
        limits.insert("memory".to_string(), Quantity(memory.clone()));
    }
    if let Some(ephemeral) = &ephemeral {
        limits.insert("ephemeral-storage".to_string(), Quantity(ephemeral.clone()));
    }

    ResourceRequirements {
        limits: if limits.is_empty() { None } else { Some(limits.clone()) },
        requests: if limits.is_empty() { None } else { Some(limits) },
        claims: None,
    }
}

fn resolve_writable_paths(spec: &SandboxSpec, profile: Option<&SandboxProfileSpec>) -> Vec<String> {
    if !spec.filesystem.writable_paths.is_empty() {
        return spec.filesystem.writable_paths.clone();
    }
    profile
        .map(|p| p.filesystem.writable_paths.clone())
        .unwrap_or_default()
}

fn sanitize_label(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{FilesystemPolicy, ResourceSpec};

    fn runtime() -> RuntimeEnvironmentSpec {
        RuntimeEnvironmentSpec {
            language: "python".into(),
            version: "3.10".into(),
            image: "llmsafespace/python:3.10".into(),
            ..Default::default()
        }
    }

    #[test]
    fn standard_security_level_has_no_runtime_class() {
        let spec = SandboxSpec {
            runtime: "python:3.10".into(),
            security_level: SecurityLevel::Standard,
            ..Default::default()
        };
        let pod = build_pod("sb-1", "uid-1", "tenant-a", &spec, &runtime(), None);
        assert!(pod.spec.unwrap().runtime_class_name.is_none());
    }

    #[test]
    fn high_security_level_uses_gvisor() {
        let spec = SandboxSpec {
            runtime: "python:3.10".into(),
            security_level: SecurityLevel::High,
            ..Default::default()
        };
        let pod = build_pod("sb-2", "uid-2", "tenant-a", &spec, &runtime(), None);
        assert_eq!(
            pod.spec.unwrap().runtime_class_name.as_deref(),
            Some(GVISOR_RUNTIME_CLASS)
        );
    }

    #[test]
    fn custom_security_level_behaves_like_standard_without_profile_ref() {
        let spec = SandboxSpec {
            runtime: "python:3.10".into(),
            security_level: SecurityLevel::Custom,
            profile_ref: None,
            ..Default::default()
        };
        let pod = build_pod("sb-3", "uid-3", "tenant-a", &spec, &runtime(), None);
        assert!(pod.spec.unwrap().runtime_class_name.is_none());
    }

    #[test]
    fn read_only_root_defaults_true() {
        let spec = SandboxSpec {
            runtime: "python:3.10".into(),
            ..Default::default()
        };
        let pod = build_pod("sb-4", "uid-4", "tenant-a", &spec, &runtime(), None);
        let container = &pod.spec.unwrap().containers[0];
        assert_eq!(
            container.security_context.as_ref().unwrap().read_only_root_filesystem,
            Some(true)
        );
    }

    #[test]
    fn writable_paths_become_mounted_volumes() {
        let spec = SandboxSpec {
            runtime: "python:3.10".into(),
            filesystem: FilesystemPolicy {
                read_only_root: Some(true),
                writable_paths: vec!["/workspace".into(), "/tmp/scratch".into()],
            },
            ..Default::default()
        };
        let pod = build_pod("sb-5", "uid-5", "tenant-a", &spec, &runtime(), None);
        let pod_spec = pod.spec.unwrap();
        assert_eq!(pod_spec.volumes.as_ref().unwrap().len(), 2);
        let mounts = pod_spec.containers[0].volume_mounts.as_ref().unwrap();
        assert_eq!(mounts.len(), 2);
        assert!(mounts.iter().any(|m| m.mount_path == "/workspace"));
    }

    #[test]
    fn profile_supplies_defaults_when_spec_omits_resources() {
        let spec = SandboxSpec {
            runtime: "python:3.10".into(),
            ..Default::default()
        };
        let profile = SandboxProfileSpec {
            default_resources: ResourceSpec {
                cpu: Some("500m".into()),
                memory: Some("256Mi".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let pod = build_pod("sb-6", "uid-6", "tenant-a", &spec, &runtime(), Some(&profile));
        let resources = pod.spec.unwrap().containers[0].resources.clone().unwrap();
        assert_eq!(
            resources.limits.unwrap().get("cpu"),
            Some(&Quantity("500m".to_string()))
        );
    }

    #[test]
    fn owner_reference_points_at_the_sandbox() {
        let spec = SandboxSpec {
            runtime: "python:3.10".into(),
            ..Default::default()
        };
        let pod = build_pod("sb-7", "uid-7", "tenant-a", &spec, &runtime(), None);
        let owner = &pod.metadata.owner_references.unwrap()[0];
        assert_eq!(owner.kind, "Sandbox");
        assert_eq!(owner.name, "sb-7");
        assert_eq!(owner.uid, "uid-7");
    }
}
