//! `SandboxProfile`: a named policy template referenced by `profileRef`.
//! Immutability once referenced by a live Sandbox would be enforced by an
//! admission webhook; this module only models the data, not that
//! enforcement.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{FilesystemPolicy, NetworkAccess, ResourceSpec};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "llmsafespace.dev",
    version = "v1",
    kind = "SandboxProfile",
    plural = "sandboxprofiles",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SandboxProfileSpec {
    #[serde(default)]
    pub default_resources: ResourceSpec,
    #[serde(default)]
    pub network_access: NetworkAccess,
    #[serde(default)]
    pub filesystem: FilesystemPolicy,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_installed_packages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seccomp_profile_path: Option<String>,
}
