//! `Sandbox`: a request for, and the observed state of, a single live
//! sandbox pod.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{
    Condition, FilesystemPolicy, NetworkAccess, ResourceSpec, ResourceUsage, SecurityContextSpec,
    SecurityLevel, StoragePolicy,
};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "llmsafespace.dev",
    version = "v1",
    kind = "Sandbox",
    plural = "sandboxes",
    status = "SandboxStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSpec {
    pub runtime: String,
    #[serde(default)]
    pub security_level: SecurityLevel,
    #[serde(default)]
    pub timeout_sec: u64,
    #[serde(default)]
    pub resources: ResourceSpec,
    #[serde(default)]
    pub network_access: NetworkAccess,
    #[serde(default)]
    pub filesystem: FilesystemPolicy,
    #[serde(default)]
    pub storage: StoragePolicy,
    #[serde(default)]
    pub security_context: SecurityContextSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_ref: Option<String>,
    /// Not part of the wire spec's persisted object — set by the (external)
    /// API layer when translating `POST /sandboxes {useWarmPool}` into a
    /// `Sandbox`; the allocator is only consulted when this is true.
    #[serde(default = "default_use_warm_pool")]
    pub use_warm_pool: bool,
}

fn default_use_warm_pool() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum SandboxPhase {
    #[default]
    Pending,
    Creating,
    Running,
    Terminating,
    Terminated,
    Failed,
}

impl SandboxPhase {
    /// The ordinal used to check monotonicity: the observed phase
    /// sequence is a prefix of
    /// `[Pending, Creating, Running, Terminating, Terminated]`, or
    /// terminates with `Failed` from any earlier phase, with the single
    /// explicit exception `Running -> Pending` (pod observed missing).
    fn rank(self) -> u8 {
        match self {
            SandboxPhase::Pending => 0,
            SandboxPhase::Creating => 1,
            SandboxPhase::Running => 2,
            SandboxPhase::Terminating => 3,
            SandboxPhase::Terminated => 4,
            SandboxPhase::Failed => 5,
        }
    }

    /// Is `next` a legal transition from `self`? The fallback to `Pending`
    /// on an observed-missing pod can fire from either `Creating` or
    /// `Running` — both are the same underlying condition, the backing pod
    /// having disappeared.
    pub fn can_transition_to(self, next: SandboxPhase) -> bool {
        if next == SandboxPhase::Failed {
            return self != SandboxPhase::Terminated && self != SandboxPhase::Failed;
        }
        if next == SandboxPhase::Pending && matches!(self, SandboxPhase::Creating | SandboxPhase::Running) {
            return true;
        }
        next.rank() >= self.rank()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatus {
    #[serde(default)]
    pub phase: SandboxPhase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<ResourceUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warm_pod_ref: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use SandboxPhase::*;

    #[test]
    fn forward_progression_is_legal() {
        assert!(Pending.can_transition_to(Creating));
        assert!(Creating.can_transition_to(Running));
        assert!(Running.can_transition_to(Terminating));
        assert!(Terminating.can_transition_to(Terminated));
    }

    #[test]
    fn pod_observed_missing_falls_back_to_pending_from_creating_or_running() {
        assert!(Running.can_transition_to(Pending));
        assert!(Creating.can_transition_to(Pending));
        assert!(!Terminating.can_transition_to(Pending));
    }

    #[test]
    fn failed_is_reachable_from_any_non_terminal_phase() {
        assert!(Pending.can_transition_to(Failed));
        assert!(Creating.can_transition_to(Failed));
        assert!(Running.can_transition_to(Failed));
        assert!(Terminating.can_transition_to(Failed));
    }

    #[test]
    fn terminal_phases_never_transition_to_failed() {
        assert!(!Terminated.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Failed));
    }

    #[test]
    fn backward_transitions_other_than_the_exception_are_illegal() {
        assert!(!Terminated.can_transition_to(Running));
        assert!(!Running.can_transition_to(Creating));
    }

    #[test]
    fn self_transition_is_legal_idempotent_reconcile() {
        assert!(Running.can_transition_to(Running));
    }

    #[test]
    fn use_warm_pool_defaults_true_on_missing_field() {
        let spec: SandboxSpec = serde_json::from_str(r#"{"runtime":"python:3.10"}"#).unwrap();
        assert!(spec.use_warm_pool);
    }
}
