//! `WarmPod`: a single prewarmed pod, either still filling a pool or
//! already pinned to a Sandbox.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "llmsafespace.dev",
    version = "v1",
    kind = "WarmPod",
    plural = "warmpods",
    status = "WarmPodStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct WarmPodSpec {
    pub pool_ref: String,
    pub creation_timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum WarmPodPhase {
    #[default]
    Pending,
    Ready,
    Assigned,
    Terminating,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WarmPodStatus {
    #[serde(default)]
    pub phase: WarmPodPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<String>,
}

impl WarmPodStatus {
    /// Exactly one transition `Ready -> Assigned` per WarmPod lifetime —
    /// once `assigned_to` is set it is never cleared by the same object (a
    /// recycle creates a brand-new `WarmPod`).
    pub fn is_pinned(&self) -> bool {
        self.assigned_to.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshly_created_warmpod_is_unpinned() {
        assert!(!WarmPodStatus::default().is_pinned());
    }

    #[test]
    fn assigned_to_marks_pinned() {
        let status = WarmPodStatus {
            phase: WarmPodPhase::Assigned,
            assigned_to: Some("sandbox-1".into()),
            assigned_at: Some("2026-01-01T00:00:00Z".into()),
            ..Default::default()
        };
        assert!(status.is_pinned());
    }
}
