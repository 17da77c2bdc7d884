//! `WarmPool`: the declarative desired inventory for a runtime/security
//! profile combination.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{AutoScalingPolicy, Condition, ResourceSpec, SecurityLevel};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "llmsafespace.dev",
    version = "v1",
    kind = "WarmPool",
    plural = "warmpools",
    status = "WarmPoolStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct WarmPoolSpec {
    pub runtime: String,
    #[serde(default)]
    pub min_size: u32,
    #[serde(default)]
    pub max_size: u32,
    #[serde(default)]
    pub security_level: SecurityLevel,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preload_packages: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preload_scripts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_ref: Option<String>,
    #[serde(default)]
    pub resources: ResourceSpec,
    #[serde(default)]
    pub auto_scaling: AutoScalingPolicy,
    #[serde(default)]
    pub ttl_sec: u64,
}

impl WarmPoolSpec {
    /// `0 <= minSize <= maxSize` (`maxSize == 0` means "unbounded").
    pub fn is_valid(&self) -> bool {
        self.max_size == 0 || self.min_size <= self.max_size
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WarmPoolStatus {
    #[serde(default)]
    pub available_pods: u32,
    #[serde(default)]
    pub assigned_pods: u32,
    #[serde(default)]
    pub pending_pods: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scale_time: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl WarmPoolStatus {
    /// `available + assigned + pending` equals the number of
    /// non-`Terminating` WarmPods owned by this pool.
    pub fn owned_non_terminating(&self) -> u32 {
        self.available_pods + self.assigned_pods + self.pending_pods
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_le_max_is_valid() {
        let spec = WarmPoolSpec {
            min_size: 2,
            max_size: 5,
            ..Default::default()
        };
        assert!(spec.is_valid());
    }

    #[test]
    fn min_gt_max_is_invalid() {
        let spec = WarmPoolSpec {
            min_size: 6,
            max_size: 5,
            ..Default::default()
        };
        assert!(!spec.is_valid());
    }

    #[test]
    fn zero_max_means_unbounded() {
        let spec = WarmPoolSpec {
            min_size: 100,
            max_size: 0,
            ..Default::default()
        };
        assert!(spec.is_valid());
    }

    #[test]
    fn owned_non_terminating_sums_the_three_counts() {
        let status = WarmPoolStatus {
            available_pods: 3,
            assigned_pods: 2,
            pending_pods: 1,
            ..Default::default()
        };
        assert_eq!(status.owned_non_terminating(), 6);
    }
}
