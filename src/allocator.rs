//! The concrete [`Allocator`](crate::capabilities::Allocator): matches a
//! Sandbox to a `Ready` WarmPod and atomically pins it via a conditional
//! status patch, retrying on conflict against a freshly-listed candidate.

use async_trait::async_trait;
use k8s_openapi::chrono::Utc;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client};

use crate::capabilities::{Allocator, AllocatedWarmPod};
use crate::crd::{SecurityLevel, WarmPod, WarmPodPhase};
use crate::error::{Error, Result};
use crate::metrics::Metrics;

pub struct WarmPodAllocator {
    client: Client,
    metrics: Metrics,
}

impl WarmPodAllocator {
    pub fn new(client: Client, metrics: Metrics) -> Self {
        Self { client, metrics }
    }
}

#[async_trait]
impl Allocator for WarmPodAllocator {
    async fn try_allocate(
        &self,
        namespace: &str,
        sandbox_name: &str,
        runtime: &str,
        security_level: SecurityLevel,
    ) -> Result<AllocatedWarmPod> {
        let api: Api<WarmPod> = Api::namespaced(self.client.clone(), namespace);

        let selector = format!(
            "llmsafespace.dev/runtime={},llmsafespace.dev/security-level={}",
            sanitize(runtime),
            security_level_label(security_level),
        );
        let candidates = api
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(Error::Kube)?;

        let mut ready: Vec<WarmPod> = candidates
            .items
            .into_iter()
            .filter(|wp| wp.status.as_ref().is_some_and(|s| s.phase == WarmPodPhase::Ready && !s.is_pinned()))
            .collect();

        // Oldest first, then by name, so concurrent allocators racing for
        // the same pool tend to converge on the same ordering and only
        // collide on the single oldest candidate rather than thrashing
        // across the whole list.
        ready.sort_by(|a, b| {
            let ts_a = a.metadata.creation_timestamp.as_ref().map(|t| t.0);
            let ts_b = b.metadata.creation_timestamp.as_ref().map(|t| t.0);
            ts_a.cmp(&ts_b).then_with(|| a.metadata.name.cmp(&b.metadata.name))
        });

        for candidate in ready {
            let Some(name) = candidate.metadata.name.clone() else { continue };
            let Some(resource_version) = candidate.metadata.resource_version.clone() else { continue };
            let Some(status) = &candidate.status else { continue };
            let (Some(pod_name), Some(pod_namespace)) = (status.pod_name.clone(), status.pod_namespace.clone()) else {
                continue;
            };

            let patch = serde_json::json!({
                "apiVersion": "llmsafespace.dev/v1",
                "kind": "WarmPod",
                "metadata": { "resourceVersion": resource_version },
                "status": {
                    "phase": "Assigned",
                    "assignedTo": sandbox_name,
                    "assignedAt": Utc::now().to_rfc3339(),
                }
            });

            match api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch)).await {
                Ok(_) => {
                    self.metrics.warm_pool_hit_total.with_label_values(&[runtime]).inc();
                    return Ok(AllocatedWarmPod {
                        warm_pod_name: name,
                        pod_name,
                        pod_namespace,
                    });
                }
                Err(kube::Error::Api(e)) if e.code == 409 => continue,
                Err(e) => return Err(Error::Kube(e)),
            }
        }

        self.metrics.warm_pool_miss_total.with_label_values(&[runtime]).inc();
        Err(Error::NoWarmPod)
    }
}

pub(crate) fn security_level_label(level: SecurityLevel) -> &'static str {
    match level {
        SecurityLevel::Standard => "standard",
        SecurityLevel::High => "high",
        SecurityLevel::Custom => "custom",
    }
}

pub(crate) fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_level_labels_are_lowercase() {
        assert_eq!(security_level_label(SecurityLevel::Standard), "standard");
        assert_eq!(security_level_label(SecurityLevel::High), "high");
        assert_eq!(security_level_label(SecurityLevel::Custom), "custom");
    }

    #[test]
    fn sanitize_replaces_colon() {
        assert_eq!(sanitize("python:3.10"), "python-3.10");
    }
}
