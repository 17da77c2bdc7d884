//! `WarmPod` lifecycle: `Pending -> Ready -> Assigned -> Terminating`, TTL
//! expiry, and the atomic readiness gate. Mirrors the structure of
//! [`crate::reconcile::sandbox`] — per-phase handler functions, a shared
//! `patch_status` helper through [`crate::reconcile::retry::with_conflict_retry`] —
//! since both reconcilers own a single backing pod through the same
//! create/observe/delete cycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, Client, Resource, ResourceExt};

use crate::crd::{RuntimeEnvironmentSpec, SandboxProfileSpec, WarmPod, WarmPodPhase, WarmPodStatus, WarmPool};
use crate::metrics::Metrics;
use crate::pod_spec;
use crate::podexec;
use crate::reconcile::retry::with_conflict_retry;

pub const FINALIZER: &str = "llmsafespace.dev/warmpod-cleanup";

const REQUEUE_FAST: Duration = Duration::from_secs(2);
const REQUEUE_SLOW: Duration = Duration::from_secs(10);
const READINESS_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct WarmPodCtx {
    pub client: Client,
    pub metrics: Metrics,
}

pub async fn reconcile(warm_pod: Arc<WarmPod>, ctx: Arc<WarmPodCtx>) -> Result<Action, kube::Error> {
    ctx.metrics.warmpod_reconcile_total.inc();

    let namespace = warm_pod.namespace().unwrap_or_default();
    let name = warm_pod.name_any();

    if warm_pod.meta().deletion_timestamp.is_some() {
        return handle_deletion(&namespace, &name, &ctx).await;
    }

    if !has_finalizer(&warm_pod) {
        add_finalizer(&ctx.client, &namespace, &name).await?;
        return Ok(Action::requeue(REQUEUE_FAST));
    }

    let status = warm_pod.status.clone().unwrap_or_default();
    match status.phase {
        WarmPodPhase::Pending => on_pending(&warm_pod, &namespace, &name, &ctx).await,
        WarmPodPhase::Ready => on_ready(&warm_pod, &namespace, &name, &ctx).await,
        WarmPodPhase::Assigned => on_assigned(&warm_pod, &namespace, &name, &ctx).await,
        WarmPodPhase::Terminating => on_terminating(&status, &namespace, &name, &ctx).await,
    }
}

pub fn error_policy(_warm_pod: Arc<WarmPod>, _error: &kube::Error, _ctx: Arc<WarmPodCtx>) -> Action {
    Action::requeue(Duration::from_secs(30))
}

async fn on_pending(warm_pod: &WarmPod, namespace: &str, name: &str, ctx: &WarmPodCtx) -> Result<Action, kube::Error> {
    let pools: Api<WarmPool> = Api::namespaced(ctx.client.clone(), namespace);
    let Some(pool) = pools.get_opt(&warm_pod.spec.pool_ref).await? else {
        // Pool was deleted out from under a still-filling pod; nothing to
        // back this WarmPod with, so let it terminate.
        patch_status(ctx, namespace, name, |s| s.phase = WarmPodPhase::Terminating).await?;
        return Ok(Action::requeue(REQUEUE_FAST));
    };

    let pod_name = format!("warmpod-{name}");
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);

    match pods.get_opt(&pod_name).await? {
        None => {
            let runtime = fetch_runtime_environment(ctx, namespace, &pool.spec.runtime).await?;
            let profile = fetch_profile(ctx, namespace, pool.spec.profile_ref.as_deref()).await?;
            let pod = pod_spec::build_warm_pod_pod(
                name,
                &warm_pod.uid().unwrap_or_default(),
                namespace,
                &pool.spec,
                &runtime,
                profile.as_ref(),
            );
            match pods.create(&Default::default(), &pod).await {
                Ok(_) => {}
                Err(kube::Error::Api(e)) if e.code == 409 => {}
                Err(e) => return Err(e),
            }
            patch_status(ctx, namespace, name, |s| {
                s.pod_name = Some(pod_name.clone());
                s.pod_namespace = Some(namespace.to_string());
            })
            .await?;
            Ok(Action::requeue(REQUEUE_FAST))
        }
        Some(pod) if pod_is_running(&pod) => {
            if sentinel_ready(&ctx.client, namespace, &pod_name).await {
                patch_status(ctx, namespace, name, |s| s.phase = WarmPodPhase::Ready).await?;
                Ok(Action::requeue(REQUEUE_SLOW))
            } else {
                Ok(Action::requeue(REQUEUE_FAST))
            }
        }
        Some(_) => Ok(Action::requeue(REQUEUE_FAST)),
    }
}

async fn on_ready(warm_pod: &WarmPod, namespace: &str, name: &str, ctx: &WarmPodCtx) -> Result<Action, kube::Error> {
    let status = warm_pod.status.clone().unwrap_or_default();
    if status.is_pinned() {
        // Allocator raced us between list and patch; converge on Assigned.
        patch_status(ctx, namespace, name, |s| s.phase = WarmPodPhase::Assigned).await?;
        return Ok(Action::requeue(REQUEUE_FAST));
    }

    if ttl_expired(&warm_pod.spec.creation_timestamp, pool_ttl_sec(ctx, namespace, &warm_pod.spec.pool_ref).await, Utc::now()) {
        patch_status(ctx, namespace, name, |s| s.phase = WarmPodPhase::Terminating).await?;
        return Ok(Action::requeue(REQUEUE_FAST));
    }

    let Some(pod_name) = status.pod_name.clone() else {
        patch_status(ctx, namespace, name, |s| s.phase = WarmPodPhase::Terminating).await?;
        return Ok(Action::requeue(REQUEUE_FAST));
    };
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
    match pods.get_opt(&pod_name).await? {
        Some(pod) if pod_is_running(&pod) => {
            patch_status(ctx, namespace, name, |s| s.last_heartbeat_now()).await?;
            Ok(Action::requeue(REQUEUE_SLOW))
        }
        _ => {
            patch_status(ctx, namespace, name, |s| s.phase = WarmPodPhase::Terminating).await?;
            Ok(Action::requeue(REQUEUE_FAST))
        }
    }
}

/// Assigned WarmPods are owned observably by the Sandbox they were pinned
/// to; this reconciler only watches for the backing pod disappearing out
/// from under the assignment so the object doesn't linger forever as a
/// phantom inventory entry.
async fn on_assigned(warm_pod: &WarmPod, namespace: &str, name: &str, ctx: &WarmPodCtx) -> Result<Action, kube::Error> {
    let status = warm_pod.status.clone().unwrap_or_default();
    let Some(pod_name) = status.pod_name.clone() else {
        return Ok(Action::requeue(REQUEUE_SLOW));
    };
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
    if pods.get_opt(&pod_name).await?.is_none() {
        patch_status(ctx, namespace, name, |s| s.phase = WarmPodPhase::Terminating).await?;
        return Ok(Action::requeue(REQUEUE_FAST));
    }
    Ok(Action::requeue(REQUEUE_SLOW))
}

async fn on_terminating(status: &WarmPodStatus, namespace: &str, name: &str, ctx: &WarmPodCtx) -> Result<Action, kube::Error> {
    if let Some(pod_name) = &status.pod_name {
        let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
        match pods.delete(pod_name, &Default::default()).await {
            Ok(_) => return Ok(Action::requeue(REQUEUE_FAST)),
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e),
        }
    }
    remove_finalizer(&ctx.client, namespace, name).await?;
    ctx.metrics.warmpod_recycled_total.inc();
    Ok(Action::await_change())
}

async fn handle_deletion(namespace: &str, name: &str, ctx: &WarmPodCtx) -> Result<Action, kube::Error> {
    let warm_pods: Api<WarmPod> = Api::namespaced(ctx.client.clone(), namespace);
    if let Some(wp) = warm_pods.get_opt(name).await? {
        if let Some(pod_name) = wp.status.as_ref().and_then(|s| s.pod_name.clone()) {
            let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
            match pods.delete(&pod_name, &Default::default()).await {
                Ok(_) | Err(kube::Error::Api(_)) => {}
                Err(e) => return Err(e),
            }
        }
    }
    remove_finalizer(&ctx.client, namespace, name).await?;
    Ok(Action::await_change())
}

/// Calls the readiness sentinel over the pod's exec channel. A pod
/// reaching `Running` only means the container started, not that
/// preload/warm-up finished. Any exec failure — pod not attachable yet,
/// timeout — is treated as "not ready", never surfaced as a reconcile error.
async fn sentinel_ready(client: &Client, namespace: &str, pod_name: &str) -> bool {
    podexec::exec_collect(
        client,
        namespace,
        pod_name,
        pod_spec::SANDBOX_CONTAINER_NAME,
        &["sh", "-c", podexec::sentinel_check_command()],
        READINESS_CHECK_TIMEOUT,
    )
    .await
    .map(|out| out.exit_code == 0)
    .unwrap_or(false)
}

pub fn ttl_expired(creation_timestamp: &str, ttl_sec: u64, now: DateTime<Utc>) -> bool {
    if ttl_sec == 0 {
        return false;
    }
    let Ok(created) = DateTime::parse_from_rfc3339(creation_timestamp) else {
        return false;
    };
    now.signed_duration_since(created.with_timezone(&Utc)) >= chrono::Duration::seconds(ttl_sec as i64)
}

async fn pool_ttl_sec(ctx: &WarmPodCtx, namespace: &str, pool_name: &str) -> u64 {
    let pools: Api<WarmPool> = Api::namespaced(ctx.client.clone(), namespace);
    pools.get_opt(pool_name).await.ok().flatten().map(|p| p.spec.ttl_sec).unwrap_or(0)
}

fn pod_is_running(pod: &Pod) -> bool {
    pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
}

impl WarmPodStatus {
    fn last_heartbeat_now(&mut self) {
        self.last_heartbeat = Some(Utc::now().to_rfc3339());
    }
}

async fn fetch_runtime_environment(ctx: &WarmPodCtx, namespace: &str, name: &str) -> Result<RuntimeEnvironmentSpec, kube::Error> {
    let api: Api<crate::crd::RuntimeEnvironment> = Api::namespaced(ctx.client.clone(), namespace);
    Ok(api.get(name).await?.spec)
}

async fn fetch_profile(ctx: &WarmPodCtx, namespace: &str, profile_ref: Option<&str>) -> Result<Option<SandboxProfileSpec>, kube::Error> {
    let Some(name) = profile_ref else { return Ok(None) };
    let api: Api<crate::crd::SandboxProfile> = Api::namespaced(ctx.client.clone(), namespace);
    Ok(api.get_opt(name).await?.map(|p| p.spec))
}

fn has_finalizer(warm_pod: &WarmPod) -> bool {
    warm_pod.finalizers().iter().any(|f| f == FINALIZER)
}

async fn add_finalizer(client: &Client, namespace: &str, name: &str) -> Result<(), kube::Error> {
    let api: Api<WarmPod> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "metadata": { "finalizers": [FINALIZER] } });
    api.patch(name, &PatchParams::apply("llmsafespace-warmpod-controller"), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

async fn remove_finalizer(client: &Client, namespace: &str, name: &str) -> Result<(), kube::Error> {
    let api: Api<WarmPod> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "metadata": { "finalizers": [] } });
    match api.patch(name, &PatchParams::apply("llmsafespace-warmpod-controller"), &Patch::Merge(&patch)).await {
        Ok(_) | Err(kube::Error::Api(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

async fn patch_status(ctx: &WarmPodCtx, namespace: &str, name: &str, mutate: impl Fn(&mut WarmPodStatus)) -> Result<(), kube::Error> {
    let api: Api<WarmPod> = Api::namespaced(ctx.client.clone(), namespace);
    with_conflict_retry(|| async {
        let current = api.get(name).await?;
        let mut status = current.status.clone().unwrap_or_default();
        mutate(&mut status);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn zero_ttl_never_expires() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert!(!ttl_expired(&now.to_rfc3339(), 0, now));
    }

    #[test]
    fn expires_once_ttl_elapsed() {
        let created = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let now = created + chrono::Duration::seconds(61);
        assert!(ttl_expired(&created.to_rfc3339(), 60, now));
    }

    #[test]
    fn does_not_expire_before_ttl() {
        let created = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let now = created + chrono::Duration::seconds(30);
        assert!(!ttl_expired(&created.to_rfc3339(), 60, now));
    }

    #[test]
    fn malformed_timestamp_never_expires() {
        let now = Utc::now();
        assert!(!ttl_expired("not-a-timestamp", 60, now));
    }
}
