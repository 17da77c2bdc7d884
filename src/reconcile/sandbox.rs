//! The Sandbox state machine: finalizer check, deletion branch, status
//! patch via `patch_status`, dispatched across a five-phase state machine.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, Client, ResourceExt};
use tracing::{info, warn};

use crate::capabilities::{AllocatedWarmPod, Allocator, Clock};
use crate::crd::{
    set_condition, Condition, ConditionStatus, RuntimeEnvironment, Sandbox, SandboxPhase, SandboxProfile,
    SandboxStatus, WarmPod,
};
use crate::error::Reason;
use crate::metrics::Metrics;
use crate::pod_spec;
use crate::reconcile::retry::with_conflict_retry;

pub const FINALIZER: &str = "llmsafespace.dev/sandbox-cleanup";
const RECYCLABLE_ANNOTATION: &str = "llmsafespace.dev/recyclable";
const REQUEUE_FAST: std::time::Duration = std::time::Duration::from_secs(2);
const REQUEUE_SLOW: std::time::Duration = std::time::Duration::from_secs(10);

pub struct SandboxCtx {
    pub client: Client,
    pub metrics: Metrics,
    pub allocator: Arc<dyn Allocator>,
    pub clock: Arc<dyn Clock>,
}

pub async fn reconcile(sandbox: Arc<Sandbox>, ctx: Arc<SandboxCtx>) -> Result<Action, kube::Error> {
    let name = sandbox.name_any();
    let namespace = sandbox.namespace().unwrap_or_default();
    ctx.metrics.sandbox_reconcile_total.inc();
    let _timer = ctx.metrics.sandbox_reconcile_duration_seconds.start_timer();

    if sandbox.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&sandbox, &ctx).await;
    }

    if !has_finalizer(&sandbox) {
        add_finalizer(&sandbox, &ctx.client, &namespace, &name).await?;
        return Ok(Action::requeue(std::time::Duration::from_millis(1)));
    }

    let phase = sandbox.status.as_ref().map(|s| s.phase).unwrap_or_default();
    let result = match phase {
        SandboxPhase::Pending => on_pending(&sandbox, &ctx, &namespace, &name).await,
        SandboxPhase::Creating => on_creating(&sandbox, &ctx, &namespace, &name).await,
        SandboxPhase::Running => on_running(&sandbox, &ctx, &namespace, &name).await,
        SandboxPhase::Terminating => on_terminating(&sandbox, &ctx, &namespace, &name).await,
        SandboxPhase::Terminated | SandboxPhase::Failed => Ok(Action::await_change()),
    };

    if result.is_err() {
        ctx.metrics.sandbox_reconcile_errors_total.inc();
    }
    result
}

pub fn error_policy(_sandbox: Arc<Sandbox>, error: &kube::Error, ctx: Arc<SandboxCtx>) -> Action {
    ctx.metrics.sandbox_reconcile_errors_total.inc();
    warn!(error = %error, "sandbox_reconcile_error");
    Action::requeue(std::time::Duration::from_secs(30))
}

async fn on_pending(sandbox: &Sandbox, ctx: &SandboxCtx, namespace: &str, name: &str) -> Result<Action, kube::Error> {
    if sandbox.spec.use_warm_pool {
        match ctx
            .allocator
            .try_allocate(namespace, name, &sandbox.spec.runtime, sandbox.spec.security_level)
            .await
        {
            Ok(AllocatedWarmPod { warm_pod_name, pod_name, pod_namespace }) => {
                mark_recyclable(&ctx.client, namespace, name).await?;
                patch_status(ctx, namespace, name, |status| {
                    status.phase = SandboxPhase::Creating;
                    status.pod_name = Some(pod_name.clone());
                    status.pod_namespace = Some(pod_namespace.clone());
                    status.warm_pod_ref = Some(warm_pod_name.clone());
                    set_condition(
                        &mut status.conditions,
                        Condition {
                            type_: "Ready".into(),
                            status: ConditionStatus::Unknown,
                            reason: Reason::PodCreated,
                            message: Some("adopted warm pod".into()),
                            last_transition_time: ctx.clock.now().to_rfc3339(),
                        },
                    );
                })
                .await?;
                return Ok(Action::requeue(REQUEUE_FAST));
            }
            Err(e) if e.kind() == crate::error::ErrorKind::NoWarmPod => {}
            Err(e) => {
                warn!(error = %e, "allocator_error");
            }
        }
    }

    let runtime_env = fetch_runtime_environment(ctx, namespace, &sandbox.spec.runtime).await;
    let profile = fetch_profile(ctx, namespace, sandbox.spec.profile_ref.as_deref()).await;
    let Some(runtime_env) = runtime_env else {
        return Ok(Action::requeue(REQUEUE_SLOW));
    };

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
    let sandbox_uid = sandbox.uid().unwrap_or_default();
    let pod = pod_spec::build_pod(name, &sandbox_uid, namespace, &sandbox.spec, &runtime_env, profile.as_ref());
    let pod_name = pod.metadata.name.clone().unwrap_or_default();

    match pods.create(&Default::default(), &pod).await {
        Ok(_) | Err(kube::Error::Api(kube::core::ErrorResponse { code: 409, .. })) => {
            patch_status(ctx, namespace, name, |status| {
                status.phase = SandboxPhase::Creating;
                status.pod_name = Some(pod_name.clone());
                status.pod_namespace = Some(namespace.to_string());
                set_condition(
                    &mut status.conditions,
                    Condition {
                        type_: "Ready".into(),
                        status: ConditionStatus::Unknown,
                        reason: Reason::PodCreated,
                        message: None,
                        last_transition_time: ctx.clock.now().to_rfc3339(),
                    },
                );
            })
            .await?;
            Ok(Action::requeue(REQUEUE_FAST))
        }
        Err(e) => {
            warn!(error = %e, "pod_create_failed");
            patch_status(ctx, namespace, name, |status| {
                set_condition(
                    &mut status.conditions,
                    Condition {
                        type_: "Ready".into(),
                        status: ConditionStatus::False,
                        reason: Reason::PodCreationFailed,
                        message: Some(e.to_string()),
                        last_transition_time: ctx.clock.now().to_rfc3339(),
                    },
                );
            })
            .await?;
            Ok(Action::requeue(REQUEUE_SLOW))
        }
    }
}

async fn on_creating(sandbox: &Sandbox, ctx: &SandboxCtx, namespace: &str, name: &str) -> Result<Action, kube::Error> {
    let Some(pod_name) = sandbox.status.as_ref().and_then(|s| s.pod_name.clone()) else {
        return Ok(Action::requeue(REQUEUE_FAST));
    };
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);

    match pods.get_opt(&pod_name).await? {
        None => {
            patch_status(ctx, namespace, name, |status| {
                status.phase = SandboxPhase::Pending;
                status.pod_name = None;
            })
            .await?;
            Ok(Action::requeue(REQUEUE_FAST))
        }
        Some(pod) if pod_is_ready(&pod) => {
            patch_status(ctx, namespace, name, |status| {
                status.phase = SandboxPhase::Running;
                status.start_time = Some(ctx.clock.now().to_rfc3339());
                status.endpoint = Some(format!("{name}.{namespace}.svc.cluster.local"));
                set_condition(
                    &mut status.conditions,
                    Condition {
                        type_: "Ready".into(),
                        status: ConditionStatus::True,
                        reason: Reason::PodRunning,
                        message: None,
                        last_transition_time: ctx.clock.now().to_rfc3339(),
                    },
                );
            })
            .await?;
            Ok(Action::requeue(REQUEUE_FAST))
        }
        Some(_) => Ok(Action::requeue(REQUEUE_FAST)),
    }
}

async fn on_running(sandbox: &Sandbox, ctx: &SandboxCtx, namespace: &str, name: &str) -> Result<Action, kube::Error> {
    let Some(pod_name) = sandbox.status.as_ref().and_then(|s| s.pod_name.clone()) else {
        return Ok(Action::requeue(REQUEUE_FAST));
    };
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);

    if pods.get_opt(&pod_name).await?.is_none() {
        patch_status(ctx, namespace, name, |status| {
            status.phase = SandboxPhase::Pending;
            status.pod_name = None;
            set_condition(
                &mut status.conditions,
                Condition {
                    type_: "Ready".into(),
                    status: ConditionStatus::False,
                    reason: Reason::PodNotRunning,
                    message: Some("pod disappeared".into()),
                    last_transition_time: ctx.clock.now().to_rfc3339(),
                },
            );
        })
        .await?;
        return Ok(Action::requeue(REQUEUE_FAST));
    }

    let start_time = sandbox.status.as_ref().and_then(|s| s.start_time.as_deref());
    if has_timed_out(start_time, sandbox.spec.timeout_sec, ctx.clock.now()) {
        patch_status(ctx, namespace, name, |status| {
            status.phase = SandboxPhase::Terminating;
        })
        .await?;
        return Ok(Action::requeue(REQUEUE_FAST));
    }

    Ok(Action::requeue(REQUEUE_SLOW))
}

async fn on_terminating(sandbox: &Sandbox, ctx: &SandboxCtx, namespace: &str, name: &str) -> Result<Action, kube::Error> {
    let pod_name = sandbox.status.as_ref().and_then(|s| s.pod_name.clone());
    if let Some(pod_name) = &pod_name {
        let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
        match pods.delete(pod_name, &Default::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e),
        }
        if pods.get_opt(pod_name).await?.is_some() {
            return Ok(Action::requeue(REQUEUE_FAST));
        }
    }

    patch_status(ctx, namespace, name, |status| {
        status.phase = SandboxPhase::Terminated;
    })
    .await?;
    remove_finalizer(sandbox, &ctx.client, namespace, name).await?;
    Ok(Action::await_change())
}

async fn handle_deletion(sandbox: &Sandbox, ctx: &SandboxCtx) -> Result<Action, kube::Error> {
    let name = sandbox.name_any();
    let namespace = sandbox.namespace().unwrap_or_default();

    let recyclable = sandbox
        .annotations()
        .get(RECYCLABLE_ANNOTATION)
        .is_some_and(|v| v == "true");

    if recyclable {
        if let Some(warm_pod_name) = sandbox.status.as_ref().and_then(|s| s.warm_pod_ref.clone()) {
            let warmpods: Api<WarmPod> = Api::namespaced(ctx.client.clone(), &namespace);
            let patch = serde_json::json!({ "status": { "phase": "Terminating" } });
            let _ = with_conflict_retry(|| async {
                warmpods.patch_status(&warm_pod_name, &PatchParams::default(), &Patch::Merge(&patch)).await
            })
            .await;
            info!(warmpod = %warm_pod_name, "warmpod_marked_terminating_on_sandbox_delete");
        }
    } else if let Some(pod_name) = sandbox.status.as_ref().and_then(|s| s.pod_name.clone()) {
        let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
        match pods.delete(&pod_name, &Default::default()).await {
            Ok(_) | Err(kube::Error::Api(kube::core::ErrorResponse { code: 404, .. })) => {}
            Err(e) => return Err(e),
        }
    }

    if has_finalizer(sandbox) {
        remove_finalizer(sandbox, &ctx.client, &namespace, &name).await?;
    }
    Ok(Action::await_change())
}

/// `now - startTime >= timeoutSec`. `timeout_sec == 0` means no deadline.
pub fn has_timed_out(start_time: Option<&str>, timeout_sec: u64, now: DateTime<Utc>) -> bool {
    if timeout_sec == 0 {
        return false;
    }
    let Some(start_time) = start_time else { return false };
    let Ok(parsed) = DateTime::parse_from_rfc3339(start_time) else { return false };
    now.signed_duration_since(parsed.with_timezone(&Utc)) >= chrono::Duration::seconds(timeout_sec as i64)
}

fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|p| p == "Running")
}

fn has_finalizer(sandbox: &Sandbox) -> bool {
    sandbox.metadata.finalizers.as_ref().is_some_and(|f| f.iter().any(|s| s == FINALIZER))
}

async fn add_finalizer(sandbox: &Sandbox, client: &Client, namespace: &str, name: &str) -> Result<(), kube::Error> {
    let api: Api<Sandbox> = Api::namespaced(client.clone(), namespace);
    let mut finalizers = sandbox.metadata.finalizers.clone().unwrap_or_default();
    finalizers.push(FINALIZER.to_string());
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(name, &PatchParams::apply("llmsafespace-sandbox-controller"), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

async fn remove_finalizer(sandbox: &Sandbox, client: &Client, namespace: &str, name: &str) -> Result<(), kube::Error> {
    let api: Api<Sandbox> = Api::namespaced(client.clone(), namespace);
    let finalizers: Vec<String> = sandbox
        .metadata
        .finalizers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|f| f != FINALIZER)
        .collect();
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(name, &PatchParams::apply("llmsafespace-sandbox-controller"), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Marks a Sandbox adopted from a WarmPool so `handle_deletion` recycles the
/// backing pod into the pool instead of deleting it outright.
async fn mark_recyclable(client: &Client, namespace: &str, name: &str) -> Result<(), kube::Error> {
    let api: Api<Sandbox> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "metadata": { "annotations": { "llmsafespace.dev/recyclable": "true" } } });
    api.patch(name, &PatchParams::apply("llmsafespace-sandbox-controller"), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

async fn patch_status(
    ctx: &SandboxCtx,
    namespace: &str,
    name: &str,
    mutate: impl Fn(&mut SandboxStatus),
) -> Result<(), kube::Error> {
    let api: Api<Sandbox> = Api::namespaced(ctx.client.clone(), namespace);
    with_conflict_retry(|| async {
        let current = api.get(name).await?;
        let mut status = current.status.clone().unwrap_or_default();
        mutate(&mut status);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::apply("llmsafespace-sandbox-controller"), &Patch::Merge(&patch))
            .await
    })
    .await?;
    Ok(())
}

async fn fetch_runtime_environment(ctx: &SandboxCtx, namespace: &str, runtime: &str) -> Option<crate::crd::RuntimeEnvironmentSpec> {
    let api: Api<RuntimeEnvironment> = Api::namespaced(ctx.client.clone(), namespace);
    api.get_opt(runtime).await.ok().flatten().map(|r| r.spec)
}

async fn fetch_profile(ctx: &SandboxCtx, namespace: &str, profile_ref: Option<&str>) -> Option<crate::crd::SandboxProfileSpec> {
    let name = profile_ref?;
    let api: Api<SandboxProfile> = Api::namespaced(ctx.client.clone(), namespace);
    api.get_opt(name).await.ok().flatten().map(|p| p.spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn zero_timeout_never_expires() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert!(!has_timed_out(Some("2025-01-01T00:00:00Z"), 0, now));
    }

    #[test]
    fn expires_once_elapsed_meets_timeout() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let now = start + chrono::Duration::seconds(300);
        assert!(has_timed_out(Some(&start.to_rfc3339()), 300, now));
    }

    #[test]
    fn does_not_expire_before_timeout() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let now = start + chrono::Duration::seconds(299);
        assert!(!has_timed_out(Some(&start.to_rfc3339()), 300, now));
    }

    #[test]
    fn missing_start_time_never_expires() {
        let now = Utc::now();
        assert!(!has_timed_out(None, 300, now));
    }
}
