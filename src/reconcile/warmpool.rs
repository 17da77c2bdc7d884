//! Maintains a WarmPool's declared inventory. The scale decision itself is
//! a pure function over observed counts so the autoscaling/clamping/cooldown
//! arithmetic is unit-testable without a cluster, in the same spirit as
//! `pod_spec::build_pod`.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, Client, ResourceExt};
use tracing::warn;

use crate::capabilities::Clock;
use crate::crd::runtime_environment::is_fresh;
use crate::crd::{set_condition, Condition, ConditionStatus, RuntimeEnvironment, WarmPod, WarmPodPhase, WarmPool, WarmPoolStatus};
use crate::error::Reason;
use crate::metrics::Metrics;
use crate::reconcile::retry::with_conflict_retry;

const REQUEUE_INTERVAL: StdDuration = StdDuration::from_secs(15);
const RUNTIME_ENV_FRESHNESS: chrono::Duration = chrono::Duration::minutes(5);

pub struct WarmPoolCtx {
    pub client: Client,
    pub metrics: Metrics,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Default)]
pub struct ObservedCounts {
    pub available: u32,
    pub assigned: u32,
    pub pending: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScaleAction {
    None,
    ScaleUp(u32),
    ScaleDown(Vec<String>),
}

/// Computes the scale decision from observed inventory. `ready_oldest_first`
/// must already be sorted oldest-first; only their names are needed to
/// build the `ScaleDown` action. Pure: no I/O.
pub fn decide_scale_action(
    spec_min: u32,
    spec_max: u32,
    auto_scaling_enabled: bool,
    target_utilization: u32,
    scale_down_delay_sec: u64,
    counts: &ObservedCounts,
    ready_oldest_first: &[String],
    last_scale_time: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> ScaleAction {
    let effective_min = if auto_scaling_enabled && target_utilization > 0 {
        let target = (counts.assigned as f64 / (target_utilization as f64 / 100.0)).ceil() as u32;
        target.clamp(spec_min, if spec_max == 0 { u32::MAX } else { spec_max })
    } else {
        spec_min
    };

    let deficit = effective_min.saturating_sub(counts.available + counts.pending);
    if deficit > 0 {
        return ScaleAction::ScaleUp(deficit);
    }

    if spec_max > 0 && counts.available > spec_max {
        let cooldown_elapsed = last_scale_time.is_none_or(|t| {
            now.signed_duration_since(t) >= chrono::Duration::seconds(scale_down_delay_sec as i64)
        });
        if !cooldown_elapsed {
            return ScaleAction::None;
        }
        let excess = (counts.available - spec_max) as usize;
        let victims = ready_oldest_first.iter().take(excess).cloned().collect();
        return ScaleAction::ScaleDown(victims);
    }

    ScaleAction::None
}

pub async fn reconcile(pool: Arc<WarmPool>, ctx: Arc<WarmPoolCtx>) -> Result<Action, kube::Error> {
    let name = pool.name_any();
    let namespace = pool.namespace().unwrap_or_default();

    if pool.metadata.deletion_timestamp.is_some() {
        // Owned WarmPods cascade-delete via their own owner references; this
        // reconciler has nothing further to clean up.
        return Ok(Action::await_change());
    }

    let runtime_env: Api<RuntimeEnvironment> = Api::namespaced(ctx.client.clone(), &namespace);
    let frozen = match runtime_env.get_opt(&pool.spec.runtime).await? {
        Some(env) => !is_fresh(env.status.as_ref().and_then(|s| s.last_validated.as_deref()), RUNTIME_ENV_FRESHNESS, ctx.clock.now()),
        None => true,
    };

    let warmpods: Api<WarmPod> = Api::namespaced(ctx.client.clone(), &namespace);
    let owned = warmpods
        .list(&ListParams::default().labels(&format!("llmsafespace.dev/pool={name}")))
        .await?;

    let mut counts = ObservedCounts::default();
    let mut ready_oldest_first: Vec<(DateTime<Utc>, String)> = Vec::new();
    for wp in &owned.items {
        let Some(status) = &wp.status else { continue };
        match status.phase {
            WarmPodPhase::Pending => counts.pending += 1,
            WarmPodPhase::Ready => {
                counts.available += 1;
                if let Some(name) = wp.metadata.name.clone() {
                    let ts = wp.metadata.creation_timestamp.clone().map(|t| t.0).unwrap_or(ctx.clock.now());
                    ready_oldest_first.push((ts, name));
                }
            }
            WarmPodPhase::Assigned => counts.assigned += 1,
            WarmPodPhase::Terminating => {}
        }
    }
    ready_oldest_first.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    let ready_names: Vec<String> = ready_oldest_first.into_iter().map(|(_, n)| n).collect();

    let last_scale_time = pool
        .status
        .as_ref()
        .and_then(|s| s.last_scale_time.as_deref())
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc));

    let action = if frozen {
        ScaleAction::None
    } else {
        decide_scale_action(
            pool.spec.min_size,
            pool.spec.max_size,
            pool.spec.auto_scaling.enabled,
            pool.spec.auto_scaling.target_utilization,
            pool.spec.auto_scaling.scale_down_delay_sec,
            &counts,
            &ready_names,
            last_scale_time,
            ctx.clock.now(),
        )
    };

    let mut new_last_scale_time = last_scale_time;
    match &action {
        ScaleAction::ScaleUp(deficit) => {
            for _ in 0..*deficit {
                let warm_pod = build_warm_pod(&pool, &name);
                match warmpods.create(&Default::default(), &warm_pod).await {
                    Ok(_) => counts.pending += 1,
                    Err(kube::Error::Api(e)) if e.code == 409 => {}
                    Err(e) => warn!(error = %e, "warmpod_create_failed"),
                }
            }
            ctx.metrics.warmpool_scale_actions_total.with_label_values(&[&namespace, &name, "up"]).inc();
            new_last_scale_time = Some(ctx.clock.now());
        }
        ScaleAction::ScaleDown(victims) => {
            for victim in victims {
                let patch = serde_json::json!({ "status": { "phase": "Terminating" } });
                if let Err(e) = warmpods.patch_status(victim, &PatchParams::default(), &Patch::Merge(&patch)).await {
                    warn!(error = %e, warmpod = %victim, "warmpod_scale_down_patch_failed");
                } else {
                    counts.available = counts.available.saturating_sub(1);
                }
            }
            ctx.metrics.warmpool_scale_actions_total.with_label_values(&[&namespace, &name, "down"]).inc();
            new_last_scale_time = Some(ctx.clock.now());
        }
        ScaleAction::None => {}
    }

    ctx.metrics.warmpool_available_pods.with_label_values(&[&namespace, &name]).set(counts.available as i64);
    ctx.metrics.warmpool_assigned_pods.with_label_values(&[&namespace, &name]).set(counts.assigned as i64);
    ctx.metrics.warmpool_pending_pods.with_label_values(&[&namespace, &name]).set(counts.pending as i64);

    let pool_ready = counts.available >= pool.spec.min_size;
    let api: Api<WarmPool> = Api::namespaced(ctx.client.clone(), &namespace);
    with_conflict_retry(|| async {
        let current = api.get(&name).await?;
        let mut status = current.status.clone().unwrap_or_default();
        apply_status(&mut status, &counts, new_last_scale_time, pool_ready, ctx.clock.now());
        let patch = serde_json::json!({ "status": status });
        api.patch_status(&name, &PatchParams::apply("llmsafespace-warmpool-controller"), &Patch::Merge(&patch)).await
    })
    .await?;

    Ok(Action::requeue(REQUEUE_INTERVAL))
}

pub fn error_policy(_pool: Arc<WarmPool>, error: &kube::Error, ctx: Arc<WarmPoolCtx>) -> Action {
    warn!(error = %error, "warmpool_reconcile_error");
    let _ = &ctx;
    Action::requeue(StdDuration::from_secs(30))
}

fn apply_status(status: &mut WarmPoolStatus, counts: &ObservedCounts, last_scale_time: Option<DateTime<Utc>>, pool_ready: bool, now: DateTime<Utc>) {
    status.available_pods = counts.available;
    status.assigned_pods = counts.assigned;
    status.pending_pods = counts.pending;
    if let Some(t) = last_scale_time {
        status.last_scale_time = Some(t.to_rfc3339());
    }
    set_condition(
        &mut status.conditions,
        Condition {
            type_: "PoolReady".into(),
            status: if pool_ready { ConditionStatus::True } else { ConditionStatus::False },
            reason: if pool_ready { Reason::PoolReady } else { Reason::PoolNotReady },
            message: None,
            last_transition_time: now.to_rfc3339(),
        },
    );
}

fn build_warm_pod(pool: &WarmPool, pool_name: &str) -> WarmPod {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    let mut labels = std::collections::BTreeMap::new();
    labels.insert("llmsafespace.dev/pool".to_string(), pool_name.to_string());
    labels.insert("llmsafespace.dev/runtime".to_string(), crate::allocator::sanitize(&pool.spec.runtime));
    labels.insert(
        "llmsafespace.dev/security-level".to_string(),
        crate::allocator::security_level_label(pool.spec.security_level).to_string(),
    );

    WarmPod {
        metadata: ObjectMeta {
            generate_name: Some(format!("{pool_name}-")),
            namespace: pool.namespace(),
            labels: Some(labels),
            owner_references: pool.metadata.uid.clone().map(|uid| {
                vec![OwnerReference {
                    api_version: "llmsafespace.dev/v1".to_string(),
                    kind: "WarmPool".to_string(),
                    name: pool_name.to_string(),
                    uid,
                    controller: Some(true),
                    block_owner_deletion: Some(true),
                }]
            }),
            ..Default::default()
        },
        spec: crate::crd::WarmPodSpec {
            pool_ref: pool_name.to_string(),
            creation_timestamp: Utc::now().to_rfc3339(),
            last_heartbeat: None,
        },
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn counts(a: u32, s: u32, p: u32) -> ObservedCounts {
        ObservedCounts { available: a, assigned: s, pending: p }
    }

    #[test]
    fn scales_up_to_meet_min_size() {
        let action = decide_scale_action(5, 10, false, 0, 0, &counts(2, 0, 0), &[], None, Utc::now());
        assert_eq!(action, ScaleAction::ScaleUp(3));
    }

    #[test]
    fn no_action_when_within_bounds() {
        let action = decide_scale_action(2, 5, false, 0, 0, &counts(3, 1, 0), &[], None, Utc::now());
        assert_eq!(action, ScaleAction::None);
    }

    #[test]
    fn scales_down_oldest_first_when_above_max() {
        let ready = vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string(), "e".to_string()];
        let action = decide_scale_action(0, 3, false, 0, 0, &counts(5, 0, 0), &ready, None, Utc::now());
        assert_eq!(action, ScaleAction::ScaleDown(vec!["a".into(), "b".into()]));
    }

    #[test]
    fn scale_down_suppressed_within_cooldown() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let last_scale = now - chrono::Duration::seconds(10);
        let ready = vec!["a".to_string(), "b".to_string()];
        let action = decide_scale_action(0, 1, false, 0, 60, &counts(2, 0, 0), &ready, Some(last_scale), now);
        assert_eq!(action, ScaleAction::None);
    }

    #[test]
    fn scale_down_proceeds_once_cooldown_elapses() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let last_scale = now - chrono::Duration::seconds(120);
        let ready = vec!["a".to_string(), "b".to_string()];
        let action = decide_scale_action(0, 1, false, 0, 60, &counts(2, 0, 0), &ready, Some(last_scale), now);
        assert_eq!(action, ScaleAction::ScaleDown(vec!["a".into()]));
    }

    #[test]
    fn zero_max_size_means_unbounded_no_scale_down() {
        let ready = vec!["a".to_string()];
        let action = decide_scale_action(0, 0, false, 0, 0, &counts(100, 0, 0), &ready, None, Utc::now());
        assert_eq!(action, ScaleAction::None);
    }

    #[test]
    fn autoscaling_raises_effective_min_with_utilization() {
        // assigned=8, target_utilization=80% -> target = ceil(8/0.8) = 10
        let action = decide_scale_action(2, 20, true, 80, 0, &counts(0, 8, 0), &[], None, Utc::now());
        assert_eq!(action, ScaleAction::ScaleUp(10));
    }

    #[test]
    fn autoscaling_clamps_to_spec_max() {
        let action = decide_scale_action(2, 5, true, 10, 0, &counts(0, 8, 0), &[], None, Utc::now());
        // target would be ceil(8/0.1)=80, clamped to max=5; deficit = 5-0=5
        assert_eq!(action, ScaleAction::ScaleUp(5));
    }
}
