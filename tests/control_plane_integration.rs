mod common;

// ══════════════════════════════════════════════════════════════════
// Control-plane integration tests (no cluster required)
//
// Exercises the pure decision functions the reconcilers are built from,
// composed the way a real reconcile loop would sequence them: scale
// decision -> pod spec construction -> phase transition legality.
// ══════════════════════════════════════════════════════════════════

use common::make_test_pod;
use llmsafespace::crd::{
    FilesystemPolicy, RuntimeEnvironmentSpec, SandboxPhase, SandboxSpec, SecurityLevel,
};
use llmsafespace::pod_spec::build_pod;
use llmsafespace::reconcile::warmpool::{decide_scale_action, ObservedCounts, ScaleAction};
use chrono::{TimeZone, Utc};

fn runtime() -> RuntimeEnvironmentSpec {
    RuntimeEnvironmentSpec {
        language: "python".into(),
        version: "3.11".into(),
        image: "llmsafespace/python:3.11".into(),
        ..Default::default()
    }
}

#[test]
fn cold_start_scale_up_then_pod_creation_for_high_security_sandbox() {
    let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

    // A freshly declared pool with no inventory yet should demand enough
    // WarmPods to satisfy its minSize.
    let action = decide_scale_action(3, 5, false, 0, 60, &ObservedCounts::default(), &[], None, now);
    assert_eq!(action, ScaleAction::ScaleUp(3));

    // Meanwhile a cold-created Sandbox at High security still gets a
    // correctly isolated pod regardless of the pool's state.
    let spec = SandboxSpec {
        runtime: "python:3.11".into(),
        security_level: SecurityLevel::High,
        filesystem: FilesystemPolicy {
            writable_paths: vec!["/workspace".into()],
            ..Default::default()
        },
        ..Default::default()
    };
    let pod = build_pod("sb-cold-1", "uid-1", "tenant-a", &spec, &runtime(), None);
    let pod_spec = pod.spec.unwrap();
    assert_eq!(pod_spec.runtime_class_name.as_deref(), Some("gvisor"));
    assert_eq!(pod_spec.volumes.as_ref().unwrap().len(), 1);
}

#[test]
fn pool_at_capacity_with_cooldown_elapsed_sheds_oldest_pods() {
    let last_scale = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let now = last_scale + chrono::Duration::seconds(120);
    let ready = vec!["warmpod-a".to_string(), "warmpod-b".to_string(), "warmpod-c".to_string()];
    let counts = ObservedCounts { available: 3, assigned: 0, pending: 0 };

    let action = decide_scale_action(1, 2, false, 0, 60, &counts, &ready, Some(last_scale), now);
    assert_eq!(action, ScaleAction::ScaleDown(vec!["warmpod-a".to_string()]));
}

#[test]
fn sandbox_phase_sequence_observed_across_a_pod_restart_stays_monotone_or_falls_back() {
    // A pod observed Running and then disappearing (e.g. node eviction)
    // legally falls back to Pending for re-creation, but never regresses
    // to an earlier in-progress phase like Creating.
    assert!(SandboxPhase::Running.can_transition_to(SandboxPhase::Pending));
    assert!(SandboxPhase::Pending.can_transition_to(SandboxPhase::Creating));
    assert!(!SandboxPhase::Terminated.can_transition_to(SandboxPhase::Pending));

    let pod = make_test_pod("sandbox-sb-cold-1", "tenant-a", "Running");
    assert_eq!(pod.status.unwrap().phase.as_deref(), Some("Running"));
}
