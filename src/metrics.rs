//! Prometheus metrics, constructed explicitly and threaded through every
//! component rather than reached via a process-wide singleton (REDESIGN
//! FLAGS). Each reconciler/allocator/session manager takes a `Metrics`
//! (cheap to clone — the `prometheus` handle types are internally
//! reference-counted) instead of reaching for a `LazyLock<Registry>`.

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    pub sandbox_reconcile_total: IntCounter,
    pub sandbox_reconcile_errors_total: IntCounter,
    pub sandbox_reconcile_duration_seconds: Histogram,
    pub sandbox_phase: IntGaugeVec,

    pub warmpool_available_pods: IntGaugeVec,
    pub warmpool_assigned_pods: IntGaugeVec,
    pub warmpool_pending_pods: IntGaugeVec,
    pub warmpool_scale_actions_total: IntCounterVec,

    pub warmpod_reconcile_total: IntCounter,
    pub warmpod_recycled_total: IntCounter,

    pub warm_pool_hit_total: IntCounterVec,
    pub warm_pool_miss_total: IntCounterVec,

    pub exec_total: IntCounterVec,
    pub exec_errors_total: IntCounterVec,
    pub exec_duration_seconds: Histogram,

    pub sessions_active: IntGaugeVec,
    pub session_slow_consumer_total: IntCounter,
}

impl Metrics {
    /// Builds a fresh registry and registers every metric. Construction is
    /// infallible in practice (the metric definitions below are static and
    /// never collide) but returns a `Result` so a caller can propagate a
    /// startup failure instead of panicking, per the "no impossible
    /// invariant" spirit applied to process bootstrap.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let sandbox_reconcile_total = IntCounter::new(
            "sandbox_reconcile_total",
            "Total Sandbox reconciliation cycles",
        )?;
        let sandbox_reconcile_errors_total = IntCounter::new(
            "sandbox_reconcile_errors_total",
            "Total Sandbox reconciliation errors",
        )?;
        let sandbox_reconcile_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "sandbox_reconcile_duration_seconds",
            "Duration of each Sandbox reconciliation cycle",
        ))?;
        let sandbox_phase = IntGaugeVec::new(
            Opts::new("sandbox_phase", "Sandboxes currently in a given phase"),
            &["namespace", "phase"],
        )?;

        let warmpool_available_pods = IntGaugeVec::new(
            Opts::new("warmpool_available_pods", "Ready, unassigned WarmPods per pool"),
            &["namespace", "pool"],
        )?;
        let warmpool_assigned_pods = IntGaugeVec::new(
            Opts::new("warmpool_assigned_pods", "Assigned WarmPods per pool"),
            &["namespace", "pool"],
        )?;
        let warmpool_pending_pods = IntGaugeVec::new(
            Opts::new("warmpool_pending_pods", "Pending WarmPods per pool"),
            &["namespace", "pool"],
        )?;
        let warmpool_scale_actions_total = IntCounterVec::new(
            Opts::new("warmpool_scale_actions_total", "WarmPool scale-up/scale-down actions"),
            &["namespace", "pool", "direction"],
        )?;

        let warmpod_reconcile_total = IntCounter::new(
            "warmpod_reconcile_total",
            "Total WarmPod reconciliation cycles",
        )?;
        let warmpod_recycled_total = IntCounter::new(
            "warmpod_recycled_total",
            "Total WarmPods retired after sandbox use (replacement created)",
        )?;

        let warm_pool_hit_total = IntCounterVec::new(
            Opts::new("warm_pool_hit_total", "Allocator hits (a Ready WarmPod was assigned)"),
            &["runtime"],
        )?;
        let warm_pool_miss_total = IntCounterVec::new(
            Opts::new("warm_pool_miss_total", "Allocator misses (fell back to cold creation)"),
            &["runtime"],
        )?;

        let exec_total = IntCounterVec::new(
            Opts::new("exec_total", "Total execute()/file operations proxied into a sandbox"),
            &["operation"],
        )?;
        let exec_errors_total = IntCounterVec::new(
            Opts::new("exec_errors_total", "Total exec/file operation errors"),
            &["operation", "kind"],
        )?;
        let exec_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "exec_duration_seconds",
            "Duration of exec/file operations proxied into a sandbox",
        ))?;

        let sessions_active = IntGaugeVec::new(
            Opts::new("sessions_active", "Currently open WebSocket sessions"),
            &["namespace"],
        )?;
        let session_slow_consumer_total = IntCounter::new(
            "session_slow_consumer_total",
            "Sessions terminated for being a slow consumer of outbound frames",
        )?;

        for c in [&sandbox_reconcile_total, &sandbox_reconcile_errors_total, &warmpod_reconcile_total, &warmpod_recycled_total, &session_slow_consumer_total] {
            registry.register(Box::new(c.clone()))?;
        }
        registry.register(Box::new(sandbox_reconcile_duration_seconds.clone()))?;
        registry.register(Box::new(sandbox_phase.clone()))?;
        registry.register(Box::new(warmpool_available_pods.clone()))?;
        registry.register(Box::new(warmpool_assigned_pods.clone()))?;
        registry.register(Box::new(warmpool_pending_pods.clone()))?;
        registry.register(Box::new(warmpool_scale_actions_total.clone()))?;
        registry.register(Box::new(warm_pool_hit_total.clone()))?;
        registry.register(Box::new(warm_pool_miss_total.clone()))?;
        registry.register(Box::new(exec_total.clone()))?;
        registry.register(Box::new(exec_errors_total.clone()))?;
        registry.register(Box::new(exec_duration_seconds.clone()))?;
        registry.register(Box::new(sessions_active.clone()))?;

        Ok(Self {
            registry,
            sandbox_reconcile_total,
            sandbox_reconcile_errors_total,
            sandbox_reconcile_duration_seconds,
            sandbox_phase,
            warmpool_available_pods,
            warmpool_assigned_pods,
            warmpool_pending_pods,
            warmpool_scale_actions_total,
            warmpod_reconcile_total,
            warmpod_recycled_total,
            warm_pool_hit_total,
            warm_pool_miss_total,
            exec_total,
            exec_errors_total,
            exec_duration_seconds,
            sessions_active,
            session_slow_consumer_total,
        })
    }

    /// Renders the Prometheus text exposition format for this registry's
    /// current state, for the `/metrics` handler.
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        encoder
            .encode(&metric_families, &mut buf)
            .expect("encoding registered metrics cannot fail");
        String::from_utf8(buf).expect("prometheus text exposition is always valid UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_registers_without_collision() {
        let m = Metrics::new().expect("metrics should register cleanly");
        m.sandbox_reconcile_total.inc();
        m.warm_pool_hit_total.with_label_values(&["python:3.10"]).inc();
        let text = m.gather_text();
        assert!(text.contains("sandbox_reconcile_total 1"));
        assert!(text.contains("warm_pool_hit_total"));
    }

    #[test]
    fn two_instances_do_not_share_state() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.sandbox_reconcile_total.inc();
        assert_eq!(a.sandbox_reconcile_total.get(), 1);
        assert_eq!(b.sandbox_reconcile_total.get(), 0);
    }
}
