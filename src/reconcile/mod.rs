//! Reconciler wiring: one [`kube::runtime::Controller`] per top-level
//! resource (Sandbox, WarmPool, WarmPod), each `owns()`ing the `Pod`s it
//! creates so a pod-level change (deleted, evicted, crash-looped) requeues
//! the owning object directly.

pub mod retry;
pub mod sandbox;
pub mod warmpod;
pub mod warmpool;

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Controller;
use kube::{Api, Client};
use tracing::{error, info};

use crate::capabilities::{Allocator, Clock};
use crate::crd::{Sandbox, WarmPod, WarmPool};
use crate::metrics::Metrics;

pub use sandbox::SandboxCtx;
pub use warmpod::WarmPodCtx;
pub use warmpool::WarmPoolCtx;

/// Runs all three controllers concurrently until `shutdown` resolves, each
/// built from `Controller::new(..).owns(..).run(..)` and raced together
/// against the shutdown signal.
pub async fn run_all(
    client: Client,
    metrics: Metrics,
    allocator: Arc<dyn Allocator>,
    clock: Arc<dyn Clock>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    let sandbox_ctx = Arc::new(SandboxCtx { client: client.clone(), metrics: metrics.clone(), allocator, clock: clock.clone() });
    let warmpool_ctx = Arc::new(WarmPoolCtx { client: client.clone(), metrics: metrics.clone(), clock });
    let warmpod_ctx = Arc::new(WarmPodCtx { client: client.clone(), metrics });

    let sandboxes: Api<Sandbox> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client.clone());
    let sandbox_controller = Controller::new(sandboxes, Default::default())
        .owns(pods.clone(), Default::default())
        .run(sandbox::reconcile, sandbox::error_policy, sandbox_ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                error!(error = %e, "sandbox reconcile failed");
            }
        });

    let warm_pools: Api<WarmPool> = Api::all(client.clone());
    let warm_pool_controller = Controller::new(warm_pools, Default::default())
        .owns(Api::<WarmPod>::all(client.clone()), Default::default())
        .run(warmpool::reconcile, warmpool::error_policy, warmpool_ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                error!(error = %e, "warm pool reconcile failed");
            }
        });

    let warm_pods: Api<WarmPod> = Api::all(client.clone());
    let warm_pod_controller = Controller::new(warm_pods, Default::default())
        .owns(pods, Default::default())
        .run(warmpod::reconcile, warmpod::error_policy, warmpod_ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                error!(error = %e, "warm pod reconcile failed");
            }
        });

    info!("reconcilers starting");
    tokio::select! {
        _ = sandbox_controller => {}
        _ = warm_pool_controller => {}
        _ = warm_pod_controller => {}
        _ = shutdown.recv() => {
            info!("reconcilers shutting down");
        }
    }
}
