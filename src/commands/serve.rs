//! `llmsafespace serve`: the control-plane process. Generalizes the
//! teacher's `commands/watch.rs::run` — acquire a lease, start the HTTP
//! server, race a watch loop against shutdown — to three reconcilers plus
//! the session-bearing WebSocket server, all gated behind leadership.

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use kube::Client;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use llmsafespace::allocator::WarmPodAllocator;
use llmsafespace::capabilities::SystemClock;
use llmsafespace::config::Config;
use llmsafespace::http::{self, AppState};
use llmsafespace::leader::{LeaderElector, RenewOutcome};
use llmsafespace::metrics::Metrics;
use llmsafespace::proxy::PodExecutorProxy;
use llmsafespace::reconcile;
use llmsafespace::session::SessionManager;
use llmsafespace::{cancel::CancelToken, telemetry};

const LEASE_NAME: &str = "llmsafespace-controller";

/// Exit codes per the process contract: 0 normal shutdown, 1 fatal startup
/// error, 2 invalid configuration, 3 shutdown triggered by lost leadership.
pub async fn run(config_path: Option<String>) -> i32 {
    let config = match config_path {
        Some(path) => Config::from_file(path),
        None => Config::from_env_only(),
    };
    let config = match config {
        Ok(c) => c,
        Err(e) => {
            eprintln!("invalid configuration: {e:#}");
            return 2;
        }
    };
    telemetry::init(&config.logging);

    match run_with_config(config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("fatal startup error: {e:#}");
            1
        }
    }
}

async fn run_with_config(config: Config) -> anyhow::Result<i32> {
    let client = Client::try_default().await.map_err(|e| anyhow::anyhow!("failed to build Kubernetes client: {e}"))?;
    let metrics = Metrics::new()?;
    let namespace = config.kubernetes.namespace.clone();
    let identity = config.kubernetes.pod_name.clone().unwrap_or_else(|| format!("llmsafespace-{}", uuid::Uuid::new_v4()));

    let proxy = Arc::new(PodExecutorProxy::new(client.clone()));
    let sessions = SessionManager::new(proxy, metrics.clone());
    let app_state = AppState { metrics: metrics.clone(), sessions, ready: Arc::new(AtomicBool::new(false)) };

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let http_addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let http_task = tokio::spawn(http::serve(http_addr, app_state.clone(), shutdown_tx.subscribe()));

    let (_cancel_token, cancel_signal) = CancelToken::new();

    let exit_code = if config.kubernetes.leader_election.enabled {
        let elector = LeaderElector::new(client.clone(), &namespace, LEASE_NAME, identity, config.kubernetes.leader_election.clone());
        info!("waiting to acquire leadership");
        tokio::select! {
            result = elector.acquire(cancel_signal.clone()) => {
                result.map_err(|e| anyhow::anyhow!("leader election failed: {e}"))?;
            }
            _ = signal::ctrl_c() => {
                let _ = shutdown_tx.send(());
                let _ = http_task.await;
                return Ok(0);
            }
        }
        app_state.set_ready(true);

        let allocator = Arc::new(WarmPodAllocator::new(client.clone(), metrics.clone()));
        let clock = Arc::new(SystemClock);

        // Races lease renewal directly against the reconcilers: the instant
        // a renewal observes the lease held by another identity, this
        // `select!` drops the `reconcile::run_all` future in place, halting
        // every in-flight reconciliation before the lease can be held by
        // two processes at once.
        tokio::select! {
            outcome = elector.renew_forever(cancel_signal.clone()) => match outcome {
                RenewOutcome::LeadershipLost => {
                    warn!("lost leadership, halting reconcilers");
                    3
                }
                RenewOutcome::Cancelled => 0,
            },
            _ = reconcile::run_all(client, metrics, allocator, clock, shutdown_tx.subscribe()) => 0,
            _ = signal::ctrl_c() => {
                info!("ctrl-c received, shutting down");
                0
            }
        }
    } else {
        app_state.set_ready(true);
        run_reconcilers_until_shutdown(client, metrics, &shutdown_tx).await;
        0
    };

    let _ = shutdown_tx.send(());
    let _ = http_task.await;
    Ok(exit_code)
}

async fn run_reconcilers_until_shutdown(client: Client, metrics: Metrics, shutdown_tx: &broadcast::Sender<()>) {
    let allocator = Arc::new(WarmPodAllocator::new(client.clone(), metrics.clone()));
    let clock = Arc::new(SystemClock);

    tokio::select! {
        _ = reconcile::run_all(client, metrics, allocator, clock, shutdown_tx.subscribe()) => {}
        _ = signal::ctrl_c() => {
            info!("ctrl-c received, shutting down");
        }
    }
}
