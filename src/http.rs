//! The process's HTTP surface: `/healthz`, `/readyz`, `/metrics`, and the
//! WebSocket session endpoint. An axum `Router` with graceful shutdown via
//! a broadcast receiver, extended from a read-only health/metrics server
//! to one that also terminates sessions.

use std::net::SocketAddr;
use std::sync::{Arc, atomic::{AtomicBool, Ordering}};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::metrics::Metrics;
use crate::session::{ClientFrame, ServerFrame, SessionManager};

#[derive(Clone)]
pub struct AppState {
    pub metrics: Metrics,
    pub sessions: SessionManager,
    pub ready: Arc<AtomicBool>,
}

impl AppState {
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .route("/sandboxes/:namespace/:name/stream", get(stream_handler))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if state.ready.load(Ordering::SeqCst) {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, state.metrics.gather_text())
}

async fn stream_handler(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, namespace, name))
}

async fn handle_socket(socket: WebSocket, state: AppState, namespace: String, name: String) {
    let (mut sink, mut stream) = socket.split();
    let mut session = state.sessions.create_session(&namespace, &name).await;

    loop {
        tokio::select! {
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) => state.sessions.dispatch(&session, frame).await,
                            Err(e) => warn!(error = %e, "malformed session frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket read error");
                        break;
                    }
                }
            }
            outbound = session.recv_outbound() => {
                match outbound {
                    Some(frame) => {
                        let Ok(text) = serde_json::to_string(&frame) else { continue };
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    state.sessions.close_session(&session).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::PodExecutorProxy;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state(ready: bool, client: kube::Client) -> AppState {
        AppState {
            metrics: Metrics::new().unwrap(),
            sessions: SessionManager::new(Arc::new(PodExecutorProxy::new(client)), Metrics::new().unwrap()),
            ready: Arc::new(AtomicBool::new(ready)),
        }
    }

    fn fake_client() -> kube::Client {
        // A `Client` with no reachable apiserver; fine for routes that never
        // touch it (healthz/readyz/metrics).
        let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        kube::Client::try_from(config).expect("client construction without I/O never fails")
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = build_router(test_state(false, fake_client()));
        let resp = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_reflects_state() {
        let app = build_router(test_state(false, fake_client()));
        let resp = app
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn metrics_endpoint_exposes_prometheus_text() {
        let app = build_router(test_state(true, fake_client()));
        let resp = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("sandbox_reconcile_total"));
    }
}
