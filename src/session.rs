//! The session manager. A `Session` wraps one client connection bound to
//! a single Sandbox; the manager's registry is the only state shared across
//! handler tasks, mutated behind one `tokio::sync::Mutex`, explicit instead
//! of global, per [`crate::telemetry`]'s
//! stance on singletons.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::warn;
use uuid::Uuid;

use crate::cancel::{CancelSignal, CancelToken};
use crate::capabilities::{ExecKind, ExecStatus, ExecuteRequest, ExecutorProxy, OutputChunk, OutputStream};
use crate::metrics::Metrics;

const OUTBOUND_CAPACITY: usize = 64;
const SLOW_CONSUMER_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Execute { execution_id: String, mode: ExecMode, content: String, timeout: u64 },
    Cancel { execution_id: String },
    Ping { timestamp: String },
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    Code,
    Command,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    ExecutionStart { execution_id: String, timestamp: String },
    Output { execution_id: String, stream: WireStream, content: String, timestamp: String },
    ExecutionComplete { execution_id: String, exit_code: i32, timestamp: String },
    Error { code: String, message: String, execution_id: Option<String>, timestamp: String },
    Pong { timestamp: String },
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WireStream {
    Stdout,
    Stderr,
}

impl From<OutputStream> for WireStream {
    fn from(s: OutputStream) -> Self {
        match s {
            OutputStream::Stdout => WireStream::Stdout,
            OutputStream::Stderr => WireStream::Stderr,
        }
    }
}

struct SessionHandle {
    outbound: mpsc::Sender<ServerFrame>,
    executions: Mutex<HashMap<String, CancelToken>>,
}

#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<Mutex<HashMap<String, Arc<SessionHandle>>>>,
    proxy: Arc<dyn ExecutorProxy>,
    metrics: Metrics,
}

pub struct Session {
    pub id: String,
    pub namespace: String,
    pub sandbox_name: String,
    outbound_rx: mpsc::Receiver<ServerFrame>,
    handle: Arc<SessionHandle>,
}

impl SessionManager {
    pub fn new(proxy: Arc<dyn ExecutorProxy>, metrics: Metrics) -> Self {
        Self { sessions: Arc::new(Mutex::new(HashMap::new())), proxy, metrics }
    }

    pub async fn create_session(&self, namespace: &str, sandbox_name: &str) -> Session {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let handle = Arc::new(SessionHandle { outbound: tx, executions: Mutex::new(HashMap::new()) });
        self.sessions.lock().await.insert(id.clone(), handle.clone());
        self.metrics.sessions_active.with_label_values(&[namespace]).inc();
        Session { id, namespace: namespace.to_string(), sandbox_name: sandbox_name.to_string(), outbound_rx: rx, handle }
    }

    pub async fn close_session(&self, session: &Session) {
        let executions = session.handle.executions.lock().await;
        for token in executions.values() {
            token.cancel();
        }
        drop(executions);
        self.sessions.lock().await.remove(&session.id);
        self.metrics.sessions_active.with_label_values(&[session.namespace.as_str()]).dec();
    }

    /// Dispatches one inbound frame. Spawns `execute` as a detached task so
    /// the handler loop keeps reading: one task per session, plus one per
    /// in-flight execution implicitly via the spawned future.
    pub async fn dispatch(&self, session: &Session, frame: ClientFrame) {
        match frame {
            ClientFrame::Ping { timestamp } => {
                self.send(session, ServerFrame::Pong { timestamp }).await;
            }
            ClientFrame::Cancel { execution_id } => {
                let executions = session.handle.executions.lock().await;
                match executions.get(&execution_id) {
                    Some(token) => token.cancel(),
                    None => {
                        drop(executions);
                        self.send(
                            session,
                            ServerFrame::Error {
                                code: "not_found".into(),
                                message: format!("no execution {execution_id}"),
                                execution_id: Some(execution_id),
                                timestamp: now_rfc3339(),
                            },
                        )
                        .await;
                    }
                }
            }
            ClientFrame::Execute { execution_id, mode, content, timeout } => {
                let (token, cancel) = CancelToken::new();
                session.handle.executions.lock().await.insert(execution_id.clone(), token);

                // Spawned so the read loop in `http.rs`'s select! keeps
                // polling inbound frames while this execution is running —
                // otherwise a `cancel` for this same execution could never
                // be read until it finished or timed out on its own.
                let manager = self.clone();
                let session_id = session.id.clone();
                let namespace = session.namespace.clone();
                let sandbox_name = session.sandbox_name.clone();
                let handle = session.handle.clone();
                tokio::spawn(async move {
                    manager
                        .run_execution(session_id, namespace, sandbox_name, handle, execution_id, mode, content, timeout, cancel)
                        .await;
                });
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_execution(
        &self,
        session_id: String,
        namespace: String,
        sandbox_name: String,
        handle: Arc<SessionHandle>,
        execution_id: String,
        mode: ExecMode,
        content: String,
        timeout: u64,
        cancel: CancelSignal,
    ) {
        self.send_to(&session_id, &handle, ServerFrame::ExecutionStart { execution_id: execution_id.clone(), timestamp: now_rfc3339() })
            .await;

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<OutputChunk>(OUTBOUND_CAPACITY);
        let req = ExecuteRequest {
            kind: match mode {
                ExecMode::Code => ExecKind::Code,
                ExecMode::Command => ExecKind::Command,
            },
            content,
            timeout_sec: timeout,
        };

        let forward_outbound = handle.outbound.clone();
        let forward_id = execution_id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                let frame = ServerFrame::Output {
                    execution_id: forward_id.clone(),
                    stream: chunk.stream.into(),
                    content: String::from_utf8_lossy(&chunk.content).into_owned(),
                    timestamp: now_rfc3339(),
                };
                if forward_outbound.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let result = self.proxy.execute_stream(&namespace, &sandbox_name, req, chunk_tx, cancel).await;
        let _ = forwarder.await;
        handle.executions.lock().await.remove(&execution_id);

        match result {
            Ok(exec_result) => {
                let exit_code = match exec_result.status {
                    ExecStatus::Completed => exec_result.exit_code,
                    ExecStatus::TimedOut | ExecStatus::Cancelled => -1,
                };
                self.send_to(&session_id, &handle, ServerFrame::ExecutionComplete { execution_id, exit_code, timestamp: now_rfc3339() }).await;
            }
            Err(e) => {
                self.send_to(
                    &session_id,
                    &handle,
                    ServerFrame::Error { code: "execution_failed".into(), message: e.to_string(), execution_id: Some(execution_id), timestamp: now_rfc3339() },
                )
                .await;
            }
        }
    }

    /// Enforces the per-session backpressure policy: a full outbound buffer
    /// for more than [`SLOW_CONSUMER_GRACE`] terminates the session instead
    /// of blocking the execution task indefinitely.
    async fn send(&self, session: &Session, frame: ServerFrame) {
        self.send_to(&session.id, &session.handle, frame).await;
    }

    async fn send_to(&self, session_id: &str, handle: &SessionHandle, frame: ServerFrame) {
        match tokio::time::timeout(SLOW_CONSUMER_GRACE, handle.outbound.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(session_id = %session_id, "slow consumer, closing session");
                self.metrics.session_slow_consumer_total.inc();
                let _ = handle.outbound.try_send(ServerFrame::Error {
                    code: "slow_consumer".into(),
                    message: "outbound buffer exceeded grace period".into(),
                    execution_id: None,
                    timestamp: now_rfc3339(),
                });
            }
        }
    }
}

impl Session {
    pub async fn recv_outbound(&mut self) -> Option<ServerFrame> {
        self.outbound_rx.recv().await
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{ExecResult, FileEntry};
    use async_trait::async_trait;

    struct EchoProxy;

    #[async_trait]
    impl ExecutorProxy for EchoProxy {
        async fn execute(&self, _ns: &str, _name: &str, _req: ExecuteRequest) -> crate::error::Result<ExecResult> {
            unimplemented!()
        }

        async fn execute_stream(
            &self,
            _ns: &str,
            _name: &str,
            req: ExecuteRequest,
            sink: mpsc::Sender<OutputChunk>,
            _cancel: CancelSignal,
        ) -> crate::error::Result<ExecResult> {
            let _ = sink.send(OutputChunk { stream: OutputStream::Stdout, content: req.content.into_bytes() }).await;
            Ok(ExecResult { status: ExecStatus::Completed, exit_code: 0, stdout: Vec::new(), stderr: Vec::new(), stdout_truncated: false, stderr_truncated: false })
        }

        async fn list_files(&self, _ns: &str, _name: &str, _path: &str) -> crate::error::Result<Vec<FileEntry>> {
            unimplemented!()
        }
        async fn download_file(&self, _ns: &str, _name: &str, _path: &str) -> crate::error::Result<Vec<u8>> {
            unimplemented!()
        }
        async fn upload_file(&self, _ns: &str, _name: &str, _path: &str, _bytes: Vec<u8>) -> crate::error::Result<()> {
            unimplemented!()
        }
        async fn delete_file(&self, _ns: &str, _name: &str, _path: &str) -> crate::error::Result<()> {
            unimplemented!()
        }
        async fn create_directory(&self, _ns: &str, _name: &str, _path: &str) -> crate::error::Result<()> {
            unimplemented!()
        }
    }

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(EchoProxy), Metrics::new().unwrap())
    }

    #[tokio::test]
    async fn ping_gets_pong() {
        let mgr = manager();
        let mut session = mgr.create_session("default", "sb-1").await;
        mgr.dispatch(&session, ClientFrame::Ping { timestamp: "t".into() }).await;
        let frame = session.recv_outbound().await.unwrap();
        assert!(matches!(frame, ServerFrame::Pong { .. }));
    }

    #[tokio::test]
    async fn execute_emits_start_output_and_complete() {
        let mgr = manager();
        let mut session = mgr.create_session("default", "sb-1").await;
        mgr.dispatch(
            &session,
            ClientFrame::Execute { execution_id: "e1".into(), mode: ExecMode::Command, content: "echo hi".into(), timeout: 5 },
        )
        .await;

        let start = session.recv_outbound().await.unwrap();
        assert!(matches!(start, ServerFrame::ExecutionStart { .. }));
        let output = session.recv_outbound().await.unwrap();
        assert!(matches!(output, ServerFrame::Output { .. }));
        let complete = session.recv_outbound().await.unwrap();
        assert!(matches!(complete, ServerFrame::ExecutionComplete { exit_code: 0, .. }));
    }

    #[tokio::test]
    async fn cancel_of_unknown_execution_returns_error_frame() {
        let mgr = manager();
        let mut session = mgr.create_session("default", "sb-1").await;
        mgr.dispatch(&session, ClientFrame::Cancel { execution_id: "missing".into() }).await;
        let frame = session.recv_outbound().await.unwrap();
        assert!(matches!(frame, ServerFrame::Error { code, .. } if code == "not_found"));
    }
}
