//! Narrow capability traits that break the sandbox<->warmpool<->execution
//! dependency cycle. The Sandbox reconciler depends on an `Allocator`; the
//! session manager depends on an `ExecutorProxy`. Neither depends on the
//! other's concrete module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::crd::SecurityLevel;
use crate::error::Result;

/// Injected time source so timeout/TTL logic (execution deadlines, WarmPod
/// TTL expiry) is driven by a fake clock in tests instead of wall time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A WarmPod successfully assigned to a Sandbox by [`Allocator::try_allocate`].
#[derive(Debug, Clone, PartialEq)]
pub struct AllocatedWarmPod {
    pub warm_pod_name: String,
    pub pod_name: String,
    pub pod_namespace: String,
}

/// `Err(Error::NoWarmPod)` is the documented miss signal — callers match on
/// `.kind() == ErrorKind::NoWarmPod` to fall back to cold creation, never
/// treating it as a surfaced failure.
#[async_trait]
pub trait Allocator: Send + Sync {
    async fn try_allocate(
        &self,
        namespace: &str,
        sandbox_name: &str,
        runtime: &str,
        security_level: SecurityLevel,
    ) -> Result<AllocatedWarmPod>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecKind {
    Code,
    Command,
}

#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub kind: ExecKind,
    pub content: String,
    pub timeout_sec: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecResult {
    pub status: ExecStatus,
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Completed,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub is_dir: bool,
    pub size_bytes: u64,
}

/// Every operation is keyed by `(namespace, sandbox_name)`, which an
/// implementation resolves to the backing pod. Implementations must never
/// mutate Sandbox status — that remains the reconciler's exclusive
/// ownership.
#[async_trait]
pub trait ExecutorProxy: Send + Sync {
    async fn execute(&self, namespace: &str, sandbox_name: &str, req: ExecuteRequest) -> Result<ExecResult>;

    /// Streams output chunks to `sink` as they arrive; returns the terminal
    /// result once the process exits, times out, or `cancel` fires. Must
    /// return within ~1s of cancellation.
    async fn execute_stream(
        &self,
        namespace: &str,
        sandbox_name: &str,
        req: ExecuteRequest,
        sink: tokio::sync::mpsc::Sender<OutputChunk>,
        cancel: crate::cancel::CancelSignal,
    ) -> Result<ExecResult>;

    async fn list_files(&self, namespace: &str, sandbox_name: &str, path: &str) -> Result<Vec<FileEntry>>;
    async fn download_file(&self, namespace: &str, sandbox_name: &str, path: &str) -> Result<Vec<u8>>;
    async fn upload_file(&self, namespace: &str, sandbox_name: &str, path: &str, bytes: Vec<u8>) -> Result<()>;
    async fn delete_file(&self, namespace: &str, sandbox_name: &str, path: &str) -> Result<()>;
    async fn create_directory(&self, namespace: &str, sandbox_name: &str, path: &str) -> Result<()>;
}

/// Paths must be absolute and lie under a writable root.
pub fn validate_path(path: &str, writable_roots: &[String]) -> Result<()> {
    if !path.starts_with('/') {
        return Err(crate::error::Error::Forbidden(format!(
            "path {path} is not absolute"
        )));
    }
    if path.contains("..") {
        return Err(crate::error::Error::Forbidden(format!(
            "path {path} contains a parent-directory segment"
        )));
    }
    if writable_roots.is_empty() {
        return Ok(());
    }
    if writable_roots.iter().any(|root| path == root || path.starts_with(&format!("{root}/"))) {
        Ok(())
    } else {
        Err(crate::error::Error::Forbidden(format!(
            "path {path} is not under a writable root"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_is_forbidden() {
        assert!(validate_path("workspace/file.txt", &[]).is_err());
    }

    #[test]
    fn parent_traversal_is_forbidden() {
        assert!(validate_path("/workspace/../etc/passwd", &["/workspace".into()]).is_err());
    }

    #[test]
    fn path_outside_writable_roots_is_forbidden() {
        assert!(validate_path("/etc/passwd", &["/workspace".into()]).is_err());
    }

    #[test]
    fn path_under_writable_root_is_allowed() {
        assert!(validate_path("/workspace/out.txt", &["/workspace".into()]).is_ok());
    }

    #[test]
    fn path_equal_to_writable_root_is_allowed() {
        assert!(validate_path("/workspace", &["/workspace".into()]).is_ok());
    }

    #[test]
    fn no_writable_roots_configured_allows_any_absolute_path() {
        assert!(validate_path("/tmp/x", &[]).is_ok());
    }
}
