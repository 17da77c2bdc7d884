//! Low-level "run a command inside a pod's container and collect its
//! output" primitive. Shared by the execution proxy and the WarmPod
//! reconciler's sentinel-file readiness check — both need the same
//! "exec, drain stdout/stderr concurrently, read the exit code" sequence,
//! just against different commands.

use std::time::Duration;

use bytes::Bytes;
use kube::api::AttachParams;
use kube::{Api, Client};
use k8s_openapi::api::core::v1::Pod;

use crate::error::{Error, Result};

pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

/// Execs `cmd` in `container` of `pod_name`, bounding each stream to
/// [`MAX_OUTPUT_BYTES`] and the whole call to `timeout`.
pub async fn exec_collect(
    client: &Client,
    namespace: &str,
    pod_name: &str,
    container: &str,
    cmd: &[&str],
    timeout: Duration,
) -> Result<ExecOutput> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);

    let mut attached = tokio::time::timeout(
        timeout,
        pods.exec(
            pod_name,
            cmd.to_vec(),
            &AttachParams::default().container(container).stdout(true).stderr(true),
        ),
    )
    .await
    .map_err(|_| Error::Timeout(format!("exec into {pod_name} timed out before attaching")))?
    .map_err(Error::Kube)?;

    let stdout_fut = drain_bounded(attached.stdout());
    let stderr_fut = drain_bounded(attached.stderr());
    let status_fut = attached.take_status();

    let ((stdout, stdout_truncated), (stderr, stderr_truncated)) = tokio::time::timeout(
        timeout,
        futures::future::join(stdout_fut, stderr_fut),
    )
    .await
    .map_err(|_| Error::Timeout(format!("exec into {pod_name} timed out draining output")))?;

    let exit_code = match status_fut {
        Some(fut) => fut.await,
        None => None,
    }
    .and_then(|s| s.status)
    .map(|s| if s == "Success" { 0 } else { 1 })
    .unwrap_or(0);

    let _ = attached.join().await;

    Ok(ExecOutput { exit_code, stdout, stderr, stdout_truncated, stderr_truncated })
}

async fn drain_bounded(stream: Option<impl tokio::io::AsyncRead + Unpin>) -> (Vec<u8>, bool) {
    use tokio::io::AsyncReadExt;
    let Some(mut reader) = stream else { return (Vec::new(), false) };
    let mut buf = vec![0u8; MAX_OUTPUT_BYTES + 1];
    let mut total = Vec::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if total.len() + n > MAX_OUTPUT_BYTES {
                    let remaining = MAX_OUTPUT_BYTES.saturating_sub(total.len());
                    total.extend_from_slice(&buf[..remaining]);
                    // keep draining the channel so the process is not blocked on a full pipe
                    let mut sink = vec![0u8; 8192];
                    while reader.read(&mut sink).await.unwrap_or(0) > 0 {}
                    return (total, true);
                }
                total.extend_from_slice(&buf[..n]);
            }
            Err(_) => break,
        }
    }
    (total, false)
}

/// Base64-encodes `content` and writes it to `path` inside the container via
/// `sh -c`, the same indirection the grounding example uses to move bytes
/// through an exec channel without a dedicated file-transfer API.
pub fn write_file_command(path: &str, content: &[u8]) -> String {
    use base64::Engine;
    let encoded = base64::engine::general_purpose::STANDARD.encode(content);
    format!("mkdir -p \"$(dirname '{path}')\" && echo '{encoded}' | base64 -d > '{path}'")
}

pub fn read_file_command(path: &str) -> String {
    format!("base64 '{path}'")
}

pub fn delete_file_command(path: &str) -> String {
    format!("rm -rf '{path}'")
}

pub fn create_directory_command(path: &str) -> String {
    format!("mkdir -p '{path}'")
}

pub fn list_files_command(path: &str) -> String {
    format!("find '{path}' -mindepth 1 -maxdepth 1 -printf '%y %s %p\\n'")
}

pub fn decode_base64(stdout: &[u8]) -> Result<Bytes> {
    use base64::Engine;
    let trimmed: Vec<u8> = stdout.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(&trimmed)
        .map(Bytes::from)
        .map_err(|e| Error::Other(format!("invalid base64 from sandbox: {e}")))
}

pub fn sentinel_check_command() -> &'static str {
    "test -f /opt/llmsafespace/ready"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_file_command_b64_roundtrips() {
        let cmd = write_file_command("/workspace/a.txt", b"hello");
        assert!(cmd.contains("base64 -d"));
        assert!(cmd.contains("/workspace/a.txt"));
    }

    #[test]
    fn decode_base64_strips_whitespace() {
        let decoded = decode_base64(b"aGVsbG8=\n").unwrap();
        assert_eq!(&decoded[..], b"hello");
    }

    #[test]
    fn decode_base64_rejects_garbage() {
        assert!(decode_base64(b"not-base64!!!").is_err());
    }
}
