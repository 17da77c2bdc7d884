//! Closed error taxonomy shared by every component.
//!
//! Reconcilers recover `Conflict`/transient store errors locally; everything
//! else is recorded on the owning object's conditions or propagated to a
//! caller. The HTTP layer (out of scope for this crate) maps variants to the
//! status codes in [`Error::http_status`].

use std::fmt;

/// A closed vocabulary of `Reason`s used on object conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum Reason {
    PodCreated,
    PodCreationFailed,
    PodRunning,
    PodNotRunning,
    PoolReady,
    PoolNotReady,
    ScalingUp,
    ScalingDown,
    WarmPodReady,
    WarmPodAssigned,
    TtlExpired,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Coarse error kind, independent of the concrete cause, used to pick an
/// HTTP status and to decide local-recovery vs. propagation in reconcilers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Forbidden,
    InvalidInput,
    Timeout,
    NoWarmPod,
    Fatal,
    Internal,
}

/// The crate-wide error type.
///
/// `NoWarmPod` is never surfaced to a caller outside the allocator/Sandbox
/// reconciler boundary — it is an internal signal meaning "fall back to cold
/// creation", not a user-visible failure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("optimistic concurrency conflict on {0}")]
    Conflict(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid input: {message}")]
    InvalidInput {
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("timed out: {0}")]
    Timeout(String),

    /// Internal allocator signal: no Ready WarmPod available.
    #[error("no warm pod available")]
    NoWarmPod,

    #[error("fatal invariant violation: {0}")]
    Fatal(String),

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::InvalidInput { .. } => ErrorKind::InvalidInput,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::NoWarmPod => ErrorKind::NoWarmPod,
            Error::Fatal(_) => ErrorKind::Fatal,
            Error::Kube(e) => kube_error_kind(e),
            Error::Io(_) | Error::Other(_) => ErrorKind::Internal,
        }
    }

    /// Is this the optimistic-concurrency-loss case a reconciler should
    /// silently retry rather than record on status?
    pub fn is_conflict(&self) -> bool {
        matches!(self.kind(), ErrorKind::Conflict)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound)
    }

    /// Maps an error kind to an HTTP envelope vocabulary. The control
    /// plane itself never returns an HTTP status; this exists so an
    /// integrating API layer has one canonical table.
    pub fn http_status(&self) -> (u16, &'static str) {
        match self.kind() {
            ErrorKind::NotFound => (404, "not_found"),
            ErrorKind::Conflict => (409, "conflict"),
            ErrorKind::Forbidden => (403, "forbidden"),
            ErrorKind::InvalidInput => (400, "invalid_request"),
            ErrorKind::Timeout => (504, "service_unavailable"),
            ErrorKind::NoWarmPod => (500, "internal_error"),
            ErrorKind::Fatal | ErrorKind::Internal => (500, "internal_error"),
        }
    }
}

fn kube_error_kind(e: &kube::Error) -> ErrorKind {
    match e {
        kube::Error::Api(resp) => match resp.code {
            404 => ErrorKind::NotFound,
            409 => ErrorKind::Conflict,
            403 => ErrorKind::Forbidden,
            400 => ErrorKind::InvalidInput,
            _ => ErrorKind::Internal,
        },
        _ => ErrorKind::Internal,
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_is_recognized() {
        let e = Error::Conflict("sandbox/foo".into());
        assert!(e.is_conflict());
        assert_eq!(e.http_status(), (409, "conflict"));
    }

    #[test]
    fn not_found_maps_to_404() {
        let e = Error::NotFound("warmpod/bar".into());
        assert!(e.is_not_found());
        assert_eq!(e.http_status(), (404, "not_found"));
    }

    #[test]
    fn no_warm_pod_maps_to_internal_but_is_distinguishable() {
        let e = Error::NoWarmPod;
        assert_eq!(e.kind(), ErrorKind::NoWarmPod);
    }

    #[test]
    fn invalid_input_carries_details() {
        let e = Error::InvalidInput {
            message: "bad runtime".into(),
            details: Some(serde_json::json!({"field": "runtime"})),
        };
        assert_eq!(e.http_status(), (400, "invalid_request"));
    }
}
