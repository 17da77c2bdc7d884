//! Leader election over a `coordination.k8s.io/v1` `Lease`, with the
//! `leaseDuration`/`renewDeadline`/`retryPeriod` triple configurable
//! instead of hardcoded constants.

use std::time::Duration;

use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use k8s_openapi::chrono::{self, Utc};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::cancel::CancelSignal;
use crate::config::LeaderElectionConfig;
use crate::error::{Error, ErrorKind, Result};

/// Why [`LeaderElector::renew_forever`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOutcome {
    /// The caller cancelled the signal passed in; a normal shutdown.
    Cancelled,
    /// A renewal observed the lease held by a different identity. The
    /// caller must treat this as a hard stop: it is no longer safe to run
    /// any reconciliation under this identity.
    LeadershipLost,
}

pub struct LeaderElector {
    leases: Api<Lease>,
    lease_name: String,
    identity: String,
    cfg: LeaderElectionConfig,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, lease_name: &str, identity: String, cfg: LeaderElectionConfig) -> Self {
        Self {
            leases: Api::namespaced(client, namespace),
            lease_name: lease_name.to_string(),
            identity,
            cfg,
        }
    }

    /// Blocks, retrying every `retry_period`, until this identity holds the
    /// lease. Returns once acquired; the caller is expected to run
    /// [`Self::renew_forever`] concurrently for the lifetime of the work it
    /// gates.
    pub async fn acquire(&self, mut cancel: CancelSignal) -> Result<()> {
        loop {
            if self.try_acquire_or_renew().await? {
                info!(lease = %self.lease_name, identity = %self.identity, "leader_acquired");
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Other("cancelled while waiting for leadership".into())),
                _ = sleep(Duration::from_secs(self.cfg.retry_period_seconds)) => {}
            }
        }
    }

    /// Renews the held lease every `renew_deadline` until cancelled or until
    /// a renewal observes the lease has been taken by a different identity.
    /// A transient renewal error (network blip, momentary API unavailability)
    /// is logged and retried, since losing one attempt does not by itself
    /// mean the lease was lost — but [`Self::renew`] itself checks the
    /// current holder on every call, so an actual handoff to another
    /// identity is reported back as [`RenewOutcome::LeadershipLost`]
    /// immediately rather than being swallowed as "just retry".
    pub async fn renew_forever(&self, mut cancel: CancelSignal) -> RenewOutcome {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(lease = %self.lease_name, "leader_election_stopped");
                    return RenewOutcome::Cancelled;
                }
                _ = sleep(Duration::from_secs(self.cfg.renew_deadline_seconds)) => {
                    match self.renew().await {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::Conflict => {
                            warn!(error = %e, "leadership_lost");
                            return RenewOutcome::LeadershipLost;
                        }
                        Err(e) => {
                            warn!(error = %e, "lease_renewal_failed");
                        }
                    }
                }
            }
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = MicroTime(Utc::now());
        let duration_secs = self.cfg.lease_duration_seconds as i32;

        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(duration_secs),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                ..Default::default()
            }),
        };

        match self.leases.create(&Default::default(), &lease).await {
            Ok(_) => return Ok(true),
            Err(kube::Error::Api(err)) if err.code == 409 => {}
            Err(e) => return Err(Error::Kube(e)),
        }

        let existing = self.leases.get(&self.lease_name).await.map_err(Error::Kube)?;

        let can_take = match &existing.spec {
            Some(spec) => {
                let is_ours = spec.holder_identity.as_deref() == Some(self.identity.as_str());
                let is_expired = spec.renew_time.as_ref().is_none_or(|t| {
                    let held_for = spec.lease_duration_seconds.unwrap_or(duration_secs) as i64;
                    Utc::now().signed_duration_since(t.0) > chrono::Duration::seconds(held_for)
                });
                is_ours || is_expired
            }
            None => true,
        };

        if !can_take {
            return Ok(false);
        }

        let now = MicroTime(Utc::now());
        let patch = serde_json::json!({
            "spec": {
                "holderIdentity": self.identity,
                "leaseDurationSeconds": duration_secs,
                "acquireTime": now,
                "renewTime": now,
            }
        });

        match self
            .leases
            .patch(&self.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
            Err(e) => Err(Error::Kube(e)),
        }
    }

    /// Confirms this identity is still the recorded holder before renewing.
    /// Without this check a former leader whose renewal patches keep
    /// succeeding (the lease object still exists, the API server is
    /// healthy) would never notice that another identity had already taken
    /// over, and would keep believing it holds the lease indefinitely.
    async fn renew(&self) -> Result<()> {
        let existing = self.leases.get(&self.lease_name).await.map_err(Error::Kube)?;
        let current_holder = existing.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if current_holder != Some(self.identity.as_str()) {
            return Err(Error::Conflict(format!(
                "lease {} is held by {current_holder:?}, not {}",
                self.lease_name, self.identity
            )));
        }

        let now = MicroTime(Utc::now());
        let patch = serde_json::json!({ "spec": { "renewTime": now } });
        self.leases
            .patch(&self.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map(|_| ())
            .map_err(Error::Kube)
    }
}
