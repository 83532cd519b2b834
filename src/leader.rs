//! Leader election gating the reconcile dispatch loop.
//!
//! The placement in etcd tolerates external writers, but the operator
//! must never race itself: at most one replica may issue placement
//! mutations at a time. Election runs over a coordination.k8s.io Lease
//! with a single server-side-apply claim path; a takeover is confirmed by
//! re-reading the lease so two replicas that both saw it expire cannot
//! both believe they won.
//!
//! Renewal is interleaved with the dispatch future itself rather than
//! running on a side task: a replica that fails to renew stops polling
//! the work queue within one renewal interval, which keeps the fencing
//! window inside the reconciler's cancellation deadline.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Lease name for operator leader election
pub const LEADER_LEASE_NAME: &str = "m3db-operator-leader";

const LEASE_DURATION: Duration = Duration::from_secs(30);
const ACQUIRE_RETRY: Duration = Duration::from_secs(5);
const FIELD_MANAGER: &str = "m3db-operator-leader-election";

/// How a leadership-gated task ended
pub enum Leadership<T> {
    /// The task ran to completion while the lease was held
    Completed(T),
    /// The lease could not be renewed; no further placement writes may
    /// be issued by this replica
    Lost,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LeaseState {
    /// We hold the lease
    Ours,
    /// Absent, unheld, or expired; claimable
    Open,
    /// Another replica holds an unexpired lease
    HeldByOther,
}

/// Lease-based election for the operator's dispatch loop
pub struct LeaderElection {
    client: Client,
    namespace: String,
    identity: String,
    lease_duration: Duration,
}

impl LeaderElection {
    /// Create an election over [`LEADER_LEASE_NAME`] in `namespace`
    pub fn new(client: Client, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: LEASE_DURATION,
        }
    }

    fn renew_interval(&self) -> Duration {
        // Two renewal chances remain before the lease can expire
        self.lease_duration / 3
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Wait for the lease, then drive `task` while holding it.
    ///
    /// Returns [`Leadership::Completed`] when the task finishes (normal
    /// shutdown) and [`Leadership::Lost`] when a renewal fails, at which
    /// point the task has been dropped mid-flight; every reconciler phase
    /// is individually idempotent, so the next leader resumes safely.
    pub async fn lead<F, T>(&self, task: F) -> Leadership<T>
    where
        F: Future<Output = T>,
    {
        loop {
            match self.try_claim().await {
                Ok(true) => break,
                Ok(false) => {
                    debug!(identity = %self.identity, "lease held elsewhere, waiting")
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "lease claim attempt failed")
                }
            }
            tokio::time::sleep(ACQUIRE_RETRY).await;
        }
        info!(identity = %self.identity, "holding lease, starting dispatch");

        tokio::pin!(task);
        let mut renew = tokio::time::interval(self.renew_interval());
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        renew.tick().await; // the first tick completes immediately

        loop {
            tokio::select! {
                output = &mut task => return Leadership::Completed(output),
                _ = renew.tick() => match self.try_claim().await {
                    Ok(true) => debug!(identity = %self.identity, "lease renewed"),
                    Ok(false) => {
                        warn!(identity = %self.identity, "lease taken over, fencing placement writes");
                        return Leadership::Lost;
                    }
                    Err(e) => {
                        warn!(identity = %self.identity, error = %e, "lease renewal failed, fencing placement writes");
                        return Leadership::Lost;
                    }
                },
            }
        }
    }

    /// One claim round: observe the lease, then renew or take it over.
    ///
    /// Returns whether this replica holds the lease afterwards.
    async fn try_claim(&self) -> Result<bool, kube::Error> {
        let api = self.api();
        let now = Utc::now();

        let (state, transitions) = match api.get_opt(LEADER_LEASE_NAME).await? {
            Some(lease) => (
                classify(&lease, &self.identity, now),
                lease
                    .spec
                    .as_ref()
                    .and_then(|s| s.lease_transitions)
                    .unwrap_or(0),
            ),
            None => (LeaseState::Open, 0),
        };

        match state {
            LeaseState::HeldByOther => Ok(false),
            LeaseState::Ours => {
                self.apply_claim(&api, now, transitions).await?;
                Ok(true)
            }
            LeaseState::Open => {
                self.apply_claim(&api, now, transitions + 1).await?;
                // Another replica may have applied in the same window;
                // only the re-read decides who actually leads.
                let confirmed = api
                    .get_opt(LEADER_LEASE_NAME)
                    .await?
                    .map(|lease| classify(&lease, &self.identity, now) == LeaseState::Ours)
                    .unwrap_or(false);
                if confirmed {
                    info!(identity = %self.identity, transitions = transitions + 1, "lease claimed");
                }
                Ok(confirmed)
            }
        }
    }

    async fn apply_claim(
        &self,
        api: &Api<Lease>,
        now: DateTime<Utc>,
        transitions: i32,
    ) -> Result<(), kube::Error> {
        let body = claim_body(
            &self.identity,
            &self.namespace,
            self.lease_duration,
            now,
            transitions,
        );
        api.patch(
            LEADER_LEASE_NAME,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&body),
        )
        .await?;
        Ok(())
    }
}

/// Decide what the observed lease means for `identity` at `now`.
///
/// A lease without holder, renew time, or duration is treated as open;
/// a malformed lease must never deadlock the election.
fn classify(lease: &Lease, identity: &str, now: DateTime<Utc>) -> LeaseState {
    let Some(spec) = lease.spec.as_ref() else {
        return LeaseState::Open;
    };
    let Some(holder) = spec.holder_identity.as_deref() else {
        return LeaseState::Open;
    };
    if holder == identity {
        return LeaseState::Ours;
    }

    match (spec.renew_time.as_ref(), spec.lease_duration_seconds) {
        (Some(renewed), Some(duration)) => {
            if now > renewed.0 + chrono::Duration::seconds(duration as i64) {
                LeaseState::Open
            } else {
                LeaseState::HeldByOther
            }
        }
        _ => LeaseState::Open,
    }
}

/// The full lease body applied on every claim; server-side apply makes
/// one path serve creation, renewal, and takeover
fn claim_body(
    identity: &str,
    namespace: &str,
    lease_duration: Duration,
    now: DateTime<Utc>,
    transitions: i32,
) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "coordination.k8s.io/v1",
        "kind": "Lease",
        "metadata": {
            "name": LEADER_LEASE_NAME,
            "namespace": namespace,
        },
        "spec": {
            "holderIdentity": identity,
            "leaseDurationSeconds": lease_duration.as_secs() as i32,
            "renewTime": MicroTime(now),
            "leaseTransitions": transitions,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::coordination::v1::LeaseSpec;

    fn lease(holder: Option<&str>, renewed_secs_ago: i64, duration: i32) -> Lease {
        Lease {
            spec: Some(LeaseSpec {
                holder_identity: holder.map(String::from),
                renew_time: Some(MicroTime(
                    Utc::now() - chrono::Duration::seconds(renewed_secs_ago),
                )),
                lease_duration_seconds: Some(duration),
                lease_transitions: Some(2),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn our_lease_is_ours_regardless_of_age() {
        let l = lease(Some("operator-a"), 3600, 30);
        assert_eq!(classify(&l, "operator-a", Utc::now()), LeaseState::Ours);
    }

    #[test]
    fn fresh_foreign_lease_is_held() {
        let l = lease(Some("operator-b"), 5, 30);
        assert_eq!(
            classify(&l, "operator-a", Utc::now()),
            LeaseState::HeldByOther
        );
    }

    #[test]
    fn expired_foreign_lease_is_open() {
        let l = lease(Some("operator-b"), 120, 30);
        assert_eq!(classify(&l, "operator-a", Utc::now()), LeaseState::Open);
    }

    #[test]
    fn malformed_leases_are_open() {
        assert_eq!(
            classify(&Lease::default(), "operator-a", Utc::now()),
            LeaseState::Open
        );
        let no_holder = lease(None, 0, 30);
        assert_eq!(classify(&no_holder, "operator-a", Utc::now()), LeaseState::Open);

        let mut no_renew = lease(Some("operator-b"), 0, 30);
        no_renew.spec.as_mut().unwrap().renew_time = None;
        assert_eq!(classify(&no_renew, "operator-a", Utc::now()), LeaseState::Open);
    }

    #[test]
    fn claim_body_carries_holder_and_timing() {
        let body = claim_body(
            "operator-a",
            "m3db",
            Duration::from_secs(30),
            Utc::now(),
            3,
        );
        assert_eq!(body["spec"]["holderIdentity"], "operator-a");
        assert_eq!(body["spec"]["leaseDurationSeconds"], 30);
        assert_eq!(body["spec"]["leaseTransitions"], 3);
        assert_eq!(body["metadata"]["name"], LEADER_LEASE_NAME);
    }
}
