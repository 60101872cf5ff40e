use std::time::Instant;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::ObjectMeta;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::client::ClusterClient;
use crate::util::Error;
use crate::util::time::sleep_cancellable;
use crate::{log_info, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    Leading,
    Standby,
}

#[derive(Debug, Clone)]
pub struct ElectorConfig {
    pub lease_name: String,
    pub identity: String,
    pub lease_duration_secs: u64,
    pub renew_deadline_secs: u64,
    pub retry_period_secs: u64,
}

/// Lease-based leader election: a read/create/replace-on-409 protocol
/// against a single `coordination.k8s.io/v1` Lease, run on a fixed
/// `retry_period` tick. Tolerates transient cycle failures for up to
/// `renew_deadline` before declaring leadership lost, and releases the
/// lease explicitly on shutdown so a standby can take over immediately
/// rather than waiting out the full lease duration.
pub struct Elector {
    client: ClusterClient,
    config: ElectorConfig,
}

impl Elector {
    pub fn new(client: ClusterClient, config: ElectorConfig) -> Self {
        Elector { client, config }
    }

    pub async fn run(&self, cancel: CancellationToken, state_tx: watch::Sender<LeaderState>) {
        let start = Instant::now();
        let mut is_leader = false;
        let mut last_renew_success: Option<u64> = None;
        let mut acquiring_since = Instant::now();

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let now = start.elapsed().as_secs();

            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    last_renew_success = Some(now);
                    if !is_leader {
                        is_leader = true;
                        log_info!("👑 acquired leadership as {}", self.config.identity);
                        metrics::counter!("leader_transitions_total").increment(1);
                        metrics::histogram!("leader_acquire_latency_seconds")
                            .record(acquiring_since.elapsed().as_secs_f64());
                        let _ = state_tx.send(LeaderState::Leading);
                    }
                }
                Ok(false) => {
                    if is_leader && !holds_despite_failure(now, last_renew_success, self.config.renew_deadline_secs)
                    {
                        is_leader = false;
                        acquiring_since = Instant::now();
                        log_warn!("lost leadership: lease held elsewhere");
                        metrics::counter!("leader_transitions_total").increment(1);
                        let _ = state_tx.send(LeaderState::Standby);
                    }
                }
                Err(e) => {
                    log_warn!("leader election cycle error: {e}");
                    if is_leader && !holds_despite_failure(now, last_renew_success, self.config.renew_deadline_secs)
                    {
                        is_leader = false;
                        acquiring_since = Instant::now();
                        log_warn!("lost leadership: renew_deadline exceeded after errors");
                        metrics::counter!("leader_transitions_total").increment(1);
                        let _ = state_tx.send(LeaderState::Standby);
                    }
                }
            }

            if sleep_cancellable(self.config.retry_period_secs as f64, &cancel).await {
                break;
            }
        }

        if is_leader {
            self.release().await;
            let _ = state_tx.send(LeaderState::Standby);
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, Error> {
        match self.client.get_lease(&self.config.lease_name).await? {
            None => {
                let lease = new_lease(&self.config.lease_name, &self.config.identity, self.config.lease_duration_secs);
                match self.client.create_lease(&lease).await {
                    Ok(_) => Ok(true),
                    Err(e) if e.is_conflict() => Ok(false),
                    Err(e) => Err(e),
                }
            }
            Some(existing) => {
                let holder = existing.spec.as_ref().and_then(|s| s.holder_identity.clone());
                if holder.as_deref() == Some(self.config.identity.as_str()) {
                    let after = renewed_lease(&existing, self.config.lease_duration_secs);
                    self.try_replace(&existing, &after).await
                } else {
                    let renew_time = existing.spec.as_ref().and_then(|s| s.renew_time.clone());
                    let lease_duration_secs = existing
                        .spec
                        .as_ref()
                        .and_then(|s| s.lease_duration_seconds)
                        .map(|d| d.max(0) as u64)
                        .unwrap_or(self.config.lease_duration_secs);
                    let expired = match renew_time {
                        Some(MicroTime(renew_time)) => lease_expired(renew_time, lease_duration_secs, Utc::now()),
                        None => true,
                    };
                    if !expired {
                        return Ok(false);
                    }
                    let after = acquired_lease(&existing, &self.config.identity, self.config.lease_duration_secs);
                    self.try_replace(&existing, &after).await
                }
            }
        }
    }

    async fn try_replace(&self, before: &Lease, after: &Lease) -> Result<bool, Error> {
        match self.client.replace_lease(&self.config.lease_name, before, after).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn release(&self) {
        let existing = match self.client.get_lease(&self.config.lease_name).await {
            Ok(Some(l)) => l,
            _ => return,
        };
        let holder = existing.spec.as_ref().and_then(|s| s.holder_identity.clone());
        if holder.as_deref() != Some(self.config.identity.as_str()) {
            return;
        }
        let mut after = existing.clone();
        if let Some(spec) = after.spec.as_mut() {
            spec.holder_identity = None;
        }
        match self.client.replace_lease(&self.config.lease_name, &existing, &after).await {
            Ok(_) => log_info!("🛑 released leadership on shutdown"),
            Err(e) => log_warn!("failed to release lease on shutdown: {e}"),
        }
    }
}

fn new_lease(name: &str, identity: &str, duration_secs: u64) -> Lease {
    let now = MicroTime(Utc::now());
    Lease {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(identity.to_string()),
            acquire_time: Some(now.clone()),
            renew_time: Some(now),
            lease_duration_seconds: Some(duration_secs as i32),
            lease_transitions: Some(0),
            ..Default::default()
        }),
    }
}

fn renewed_lease(existing: &Lease, duration_secs: u64) -> Lease {
    let mut after = existing.clone();
    if let Some(spec) = after.spec.as_mut() {
        spec.renew_time = Some(MicroTime(Utc::now()));
        spec.lease_duration_seconds = Some(duration_secs as i32);
    }
    after
}

fn acquired_lease(existing: &Lease, identity: &str, duration_secs: u64) -> Lease {
    let mut after = existing.clone();
    let transitions = after.spec.as_ref().and_then(|s| s.lease_transitions).unwrap_or(0);
    let now = MicroTime(Utc::now());
    let mut spec = after.spec.clone().unwrap_or_default();
    spec.holder_identity = Some(identity.to_string());
    spec.acquire_time = Some(now.clone());
    spec.renew_time = Some(now);
    spec.lease_duration_seconds = Some(duration_secs as i32);
    spec.lease_transitions = Some(transitions + 1);
    after.spec = Some(spec);
    after
}

/// Whether a Lease's `renew_time` is old enough for another replica to
/// claim it.
pub fn lease_expired(renew_time: DateTime<Utc>, lease_duration_secs: u64, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(renew_time) >= chrono::Duration::seconds(lease_duration_secs as i64)
}

/// Whether a currently-leading replica should keep acting as leader despite
/// a just-failed acquire/renew cycle: true as long as it is still within
/// `renew_deadline` of its last successful renewal.
pub fn holds_despite_failure(now_secs: u64, last_renew_success_secs: Option<u64>, renew_deadline_secs: u64) -> bool {
    match last_renew_success_secs {
        Some(last) => now_secs.saturating_sub(last) < renew_deadline_secs,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_not_yet_expired() {
        let renew = Utc::now();
        let now = renew + chrono::Duration::seconds(5);
        assert!(!lease_expired(renew, 15, now));
    }

    #[test]
    fn lease_expired_after_duration_elapses() {
        let renew = Utc::now();
        let now = renew + chrono::Duration::seconds(16);
        assert!(lease_expired(renew, 15, now));
    }

    #[test]
    fn lease_expired_exactly_at_boundary() {
        let renew = Utc::now();
        let now = renew + chrono::Duration::seconds(15);
        assert!(lease_expired(renew, 15, now));
    }

    #[test]
    fn holds_within_renew_deadline() {
        assert!(holds_despite_failure(105, Some(100), 10));
    }

    #[test]
    fn loses_leadership_past_renew_deadline() {
        assert!(!holds_despite_failure(111, Some(100), 10));
    }

    #[test]
    fn never_holds_without_a_prior_successful_renew() {
        assert!(!holds_despite_failure(100, None, 10));
    }
}
