use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use k8s_openapi::chrono::{self, DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{info, warn};

pub const LEASE_NAME: &str = "kube-rightsizer-leader";
const LEASE_DURATION_SECONDS: i32 = 15;

/// Renewal failures tolerated before the lease counts as permanently lost.
const RENEW_FAILURE_BUDGET: u32 = 5;

/* ============================= COORDINATOR ============================= */

/// Single-writer election backed by a coordination/v1 Lease.
///
/// Exactly one replica holds the lease; only the holder mutates the
/// cluster. Followers keep their caches warm and wait. The process-wide
/// active-writer flag is the only global state the executor path reads.
pub struct LeaseCoordinator {
    client: Client,
    namespace: String,
    identity: String,
    active: Arc<AtomicBool>,
}

impl LeaseCoordinator {
    /// Identity is pod name + UID so restarts never collide with a stale
    /// holder record.
    pub fn new(client: Client, namespace: String, identity: String) -> Self {
        LeaseCoordinator {
            client,
            namespace,
            identity,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle to the active-writer flag; all mutating paths check this.
    pub fn active_flag(&self) -> Arc<AtomicBool> {
        self.active.clone()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn leases(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// A lease spec claiming the lease for us as of now.
    fn fresh_spec(&self) -> LeaseSpec {
        let now = MicroTime(Utc::now());
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
            acquire_time: Some(now.clone()),
            renew_time: Some(now),
            ..Default::default()
        }
    }

    /// One acquisition attempt: read the lease, then either create it,
    /// claim it, or back off while another holder is current.
    pub async fn try_acquire(&self) -> Result<bool> {
        let leases = self.leases();

        let claimed = match leases.get_opt(LEASE_NAME).await? {
            None => self.create_lease(&leases).await?,
            Some(existing) if claimable(&existing, &self.identity, Utc::now()) => {
                self.claim_lease(&leases).await?
            }
            Some(_) => false,
        };

        if claimed {
            self.active.store(true, Ordering::SeqCst);
            info!(identity = %self.identity, "lease_acquired");
        }
        Ok(claimed)
    }

    async fn create_lease(&self, leases: &Api<Lease>) -> Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                ..Default::default()
            },
            spec: Some(self.fresh_spec()),
        };
        match leases.create(&Default::default(), &lease).await {
            Ok(_) => Ok(true),
            // Another replica created it between our read and this write;
            // they hold it for this round.
            Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn claim_lease(&self, leases: &Api<Lease>) -> Result<bool> {
        let patch = serde_json::json!({ "spec": self.fresh_spec() });
        match leases
            .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Block until the lease is ours, rechecking each lease duration.
    /// Returns false when shutdown arrives first.
    pub async fn wait_until_leader(&self, shutdown: &mut broadcast::Receiver<()>) -> Result<bool> {
        loop {
            match self.try_acquire().await {
                Ok(true) => return Ok(true),
                Ok(false) => info!("lease_held_elsewhere_waiting"),
                Err(e) => warn!(error = %e, "lease_acquire_attempt_failed"),
            }
            tokio::select! {
                _ = shutdown.recv() => return Ok(false),
                _ = sleep(Duration::from_secs(LEASE_DURATION_SECONDS as u64)) => {}
            }
        }
    }

    /// Renew at a third of the lease duration. After the failure budget is
    /// exhausted the active flag clears and `lost_tx` fires once; the
    /// process treats that as permanent loss.
    pub async fn renewal_loop(
        &self,
        mut shutdown: broadcast::Receiver<()>,
        lost_tx: broadcast::Sender<()>,
    ) {
        let leases = self.leases();
        let interval = Duration::from_secs((LEASE_DURATION_SECONDS / 3).max(1) as u64);
        let mut consecutive_failures: u32 = 0;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("lease_renewal_stopped");
                    return;
                }
                _ = sleep(interval) => {
                    let now = MicroTime(Utc::now());
                    let patch = serde_json::json!({
                        "spec": {
                            "holderIdentity": self.identity,
                            "renewTime": now
                        }
                    });

                    match leases
                        .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                        .await
                    {
                        Ok(_) => {
                            consecutive_failures = 0;
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            warn!(
                                error = %e,
                                consecutive_failures,
                                "lease_renewal_failed"
                            );
                            if consecutive_failures >= RENEW_FAILURE_BUDGET {
                                self.active.store(false, Ordering::SeqCst);
                                warn!("lease_permanently_lost");
                                let _ = lost_tx.send(());
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Clear the holder on shutdown so the next replica can take over
    /// without waiting for expiry. Best-effort.
    pub async fn release(&self) {
        self.active.store(false, Ordering::SeqCst);

        let patch = serde_json::json!({
            "spec": {
                "holderIdentity": null
            }
        });
        if let Err(e) = self
            .leases()
            .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            warn!(error = %e, "lease_release_failed");
        } else {
            info!("lease_released");
        }
    }
}

/* ============================= CLAIM RULES ============================= */

/// Whether `identity` may take the lease at `now`: it is unheld, already
/// ours, or the holder stopped renewing for longer than the lease
/// duration.
fn claimable(lease: &Lease, identity: &str, now: DateTime<Utc>) -> bool {
    let Some(spec) = &lease.spec else {
        return true;
    };
    match spec.holder_identity.as_deref() {
        None => true,
        Some(holder) if holder == identity => true,
        Some(_) => {
            let ttl = chrono::Duration::seconds(
                spec.lease_duration_seconds.unwrap_or(LEASE_DURATION_SECONDS) as i64,
            );
            spec.renew_time
                .as_ref()
                .is_none_or(|renewed| now.signed_duration_since(renewed.0) > ttl)
        }
    }
}

/* ============================= TESTS ============================= */
